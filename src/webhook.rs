//! Best-effort terminal webhook notification. Delivery is at-least-once
//! with no in-band retry; receivers dedupe by `parent_job_id`.

use crate::assembler::AssemblyOutput;
use crate::jobs::models::ParentJob;
use serde_json::{Value, json};
use tracing::{info, warn};

/// Payload mirroring the SSE `final_result` event.
pub fn final_result_payload(parent: &ParentJob, output: &AssemblyOutput) -> Value {
    json!({
        "type": "final_result",
        "parent_job_id": parent.id,
        "filename": parent.filename,
        "status": parent.status,
        "final_transcript": output.final_transcript,
        "raw_transcript": output.raw_transcript,
        "corrected_transcript": output.corrected_transcript,
        "assembly_method": output.method,
        "stats": output.stats,
        "completed_at": parent.completed_at,
    })
}

/// Fires the webhook once; failures are logged, never retried.
pub async fn deliver(client: &reqwest::Client, url: &str, payload: &Value) {
    match client.post(url).json(payload).send().await {
        Ok(response) if response.status().is_success() => {
            info!(
                target: "webhook",
                url = %url,
                status = response.status().as_u16(),
                "Webhook delivered"
            );
        }
        Ok(response) => {
            warn!(
                target: "webhook",
                url = %url,
                status = response.status().as_u16(),
                "Webhook endpoint returned an error"
            );
        }
        Err(err) => {
            warn!(
                target: "webhook",
                url = %url,
                error = %err,
                "Webhook delivery failed"
            );
        }
    }
}
