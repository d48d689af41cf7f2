//! Reassembles per-chunk transcripts into one document.
//!
//! Adjacent chunks overlap by a few hundred milliseconds of audio, so the
//! merge drops a token prefix of the right chunk when it repeats the tail
//! of the left one. The same merge over the longest valid run starting at
//! chunk 0 produces the streaming partial transcript.

use crate::gate::{Gates, Limiter};
use crate::jobs::models::{AssemblyMethod, ChunkSlot, ParentJob};
use crate::upstream::{RetryPolicy, TextCorrection, retry};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Longest token overlap searched for between adjacent chunks.
const OVERLAP_WINDOW: usize = 5;

/// Counters describing one assembly run.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyStats {
    pub total_chunks: usize,
    pub successful_chunks: usize,
    pub failed_chunks: usize,
    pub skipped_chunks: usize,
    pub success_rate: u8,
}

/// Result of assembling a parent's transcripts.
#[derive(Debug, Clone, Serialize)]
pub struct AssemblyOutput {
    pub final_transcript: String,
    pub raw_transcript: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_transcript: Option<String>,
    pub method: AssemblyMethod,
    pub stats: AssemblyStats,
    /// Set when a post-process correction pass failed and the final fell
    /// back to the raw transcript.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_error: Option<String>,
}

/// Streaming partial: merged text of the contiguous valid prefix.
#[derive(Debug, Clone, Serialize)]
pub struct PartialTranscript {
    pub text: String,
    /// Index of the last chunk included, if any chunk is.
    pub last_index: Option<usize>,
}

/// Joins `right` onto `merged`, dropping the longest token prefix of
/// `right` whose lowercased form matches a suffix of `merged`.
fn append_with_overlap(merged: &mut Vec<String>, right: &str) {
    let right_tokens: Vec<&str> = right.split_whitespace().collect();
    if right_tokens.is_empty() {
        return;
    }
    let window = OVERLAP_WINDOW.min(merged.len()).min(right_tokens.len());
    let mut drop = 0;
    for k in (1..=window).rev() {
        let tail = &merged[merged.len() - k..];
        let head = &right_tokens[..k];
        let matches = tail
            .iter()
            .zip(head.iter())
            .all(|(a, b)| a.to_lowercase() == b.to_lowercase());
        if matches {
            drop = k;
            break;
        }
    }
    merged.extend(right_tokens[drop..].iter().map(|t| t.to_string()));
}

/// Overlap-aware merge of ordered texts. Whitespace runs collapse to a
/// single space.
pub fn merge_texts<'a, I>(texts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut merged: Vec<String> = Vec::new();
    for text in texts {
        append_with_overlap(&mut merged, text);
    }
    merged.join(" ")
}

/// Longest run of valid chunks starting at index 0, merged. Skipped
/// chunks extend the run but contribute no text.
pub fn contiguous_prefix(transcripts: &[ChunkSlot]) -> PartialTranscript {
    let mut last_index = None;
    let mut texts = Vec::new();
    for (index, slot) in transcripts.iter().enumerate() {
        if !slot.is_valid() {
            break;
        }
        last_index = Some(index);
        if let Some(result) = slot.as_result() {
            if result.has_text() {
                texts.push(result.raw_text.as_str());
            }
        }
    }
    PartialTranscript {
        text: merge_texts(texts),
        last_index,
    }
}

fn method_for(valid_indices: &[usize], total_chunks: usize) -> AssemblyMethod {
    if valid_indices.is_empty() {
        return AssemblyMethod::None;
    }
    if total_chunks == 1 {
        return AssemblyMethod::SingleChunk;
    }
    // A lone survivor of a multi-chunk job is always a gapped assembly,
    // wherever it sits.
    if valid_indices.len() == 1 {
        return AssemblyMethod::IntelligentMergeWithGaps;
    }
    let sequential = valid_indices
        .iter()
        .enumerate()
        .all(|(position, index)| position == *index);
    if sequential {
        AssemblyMethod::IntelligentMergeSequential
    } else {
        AssemblyMethod::IntelligentMergeWithGaps
    }
}

/// Terminal assembler. Holds the correction client for the post-process
/// pass; correction failures degrade to the raw transcript and never fail
/// the job.
pub struct Assembler {
    corrector: Arc<dyn TextCorrection>,
    gates: Arc<Gates>,
    correction_policy: RetryPolicy,
}

impl Assembler {
    pub fn new(
        corrector: Arc<dyn TextCorrection>,
        gates: Arc<Gates>,
        correction_policy: RetryPolicy,
    ) -> Self {
        Self {
            corrector,
            gates,
            correction_policy,
        }
    }

    pub async fn assemble(&self, parent: &ParentJob) -> AssemblyOutput {
        use crate::jobs::models::CorrectionMode;

        // Valid chunks in index order: present, not failed, and either
        // carrying text or explicitly skipped.
        let valid: Vec<(usize, &crate::jobs::models::ChunkResult)> = parent
            .transcripts
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_valid())
            .filter_map(|(index, slot)| slot.as_result().map(|result| (index, result)))
            .collect();
        let valid_indices: Vec<usize> = valid.iter().map(|(index, _)| *index).collect();

        let raw_transcript = merge_texts(
            valid
                .iter()
                .filter(|(_, result)| result.has_text())
                .map(|(_, result)| result.raw_text.as_str()),
        );

        let corrected_transcript = if parent.use_correction
            && parent.correction_mode == CorrectionMode::PerChunk
        {
            Some(merge_texts(valid.iter().filter_map(|(_, result)| {
                result
                    .corrected_text
                    .as_deref()
                    .or_else(|| result.has_text().then_some(result.text.as_str()))
            })))
        } else {
            None
        };

        let mut llm_error = None;
        let final_transcript = match parent.correction_mode {
            CorrectionMode::PostProcess if !raw_transcript.trim().is_empty() => {
                let gates = Arc::clone(&self.gates);
                let corrector = Arc::clone(&self.corrector);
                let model = parent.model.clone();
                let raw = raw_transcript.clone();
                let outcome = retry(self.correction_policy, "post_process_correction", || {
                    let gates = Arc::clone(&gates);
                    let corrector = Arc::clone(&corrector);
                    let model = model.clone();
                    let raw = raw.clone();
                    async move {
                        gates
                            .run(Limiter::Correction, corrector.correct(&raw, model.as_deref()))
                            .await
                    }
                })
                .await;
                match outcome {
                    Ok(corrected) => corrected,
                    Err(err) => {
                        warn!(
                            target: "assembler",
                            parent_id = %parent.id,
                            error = %err,
                            "Post-process correction failed, keeping raw transcript"
                        );
                        llm_error = Some(err.to_string());
                        raw_transcript.clone()
                    }
                }
            }
            CorrectionMode::PerChunk => corrected_transcript
                .clone()
                .unwrap_or_else(|| raw_transcript.clone()),
            _ => raw_transcript.clone(),
        };

        let skipped_chunks = valid.iter().filter(|(_, result)| result.skipped).count();
        let successful_chunks = valid.iter().filter(|(_, result)| result.has_text()).count();
        let failed_chunks = parent.total_chunks - valid.len();
        let attempted = parent.total_chunks - skipped_chunks;
        let success_rate = if attempted == 0 {
            100
        } else {
            ((successful_chunks as f64 / attempted as f64) * 100.0).round() as u8
        };

        let output = AssemblyOutput {
            method: method_for(&valid_indices, parent.total_chunks),
            stats: AssemblyStats {
                total_chunks: parent.total_chunks,
                successful_chunks,
                failed_chunks,
                skipped_chunks,
                success_rate,
            },
            final_transcript,
            raw_transcript,
            corrected_transcript,
            llm_error,
        };
        self.validate(parent, &output);
        output
    }

    /// Post-assembly sanity checks: warnings only, never failures.
    fn validate(&self, parent: &ParentJob, output: &AssemblyOutput) {
        if output.final_transcript.trim().is_empty() {
            warn!(
                target: "assembler",
                parent_id = %parent.id,
                "Assembled transcript is empty"
            );
        }
        if output.stats.success_rate < 50 {
            warn!(
                target: "assembler",
                parent_id = %parent.id,
                success_rate = output.stats.success_rate,
                "More than half of the chunks produced no text"
            );
        }
        let raw_len = output.raw_transcript.len() as f64;
        let final_len = output.final_transcript.len() as f64;
        if raw_len > 0.0 && ((final_len - raw_len).abs() / raw_len) > 0.5 {
            warn!(
                target: "assembler",
                parent_id = %parent.id,
                raw_len = output.raw_transcript.len(),
                final_len = output.final_transcript.len(),
                "Corrected transcript length diverges sharply from raw"
            );
        }
        info!(
            target: "assembler",
            parent_id = %parent.id,
            method = ?output.method,
            successful = output.stats.successful_chunks,
            failed = output.stats.failed_chunks,
            skipped = output.stats.skipped_chunks,
            "Assembly finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::models::{ByteRange, ChunkFailure, ChunkResult};

    fn result_slot(index: usize, text: &str) -> ChunkSlot {
        ChunkSlot::Result(ChunkResult {
            chunk_index: index,
            byte_range: ByteRange::new(0, 1),
            text: text.to_string(),
            raw_text: text.to_string(),
            corrected_text: None,
            segments: Vec::new(),
            processing_time_ms: 1,
            correction_applied: false,
            correction_error: None,
            skipped: false,
            skip_reason: None,
            streamed: false,
        })
    }

    #[test]
    fn merge_drops_repeated_boundary_tokens() {
        let merged = merge_texts(["hello world", "world this is", "is a test"]);
        assert_eq!(merged, "hello world this is a test");
    }

    #[test]
    fn merge_is_case_insensitive_on_overlap() {
        let merged = merge_texts(["We said Hello World", "hello world again"]);
        assert_eq!(merged, "We said Hello World again");
    }

    #[test]
    fn merge_without_overlap_just_joins() {
        let merged = merge_texts(["first part", "second part"]);
        assert_eq!(merged, "first part second part");
    }

    #[test]
    fn merge_collapses_whitespace_runs() {
        let merged = merge_texts(["a  b\n c", "d\te"]);
        assert_eq!(merged, "a b c d e");
    }

    #[test]
    fn merge_overlap_search_is_bounded() {
        // A six-token overlap is invisible to the five-token window, so
        // nothing is dropped.
        let merged = merge_texts(["x a b c d e f", "a b c d e f y"]);
        assert_eq!(merged, "x a b c d e f a b c d e f y");
        // A five-token overlap is found and removed.
        let merged = merge_texts(["x a b c d e", "a b c d e y"]);
        assert_eq!(merged, "x a b c d e y");
    }

    #[test]
    fn contiguous_prefix_stops_at_first_gap() {
        let slots = vec![
            result_slot(0, "one"),
            result_slot(1, "two"),
            ChunkSlot::Empty,
            result_slot(3, "four"),
        ];
        let partial = contiguous_prefix(&slots);
        assert_eq!(partial.text, "one two");
        assert_eq!(partial.last_index, Some(1));
    }

    #[test]
    fn contiguous_prefix_skips_skipped_chunk_text() {
        let slots = vec![
            ChunkSlot::Result(ChunkResult::skipped(0, ByteRange::new(0, 1), "header-only")),
            result_slot(1, "payload"),
        ];
        let partial = contiguous_prefix(&slots);
        assert_eq!(partial.text, "payload");
        assert_eq!(partial.last_index, Some(1));
    }

    #[test]
    fn contiguous_prefix_of_empty_run_has_no_index() {
        let slots = vec![
            ChunkSlot::Failure(ChunkFailure::new(0, "boom")),
            result_slot(1, "late"),
        ];
        let partial = contiguous_prefix(&slots);
        assert_eq!(partial.text, "");
        assert_eq!(partial.last_index, None);
    }

    #[test]
    fn method_labels_follow_valid_set_shape() {
        assert_eq!(method_for(&[], 5), AssemblyMethod::None);
        assert_eq!(method_for(&[0], 1), AssemblyMethod::SingleChunk);
        assert_eq!(
            method_for(&[0, 1, 2], 3),
            AssemblyMethod::IntelligentMergeSequential
        );
        assert_eq!(
            method_for(&[0, 1, 3], 4),
            AssemblyMethod::IntelligentMergeWithGaps
        );
    }

    #[test]
    fn lone_survivor_is_gapped_even_at_index_zero() {
        assert_eq!(
            method_for(&[0], 2),
            AssemblyMethod::IntelligentMergeWithGaps
        );
        assert_eq!(
            method_for(&[2], 4),
            AssemblyMethod::IntelligentMergeWithGaps
        );
    }
}
