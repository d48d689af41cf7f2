//! Upstream API boundary: the speech-to-text and text-correction services
//! behind trait seams, the failure taxonomy, and the retry envelope.

mod correction;
mod error;
mod retry;
mod transcription;

pub use correction::{HttpTextCorrection, TextCorrection};
pub use error::{UpstreamError, status_is_retryable};
pub use retry::{RetryPolicy, retry};
pub use transcription::{HttpSpeechToText, SpeechToText, Transcription};
