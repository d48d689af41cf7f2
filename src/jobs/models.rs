use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ParentId = String;
pub type SubJobId = String;

/// Fixed-width bitset used for per-chunk upload/completion accounting.
///
/// The flags are the source of truth for idempotent counting: the first
/// observation of a chunk sets its bit and moves the counters, later
/// observations see the bit and leave the counters alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Sets bit `index`; returns true iff the bit was previously clear.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / 64];
        let mask = 1u64 << (index % 64);
        let was_clear = *word & mask == 0;
        *word |= mask;
        was_clear
    }

    /// Clears bit `index`; returns true iff the bit was previously set.
    pub fn clear(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / 64];
        let mask = 1u64 << (index % 64);
        let was_set = *word & mask != 0;
        *word &= !mask;
        was_set
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Parent job lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParentStatus {
    Uploading,
    Processing,
    Assembling,
    Done,
    Failed,
    Cancelled,
}

impl ParentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParentStatus::Uploading => "uploading",
            ParentStatus::Processing => "processing",
            ParentStatus::Assembling => "assembling",
            ParentStatus::Done => "done",
            ParentStatus::Failed => "failed",
            ParentStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "uploading" => Some(ParentStatus::Uploading),
            "processing" => Some(ParentStatus::Processing),
            "assembling" => Some(ParentStatus::Assembling),
            "done" => Some(ParentStatus::Done),
            "failed" => Some(ParentStatus::Failed),
            "cancelled" => Some(ParentStatus::Cancelled),
            _ => None,
        }
    }

    /// Counters and result fields are frozen in terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ParentStatus::Done | ParentStatus::Failed | ParentStatus::Cancelled
        )
    }
}

/// Sub-job lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubJobStatus {
    Pending,
    Uploaded,
    Processing,
    Done,
    Failed,
}

/// When and how the correction API rewrites transcript text.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    #[default]
    None,
    PerChunk,
    PostProcess,
}

impl CorrectionMode {
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "none" => Some(CorrectionMode::None),
            "per_chunk" => Some(CorrectionMode::PerChunk),
            "post_process" => Some(CorrectionMode::PostProcess),
            _ => None,
        }
    }
}

/// How the input bytes were split into chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingMethod {
    SingleChunk,
    ByteRange,
    WavFrames,
    Mp3Frames,
}

/// Label describing how the final transcript was put together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyMethod {
    None,
    SingleChunk,
    IntelligentMergeSequential,
    IntelligentMergeWithGaps,
}

/// Half-open `[start, end)` byte range of a chunk within the source file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Finished transcription of one chunk, stored in the parent's slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub byte_range: ByteRange,
    /// Final text for this chunk (post per-chunk correction when enabled).
    pub text: String,
    pub raw_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_text: Option<String>,
    /// Opaque token spans as returned by the transcription API.
    #[serde(default)]
    pub segments: Vec<serde_json::Value>,
    pub processing_time_ms: u64,
    pub correction_applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction_error: Option<String>,
    #[serde(default)]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Set once the SSE emitter has published this chunk, so reconnects
    /// never replay it.
    #[serde(default)]
    pub streamed: bool,
}

impl ChunkResult {
    pub fn skipped(chunk_index: usize, byte_range: ByteRange, reason: &str) -> Self {
        Self {
            chunk_index,
            byte_range,
            text: String::new(),
            raw_text: String::new(),
            corrected_text: None,
            segments: Vec::new(),
            processing_time_ms: 0,
            correction_applied: false,
            correction_error: None,
            skipped: true,
            skip_reason: Some(reason.to_string()),
            streamed: false,
        }
    }

    /// A result contributes text to assembly unless it was skipped.
    pub fn has_text(&self) -> bool {
        !self.skipped && !self.text.trim().is_empty()
    }
}

/// Permanent failure record for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    pub error: String,
    pub failed: bool,
    #[serde(default)]
    pub streamed: bool,
}

impl ChunkFailure {
    pub fn new(chunk_index: usize, error: impl Into<String>) -> Self {
        Self {
            chunk_index,
            error: error.into(),
            failed: true,
            streamed: false,
        }
    }
}

/// One slot of the parent's `transcripts` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkSlot {
    Empty,
    Result(ChunkResult),
    Failure(ChunkFailure),
}

impl ChunkSlot {
    pub fn is_empty(&self) -> bool {
        matches!(self, ChunkSlot::Empty)
    }

    /// Valid for assembly: a result that either carries text or was
    /// explicitly skipped.
    pub fn is_valid(&self) -> bool {
        match self {
            ChunkSlot::Result(r) => r.has_text() || r.skipped,
            _ => false,
        }
    }

    pub fn as_result(&self) -> Option<&ChunkResult> {
        match self {
            ChunkSlot::Result(r) => Some(r),
            _ => None,
        }
    }

    pub fn streamed(&self) -> bool {
        match self {
            ChunkSlot::Empty => true,
            ChunkSlot::Result(r) => r.streamed,
            ChunkSlot::Failure(f) => f.streamed,
        }
    }

    pub fn set_streamed(&mut self) {
        match self {
            ChunkSlot::Empty => {}
            ChunkSlot::Result(r) => r.streamed = true,
            ChunkSlot::Failure(f) => f.streamed = true,
        }
    }
}

/// Options recognised at job creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub chunk_size_mb: u64,
    pub use_llm: bool,
    pub llm_mode: CorrectionMode,
    pub model: Option<String>,
    pub webhook_url: Option<String>,
    pub debug_save_chunks: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            chunk_size_mb: 10,
            use_llm: false,
            llm_mode: CorrectionMode::PerChunk,
            model: None,
            webhook_url: None,
            debug_save_chunks: false,
        }
    }
}

impl JobOptions {
    pub fn target_chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb.max(1) * 1024 * 1024
    }

    /// Effective correction mode: `use_llm == false` forces `None`.
    pub fn correction_mode(&self) -> CorrectionMode {
        if self.use_llm {
            self.llm_mode
        } else {
            CorrectionMode::None
        }
    }
}

/// Authoritative record of one user-facing transcription job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentJob {
    pub id: ParentId,
    pub filename: String,
    pub total_size_bytes: u64,
    pub target_chunk_size_bytes: u64,
    pub total_chunks: usize,
    pub status: ParentStatus,
    pub chunking_method: ChunkingMethod,
    pub uploaded_flags: BitSet,
    pub completed_flags: BitSet,
    pub uploaded_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub transcripts: Vec<ChunkSlot>,
    /// Ids of owned sub-jobs; cleared by GC after finalization.
    pub sub_jobs: Vec<SubJobId>,
    pub progress: u8,
    pub upload_progress: u8,
    pub processing_progress: u8,
    pub use_correction: bool,
    pub correction_mode: CorrectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub debug_save_chunks: bool,
    pub created_at: DateTime<Utc>,
    pub upload_started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_chunk_completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_transcript: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembly_method: Option<AssemblyMethod>,
    pub success_rate: u8,
    /// Failure or cancellation reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when a post-process correction pass failed and final fell
    /// back to the raw transcript.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_error: Option<String>,
}

impl ParentJob {
    pub fn new(
        filename: impl Into<String>,
        total_size_bytes: u64,
        target_chunk_size_bytes: u64,
        total_chunks: usize,
        chunking_method: ChunkingMethod,
        options: &JobOptions,
    ) -> Self {
        let total_chunks = total_chunks.max(1);
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            filename: filename.into(),
            total_size_bytes,
            target_chunk_size_bytes,
            total_chunks,
            status: ParentStatus::Uploading,
            chunking_method,
            uploaded_flags: BitSet::new(total_chunks),
            completed_flags: BitSet::new(total_chunks),
            uploaded_count: 0,
            completed_count: 0,
            failed_count: 0,
            transcripts: vec![ChunkSlot::Empty; total_chunks],
            sub_jobs: Vec::with_capacity(total_chunks),
            progress: 0,
            upload_progress: 0,
            processing_progress: 0,
            use_correction: options.use_llm,
            correction_mode: options.correction_mode(),
            model: options.model.clone(),
            webhook_url: options.webhook_url.clone(),
            debug_save_chunks: options.debug_save_chunks,
            created_at: now,
            upload_started_at: now,
            first_chunk_completed_at: None,
            processing_started_at: None,
            assembly_started_at: None,
            completed_at: None,
            final_transcript: None,
            raw_transcript: None,
            corrected_transcript: None,
            assembly_method: None,
            success_rate: 0,
            error: None,
            llm_error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// All chunks accounted for, one way or the other.
    pub fn all_chunks_settled(&self) -> bool {
        self.completed_count + self.failed_count == self.total_chunks
    }

    /// Recomputes the progress percentages from the counters. Progress is
    /// monotone across writes, so each value only ever ratchets up.
    pub fn recompute_progress(&mut self) {
        let total = self.total_chunks.max(1) as f64;
        let upload = ((self.uploaded_count as f64 / total) * 100.0).round() as u8;
        let settled = (self.completed_count + self.failed_count) as f64;
        let processing = ((settled / total) * 100.0).round() as u8;
        self.upload_progress = self.upload_progress.max(upload.min(100));
        self.processing_progress = self.processing_progress.max(processing.min(100));
        let overall =
            ((self.upload_progress as u16 + self.processing_progress as u16) / 2).min(100) as u8;
        self.progress = self.progress.max(overall);
    }

    /// Percent of attempted (non-skipped) chunks that yielded text.
    pub fn recompute_success_rate(&mut self) {
        let skipped = self
            .transcripts
            .iter()
            .filter(|slot| slot.as_result().map(|r| r.skipped).unwrap_or(false))
            .count();
        let attempted = self.total_chunks.saturating_sub(skipped);
        if attempted == 0 {
            self.success_rate = 100;
            return;
        }
        let successful = self.completed_count.saturating_sub(skipped);
        self.success_rate = ((successful as f64 / attempted as f64) * 100.0).round() as u8;
    }

    /// Number of chunks that were skipped (header-only etc.).
    pub fn skipped_count(&self) -> usize {
        self.transcripts
            .iter()
            .filter(|slot| slot.as_result().map(|r| r.skipped).unwrap_or(false))
            .count()
    }

    /// Lightweight listing view without inline transcripts.
    pub fn summary(&self) -> ParentJobSummary {
        ParentJobSummary {
            id: self.id.clone(),
            filename: self.filename.clone(),
            status: self.status,
            total_size_bytes: self.total_size_bytes,
            total_chunks: self.total_chunks,
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            progress: self.progress,
            success_rate: self.success_rate,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Listing view of a parent job, safe to return in bulk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentJobSummary {
    pub id: ParentId,
    pub filename: String,
    pub status: ParentStatus,
    pub total_size_bytes: u64,
    pub total_chunks: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub progress: u8,
    pub success_rate: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One chunk's processing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubJob {
    pub id: SubJobId,
    pub parent_id: ParentId,
    pub chunk_index: usize,
    pub byte_range: ByteRange,
    pub storage_key: String,
    pub status: SubJobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubJob {
    pub fn new(
        parent_id: ParentId,
        chunk_index: usize,
        byte_range: ByteRange,
        storage_key: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            chunk_index,
            byte_range,
            storage_key,
            status: SubJobStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            error: None,
            created_at: Utc::now(),
            uploaded_at: None,
            processing_started_at: None,
            completed_at: None,
        }
    }

    /// Processing may start only from `Uploaded` or a rearmed `Failed`.
    pub fn can_process(&self) -> bool {
        matches!(self.status, SubJobStatus::Uploaded | SubJobStatus::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitset_set_is_idempotent() {
        let mut bits = BitSet::new(10);
        assert!(bits.set(3));
        assert!(!bits.set(3));
        assert!(bits.get(3));
        assert_eq!(bits.count_ones(), 1);
    }

    #[test]
    fn bitset_spans_word_boundaries() {
        let mut bits = BitSet::new(130);
        assert!(bits.set(0));
        assert!(bits.set(63));
        assert!(bits.set(64));
        assert!(bits.set(129));
        assert!(!bits.set(130));
        assert_eq!(bits.count_ones(), 4);
        assert!(bits.clear(64));
        assert!(!bits.clear(64));
        assert_eq!(bits.count_ones(), 3);
    }

    #[test]
    fn bitset_survives_serde() {
        let mut bits = BitSet::new(70);
        bits.set(1);
        bits.set(69);
        let json = serde_json::to_string(&bits).unwrap();
        let back: BitSet = serde_json::from_str(&json).unwrap();
        assert_eq!(bits, back);
    }

    #[test]
    fn progress_is_monotone() {
        let options = JobOptions::default();
        let mut job = ParentJob::new("a.mp3", 100, 10, 10, ChunkingMethod::ByteRange, &options);
        job.uploaded_count = 5;
        job.recompute_progress();
        assert_eq!(job.upload_progress, 50);
        let before = job.progress;
        // A stale recompute with lower counters must not move anything back.
        job.uploaded_count = 3;
        job.recompute_progress();
        assert_eq!(job.upload_progress, 50);
        assert!(job.progress >= before);
    }

    #[test]
    fn success_rate_ignores_skipped_chunks() {
        let options = JobOptions::default();
        let mut job = ParentJob::new("a.mp3", 100, 20, 5, ChunkingMethod::ByteRange, &options);
        job.transcripts[0] = ChunkSlot::Result(ChunkResult::skipped(
            0,
            ByteRange::new(0, 20),
            "header-only",
        ));
        job.completed_count = 5;
        job.recompute_success_rate();
        assert_eq!(job.success_rate, 100);
        assert_eq!(job.skipped_count(), 1);
    }

    #[test]
    fn use_llm_false_forces_correction_off() {
        let options = JobOptions {
            use_llm: false,
            llm_mode: CorrectionMode::PostProcess,
            ..JobOptions::default()
        };
        assert_eq!(options.correction_mode(), CorrectionMode::None);
    }
}
