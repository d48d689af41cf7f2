//! End-to-end engine tests: whole files go in through the coordinator,
//! flow through the queue and processor against scripted upstream mocks,
//! and come out assembled.

use async_trait::async_trait;
use bytes::Bytes;
use chunkscribe::assembler::Assembler;
use chunkscribe::coordinator::{CoordinatorConfig, UploadCoordinator};
use chunkscribe::gate::{Gates, GatesConfig};
use chunkscribe::jobs::manager::JobManager;
use chunkscribe::jobs::models::{
    AssemblyMethod, ChunkSlot, ChunkingMethod, CorrectionMode, JobOptions, ParentJob, ParentStatus,
};
use chunkscribe::jobs::queue::{WorkQueue, WorkQueueConfig};
use chunkscribe::processor::ChunkProcessor;
use chunkscribe::store::{KvStore, MemoryKvStore, MemoryObjectStore, ObjectStore};
use chunkscribe::upstream::{
    RetryPolicy, SpeechToText, TextCorrection, Transcription, UpstreamError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// What the mock transcriber does for one chunk index.
#[derive(Clone)]
enum Script {
    Text(&'static str),
    Empty,
    FailTerminal,
    /// Fails with a retryable error this many times, then succeeds.
    FlakyThenText(Arc<AtomicU32>, u32, &'static str),
    /// Blocks on the semaphore before returning text.
    GateThenText(Arc<Semaphore>, &'static str),
}

struct MockTranscriber {
    scripts: HashMap<usize, Script>,
}

impl MockTranscriber {
    fn new(scripts: HashMap<usize, Script>) -> Arc<Self> {
        Arc::new(Self { scripts })
    }

    fn uniform(texts: &[&'static str]) -> Arc<Self> {
        Self::new(
            texts
                .iter()
                .enumerate()
                .map(|(index, text)| (index, Script::Text(text)))
                .collect(),
        )
    }
}

fn chunk_index_of(filename: &str) -> usize {
    // Storage keys end in chunk.<index>.<ext>.
    filename
        .split('.')
        .nth(1)
        .and_then(|raw| raw.parse().ok())
        .expect("chunk filename carries its index")
}

#[async_trait]
impl SpeechToText for MockTranscriber {
    async fn transcribe(
        &self,
        _audio: Bytes,
        filename: &str,
        _model: Option<&str>,
    ) -> Result<Transcription, UpstreamError> {
        let index = chunk_index_of(filename);
        match self.scripts.get(&index).cloned().unwrap_or(Script::Empty) {
            Script::Text(text) => Ok(Transcription {
                text: text.to_string(),
                segments: vec![serde_json::json!({"start": 0.0, "end": 1.0})],
            }),
            Script::Empty => Ok(Transcription {
                text: String::new(),
                segments: Vec::new(),
            }),
            Script::FailTerminal => Err(UpstreamError::terminal("unsupported audio format")),
            Script::FlakyThenText(counter, failures, text) => {
                if counter.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(UpstreamError::retryable("transient upstream hiccup"))
                } else {
                    Ok(Transcription {
                        text: text.to_string(),
                        segments: Vec::new(),
                    })
                }
            }
            Script::GateThenText(semaphore, text) => {
                let _permit = semaphore.acquire().await.expect("gate semaphore open");
                Ok(Transcription {
                    text: text.to_string(),
                    segments: Vec::new(),
                })
            }
        }
    }
}

/// Mock corrector: uppercases, replays a fixed answer, or always fails.
enum CorrectorMode {
    Fixed(&'static str),
    Uppercase,
    AlwaysDown,
}

struct MockCorrector {
    mode: CorrectorMode,
    calls: AtomicU32,
}

impl MockCorrector {
    fn new(mode: CorrectorMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TextCorrection for MockCorrector {
    async fn correct(&self, text: &str, _model: Option<&str>) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            CorrectorMode::Fixed(answer) => Ok(answer.to_string()),
            CorrectorMode::Uppercase => Ok(text.to_uppercase()),
            CorrectorMode::AlwaysDown => Err(UpstreamError::terminal("correction service down")),
        }
    }
}

struct Engine {
    manager: Arc<JobManager>,
    coordinator: UploadCoordinator,
    objects: Arc<MemoryObjectStore>,
}

fn engine(transcriber: Arc<dyn SpeechToText>, corrector: Arc<dyn TextCorrection>) -> Engine {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let object_store: Arc<dyn ObjectStore> = objects.clone();
    let gates = Gates::new(GatesConfig::default());
    let http = reqwest::Client::new();

    let manager = JobManager::new(kv, object_store.clone(), Duration::from_secs(3600));
    let processor = Arc::new(ChunkProcessor::new(
        Arc::clone(&manager),
        object_store.clone(),
        transcriber,
        corrector.clone(),
        Arc::clone(&gates),
    ));
    let assembler = Arc::new(Assembler::new(
        corrector,
        Arc::clone(&gates),
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            max_retries: 1,
        },
    ));
    let queue = WorkQueue::new(
        Arc::clone(&manager),
        processor,
        assembler,
        Arc::clone(&gates),
        http.clone(),
        WorkQueueConfig { max_concurrent: 4 },
    );
    let coordinator = UploadCoordinator::new(
        Arc::clone(&manager),
        object_store,
        queue,
        gates,
        http,
        CoordinatorConfig::default(),
    );
    Engine {
        manager,
        coordinator,
        objects,
    }
}

/// One-megabyte chunks keep fixtures small; `chunks` of payload produce
/// exactly that many byte-split chunks.
fn payload(chunks: usize) -> Bytes {
    Bytes::from(vec![0x55u8; chunks * 1024 * 1024])
}

fn options() -> JobOptions {
    JobOptions {
        chunk_size_mb: 1,
        ..JobOptions::default()
    }
}

async fn wait_terminal(manager: &JobManager, parent_id: &str) -> ParentJob {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let parent = manager.get_parent(parent_id).await.expect("parent exists");
            if parent.is_terminal() {
                return parent;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job reaches a terminal state")
}

#[tokio::test]
async fn three_chunk_happy_path_merges_overlap() {
    let transcriber = MockTranscriber::uniform(&["hello world", "world this is", "is a test"]);
    let engine = engine(transcriber, MockCorrector::new(CorrectorMode::Uppercase));

    let receipt = engine
        .coordinator
        .ingest_bytes("talk.m4a", payload(3), options())
        .await
        .unwrap();
    assert_eq!(receipt.total_chunks, 3);
    assert_eq!(receipt.chunking_method, ChunkingMethod::ByteRange);
    assert_eq!(
        receipt.stream_url,
        format!("/chunked-stream/{}", receipt.parent_job_id)
    );

    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;
    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(
        parent.final_transcript.as_deref(),
        Some("hello world this is a test")
    );
    assert_eq!(
        parent.assembly_method,
        Some(AssemblyMethod::IntelligentMergeSequential)
    );
    assert_eq!(parent.success_rate, 100);
    assert_eq!(parent.progress, 100);
    assert_eq!(parent.completed_count, 3);

    // Finalization garbage-collects sub-jobs and chunk bytes.
    assert!(parent.is_terminal());
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = engine
                .manager
                .get_parent(&receipt.parent_job_id)
                .await
                .unwrap();
            if snapshot.sub_jobs.is_empty() && engine.objects.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("sub-jobs and chunk bytes are collected");
}

#[tokio::test]
async fn small_file_is_a_single_chunk_job() {
    let transcriber = MockTranscriber::uniform(&["just one piece"]);
    let engine = engine(transcriber, MockCorrector::new(CorrectorMode::Uppercase));

    let receipt = engine
        .coordinator
        .ingest_bytes("tiny.mp3", Bytes::from(vec![1u8; 1024]), options())
        .await
        .unwrap();
    assert_eq!(receipt.total_chunks, 1);
    assert_eq!(receipt.chunking_method, ChunkingMethod::SingleChunk);

    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;
    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(parent.assembly_method, Some(AssemblyMethod::SingleChunk));
    assert_eq!(parent.final_transcript.as_deref(), Some("just one piece"));
}

#[tokio::test]
async fn header_only_first_chunk_is_skipped_not_failed() {
    let mut scripts = HashMap::new();
    scripts.insert(0, Script::Empty);
    scripts.insert(1, Script::Text("a"));
    scripts.insert(2, Script::Text("b"));
    scripts.insert(3, Script::Text("c"));
    scripts.insert(4, Script::Text("d"));
    let engine = engine(
        MockTranscriber::new(scripts),
        MockCorrector::new(CorrectorMode::Uppercase),
    );

    let receipt = engine
        .coordinator
        .ingest_bytes("talk.m4a", payload(5), options())
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(parent.final_transcript.as_deref(), Some("a b c d"));
    assert_eq!(parent.skipped_count(), 1);
    assert_eq!(parent.failed_count, 0);
    assert_eq!(parent.completed_count, 5);
    assert_eq!(parent.success_rate, 100);
    let skipped = parent.transcripts[0].as_result().expect("slot holds result");
    assert!(skipped.skipped);
    assert_eq!(skipped.skip_reason.as_deref(), Some("header-only"));
}

#[tokio::test]
async fn one_hard_failure_still_completes_with_gaps() {
    let texts = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", "t8", "t9"];
    let mut scripts: HashMap<usize, Script> = texts
        .iter()
        .enumerate()
        .map(|(index, text)| (index, Script::Text(text)))
        .collect();
    scripts.insert(7, Script::FailTerminal);
    let engine = engine(
        MockTranscriber::new(scripts),
        MockCorrector::new(CorrectorMode::Uppercase),
    );

    let receipt = engine
        .coordinator
        .ingest_bytes("long.m4a", payload(10), options())
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(parent.success_rate, 90);
    assert_eq!(
        parent.assembly_method,
        Some(AssemblyMethod::IntelligentMergeWithGaps)
    );
    assert!(matches!(parent.transcripts[7], ChunkSlot::Failure(_)));
    assert_eq!(
        parent.final_transcript.as_deref(),
        Some("t0 t1 t2 t3 t4 t5 t6 t8 t9")
    );
}

#[tokio::test]
async fn a_single_surviving_chunk_still_completes() {
    let mut scripts: HashMap<usize, Script> =
        (0..4).map(|index| (index, Script::FailTerminal)).collect();
    scripts.insert(2, Script::Text("the only survivor"));
    let engine = engine(
        MockTranscriber::new(scripts),
        MockCorrector::new(CorrectorMode::Uppercase),
    );

    let receipt = engine
        .coordinator
        .ingest_bytes("mostly-broken.m4a", payload(4), options())
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(
        parent.assembly_method,
        Some(AssemblyMethod::IntelligentMergeWithGaps)
    );
    assert_eq!(parent.final_transcript.as_deref(), Some("the only survivor"));
    assert_eq!(parent.success_rate, 25);
}

#[tokio::test]
async fn a_sole_survivor_at_index_zero_is_still_a_gapped_assembly() {
    let mut scripts: HashMap<usize, Script> =
        (0..3).map(|index| (index, Script::FailTerminal)).collect();
    scripts.insert(0, Script::Text("opening words"));
    let engine = engine(
        MockTranscriber::new(scripts),
        MockCorrector::new(CorrectorMode::Uppercase),
    );

    let receipt = engine
        .coordinator
        .ingest_bytes("tail-broken.m4a", payload(3), options())
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(
        parent.assembly_method,
        Some(AssemblyMethod::IntelligentMergeWithGaps)
    );
    assert_eq!(parent.final_transcript.as_deref(), Some("opening words"));
}

#[tokio::test]
async fn all_chunks_failing_fails_the_parent() {
    let scripts: HashMap<usize, Script> =
        (0..3).map(|index| (index, Script::FailTerminal)).collect();
    let engine = engine(
        MockTranscriber::new(scripts),
        MockCorrector::new(CorrectorMode::Uppercase),
    );

    let receipt = engine
        .coordinator
        .ingest_bytes("broken.m4a", payload(3), options())
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Failed);
    assert_eq!(parent.success_rate, 0);
    assert_eq!(parent.failed_count, 3);
}

#[tokio::test]
async fn post_process_correction_rewrites_the_concatenation() {
    let transcriber = MockTranscriber::uniform(&["helo world", "this is test"]);
    let corrector = MockCorrector::new(CorrectorMode::Fixed("Hello world, this is a test."));
    let engine = engine(transcriber, corrector.clone());

    let receipt = engine
        .coordinator
        .ingest_bytes(
            "talk.m4a",
            payload(2),
            JobOptions {
                chunk_size_mb: 1,
                use_llm: true,
                llm_mode: CorrectionMode::PostProcess,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(
        parent.final_transcript.as_deref(),
        Some("Hello world, this is a test.")
    );
    assert_eq!(
        parent.raw_transcript.as_deref(),
        Some("helo world this is test")
    );
    // Per-chunk correction was off: exactly one whole-transcript call.
    assert_eq!(corrector.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn per_chunk_correction_outage_falls_back_to_raw() {
    let transcriber = MockTranscriber::uniform(&["some words worth fixing", "and a second chunk"]);
    let engine = engine(transcriber, MockCorrector::new(CorrectorMode::AlwaysDown));

    let receipt = engine
        .coordinator
        .ingest_bytes(
            "talk.m4a",
            payload(2),
            JobOptions {
                chunk_size_mb: 1,
                use_llm: true,
                llm_mode: CorrectionMode::PerChunk,
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Done);
    for slot in &parent.transcripts {
        let result = slot.as_result().expect("all chunks completed");
        assert!(!result.correction_applied);
        assert!(result.correction_error.is_some());
    }
    assert_eq!(
        parent.final_transcript.as_deref(),
        parent.raw_transcript.as_deref()
    );
}

#[tokio::test]
async fn transient_upstream_failure_recovers_in_the_envelope() {
    let mut scripts = HashMap::new();
    scripts.insert(
        0,
        Script::FlakyThenText(Arc::new(AtomicU32::new(0)), 1, "recovered text"),
    );
    let engine = engine(
        MockTranscriber::new(scripts),
        MockCorrector::new(CorrectorMode::Uppercase),
    );

    let receipt = engine
        .coordinator
        .ingest_bytes("talk.mp3", Bytes::from(vec![9u8; 2048]), options())
        .await
        .unwrap();
    let parent = wait_terminal(&engine.manager, &receipt.parent_job_id).await;

    assert_eq!(parent.status, ParentStatus::Done);
    assert_eq!(parent.final_transcript.as_deref(), Some("recovered text"));
}

#[tokio::test]
async fn cancel_midway_freezes_counters_and_drops_late_results() {
    let gate = Arc::new(Semaphore::new(0));
    let mut scripts = HashMap::new();
    scripts.insert(0, Script::Text("t0"));
    scripts.insert(1, Script::Text("t1"));
    scripts.insert(2, Script::Text("t2"));
    scripts.insert(3, Script::GateThenText(gate.clone(), "t3"));
    scripts.insert(4, Script::GateThenText(gate.clone(), "t4"));
    let engine = engine(
        MockTranscriber::new(scripts),
        MockCorrector::new(CorrectorMode::Uppercase),
    );

    let receipt = engine
        .coordinator
        .ingest_bytes("talk.m4a", payload(5), options())
        .await
        .unwrap();

    // Wait until the three unblocked chunks have landed.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let parent = engine
                .manager
                .get_parent(&receipt.parent_job_id)
                .await
                .unwrap();
            if parent.completed_count >= 3 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("first three chunks complete");

    let cancelled = engine
        .manager
        .cancel_parent(&receipt.parent_job_id, "user clicked stop")
        .await
        .unwrap();
    assert_eq!(cancelled.status, ParentStatus::Cancelled);
    assert_eq!(cancelled.completed_count, 3);

    // Release the in-flight chunks; their completions must be refused.
    gate.add_permits(8);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let parent = engine
        .manager
        .get_parent(&receipt.parent_job_id)
        .await
        .unwrap();
    assert_eq!(parent.status, ParentStatus::Cancelled);
    assert_eq!(parent.completed_count, 3);
    assert!(parent.transcripts[3].is_empty());
    assert!(parent.transcripts[4].is_empty());

    let partial = chunkscribe::assembler::contiguous_prefix(&parent.transcripts);
    assert_eq!(partial.text, "t0 t1 t2");
    assert_eq!(partial.last_index, Some(2));
}
