//! Rate and concurrency gating for the upstream APIs.
//!
//! Each gate composes a FIFO counting semaphore (max in-flight) with a
//! token-spread rate limiter (max requests per second). Work is never
//! dropped; excess callers queue on the semaphore in arrival order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// The logical upstream limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limiter {
    Transcription,
    Correction,
    JobSpawn,
    ChunkProcessing,
}

impl Limiter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Limiter::Transcription => "transcription",
            Limiter::Correction => "correction",
            Limiter::JobSpawn => "job_spawn",
            Limiter::ChunkProcessing => "chunk_processing",
        }
    }
}

/// Per-gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub max_concurrent: usize,
    /// `None` disables rate limiting for this gate.
    pub max_rps: Option<u32>,
    /// Spread releases evenly instead of allowing bursts within a window.
    pub uniform_distribution: bool,
}

impl GateConfig {
    pub fn new(max_concurrent: usize, max_rps: Option<u32>) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            max_rps,
            uniform_distribution: true,
        }
    }

    pub fn with_burst(mut self) -> Self {
        self.uniform_distribution = false;
        self
    }
}

enum Pacer {
    /// Minimum spacing between successive releases.
    Uniform { spacing: Duration, next_free: Instant },
    /// Sliding one-second window; bursts up to `max_rps` are allowed.
    Window {
        max_rps: usize,
        releases: VecDeque<Instant>,
    },
}

impl Pacer {
    fn new(max_rps: u32, uniform: bool) -> Self {
        let max_rps = max_rps.max(1);
        if uniform {
            Pacer::Uniform {
                spacing: Duration::from_millis(1_000 / max_rps as u64),
                next_free: Instant::now(),
            }
        } else {
            Pacer::Window {
                max_rps: max_rps as usize,
                releases: VecDeque::with_capacity(max_rps as usize),
            }
        }
    }

    /// Reserves the next release slot and returns the instant to wait for.
    fn reserve(&mut self) -> Instant {
        let now = Instant::now();
        match self {
            Pacer::Uniform { spacing, next_free } => {
                let slot = (*next_free).max(now);
                *next_free = slot + *spacing;
                slot
            }
            Pacer::Window { max_rps, releases } => {
                while let Some(front) = releases.front() {
                    if now.duration_since(*front) >= Duration::from_secs(1) {
                        releases.pop_front();
                    } else {
                        break;
                    }
                }
                let slot = if releases.len() >= *max_rps {
                    *releases.front().expect("window is non-empty") + Duration::from_secs(1)
                } else {
                    now
                };
                releases.push_back(slot);
                slot
            }
        }
    }
}

/// One upstream gate: semaphore plus optional pacer.
pub struct Gate {
    name: &'static str,
    config: GateConfig,
    semaphore: Arc<Semaphore>,
    pacer: Option<Mutex<Pacer>>,
    waiting: AtomicUsize,
    in_use: AtomicUsize,
}

impl Gate {
    pub fn new(name: &'static str, config: GateConfig) -> Self {
        let pacer = config
            .max_rps
            .map(|rps| Mutex::new(Pacer::new(rps, config.uniform_distribution)));
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            pacer,
            config,
            waiting: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Runs `fut` once the rate limiter and the semaphore both admit it.
    /// Never drops work; callers queue in FIFO order.
    pub async fn run<T, F>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let queued_at = Instant::now();
        self.waiting.fetch_add(1, Ordering::SeqCst);

        if let Some(pacer) = &self.pacer {
            let slot = pacer.lock().await.reserve();
            tokio::time::sleep_until(slot).await;
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("gate semaphore is never closed");

        self.waiting.fetch_sub(1, Ordering::SeqCst);
        let in_use = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        let queued_ms = queued_at.elapsed().as_millis() as u64;
        debug!(
            target: "gate",
            gate = self.name,
            waiting = self.waiting.load(Ordering::SeqCst),
            in_use,
            queued_ms,
            "Gate entry"
        );

        let started = Instant::now();
        let out = fut.await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.in_use.fetch_sub(1, Ordering::SeqCst);
        debug!(
            target: "gate",
            gate = self.name,
            waiting = self.waiting.load(Ordering::SeqCst),
            in_use = self.in_use.load(Ordering::SeqCst),
            queued_ms,
            duration_ms,
            "Gate exit"
        );
        out
    }

    /// Point-in-time introspection snapshot.
    pub fn status(&self) -> GateStatus {
        GateStatus {
            name: self.name,
            max_concurrent: self.config.max_concurrent,
            max_rps: self.config.max_rps,
            uniform_distribution: self.config.uniform_distribution,
            waiting: self.waiting.load(Ordering::SeqCst),
            in_use: self.in_use.load(Ordering::SeqCst),
        }
    }
}

/// Snapshot of one gate, surfaced through `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub name: &'static str,
    pub max_concurrent: usize,
    pub max_rps: Option<u32>,
    pub uniform_distribution: bool,
    pub waiting: usize,
    pub in_use: usize,
}

/// Configuration table for all gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub transcription: GateConfig,
    pub correction: GateConfig,
    pub job_spawn: GateConfig,
    pub chunk_processing: GateConfig,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            transcription: GateConfig::new(4, Some(10)),
            correction: GateConfig::new(3, Some(8)),
            job_spawn: GateConfig::new(2, None),
            chunk_processing: GateConfig::new(3, None),
        }
    }
}

/// The process-wide gate set, constructed once at startup.
pub struct Gates {
    transcription: Gate,
    correction: Gate,
    job_spawn: Gate,
    chunk_processing: Gate,
}

impl Gates {
    pub fn new(config: GatesConfig) -> Arc<Self> {
        Arc::new(Self {
            transcription: Gate::new("transcription", config.transcription),
            correction: Gate::new("correction", config.correction),
            job_spawn: Gate::new("job_spawn", config.job_spawn),
            chunk_processing: Gate::new("chunk_processing", config.chunk_processing),
        })
    }

    pub fn get(&self, limiter: Limiter) -> &Gate {
        match limiter {
            Limiter::Transcription => &self.transcription,
            Limiter::Correction => &self.correction,
            Limiter::JobSpawn => &self.job_spawn,
            Limiter::ChunkProcessing => &self.chunk_processing,
        }
    }

    /// Runs `fut` under the named limiter.
    pub async fn run<T, F>(&self, limiter: Limiter, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        self.get(limiter).run(fut).await
    }

    pub fn status(&self) -> Vec<GateStatus> {
        vec![
            self.transcription.status(),
            self.correction.status(),
            self.job_spawn.status(),
            self.chunk_processing.status(),
        ]
    }
}
