pub mod api;
pub mod assembler;
pub mod chunker;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod gate;
pub mod jobs;
pub mod logging;
pub mod processor;
pub mod store;
pub mod upstream;
pub mod webhook;

// Re-export commonly used types
pub use api::{AppState, create_router};
pub use config::EngineConfig;
pub use gate::{Gates, GatesConfig, Limiter};
pub use jobs::manager::JobManager;
pub use logging::{LogConfig, LogGuard};
