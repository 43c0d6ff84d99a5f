//! Resumable multipart upload engine.
//!
//! The [`UploadOrchestrator`] runs any number of upload sessions against a
//! presigned-URL backend: it splits staged sources into parts, keeps a
//! bounded number of transfers in flight, refreshes expiring authorizations
//! in batches, retries transient failures with exponential backoff, and
//! persists enough state for a session to continue after a process restart.
//!
//! Callers talk to the coordinator through commands and watch it through a
//! broadcast event stream; the wire-facing types live in
//! `partway-protocol`, staging in `partway-staging`, and persistence in
//! `partway-resume`.

pub mod authorizer;
pub mod backend;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod speed;

mod pump;
mod session;

pub use authorizer::PartAuthorizer;
pub use backend::{PartTransport, SessionBackend};
pub use config::{AuthorizerConfig, ConcurrencyLimits, EngineConfig, SpeedConfig};
pub use error::UploadError;
pub use orchestrator::UploadOrchestrator;
pub use retry::RetryPolicy;
pub use speed::SpeedEstimator;
