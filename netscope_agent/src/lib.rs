//! Network telemetry agent library: samplers feeding one snapshot store,
//! with per-session persistence and an optional read-only API.

pub mod api;
pub mod bench;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod latency;
pub mod link;
pub mod metrics;
pub mod persist;
pub mod plot;
pub mod sampler;
pub mod state;
pub mod status;
pub mod types;

pub use config::{EngineConfig, SpeedtestMode};
pub use engine::{Collaborators, Engine};
pub use error::EngineError;
pub use state::{Mutation, SharedStore, SnapshotStore};
pub use types::Snapshot;
