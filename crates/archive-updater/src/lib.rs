//! Keeps derived archive products current.
//!
//! Each station gets an [`UpdateManager`] that turns change notifications into a
//! crash-recoverable backlog of time ranges, and a [`StationsController`] drains
//! those backlogs one write transaction at a time, rotating stations that lose
//! lock contention to the back.

pub mod config;
pub mod controller;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod pending;
pub mod policy;
pub mod rounding;
pub mod state;
pub mod telemetry;

pub use config::UpdaterConfig;
pub use controller::{IdleHook, StationsController, UpdateProgress};
pub use error::{BoxError, UpdaterError, UpdaterResult};
pub use manager::{Station, UpdateManager, UpdateTicket};
pub use pending::{Pending, PendingList, Replaced};
pub use policy::UpdatePolicy;
pub use state::{PersistedState, StateFile, STATE_VERSION};
