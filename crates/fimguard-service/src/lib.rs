//! fimguard service: watching, reconciliation, automated response and the
//! `Monitor` facade used by the `fimguard` binary.

pub mod engine;
pub mod integrity;
pub mod monitor;
pub mod response;
pub mod status;

pub use engine::verifier::{TamperFinding, VerificationReport};
pub use engine::{CycleOutcome, CycleScope, Engine, StartupOutcome};
pub use monitor::Monitor;
pub use response::controller::MonitorState;
pub use status::MonitorStatus;
