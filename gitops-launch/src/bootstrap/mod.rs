//! Launch core: checkpointed state, readiness polling, scoped tunnels,
//! sync retries and the phase plan the orchestrator runs.

pub mod collaborators;
pub mod phases;
pub mod plan;
pub mod poller;
pub mod preflight;
pub mod report;
pub mod state;
pub mod sync;
pub mod tunnel;

pub use collaborators::Collaborators;
pub use phases::bootstrap_plan;
pub use plan::{Condition, Phase, Plan, Step, Tracker};
pub use poller::{Backoff, PollOutcome, RetryPolicy, poll, try_poll};
pub use preflight::{PreflightReport, run_preflight};
pub use report::{LaunchReport, print_report};
pub use state::{FileStateStore, MemoryStateStore, RunFlags, StateStore, keys};
pub use sync::{SyncResult, sync_until_ready};
pub use tunnel::{TunnelHandle, TunnelManager};
