//! Orchestration core: the problem store, health watchdog, change notifier,
//! and the scheduler that drives them.

pub mod health;
pub mod notify;
pub mod orchestrator;
pub mod store;

pub use self::health::{HealthStats, HealthWatchdog};
pub use self::notify::ChangeNotifier;
pub use self::orchestrator::{Orchestrator, OrchestratorConfig};
pub use self::store::{MergeOutcome, ProblemStore};
