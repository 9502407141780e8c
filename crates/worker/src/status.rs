//! Status worker reply

use crate::config::WorkerConfig;
use crate::pool::PoolState;

/// Crate version reported to the monitoring core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reply to a job on `worker_<identifier>`, with perfdata
pub fn status_text(config: &WorkerConfig, state: &PoolState) -> String {
    let workers = state.worker_count();
    format!(
        "{} has {} worker and is working on {} jobs. Version: {}|worker={};;;{};{} jobs={}c",
        config.identifier,
        workers,
        state.active_workers(),
        VERSION,
        workers,
        config.min_worker,
        config.max_worker,
        state.tasks(),
    )
}
