//! Embedded interpreter support
//!
//! Eligible scripts are not forked per check. They are handed to a long
//! running interpreter daemon over a unix socket, which keeps compiled
//! scripts cached between runs.

mod detect;
mod supervisor;

pub use detect::EpnDetector;
pub use supervisor::{EpnOutcome, EpnRequest, EpnResponse, EpnSupervisor, RESTART_PATTERNS};
