//! Check execution for the gearcheck worker
//!
//! ```text
//! Request ─▶ Executor ─▶ CommandResolver ─┬─ Shell / Exec ─▶ process (own group)
//!                                         ├─ Epn ──────────▶ EpnSupervisor ─▶ daemon socket
//!                                         └─ Internal ─────▶ CheckRegistry
//!                                                   │
//!            Answer ◀── timeout / negate / bounds ──┘
//! ```

pub mod command;
pub mod config;
pub mod epn;
pub mod error;
pub mod executor;
pub mod internal;
pub mod negate;
pub mod output;
pub mod process;
pub mod tokenizer;

pub use command::{CommandResolver, ExecType, ResolvedCommand};
pub use config::{EpnConfig, ExecConfig};
pub use epn::{EpnDetector, EpnSupervisor};
pub use error::{ExecError, Result};
pub use executor::{Execution, Executor};
pub use internal::{CheckOutcome, CheckRegistry, InternalCheck};
pub use negate::{Negate, Status};
