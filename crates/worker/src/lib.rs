//! Check worker daemon
//!
//! Pulls check jobs from one or more brokers, runs them through
//! [`gearcheck_exec::Executor`] and sends the results back.
//!
//! - [`config`]: layered `key=value` configuration
//! - [`broker`]: broker connections (TCP and in-memory)
//! - [`worker`]: one subscription loop per worker
//! - [`pool`]: grows and shrinks the worker set
//! - [`dispatch`]: result queue, retries and duplicate brokers
//! - [`codec`]: payload codec shared across reloads
//! - [`status`]: answers for the status queue
//! - [`send`], [`check`]: result submission and monitoring plugin tools

pub mod broker;
pub mod check;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod send;
pub mod status;
pub mod telemetry;
pub mod worker;

pub use broker::{Broker, BrokerError, MemoryBroker, TcpBroker};
pub use codec::SharedCodec;
pub use config::{ConfigError, ConfigLoader, WorkerConfig};
pub use dispatch::ResultDispatcher;
pub use error::{PoolError, Result};
pub use pool::{Control, PoolExit, PoolState, ResourceProbe, SystemProbe, WorkerPool};
pub use telemetry::{init_telemetry, TelemetryConfig};
pub use worker::{Worker, WorkerContext, WorkerRole};
