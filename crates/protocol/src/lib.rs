//! Wire protocol for the gearcheck worker
//!
//! This crate holds everything that crosses a process boundary:
//!
//! ```text
//! broker ──JOB_ASSIGN──▶ payload ──PayloadCodec::decode_request──▶ Request
//!                                                                   │
//!                                                              (execution)
//!                                                                   ▼
//! broker ◀─SUBMIT_JOB_BG─ payload ◀──PayloadCodec::encode_answer── Answer
//! ```
//!
//! - [`job`]: request and answer records and their `key=value` text form
//! - [`codec`]: base64 with optional AES-256-ECB encryption
//! - [`packet`]: binary packet framing used to talk to the broker
//! - [`admin`]: the plain-text admin status protocol

pub mod admin;
pub mod codec;
pub mod error;
pub mod job;
pub mod packet;

pub use admin::{QueueStatus, ServerStatus, DEFAULT_PORT};
pub use codec::{EncryptionKey, PayloadCodec};
pub use error::{ProtocolError, Result};
pub use job::{escape_newlines, now_epoch, Answer, CheckMode, ExecKind, JobType, Request};
pub use packet::{Packet, PacketType};
