//! Payload codec shared by workers and result senders
//!
//! Every holder reads the codec per job, so replacing it on reload
//! switches the key for running workers and senders at once.

use std::sync::Arc;

use gearcheck_protocol::PayloadCodec;
use parking_lot::RwLock;

/// Swappable handle to the active [`PayloadCodec`]
#[derive(Clone)]
pub struct SharedCodec {
    inner: Arc<RwLock<PayloadCodec>>,
}

impl std::fmt::Debug for SharedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCodec")
            .field("encrypted", &self.inner.read().is_encrypted())
            .finish()
    }
}

impl SharedCodec {
    pub fn new(codec: PayloadCodec) -> Self {
        Self {
            inner: Arc::new(RwLock::new(codec)),
        }
    }

    /// Snapshot of the current codec
    pub fn current(&self) -> PayloadCodec {
        self.inner.read().clone()
    }

    /// Swap in a new codec for every holder of this handle
    pub fn replace(&self, codec: PayloadCodec) {
        *self.inner.write() = codec;
    }
}

impl From<PayloadCodec> for SharedCodec {
    fn from(codec: PayloadCodec) -> Self {
        Self::new(codec)
    }
}
