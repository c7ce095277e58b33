//! Write log used while ownership is moving.
//!
//! While a rehash runs, the joining member receives writes for keys whose
//! state it has not pulled yet. Those writes are buffered here and replayed,
//! in arrival order, once the transferred state has been applied.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

#[cfg(feature = "derive")]
use serde::{Deserialize, Serialize};

use crate::error::RehashError;
use crate::store::WriteCommand;

/// Writes that arrived together and are replayed together.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "derive", derive(Serialize, Deserialize))]
pub struct LoggedTransaction {
    pub tx_id: Option<u64>,
    pub writes: Vec<WriteCommand>,
}

impl LoggedTransaction {
    pub fn new(tx_id: Option<u64>, writes: Vec<WriteCommand>) -> Self {
        LoggedTransaction { tx_id, writes }
    }

    /// A transaction made of one write and no id.
    pub fn single(write: WriteCommand) -> Self {
        LoggedTransaction::new(None, vec![write])
    }

    /// Copy of this transaction sharing the id, with its own write list.
    pub fn with_writes(&self, writes: Vec<WriteCommand>) -> Self {
        LoggedTransaction::new(self.tx_id, writes)
    }

    pub fn touches(&self, key: &str) -> bool {
        self.writes.iter().any(|write| write.key() == key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LoggerState {
    #[default]
    Disabled,
    Enabled,
    Draining,
}

#[derive(Debug, Default)]
struct Inner {
    state: LoggerState,
    buffer: VecDeque<LoggedTransaction>,
}

/// Buffers writes during a rehash.
///
/// Moves through `Disabled -> Enabled -> Draining -> Disabled`. Logging and
/// disabling take the same lock, so a write either lands in the buffer
/// before the final drain or is rejected and applied directly.
#[derive(Debug, Default)]
pub struct TransactionLogger {
    inner: Mutex<Inner>,
}

impl TransactionLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoggerState {
        self.inner.lock().state
    }

    /// Start logging. Only a disabled logger can be enabled, which keeps a
    /// node to one rehash at a time.
    pub fn enable(&self) -> Result<(), RehashError> {
        let mut inner = self.inner.lock();

        if inner.state != LoggerState::Disabled {
            warn!(state = ?inner.state, "refusing to enable a busy transaction logger");
            return Err(RehashError::AlreadyInProgress);
        }

        inner.state = LoggerState::Enabled;
        debug!("transaction logger enabled");
        Ok(())
    }

    /// Buffer `tx` if the logger is active.
    ///
    /// Returns `false` when the logger is disabled, in which case the caller
    /// applies the write itself.
    pub fn log_if_enabled(&self, tx: LoggedTransaction) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            LoggerState::Disabled => false,
            LoggerState::Enabled | LoggerState::Draining => {
                trace!(tx_id = ?tx.tx_id, writes = tx.writes.len(), "logged transaction");
                inner.buffer.push_back(tx);
                true
            }
        }
    }

    /// Whether writes are being buffered.
    pub fn is_active(&self) -> bool {
        self.state() != LoggerState::Disabled
    }

    /// Whether the local store is behind for `key`, that is a buffered write
    /// touches it and has not been replayed yet.
    pub fn is_uncertain(&self, key: &str) -> bool {
        self.is_active() && self.has_pending(key)
    }

    /// Whether a buffered write touches `key`.
    pub fn has_pending(&self, key: &str) -> bool {
        self.inner.lock().buffer.iter().any(|tx| tx.touches(key))
    }

    /// Buffered writes to `key`, in arrival order.
    pub fn pending_writes(&self, key: &str) -> Vec<WriteCommand> {
        self.inner
            .lock()
            .buffer
            .iter()
            .flat_map(|tx| tx.writes.iter())
            .filter(|write| write.key() == key)
            .cloned()
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Replay every buffered transaction through `apply` and disable.
    ///
    /// Writes keep arriving while draining; the buffer is taken in batches
    /// until it is found empty under the lock, and the logger is disabled in
    /// that same critical section. Returns the number of replayed
    /// transactions. Does nothing on a disabled logger.
    pub fn drain_and_disable(&self, mut apply: impl FnMut(LoggedTransaction)) -> usize {
        {
            let mut inner = self.inner.lock();
            if inner.state == LoggerState::Disabled {
                return 0;
            }
            inner.state = LoggerState::Draining;
        }

        let mut replayed = 0;

        loop {
            let batch = {
                let mut inner = self.inner.lock();
                if inner.buffer.is_empty() {
                    inner.state = LoggerState::Disabled;
                    break;
                }
                std::mem::take(&mut inner.buffer)
            };

            trace!(batch = batch.len(), "replaying logged transactions");
            for tx in batch {
                apply(tx);
                replayed += 1;
            }
        }

        debug!(replayed, "transaction logger drained and disabled");
        replayed
    }

    /// Abort: drop everything buffered and disable. Returns the number of
    /// dropped transactions.
    pub fn unlock_and_disable(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.buffer.len();

        inner.buffer.clear();
        inner.state = LoggerState::Disabled;

        if dropped > 0 {
            warn!(dropped, "transaction logger aborted with buffered writes");
        }
        dropped
    }
}
