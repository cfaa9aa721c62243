//! Bookkeeping shared by every channel implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::request::RequestCore;
use super::{ChannelError, ChannelResult};

/// Position, lifecycle flags and live requests of one channel.
///
/// Requests register while running so that destroying the channel can
/// cancel every one of them.
#[derive(Default)]
pub struct ChannelState {
    position: AtomicU64,
    destroyed: AtomicBool,
    failure: Mutex<Option<Arc<ChannelError>>>,
    running: Mutex<HashMap<u64, Arc<RequestCore>>>,
}

impl ChannelState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Last position reported by any request of this channel.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Fails with the error every request of this channel should report once
    /// the channel is no longer usable.
    pub(crate) fn check_live(&self) -> ChannelResult<()> {
        if let Some(failure) = self.failure.lock().as_ref() {
            return Err(ChannelError::Shared(Arc::clone(failure)));
        }
        if self.is_destroyed() {
            return Err(ChannelError::Destroyed);
        }
        Ok(())
    }

    pub(crate) fn register(&self, request: &Arc<RequestCore>) {
        self.running.lock().insert(request.id(), Arc::clone(request));
    }

    pub(crate) fn unregister(&self, request: &RequestCore) {
        self.running.lock().remove(&request.id());
    }

    /// Number of requests currently running against this channel.
    pub fn running_requests(&self) -> usize {
        self.running.lock().len()
    }

    /// Marks the channel destroyed and flags every running request as
    /// cancelled. Returns `false` if the channel was already destroyed.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let running: Vec<_> = self.running.lock().drain().map(|(_, core)| core).collect();
        debug!("Destroying channel with {} running requests", running.len());
        for core in running {
            core.mark_cancelled();
        }
        true
    }

    /// Destroys the channel so that its requests fail with `error` instead
    /// of a plain destroyed error.
    pub fn fail(&self, error: Arc<ChannelError>) -> bool {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.destroy()
    }
}
