//! Process-Wide Buffer Registry
//!
//! Every open [`MessageBuffer`](crate::MessageBuffer) registers itself here
//! and deregisters on close. An embedding application calls [`close_all`]
//! from its shutdown path so buffers checkpoint their active segments and
//! wake blocked cursors before the process exits.
//!
//! The registry holds weak references: a buffer that was dropped without a
//! close never keeps the slot alive.

use std::sync::{Mutex, OnceLock, Weak};

use tracing::{debug, warn};

use crate::buffer::BufferInner;

static REGISTRY: OnceLock<Mutex<Vec<Option<Weak<BufferInner>>>>> = OnceLock::new();

fn registry() -> &'static Mutex<Vec<Option<Weak<BufferInner>>>> {
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Handle returned by [`register`]; pass it back to [`unregister`].
#[derive(Debug)]
pub(crate) struct ShutdownRegistration {
    slot: usize,
}

pub(crate) fn register(buffer: &std::sync::Arc<BufferInner>) -> ShutdownRegistration {
    let mut slots = registry().lock().unwrap_or_else(|e| e.into_inner());
    let weak = std::sync::Arc::downgrade(buffer);
    for (slot, entry) in slots.iter_mut().enumerate() {
        // free slots, and slots whose buffer was dropped without a close
        let reusable = entry.as_ref().is_none_or(|w| w.strong_count() == 0);
        if reusable {
            *entry = Some(weak);
            return ShutdownRegistration { slot };
        }
    }
    slots.push(Some(weak));
    ShutdownRegistration {
        slot: slots.len() - 1,
    }
}

pub(crate) fn unregister(registration: ShutdownRegistration) {
    let mut slots = registry().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = slots.get_mut(registration.slot) {
        *entry = None;
    }
}

/// Close every live registered buffer. Call from the application's
/// shutdown path; failures are logged and do not stop the sweep.
pub async fn close_all() {
    let live: Vec<_> = {
        let slots = registry().lock().unwrap_or_else(|e| e.into_inner());
        slots
            .iter()
            .flatten()
            .filter_map(Weak::upgrade)
            .collect()
    };

    debug!(buffers = live.len(), "closing registered buffers");
    for buffer in live {
        if let Err(error) = buffer.close().await {
            warn!(error = %error, "buffer close failed during shutdown");
        }
    }
}
