//! Process-wide default transport adapter.
//!
//! Sessions normally receive their transport through their constructor.
//! For test ergonomics a single adapter can be installed here and picked
//! up by a session at construction time; it is never consulted per call.
//!
//! Only one adapter is active at a time. Tests that install different
//! adapters must not run concurrently in the same process.

use crate::transport::Transport;
use parking_lot::RwLock;
use std::sync::Arc;

static ACTIVE: RwLock<Option<Arc<dyn Transport>>> = parking_lot::const_rwlock(None);

/// Installs the process-wide adapter, returning the one it replaces.
pub fn install(adapter: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
    tracing::debug!(adapter = adapter.name(), "installing ambient transport");
    ACTIVE.write().replace(adapter)
}

/// Returns the active adapter, if any.
pub fn active() -> Option<Arc<dyn Transport>> {
    ACTIVE.read().clone()
}

/// Removes the active adapter.
pub fn clear() -> Option<Arc<dyn Transport>> {
    ACTIVE.write().take()
}

/// Returns true if the given adapter is the active one.
pub fn is_active(adapter: &Arc<dyn Transport>) -> bool {
    ACTIVE
        .read()
        .as_ref()
        .is_some_and(|active| same_adapter(active, Arc::as_ptr(adapter) as *const ()))
}

/// Removes the active adapter only if it is the one at `adapter`.
pub(crate) fn clear_if(adapter: *const ()) -> bool {
    let mut active = ACTIVE.write();
    if active
        .as_ref()
        .is_some_and(|current| same_adapter(current, adapter))
    {
        *active = None;
        true
    } else {
        false
    }
}

fn same_adapter(active: &Arc<dyn Transport>, other: *const ()) -> bool {
    Arc::as_ptr(active) as *const () == other
}
