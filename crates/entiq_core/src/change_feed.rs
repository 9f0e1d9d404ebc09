//! Change notifications for tracked entities.
//!
//! The session publishes an [`EntityChange`] once a transition has been
//! applied to the cache. Listeners either hold a channel from
//! [`ChangeFeed::subscribe`] or read the retained backlog with a cursor.
//!
//! ```rust,ignore
//! let changes = session.subscribe();
//! session.attach_entity(&todo)?;
//! for change in changes.try_iter() {
//!     println!("{:?} {}", change.action, change.key);
//! }
//! ```

use crate::key::EntityKey;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, Sender};

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityAction {
    /// Attached as unchanged by the caller.
    Attached,
    /// Materialized by a query.
    AttachedOnQuery,
    /// Added as new.
    Added,
    /// Server values merged by a query.
    MergedOnQuery,
    /// A property value changed.
    PropertyChanged,
    /// Marked for deletion.
    MarkedForDelete,
    /// A temporary key was replaced by the server key.
    KeyChanged,
    /// Committed by a save.
    Saved,
    /// Server values merged by a save.
    MergedOnSave,
    /// Pending changes were rejected.
    ChangesRejected,
    /// No longer tracked.
    Detached,
}

/// One published transition.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    /// Position in the session's notification order, starting at 1.
    pub sequence: u64,
    /// What happened.
    pub action: EntityAction,
    /// Key the entity carries after the transition.
    pub key: EntityKey,
    /// Set for [`EntityAction::PropertyChanged`].
    pub property: Option<String>,
}

#[derive(Default)]
struct FeedState {
    listeners: Vec<Sender<EntityChange>>,
    backlog: VecDeque<EntityChange>,
    last_sequence: u64,
}

impl FeedState {
    fn publish(&mut self, change: EntityChange, retain: usize) {
        if retain > 0 {
            if self.backlog.len() == retain {
                self.backlog.pop_front();
            }
            self.backlog.push_back(change.clone());
        }
        self.listeners
            .retain(|listener| listener.send(change.clone()).is_ok());
    }
}

/// Fan-out of entity changes.
///
/// Numbering, backlog and delivery happen under one lock, so every listener
/// observes the same order as the backlog. Listeners whose receiver was
/// dropped are pruned on the next publish.
pub struct ChangeFeed {
    state: Mutex<FeedState>,
    retain: usize,
}

impl ChangeFeed {
    /// Creates a feed whose backlog keeps the last `retain` changes.
    /// Zero disables the backlog.
    pub fn with_max_history(retain: usize) -> Self {
        Self {
            state: Mutex::new(FeedState::default()),
            retain,
        }
    }

    /// Opens a channel receiving every change published from now on.
    pub fn subscribe(&self) -> Receiver<EntityChange> {
        let (listener, receiver) = channel();
        self.state.lock().listeners.push(listener);
        receiver
    }

    /// Numbers and publishes one change.
    pub fn emit(&self, action: EntityAction, key: EntityKey, property: Option<String>) {
        let mut state = self.state.lock();
        state.last_sequence += 1;
        let change = EntityChange {
            sequence: state.last_sequence,
            action,
            key,
            property,
        };
        state.publish(change, self.retain);
    }

    /// Publishes a batch without interleaving changes from other threads.
    pub fn emit_all(&self, changes: Vec<(EntityAction, EntityKey)>) {
        let mut state = self.state.lock();
        for (action, key) in changes {
            state.last_sequence += 1;
            let change = EntityChange {
                sequence: state.last_sequence,
                action,
                key,
                property: None,
            };
            state.publish(change, self.retain);
        }
    }

    /// Backlog entries numbered after `cursor`, oldest first, at most `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<EntityChange> {
        let state = self.state.lock();
        let skip = state
            .backlog
            .iter()
            .position(|change| change.sequence > cursor)
            .unwrap_or(state.backlog.len());
        state.backlog.iter().skip(skip).take(limit).cloned().collect()
    }

    /// Sequence of the most recent change, or 0.
    pub fn latest_sequence(&self) -> u64 {
        self.state.lock().last_sequence
    }

    /// Number of listeners not yet pruned.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Number of changes held in the backlog.
    pub fn history_len(&self) -> usize {
        self.state.lock().backlog.len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::with_max_history(1024)
    }
}
