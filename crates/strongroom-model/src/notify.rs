//! Change notifications and the debounced "modified" signal.
//!
//! Observers are an append-only list of callbacks registered by the
//! surrounding layer; they run synchronously on the mutating thread and
//! receive event values only. During an `AboutTo*` event the tree is
//! mid-transition, so listeners must not mutate the database re-entrantly.

use std::time::{Duration, Instant};

use uuid::Uuid;

/// At most one debounced `Modified` per this window.
pub const MODIFIED_DEBOUNCE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEvent {
    GroupAboutToAdd { parent: Uuid },
    GroupAdded { uuid: Uuid },
    GroupAboutToRemove { uuid: Uuid },
    GroupRemoved { uuid: Uuid },
    GroupAboutToMove { uuid: Uuid, to: Uuid },
    GroupMoved { uuid: Uuid },
    GroupDataChanged { uuid: Uuid },
    EntryAboutToAdd { parent: Uuid },
    EntryAdded { uuid: Uuid },
    EntryAboutToRemove { uuid: Uuid },
    EntryRemoved { uuid: Uuid },
    EntryDataChanged { uuid: Uuid },
    /// Fires synchronously on every observable mutation.
    ModifiedImmediate,
    /// Debounced variant, raised at most once per [`MODIFIED_DEBOUNCE`].
    Modified,
}

type Observer = Box<dyn Fn(&DatabaseEvent) + Send>;

pub struct Notifier {
    observers: Vec<Observer>,
    emit_enabled: bool,
    last_flush: Option<Instant>,
    pending: bool,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
            emit_enabled: true,
            last_flush: None,
            pending: false,
        }
    }

    pub fn register(&mut self, observer: impl Fn(&DatabaseEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Mute or unmute modification signals; used during bulk load.
    pub fn set_emit_modified(&mut self, enabled: bool) {
        self.emit_enabled = enabled;
    }

    pub fn emit_modified_enabled(&self) -> bool {
        self.emit_enabled
    }

    /// Dispatch a structural event to every observer, regardless of the
    /// modified-mute switch.
    pub fn emit(&self, event: DatabaseEvent) {
        for observer in &self.observers {
            observer(&event);
        }
    }

    /// Record a mutation: `ModifiedImmediate` fires synchronously, and the
    /// coalesced `Modified` fires if the debounce window has elapsed.
    pub fn mark_modified(&mut self) {
        if !self.emit_enabled {
            return;
        }
        self.emit(DatabaseEvent::ModifiedImmediate);
        let due = match self.last_flush {
            Some(at) => at.elapsed() >= MODIFIED_DEBOUNCE,
            None => true,
        };
        if due {
            self.last_flush = Some(Instant::now());
            self.pending = false;
            self.emit(DatabaseEvent::Modified);
        } else {
            self.pending = true;
        }
    }

    /// Deferred flush: emit the coalesced `Modified` if one is pending.
    /// Collaborators without a timer call this from their idle loop.
    pub fn flush_modified(&mut self) {
        if self.pending && self.emit_enabled {
            self.pending = false;
            self.last_flush = Some(Instant::now());
            self.emit(DatabaseEvent::Modified);
        }
    }

    pub fn has_pending_modified(&self) -> bool {
        self.pending
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("observers", &self.observers.len())
            .field("emit_enabled", &self.emit_enabled)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(
        notifier: &mut Notifier,
        which: DatabaseEvent,
    ) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        notifier.register(move |event| {
            if *event == which {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });
        count
    }

    #[test]
    fn immediate_fires_every_time() {
        let mut n = Notifier::new();
        let count = counting(&mut n, DatabaseEvent::ModifiedImmediate);
        for _ in 0..5 {
            n.mark_modified();
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn modified_is_debounced() {
        let mut n = Notifier::new();
        let count = counting(&mut n, DatabaseEvent::Modified);
        for _ in 0..5 {
            n.mark_modified();
        }
        // first fires, the rest fall inside the window
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(n.has_pending_modified());
        n.flush_modified();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!n.has_pending_modified());
    }

    #[test]
    fn mute_suppresses_modified_only() {
        let mut n = Notifier::new();
        let modified = counting(&mut n, DatabaseEvent::Modified);
        let structural = counting(&mut n, DatabaseEvent::GroupAdded { uuid: Uuid::nil() });
        n.set_emit_modified(false);
        n.mark_modified();
        n.emit(DatabaseEvent::GroupAdded { uuid: Uuid::nil() });
        assert_eq!(modified.load(Ordering::SeqCst), 0);
        assert_eq!(structural.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_without_pending_is_a_no_op() {
        let mut n = Notifier::new();
        let count = counting(&mut n, DatabaseEvent::Modified);
        n.flush_modified();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
