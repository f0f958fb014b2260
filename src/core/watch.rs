//! Observers for leadership and availability transitions.

use crate::error::RaftError;

/// Events delivered to registered watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The node observed a new term.
    TermChange { term: u64 },
    /// The known leader changed (`None` when leadership was lost).
    LeaderChange { term: u64, leader_id: Option<u64> },
    /// A disk failure latched the node into an unavailable state.
    Unavailable,
}

/// Observer of node transitions. Fired synchronously on the node's event
/// loop; implementations must not block.
pub trait Watcher: Send {
    fn notify(&self, event: &WatchEvent);
}

impl<F: Fn(&WatchEvent) + Send> Watcher for F {
    fn notify(&self, event: &WatchEvent) {
        self(event)
    }
}

const MAX_WATCHERS: usize = 8;

/// A small bounded list of observers.
#[derive(Default)]
pub struct WatchList {
    watchers: Vec<Box<dyn Watcher>>,
}

impl WatchList {
    pub fn new() -> Self {
        WatchList { watchers: Vec::new() }
    }

    /// Register an observer. Fails with `Busy` when the list is full.
    pub fn register(&mut self, watcher: Box<dyn Watcher>) -> Result<(), RaftError> {
        if self.watchers.len() >= MAX_WATCHERS {
            return Err(RaftError::Busy);
        }
        self.watchers.push(watcher);
        Ok(())
    }

    pub fn fire(&self, event: &WatchEvent) {
        for watcher in &self.watchers {
            watcher.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_every_registered_watcher() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut list = WatchList::new();
        for _ in 0..3 {
            let count = count.clone();
            list.register(Box::new(move |_: &WatchEvent| {
                count.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        list.fire(&WatchEvent::TermChange { term: 3 });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn registration_is_bounded() {
        let mut list = WatchList::new();
        for _ in 0..MAX_WATCHERS {
            list.register(Box::new(|_: &WatchEvent| {})).unwrap();
        }
        assert!(list.register(Box::new(|_: &WatchEvent| {})).is_err());
    }
}
