//! Case notifications delivered to UI listeners over channels.

use std::sync::mpsc::{Receiver, Sender, channel};

use crate::state::CaseState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseEvent {
    /// The case is no longer usable; listeners should drop it.
    Detach,
    NewState { old: CaseState, new: CaseState },
}

#[derive(Debug, Default)]
pub struct Observers {
    subscribers: Vec<Sender<CaseEvent>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<CaseEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    /// Send to every live subscriber, dropping the ones whose receiver is gone.
    pub fn notify(&mut self, event: CaseEvent) {
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut observers = Observers::new();
        let keep = observers.subscribe();
        let gone = observers.subscribe();
        drop(gone);
        observers.notify(CaseEvent::Detach);
        assert_eq!(observers.len(), 1);
        assert_eq!(keep.try_recv().unwrap(), CaseEvent::Detach);
    }
}
