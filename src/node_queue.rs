use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::svn::dump;

// Bounded single-producer/single-consumer queue that overlaps dump
// parsing with applying. Nodes are cloned out of the reader's reusable
// record before crossing the thread boundary; reader failures travel
// in-band.

pub(crate) enum Message {
    Rev(dump::RevInfo),
    Node(dump::Node),
    Error(dump::ReadError),
}

struct Shared {
    capacity: usize,
    state: Mutex<State>,
    condvar: Condvar,
}

struct State {
    closed: bool,
    items: VecDeque<Message>,
}

pub(crate) struct Sender {
    shared: Arc<Shared>,
}

pub(crate) struct Receiver {
    shared: Arc<Shared>,
}

pub(crate) fn create(capacity: usize) -> (Sender, Receiver) {
    let shared = Arc::new(Shared {
        capacity,
        state: Mutex::new(State {
            closed: false,
            items: VecDeque::with_capacity(capacity),
        }),
        condvar: Condvar::new(),
    });

    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

impl Sender {
    /// Blocks while the queue is full. Returns `false` when the
    /// receiver is gone and the message was discarded.
    pub(crate) fn push(&self, message: Message) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.closed {
                return false;
            }
            if state.items.len() < self.shared.capacity {
                let was_empty = state.items.is_empty();
                state.items.push_back(message);
                if was_empty {
                    self.shared.condvar.notify_all();
                }
                return true;
            }
            state = self.shared.condvar.wait(state).unwrap();
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        self.shared.condvar.notify_all();
    }
}

impl Receiver {
    /// Blocks while the queue is empty. `None` signals that the
    /// producer finished and everything has been drained.
    pub(crate) fn pop(&self) -> Option<Message> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            let was_full = state.items.len() == self.shared.capacity;
            if let Some(message) = state.items.pop_front() {
                if was_full {
                    // Producer may be blocked on a full queue.
                    self.shared.condvar.notify_all();
                }
                return Some(message);
            }
            if state.closed {
                return None;
            }
            state = self.shared.condvar.wait(state).unwrap();
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        self.shared.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{create, Message};
    use crate::svn::dump::RevInfo;

    fn rev_message(rev: u32) -> Message {
        Message::Rev(RevInfo {
            rev,
            author: b"alice".to_vec(),
            date: 0,
            log: None,
            last_merged_rev: None,
        })
    }

    #[test]
    fn messages_arrive_in_order() {
        let (tx, rx) = create(4);

        let producer = std::thread::spawn(move || {
            for rev in 1..=20 {
                assert!(tx.push(rev_message(rev)));
            }
        });

        for expected in 1..=20 {
            match rx.pop() {
                Some(Message::Rev(info)) => assert_eq!(info.rev, expected),
                _ => panic!("unexpected message"),
            }
        }
        assert!(rx.pop().is_none());

        producer.join().unwrap();
    }

    #[test]
    fn dropped_receiver_unblocks_producer() {
        let (tx, rx) = create(1);
        assert!(tx.push(rev_message(1)));

        drop(rx);
        assert!(!tx.push(rev_message(2)));
    }

    #[test]
    fn pop_drains_after_producer_finishes() {
        let (tx, rx) = create(8);
        assert!(tx.push(rev_message(1)));
        assert!(tx.push(rev_message(2)));
        drop(tx);

        assert!(matches!(rx.pop(), Some(Message::Rev(_))));
        assert!(matches!(rx.pop(), Some(Message::Rev(_))));
        assert!(rx.pop().is_none());
    }
}
