//! # Per-Session Sequencing Lock
//!
//! A ticket lock that owns the session's mutable state. Tickets are issued in the
//! order chunks are handed to the worker pool, and turns are granted strictly in
//! ticket order. A plain mutex is not enough here: with several workers draining
//! one FIFO, two chunks of the same session can be dequeued by two workers and
//! the later one may win the mutex.
//!
//! ## Deadlock Freedom:
//! Tickets are issued while the issuance lock is held across the enqueue, so
//! ticket order equals queue order. The lowest outstanding ticket therefore always
//! belongs to a task a worker already dequeued, and that worker can proceed.
//!
//! ## Release Order:
//! A [`Turn`] drops its state guard before it advances the serving counter, so the
//! next holder never contends on the state mutex.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A place in a session's processing order.
#[must_use = "a ticket that is never redeemed stalls every later turn"]
#[derive(Debug, PartialEq, Eq)]
pub struct Ticket(u64);

impl Ticket {
    pub fn number(&self) -> u64 {
        self.0
    }
}

/// Ticket lock around a value of type `T`.
#[derive(Debug)]
pub struct Sequencer<T> {
    next: Mutex<u64>,
    serving: Mutex<u64>,
    turn_changed: Condvar,
    state: Mutex<T>,
}

impl<T> Sequencer<T> {
    pub fn new(state: T) -> Self {
        Self {
            next: Mutex::new(0),
            serving: Mutex::new(0),
            turn_changed: Condvar::new(),
            state: Mutex::new(state),
        }
    }

    /// Issue the next ticket and hand it to `enqueue` while issuance is locked.
    ///
    /// If `enqueue` fails the ticket number is not consumed, so a rejected
    /// submission leaves no gap in the sequence.
    pub fn issue_with<R, E>(&self, enqueue: impl FnOnce(Ticket) -> Result<R, E>) -> Result<R, E> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let result = enqueue(Ticket(*next));
        if result.is_ok() {
            *next += 1;
        }
        result
    }

    /// Issue the next ticket.
    pub fn issue(&self) -> Ticket {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let ticket = Ticket(*next);
        *next += 1;
        ticket
    }

    /// Block until `ticket` is being served, then hand out exclusive access.
    pub fn wait(&self, ticket: Ticket) -> Turn<'_, T> {
        let serving = self.serving.lock().unwrap_or_else(PoisonError::into_inner);
        let serving = self
            .turn_changed
            .wait_while(serving, |now| *now != ticket.0)
            .unwrap_or_else(PoisonError::into_inner);
        drop(serving);

        Turn {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
            _release: TurnRelease {
                serving: &self.serving,
                turn_changed: &self.turn_changed,
            },
        }
    }

    /// Take a turn behind everything already issued.
    pub fn acquire(&self) -> Turn<'_, T> {
        let ticket = self.issue();
        self.wait(ticket)
    }

    /// Number of tickets issued but not yet finished.
    pub fn outstanding(&self) -> u64 {
        let next = *self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let serving = *self.serving.lock().unwrap_or_else(PoisonError::into_inner);
        next.saturating_sub(serving)
    }
}

/// Exclusive access to the sequenced state for the duration of one ticket.
///
/// Field order matters: the state guard is dropped before the release advances
/// the serving counter.
pub struct Turn<'a, T> {
    state: MutexGuard<'a, T>,
    _release: TurnRelease<'a>,
}

impl<T> Deref for Turn<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T> DerefMut for Turn<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.state
    }
}

struct TurnRelease<'a> {
    serving: &'a Mutex<u64>,
    turn_changed: &'a Condvar,
}

impl Drop for TurnRelease<'_> {
    fn drop(&mut self) {
        let mut serving = self.serving.lock().unwrap_or_else(PoisonError::into_inner);
        *serving += 1;
        drop(serving);
        self.turn_changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_turns_follow_ticket_order_not_arrival_order() {
        let seq = Arc::new(Sequencer::new(Vec::new()));
        let tickets: Vec<Ticket> = (0..5).map(|_| seq.issue()).collect();

        // Redeem in reverse so the latest ticket is the first to start waiting.
        let handles: Vec<_> = tickets
            .into_iter()
            .rev()
            .enumerate()
            .map(|(delay, ticket)| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(delay as u64 * 3));
                    let number = ticket.number();
                    let mut turn = seq.wait(ticket);
                    turn.push(number);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*seq.acquire(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_rejected_enqueue_does_not_consume_ticket() {
        let seq = Sequencer::new(());
        let rejected: Result<(), &str> = seq.issue_with(|_ticket| Err("queue closed"));
        assert!(rejected.is_err());

        let number = seq.issue_with(|ticket| Ok::<_, ()>(ticket.number())).unwrap();
        assert_eq!(number, 0);
        assert_eq!(seq.outstanding(), 1);
    }

    #[test]
    fn test_turns_are_mutually_exclusive() {
        let seq = Arc::new(Sequencer::new((false, 0u32)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let mut turn = seq.acquire();
                        assert!(!turn.0, "two holders inside one turn");
                        turn.0 = true;
                        turn.1 += 1;
                        turn.0 = false;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seq.acquire().1, 400);
        assert_eq!(seq.outstanding(), 0);
    }

    #[test]
    fn test_panicking_holder_still_passes_the_turn() {
        let seq = Arc::new(Sequencer::new(0u32));
        let first = seq.issue();
        let second = seq.issue();

        let panicking = {
            let seq = Arc::clone(&seq);
            thread::spawn(move || {
                let _turn = seq.wait(first);
                panic!("recognizer blew up");
            })
        };
        assert!(panicking.join().is_err());

        let mut turn = seq.wait(second);
        *turn += 1;
        assert_eq!(*turn, 1);
    }
}
