//! Single-flight request gate
//!
//! Requests take a ticket and poll until their ticket is at the head of
//! the queue and nobody holds the gate. Polling waits a fixed interval plus
//! random jitter.

use crate::config::QueuePollConfig;

use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
struct GateState {
    busy: bool,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// Busy flag plus FIFO queue of waiting requests
#[derive(Debug)]
pub struct Gate {
    state: Mutex<GateState>,
    poll: QueuePollConfig,
}

impl Gate {
    pub fn new(poll: QueuePollConfig) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            poll,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for this request's turn.
    ///
    /// Dropping the returned future while queued gives up the ticket.
    pub async fn acquire(&self) -> GateGuard<'_> {
        let ticket = self.enqueue();
        let mut polls = 0u32;

        loop {
            if self.try_take(ticket.id) {
                ticket.disarm();
                if polls > 0 {
                    debug!(polls, "request left the queue");
                }
                return GateGuard { gate: self };
            }
            polls += 1;
            tokio::time::sleep(self.poll_delay()).await;
        }
    }

    /// Whether a request currently holds the gate
    pub fn is_busy(&self) -> bool {
        self.lock().busy
    }

    /// Number of requests waiting
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    fn enqueue(&self) -> Ticket<'_> {
        let mut state = self.lock();
        let id = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(id);
        Ticket {
            gate: self,
            id,
            armed: true,
        }
    }

    fn try_take(&self, id: u64) -> bool {
        let mut state = self.lock();
        if state.busy || state.queue.front() != Some(&id) {
            return false;
        }
        state.queue.pop_front();
        state.busy = true;
        true
    }

    fn poll_delay(&self) -> Duration {
        let jitter_ms = self.poll.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.poll.interval + Duration::from_millis(jitter)
    }

    fn release(&self) {
        self.lock().busy = false;
    }
}

/// Queue position; removed from the queue if dropped before being served
struct Ticket<'a> {
    gate: &'a Gate,
    id: u64,
    armed: bool,
}

impl Ticket<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if self.armed {
            let id = self.id;
            self.gate.lock().queue.retain(|t| *t != id);
        }
    }
}

/// Held while a request drives the inference process; releases on drop
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_gate() -> Arc<Gate> {
        Arc::new(Gate::new(QueuePollConfig {
            interval: Duration::from_millis(5),
            jitter: Duration::from_millis(5),
        }))
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let gate = fast_gate();
        {
            let _guard = gate.acquire().await;
            assert!(gate.is_busy());
        }
        assert!(!gate.is_busy());
        let _again = gate.acquire().await;
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let gate = fast_gate();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = gate.acquire().await;
        let mut waiters = Vec::new();
        for i in 0..4 {
            let waiter = Arc::clone(&gate);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let _guard = waiter.acquire().await;
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
            // make sure tickets are taken in index order
            while gate.queued() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_abandoned_ticket_leaves_queue() {
        let gate = fast_gate();
        let held = gate.acquire().await;

        let waiting = tokio::time::timeout(Duration::from_millis(30), gate.acquire()).await;
        assert!(waiting.is_err());
        assert_eq!(gate.queued(), 0);

        drop(held);
        let _next = tokio::time::timeout(Duration::from_secs(1), gate.acquire())
            .await
            .unwrap();
    }
}
