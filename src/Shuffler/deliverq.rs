// Delivery queue: reassembled messages waiting for the application.
//
// A dedicated thread sleeps until the depth reaches the wake threshold (or a
// flush asks for it), then drains the queue calling the application's
// handler once per message. Incoming RPCs that push the depth past the max
// have their acknowledgement parked here; the sender's completion (and with
// it the sender's queue) stalls until the thread catches up.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::Core::error::{ShuffleError, ShuffleResult, TransportError};
use crate::Core::Transport::Responder;
use crate::Shuffler::stats::ShuffleStats;
use crate::Shuffler::Structs::Message;

/// The application's receive side.
///
/// Called on the delivery thread, one message at a time, in arrival order.
/// Blocking here is allowed and is how a slow consumer throttles the
/// pipeline. Do not call `flush_delivery` from inside the handler.
pub trait DeliveryHandler: Send + Sync + 'static {
    fn deliver(&self, message: Message);
}

impl<F> DeliveryHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn deliver(&self, message: Message) {
        self(message)
    }
}

struct DeliveryState {
    queue: VecDeque<Message>,
    /// Acknowledgements parked while the queue was over its max.
    held: VecDeque<Responder>,
    pushed: u64,
    delivered: u64,
    discarded: u64,
    flush_target: u64,
    peak_depth: usize,
    closing: bool,
}

/// Counters and depth of the delivery queue at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliverySnapshot {
    pub depth: usize,
    pub held_acks: usize,
    pub pushed: u64,
    pub delivered: u64,
    pub discarded: u64,
    pub peak_depth: usize,
    pub max: usize,
    pub threshold: usize,
}

pub(crate) struct DeliveryQueue {
    max: usize,
    threshold: usize,
    state: Mutex<DeliveryState>,
    /// Wakes the delivery thread.
    wake: Condvar,
    /// Signalled after each delivery; flush waits here.
    progress: Condvar,
}

impl DeliveryQueue {
    pub(crate) fn new(max: usize, threshold: usize) -> Self {
        Self {
            max,
            threshold,
            state: Mutex::new(DeliveryState {
                queue: VecDeque::new(),
                held: VecDeque::new(),
                pushed: 0,
                delivered: 0,
                discarded: 0,
                flush_target: 0,
                peak_depth: 0,
                closing: false,
            }),
            wake: Condvar::new(),
            progress: Condvar::new(),
        }
    }

    /// Append messages. Never blocks; returns false once the queue is closed.
    pub(crate) fn push(&self, messages: Vec<Message>) -> bool {
        if messages.is_empty() {
            return true;
        }
        let mut state = self.state.lock();
        if state.closing {
            state.discarded += messages.len() as u64;
            return false;
        }
        state.pushed += messages.len() as u64;
        state.queue.extend(messages);
        state.peak_depth = state.peak_depth.max(state.queue.len());
        if state.queue.len() >= self.threshold {
            self.wake.notify_one();
        }
        true
    }

    /// Acknowledge an incoming RPC now, or park the acknowledgement while the
    /// queue is over its max. Returns true if it was parked.
    pub(crate) fn acknowledge(&self, reply: Responder) -> bool {
        let outcome = {
            let mut state = self.state.lock();
            if state.closing {
                Some((reply, Err(TransportError::Closed)))
            } else if state.queue.len() > self.max {
                state.held.push_back(reply);
                None
            } else {
                Some((reply, Ok(())))
            }
        };
        match outcome {
            Some((reply, result)) => {
                reply(result);
                false
            }
            None => {
                tracing::debug!(max = self.max, "delivery queue over max, holding acknowledgement");
                true
            }
        }
    }

    /// Delivery thread body. Returns once the queue is closed.
    pub(crate) fn run(&self, handler: &dyn DeliveryHandler, stats: &ShuffleStats) {
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if state.closing {
                        return;
                    }
                    let flush_pending = state.flush_target > state.delivered && !state.queue.is_empty();
                    if state.queue.len() >= self.threshold || flush_pending {
                        break;
                    }
                    self.wake.wait(&mut state);
                }
            }

            // Once awake, drain everything queued.
            loop {
                let (message, released) = {
                    let mut state = self.state.lock();
                    if state.closing {
                        return;
                    }
                    let Some(message) = state.queue.pop_front() else {
                        break;
                    };
                    let released = if state.queue.len() <= self.threshold {
                        std::mem::take(&mut state.held)
                    } else {
                        VecDeque::new()
                    };
                    (message, released)
                };

                if !released.is_empty() {
                    tracing::debug!(count = released.len(), "releasing held acknowledgements");
                }
                for reply in released {
                    reply(Ok(()));
                }

                tracing::trace!(src = message.src, len = message.len(), "delivering message");
                handler.deliver(message);
                stats.record_delivered();

                let mut state = self.state.lock();
                state.delivered += 1;
                self.progress.notify_all();
            }
        }
    }

    /// Block until everything pushed before this call has been delivered.
    pub(crate) fn flush(&self) -> ShuffleResult<()> {
        let mut state = self.state.lock();
        let target = state.pushed;
        if state.delivered >= target {
            return Ok(());
        }
        state.flush_target = state.flush_target.max(target);
        self.wake.notify_one();
        while state.delivered < target {
            if state.closing {
                return Err(ShuffleError::Shutdown);
            }
            self.progress.wait(&mut state);
        }
        Ok(())
    }

    /// Stop the delivery thread, discard what is queued and fail parked
    /// acknowledgements. Returns the number of messages discarded.
    pub(crate) fn close(&self) -> u64 {
        let (held, discarded) = {
            let mut state = self.state.lock();
            state.closing = true;
            let discarded = state.queue.len() as u64;
            state.discarded += discarded;
            state.queue.clear();
            self.wake.notify_all();
            self.progress.notify_all();
            (std::mem::take(&mut state.held), discarded)
        };
        for reply in held {
            reply(Err(TransportError::Closed));
        }
        discarded
    }

    pub(crate) fn snapshot(&self) -> DeliverySnapshot {
        let state = self.state.lock();
        DeliverySnapshot {
            depth: state.queue.len(),
            held_acks: state.held.len(),
            pushed: state.pushed,
            delivered: state.delivered,
            discarded: state.discarded,
            peak_depth: state.peak_depth,
            max: self.max,
            threshold: self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn msg(n: u8) -> Message {
        Message {
            src: 0,
            dst: 0,
            msg_type: 0,
            payload: vec![n],
        }
    }

    fn spawn(
        queue: &Arc<DeliveryQueue>,
        seen: &Arc<Mutex<Vec<u8>>>,
    ) -> thread::JoinHandle<()> {
        let queue = queue.clone();
        let seen = seen.clone();
        thread::spawn(move || {
            let stats = ShuffleStats::default();
            let handler = move |m: Message| seen.lock().push(m.payload[0]);
            queue.run(&handler, &stats);
        })
    }

    #[test]
    fn below_threshold_waits_for_flush() {
        let queue = Arc::new(DeliveryQueue::new(16, 4));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = spawn(&queue, &seen);

        queue.push(vec![msg(1), msg(2)]);
        thread::sleep(Duration::from_millis(50));
        assert!(seen.lock().is_empty());

        queue.flush().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);

        queue.close();
        worker.join().unwrap();
    }

    #[test]
    fn threshold_wakes_and_drains_fifo() {
        let queue = Arc::new(DeliveryQueue::new(16, 3));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = spawn(&queue, &seen);

        queue.push(vec![msg(1), msg(2), msg(3), msg(4)]);
        queue.flush().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);

        queue.close();
        worker.join().unwrap();
    }

    #[test]
    fn acknowledgement_is_held_over_max() {
        let queue = DeliveryQueue::new(2, 1);
        queue.push(vec![msg(1), msg(2), msg(3)]);

        let acked = Arc::new(AtomicUsize::new(0));
        let counter = acked.clone();
        let held = queue.acknowledge(Box::new(move |res| {
            assert!(res.is_err());
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(held);
        assert_eq!(queue.snapshot().held_acks, 1);

        // Closing answers parked acknowledgements with an error.
        assert_eq!(queue.close(), 3);
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }
}
