// Job-wide cap on outstanding application sends of one class.
// Relayed traffic never takes a slot here.

use parking_lot::{Condvar, Mutex};

struct LimitState {
    outstanding: usize,
    peak: usize,
    closed: bool,
}

pub(crate) struct SenderLimit {
    name: &'static str,
    limit: usize,
    state: Mutex<LimitState>,
    freed: Condvar,
}

/// Returned when the limit was closed while a caller waited.
#[derive(Debug)]
pub(crate) struct LimitClosed;

impl SenderLimit {
    pub(crate) fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit,
            state: Mutex::new(LimitState {
                outstanding: 0,
                peak: 0,
                closed: false,
            }),
            freed: Condvar::new(),
        }
    }

    /// Take one slot, blocking while the class is saturated.
    ///
    /// `on_saturated` runs (without any lock held here) before each wait so
    /// the caller can push out partially filled batches whose completions
    /// will free capacity.
    pub(crate) fn acquire(&self, mut on_saturated: impl FnMut()) -> Result<(), LimitClosed> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(LimitClosed);
                }
                if state.outstanding < self.limit {
                    state.outstanding += 1;
                    state.peak = state.peak.max(state.outstanding);
                    return Ok(());
                }
            }

            tracing::debug!(limit = self.name, max = self.limit, "sender limit reached, waiting");
            on_saturated();

            let mut state = self.state.lock();
            while state.outstanding >= self.limit && !state.closed {
                self.freed.wait(&mut state);
            }
        }
    }

    /// Give back `n` slots and wake blocked senders.
    pub(crate) fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(n);
        self.freed.notify_all();
    }

    /// Wake every waiter and refuse further acquires.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.freed.notify_all();
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    pub(crate) fn is_saturated(&self) -> bool {
        self.state.lock().outstanding >= self.limit
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub(crate) fn peak(&self) -> usize {
        self.state.lock().peak
    }
}
