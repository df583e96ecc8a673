//! Local log buffer shared by every log producer and the uplink tasks.
//!
//! Records are appended to `pending`. A flush takes the whole pending
//! queue out under the lock; a batch that cannot be delivered moves to
//! `failed` and waits for a retry. Records only ever leave the buffer by
//! being taken, so a record is never handed to two deliveries.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thinboot_core::log::LogRecord;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct BufferState {
    pending: VecDeque<LogRecord>,
    failed: VecDeque<Vec<LogRecord>>,
    /// Records in `failed`, across batches.
    failed_records: usize,
    dropped: u64,
}

impl BufferState {
    fn len(&self) -> usize {
        self.pending.len() + self.failed_records
    }

    /// Drop the oldest record held anywhere in the buffer.
    fn drop_oldest(&mut self) {
        if let Some(batch) = self.failed.front_mut() {
            batch.remove(0);
            self.failed_records -= 1;
            if batch.is_empty() {
                self.failed.pop_front();
            }
        } else {
            self.pending.pop_front();
        }
        self.dropped += 1;
    }
}

/// Bounded, mutex-guarded log queue.
#[derive(Debug)]
pub struct LogBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    urgent: Notify,
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` records. Past that the
    /// oldest records are discarded.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity: capacity.max(1),
            urgent: Notify::new(),
        }
    }

    /// Append a record. Error and critical records wake the flush task.
    pub fn push(&self, record: LogRecord) {
        let urgent = record.severity.is_urgent();
        {
            let mut state = self.state.lock();
            while state.len() >= self.capacity {
                state.drop_oldest();
            }
            state.pending.push_back(record);
        }
        if urgent {
            self.urgent.notify_one();
        }
    }

    /// Take every pending record.
    pub fn take_pending(&self) -> Vec<LogRecord> {
        self.state.lock().pending.drain(..).collect()
    }

    /// Park an undelivered batch for the retry task.
    pub fn park_failed(&self, batch: Vec<LogRecord>) {
        if batch.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.failed_records += batch.len();
        state.failed.push_back(batch);
        while state.len() > self.capacity {
            state.drop_oldest();
        }
    }

    /// Take every parked batch, oldest first.
    pub fn take_failed(&self) -> Vec<Vec<LogRecord>> {
        let mut state = self.state.lock();
        state.failed_records = 0;
        state.failed.drain(..).collect()
    }

    /// Resolves once an urgent record has been pushed since the last call.
    pub async fn urgent(&self) {
        self.urgent.notified().await
    }

    pub fn len(&self) -> usize {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn failed_batches(&self) -> usize {
        self.state.lock().failed.len()
    }

    /// Records discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}
