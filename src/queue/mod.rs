//! Bounded multi-band priority queue. Four bands (CRITICAL > HIGH > NORMAL
//! > LOW), each FIFO by insertion sequence. Entries never reorder within a
//! band; closing the queue drains remaining entries as kind=SHUTDOWN.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::{ExecutionRequest, Priority};
use crate::error::OrkestraError;

struct QueueEntry {
    sequence: u64,
    enqueued_at: Instant,
    request: ExecutionRequest,
}

#[derive(Debug, Clone, Default)]
pub struct BandSnapshot {
    pub count: usize,
    pub oldest_age: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub critical: BandSnapshot,
    pub high: BandSnapshot,
    pub normal: BandSnapshot,
    pub low: BandSnapshot,
    pub total: usize,
}

impl QueueSnapshot {
    /// Longest any currently-queued entry has waited, across all bands.
    pub fn oldest_wait(&self) -> Option<Duration> {
        [&self.critical, &self.high, &self.normal, &self.low]
            .into_iter()
            .filter_map(|band| band.oldest_age)
            .max()
    }
}

struct Bands {
    critical: VecDeque<QueueEntry>,
    high: VecDeque<QueueEntry>,
    normal: VecDeque<QueueEntry>,
    low: VecDeque<QueueEntry>,
    closed: bool,
}

impl Bands {
    fn band_mut(&mut self, priority: Priority) -> &mut VecDeque<QueueEntry> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    fn band(&self, priority: Priority) -> &VecDeque<QueueEntry> {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    fn total(&self) -> usize {
        self.critical.len() + self.high.len() + self.normal.len() + self.low.len()
    }

    fn pop_highest(&mut self) -> Option<QueueEntry> {
        for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            if let Some(entry) = self.band_mut(priority).pop_front() {
                return Some(entry);
            }
        }
        None
    }
}

/// Bounded priority queue. Capacity is enforced across all bands combined.
pub struct PriorityQueue {
    bands: Mutex<Bands>,
    notify: Notify,
    next_sequence: AtomicU64,
    max_size: usize,
}

impl PriorityQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            bands: Mutex::new(Bands {
                critical: VecDeque::new(),
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(0),
            max_size,
        }
    }

    /// Rejects with kind=QUEUE_FULL when full.
    pub fn enqueue(&self, request: ExecutionRequest) -> Result<(), OrkestraError> {
        let mut bands = self.bands.lock();
        if bands.closed {
            return Err(OrkestraError::shutdown());
        }
        if bands.total() >= self.max_size {
            return Err(OrkestraError::queue_full());
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let priority = request.priority;
        bands.band_mut(priority).push_back(QueueEntry {
            sequence,
            enqueued_at: Instant::now(),
            request,
        });
        drop(bands);
        self.notify.notify_one();
        Ok(())
    }

    /// Returns the highest-priority oldest entry, blocking cooperatively
    /// until one exists or the queue is closed (`None`).
    pub async fn dequeue(&self) -> Option<ExecutionRequest> {
        loop {
            {
                let mut bands = self.bands.lock();
                if let Some(entry) = bands.pop_highest() {
                    return Some(entry.request);
                }
                if bands.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Removes a pending entry without running it. Returns the request if
    /// found so the caller can mark it CANCELLED.
    pub fn cancel_by_id(&self, id: &str) -> Option<ExecutionRequest> {
        let mut bands = self.bands.lock();
        for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            let band = bands.band_mut(priority);
            if let Some(pos) = band.iter().position(|e| e.request.id == id) {
                return band.remove(pos).map(|e| e.request);
            }
        }
        None
    }

    /// Puts an entry back preserving its original priority and sequence
    /// ordering relative to entries already queued at that priority: it is
    /// re-appended to the tail of its band, per the dispatcher's
    /// no-compatible-worker path and the service's retry re-enqueue path.
    pub fn requeue(&self, request: ExecutionRequest) -> Result<(), OrkestraError> {
        self.enqueue(request)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let bands = self.bands.lock();
        let band_snapshot = |p: Priority| {
            let band = bands.band(p);
            BandSnapshot {
                count: band.len(),
                oldest_age: band.front().map(|e| e.enqueued_at.elapsed()),
            }
        };
        QueueSnapshot {
            critical: band_snapshot(Priority::Critical),
            high: band_snapshot(Priority::High),
            normal: band_snapshot(Priority::Normal),
            low: band_snapshot(Priority::Low),
            total: bands.total(),
        }
    }

    pub fn len(&self) -> usize {
        self.bands.lock().total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue; subsequent `dequeue` calls drain remaining entries
    /// (returned here) as kind=SHUTDOWN and then return `None`.
    pub fn close(&self) -> Vec<ExecutionRequest> {
        let mut bands = self.bands.lock();
        bands.closed = true;
        let mut drained = Vec::new();
        while let Some(entry) = bands.pop_highest() {
            drained.push(entry.request);
        }
        drop(bands);
        self.notify.notify_waiters();
        drained
    }
}

pub type SharedQueue = Arc<PriorityQueue>;
