use crate::planner::Batch;
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Heights with an outstanding header request. Written by the batch
/// dispatcher and by the body-receipt path, read by peer sessions deciding
/// whether an incoming header was asked for.
pub type SharedHeights = Arc<RwLock<HashSet<u64>>>;

pub fn shared_heights() -> SharedHeights {
    Arc::new(RwLock::new(HashSet::new()))
}

/// Bookkeeping for one resync session plus any live gap-fill batches.
///
/// The tracker itself never talks to the network. The rover control loop
/// owns it, pops batches when the outstanding set drains, and feeds height
/// completions back in as block bodies arrive.
pub struct RequestTracker {
    heights: SharedHeights,
    remaining: VecDeque<Batch>,
    session_active: bool,
}

impl RequestTracker {
    pub fn new(heights: SharedHeights) -> Self {
        Self {
            heights,
            remaining: VecDeque::new(),
            session_active: false,
        }
    }

    pub fn heights(&self) -> SharedHeights {
        self.heights.clone()
    }

    /// Starts a resync session, discarding any previous plan.
    pub fn begin_session(&mut self, batches: Vec<Batch>) {
        info!(batches = batches.len(), "starting resync session");
        self.heights.write().clear();
        self.remaining = batches.into();
        self.session_active = true;
    }

    pub fn enqueue_back(&mut self, batch: Batch) {
        self.remaining.push_back(batch);
    }

    /// Puts a batch back at the head of the queue after a failed dispatch.
    pub fn requeue(&mut self, batch: Batch) {
        self.remaining.push_front(batch);
    }

    /// The next batch to dispatch, available only once every previously
    /// requested height has been resolved.
    pub fn pop_next(&mut self) -> Option<Batch> {
        if !self.heights.read().is_empty() {
            return None;
        }
        self.remaining.pop_front()
    }

    /// Records a dispatched batch by unioning its range into the
    /// outstanding-heights set.
    pub fn mark_dispatched(&self, batch: &Batch) {
        let mut heights = self.heights.write();
        heights.extend(batch.heights());
        debug!(
            from = batch.from,
            to = batch.to,
            outstanding = heights.len(),
            "batch dispatched"
        );
    }

    /// Removes a completed height. Returns whether it was outstanding.
    pub fn complete_height(&self, height: u64) -> bool {
        self.heights.write().remove(&height)
    }

    pub fn is_requested(&self, height: u64) -> bool {
        self.heights.read().contains(&height)
    }

    pub fn outstanding(&self) -> usize {
        self.heights.read().len()
    }

    pub fn remaining_batches(&self) -> usize {
        self.remaining.len()
    }

    /// True exactly once per session, when the plan and the outstanding set
    /// have both drained.
    pub fn take_session_complete(&mut self) -> bool {
        if self.session_active && self.remaining.is_empty() && self.heights.read().is_empty() {
            self.session_active = false;
            return true;
        }
        false
    }

    /// Ends the session unsuccessfully. Returns whether one was active.
    pub fn abort_session(&mut self) -> bool {
        let was_active = self.session_active;
        self.session_active = false;
        self.remaining.clear();
        self.heights.write().clear();
        was_active
    }
}
