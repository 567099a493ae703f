use rover_protocol::{BlockRef, Chain, Interval, ResyncDirective};
use std::ops::RangeInclusive;
use tracing::debug;

/// How far back the default catch-up window reaches, in seconds.
pub const ROVER_RESYNC_PERIOD_S: u64 = 28_800;

/// One dispatchable block range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    pub from: u64,
    pub to: u64,
}

impl Batch {
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn heights(&self) -> RangeInclusive<u64> {
        self.from..=self.to
    }

    /// Clamps the range to its newest `max_batch` blocks, dropping older ones.
    pub fn prefer_recent(self, max_batch: u64) -> Batch {
        if self.len() > max_batch {
            Batch {
                from: self.to - max_batch + 1,
                to: self.to,
            }
        } else {
            self
        }
    }
}

/// Splits `[from, to]` into sub-batches of at most `max_batch` blocks,
/// ordered newest range first.
fn split_descending(from: u64, to: u64, max_batch: u64) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut lo = from;
    while lo <= to {
        let hi = lo.saturating_add(max_batch - 1).min(to);
        batches.push(Batch { from: lo, to: hi });
        if hi == u64::MAX {
            break;
        }
        lo = hi + 1;
    }
    batches.reverse();
    batches
}

fn staleness_threshold_ms(chain: Chain) -> u64 {
    match chain {
        Chain::Eth => chain.seconds_per_block() * 1000,
        Chain::Lsk => chain.seconds_per_block() * 2 * 1000,
    }
}

/// Turns a resync directive and the observed remote tip into an ordered batch
/// plan. The head batch is meant to be dispatched immediately.
pub fn plan_resync(
    directive: &ResyncDirective,
    tip: Option<u64>,
    chain: Chain,
    now_ms: u64,
) -> Vec<Batch> {
    let max_batch = chain.max_batch();
    let mut batches = Vec::new();

    if !directive.intervals.is_empty() {
        let mut intervals: Vec<Interval> = directive
            .intervals
            .iter()
            .copied()
            .filter(|iv| iv.from <= iv.to)
            .collect();
        intervals.sort_by(|a, b| b.from.cmp(&a.from));
        for iv in intervals {
            batches.extend(split_descending(iv.from, iv.to, max_batch));
        }
    } else if let Some(tip) = tip {
        let window = (ROVER_RESYNC_PERIOD_S / chain.seconds_per_block()).max(1);
        let from = tip.saturating_sub(window - 1).max(1);
        batches.extend(split_descending(from, tip, max_batch));
    } else {
        debug!(chain = %chain, "no intervals and no known tip, nothing to plan");
    }

    if let (Some(latest), Some(tip)) = (&directive.latest_known, tip) {
        let stale = now_ms.saturating_sub(latest.timestamp_ms) > staleness_threshold_ms(chain);
        if stale && tip > latest.height {
            let mut head = split_descending(latest.height, tip, max_batch);
            head.append(&mut batches);
            batches = head;
        }
    }

    batches
}

/// Computes the range behind a FETCH_BLOCK directive, keeping only the newest
/// `max_batch` blocks when the gap is wider than one batch.
pub fn clamp_fetch(
    previous_last: &BlockRef,
    current_last: &BlockRef,
    max_batch: u64,
) -> Option<Batch> {
    let from = previous_last.height + 1;
    let to = current_last.height;
    if to < from {
        return None;
    }
    Some(Batch { from, to }.prefer_recent(max_batch))
}
