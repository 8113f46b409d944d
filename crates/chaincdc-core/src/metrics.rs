//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for the lifetime of a pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    blocks_received: AtomicU64,
    transaction_traces_received: AtomicU64,
    action_traces_received: AtomicU64,
    messages_sent: AtomicU64,
    commits: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub blocks_received: u64,
    pub transaction_traces_received: u64,
    pub action_traces_received: u64,
    pub messages_sent: u64,
    pub commits: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_block(&self, transactions: usize, actions: usize) {
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.transaction_traces_received
            .fetch_add(transactions as u64, Ordering::Relaxed);
        self.action_traces_received
            .fetch_add(actions as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, count: usize) {
        self.messages_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            transaction_traces_received: self.transaction_traces_received.load(Ordering::Relaxed),
            action_traces_received: self.action_traces_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = PipelineMetrics::new();
        m.record_block(2, 5);
        m.record_block(1, 1);
        m.record_sent(3);
        m.record_commit();
        assert_eq!(
            m.snapshot(),
            MetricsSnapshot {
                blocks_received: 2,
                transaction_traces_received: 3,
                action_traces_received: 6,
                messages_sent: 3,
                commits: 1,
            }
        );
    }
}
