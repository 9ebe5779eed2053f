use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Level gauges.
pub mod gauges {
    /// Set the number of registered connections.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_connections_active(count: usize) {
        metrics::gauge!("pairchat_connections_active").set(count as f64);
    }

    /// Set the number of connections waiting for a peer.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_waiting(count: usize) {
        metrics::gauge!("pairchat_waiting").set(count as f64);
    }

    /// Set the number of block records held for this process.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_block_records(count: usize) {
        metrics::gauge!("pairchat_block_records").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Increment the accepted-connections counter.
    pub fn connections_total() {
        metrics::counter!("pairchat_connections_total").increment(1);
    }

    /// Increment the formed-pairs counter.
    pub fn pairs_total() {
        metrics::counter!("pairchat_pairs_total").increment(1);
    }

    /// Increment the relayed-messages counter.
    pub fn messages_relayed_total() {
        metrics::counter!("pairchat_messages_relayed_total").increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("pairchat_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the counter of outbound events lost to a full outbox.
    pub fn events_dropped_total(event: &'static str) {
        metrics::counter!("pairchat_events_dropped_total", "event" => event).increment(1);
    }

    /// Increment the blocks counter.
    pub fn blocks_total() {
        metrics::counter!("pairchat_blocks_total").increment(1);
    }

    /// Increment the reports counter.
    pub fn reports_total() {
        metrics::counter!("pairchat_reports_total").increment(1);
    }

    /// Record a moderation check with the given outcome label.
    pub fn moderation_checks_total(outcome: &'static str) {
        metrics::counter!("pairchat_moderation_checks_total", "outcome" => outcome).increment(1);
    }

    /// Increment the counter of HTTP requests refused by the rate limiter.
    pub fn http_rate_limited_total() {
        metrics::counter!("pairchat_http_rate_limited_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a moderation round trip in seconds.
    pub fn moderation_latency_seconds(value: f64) {
        metrics::histogram!("pairchat_moderation_latency_seconds").record(value);
    }
}
