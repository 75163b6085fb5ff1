//! Transport metrics.
//!
//! Uses the `metrics` crate facade; nothing is recorded until the binary
//! installs an exporter.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const EVENTS_TOTAL: &str = "relay_events_total";
    pub const EVENTS_BYTES: &str = "relay_events_bytes";
    pub const DROPPED_FRAMES_TOTAL: &str = "relay_dropped_frames_total";
    pub const RECONNECTS_TOTAL: &str = "relay_reconnects_total";
    pub const CONNECT_FAILURES_TOTAL: &str = "relay_connect_failures_total";
    pub const PEER_LINKS_ACTIVE: &str = "relay_peer_links_active";
    pub const PEER_LINKS_CLOSED_TOTAL: &str = "relay_peer_links_closed_total";
}

/// Describe the transport metrics.
pub fn describe() {
    metrics::describe_counter!(names::EVENTS_TOTAL, "Events moved, by direction");
    metrics::describe_counter!(names::EVENTS_BYTES, "Payload bytes moved, by direction");
    metrics::describe_counter!(
        names::DROPPED_FRAMES_TOTAL,
        "Inbound frames dropped as malformed or of an unexpected kind"
    );
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Successful hub reconnects");
    metrics::describe_counter!(names::CONNECT_FAILURES_TOTAL, "Failed dial attempts");
    metrics::describe_gauge!(names::PEER_LINKS_ACTIVE, "Currently open peer links");
    metrics::describe_counter!(
        names::PEER_LINKS_CLOSED_TOTAL,
        "Peer links closed, by reason"
    );
}

/// Record an event moved in `direction` (`inbound` or `outbound`).
pub fn record_event(bytes: usize, direction: &'static str) {
    counter!(names::EVENTS_TOTAL, "direction" => direction).increment(1);
    counter!(names::EVENTS_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an inbound frame that was dropped.
pub fn record_dropped_frame(reason: &'static str) {
    counter!(names::DROPPED_FRAMES_TOTAL, "reason" => reason).increment(1);
}

/// Record a successful reconnect.
pub fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

/// Record a failed dial.
pub fn record_connect_failure() {
    counter!(names::CONNECT_FAILURES_TOTAL).increment(1);
}

/// Record a peer link opening.
pub fn record_link_opened() {
    gauge!(names::PEER_LINKS_ACTIVE).increment(1.0);
}

/// Record a peer link closing.
pub fn record_link_closed(reason: &'static str) {
    gauge!(names::PEER_LINKS_ACTIVE).decrement(1.0);
    counter!(names::PEER_LINKS_CLOSED_TOTAL, "reason" => reason).increment(1);
}
