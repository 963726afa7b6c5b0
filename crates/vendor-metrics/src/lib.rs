//! Metrics infrastructure for the mesh vendor model node.
//!
//! This crate declares every metric the node emits as a structured [`Metric`]
//! constant and re-exports the `metrics` facade. Emitting a metric when no
//! recorder is installed is a no-op.
//!
//! # Example
//!
//! ```rust,ignore
//! use vendor_metrics::{metric_defs, describe_metrics, MetricLabels};
//!
//! describe_metrics();
//!
//! let labels = MetricLabels::new("node-a", 0x0001);
//! metrics::counter!(metric_defs::CLIENT_REQUESTS_SENT.name, &labels.to_labels()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration with its metadata.
///
/// ```rust
/// use vendor_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const REPLIES: Metric = Metric::counter("vendor.server.replies")
///     .with_description("Replies sent")
///     .with_unit(Unit::Count)
///     .with_labels(&["node", "address"]);
///
/// assert_eq!(REPLIES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "vendor.client.requests_sent").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn with_kind(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Creates a new counter metric with the given name.
    pub const fn counter(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Counter)
    }

    /// Creates a new gauge metric with the given name.
    pub const fn gauge(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Gauge)
    }

    /// Creates a new histogram metric with the given name.
    pub const fn histogram(name: &'static str) -> Self {
        Self::with_kind(name, MetricKind::Histogram)
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => {
                describe_counter!(self.name, unit, self.description);
            }
            (MetricKind::Counter, None) => {
                describe_counter!(self.name, self.description);
            }
            (MetricKind::Gauge, Some(unit)) => {
                describe_gauge!(self.name, unit, self.description);
            }
            (MetricKind::Gauge, None) => {
                describe_gauge!(self.name, self.description);
            }
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description);
            }
            (MetricKind::Histogram, None) => {
                describe_histogram!(self.name, self.description);
            }
        }
    }
}

/// All metric definitions for the node.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Standard Label Keys
    // ========================================================================

    /// Labels present on every node-scoped metric.
    pub const STANDARD_LABELS: &[&str] = &["node", "address"];

    /// Standard labels plus the message opcode.
    pub const OPCODE_LABELS: &[&str] = &["node", "address", "opcode"];

    // ========================================================================
    // Client
    // ========================================================================

    /// Requests handed to the transport by the client (acknowledged or not).
    ///
    /// Labels: node, address, opcode
    pub const CLIENT_REQUESTS_SENT: Metric = Metric::counter("vendor.client.requests_sent")
        .with_description("Requests sent by the vendor client")
        .with_unit(Unit::Count)
        .with_labels(OPCODE_LABELS);

    /// Acknowledged requests that hit their deadline.
    pub const CLIENT_TIMEOUTS: Metric = Metric::counter("vendor.client.timeouts")
        .with_description("Acknowledged requests that timed out")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Status messages received by the client.
    ///
    /// Labels: node, address, opcode
    pub const CLIENT_STATUS_RECEIVED: Metric = Metric::counter("vendor.client.status_received")
        .with_description("Status messages received by the vendor client")
        .with_unit(Unit::Count)
        .with_labels(OPCODE_LABELS);

    /// Status messages that did not complete a pending request.
    pub const CLIENT_STATUS_UNSOLICITED: Metric =
        Metric::counter("vendor.client.status_unsolicited")
            .with_description("Status messages not matching a pending request")
            .with_unit(Unit::Count)
            .with_labels(OPCODE_LABELS);

    /// Round trip time of completed acknowledged requests.
    pub const CLIENT_ROUND_TRIP: Metric = Metric::histogram("vendor.client.round_trip_ms")
        .with_description("Round trip time of acknowledged requests in milliseconds")
        .with_unit(Unit::Milliseconds)
        .with_labels(STANDARD_LABELS);

    // ========================================================================
    // Server
    // ========================================================================

    /// Messages dispatched by the server.
    ///
    /// Labels: node, address, opcode
    pub const SERVER_MESSAGES: Metric = Metric::counter("vendor.server.messages")
        .with_description("Messages dispatched by the vendor server")
        .with_unit(Unit::Count)
        .with_labels(OPCODE_LABELS);

    /// Replies suppressed because the handler failed or deferred.
    pub const SERVER_REPLIES_SUPPRESSED: Metric =
        Metric::counter("vendor.server.replies_suppressed")
            .with_description("Server replies suppressed by handler outcome")
            .with_unit(Unit::Count)
            .with_labels(OPCODE_LABELS);

    /// Inbound frames dropped as malformed.
    pub const FRAMES_DROPPED: Metric = Metric::counter("vendor.node.frames_dropped")
        .with_description("Inbound frames dropped as malformed")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    // ========================================================================
    // Directory & Scheduler
    // ========================================================================

    /// Directory entries evicted to make room for a new serial.
    pub const DIRECTORY_EVICTIONS: Metric = Metric::counter("vendor.directory.evictions")
        .with_description("Directory entries evicted on insert")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Directory entries removed by age.
    pub const DIRECTORY_PURGED: Metric = Metric::counter("vendor.directory.purged")
        .with_description("Directory entries removed by purge")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Occupied directory slots.
    pub const DIRECTORY_ENTRIES: Metric = Metric::gauge("vendor.directory.entries")
        .with_description("Occupied directory slots")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Node details announcements published by the scheduler.
    pub const SCHEDULER_PUBLISHES: Metric = Metric::counter("vendor.scheduler.publishes")
        .with_description("Node details announcements published")
        .with_unit(Unit::Count)
        .with_labels(STANDARD_LABELS);

    /// Scheduler cycles whose publish was skipped.
    pub const SCHEDULER_PUBLISH_SKIPPED: Metric =
        Metric::counter("vendor.scheduler.publish_skipped")
            .with_description("Announcements skipped because the node was not ready")
            .with_unit(Unit::Count)
            .with_labels(STANDARD_LABELS);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        // Client
        &CLIENT_REQUESTS_SENT,
        &CLIENT_TIMEOUTS,
        &CLIENT_STATUS_RECEIVED,
        &CLIENT_STATUS_UNSOLICITED,
        &CLIENT_ROUND_TRIP,
        // Server
        &SERVER_MESSAGES,
        &SERVER_REPLIES_SUPPRESSED,
        &FRAMES_DROPPED,
        // Directory & Scheduler
        &DIRECTORY_EVICTIONS,
        &DIRECTORY_PURGED,
        &DIRECTORY_ENTRIES,
        &SCHEDULER_PUBLISHES,
        &SCHEDULER_PUBLISH_SKIPPED,
    ];
}

/// Labels identifying the node a metric belongs to.
///
/// ```rust
/// use vendor_metrics::MetricLabels;
///
/// let labels = MetricLabels::new("node-a", 0x0001);
/// assert_eq!(labels.to_labels()[1], ("address", "0x0001".to_string()));
/// ```
#[derive(Debug, Clone)]
pub struct MetricLabels {
    /// Node name from configuration.
    pub node: String,
    /// Own mesh address, formatted as hex.
    pub address: String,
}

impl MetricLabels {
    /// Creates labels for the node with the given name and address.
    pub fn new(node: impl Into<String>, address: u16) -> Self {
        Self {
            node: node.into(),
            address: format!("0x{:04X}", address),
        }
    }

    /// Converts the labels to the metrics crate label format.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        vec![("node", self.node.clone()), ("address", self.address.clone())]
    }

    /// Returns labels with additional key-value pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }

    /// Returns labels with an `opcode` label appended.
    pub fn with_opcode(&self, opcode: &str) -> Vec<(&'static str, String)> {
        self.with(&[("opcode", opcode.to_string())])
    }
}

/// Describes all metrics emitted by the node.
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
