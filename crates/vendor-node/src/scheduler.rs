//! Periodic purge and node details announcement.
//!
//! The scheduler is polled by the node runtime with the current time. When
//! the cycle is due it purges stale directory entries, broadcasts the local
//! node record and reschedules itself one interval later, whether or not the
//! broadcast succeeded.

use crate::directory::{NodeDirectory, DEFAULT_NODE_MAX_AGE};
use crate::error::VendorError;
use crate::server::StatusSender;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vendor_metrics::{metric_defs, MetricLabels};
use vendor_protocol::{NodeRecord, SerialNumber, VendorMessage};

/// Default time between announcements.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default upper bound of the random start-up delay.
pub const DEFAULT_PUBLISH_JITTER: Duration = Duration::from_secs(100);

// ============================================================================
// Delayed Work
// ============================================================================

/// A single deadline that can be scheduled, rescheduled and cancelled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayedWork {
    deadline: Option<Duration>,
}

impl DelayedWork {
    /// Schedule `delay` from `now` unless already pending.
    ///
    /// Returns `false` when the work was already pending.
    pub fn schedule_after(&mut self, now: Duration, delay: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(now + delay);
        true
    }

    /// Replace any pending deadline with `now + delay`.
    pub fn reschedule(&mut self, now: Duration, delay: Duration) {
        self.deadline = Some(now + delay);
    }

    /// Drop the pending deadline.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is pending.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// The pending deadline.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Time left until the deadline; zero when overdue.
    pub fn remaining(&self, now: Duration) -> Option<Duration> {
        self.deadline.map(|deadline| deadline.saturating_sub(now))
    }

    /// Consume the deadline if it has passed.
    pub fn take_due(&mut self, now: Duration) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// Publish Scheduler
// ============================================================================

/// Scheduler timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// Entries older than this are purged each cycle.
    pub max_age: Duration,
    /// Upper bound of the random delay before the first cycle.
    pub jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            interval: DEFAULT_PUBLISH_INTERVAL,
            max_age: DEFAULT_NODE_MAX_AGE,
            jitter: DEFAULT_PUBLISH_JITTER,
        }
    }
}

/// Result of one scheduler cycle.
#[derive(Debug)]
pub struct CycleOutcome {
    /// Entries removed by the purge.
    pub purged: usize,
    /// Outcome of the announcement.
    pub published: Result<(), VendorError>,
    /// When the next cycle is due.
    pub next: Duration,
}

/// Purges the directory and announces the local node on a fixed period.
pub struct PublishScheduler {
    local: NodeRecord,
    work: DelayedWork,
    config: SchedulerConfig,
    rng: ChaCha8Rng,
    directory: Arc<Mutex<NodeDirectory>>,
    sender: StatusSender,
    labels: MetricLabels,
}

impl PublishScheduler {
    /// Create an idle scheduler. Call [`start`](Self::start) to arm it.
    pub fn new(
        local: NodeRecord,
        config: SchedulerConfig,
        directory: Arc<Mutex<NodeDirectory>>,
        sender: StatusSender,
        labels: MetricLabels,
    ) -> Self {
        PublishScheduler {
            local,
            work: DelayedWork::default(),
            config,
            rng: ChaCha8Rng::from_entropy(),
            directory,
            sender,
            labels,
        }
    }

    /// Use a seeded generator for the start-up delay.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Arm the first cycle after a random delay in `[0, jitter]`.
    ///
    /// Returns the chosen delay.
    pub fn start(&mut self, now: Duration) -> Duration {
        let jitter_ms = self.config.jitter.as_millis() as u64;
        let delay = Duration::from_millis(self.rng.gen_range(0..=jitter_ms));
        if self.work.schedule_after(now, delay) {
            debug!("first node details publish in {:?}", delay);
        }
        delay
    }

    /// Stop scheduling cycles.
    pub fn stop(&mut self) {
        self.work.cancel();
    }

    /// When the next cycle is due.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.work.deadline()
    }

    /// Time until the next cycle.
    pub fn remaining(&self, now: Duration) -> Option<Duration> {
        self.work.remaining(now)
    }

    /// The record this node announces.
    pub fn local_record(&self) -> &NodeRecord {
        &self.local
    }

    /// Replace the serial number, e.g. after a settings change.
    pub fn set_serial(&mut self, serial: SerialNumber) {
        info!("local serial number set to {}", serial);
        self.local.serial_number = serial;
    }

    /// Update the capacity and quality the node announces.
    pub fn set_link_metrics(&mut self, capacity: u8, quality: u8) {
        self.local.capacity = capacity;
        self.local.quality = quality;
    }

    /// Run the cycle if it is due.
    pub fn poll(&mut self, now: Duration) -> Option<CycleOutcome> {
        if self.work.take_due(now) {
            Some(self.run_cycle(now))
        } else {
            None
        }
    }

    /// Purge, publish and reschedule, regardless of the deadline.
    pub fn run_cycle(&mut self, now: Duration) -> CycleOutcome {
        let purged = {
            let mut directory = self.directory.lock();
            let purged = directory.purge(now, self.config.max_age);
            metrics::gauge!(metric_defs::DIRECTORY_ENTRIES.name, &self.labels.to_labels())
                .set(directory.len() as f64);
            purged
        };
        if purged > 0 {
            info!("purged {} stale directory entries", purged);
            metrics::counter!(metric_defs::DIRECTORY_PURGED.name, &self.labels.to_labels())
                .increment(purged as u64);
        }

        let published = self.publish();
        match &published {
            Ok(()) => metrics::counter!(
                metric_defs::SCHEDULER_PUBLISHES.name,
                &self.labels.to_labels()
            )
            .increment(1),
            Err(e) => {
                warn!("node details publish skipped: {}", e);
                metrics::counter!(
                    metric_defs::SCHEDULER_PUBLISH_SKIPPED.name,
                    &self.labels.to_labels()
                )
                .increment(1);
            }
        }

        self.work.reschedule(now, self.config.interval);
        CycleOutcome {
            purged,
            published,
            next: now + self.config.interval,
        }
    }

    /// Broadcast the local record once.
    pub fn publish(&self) -> Result<(), VendorError> {
        if !self.sender.is_provisioned() {
            return Err(VendorError::not_ready("node is not provisioned"));
        }
        if self.local.serial_number.is_empty() {
            return Err(VendorError::not_ready("serial number is not configured"));
        }

        debug!(
            "publishing node details serial={} addr={}",
            self.local.serial_number, self.local.mesh_address
        );
        self.sender
            .send(None, &VendorMessage::StatusNodeDetails(self.local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InboundFrame, LoopbackMesh, LoopbackPort};
    use crossbeam_channel::Receiver;
    use vendor_protocol::MeshAddress;

    const LOCAL: MeshAddress = MeshAddress(0x0001);

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    struct Fixture {
        scheduler: PublishScheduler,
        port: Arc<LoopbackPort>,
        directory: Arc<Mutex<NodeDirectory>>,
        peer_rx: Receiver<InboundFrame>,
    }

    fn fixture(serial: u64) -> Fixture {
        let mesh = LoopbackMesh::new();
        let (port, _rx) = mesh.attach(LOCAL, MeshAddress(0xC000));
        let (_peer, peer_rx) = mesh.attach(MeshAddress(0x0002), MeshAddress(0xC000));
        let directory = Arc::new(Mutex::new(NodeDirectory::new(4)));
        let scheduler = PublishScheduler::new(
            NodeRecord::new(serial, LOCAL, 9, 8),
            SchedulerConfig::default(),
            directory.clone(),
            StatusSender::new(port.clone()),
            MetricLabels::new("test", LOCAL.0),
        )
        .with_seed(7);
        Fixture {
            scheduler,
            port,
            directory,
            peer_rx,
        }
    }

    #[test]
    fn test_delayed_work() {
        let mut work = DelayedWork::default();
        assert!(work.schedule_after(secs(0), secs(10)));
        assert!(!work.schedule_after(secs(0), secs(1)));
        assert_eq!(work.deadline(), Some(secs(10)));

        work.reschedule(secs(5), secs(1));
        assert_eq!(work.remaining(secs(5)), Some(secs(1)));
        assert!(!work.take_due(secs(5)));
        assert!(work.take_due(secs(6)));
        assert!(!work.is_pending());

        work.reschedule(secs(0), secs(1));
        work.cancel();
        assert!(!work.take_due(secs(100)));
    }

    #[test]
    fn test_start_delay_within_jitter() {
        for seed in 0..20 {
            let mut fx = fixture(1);
            fx.scheduler = fx.scheduler.with_seed(seed);
            let delay = fx.scheduler.start(secs(50));
            assert!(delay <= DEFAULT_PUBLISH_JITTER);
            assert_eq!(fx.scheduler.next_deadline(), Some(secs(50) + delay));
        }
    }

    #[test]
    fn test_seeded_start_is_deterministic() {
        let mut a = fixture(1);
        let mut b = fixture(1);
        assert_eq!(a.scheduler.start(secs(0)), b.scheduler.start(secs(0)));
    }

    #[test]
    fn test_cycle_purges_publishes_and_reschedules() {
        let mut fx = fixture(0x1234);
        fx.directory
            .lock()
            .upsert(NodeRecord::new(5u64, 5, 0, 0), secs(0))
            .unwrap();

        let delay = fx.scheduler.start(secs(0));
        if !delay.is_zero() {
            assert!(fx.scheduler.poll(delay - Duration::from_millis(1)).is_none());
        }

        let now = secs(3601);
        let outcome = fx.scheduler.poll(now).unwrap();
        assert_eq!(outcome.purged, 1);
        assert!(outcome.published.is_ok());
        assert_eq!(outcome.next, now + DEFAULT_PUBLISH_INTERVAL);
        assert_eq!(fx.scheduler.next_deadline(), Some(outcome.next));

        let frame = fx.peer_rx.try_recv().unwrap();
        assert_eq!(
            VendorMessage::decode(&frame.data).unwrap(),
            VendorMessage::StatusNodeDetails(NodeRecord::new(0x1234u64, LOCAL, 9, 8))
        );

        // Not due again until the next interval.
        assert!(fx.scheduler.poll(now + secs(1)).is_none());
    }

    #[test]
    fn test_unprovisioned_publish_does_not_break_schedule() {
        let mut fx = fixture(0x1234);
        fx.port.set_provisioned(false);

        let outcome = fx.scheduler.run_cycle(secs(10));
        assert!(matches!(outcome.published, Err(VendorError::NotReady(_))));
        assert_eq!(fx.scheduler.next_deadline(), Some(secs(10) + DEFAULT_PUBLISH_INTERVAL));
        assert!(fx.peer_rx.try_recv().is_err());

        fx.port.set_provisioned(true);
        let outcome = fx.scheduler.poll(secs(10) + DEFAULT_PUBLISH_INTERVAL).unwrap();
        assert!(outcome.published.is_ok());
    }

    #[test]
    fn test_unconfigured_serial_not_published() {
        let mut fx = fixture(0);
        assert!(matches!(fx.scheduler.publish(), Err(VendorError::NotReady(_))));

        fx.scheduler.set_serial(SerialNumber(77));
        fx.scheduler.set_link_metrics(1, 2);
        fx.scheduler.publish().unwrap();

        let frame = fx.peer_rx.try_recv().unwrap();
        match VendorMessage::decode(&frame.data).unwrap() {
            VendorMessage::StatusNodeDetails(record) => {
                assert_eq!(record.serial_number, SerialNumber(77));
                assert_eq!((record.capacity, record.quality), (1, 2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
