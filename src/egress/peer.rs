//! One outbound link
//!
//! An [`EgressPeer`] owns a sender context and a housekeeping thread that
//! drives it. Statistics pushed by the context update the peer's latest
//! quality sample and, when attached, its feedback controller.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::transport::{EgressBackend, EgressContext, StatsCallback};
use crate::constants::{DEFAULT_STATS_INTERVAL_MS, EGRESS_STREAM_ID, HOUSEKEEPING_INTERVAL};
use crate::error::EgressError;
use crate::feedback::FeedbackController;
use crate::stats::{QualitySample, TransportStats};

type SharedContext = Arc<Mutex<Option<Box<dyn EgressContext>>>>;

/// Per-peer transport options
#[derive(Debug, Clone)]
pub struct EgressOptions {
    /// URL scheme used to address the peer
    pub scheme: String,
    pub stats_interval: Duration,
    pub housekeeping_interval: Duration,
}

impl Default for EgressOptions {
    fn default() -> Self {
        Self {
            scheme: "rist".to_string(),
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            housekeeping_interval: HOUSEKEEPING_INTERVAL,
        }
    }
}

/// Egress statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct EgressStats {
    pub units_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub samples_received: u64,
}

/// State shared with the statistics callback
#[derive(Default)]
struct PeerShared {
    feedback: Mutex<Option<Arc<FeedbackController>>>,
    latest: Mutex<Option<QualitySample>>,
    units_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    samples_received: AtomicU64,
}

impl PeerShared {
    fn on_stats(&self, stats: &TransportStats) {
        let Some(sample) = stats.sender_sample() else {
            return;
        };

        self.samples_received.fetch_add(1, Ordering::Relaxed);
        *self.latest.lock() = Some(sample);

        let feedback = self.feedback.lock().clone();
        if let Some(feedback) = feedback {
            // Failures are counted and logged by the controller
            let _ = feedback.process_stats(sample.bitrate_avg, sample.packet_loss, sample.rtt_ms);
        }
    }
}

/// Outbound link to one remote peer
pub struct EgressPeer {
    dst_host: String,
    dst_port: u16,
    backend: Arc<dyn EgressBackend>,
    options: EgressOptions,
    context: SharedContext,
    shared: Arc<PeerShared>,
    cancel: CancellationToken,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EgressPeer {
    pub fn new(dst_host: impl Into<String>, dst_port: u16, backend: Arc<dyn EgressBackend>) -> Self {
        Self {
            dst_host: dst_host.into(),
            dst_port,
            backend,
            options: EgressOptions::default(),
            context: Arc::new(Mutex::new(None)),
            shared: Arc::new(PeerShared::default()),
            cancel: CancellationToken::new(),
            thread_handle: Mutex::new(None),
        }
    }

    pub fn with_options(mut self, options: EgressOptions) -> Self {
        self.options = options;
        self
    }

    /// Stop the housekeeping thread when `parent` is cancelled
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// `scheme://host:port`
    pub fn url(&self) -> String {
        if self.dst_host.contains(':') {
            format!("{}://[{}]:{}", self.options.scheme, self.dst_host, self.dst_port)
        } else {
            format!("{}://{}:{}", self.options.scheme, self.dst_host, self.dst_port)
        }
    }

    /// Create the context, register statistics, connect the peer and start
    /// housekeeping. Anything acquired before a failure is released.
    pub fn init(&self) -> Result<(), EgressError> {
        if self.context.lock().is_some() {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(EgressError::PeerInit("peer has been shut down".into()));
        }

        let url = self.url();
        let mut ctx = self.backend.create_context()?;

        let shared = Arc::clone(&self.shared);
        let callback: StatsCallback = Arc::new(move |stats: &TransportStats| shared.on_stats(stats));
        ctx.set_stats_callback(self.options.stats_interval, callback)?;

        if let Err(e) = ctx.create_peer(&url) {
            tracing::error!("Failed to create egress peer {}: {}", url, e);
            ctx.destroy_peer();
            return Err(e);
        }

        *self.context.lock() = Some(ctx);

        let context = Arc::clone(&self.context);
        let cancel = self.cancel.clone();
        let interval = self.options.housekeeping_interval;
        let spawned = thread::Builder::new()
            .name(format!("egress-{}", self.dst_port))
            .spawn(move || {
                while !cancel.is_cancelled() {
                    if let Some(ctx) = context.lock().as_mut() {
                        if let Err(e) = ctx.housekeeping() {
                            tracing::warn!("Egress housekeeping failed: {}", e);
                        }
                    }
                    thread::sleep(interval);
                }
            });

        match spawned {
            Ok(handle) => {
                *self.thread_handle.lock() = Some(handle);
                tracing::info!("Egress peer initialized for {}", url);
                Ok(())
            }
            Err(e) => {
                if let Some(mut ctx) = self.context.lock().take() {
                    ctx.destroy_peer();
                }
                Err(EgressError::PeerInit(e.to_string()))
            }
        }
    }

    /// Submit one data unit; never buffers or retries
    pub fn send_data(&self, data: &[u8]) -> Result<(), EgressError> {
        let mut guard = self.context.lock();
        let ctx = guard.as_mut().ok_or(EgressError::NotInitialized)?;

        match ctx.write(data, EGRESS_STREAM_ID) {
            Ok(_) => {
                self.shared.units_sent.fetch_add(1, Ordering::Relaxed);
                self.shared.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Egress send to {}:{} failed: {}", self.dst_host, self.dst_port, e);
                Err(e)
            }
        }
    }

    /// Attach the controller that receives this peer's quality samples
    pub fn set_feedback_callback(&self, feedback: Arc<FeedbackController>) {
        *self.shared.feedback.lock() = Some(feedback);
    }

    /// Most recent sample; zeros until the first statistics record
    pub fn latest_sample(&self) -> QualitySample {
        self.shared.latest.lock().unwrap_or_default()
    }

    pub fn has_sample(&self) -> bool {
        self.shared.latest.lock().is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.context.lock().is_some()
    }

    pub fn destination(&self) -> (&str, u16) {
        (&self.dst_host, self.dst_port)
    }

    /// Get statistics
    pub fn stats(&self) -> EgressStats {
        EgressStats {
            units_sent: self.shared.units_sent.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.shared.send_errors.load(Ordering::Relaxed),
            samples_received: self.shared.samples_received.load(Ordering::Relaxed),
        }
    }

    /// Stop housekeeping, destroy the peer, then release the context.
    /// Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }

        if let Some(mut ctx) = self.context.lock().take() {
            ctx.destroy_peer();
            tracing::debug!("Egress peer {}:{} torn down", self.dst_host, self.dst_port);
        }
    }
}

impl Drop for EgressPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackSink;
    use crate::stats::SenderPeerStats;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct MockLog {
        contexts_created: AtomicU64,
        contexts_dropped: AtomicU64,
        peers_destroyed: AtomicU64,
        writes: Mutex<Vec<(Vec<u8>, u16)>>,
        callback: Mutex<Option<StatsCallback>>,
        urls: Mutex<Vec<String>>,
    }

    struct MockBackend {
        log: Arc<MockLog>,
        fail_peer: bool,
        fail_write: Arc<AtomicBool>,
    }

    struct MockContext {
        log: Arc<MockLog>,
        fail_peer: bool,
        fail_write: Arc<AtomicBool>,
    }

    impl Drop for MockContext {
        fn drop(&mut self) {
            self.log.contexts_dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl EgressBackend for MockBackend {
        fn create_context(&self) -> Result<Box<dyn EgressContext>, EgressError> {
            self.log.contexts_created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockContext {
                log: Arc::clone(&self.log),
                fail_peer: self.fail_peer,
                fail_write: Arc::clone(&self.fail_write),
            }))
        }
    }

    impl EgressContext for MockContext {
        fn set_stats_callback(&mut self, _interval: Duration, callback: StatsCallback) -> Result<(), EgressError> {
            *self.log.callback.lock() = Some(callback);
            Ok(())
        }

        fn create_peer(&mut self, url: &str) -> Result<(), EgressError> {
            self.log.urls.lock().push(url.to_string());
            if self.fail_peer {
                Err(EgressError::PeerInit("connection refused".into()))
            } else {
                Ok(())
            }
        }

        fn housekeeping(&mut self) -> Result<(), EgressError> {
            Ok(())
        }

        fn write(&mut self, data: &[u8], stream_id: u16) -> Result<usize, EgressError> {
            if self.fail_write.load(Ordering::SeqCst) {
                return Err(EgressError::Send("queue full".into()));
            }
            self.log.writes.lock().push((data.to_vec(), stream_id));
            Ok(data.len())
        }

        fn destroy_peer(&mut self) {
            self.log.peers_destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mock(fail_peer: bool) -> (Arc<dyn EgressBackend>, Arc<MockLog>, Arc<AtomicBool>) {
        let log = Arc::new(MockLog::default());
        let fail_write = Arc::new(AtomicBool::new(false));
        let backend = MockBackend {
            log: Arc::clone(&log),
            fail_peer,
            fail_write: Arc::clone(&fail_write),
        };
        (Arc::new(backend), log, fail_write)
    }

    struct CountingSink(Arc<AtomicU64>);

    impl FeedbackSink for CountingSink {
        fn send(&mut self, message: &[u8]) -> std::io::Result<usize> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(message.len())
        }
    }

    fn push_stats(log: &MockLog, stats: TransportStats) {
        let callback = log.callback.lock().clone().unwrap();
        callback(&stats);
    }

    #[test]
    fn test_send_before_init_fails() {
        let (backend, log, _) = mock(false);
        let peer = EgressPeer::new("203.0.113.1", 8000, backend);

        assert!(matches!(peer.send_data(b"ts"), Err(EgressError::NotInitialized)));
        assert_eq!(log.contexts_created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_init_and_send_on_stream_zero() {
        let (backend, log, _) = mock(false);
        let peer = EgressPeer::new("203.0.113.1", 8000, backend);

        peer.init().unwrap();
        assert!(peer.is_initialized());
        assert_eq!(log.urls.lock()[0], "rist://203.0.113.1:8000");

        peer.send_data(b"unit-1").unwrap();
        peer.send_data(b"unit-2").unwrap();

        let writes = log.writes.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0], (b"unit-1".to_vec(), 0));
        assert_eq!(peer.stats().units_sent, 2);
        assert_eq!(peer.stats().bytes_sent, 12);
    }

    #[test]
    fn test_partial_init_failure_releases_context() {
        let (backend, log, _) = mock(true);
        let peer = EgressPeer::new("203.0.113.1", 8000, backend);

        assert!(matches!(peer.init(), Err(EgressError::PeerInit(_))));
        assert!(!peer.is_initialized());
        assert_eq!(log.contexts_created.load(Ordering::SeqCst), 1);
        assert_eq!(log.contexts_dropped.load(Ordering::SeqCst), 1);

        // Teardown after a failed init is a no-op
        peer.shutdown();
        assert_eq!(log.contexts_dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (backend, log, _) = mock(false);
        let peer = EgressPeer::new("203.0.113.1", 8000, backend);
        peer.init().unwrap();

        peer.shutdown();
        peer.shutdown();
        drop(peer);

        assert_eq!(log.peers_destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(log.contexts_dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_failure_reported_not_retried() {
        let (backend, log, fail_write) = mock(false);
        let peer = EgressPeer::new("203.0.113.1", 8000, backend);
        peer.init().unwrap();

        fail_write.store(true, Ordering::SeqCst);
        assert!(matches!(peer.send_data(b"x"), Err(EgressError::Send(_))));
        assert!(log.writes.lock().is_empty());
        assert_eq!(peer.stats().send_errors, 1);
    }

    #[test]
    fn test_stats_update_sample_and_feedback() {
        let (backend, log, _) = mock(false);
        let peer = EgressPeer::new("203.0.113.1", 8000, backend);
        peer.init().unwrap();

        // No controller attached yet
        push_stats(
            &log,
            TransportStats::SenderPeer(SenderPeerStats { bitrate_avg: 3000, quality: 1.5, rtt: 30 }),
        );
        assert_eq!(peer.latest_sample(), QualitySample::new(3000, 1.5, 30));

        let sends = Arc::new(AtomicU64::new(0));
        let feedback = Arc::new(FeedbackController::with_sink(
            500,
            5000,
            "192.168.1.50",
            Box::new(CountingSink(Arc::clone(&sends))),
        ));
        peer.set_feedback_callback(Arc::clone(&feedback));

        push_stats(
            &log,
            TransportStats::SenderPeer(SenderPeerStats { bitrate_avg: 3000, quality: 1.5, rtt: 30 }),
        );
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(feedback.last_sent().bitrate_hint, 3000);

        // Receiver-flow records are ignored
        push_stats(&log, TransportStats::ReceiverFlow(Default::default()));
        assert_eq!(peer.stats().samples_received, 2);
    }

    #[test]
    fn test_no_sample_reads_as_zero() {
        let (backend, _log, _) = mock(false);
        let peer = EgressPeer::new("203.0.113.1", 8000, backend);
        assert!(!peer.has_sample());
        assert_eq!(peer.latest_sample(), QualitySample::default());
    }

    #[test]
    fn test_parent_cancellation_stops_housekeeping() {
        let (backend, log, _) = mock(false);
        let parent = CancellationToken::new();
        let peer = EgressPeer::new("::1", 8000, backend).with_cancellation(&parent);
        peer.init().unwrap();
        assert_eq!(log.urls.lock()[0], "rist://[::1]:8000");

        parent.cancel();
        peer.shutdown();
        assert!(!peer.is_initialized());
        assert!(peer.init().is_err());
    }
}
