//! Path selection among egress peers
//!
//! Once per check interval the controller compares the latest quality
//! sample of every egress peer against the path-switch thresholds and, when
//! a different peer wins, repoints the ingest manager's active output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PathSwitchConfig;
use crate::constants::FAILOVER_CHECK_INTERVAL;
use crate::egress::EgressPeer;
use crate::error::IngestError;
use crate::stats::QualitySample;

/// Something whose active egress route can be replaced
pub trait ActiveOutput {
    fn set_active_output(&self, peer: Arc<EgressPeer>) -> Result<(), IngestError>;
}

/// Pick the peer to route through
///
/// First peer within both thresholds wins, in index order. When none
/// qualifies, the lowest-loss peer wins, starting from the active peer's
/// own loss; ties keep the earlier candidate.
pub fn select_best(samples: &[QualitySample], active_index: usize, max_packet_loss: f32, max_rtt_ms: u32) -> usize {
    let Some(active) = samples.get(active_index) else {
        return active_index;
    };

    let mut best = active_index;
    let mut best_loss = active.packet_loss;

    for (index, sample) in samples.iter().enumerate() {
        if sample.within(max_packet_loss, max_rtt_ms) {
            return index;
        }
        if sample.packet_loss < best_loss {
            best = index;
            best_loss = sample.packet_loss;
        }
    }

    best
}

/// Periodic failover procedure
pub struct FailoverController {
    config: PathSwitchConfig,
    active_index: usize,
    interval: Duration,
    last_check: Instant,
    switches: u64,
}

impl FailoverController {
    pub fn new(config: PathSwitchConfig) -> Self {
        Self {
            config,
            active_index: 0,
            interval: FAILOVER_CHECK_INTERVAL,
            last_check: Instant::now(),
            switches: 0,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    /// Number of switches performed so far
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Run one evaluation if the check interval has elapsed since the last one
    ///
    /// Returns the new active index when a switch happened.
    pub fn poll(&mut self, now: Instant, peers: &[Arc<EgressPeer>], target: &dyn ActiveOutput) -> Option<usize> {
        if now.saturating_duration_since(self.last_check) < self.interval {
            return None;
        }
        self.last_check = now;
        self.evaluate(peers, target)
    }

    /// Evaluate immediately, ignoring the check interval
    pub fn evaluate(&mut self, peers: &[Arc<EgressPeer>], target: &dyn ActiveOutput) -> Option<usize> {
        if peers.is_empty() {
            return None;
        }

        let samples: Vec<QualitySample> = peers.iter().map(|p| p.latest_sample()).collect();
        let best = select_best(
            &samples,
            self.active_index,
            self.config.max_packet_loss,
            self.config.max_rtt_ms,
        );
        if best == self.active_index {
            return None;
        }

        let previous = self.active_index;
        match target.set_active_output(Arc::clone(&peers[best])) {
            Ok(()) => {
                self.active_index = best;
                self.switches += 1;
                let sample = samples[best];
                tracing::info!(
                    "Switching to output {} (loss: {:.2}%, rtt: {} ms), was {}",
                    best,
                    sample.packet_loss,
                    sample.rtt_ms,
                    previous
                );
                Some(best)
            }
            Err(e) => {
                tracing::warn!("Failed to switch active output: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::{EgressBackend, EgressContext, StatsCallback};
    use crate::error::EgressError;
    use crate::stats::{SenderPeerStats, TransportStats};
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn q(loss: f32, rtt: u32) -> QualitySample {
        QualitySample::new(2000, loss, rtt)
    }

    #[test]
    fn test_first_fit_not_best_fit() {
        let samples = [q(3.0, 60), q(0.5, 20), q(0.2, 10)];
        assert_eq!(select_best(&samples, 0, 1.0, 30), 1);
    }

    #[test]
    fn test_lowest_loss_fallback() {
        let samples = [q(5.0, 100), q(3.0, 100), q(4.0, 100)];
        assert_eq!(select_best(&samples, 0, 1.0, 30), 1);
    }

    #[test]
    fn test_fallback_ties_keep_active() {
        let samples = [q(3.0, 100), q(3.0, 100)];
        assert_eq!(select_best(&samples, 0, 1.0, 30), 0);
        assert_eq!(select_best(&samples, 1, 1.0, 30), 1);
    }

    #[test]
    fn test_earlier_qualifier_preempts_active() {
        let samples = [q(0.5, 20), q(0.1, 5)];
        assert_eq!(select_best(&samples, 1, 1.0, 30), 0);
    }

    #[test]
    fn test_out_of_range_active_is_kept() {
        assert_eq!(select_best(&[], 0, 1.0, 30), 0);
    }

    proptest! {
        #[test]
        fn prop_selection_rules(
            raw in prop::collection::vec((0.0f32..10.0, 0u32..200), 1..8),
            active_seed in 0usize..8,
            max_loss in 0.0f32..5.0,
            max_rtt in 0u32..150,
        ) {
            let samples: Vec<QualitySample> = raw.iter().map(|&(l, r)| q(l, r)).collect();
            let active = active_seed % samples.len();
            let best = select_best(&samples, active, max_loss, max_rtt);

            prop_assert!(best < samples.len());
            match samples.iter().position(|s| s.within(max_loss, max_rtt)) {
                Some(first) => prop_assert_eq!(best, first),
                None => {
                    let min_loss = samples.iter().map(|s| s.packet_loss).fold(f32::INFINITY, f32::min);
                    prop_assert_eq!(samples[best].packet_loss, min_loss);
                }
            }
        }
    }

    struct StatsBackend(Arc<Mutex<Vec<StatsCallback>>>);
    struct StatsContext(Arc<Mutex<Vec<StatsCallback>>>);

    impl EgressBackend for StatsBackend {
        fn create_context(&self) -> Result<Box<dyn EgressContext>, EgressError> {
            Ok(Box::new(StatsContext(Arc::clone(&self.0))))
        }
    }

    impl EgressContext for StatsContext {
        fn set_stats_callback(&mut self, _interval: Duration, callback: StatsCallback) -> Result<(), EgressError> {
            self.0.lock().push(callback);
            Ok(())
        }
        fn create_peer(&mut self, _url: &str) -> Result<(), EgressError> {
            Ok(())
        }
        fn housekeeping(&mut self) -> Result<(), EgressError> {
            Ok(())
        }
        fn write(&mut self, data: &[u8], _stream_id: u16) -> Result<usize, EgressError> {
            Ok(data.len())
        }
        fn destroy_peer(&mut self) {}
    }

    #[derive(Default)]
    struct RecordingTarget {
        switched_to: Mutex<Vec<u16>>,
        fail: bool,
    }

    impl ActiveOutput for RecordingTarget {
        fn set_active_output(&self, peer: Arc<EgressPeer>) -> Result<(), IngestError> {
            if self.fail {
                return Err(IngestError::InvalidState("not multi".into()));
            }
            self.switched_to.lock().push(peer.destination().1);
            Ok(())
        }
    }

    fn peers(samples: &[(f32, u32)]) -> Vec<Arc<EgressPeer>> {
        let callbacks = Arc::new(Mutex::new(Vec::new()));
        let backend: Arc<dyn EgressBackend> = Arc::new(StatsBackend(Arc::clone(&callbacks)));
        let peers: Vec<Arc<EgressPeer>> = (0..samples.len())
            .map(|i| {
                let peer = EgressPeer::new("203.0.113.1", 8000 + i as u16, Arc::clone(&backend));
                peer.init().unwrap();
                Arc::new(peer)
            })
            .collect();

        for (callback, &(loss, rtt)) in callbacks.lock().iter().zip(samples) {
            callback(&TransportStats::SenderPeer(SenderPeerStats {
                bitrate_avg: 2000,
                quality: loss,
                rtt,
            }));
        }
        peers
    }

    fn config() -> PathSwitchConfig {
        PathSwitchConfig {
            enable: true,
            max_packet_loss: 1.0,
            max_rtt_ms: 30,
        }
    }

    #[test]
    fn test_evaluate_switches_and_records() {
        let peers = peers(&[(3.0, 60), (0.5, 20), (0.2, 10)]);
        let target = RecordingTarget::default();
        let mut failover = FailoverController::new(config());

        assert_eq!(failover.evaluate(&peers, &target), Some(1));
        assert_eq!(failover.active_index(), 1);
        assert_eq!(*target.switched_to.lock(), vec![8001]);

        // Stable once on the winner
        assert_eq!(failover.evaluate(&peers, &target), None);
        assert_eq!(failover.switches(), 1);
    }

    #[test]
    fn test_poll_respects_interval() {
        let peers = peers(&[(3.0, 60), (0.5, 20)]);
        let target = RecordingTarget::default();
        let mut failover = FailoverController::new(config()).with_interval(Duration::from_secs(1));
        let start = Instant::now();

        assert_eq!(failover.poll(start, &peers, &target), None);
        assert_eq!(failover.poll(start + Duration::from_millis(1100), &peers, &target), Some(1));
        assert!(target.switched_to.lock().len() == 1);
    }

    #[test]
    fn test_rejected_switch_keeps_index() {
        let peers = peers(&[(3.0, 60), (0.5, 20)]);
        let target = RecordingTarget {
            fail: true,
            ..Default::default()
        };
        let mut failover = FailoverController::new(config());

        assert_eq!(failover.evaluate(&peers, &target), None);
        assert_eq!(failover.active_index(), 0);
    }

    #[test]
    fn test_peers_without_samples_read_as_clean() {
        // Zeroed samples meet any non-negative threshold
        let callbacks = Arc::new(Mutex::new(Vec::new()));
        let backend: Arc<dyn EgressBackend> = Arc::new(StatsBackend(callbacks));
        let peers = vec![Arc::new(EgressPeer::new("203.0.113.1", 8000, backend))];
        let target = RecordingTarget::default();
        let mut failover = FailoverController::new(config());
        assert_eq!(failover.evaluate(&peers, &target), None);
    }
}
