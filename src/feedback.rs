//! Bitrate feedback to the upstream encoder
//!
//! Turns link-quality samples into bitrate hints and sends them to the
//! encoder as an HTTP-GET control request over UDP. Sends are suppressed
//! unless the sample moved far enough from what was last communicated.

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::constants::{FEEDBACK_BITRATE_THRESHOLD_KBPS, FEEDBACK_LOSS_THRESHOLD, FEEDBACK_RTT_THRESHOLD_MS};
use crate::error::FeedbackError;

/// Destination for rendered feedback messages
pub trait FeedbackSink: Send {
    fn send(&mut self, message: &[u8]) -> std::io::Result<usize>;
}

/// Best-effort UDP sink; no response is read
pub struct UdpFeedbackSink {
    socket: Option<UdpSocket>,
    target: SocketAddr,
}

impl UdpFeedbackSink {
    /// Create the sink. A socket that cannot be created is logged and every
    /// later send fails, so failures still reach the failure counter.
    pub fn new(target: SocketAddr) -> Self {
        let socket = match Self::create_socket(target) {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::error!("Failed to create feedback socket: {}", e);
                None
            }
        };
        Self { socket, target }
    }

    fn create_socket(target: SocketAddr) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        let local: SocketAddr = match target {
            SocketAddr::V4(_) => (IpAddr::from([0u8; 4]), 0).into(),
            SocketAddr::V6(_) => (IpAddr::from([0u16; 8]), 0).into(),
        };
        socket.bind(&local.into())?;
        Ok(socket.into())
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl FeedbackSink for UdpFeedbackSink {
    fn send(&mut self, message: &[u8]) -> std::io::Result<usize> {
        match &self.socket {
            Some(socket) => socket.send_to(message, self.target),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "Feedback socket not initialized",
            )),
        }
    }
}

/// Suggested bitrate for the current link conditions
///
/// Loss above 5% cuts hard, loss above 2% cuts gently, a clean short link
/// grows by 10%, anything else holds.
pub fn calculate_bitrate_hint(current_bitrate: u32, packet_loss: f32, rtt_ms: u32) -> u32 {
    let current = f64::from(current_bitrate);
    if packet_loss > 5.0 {
        (current * 0.7) as u32
    } else if packet_loss > 2.0 {
        (current * 0.9) as u32
    } else if packet_loss < 0.1 && rtt_ms < 50 {
        (current * 1.1) as u32
    } else {
        current_bitrate
    }
}

/// Clamp a bitrate into `[min, max]`
pub fn clamp_bitrate(bitrate: u32, min: u32, max: u32) -> u32 {
    if bitrate < min {
        min
    } else if bitrate > max {
        max
    } else {
        bitrate
    }
}

/// Last values successfully communicated to the encoder
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SentFeedback {
    pub bitrate_hint: u32,
    pub packet_loss: f32,
    pub rtt_ms: u32,
}

struct FeedbackState {
    sink: Box<dyn FeedbackSink>,
    last: SentFeedback,
}

/// Rate-hint controller with hysteresis
pub struct FeedbackController {
    min_bitrate: u32,
    max_bitrate: u32,
    host: String,
    state: Mutex<FeedbackState>,
    failure_count: AtomicU32,
}

impl FeedbackController {
    /// Controller sending to the encoder at `endpoint` over UDP
    pub fn new(min_bitrate: u32, max_bitrate: u32, endpoint: SocketAddr) -> Self {
        Self::with_sink(
            min_bitrate,
            max_bitrate,
            endpoint.ip().to_string(),
            Box::new(UdpFeedbackSink::new(endpoint)),
        )
    }

    /// Controller writing to a custom sink; `host` fills the Host header
    pub fn with_sink(
        min_bitrate: u32,
        max_bitrate: u32,
        host: impl Into<String>,
        sink: Box<dyn FeedbackSink>,
    ) -> Self {
        Self {
            min_bitrate,
            max_bitrate,
            host: host.into(),
            state: Mutex::new(FeedbackState {
                sink,
                last: SentFeedback::default(),
            }),
            failure_count: AtomicU32::new(0),
        }
    }

    /// Process one quality sample
    ///
    /// Returns `Ok(true)` if a hint was sent, `Ok(false)` if suppressed.
    pub fn process_stats(&self, bitrate_avg: u32, packet_loss: f32, rtt_ms: u32) -> Result<bool, FeedbackError> {
        let mut state = self.state.lock();

        let hint = calculate_bitrate_hint(bitrate_avg, packet_loss, rtt_ms);
        let hint = clamp_bitrate(hint, self.min_bitrate, self.max_bitrate);

        let last = state.last;
        let should_send = (last.packet_loss - packet_loss).abs() >= FEEDBACK_LOSS_THRESHOLD
            || (i64::from(last.rtt_ms) - i64::from(rtt_ms)).abs() >= FEEDBACK_RTT_THRESHOLD_MS
            || (i64::from(last.bitrate_hint) - i64::from(hint)).abs() >= FEEDBACK_BITRATE_THRESHOLD_KBPS;

        if !should_send {
            tracing::trace!(hint, packet_loss, rtt_ms, "Feedback suppressed");
            return Ok(false);
        }

        let message = self.render_request(hint);
        match state.sink.send(message.as_bytes()) {
            Ok(_) => {
                self.failure_count.store(0, Ordering::Relaxed);
                state.last = SentFeedback {
                    bitrate_hint: hint,
                    packet_loss,
                    rtt_ms,
                };
                tracing::info!(
                    "Sent feedback to encoder - bitrate_hint: {} kbps, packet_loss: {:.2}%, rtt_ms: {}",
                    hint,
                    packet_loss,
                    rtt_ms
                );
                Ok(true)
            }
            Err(e) => {
                let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!(failures, "Failed to send feedback: {}", e);
                Err(FeedbackError::Send(e.to_string()))
            }
        }
    }

    fn render_request(&self, bitrate_hint_kbps: u32) -> String {
        format!(
            "GET /ctrl/stream_setting?index=stream1&width=1920&height=1080&bitrate={} HTTP/1.1\r\nHost: {}\r\n\r\n",
            u64::from(bitrate_hint_kbps) * 1000,
            self.host
        )
    }

    /// Consecutive failed sends since the last success
    pub fn get_failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    /// Values last sent successfully
    pub fn last_sent(&self) -> SentFeedback {
        self.state.lock().last
    }

    pub fn min_bitrate(&self) -> u32 {
        self.min_bitrate
    }

    pub fn max_bitrate(&self) -> u32 {
        self.max_bitrate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<String>>>,
        fail: Arc<AtomicBool>,
    }

    impl FeedbackSink for RecordingSink {
        fn send(&mut self, message: &[u8]) -> std::io::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "unreachable"));
            }
            self.sent.lock().push(String::from_utf8_lossy(message).into_owned());
            Ok(message.len())
        }
    }

    fn controller(min: u32, max: u32) -> (FeedbackController, RecordingSink) {
        let sink = RecordingSink::default();
        let ctrl = FeedbackController::with_sink(min, max, "192.168.1.50", Box::new(sink.clone()));
        (ctrl, sink)
    }

    #[test]
    fn test_hysteresis_suppression() {
        let (ctrl, sink) = controller(500, 5000);

        assert!(ctrl.process_stats(2000, 1.0, 40).unwrap());
        assert!(!ctrl.process_stats(2000, 1.05, 41).unwrap());
        assert!(ctrl.process_stats(2000, 1.2, 41).unwrap());

        assert_eq!(sink.sent.lock().len(), 2);
    }

    #[test]
    fn test_rtt_and_bitrate_deltas_trigger_send() {
        let (ctrl, _sink) = controller(500, 5000);
        assert!(ctrl.process_stats(2000, 1.0, 40).unwrap());

        // RTT moved by exactly the threshold
        assert!(ctrl.process_stats(2000, 1.0, 45).unwrap());

        // Hint moved by 100 kbps
        assert!(ctrl.process_stats(2100, 1.0, 45).unwrap());
        assert_eq!(ctrl.last_sent().bitrate_hint, 2100);
    }

    #[test]
    fn test_request_format_uses_bits_per_second() {
        let (ctrl, sink) = controller(500, 5000);
        ctrl.process_stats(3000, 1.0, 60).unwrap();

        let sent = sink.sent.lock();
        assert_eq!(
            sent[0],
            "GET /ctrl/stream_setting?index=stream1&width=1920&height=1080&bitrate=3000000 HTTP/1.1\r\nHost: 192.168.1.50\r\n\r\n"
        );
    }

    #[test]
    fn test_last_sent_tracks_clamped_hint() {
        let (ctrl, _sink) = controller(500, 5000);
        // 10000 * 1.1 clamps to 5000
        ctrl.process_stats(10_000, 0.0, 10).unwrap();

        let last = ctrl.last_sent();
        assert_eq!(last.bitrate_hint, 5000);
        assert_eq!(last.rtt_ms, 10);
    }

    #[test]
    fn test_failure_keeps_baseline_and_counts() {
        let (ctrl, sink) = controller(500, 5000);
        ctrl.process_stats(2000, 1.0, 40).unwrap();

        sink.fail.store(true, Ordering::SeqCst);
        assert!(ctrl.process_stats(2000, 3.0, 40).is_err());
        assert!(ctrl.process_stats(2000, 3.0, 40).is_err());
        assert_eq!(ctrl.get_failure_count(), 2);
        assert_eq!(ctrl.last_sent().packet_loss, 1.0);

        // Same sample is still compared against the old baseline
        sink.fail.store(false, Ordering::SeqCst);
        assert!(ctrl.process_stats(2000, 3.0, 40).unwrap());
        assert_eq!(ctrl.get_failure_count(), 0);
        assert_eq!(ctrl.last_sent().packet_loss, 3.0);
    }

    #[test]
    fn test_udp_sink_delivers_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let target = receiver.local_addr().unwrap();

        let ctrl = FeedbackController::new(500, 5000, target);
        assert!(ctrl.process_stats(2000, 1.0, 40).unwrap());

        let mut buf = [0u8; 512];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..len]);
        assert!(text.contains("bitrate=2000000"));
        assert!(text.contains("Host: 127.0.0.1"));
    }

    #[test]
    fn test_policy_boundaries() {
        assert_eq!(calculate_bitrate_hint(1000, 5.0, 100), 900);
        assert_eq!(calculate_bitrate_hint(1000, 5.01, 10), 700);
        assert_eq!(calculate_bitrate_hint(1000, 2.0, 100), 1000);
        assert_eq!(calculate_bitrate_hint(1000, 0.05, 50), 1000);
        assert_eq!(calculate_bitrate_hint(1000, 0.05, 49), 1100);
    }

    proptest! {
        #[test]
        fn prop_hint_policy(current in 1u32..1_000_000, loss in 0.0f32..100.0, rtt in 0u32..1000) {
            let hint = calculate_bitrate_hint(current, loss, rtt);
            let c = f64::from(current);
            let expected = if loss > 5.0 {
                (c * 0.7) as u32
            } else if loss > 2.0 {
                (c * 0.9) as u32
            } else if loss < 0.1 && rtt < 50 {
                (c * 1.1) as u32
            } else {
                current
            };
            prop_assert_eq!(hint, expected);
        }

        #[test]
        fn prop_heavy_loss_cuts_to_seventy_percent(current in 1u32..1_000_000, loss in 5.001f32..100.0, rtt in 0u32..1000) {
            prop_assert_eq!(calculate_bitrate_hint(current, loss, rtt), (f64::from(current) * 0.7) as u32);
        }

        #[test]
        fn prop_clamp_in_range_and_idempotent(b in any::<u32>(), min in 0u32..10_000, span in 0u32..10_000) {
            let max = min + span;
            let once = clamp_bitrate(b, min, max);
            prop_assert!(once >= min && once <= max);
            prop_assert_eq!(clamp_bitrate(once, min, max), once);
        }
    }
}
