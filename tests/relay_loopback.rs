//! End-to-end relay over loopback

use bytes::Bytes;
use futures::SinkExt;
use srt_tokio::SrtSocket;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use media_relay::config::{MultiRouteConfig, PathSwitchConfig, RelayConfig};
use media_relay::net::WanResolver;
use media_relay::relay::{Backends, Relay};

struct NoWan;

impl WanResolver for NoWan {
    fn wan_ips(&self) -> Vec<String> {
        Vec::new()
    }
}

fn egress_receiver() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

fn ingest_target(relay: &Relay) -> SocketAddr {
    let port = relay.ingest_addr().unwrap().port();
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Send `payload` to the relay and pump it until `receiver` sees it
fn relay_one(relay: &mut Relay, client: &UdpSocket, payload: &[u8], receiver: &UdpSocket) -> Option<Vec<u8>> {
    client.send_to(payload, ingest_target(relay)).unwrap();

    let mut buf = [0u8; 2048];
    for _ in 0..40 {
        relay.run_for(Duration::from_millis(20));
        if let Ok(len) = receiver.recv(&mut buf) {
            return Some(buf[..len].to_vec());
        }
    }
    None
}

fn base_config(json: &str) -> RelayConfig {
    let mut config: RelayConfig = serde_json::from_str(json).unwrap();
    config.feedback_ip = "127.0.0.1".to_string();
    config.feedback_port = 9;
    config
}

#[test]
fn test_listener_relays_datagrams() {
    let (receiver, port) = egress_receiver();
    let mut config = base_config(
        r#"{ "mode": "srt", "srt_mode": "listener", "listen_port": 0,
             "rist_dst": "127.0.0.1", "rist_port": 1,
             "min_bitrate": 500, "max_bitrate": 5000 }"#,
    );
    config.rist_port = port;
    config.validate().unwrap();

    let token = CancellationToken::new();
    let mut relay = Relay::from_config(&config, Backends::loopback().unwrap(), &NoWan, &token).unwrap();
    relay.start().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    assert_eq!(relay_one(&mut relay, &client, b"ts-packet-1", &receiver).as_deref(), Some(&b"ts-packet-1"[..]));
    assert_eq!(relay_one(&mut relay, &client, b"ts-packet-2", &receiver).as_deref(), Some(&b"ts-packet-2"[..]));

    assert_eq!(relay.outputs()[0].stats().units_sent, 2);
    relay.stop();
}

fn multi_relay(path_switch: bool) -> (Relay, UdpSocket, UdpSocket) {
    let (receiver_a, port_a) = egress_receiver();
    let (receiver_b, port_b) = egress_receiver();

    let mut config = base_config(
        r#"{ "mode": "srt", "srt_mode": "multi", "listen_port": 0,
             "min_bitrate": 500, "max_bitrate": 5000 }"#,
    );
    config.multi_routes = vec![
        MultiRouteConfig {
            interface_ip: "10.255.0.1".to_string(),
            rist_dst: "127.0.0.1".to_string(),
            rist_port: port_a,
        },
        MultiRouteConfig {
            interface_ip: "127.0.0.1".to_string(),
            rist_dst: "127.0.0.1".to_string(),
            rist_port: port_b,
        },
    ];
    config.path_switch = PathSwitchConfig {
        enable: path_switch,
        max_packet_loss: 1.0,
        max_rtt_ms: 100,
    };
    config.validate().unwrap();

    let token = CancellationToken::new();
    let mut relay = Relay::from_config(&config, Backends::loopback().unwrap(), &NoWan, &token).unwrap();
    relay.start().unwrap();
    (relay, receiver_a, receiver_b)
}

#[test]
fn test_multi_routes_by_binding() {
    let (mut relay, receiver_a, receiver_b) = multi_relay(false);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    // Caller address 127.0.0.1 matches the second route's binding
    assert!(relay_one(&mut relay, &client, b"bound", &receiver_b).is_some());

    let mut buf = [0u8; 64];
    assert!(receiver_a.recv(&mut buf).is_err());
    relay.stop();
}

#[test]
fn test_path_switch_overrides_binding() {
    let (mut relay, receiver_a, receiver_b) = multi_relay(true);
    let client = UdpSocket::bind("127.0.0.1:0").unwrap();

    // Failover pins everything to output 0 at start, binding notwithstanding
    assert!(relay_one(&mut relay, &client, b"pinned", &receiver_a).is_some());

    let mut buf = [0u8; 64];
    assert!(receiver_b.recv(&mut buf).is_err());
    assert_eq!(relay.failover().unwrap().active_index(), 0);
    relay.stop();
}

#[test]
fn test_srt_caller_relayed_after_handshake() {
    let (receiver, port) = egress_receiver();
    let mut config = base_config(
        r#"{ "mode": "srt", "srt_mode": "listener", "listen_port": 0,
             "rist_dst": "127.0.0.1", "rist_port": 1,
             "min_bitrate": 500, "max_bitrate": 5000 }"#,
    );
    config.rist_port = port;
    config.validate().unwrap();

    let token = CancellationToken::new();
    let mut relay = Relay::from_config(&config, Backends::system().unwrap(), &NoWan, &token).unwrap();
    relay.start().unwrap();

    let client = tokio::runtime::Runtime::new().unwrap();
    let mut caller = client
        .block_on(SrtSocket::builder().call(ingest_target(&relay), None))
        .unwrap();
    client
        .block_on(caller.send((Instant::now(), Bytes::from_static(b"ts-over-srt"))))
        .unwrap();

    let mut buf = [0u8; 2048];
    let mut received = None;
    for _ in 0..100 {
        relay.run_for(Duration::from_millis(20));
        if let Ok(len) = receiver.recv(&mut buf) {
            received = Some(buf[..len].to_vec());
            break;
        }
    }

    assert_eq!(received.as_deref(), Some(&b"ts-over-srt"[..]));
    // Handshake and control packets never reach egress
    assert_eq!(relay.outputs()[0].stats().units_sent, 1);
    assert!(receiver.recv(&mut buf).is_err());

    relay.stop();
}
