//! Process shutdown on SIGTERM

#![cfg(unix)]

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

#[test]
fn test_sigterm_stops_relay_cleanly() {
    let mut config = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    config
        .write_all(
            br#"{ "mode": "srt", "srt_mode": "listener", "listen_port": 0,
                  "rist_dst": "127.0.0.1", "rist_port": 9,
                  "min_bitrate": 500, "max_bitrate": 5000,
                  "feedback_ip": "127.0.0.1", "feedback_port": 9 }"#,
        )
        .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_media-relay"))
        .arg(config.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    // Let the signal handlers install
    std::thread::sleep(Duration::from_secs(1));
    assert!(child.try_wait().unwrap().is_none(), "relay exited before SIGTERM");

    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(10);
    let exit = loop {
        if let Some(exit) = child.try_wait().unwrap() {
            break exit;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("relay did not stop after SIGTERM");
        }
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(exit.success());
}
