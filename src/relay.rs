//! Relay orchestrator
//!
//! Builds the egress peers, their feedback controllers and the ingest
//! source from a [`RelayConfig`], then drives ingest and failover from a
//! single dispatch loop until cancelled.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{InputMode, RelayConfig, SrtMode};
use crate::egress::{EgressBackend, EgressOptions, EgressPeer, UdpEgressBackend};
use crate::error::{Error, Result};
use crate::failover::{ActiveOutput, FailoverController};
use crate::feedback::FeedbackController;
use crate::ingest::{
    DatagramTransport, Ingest, IngestManager, IngestSource, PullBackend, PullSource, SessionOptions,
    SessionTransport, SrtTransport, TcpPullBackend,
};
use crate::net::{resolve_auto_routes, WanResolver};

/// Transport implementations used to build a relay
pub struct Backends {
    pub session: Box<dyn SessionTransport>,
    pub egress: Arc<dyn EgressBackend>,
    pub pull: Box<dyn PullBackend>,
}

impl Backends {
    /// SRT sessions, UDP egress, and the libavformat puller when built with `ffmpeg`
    pub fn system() -> Result<Self> {
        Ok(Self {
            session: Box::new(SrtTransport::new()?),
            egress: Arc::new(UdpEgressBackend),
            pull: default_pull_backend(),
        })
    }

    /// Plain UDP sessions and raw TCP pulls, for loopback links and tests
    pub fn loopback() -> Result<Self> {
        Ok(Self {
            session: Box::new(DatagramTransport::new()?),
            egress: Arc::new(UdpEgressBackend),
            pull: Box::new(TcpPullBackend),
        })
    }
}

#[cfg(feature = "ffmpeg")]
fn default_pull_backend() -> Box<dyn PullBackend> {
    Box::new(crate::ingest::FfmpegPullBackend)
}

#[cfg(not(feature = "ffmpeg"))]
fn default_pull_backend() -> Box<dyn PullBackend> {
    Box::new(TcpPullBackend)
}

/// Wired relay: one ingest source, its egress peers, optional failover
pub struct Relay {
    ingest: Ingest,
    outputs: Vec<Arc<EgressPeer>>,
    failover: Option<FailoverController>,
}

impl Relay {
    pub fn new(ingest: Ingest, outputs: Vec<Arc<EgressPeer>>, failover: Option<FailoverController>) -> Self {
        Self {
            ingest,
            outputs,
            failover,
        }
    }

    /// Build every component described by `config`
    ///
    /// Egress peers are initialized here; their housekeeping threads stop
    /// when `shutdown` is cancelled.
    pub fn from_config(
        config: &RelayConfig,
        backends: Backends,
        resolver: &dyn WanResolver,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let feedback_endpoint = config.feedback_endpoint()?;
        let egress_options = EgressOptions {
            scheme: config.transport.egress_scheme.clone(),
            stats_interval: config.transport.stats_interval(),
            ..EgressOptions::default()
        };
        let session_options = SessionOptions {
            latency: config.transport.latency(),
            peer_idle_timeout: config.transport.peer_idle_timeout(),
            ..SessionOptions::default()
        };

        let build_peer = |host: &str, port: u16| -> Result<Arc<EgressPeer>> {
            let peer = EgressPeer::new(host, port, Arc::clone(&backends.egress))
                .with_options(egress_options.clone())
                .with_cancellation(shutdown);
            peer.init()?;
            peer.set_feedback_callback(Arc::new(FeedbackController::new(
                config.min_bitrate,
                config.max_bitrate,
                feedback_endpoint,
            )));
            Ok(Arc::new(peer))
        };

        let Backends { session, pull, .. } = backends;

        let (ingest, outputs) = match (config.mode, config.srt_mode) {
            (InputMode::Rtsp, _) => {
                let output = build_peer(&config.rist_dst, config.rist_port)?;
                let mut source = PullSource::new(config.input_url.clone(), pull);
                source.add_output(Arc::clone(&output));
                (Ingest::Pull(source), vec![output])
            }
            (InputMode::Srt, Some(SrtMode::Caller)) => {
                let output = build_peer(&config.rist_dst, config.rist_port)?;
                let manager = IngestManager::caller(config.input_url.clone(), Arc::clone(&output), session)
                    .with_options(session_options);
                (Ingest::Session(manager), vec![output])
            }
            (InputMode::Srt, Some(SrtMode::Listener)) => {
                let output = build_peer(&config.rist_dst, config.rist_port)?;
                let manager = IngestManager::listener(config.listen_port, Arc::clone(&output), session)
                    .with_options(session_options);
                (Ingest::Session(manager), vec![output])
            }
            (InputMode::Srt, Some(SrtMode::Multi)) => {
                let mut routes = config.multi_routes.clone();
                if config.filter_to_wan {
                    resolve_auto_routes(&mut routes, resolver)?;
                }

                let mut manager = IngestManager::multi(config.listen_port, session).with_options(session_options);
                let mut outputs = Vec::with_capacity(routes.len());
                for route in &routes {
                    let output = build_peer(&route.rist_dst, route.rist_port)?;
                    manager.add_binding(&route.interface_ip, Arc::clone(&output))?;
                    outputs.push(output);
                }
                (Ingest::Session(manager), outputs)
            }
            (InputMode::Srt, None) => return Err(Error::Config("srt_mode is required when mode is srt".into())),
        };

        let failover = config
            .failover_enabled()
            .then(|| FailoverController::new(config.path_switch));

        Ok(Self::new(ingest, outputs, failover))
    }

    pub fn outputs(&self) -> &[Arc<EgressPeer>] {
        &self.outputs
    }

    pub fn ingest(&self) -> &Ingest {
        &self.ingest
    }

    pub fn failover(&self) -> Option<&FailoverController> {
        self.failover.as_ref()
    }

    /// Local address of the ingest listener or caller session
    pub fn ingest_addr(&self) -> Option<SocketAddr> {
        self.ingest.as_session().and_then(IngestManager::local_addr)
    }

    /// Start ingest; with failover enabled, route everything through output 0
    pub fn start(&mut self) -> Result<()> {
        self.ingest.start()?;

        if let (Some(failover), Some(manager)) = (&self.failover, self.ingest.as_session()) {
            if let Some(initial) = self.outputs.get(failover.active_index()) {
                manager.set_active_output(Arc::clone(initial))?;
            }
        }

        tracing::info!("Relay started with {} output(s)", self.outputs.len());
        Ok(())
    }

    /// One dispatch iteration: ingest, then the failover check
    pub fn tick(&mut self, now: Instant) {
        self.ingest.process();

        if let (Some(failover), Ingest::Session(manager)) = (&mut self.failover, &self.ingest) {
            failover.poll(now, &self.outputs, manager);
        }
    }

    /// Run until `shutdown` is cancelled or a pull source ends
    pub fn run(&mut self, shutdown: &CancellationToken) -> Result<()> {
        self.start()?;

        while !shutdown.is_cancelled() {
            if !self.ingest.is_running() {
                tracing::info!("Ingest finished");
                break;
            }
            self.tick(Instant::now());
        }

        self.stop();
        Ok(())
    }

    /// Stop ingest, then tear down every egress peer
    pub fn stop(&mut self) {
        self.ingest.stop();
        for output in &self.outputs {
            output.shutdown();
        }
        tracing::info!("Relay stopped");
    }

    /// Run `tick` repeatedly for `duration`
    pub fn run_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.tick(Instant::now());
        }
    }
}
