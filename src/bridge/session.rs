//! Tracker Session
//!
//! Lifecycle of one puck:
//!
//! ```text
//!            start()                    transport + handshake ok
//! Disconnected ──────► Connecting ───────────────────────────► Connected
//!      ▲                   │                                      │
//!      │   attempt failed  │   stop / device lost / stream ended  │
//!      └───────────────────┴──────────────── teardown ◄───────────┘
//! ```
//!
//! A failed attempt is retried after a fixed backoff until the attempt budget
//! is spent. Once connected, a keep-alive task owns the link until something
//! ends the session, and `teardown` is the only place the link is released.

use crate::domain::models::{
    AppEvent, ConnectionStatus, MessageSeverity, SensorId, StatusMessage, Tracker,
};
use crate::domain::settings::Settings;
use crate::domain::telemetry;
use crate::infrastructure::bluetooth::protocol::STREAM_START_COMMAND;
use crate::infrastructure::bluetooth::{PeripheralLink, PeripheralTransport, TransportError};
use crate::infrastructure::slimevr::{FirmwareInfo, Packet, PacketSender};
use anyhow::Context;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Timing and identity shared by every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server: SocketAddr,
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Pause between handshake and sensor info so the server can register the tracker.
    pub handshake_delay: Duration,
    pub notification_queue_depth: usize,
    pub bridge_name: String,
    pub firmware_version: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], 6969)),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            handshake_delay: Duration::from_millis(300),
            notification_queue_depth: 32,
            bridge_name: "MoSlime".to_string(),
            firmware_version: "1.0.0".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let address = &settings.server.address;
        let server = address
            .to_socket_addrs()
            .with_context(|| format!("Invalid server address {address:?}"))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Server address {address:?} did not resolve"))?;

        let connection = &settings.connection;
        Ok(Self {
            server,
            connect_timeout: Duration::from_millis(connection.connect_timeout_ms),
            max_attempts: connection.max_attempts,
            retry_backoff: Duration::from_millis(connection.retry_backoff_ms),
            handshake_delay: Duration::from_millis(connection.handshake_delay_ms),
            notification_queue_depth: connection.notification_queue_depth,
            bridge_name: settings.firmware.bridge_name.clone(),
            firmware_version: settings.firmware.version.clone(),
        })
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Failed to send {packet} packet: {source}")]
    Send {
        packet: &'static str,
        source: io::Error,
    },
    #[error("Session stopped")]
    Stopped,
}

/// Link plus the tasks bound to it once streaming has started.
struct ActiveLink {
    link: Box<dyn PeripheralLink>,
    pump: JoinHandle<()>,
    lost: oneshot::Receiver<()>,
}

/// One tracker's connection, socket and sequence counter.
pub struct TrackerSession {
    tracker: Tracker,
    transport: Arc<dyn PeripheralTransport>,
    config: Arc<SessionConfig>,
    firmware: FirmwareInfo,
    sender: Arc<PacketSender>,
    events: mpsc::UnboundedSender<AppEvent>,
    status: watch::Sender<ConnectionStatus>,
    stop: watch::Sender<bool>,
    running: AtomicBool,
}

impl TrackerSession {
    /// Create the session and bind its outbound socket.
    pub fn new(
        tracker: Tracker,
        transport: Arc<dyn PeripheralTransport>,
        config: Arc<SessionConfig>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> io::Result<Self> {
        let sender = PacketSender::bind(tracker.sensor_id, config.server)?;
        let firmware = FirmwareInfo {
            bridge_name: config.bridge_name.clone(),
            transport_name: transport.name().to_string(),
            version: config.firmware_version.clone(),
        };

        Ok(Self {
            tracker,
            transport,
            config,
            firmware,
            sender: Arc::new(sender),
            events,
            status: watch::Sender::new(ConnectionStatus::Disconnected),
            stop: watch::Sender::new(false),
            running: AtomicBool::new(false),
        })
    }

    pub fn tracker(&self) -> Tracker {
        self.tracker
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Last sequence number sent by this tracker.
    pub fn packet_counter(&self) -> u64 {
        self.sender.counter()
    }

    pub fn local_port(&self) -> io::Result<u16> {
        self.sender.local_port()
    }

    /// Reserve the session for one execution context. Returns `false` if it
    /// is already connecting or connected elsewhere.
    pub fn try_claim(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn release(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Ask the session to end. Honoured between connect steps and by the
    /// keep-alive task.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Run the connect protocol with retries.
    ///
    /// On success the keep-alive task is spawned on the current runtime and
    /// its handle returned. On exhaustion or stop the session is left
    /// `Disconnected` and released.
    pub async fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let Tracker { sensor_id, address } = self.tracker;
        let max_attempts = self.config.max_attempts.max(1);
        let mut stop = self.stop.subscribe();

        for attempt in 1..=max_attempts {
            if self.is_stopped() {
                break;
            }

            match self.attempt(attempt).await {
                Ok(active) => {
                    let session = Arc::clone(&self);
                    return Some(tokio::spawn(session.keep_alive(active)));
                }
                Err(SessionError::Stopped) => break,
                Err(e) => {
                    self.set_status(ConnectionStatus::Disconnected);
                    warn!(
                        sensor_id,
                        attempt,
                        "[Attempt {}] Error connecting to {} (ID={}): {}",
                        attempt,
                        address,
                        sensor_id,
                        e
                    );

                    if attempt < max_attempts {
                        info!(sensor_id, "Retrying... (max {} attempts)", max_attempts);
                        self.send_log(
                            format!(
                                "Tracker #{} attempt {}/{} failed: {}",
                                sensor_id + 1,
                                attempt,
                                max_attempts,
                                e
                            ),
                            MessageSeverity::Warning,
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.retry_backoff) => {}
                            _ = stopped(&mut stop) => break,
                        }
                    } else {
                        error!(
                            sensor_id,
                            "Failed to connect after {} attempts: {}", max_attempts, address
                        );
                        self.send_log(
                            format!(
                                "Tracker #{} ({}) failed to connect after {} attempts",
                                sensor_id + 1,
                                address,
                                max_attempts
                            ),
                            MessageSeverity::Error,
                        );
                    }
                }
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        self.release();
        None
    }

    /// One pass of the connect protocol.
    async fn attempt(&self, attempt: u32) -> Result<ActiveLink, SessionError> {
        let address = self.tracker.address;
        self.set_status(ConnectionStatus::Connecting);

        let timeout = self.config.connect_timeout;
        let mut stop = self.stop.subscribe();
        let link = tokio::select! {
            result = tokio::time::timeout(timeout, self.transport.connect(address)) => {
                result.map_err(|_| TransportError::Timeout(timeout.as_millis() as u64))??
            }
            _ = stopped(&mut stop) => return Err(SessionError::Stopped),
        };

        match self.establish(link.as_ref(), attempt).await {
            Ok((pump, lost)) => Ok(ActiveLink { link, pump, lost }),
            Err(e) => {
                close_link(link.as_ref(), &self.tracker).await;
                Err(e)
            }
        }
    }

    /// Handshake, subscribe and start the stream on an open link.
    async fn establish(
        &self,
        link: &dyn PeripheralLink,
        attempt: u32,
    ) -> Result<(JoinHandle<()>, oneshot::Receiver<()>), SessionError> {
        let Tracker { sensor_id, address } = self.tracker;

        match link.pair().await {
            Ok(()) => debug!(sensor_id, "Pairing attempted for {}", address),
            Err(e) => warn!(sensor_id, "Pairing not supported or failed: {}", e),
        }

        self.set_status(ConnectionStatus::Connected);
        info!(
            sensor_id,
            attempt,
            "[Attempt {}] Connected to {} (Sensor ID={})",
            attempt,
            address,
            sensor_id
        );

        self.send_packet(&Packet::Handshake {
            mac: &address,
            firmware: &self.firmware,
        })?;
        let mut stop = self.stop.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(self.config.handshake_delay) => {}
            _ = stopped(&mut stop) => return Err(SessionError::Stopped),
        }
        self.send_packet(&Packet::SensorInfo { sensor_id })?;

        let (tx, rx) = mpsc::channel(self.config.notification_queue_depth.max(1));
        let pump = tokio::spawn(pump_notifications(
            sensor_id,
            Arc::clone(&self.sender),
            self.events.clone(),
            rx,
        ));

        let started = async {
            link.subscribe(tx).await?;
            info!(sensor_id, "[{}] Notification started.", address);

            let (lost_tx, lost_rx) = oneshot::channel();
            link.watch_disconnect(lost_tx)?;

            link.write_command(&STREAM_START_COMMAND).await?;
            info!(sensor_id, "[{}] Stream start command sent.", address);
            Ok::<_, TransportError>(lost_rx)
        }
        .await;

        match started {
            Ok(lost) => {
                self.send_log(
                    format!("Tracker #{} connected ({})", sensor_id + 1, address),
                    MessageSeverity::Success,
                );
                Ok((pump, lost))
            }
            Err(e) => {
                pump.abort();
                Err(e.into())
            }
        }
    }

    /// Hold the session open until it is stopped or the link goes away.
    async fn keep_alive(self: Arc<Self>, active: ActiveLink) {
        let ActiveLink {
            link,
            mut pump,
            lost,
        } = active;
        let Tracker { sensor_id, address } = self.tracker;
        let mut stop = self.stop.subscribe();

        info!(sensor_id, "Maintaining connection for {} ...", address);
        let reason = tokio::select! {
            _ = stopped(&mut stop) => "stop requested",
            Ok(()) = lost => "device disconnected",
            _ = &mut pump => "notification stream closed",
        };
        info!(sensor_id, "Session for {} ending: {}", address, reason);

        self.teardown(link, pump, reason).await;
    }

    /// Release everything a connected session holds.
    async fn teardown(&self, link: Box<dyn PeripheralLink>, pump: JoinHandle<()>, reason: &str) {
        pump.abort();
        close_link(link.as_ref(), &self.tracker).await;
        self.set_status(ConnectionStatus::Disconnected);
        self.send_log(
            format!(
                "Tracker #{} disconnected ({}): {}",
                self.tracker.sensor_id + 1,
                self.tracker.address,
                reason
            ),
            MessageSeverity::Info,
        );
        self.release();
    }

    fn send_packet(&self, packet: &Packet<'_>) -> Result<u64, SessionError> {
        self.sender.send(packet).map_err(|source| SessionError::Send {
            packet: packet.name(),
            source,
        })
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(
                sensor_id = self.tracker.sensor_id,
                "Status {} -> {}", previous, status
            );
            let _ = self.events.send(AppEvent::TrackerStatus {
                sensor_id: self.tracker.sensor_id,
                status,
            });
        }
    }

    fn send_log(&self, message: String, severity: MessageSeverity) {
        let _ = self
            .events
            .send(AppEvent::LogMessage(StatusMessage { message, severity }));
    }
}

/// Resolves once a stop has been requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn close_link(link: &dyn PeripheralLink, tracker: &Tracker) {
    match link.disconnect().await {
        Ok(()) => info!(
            sensor_id = tracker.sensor_id,
            "Disconnected from tracker {}", tracker.address
        ),
        Err(e) => warn!(
            sensor_id = tracker.sensor_id,
            "Error disconnecting from tracker {}: {}", tracker.address, e
        ),
    }
}

/// Turn queued notifications into rotation + acceleration packets.
async fn pump_notifications(
    sensor_id: SensorId,
    sender: Arc<PacketSender>,
    events: mpsc::UnboundedSender<AppEvent>,
    mut notifications: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(payload) = notifications.recv().await {
        let sample = match telemetry::decode(&payload) {
            Ok(sample) => sample,
            Err(e) => {
                trace!(sensor_id, "Dropping notification: {}", e);
                continue;
            }
        };

        let packets = [
            Packet::Rotation {
                sensor_id,
                orientation: sample.orientation,
            },
            Packet::Acceleration {
                sensor_id,
                acceleration: sample.acceleration,
            },
        ];
        for packet in &packets {
            if let Err(e) = sender.send(packet) {
                warn!(sensor_id, "Failed to send {} packet: {}", packet.name(), e);
            }
        }

        let _ = events.send(AppEvent::TrackerData {
            sensor_id,
            orientation: sample.orientation,
        });
    }
}
