use crate::bridge::session::{SessionConfig, TrackerSession};
use crate::domain::models::{AppEvent, ConnectionStatus, MacAddress, SensorId, Tracker};
use crate::infrastructure::bluetooth::PeripheralTransport;
use anyhow::{bail, Context};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Owns the tracker registry and the threads sessions run on.
///
/// Every execution context is a dedicated OS thread with a current-thread
/// runtime, so control calls never block on Bluetooth work.
pub struct SessionSupervisor {
    transport: Arc<dyn PeripheralTransport>,
    config: Arc<SessionConfig>,
    events: mpsc::UnboundedSender<AppEvent>,
    trackers: Vec<Tracker>,
    sessions: HashMap<SensorId, Arc<TrackerSession>>,
    /// Stopped sessions whose teardown has not finished yet.
    stopping: HashMap<SensorId, Arc<TrackerSession>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl SessionSupervisor {
    pub fn new(
        transport: Arc<dyn PeripheralTransport>,
        config: SessionConfig,
        trackers: Vec<Tracker>,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            events,
            trackers,
            sessions: HashMap::new(),
            stopping: HashMap::new(),
            workers: Vec::new(),
        }
    }

    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }

    pub fn status(&self, sensor_id: SensorId) -> ConnectionStatus {
        self.sessions
            .get(&sensor_id)
            .map(|session| session.status())
            .unwrap_or_default()
    }

    /// Change a tracker's device address. Refused while its session runs.
    pub fn set_address(&mut self, sensor_id: SensorId, address: MacAddress) -> anyhow::Result<()> {
        if self
            .sessions
            .get(&sensor_id)
            .is_some_and(|session| session.is_running())
        {
            bail!("Tracker {} is running; stop it before editing", sensor_id);
        }

        let tracker = self
            .trackers
            .iter_mut()
            .find(|t| t.sensor_id == sensor_id)
            .with_context(|| format!("Unknown tracker {}", sensor_id))?;
        if tracker.address != address {
            info!(sensor_id, "Tracker address {} -> {}", tracker.address, address);
            tracker.address = address;
            // The idle session still points at the old device.
            self.sessions.remove(&sensor_id);
        }
        Ok(())
    }

    /// Connect one tracker on its own thread.
    pub fn start_single(&mut self, sensor_id: SensorId) -> anyhow::Result<()> {
        if self.is_stopping(sensor_id) {
            bail!("Tracker {} is still shutting down", sensor_id);
        }
        let session = self.session_for(sensor_id)?;
        if !session.try_claim() {
            info!(sensor_id, "Tracker {} is already running", sensor_id);
            return Ok(());
        }

        self.spawn_context(format!("tracker-{}", sensor_id), vec![session])
    }

    /// Connect every idle tracker, one after another, on a shared thread.
    pub fn start_all(&mut self) -> anyhow::Result<()> {
        let ids: Vec<SensorId> = self.trackers.iter().map(|t| t.sensor_id).collect();
        let mut batch = Vec::with_capacity(ids.len());
        for sensor_id in ids {
            if self.is_stopping(sensor_id) {
                info!(sensor_id, "Tracker {} is still shutting down", sensor_id);
                continue;
            }
            let session = self.session_for(sensor_id)?;
            if session.try_claim() {
                batch.push(session);
            } else {
                info!(sensor_id, "Tracker {} is already running", sensor_id);
            }
        }

        if batch.is_empty() {
            return Ok(());
        }
        self.spawn_context("tracker-batch".to_string(), batch)
    }

    /// Signal a tracker's session to tear down and forget it.
    pub fn stop(&mut self, sensor_id: SensorId) {
        if let Some(session) = self.sessions.remove(&sensor_id) {
            info!(sensor_id, "Stopping tracker {}", sensor_id);
            session.request_stop();
            self.stopping.insert(sensor_id, session);
        }
    }

    pub fn stop_all(&mut self) {
        for (sensor_id, session) in self.sessions.drain() {
            session.request_stop();
            self.stopping.insert(sensor_id, session);
        }
    }

    /// Whether a stopped session for this tracker still holds its device.
    pub fn is_stopping(&mut self, sensor_id: SensorId) -> bool {
        self.stopping.retain(|_, session| session.is_running());
        self.stopping.contains_key(&sensor_id)
    }

    /// Stop everything and wait for the worker threads to finish.
    pub fn shutdown(&mut self) {
        self.stop_all();
        for worker in std::mem::take(&mut self.workers) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                error!("Session thread {} panicked", name);
            }
        }
        self.stopping.clear();
        info!("All tracker sessions stopped");
    }

    fn session_for(&mut self, sensor_id: SensorId) -> anyhow::Result<Arc<TrackerSession>> {
        if let Some(session) = self.sessions.get(&sensor_id) {
            return Ok(Arc::clone(session));
        }

        let tracker = self
            .trackers
            .iter()
            .find(|t| t.sensor_id == sensor_id)
            .copied()
            .with_context(|| format!("Unknown tracker {}", sensor_id))?;
        let session = TrackerSession::new(
            tracker,
            Arc::clone(&self.transport),
            Arc::clone(&self.config),
            self.events.clone(),
        )
        .with_context(|| format!("Failed to open UDP socket for tracker {}", sensor_id))?;

        let session = Arc::new(session);
        self.sessions.insert(sensor_id, Arc::clone(&session));
        Ok(session)
    }

    fn spawn_context(
        &mut self,
        name: String,
        sessions: Vec<Arc<TrackerSession>>,
    ) -> anyhow::Result<()> {
        self.workers.retain(|worker| !worker.is_finished());

        let claimed = sessions.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_context(sessions));

        match spawned {
            Ok(worker) => {
                self.workers.push(worker);
                Ok(())
            }
            Err(e) => {
                for session in claimed {
                    session.release();
                }
                Err(e).with_context(|| format!("Failed to spawn thread {}", name))
            }
        }
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Body of one execution context: connect sessions in order, then keep the
/// connected ones alive until they end.
fn run_context(sessions: Vec<Arc<TrackerSession>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime for tracker sessions: {}", e);
            for session in sessions {
                session.release();
            }
            return;
        }
    };

    runtime.block_on(async move {
        let mut keep_alive = Vec::with_capacity(sessions.len());
        for session in sessions {
            let sensor_id = session.tracker().sensor_id;
            if let Some(handle) = session.start().await {
                keep_alive.push((sensor_id, handle));
            }
        }

        for (sensor_id, handle) in keep_alive {
            if let Err(e) = handle.await {
                warn!(sensor_id, "Keep-alive task ended abnormally: {}", e);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{ConnectBehavior, MockEvent, MockTransport};
    use crate::infrastructure::bluetooth::TransportError;
    use std::net::UdpSocket;
    use std::time::{Duration, Instant};

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0x3C, 0x38, 0xF4, 0xB4, 0x95, last])
    }

    fn trackers(count: u8) -> Vec<Tracker> {
        (0..count)
            .map(|i| Tracker {
                sensor_id: i,
                address: mac(i + 1),
            })
            .collect()
    }

    fn supervisor(
        mock: &MockTransport,
        server: &UdpSocket,
        count: u8,
    ) -> (SessionSupervisor, mpsc::UnboundedReceiver<AppEvent>) {
        let config = SessionConfig {
            server: server.local_addr().unwrap(),
            connect_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(20),
            handshake_delay: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = SessionSupervisor::new(Arc::new(mock.clone()), config, trackers(count), tx);
        (supervisor, rx)
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn connect_order(mock: &MockTransport) -> Vec<MacAddress> {
        mock.events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::ConnectAttempt(address) => Some(address),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_batch_connects_sequentially() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mock = MockTransport::new();
        mock.set_behavior_for(
            mac(2),
            ConnectBehavior::Fail(TransportError::DeviceNotFound(mac(2).to_string())),
        );
        let (mut supervisor, _events) = supervisor(&mock, &server, 3);

        supervisor.start_all().unwrap();
        assert!(wait_until(|| supervisor.status(2) == ConnectionStatus::Connected));

        assert_eq!(
            connect_order(&mock),
            vec![mac(1), mac(2), mac(2), mac(2), mac(3)]
        );
        assert_eq!(supervisor.status(0), ConnectionStatus::Connected);
        assert_eq!(supervisor.status(1), ConnectionStatus::Disconnected);

        supervisor.shutdown();
        assert_eq!(supervisor.status(0), ConnectionStatus::Disconnected);
        let closed = mock
            .events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Disconnected(_)))
            .count();
        assert_eq!(closed, 2);
    }

    #[test]
    fn test_single_mode_sessions_run_concurrently() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mock = MockTransport::new();
        mock.set_connect_delay(Duration::from_millis(150));
        let (mut supervisor, _events) = supervisor(&mock, &server, 2);

        supervisor.start_single(0).unwrap();
        supervisor.start_single(1).unwrap();
        assert!(wait_until(|| {
            supervisor.status(0) == ConnectionStatus::Connected
                && supervisor.status(1) == ConnectionStatus::Connected
        }));

        // Both connects were in flight before either finished.
        let events = mock.events();
        assert!(matches!(events[0], MockEvent::ConnectAttempt(_)));
        assert!(matches!(events[1], MockEvent::ConnectAttempt(_)));

        supervisor.shutdown();
    }

    #[test]
    fn test_running_session_is_not_started_twice() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mock = MockTransport::new();
        mock.set_behavior(ConnectBehavior::Hang);
        let (mut supervisor, _events) = supervisor(&mock, &server, 1);

        supervisor.start_single(0).unwrap();
        supervisor.start_single(0).unwrap();
        supervisor.start_all().unwrap();
        assert!(wait_until(|| supervisor.status(0) == ConnectionStatus::Connecting));
        thread::sleep(Duration::from_millis(50));

        assert_eq!(mock.connect_attempts(mac(1)), 1);
        supervisor.shutdown();
        assert_eq!(mock.connect_attempts(mac(1)), 1);
    }

    #[test]
    fn test_address_edit_rejected_while_running() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mock = MockTransport::new();
        mock.set_behavior(ConnectBehavior::Hang);
        let (mut supervisor, _events) = supervisor(&mock, &server, 1);

        supervisor.start_single(0).unwrap();
        assert!(supervisor.set_address(0, mac(9)).is_err());
        assert_eq!(supervisor.trackers()[0].address, mac(1));

        supervisor.stop(0);
        supervisor.set_address(0, mac(9)).unwrap();
        assert_eq!(supervisor.trackers()[0].address, mac(9));
        assert!(supervisor.set_address(7, mac(9)).is_err());

        supervisor.shutdown();
    }

    #[test]
    fn test_restart_waits_for_previous_teardown() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mock = MockTransport::new();
        mock.set_disconnect_delay(Duration::from_millis(300));
        let (mut supervisor, _events) = supervisor(&mock, &server, 1);

        supervisor.start_single(0).unwrap();
        assert!(wait_until(|| supervisor.status(0) == ConnectionStatus::Connected));

        supervisor.stop(0);
        assert!(supervisor.is_stopping(0));
        assert!(supervisor.start_single(0).is_err());
        supervisor.start_all().unwrap();
        assert_eq!(mock.connect_attempts(mac(1)), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.is_stopping(0) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        supervisor.start_single(0).unwrap();
        assert!(wait_until(|| supervisor.status(0) == ConnectionStatus::Connected));

        // The old link was closed before the new one was opened.
        let events = mock.events();
        let closed = events
            .iter()
            .position(|e| *e == MockEvent::Disconnected(mac(1)))
            .unwrap();
        let reopened = events
            .iter()
            .rposition(|e| *e == MockEvent::ConnectAttempt(mac(1)))
            .unwrap();
        assert!(closed < reopened);

        supervisor.shutdown();
    }

    #[test]
    fn test_unknown_tracker_is_an_error() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mock = MockTransport::new();
        let (mut supervisor, _events) = supervisor(&mock, &server, 2);

        assert!(supervisor.start_single(5).is_err());
        assert_eq!(supervisor.status(5), ConnectionStatus::Disconnected);
    }
}
