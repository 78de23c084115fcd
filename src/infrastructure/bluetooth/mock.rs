//! Scriptable transport for session and supervisor tests.

use crate::domain::models::MacAddress;
use crate::infrastructure::bluetooth::{
    forward_notification, NotificationSender, PeripheralLink, PeripheralTransport, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    ConnectAttempt(MacAddress),
    Paired(MacAddress),
    Subscribed(MacAddress),
    Command(MacAddress, Vec<u8>),
    Disconnected(MacAddress),
}

#[derive(Debug, Clone, Default)]
pub enum ConnectBehavior {
    #[default]
    Succeed,
    Fail(TransportError),
    /// Never completes; only the caller's timeout ends the attempt.
    Hang,
}

#[derive(Default)]
struct LinkState {
    notifications: Option<NotificationSender>,
    lost: Option<oneshot::Sender<()>>,
}

/// Test-side handle to a link the mock handed out.
#[derive(Clone)]
pub struct MockLinkHandle {
    address: MacAddress,
    state: Arc<Mutex<LinkState>>,
}

impl MockLinkHandle {
    pub fn address(&self) -> MacAddress {
        self.address
    }

    /// Deliver a notification the way a real transport callback would.
    pub fn notify(&self, payload: Vec<u8>) {
        let state = self.state.lock().unwrap();
        if let Some(tx) = state.notifications.as_ref() {
            forward_notification(tx, payload);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().unwrap().notifications.is_some()
    }

    /// Simulate the puck going out of range.
    pub fn drop_connection(&self) {
        if let Some(lost) = self.state.lock().unwrap().lost.take() {
            let _ = lost.send(());
        }
    }
}

#[derive(Default)]
struct MockInner {
    default_behavior: Mutex<ConnectBehavior>,
    behaviors: Mutex<HashMap<MacAddress, ConnectBehavior>>,
    connect_delay: Mutex<Duration>,
    disconnect_delay: Mutex<Duration>,
    fail_pairing: AtomicBool,
    fail_subscribe: AtomicBool,
    events: Mutex<Vec<MockEvent>>,
    links: Mutex<Vec<MockLinkHandle>>,
}

impl MockInner {
    fn record(&self, event: MockEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.inner.default_behavior.lock().unwrap() = behavior;
    }

    pub fn set_behavior_for(&self, address: MacAddress, behavior: ConnectBehavior) {
        self.inner.behaviors.lock().unwrap().insert(address, behavior);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock().unwrap() = delay;
    }

    /// Slow down link teardown, like a GATT write to a fading device.
    pub fn set_disconnect_delay(&self, delay: Duration) {
        *self.inner.disconnect_delay.lock().unwrap() = delay;
    }

    pub fn set_fail_pairing(&self, fail: bool) {
        self.inner.fail_pairing.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn connect_attempts(&self, address: MacAddress) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == MockEvent::ConnectAttempt(address))
            .count()
    }

    pub fn links(&self) -> Vec<MockLinkHandle> {
        self.inner.links.lock().unwrap().clone()
    }

    pub fn last_link(&self, address: MacAddress) -> Option<MockLinkHandle> {
        self.links()
            .into_iter()
            .rev()
            .find(|link| link.address == address)
    }

    fn behavior_for(&self, address: MacAddress) -> ConnectBehavior {
        self.inner
            .behaviors
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| self.inner.default_behavior.lock().unwrap().clone())
    }
}

#[async_trait]
impl PeripheralTransport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self, address: MacAddress) -> Result<Box<dyn PeripheralLink>, TransportError> {
        self.inner.record(MockEvent::ConnectAttempt(address));

        let delay = *self.inner.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.behavior_for(address) {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Fail(e) => return Err(e),
            ConnectBehavior::Hang => std::future::pending::<()>().await,
        }

        let handle = MockLinkHandle {
            address,
            state: Arc::new(Mutex::new(LinkState::default())),
        };
        self.inner.links.lock().unwrap().push(handle.clone());

        Ok(Box::new(MockLink {
            handle,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockLink {
    handle: MockLinkHandle,
    inner: Arc<MockInner>,
}

#[async_trait]
impl PeripheralLink for MockLink {
    async fn pair(&self) -> Result<(), TransportError> {
        if self.inner.fail_pairing.load(Ordering::SeqCst) {
            return Err(TransportError::Pairing("not supported".to_string()));
        }
        self.inner.record(MockEvent::Paired(self.handle.address));
        Ok(())
    }

    async fn subscribe(&self, notifications: NotificationSender) -> Result<(), TransportError> {
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(TransportError::Gatt("subscribe rejected".to_string()));
        }
        self.handle.state.lock().unwrap().notifications = Some(notifications);
        self.inner.record(MockEvent::Subscribed(self.handle.address));
        Ok(())
    }

    async fn write_command(&self, command: &[u8]) -> Result<(), TransportError> {
        self.inner
            .record(MockEvent::Command(self.handle.address, command.to_vec()));
        Ok(())
    }

    fn watch_disconnect(&self, lost: oneshot::Sender<()>) -> Result<(), TransportError> {
        self.handle.state.lock().unwrap().lost = Some(lost);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let delay = *self.inner.disconnect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.handle.state.lock().unwrap();
            state.notifications = None;
            state.lost = None;
        }
        self.inner
            .record(MockEvent::Disconnected(self.handle.address));
        Ok(())
    }
}
