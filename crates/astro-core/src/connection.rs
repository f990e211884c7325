//! Connection lifecycle of endpoints and the physical devices behind them.
//!
//! Two layers:
//!
//! - [`SharedDevice`]: one per physical device, shared through an `Arc` by all
//!   sibling endpoints. It counts connected endpoints and only touches the
//!   hardware on the 0→1 (open) and 1→0 (close) transitions. The count, the
//!   open handle and the global lock guard live behind one async mutex, which
//!   serializes concurrent connects and disconnects of siblings.
//! - [`ConnectionMachine`]: one per endpoint. Drives the CONNECTION property
//!   through `Disconnected → Connecting (BUSY) → Connected (OK) | Failed (ALERT)`.
//!
//! ```text
//! CONNECTION=CONNECTED ──► request() ──► Connectable::connect() ──► connected()
//!                            │ BUSY            │ Err                    │ OK
//!                            ▼                 ▼                        ▼
//!                       (ignored if BUSY)   failed(msg): ALERT, switch back to DISCONNECTED
//! ```

use crate::capabilities::Connectable;
use crate::endpoint::{EndpointContext, PropertyChange};
use crate::error::AstroError;
use crate::lock::GlobalLockGuard;
use crate::property::{names, Item, ItemUpdate, Property, PropertyKind, PropertyState, SwitchRule};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

// =============================================================================
// Hardware Link
// =============================================================================

/// How to open, initialize and close one kind of physical device.
#[async_trait]
pub trait HardwareLink: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Stable identity, used as the global lock key.
    fn identity(&self) -> String;

    async fn open(&self) -> Result<Self::Handle>;

    /// One-time query/setup after open (geometry, firmware, axis tables).
    async fn initialize(&self, _handle: &Self::Handle) -> Result<()> {
        Ok(())
    }

    /// Put the hardware in a safe state before closing (warm up, stop axes).
    async fn safe_state(&self, _handle: &Self::Handle) -> Result<()> {
        Ok(())
    }

    async fn close(&self, handle: &Self::Handle) -> Result<()>;
}

struct LinkState<H> {
    refcount: usize,
    handle: Option<Arc<H>>,
    lock: Option<GlobalLockGuard>,
}

/// Reference-counted physical device record.
pub struct SharedDevice<L: HardwareLink> {
    link: L,
    lock_dir: Option<PathBuf>,
    state: Mutex<LinkState<L::Handle>>,
}

impl<L: HardwareLink> SharedDevice<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            lock_dir: None,
            state: Mutex::new(LinkState {
                refcount: 0,
                handle: None,
                lock: None,
            }),
        }
    }

    /// Place lock files in `dir` instead of the system temp directory.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Register one more connected endpoint, opening the hardware if it is
    /// the first. On failure nothing acquired by this call is kept.
    pub async fn acquire(&self) -> Result<Arc<L::Handle>> {
        let mut state = self.state.lock().await;

        if let Some(handle) = state.handle.clone() {
            state.refcount += 1;
            tracing::debug!(identity = %self.link.identity(), refcount = state.refcount, "shared device reused");
            return Ok(handle);
        }

        let identity = self.link.identity();
        let lock = match &self.lock_dir {
            Some(dir) => GlobalLockGuard::acquire_in(dir, &identity),
            None => GlobalLockGuard::acquire(&identity),
        }
        .map_err(|e| match e {
            AstroError::LockHeld(_) => anyhow::anyhow!("{identity} is in use by another driver"),
            other => anyhow::Error::new(other),
        })?;

        let handle = self
            .link
            .open()
            .await
            .with_context(|| format!("Failed to open {identity}"))?;

        if let Err(e) = self.link.initialize(&handle).await {
            if let Err(close_err) = self.link.close(&handle).await {
                tracing::warn!(identity = %identity, error = %close_err, "close after failed initialize");
            }
            drop(lock);
            return Err(e.context(format!("Failed to initialize {identity}")));
        }

        let handle = Arc::new(handle);
        state.refcount = 1;
        state.handle = Some(handle.clone());
        state.lock = Some(lock);
        tracing::info!(identity = %identity, "shared device opened");
        Ok(handle)
    }

    /// Drop one connected endpoint, closing the hardware if it was the last.
    /// Never fails: hardware errors on the way down are logged.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if state.refcount == 0 {
            tracing::warn!(identity = %self.link.identity(), "release without matching acquire");
            return;
        }
        state.refcount -= 1;
        if state.refcount > 0 {
            tracing::debug!(identity = %self.link.identity(), refcount = state.refcount, "shared device still in use");
            return;
        }

        if let Some(handle) = state.handle.take() {
            let identity = self.link.identity();
            if let Err(e) = self.link.safe_state(&handle).await {
                tracing::warn!(identity = %identity, error = %e, "safe state failed");
            }
            if let Err(e) = self.link.close(&handle).await {
                tracing::warn!(identity = %identity, error = %e, "close failed");
            }
            tracing::info!(identity = %identity, "shared device closed");
        }
        state.lock = None;
    }

    pub async fn ref_count(&self) -> usize {
        self.state.lock().await.refcount
    }

    /// The open handle, if any endpoint is connected.
    pub async fn handle(&self) -> Option<Arc<L::Handle>> {
        self.state.lock().await.handle.clone()
    }
}

/// Each sibling endpoint's connect/disconnect is one acquire/release.
#[async_trait]
impl<L: HardwareLink> Connectable for SharedDevice<L> {
    async fn connect(&self) -> Result<()> {
        self.acquire().await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<()> {
        self.release().await;
        Ok(())
    }
}

// =============================================================================
// Connection State Machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRequest {
    Connect,
    Disconnect,
}

/// CONNECTION property driver of one endpoint.
pub struct ConnectionMachine {
    ctx: EndpointContext,
    state: parking_lot::Mutex<ConnectionState>,
}

impl ConnectionMachine {
    pub fn new(ctx: EndpointContext) -> Self {
        Self {
            ctx,
            state: parking_lot::Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn property() -> Property {
        Property::new(names::CONNECTION, "Connection", PropertyKind::Switch)
            .with_rule(SwitchRule::OneOfMany)
            .with_item(Item::switch(names::CONNECTION_CONNECTED, "Connected", false))
            .with_item(Item::switch(names::CONNECTION_DISCONNECTED, "Disconnected", true))
    }

    pub fn define(&self) -> crate::error::AppResult<()> {
        self.ctx.define(Self::property())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Interpret a CONNECTION change. Returns what the endpoint must do, or
    /// `None` when the change is ignored (busy, no-op, malformed).
    pub fn request(&self, change: &PropertyChange) -> Option<ConnectionRequest> {
        if self.ctx.state(names::CONNECTION) == PropertyState::Busy {
            tracing::debug!(endpoint = %self.ctx.device(), "connection change ignored while busy");
            return None;
        }

        let request = if change.is_on(names::CONNECTION_CONNECTED) {
            ConnectionRequest::Connect
        } else if change.is_on(names::CONNECTION_DISCONNECTED) {
            ConnectionRequest::Disconnect
        } else {
            return None;
        };

        let already = match request {
            ConnectionRequest::Connect => self.is_connected(),
            ConnectionRequest::Disconnect => !self.is_connected(),
        };
        if already {
            self.ctx.publish(names::CONNECTION);
            return None;
        }

        if let Err(e) = self.ctx.apply(change) {
            tracing::warn!(endpoint = %self.ctx.device(), error = %e, "bad connection change");
            return None;
        }
        if request == ConnectionRequest::Connect {
            *self.state.lock() = ConnectionState::Connecting;
        }
        self.ctx.busy(names::CONNECTION);
        Some(request)
    }

    pub fn connected(&self) {
        *self.state.lock() = ConnectionState::Connected;
        self.ctx.set_values(
            names::CONNECTION,
            &[ItemUpdate::switch(names::CONNECTION_CONNECTED, true)],
        );
        self.ctx.ok(names::CONNECTION, None);
        tracing::info!(endpoint = %self.ctx.device(), "connected");
    }

    pub fn failed(&self, message: &str) {
        *self.state.lock() = ConnectionState::Failed;
        self.ctx.set_values(
            names::CONNECTION,
            &[ItemUpdate::switch(names::CONNECTION_DISCONNECTED, true)],
        );
        tracing::warn!(endpoint = %self.ctx.device(), message, "connect failed");
        self.ctx.alert(names::CONNECTION, message);
    }

    pub fn disconnected(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        self.ctx.set_values(
            names::CONNECTION,
            &[ItemUpdate::switch(names::CONNECTION_DISCONNECTED, true)],
        );
        self.ctx.ok(names::CONNECTION, None);
        tracing::info!(endpoint = %self.ctx.device(), "disconnected");
    }
}

/// Run a CONNECTION change against `device`. Returns the resulting state, or
/// `None` if the change was ignored.
pub async fn handle_connection_change(
    machine: &ConnectionMachine,
    device: &dyn Connectable,
    change: &PropertyChange,
) -> Option<ConnectionState> {
    match machine.request(change)? {
        ConnectionRequest::Connect => match device.connect().await {
            Ok(()) => machine.connected(),
            Err(e) => machine.failed(&format!("Connection failed: {e:#}")),
        },
        ConnectionRequest::Disconnect => {
            if let Err(e) = device.disconnect().await {
                tracing::warn!(error = %e, "disconnect reported an error");
            }
            machine.disconnected();
        }
    }
    Some(machine.state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{MemoryPropertyStore, PropertyStore};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLink {
        opens: AtomicUsize,
        closes: AtomicUsize,
        fail_init: AtomicBool,
    }

    #[async_trait]
    impl HardwareLink for Arc<CountingLink> {
        type Handle = u32;

        fn identity(&self) -> String {
            format!("counting-{:p}", Arc::as_ptr(self))
        }

        async fn open(&self) -> Result<u32> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        }

        async fn initialize(&self, _handle: &u32) -> Result<()> {
            if self.fail_init.load(Ordering::SeqCst) {
                anyhow::bail!("motor not initialized");
            }
            Ok(())
        }

        async fn close(&self, _handle: &u32) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_acquire_opens_last_release_closes() {
        let dir = tempfile::tempdir().unwrap();
        let link = Arc::new(CountingLink::default());
        let device = SharedDevice::new(link.clone()).with_lock_dir(dir.path());

        for _ in 0..3 {
            assert_eq!(*device.acquire().await.unwrap(), 7);
        }
        assert_eq!(device.ref_count().await, 3);
        for _ in 0..3 {
            device.release().await;
        }

        assert_eq!(link.opens.load(Ordering::SeqCst), 1);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
        assert!(device.handle().await.is_none());
    }

    #[tokio::test]
    async fn failed_initialize_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let link = Arc::new(CountingLink::default());
        link.fail_init.store(true, Ordering::SeqCst);
        let device = SharedDevice::new(link.clone()).with_lock_dir(dir.path());

        let err = device.acquire().await.unwrap_err();
        assert!(format!("{err:#}").contains("motor not initialized"));
        assert_eq!(device.ref_count().await, 0);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);

        // Lock was dropped, so a retry can proceed.
        link.fail_init.store(false, Ordering::SeqCst);
        device.acquire().await.unwrap();
        device.release().await;
    }

    struct Flaky {
        fail: bool,
    }

    #[async_trait]
    impl Connectable for Flaky {
        async fn connect(&self) -> Result<()> {
            if self.fail {
                anyhow::bail!("no such device");
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            anyhow::bail!("close failed")
        }
    }

    fn machine(store: &Arc<MemoryPropertyStore>) -> ConnectionMachine {
        let machine = ConnectionMachine::new(EndpointContext::new("Cam", store.clone()));
        machine.define().unwrap();
        machine
    }

    #[tokio::test]
    async fn connect_failure_alerts_and_resets_switch() {
        let store = Arc::new(MemoryPropertyStore::new());
        let machine = machine(&store);

        let change = PropertyChange::switch(names::CONNECTION, names::CONNECTION_CONNECTED);
        let state = handle_connection_change(&machine, &Flaky { fail: true }, &change).await;

        assert_eq!(state, Some(ConnectionState::Failed));
        let prop = store.get("Cam", names::CONNECTION).unwrap();
        assert_eq!(prop.state, PropertyState::Alert);
        assert!(prop.is_on(names::CONNECTION_DISCONNECTED));
    }

    #[tokio::test]
    async fn disconnect_always_ends_ok() {
        let store = Arc::new(MemoryPropertyStore::new());
        let machine = machine(&store);
        let device = Flaky { fail: false };

        let connect = PropertyChange::switch(names::CONNECTION, names::CONNECTION_CONNECTED);
        handle_connection_change(&machine, &device, &connect).await;
        assert!(machine.is_connected());

        let disconnect = PropertyChange::switch(names::CONNECTION, names::CONNECTION_DISCONNECTED);
        let state = handle_connection_change(&machine, &device, &disconnect).await;
        assert_eq!(state, Some(ConnectionState::Disconnected));
        assert_eq!(store.get("Cam", names::CONNECTION).unwrap().state, PropertyState::Ok);
    }

    #[tokio::test]
    async fn request_while_busy_is_ignored() {
        let store = Arc::new(MemoryPropertyStore::new());
        let machine = machine(&store);
        store
            .set_state("Cam", names::CONNECTION, PropertyState::Busy)
            .unwrap();

        let change = PropertyChange::switch(names::CONNECTION, names::CONNECTION_CONNECTED);
        assert_eq!(machine.request(&change), None);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }
}
