//! Share session: the host / viewer state machine on top of the
//! [`ConnectionManager`].
//!
//! ```text
//!            create_share                      stop_sharing
//!   Idle ─────────────────► Host/Connected ───────────────► Idle
//!     │
//!     │ join_share
//!     ▼
//!   Viewer/Connecting ──► Viewer/Connected ──(host link lost)──► Disconnected
//!     │      ▲   │
//!     │      └───┘ failed attempt, backoff reconnect_delay × attempt
//!     └──(attempts exhausted)──► Error
//! ```
//!
//! All link events of a session flow through one inbox consumed by a single
//! event-loop task, so inbound handling is serialized. Session state lives
//! behind one async mutex shared by the application-facing API, the accept
//! loop, the event loop and the viewer's connect driver.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

use crate::compressor;
use crate::config::SyncConfig;
use crate::connection::{
    dial_with_timeout, BroadcastOutcome, ConnectionManager, Inbound, IncomingOutcome, ViewerInfo,
};
use crate::delta::{apply_delta, decompress_changes};
use crate::error::SyncError;
use crate::performance::{
    get_optimized_config, NetworkQuality, OptimizeThresholds, PerformanceMetrics, PerformanceMonitor,
};
use crate::protocol::{now_millis, PacketType, SyncPacket};
use crate::share_link;
use crate::storage::{SessionMetadata, StorageAdapter};
use crate::transport::{LinkEvent, Transport, TransportError};
use crate::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    /// Viewer gave up after its reconnect attempts
    Error,
    /// Viewer lost its host after a successful sync
    Disconnected,
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    /// Viewer mirror replaced; `state` is already decompressed
    StateReceived {
        state: Value,
        packet_type: PacketType,
        last_update: u64,
    },
    ViewersChanged(Vec<ViewerInfo>),
    CursorMoved {
        peer_id: PeerId,
        position: Value,
    },
    Action {
        peer_id: PeerId,
        action: Value,
    },
}

/// Viewer progress towards its first snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ViewerSignal {
    Waiting,
    Synced,
    LinkLost,
}

/// Viewer's copy of the host state, in wire form.
#[derive(Debug, Clone)]
struct Mirror {
    state: Value,
    last_update: u64,
    compressed: bool,
}

impl Mirror {
    fn view(&self) -> Value {
        if self.compressed {
            compressor::decompress(&self.state)
        } else {
            self.state.clone()
        }
    }
}

struct SessionCore {
    config: SyncConfig,
    role: Option<Role>,
    status: SessionStatus,
    local_id: Option<PeerId>,
    host_id: Option<PeerId>,
    /// Generation of the viewer's live host link
    host_generation: Option<u64>,
    manager: Option<ConnectionManager>,
    last_sync: Option<Instant>,
    last_cursor: Option<Instant>,
    mirror: Option<Mirror>,
    signal: watch::Sender<ViewerSignal>,
    quality: NetworkQuality,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionCore {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.status != status {
            log::debug!("Session status {:?} -> {:?}", self.status, status);
            self.status = status;
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn emit_roster(&self) {
        if let Some(manager) = &self.manager {
            self.emit(SessionEvent::ViewersChanged(manager.viewers()));
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match self.role {
            Some(Role::Host) => self.handle_host_inbound(inbound),
            Some(Role::Viewer) => self.handle_viewer_inbound(inbound),
            None => {}
        }
    }

    fn handle_host_inbound(&mut self, inbound: Inbound) {
        let Inbound {
            peer_id,
            generation,
            event,
        } = inbound;
        let Some(manager) = self.manager.as_mut() else {
            return;
        };

        let frame = match event {
            LinkEvent::Closed => {
                if manager.remove(&peer_id, generation) {
                    self.emit_roster();
                }
                return;
            }
            LinkEvent::Data(frame) => frame,
        };
        if !manager.is_current(&peer_id, generation) {
            return;
        }

        let packet = match SyncPacket::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping malformed frame from {peer_id}: {e}");
                return;
            }
        };

        match packet.kind {
            PacketType::RequestInitialState => match manager.send_initial_state(&peer_id) {
                Ok(true) => log::debug!("Sent initial state to {peer_id}"),
                Ok(false) => log::debug!("{peer_id} requested state before any was set"),
                Err(e) => {
                    log::warn!("Initial state reply to {peer_id} failed: {e}");
                    self.emit_roster();
                }
            },
            PacketType::CursorMove => self.emit(SessionEvent::CursorMoved {
                peer_id,
                position: packet.content,
            }),
            PacketType::Action => self.emit(SessionEvent::Action {
                peer_id,
                action: packet.content,
            }),
            other => log::debug!("Host ignores {other} from {peer_id}"),
        }
    }

    fn handle_viewer_inbound(&mut self, inbound: Inbound) {
        if self.host_generation != Some(inbound.generation) {
            return;
        }

        let frame = match inbound.event {
            LinkEvent::Closed => {
                self.host_generation = None;
                if let Some(manager) = self.manager.as_mut() {
                    manager.disconnect(&inbound.peer_id);
                }
                if self.mirror.is_some() {
                    log::info!("Lost connection to host {}", inbound.peer_id);
                    self.set_status(SessionStatus::Disconnected);
                }
                self.signal.send_replace(ViewerSignal::LinkLost);
                return;
            }
            LinkEvent::Data(frame) => frame,
        };

        let packet = match SyncPacket::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping malformed frame from host: {e}");
                return;
            }
        };

        match packet.kind {
            PacketType::StateUpdate | PacketType::InitialState => {
                if self.is_stale(packet.last_update) {
                    return;
                }
                self.accept_state(packet.content, packet.kind, packet.last_update, packet.compressed);
            }
            PacketType::DeltaUpdate => self.apply_delta_packet(packet),
            PacketType::CursorMove => self.emit(SessionEvent::CursorMoved {
                peer_id: inbound.peer_id,
                position: packet.content,
            }),
            PacketType::Action => self.emit(SessionEvent::Action {
                peer_id: inbound.peer_id,
                action: packet.content,
            }),
            PacketType::RequestInitialState => {
                log::debug!("Viewer ignores request-initial-state");
            }
        }
    }

    /// Greatest `lastUpdate` wins, never arrival order.
    fn is_stale(&self, last_update: u64) -> bool {
        let stale = self
            .mirror
            .as_ref()
            .is_some_and(|mirror| last_update < mirror.last_update);
        if stale {
            log::debug!("Discarding stale packet stamped {last_update}");
        }
        stale
    }

    fn apply_delta_packet(&mut self, packet: SyncPacket) {
        if self.is_stale(packet.last_update) {
            return;
        }
        let changes = match decompress_changes(&packet.content) {
            Ok(changes) => changes,
            Err(e) => {
                log::warn!("Dropping malformed delta: {e}");
                return;
            }
        };

        let state = if let Some(mirror) = &self.mirror {
            apply_delta(&mirror.state, &changes)
        } else if changes.first().is_some_and(|c| c.is_root_add()) {
            apply_delta(&Value::Null, &changes)
        } else {
            log::debug!("Delta without a base snapshot, requesting initial state");
            self.request_initial_state();
            return;
        };
        self.accept_state(state, PacketType::DeltaUpdate, packet.last_update, packet.compressed);
    }

    fn accept_state(&mut self, state: Value, packet_type: PacketType, last_update: u64, compressed: bool) {
        let mirror = Mirror {
            state,
            last_update,
            compressed,
        };
        let view = mirror.view();
        self.mirror = Some(mirror);
        self.signal.send_replace(ViewerSignal::Synced);
        self.emit(SessionEvent::StateReceived {
            state: view,
            packet_type,
            last_update,
        });
    }

    fn request_initial_state(&mut self) {
        let (Some(host), Some(manager)) = (self.host_id.clone(), self.manager.as_mut()) else {
            return;
        };
        if let Err(e) = manager.send_to(&host, Value::Null, PacketType::RequestInitialState) {
            log::warn!("State request to {host} failed: {e}");
        }
    }

    /// Release links and cached data, back to idle.
    fn reset(&mut self) {
        if let Some(mut manager) = self.manager.take() {
            manager.close_all();
        }
        self.role = None;
        self.host_id = None;
        self.host_generation = None;
        self.local_id = None;
        self.mirror = None;
        self.last_sync = None;
        self.last_cursor = None;
        self.signal.send_replace(ViewerSignal::Waiting);
    }
}

/// One peer's share session.
pub struct ShareSession {
    transport: Arc<dyn Transport>,
    storage: Option<Arc<dyn StorageAdapter>>,
    monitor: Arc<PerformanceMonitor>,
    preferred_id: Option<PeerId>,
    core: Arc<Mutex<SessionCore>>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ShareSession {
    pub fn new(transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (signal, _) = watch::channel(ViewerSignal::Waiting);
        let core = SessionCore {
            config,
            role: None,
            status: SessionStatus::Idle,
            local_id: None,
            host_id: None,
            host_generation: None,
            manager: None,
            last_sync: None,
            last_cursor: None,
            mirror: None,
            signal,
            quality: NetworkQuality::Good,
            events,
        };
        Self {
            transport,
            storage: None,
            monitor: Arc::new(PerformanceMonitor::new()),
            preferred_id: None,
            core: Arc::new(Mutex::new(core)),
            event_rx: Some(event_rx),
            tasks: Vec::new(),
        }
    }

    /// Persist session metadata through `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Limits past which [`ShareSession::adapt`] steps down a tier.
    pub fn with_thresholds(mut self, thresholds: OptimizeThresholds) -> Self {
        self.monitor = Arc::new(PerformanceMonitor::with_thresholds(thresholds));
        self
    }

    /// Ask the transport for this identity instead of a random one.
    pub fn with_peer_id(mut self, id: impl Into<PeerId>) -> Self {
        self.preferred_id = Some(id.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Start hosting. `initial_state`, when given, is cached and served to
    /// the first viewers as `initial-state`. Returns the share id.
    pub async fn create_share(&mut self, initial_state: Option<&Value>) -> Result<PeerId, SyncError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut manager = self.prepare(inbox_tx).await?;

        let id = match manager.init(self.preferred_id.clone()).await {
            Ok(id) => id,
            Err(e) => {
                self.core.lock().await.set_status(SessionStatus::Error);
                return Err(e);
            }
        };
        if let Some(state) = initial_state {
            manager.broadcast(state, PacketType::StateUpdate)?;
        }

        let metadata = {
            let mut core = self.core.lock().await;
            core.role = Some(Role::Host);
            core.local_id = Some(id.clone());
            core.manager = Some(manager);
            core.set_status(SessionStatus::Connected);
            SessionMetadata {
                share_id: id.clone(),
                role: Role::Host,
                created_at: now_millis(),
                viewer_cap: core.config.viewer_cap,
                transmission: core.config.transmission,
                compression: core.config.compression,
            }
        };

        if let Some(storage) = &self.storage {
            if let Err(e) = metadata.save(storage.as_ref()) {
                log::warn!("Could not persist metadata for share {id}: {e}");
            }
        }

        self.tasks.push(tokio::spawn(accept_loop(
            self.transport.clone(),
            self.core.clone(),
        )));
        self.tasks.push(tokio::spawn(event_loop(self.core.clone(), inbox_rx)));

        log::info!("Sharing as {id}");
        Ok(id)
    }

    /// Start viewing `host`. Returns once the local identity is registered;
    /// connecting, syncing and retries continue in the background and are
    /// reported through [`SessionEvent::StatusChanged`].
    pub async fn join_share(&mut self, host: PeerId) -> Result<(), SyncError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut manager = self.prepare(inbox_tx).await?;

        let id = match manager.init(self.preferred_id.clone()).await {
            Ok(id) => id,
            Err(e) => {
                self.core.lock().await.set_status(SessionStatus::Error);
                return Err(e);
            }
        };

        {
            let mut core = self.core.lock().await;
            core.role = Some(Role::Viewer);
            core.local_id = Some(id);
            core.host_id = Some(host.clone());
            core.manager = Some(manager);
            core.set_status(SessionStatus::Connecting);
        }

        self.tasks.push(tokio::spawn(event_loop(self.core.clone(), inbox_rx)));
        self.tasks.push(tokio::spawn(drive_viewer(
            self.transport.clone(),
            self.core.clone(),
            host,
        )));
        Ok(())
    }

    /// Tear down any previous run and build a fresh manager.
    async fn prepare(&mut self, inbox: mpsc::UnboundedSender<Inbound>) -> Result<ConnectionManager, SyncError> {
        let config = {
            let core = self.core.lock().await;
            if matches!(core.status, SessionStatus::Connecting | SessionStatus::Connected) {
                return Err(SyncError::AlreadyActive);
            }
            core.config.clone()
        };
        self.teardown().await;
        Ok(ConnectionManager::new(
            self.transport.clone(),
            &config,
            self.monitor.clone(),
            inbox,
        ))
    }

    async fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.core.lock().await.reset();
        self.transport.shutdown().await;
    }

    /// Push a new host state to every viewer. Both the session throttle and
    /// the connection throttle must pass. With no viewers the state is only
    /// cached.
    pub async fn sync_data(&self, state: &Value) -> Result<BroadcastOutcome, SyncError> {
        let mut core = self.core.lock().await;
        match core.role {
            Some(Role::Host) => {}
            Some(Role::Viewer) => return Err(SyncError::WrongRole { expected: "host" }),
            None => return Err(SyncError::NotActive),
        }

        let now = Instant::now();
        let session_throttle = core.config.session_throttle;
        let has_viewers = core
            .manager
            .as_ref()
            .is_some_and(|manager| manager.connection_count() > 0);

        if has_viewers {
            if let Some(last) = core.last_sync {
                if now.duration_since(last) < session_throttle {
                    return Ok(BroadcastOutcome::Throttled);
                }
            }
            core.last_sync = Some(now);
        }

        let manager = core.manager.as_mut().ok_or(SyncError::NotActive)?;
        let outcome = manager.broadcast(state, PacketType::StateUpdate)?;
        if let BroadcastOutcome::Sent { evicted, .. } = &outcome {
            if !evicted.is_empty() {
                core.emit_roster();
            }
        }
        Ok(outcome)
    }

    /// Send a pointer position, at most once per `cursor_interval`.
    /// Returns whether it was sent.
    pub async fn send_cursor(&self, position: Value) -> Result<bool, SyncError> {
        let mut core = self.core.lock().await;
        let now = Instant::now();
        if let Some(last) = core.last_cursor {
            if now.duration_since(last) < core.config.cursor_interval {
                return Ok(false);
            }
        }
        core.last_cursor = Some(now);
        Self::send_to_peers(&mut core, position, PacketType::CursorMove)?;
        Ok(true)
    }

    /// Send an application action: viewer → host, or host → every viewer.
    pub async fn send_action(&self, action: Value) -> Result<(), SyncError> {
        let mut core = self.core.lock().await;
        Self::send_to_peers(&mut core, action, PacketType::Action)
    }

    fn send_to_peers(core: &mut SessionCore, content: Value, kind: PacketType) -> Result<(), SyncError> {
        let role = core.role.ok_or(SyncError::NotActive)?;
        let host = core.host_id.clone();
        let manager = core.manager.as_mut().ok_or(SyncError::NotActive)?;
        match role {
            Role::Host => {
                let outcome = manager.send_transient(content, kind)?;
                if let BroadcastOutcome::Sent { evicted, .. } = &outcome {
                    if !evicted.is_empty() {
                        core.emit_roster();
                    }
                }
                Ok(())
            }
            Role::Viewer => {
                let host = host.ok_or(SyncError::NotActive)?;
                manager.send_to(&host, content, kind)
            }
        }
    }

    /// Close every link, stop background work and return to idle.
    pub async fn stop_sharing(&mut self) {
        self.teardown().await;
        self.core.lock().await.set_status(SessionStatus::Idle);
        log::info!("Sharing stopped");
    }

    /// The viewer's current copy of the host state.
    pub async fn viewer_state(&self) -> Option<Value> {
        self.core.lock().await.mirror.as_ref().map(Mirror::view)
    }

    /// Connected viewers (host only; empty otherwise).
    pub async fn viewers(&self) -> Vec<ViewerInfo> {
        let core = self.core.lock().await;
        match (core.role, &core.manager) {
            (Some(Role::Host), Some(manager)) => manager.viewers(),
            _ => Vec::new(),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        self.core.lock().await.status
    }

    pub async fn role(&self) -> Option<Role> {
        self.core.lock().await.role
    }

    pub async fn local_id(&self) -> Option<PeerId> {
        self.core.lock().await.local_id.clone()
    }

    pub async fn config(&self) -> SyncConfig {
        self.core.lock().await.config.clone()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.monitor.snapshot()
    }

    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        self.monitor.clone()
    }

    pub async fn network_quality(&self) -> NetworkQuality {
        self.core.lock().await.quality
    }

    /// Retune throttles and timeouts for a network tier.
    pub async fn apply_network_quality(&self, quality: NetworkQuality) {
        let profile = get_optimized_config(quality);
        let mut core = self.core.lock().await;
        core.quality = quality;
        core.config.apply_profile(&profile);
        if let Some(manager) = core.manager.as_mut() {
            manager.set_throttle_interval(profile.throttle_interval);
        }
        log::info!(
            "Network quality {quality:?}: throttle {:?}, session throttle {:?}",
            profile.throttle_interval,
            profile.session_throttle_interval
        );
    }

    /// Step down one quality tier when the monitor reports pressure.
    /// Metrics restart after a downgrade. Returns the new tier, if any.
    pub async fn adapt(&self) -> Option<NetworkQuality> {
        self.monitor.sample_memory();
        if !self.monitor.should_optimize() {
            return None;
        }
        let current = self.network_quality().await;
        let next = current.degrade();
        if next == current {
            return None;
        }
        self.apply_network_quality(next).await;
        self.monitor.reset();
        Some(next)
    }

    /// Share link for this host on top of `base`.
    pub async fn share_link(&self, base: &Url) -> Option<Url> {
        let core = self.core.lock().await;
        match (core.role, &core.local_id) {
            (Some(Role::Host), Some(id)) => Some(share_link::share_url(base, id)),
            _ => None,
        }
    }
}

impl Drop for ShareSession {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Admit inbound links until the transport shuts down.
async fn accept_loop(transport: Arc<dyn Transport>, core: Arc<Mutex<SessionCore>>) {
    while let Some(link) = transport.accept().await {
        let mut core = core.lock().await;
        let Some(manager) = core.manager.as_mut() else {
            link.sender.close();
            continue;
        };
        if manager.handle_incoming(link) == IncomingOutcome::Accepted {
            core.emit_roster();
        }
    }
    log::debug!("Accept loop finished");
}

async fn event_loop(core: Arc<Mutex<SessionCore>>, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(inbound) = inbox.recv().await {
        if matches!(inbound.event, LinkEvent::Data(_)) {
            let delay = {
                let core = core.lock().await;
                match core.role {
                    Some(Role::Viewer) => core.config.processing_delay,
                    _ => Duration::ZERO,
                }
            };
            // Sleep outside the lock
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        core.lock().await.handle_inbound(inbound);
    }
}

/// Viewer connect loop: bounded attempts with linear backoff.
async fn drive_viewer(transport: Arc<dyn Transport>, core: Arc<Mutex<SessionCore>>, host: PeerId) {
    let (max_attempts, mut signal) = {
        let core = core.lock().await;
        (core.config.max_reconnect_attempts.max(1), core.signal.subscribe())
    };

    for attempt in 1..=max_attempts {
        // Quality changes between attempts retune timeouts and backoff
        let config = core.lock().await.config.clone();
        match viewer_attempt(&transport, &core, &host, &config, &mut signal).await {
            Ok(()) => {
                log::info!("Synced with host {host}");
                return;
            }
            Err(e) => {
                log::warn!("Join attempt {attempt}/{max_attempts} to {host} failed: {e}");
                {
                    let mut core = core.lock().await;
                    core.host_generation = None;
                    if let Some(manager) = core.manager.as_mut() {
                        manager.disconnect(&host);
                    }
                }
                if attempt < max_attempts {
                    tokio::time::sleep(config.reconnect_delay * attempt).await;
                }
            }
        }
    }

    log::error!("Giving up on host {host} after {max_attempts} attempts");
    core.lock().await.set_status(SessionStatus::Error);
}

async fn viewer_attempt(
    transport: &Arc<dyn Transport>,
    core: &Arc<Mutex<SessionCore>>,
    host: &PeerId,
    config: &SyncConfig,
    signal: &mut watch::Receiver<ViewerSignal>,
) -> Result<(), SyncError> {
    {
        let mut core = core.lock().await;
        core.signal.send_replace(ViewerSignal::Waiting);
        core.set_status(SessionStatus::Connecting);
    }

    let link = dial_with_timeout(transport.as_ref(), host, config.connect_timeout).await?;
    {
        let mut core = core.lock().await;
        let manager = core.manager.as_mut().ok_or(SyncError::NotActive)?;
        let generation = manager.register_outbound(link);
        core.host_generation = Some(generation);
        core.set_status(SessionStatus::Connected);
    }

    tokio::time::sleep(config.viewer_warmup).await;

    let current = *signal.borrow_and_update();
    match current {
        ViewerSignal::Synced => return Ok(()),
        ViewerSignal::LinkLost => return Err(SyncError::Transport(TransportError::Closed)),
        ViewerSignal::Waiting => {
            let mut core = core.lock().await;
            let manager = core.manager.as_mut().ok_or(SyncError::NotActive)?;
            manager.send_to(host, Value::Null, PacketType::RequestInitialState)?;
        }
    }

    let outcome = tokio::time::timeout(
        config.connect_timeout,
        signal.wait_for(|s| *s != ViewerSignal::Waiting),
    )
    .await;

    match outcome {
        Ok(Ok(state)) if *state == ViewerSignal::Synced => Ok(()),
        Ok(_) => Err(SyncError::Transport(TransportError::Closed)),
        Err(_) => Err(SyncError::ConnectionTimeout {
            peer: host.clone(),
            timeout_ms: config.connect_timeout.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> SyncConfig {
        SyncConfig::default()
            .with_viewer_warmup(Duration::from_millis(10))
            .with_connect_timeout(Duration::from_millis(500))
            .with_reconnect(3, Duration::from_millis(100))
    }

    async fn wait_for_status(session: &ShareSession, status: SessionStatus) {
        for _ in 0..500 {
            if session.status().await == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("status never became {status:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_then_viewer_gets_initial_state() {
        let network = MemoryNetwork::new();
        let mut host = ShareSession::new(Arc::new(network.transport()), fast_config());
        let id = host.create_share(Some(&json!({"text": "hello"}))).await.unwrap();
        assert_eq!(host.role().await, Some(Role::Host));
        assert_eq!(host.status().await, SessionStatus::Connected);

        let mut viewer = ShareSession::new(Arc::new(network.transport()), fast_config());
        let mut events = viewer.take_event_rx().unwrap();
        viewer.join_share(id).await.unwrap();

        wait_for_status(&viewer, SessionStatus::Connected).await;
        loop {
            match events.recv().await {
                Some(SessionEvent::StateReceived { state, packet_type, .. }) => {
                    assert_eq!(packet_type, PacketType::InitialState);
                    assert_eq!(state, json!({"text": "hello"}));
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
        assert_eq!(viewer.viewer_state().await, Some(json!({"text": "hello"})));
        assert_eq!(host.viewers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_requires_host_role() {
        let network = MemoryNetwork::new();
        let session = ShareSession::new(Arc::new(network.transport()), SyncConfig::default());
        assert!(matches!(
            session.sync_data(&json!({})).await,
            Err(SyncError::NotActive)
        ));
    }

    #[tokio::test]
    async fn test_create_share_without_signaling() {
        let network = MemoryNetwork::offline();
        let mut session = ShareSession::new(Arc::new(network.transport()), SyncConfig::default());
        let err = session.create_share(None).await.unwrap_err();
        assert!(matches!(err, SyncError::SignalingUnavailable(_)));
        assert_eq!(session.status().await, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_second_create_rejected_while_active() {
        let network = MemoryNetwork::new();
        let mut session = ShareSession::new(Arc::new(network.transport()), SyncConfig::default());
        session.create_share(None).await.unwrap();
        assert!(matches!(
            session.create_share(None).await,
            Err(SyncError::AlreadyActive)
        ));
    }

    #[tokio::test]
    async fn test_stop_sharing_returns_to_idle() {
        let network = MemoryNetwork::new();
        let mut session = ShareSession::new(Arc::new(network.transport()), SyncConfig::default())
            .with_peer_id("host");
        session.create_share(None).await.unwrap();
        assert!(network.is_registered(&"host".into()));

        session.stop_sharing().await;
        assert_eq!(session.status().await, SessionStatus::Idle);
        assert_eq!(session.role().await, None);
        assert!(!network.is_registered(&"host".into()));

        // Can host again afterwards
        session.create_share(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_cold_start_sync_caches_without_throttle() {
        let network = MemoryNetwork::new();
        let mut host = ShareSession::new(Arc::new(network.transport()), SyncConfig::default());
        host.create_share(None).await.unwrap();

        for n in 0..3 {
            let outcome = host.sync_data(&json!({"n": n})).await.unwrap();
            assert_eq!(outcome, BroadcastOutcome::Cached);
        }
    }

    #[tokio::test]
    async fn test_metadata_saved_once() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(crate::storage::MemoryStorage::new());
        let mut host = ShareSession::new(Arc::new(network.transport()), SyncConfig::default())
            .with_storage(storage.clone())
            .with_peer_id("share-1");
        host.create_share(None).await.unwrap();

        let saved = SessionMetadata::load(storage.as_ref(), &"share-1".into())
            .unwrap()
            .unwrap();
        assert_eq!(saved.role, Role::Host);
        assert_eq!(saved.viewer_cap, 3);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn test_share_link_host_only() {
        let network = MemoryNetwork::new();
        let mut host = ShareSession::new(Arc::new(network.transport()), SyncConfig::default())
            .with_peer_id("abc");
        let base = Url::parse("https://app.example/").unwrap();
        assert!(host.share_link(&base).await.is_none());

        host.create_share(None).await.unwrap();
        let link = host.share_link(&base).await.unwrap();
        assert_eq!(share_link::host_from_url(link.as_str()), Some(PeerId::from("abc")));
    }

    #[tokio::test]
    async fn test_apply_network_quality_and_adapt() {
        let network = MemoryNetwork::new();
        let mut host = ShareSession::new(Arc::new(network.transport()), SyncConfig::default())
            .with_thresholds(OptimizeThresholds {
                max_memory_bytes: u64::MAX,
                ..OptimizeThresholds::default()
            });
        host.create_share(None).await.unwrap();

        host.apply_network_quality(NetworkQuality::Fair).await;
        let config = host.config().await;
        assert_eq!(config.connection_throttle, Duration::from_millis(100));
        assert_eq!(config.session_throttle, Duration::from_millis(300));

        assert_eq!(host.adapt().await, None);
        for _ in 0..11 {
            host.monitor().record_error();
        }
        assert_eq!(host.adapt().await, Some(NetworkQuality::Poor));
        assert_eq!(host.network_quality().await, NetworkQuality::Poor);
        assert_eq!(host.metrics().error_count, 0);
    }

    #[tokio::test]
    async fn test_adapt_samples_memory() {
        let network = MemoryNetwork::new();
        let mut host = ShareSession::new(Arc::new(network.transport()), SyncConfig::default())
            .with_thresholds(OptimizeThresholds {
                max_memory_bytes: 0,
                ..OptimizeThresholds::default()
            });
        host.create_share(None).await.unwrap();

        // Platforms without process memory stats have nothing to react to
        if !matches!(host.monitor().sample_memory(), Some(bytes) if bytes > 0) {
            return;
        }
        host.monitor().reset();
        assert_eq!(host.metrics().memory_usage, 0);

        assert_eq!(host.adapt().await, Some(NetworkQuality::Fair));
        assert_eq!(host.network_quality().await, NetworkQuality::Fair);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_processing_delay_defers_state() {
        let network = MemoryNetwork::new();
        let mut host = ShareSession::new(Arc::new(network.transport()), fast_config());
        let id = host.create_share(Some(&json!({"text": "hello"}))).await.unwrap();

        let config = fast_config().with_processing_delay(Duration::from_millis(200));
        let mut viewer = ShareSession::new(Arc::new(network.transport()), config);
        viewer.join_share(id).await.unwrap();

        // Request goes out after the 10ms warmup; the reply waits 200ms
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(viewer.viewer_state().await, None);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(viewer.viewer_state().await, Some(json!({"text": "hello"})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_uses_retuned_timeout() {
        let network = MemoryNetwork::new();
        let silent = network.transport();
        let silent_id = silent.open(Some("silent".into())).await.unwrap();

        let mut viewer = ShareSession::new(Arc::new(network.transport()), fast_config());
        viewer.join_share(silent_id.clone()).await.unwrap();
        while network.dial_attempts(&silent_id) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // First attempt keeps its 500ms timeout, later ones wait 12s
        viewer.apply_network_quality(NetworkQuality::Poor).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(network.dial_attempts(&silent_id), 2);
        assert_eq!(viewer.status().await, SessionStatus::Connecting);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(network.dial_attempts(&silent_id), 3);
        assert_eq!(viewer.status().await, SessionStatus::Error);
    }
}
