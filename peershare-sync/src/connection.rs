//! Connection manager: owns every live link of one peer and fans state out
//! to them.
//!
//! ```text
//!  broadcast(state)
//!      │
//!      ├─ no links ──────────────► cache (cold start), Cached
//!      ├─ inside throttle window ─► drop, Throttled
//!      ├─ compress? ─ delta? ─────► one SyncPacket
//!      ▼
//!  ┌────────┬────────┬────────┐
//!  │ link A │ link B │ link C │   failed / closed links are evicted,
//!  └────────┴────────┴────────┘   the rest still receive
//! ```
//!
//! Every registered link gets a pump task forwarding its events, tagged
//! with the peer id and a generation number, into a single inbox. A
//! reconnect from the same peer id replaces the previous link; events from
//! the replaced generation are recognisable as stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::compressor;
use crate::config::{SyncConfig, TransmissionMode};
use crate::delta::{compress_changes, DeltaEngine};
use crate::error::SyncError;
use crate::performance::PerformanceMonitor;
use crate::protocol::{now_millis, PacketType, SyncPacket};
use crate::transport::{Link, LinkEvent, LinkSender, Transport};
use crate::PeerId;

/// A link event tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub peer_id: PeerId,
    pub generation: u64,
    pub event: LinkEvent,
}

/// Roster entry exposed to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerInfo {
    pub id: PeerId,
    /// Epoch milliseconds
    pub join_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingOutcome {
    Accepted,
    /// Closed immediately: the viewer cap was reached
    Rejected,
}

/// Result of one broadcast call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// No links; the state was cached for late joiners
    Cached,
    /// Dropped inside the throttle window
    Throttled,
    /// Delta mode found nothing to send
    Unchanged,
    Sent {
        delivered: usize,
        evicted: Vec<PeerId>,
    },
}

/// One live link.
pub struct ConnectionHandle {
    pub peer_id: PeerId,
    /// Epoch milliseconds
    pub join_time: u64,
    pub generation: u64,
    sender: Arc<dyn LinkSender>,
    pump: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn is_open(&self) -> bool {
        self.sender.is_open()
    }

    fn close(&self) {
        self.sender.close();
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer_id", &self.peer_id)
            .field("join_time", &self.join_time)
            .field("generation", &self.generation)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Dial `remote`, giving up after `timeout`.
pub async fn dial_with_timeout(
    transport: &dyn Transport,
    remote: &PeerId,
    timeout: Duration,
) -> Result<Link, SyncError> {
    match tokio::time::timeout(timeout, transport.dial(remote)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(SyncError::ConnectionTimeout {
            peer: remote.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    viewer_cap: usize,
    throttle_interval: Duration,
    transmission: TransmissionMode,
    compression: bool,
    local_id: Option<PeerId>,
    connections: HashMap<PeerId, ConnectionHandle>,
    /// Last broadcast state, wire form
    cached_state: Option<Value>,
    last_broadcast: Option<Instant>,
    delta: DeltaEngine,
    monitor: Arc<PerformanceMonitor>,
    inbox: mpsc::UnboundedSender<Inbound>,
    next_generation: u64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &SyncConfig,
        monitor: Arc<PerformanceMonitor>,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            transport,
            viewer_cap: config.viewer_cap,
            throttle_interval: config.connection_throttle,
            transmission: config.transmission,
            compression: config.compression,
            local_id: None,
            connections: HashMap::new(),
            cached_state: None,
            last_broadcast: None,
            delta: DeltaEngine::new(),
            monitor,
            inbox,
            next_generation: 0,
        }
    }

    /// Register the local identity with the transport's signaling.
    pub async fn init(&mut self, local_id: Option<PeerId>) -> Result<PeerId, SyncError> {
        let id = self
            .transport
            .open(local_id)
            .await
            .map_err(SyncError::from_open)?;
        log::info!("Peer initialized as {id}");
        self.local_id = Some(id.clone());
        Ok(id)
    }

    /// Register a link this side dialed. Never subject to the viewer cap.
    pub fn register_outbound(&mut self, link: Link) -> u64 {
        self.register(link)
    }

    /// Admit an inbound link, or close it when the cap is reached.
    /// A cached state is pushed to the newcomer as `initial-state`.
    pub fn handle_incoming(&mut self, link: Link) -> IncomingOutcome {
        self.prune_closed();

        let replacing = self.connections.contains_key(&link.peer_id);
        if !replacing && self.connections.len() >= self.viewer_cap {
            log::warn!(
                "Rejecting {}: {}",
                link.peer_id,
                SyncError::CapacityExceeded { cap: self.viewer_cap }
            );
            link.sender.close();
            return IncomingOutcome::Rejected;
        }

        let peer_id = link.peer_id.clone();
        self.register(link);
        log::info!(
            "Viewer {peer_id} connected ({}/{})",
            self.connections.len(),
            self.viewer_cap
        );

        if let Err(e) = self.send_initial_state(&peer_id) {
            log::warn!("Initial state push to {peer_id} failed: {e}");
        }
        IncomingOutcome::Accepted
    }

    fn register(&mut self, link: Link) -> u64 {
        let Link {
            peer_id,
            sender,
            mut events,
        } = link;

        self.next_generation += 1;
        let generation = self.next_generation;

        let inbox = self.inbox.clone();
        let origin = peer_id.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = event == LinkEvent::Closed;
                let inbound = Inbound {
                    peer_id: origin.clone(),
                    generation,
                    event,
                };
                if inbox.send(inbound).is_err() || closed {
                    return;
                }
            }
            let _ = inbox.send(Inbound {
                peer_id: origin,
                generation,
                event: LinkEvent::Closed,
            });
        });

        let handle = ConnectionHandle {
            peer_id: peer_id.clone(),
            join_time: now_millis(),
            generation,
            sender,
            pump,
        };
        if let Some(previous) = self.connections.insert(peer_id, handle) {
            log::debug!("Replaced link to {} (generation {})", previous.peer_id, previous.generation);
            previous.close();
        }
        generation
    }

    /// Drop handles whose link already closed.
    fn prune_closed(&mut self) {
        self.connections.retain(|peer, handle| {
            let open = handle.is_open();
            if !open {
                log::debug!("Pruning closed link to {peer}");
            }
            open
        });
    }

    /// Push the current state to every link.
    pub fn broadcast(&mut self, state: &Value, kind: PacketType) -> Result<BroadcastOutcome, SyncError> {
        let started = Instant::now();
        let wire = if self.compression {
            compressor::compress(state)
        } else {
            state.clone()
        };

        if self.connections.is_empty() {
            log::debug!("No viewers connected, caching state");
            self.delta.set_snapshot(wire.clone());
            self.cached_state = Some(wire);
            return Ok(BroadcastOutcome::Cached);
        }

        if let Some(last) = self.last_broadcast {
            if started.duration_since(last) < self.throttle_interval {
                return Ok(BroadcastOutcome::Throttled);
            }
        }

        let packet = match self.transmission {
            TransmissionMode::Delta => {
                let changes = self.delta.calculate_delta(&wire);
                if changes.is_empty() {
                    return Ok(BroadcastOutcome::Unchanged);
                }
                SyncPacket::new(PacketType::DeltaUpdate, compress_changes(&changes))
            }
            TransmissionMode::Full => {
                self.delta.set_snapshot(wire.clone());
                SyncPacket::new(kind, wire.clone())
            }
        }
        .with_compressed(self.compression);
        // Only a packet that goes out opens a throttle window
        self.last_broadcast = Some(started);
        self.cached_state = Some(wire);

        let frame = packet.encode()?;
        let (delivered, evicted) = self.fan_out(&frame);
        self.monitor.record_sync(started.elapsed());

        log::debug!(
            "Broadcast {} to {delivered} viewer(s), {} evicted",
            packet.kind,
            evicted.len()
        );
        Ok(BroadcastOutcome::Sent { delivered, evicted })
    }

    /// Un-throttled, non-caching fan-out (cursor moves, actions).
    pub fn send_transient(&mut self, content: Value, kind: PacketType) -> Result<BroadcastOutcome, SyncError> {
        let frame = SyncPacket::new(kind, content).encode()?;
        let (delivered, evicted) = self.fan_out(&frame);
        Ok(BroadcastOutcome::Sent { delivered, evicted })
    }

    fn fan_out(&mut self, frame: &str) -> (usize, Vec<PeerId>) {
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for (peer, handle) in &self.connections {
            if !handle.is_open() {
                log::warn!("Link to {peer} is closed, evicting");
                evicted.push(peer.clone());
                continue;
            }
            match handle.sender.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Send to {peer} failed, evicting: {e}");
                    evicted.push(peer.clone());
                }
            }
        }

        for peer in &evicted {
            self.monitor.record_error();
            if let Some(handle) = self.connections.remove(peer) {
                handle.close();
            }
        }
        (delivered, evicted)
    }

    /// Point-to-point send. A failure evicts the link.
    pub fn send_to(&mut self, peer: &PeerId, content: Value, kind: PacketType) -> Result<(), SyncError> {
        let handle = self
            .connections
            .get(peer)
            .ok_or_else(|| SyncError::UnknownPeer(peer.clone()))?;

        let frame = SyncPacket::new(kind, content)
            .with_compressed(self.compression && kind.is_snapshot())
            .encode()?;

        let result = if handle.is_open() {
            handle.sender.send(&frame)
        } else {
            Err(crate::transport::TransportError::Closed)
        };

        result.map_err(|e| {
            self.monitor.record_error();
            if let Some(handle) = self.connections.remove(peer) {
                handle.close();
            }
            SyncError::SendFailure {
                peer: peer.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Send the cached state as `initial-state`. `Ok(false)` when nothing is
    /// cached yet.
    pub fn send_initial_state(&mut self, peer: &PeerId) -> Result<bool, SyncError> {
        let Some(state) = self.cached_state.clone() else {
            return Ok(false);
        };
        self.send_to(peer, state, PacketType::InitialState)?;
        Ok(true)
    }

    /// Roster sorted by join time.
    pub fn viewers(&self) -> Vec<ViewerInfo> {
        let mut viewers: Vec<ViewerInfo> = self
            .connections
            .values()
            .filter(|handle| handle.is_open())
            .map(|handle| ViewerInfo {
                id: handle.peer_id.clone(),
                join_time: handle.join_time,
            })
            .collect();
        viewers.sort_by(|a, b| a.join_time.cmp(&b.join_time).then_with(|| a.id.cmp(&b.id)));
        viewers
    }

    /// Whether `generation` is the live link to `peer`.
    pub fn is_current(&self, peer: &PeerId, generation: u64) -> bool {
        self.connections
            .get(peer)
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Forget `peer` if its live link is `generation`.
    pub fn remove(&mut self, peer: &PeerId, generation: u64) -> bool {
        if !self.is_current(peer, generation) {
            return false;
        }
        if let Some(handle) = self.connections.remove(peer) {
            handle.close();
            log::info!("Peer {peer} disconnected");
        }
        true
    }

    /// Close the link to `peer`, whatever its generation.
    pub fn disconnect(&mut self, peer: &PeerId) {
        if let Some(handle) = self.connections.remove(peer) {
            handle.close();
        }
    }

    pub fn close_all(&mut self) {
        for (_, handle) in self.connections.drain() {
            handle.close();
        }
    }

    /// Links currently registered, open or not yet pruned.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn cached_state(&self) -> Option<&Value> {
        self.cached_state.as_ref()
    }

    pub fn set_throttle_interval(&mut self, interval: Duration) {
        self.throttle_interval = interval;
    }

    pub fn throttle_interval(&self) -> Duration {
        self.throttle_interval
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
