//! In-process transport backend.
//!
//! A [`MemoryNetwork`] plays the signaling server: transports register an
//! id with it and dial each other by id. Links are pairs of unbounded
//! channels, so per-link ordering matches an ordered-reliable data channel.
//!
//! The network also exposes fault injection (signaling outage, failing sends
//! on one link) and dial counters so connection policies can be tested
//! without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Link, LinkEvent, LinkSender, Transport, TransportError};
use crate::PeerId;

/// Shared in-process signaling hub.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    /// Registered peers → their accept queue
    peers: HashMap<PeerId, mpsc::UnboundedSender<Link>>,
    /// Dial attempts per target id
    dial_attempts: HashMap<PeerId, usize>,
    /// Fault flags per (owner, remote) sending half
    faults: HashMap<(PeerId, PeerId), Arc<AtomicBool>>,
    offline: bool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network whose signaling is down: every `open` fails.
    pub fn offline() -> Self {
        let network = Self::default();
        network.set_signaling_available(false);
        network
    }

    /// Create a transport attached to this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
        }
    }

    pub fn set_signaling_available(&self, available: bool) {
        self.lock().offline = !available;
    }

    /// Number of `dial` calls that targeted `peer`.
    pub fn dial_attempts(&self, peer: &PeerId) -> usize {
        self.lock().dial_attempts.get(peer).copied().unwrap_or(0)
    }

    pub fn is_registered(&self, peer: &PeerId) -> bool {
        self.lock().peers.contains_key(peer)
    }

    /// Make every send from `owner` to `remote` fail from now on.
    pub fn fail_sends(&self, owner: &PeerId, remote: &PeerId) {
        let inner = self.lock();
        if let Some(flag) = inner.faults.get(&(owner.clone(), remote.clone())) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        // A poisoned hub only happens after a panic in a test thread.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sending half of an in-memory link.
struct MemoryLinkSender {
    tx: mpsc::UnboundedSender<LinkEvent>,
    /// Shared by both ends of the link
    open: Arc<AtomicBool>,
    fail: Arc<AtomicBool>,
}

impl LinkSender for MemoryLinkSender {
    fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("injected failure".into()));
        }
        self.tx.send(LinkEvent::Data(frame.to_string())).map_err(|_| {
            self.open.store(false, Ordering::SeqCst);
            TransportError::Closed
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(LinkEvent::Closed);
        }
    }
}

/// A transport endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: Mutex<Option<PeerId>>,
    incoming: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Link>>>,
}

impl MemoryTransport {
    pub fn local_id(&self) -> Option<PeerId> {
        self.local.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_local(&self, id: Option<PeerId>) -> Option<PeerId> {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *local, id)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, local_id: Option<PeerId>) -> Result<PeerId, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.network.lock();
            if inner.offline {
                return Err(TransportError::Unavailable("memory signaling offline".into()));
            }
            if let Some(previous) = self.local_id() {
                inner.peers.remove(&previous);
            }
            let id = local_id.unwrap_or_else(PeerId::random);
            if inner.peers.contains_key(&id) {
                return Err(TransportError::IdInUse(id));
            }
            inner.peers.insert(id.clone(), tx);
            id
        };
        self.set_local(Some(id.clone()));
        *self.incoming.lock().await = Some(rx);
        log::debug!("Memory transport registered as {id}");
        Ok(id)
    }

    async fn dial(&self, remote: &PeerId) -> Result<Link, TransportError> {
        let local = self.local_id().ok_or(TransportError::NotOpened)?;
        let mut inner = self.network.lock();
        *inner.dial_attempts.entry(remote.clone()).or_insert(0) += 1;

        if inner.offline {
            return Err(TransportError::Unavailable("memory signaling offline".into()));
        }
        let acceptor = inner
            .peers
            .get(remote)
            .cloned()
            .ok_or_else(|| TransportError::PeerUnavailable(remote.clone()))?;

        let (to_acceptor, acceptor_events) = mpsc::unbounded_channel();
        let (to_dialer, dialer_events) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let dialer_fail = Arc::new(AtomicBool::new(false));
        let acceptor_fail = Arc::new(AtomicBool::new(false));

        let dialer_link = Link {
            peer_id: remote.clone(),
            sender: Arc::new(MemoryLinkSender {
                tx: to_acceptor,
                open: open.clone(),
                fail: dialer_fail.clone(),
            }),
            events: dialer_events,
        };
        let acceptor_link = Link {
            peer_id: local.clone(),
            sender: Arc::new(MemoryLinkSender {
                tx: to_dialer,
                open,
                fail: acceptor_fail.clone(),
            }),
            events: acceptor_events,
        };

        acceptor
            .send(acceptor_link)
            .map_err(|_| TransportError::PeerUnavailable(remote.clone()))?;

        inner.faults.insert((local.clone(), remote.clone()), dialer_fail);
        inner.faults.insert((remote.clone(), local), acceptor_fail);
        Ok(dialer_link)
    }

    async fn accept(&self) -> Option<Link> {
        let mut incoming = self.incoming.lock().await;
        match incoming.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn shutdown(&self) {
        if let Some(id) = self.set_local(None) {
            self.network.lock().peers.remove(&id);
            log::debug!("Memory transport {id} unregistered");
        }
    }
}
