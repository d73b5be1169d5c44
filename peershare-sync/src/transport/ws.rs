//! Direct WebSocket backend.
//!
//! ```text
//! viewer ── connect_async(ws://host:port) ──► host listener
//!        ── {"hello": "<viewer id>"} ───────►  accept_async + hello
//!        ◄──────── text frames (JSON packets) ──────────►
//! ```
//!
//! The listening side's peer id is its `ws://addr` URL, so a share link can
//! carry it directly. Each socket gets a writer task (fed by an unbounded
//! channel, which keeps `LinkSender::send` non-blocking) and a reader task
//! that turns frames into [`LinkEvent`]s.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{Link, LinkEvent, LinkSender, Transport, TransportError};
use crate::PeerId;

/// How long an accepted socket may take to introduce itself.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// First frame on every dialed socket.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    hello: PeerId,
}

struct WsLinkSender {
    tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl LinkSender for WsLinkSender {
    fn send(&self, frame: &str) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(Message::Text(frame.to_owned().into()))
            .map_err(|_| {
                self.open.store(false, Ordering::SeqCst);
                TransportError::Closed
            })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Message::Close(None));
        }
    }
}

/// Split a socket into writer/reader tasks and wrap it as a [`Link`].
fn spawn_link<S>(ws: WebSocketStream<S>, peer_id: PeerId) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut writer, mut reader) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, events) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    // Writer task: forward outgoing channel to the socket
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if writer.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = writer.close().await;
    });

    // Reader task: socket frames → link events
    let reader_open = open.clone();
    let remote = peer_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if event_tx.send(LinkEvent::Data(text.as_str().to_owned())).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    log::debug!("WebSocket read error from {remote}: {e}");
                    break;
                }
                _ => {}
            }
        }
        reader_open.store(false, Ordering::SeqCst);
        let _ = event_tx.send(LinkEvent::Closed);
    });

    Link {
        peer_id,
        sender: Arc::new(WsLinkSender { tx: out_tx, open }),
        events,
    }
}

/// Upgrade an inbound TCP stream and wait for the dialer's hello.
async fn handshake(stream: TcpStream, addr: SocketAddr) -> Result<Link, TransportError> {
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;

    let first = tokio::time::timeout(HELLO_TIMEOUT, ws.next())
        .await
        .map_err(|_| TransportError::Io(format!("no hello from {addr}")))?;

    let hello = match first {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<Hello>(text.as_str())
            .map_err(|e| TransportError::Io(format!("bad hello from {addr}: {e}")))?,
        Some(Ok(_)) => return Err(TransportError::Io(format!("unexpected first frame from {addr}"))),
        Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
        None => return Err(TransportError::Closed),
    };

    Ok(spawn_link(ws, hello.hello))
}

/// WebSocket transport. Listening endpoints accept links; every endpoint
/// can dial `ws://` peer ids.
pub struct WsTransport {
    bind: Option<SocketAddr>,
    local: Mutex<Option<PeerId>>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
    incoming: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Link>>>,
}

impl WsTransport {
    pub fn new(bind: Option<SocketAddr>) -> Self {
        Self {
            bind,
            local: Mutex::new(None),
            listener_task: Mutex::new(None),
            incoming: tokio::sync::Mutex::new(None),
        }
    }

    /// Endpoint that accepts links on `addr` (port 0 picks a free port).
    pub fn listening(addr: SocketAddr) -> Self {
        Self::new(Some(addr))
    }

    /// Dial-only endpoint.
    pub fn client() -> Self {
        Self::new(None)
    }

    pub fn local_id(&self) -> Option<PeerId> {
        self.local.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_local(&self, id: Option<PeerId>) {
        *self.local.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }

    fn stop_listener(&self) {
        let task = self
            .listener_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, local_id: Option<PeerId>) -> Result<PeerId, TransportError> {
        self.stop_listener();

        let Some(bind) = self.bind else {
            let id = local_id.unwrap_or_else(PeerId::random);
            self.set_local(Some(id.clone()));
            return Ok(id);
        };

        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TransportError::Unavailable(format!("bind {bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let id = PeerId::new(format!("ws://{addr}"));
        if let Some(requested) = local_id.filter(|r| *r != id) {
            log::debug!("Listening endpoint ignores requested id {requested}, using {id}");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                log::debug!("New TCP connection from {peer_addr}");

                let tx = tx.clone();
                tokio::spawn(async move {
                    match handshake(stream, peer_addr).await {
                        Ok(link) => {
                            let _ = tx.send(link);
                        }
                        Err(e) => log::warn!("Handshake with {peer_addr} failed: {e}"),
                    }
                });
            }
        });

        *self.listener_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        *self.incoming.lock().await = Some(rx);
        self.set_local(Some(id.clone()));
        log::info!("WebSocket transport listening on {addr}");
        Ok(id)
    }

    async fn dial(&self, remote: &PeerId) -> Result<Link, TransportError> {
        let local = self.local_id().ok_or(TransportError::NotOpened)?;

        let (mut ws, _) = tokio_tungstenite::connect_async(remote.as_str())
            .await
            .map_err(|e| {
                log::debug!("Dial {remote} failed: {e}");
                TransportError::PeerUnavailable(remote.clone())
            })?;

        let hello = serde_json::to_string(&Hello { hello: local })
            .map_err(|e| TransportError::Io(e.to_string()))?;
        ws.send(Message::Text(hello.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        Ok(spawn_link(ws, remote.clone()))
    }

    async fn accept(&self) -> Option<Link> {
        let mut incoming = self.incoming.lock().await;
        match incoming.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn shutdown(&self) {
        self.stop_listener();
        self.set_local(None);
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.stop_listener();
    }
}
