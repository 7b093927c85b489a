//! Session routing, broadcast fan-out and the operator controls.

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::join_all;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    frame::{ChannelError, Frame},
    listener,
    registry::Registry,
    session::{Session, SessionId},
};

/// Label used for messages the operator sends through [`Relay::announce`].
pub const SERVER_LABEL: &str = "server";

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a new connection may take to send its username. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Largest inbound IMAGE payload accepted before the sender is disconnected.
    pub max_image_bytes: usize,
    /// How long one recipient may take to accept a frame before it is
    /// disconnected. `None` lets a stalled reader hold up the broadcast until
    /// it is closed.
    pub write_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
        }
    }
}

/// Notifications for the display side. Delivered fire-and-forget over an
/// unbounded channel; the receiver decides where and when to render them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Started { addr: SocketAddr },
    Stopped,
    Joined { username: String, online: usize },
    Left { username: String, online: usize },
    /// A newer registration took over this username and the old connection was closed.
    Displaced { username: String },
    Text { sender: String, text: String },
    Image { sender: String, len: usize },
    Fault(String),
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::Started { addr } => write!(f, "Server started on {addr}"),
            RelayEvent::Stopped => f.write_str("Server stopped"),
            RelayEvent::Joined { username, .. } => write!(f, "{username} joined the chat"),
            RelayEvent::Left { username, .. } => write!(f, "{username} left the chat"),
            RelayEvent::Displaced { username } => {
                write!(f, "{username} reconnected; previous connection closed")
            }
            RelayEvent::Text { sender, text } => write!(f, "{sender}: {text}"),
            RelayEvent::Image { sender, len } => write!(f, "{sender} sent an image ({len} bytes)"),
            RelayEvent::Fault(message) => write!(f, "Server error: {message}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("relay is already running")]
    AlreadyRunning,
    #[error("relay is not running")]
    NotRunning,
}

/// State shared by the accept loop and every receive loop.
pub(crate) struct RelayShared {
    pub(crate) registry: Registry,
    pub(crate) config: RelayConfig,
    events: mpsc::UnboundedSender<RelayEvent>,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl RelayShared {
    fn new(config: RelayConfig, events: mpsc::UnboundedSender<RelayEvent>) -> Self {
        Self {
            registry: Registry::new(),
            config,
            events,
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn notify(&self, event: RelayEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Adds a freshly handshaken session. Returns `false` if the relay
    /// stopped in the meantime, in which case the session is already closed.
    pub(crate) async fn register(&self, session: &Arc<Session>) -> bool {
        if !self.is_running() {
            session.close().await;
            return false;
        }

        if let Some(previous) = self.registry.put(Arc::clone(session)) {
            previous.mark_displaced();
            if previous.close().await {
                info!(username = %previous.username(), peer = ?previous.peer(), "closed displaced session");
            }
            self.notify(RelayEvent::Displaced {
                username: previous.username().to_string(),
            });
        }

        let joined = session.announce_join(|| {
            info!(peer = ?session.peer(), username = %session.username(), "client joined");
            self.notify(RelayEvent::Joined {
                username: session.username().to_string(),
                online: self.registry.size(),
            });
        });
        if !joined {
            // Torn down before it could be announced.
            self.registry.remove_session(session);
            return false;
        }

        // stop() may have taken its snapshot between the check above and the put.
        if !self.is_running() {
            self.disconnect(session).await;
            return false;
        }
        true
    }

    /// Tears a session down. Only the first caller for a given session
    /// removes it and announces the departure.
    pub(crate) async fn disconnect(&self, session: &Arc<Session>) {
        if !session.close().await {
            return;
        }
        self.registry.remove_session(session);
        if session.is_displaced() {
            return;
        }

        session.announce_leave(|| {
            info!(peer = ?session.peer(), username = %session.username(), "client disconnected");
            self.notify(RelayEvent::Left {
                username: session.username().to_string(),
                online: self.registry.size(),
            });
        });
    }

    /// Sends `frame` to every live session except `except`. A failed
    /// recipient is disconnected and skipped; it never stops the others.
    /// Returns how many sessions received the frame.
    pub(crate) async fn broadcast(
        &self,
        frame: &Frame,
        except: Option<SessionId>,
    ) -> Result<usize, ChannelError> {
        let encoded = frame.encode()?;
        let recipients: Vec<Arc<Session>> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|session| Some(session.id()) != except && session.is_alive())
            .collect();

        let limit = self.config.write_timeout;
        let results = join_all(
            recipients
                .iter()
                .map(|session| deliver(session, &encoded, limit)),
        )
        .await;

        let mut delivered = 0;
        for (session, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(error) => {
                    warn!(username = %session.username(), %error, "failed to deliver frame");
                    self.disconnect(session).await;
                }
            }
        }
        Ok(delivered)
    }

    /// Routes one frame received from `session` to everybody else.
    pub(crate) async fn relay_from(&self, session: &Arc<Session>, frame: Frame) {
        let sender = session.username();
        match frame {
            Frame::Text(text) => {
                let display = Frame::Text(format!("{sender}: {text}"));
                match self.broadcast(&display, Some(session.id())).await {
                    Ok(delivered) => debug!(username = %sender, delivered, "relayed text"),
                    Err(error) => warn!(username = %sender, %error, "dropping text message"),
                }
                self.notify(RelayEvent::Text {
                    sender: sender.to_string(),
                    text,
                });
            }
            Frame::Image(bytes) => {
                let len = bytes.len();
                match self.broadcast(&Frame::Image(bytes), Some(session.id())).await {
                    Ok(delivered) => debug!(username = %sender, delivered, len, "relayed image"),
                    Err(error) => warn!(username = %sender, %error, "dropping image"),
                }
                self.notify(RelayEvent::Image {
                    sender: sender.to_string(),
                    len,
                });
            }
        }
    }
}

async fn deliver(
    session: &Session,
    encoded: &[u8],
    limit: Option<Duration>,
) -> Result<(), ChannelError> {
    match limit {
        Some(limit) => timeout(limit, session.send_encoded(encoded))
            .await
            .map_err(|_| ChannelError::WriteTimedOut(limit))?,
        None => session.send_encoded(encoded).await,
    }
}

struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the registry and the listening socket for one chat room.
pub struct Relay {
    shared: Arc<RelayShared>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let relay = Self {
            shared: Arc::new(RelayShared::new(config, events_tx)),
            listener: Mutex::new(None),
        };
        (relay, events_rx)
    }

    /// Binds `addr` and starts accepting connections in the background.
    /// Returns the bound address, which differs from `addr` when port 0 is used.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, RelayError> {
        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| RelayError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| RelayError::Bind { addr, source })?;

        self.shared.running.store(true, Ordering::SeqCst);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(listener::run_accept_loop(
            listener,
            Arc::clone(&self.shared),
            shutdown_rx,
        ));
        *slot = Some(ListenerHandle {
            local_addr,
            shutdown: shutdown_tx,
            task,
        });

        info!(%local_addr, "relay listening");
        self.shared.notify(RelayEvent::Started { addr: local_addr });
        Ok(local_addr)
    }

    /// Stops accepting, closes every session and empties the registry.
    pub async fn stop(&self) -> Result<(), RelayError> {
        let handle = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(RelayError::NotRunning)?;

        // Flip the flag first so the accept loop treats what follows as shutdown, not a fault.
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = handle.shutdown.send(());
        if let Err(error) = handle.task.await {
            warn!(?error, "accept loop ended abnormally");
        }

        let sessions = self.shared.registry.snapshot();
        join_all(sessions.iter().map(|session| self.shared.disconnect(session))).await;
        self.shared.registry.clear();

        info!(local_addr = %handle.local_addr, "relay stopped");
        self.shared.notify(RelayEvent::Stopped);
        Ok(())
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn online(&self) -> usize {
        self.shared.registry.size()
    }

    /// Sends `"Server: <text>"` to every connected client.
    pub async fn announce(&self, text: &str) -> Result<usize, ChannelError> {
        let frame = Frame::Text(format!("Server: {text}"));
        let delivered = self.shared.broadcast(&frame, None).await?;
        self.shared.notify(RelayEvent::Text {
            sender: SERVER_LABEL.to_string(),
            text: text.to_string(),
        });
        Ok(delivered)
    }

    /// Sends an IMAGE frame to every connected client.
    pub async fn share_image(&self, bytes: Vec<u8>) -> Result<usize, ChannelError> {
        let len = bytes.len();
        let delivered = self.shared.broadcast(&Frame::Image(bytes), None).await?;
        self.shared.notify(RelayEvent::Image {
            sender: SERVER_LABEL.to_string(),
            len,
        });
        Ok(delivered)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            self.shared.running.store(false, Ordering::SeqCst);
            let _ = handle.shutdown.send(());
        }
    }
}
