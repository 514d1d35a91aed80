//! Notifications published by the client and the stream that delivers them

use crate::{error::AmiError, message::AmiMessage};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// Lifecycle state of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Opening the TCP connection.
    Connecting,
    /// Connected, `Login` sent, waiting for its response.
    Authenticating,
    /// Logged in.
    Ready,
    /// No socket. A reconnect may follow if a delay is configured.
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// TCP connect failed or timed out
    ConnectFailed(String),
    /// The manager rejected the login
    LoginFailed(String),
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// The peer sent something that cannot be framed
    ProtocolError(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// Client called disconnect() or logoff()
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ConnectFailed(msg) => write!(f, "connect failed: {}", msg),
            DisconnectReason::LoginFailed(msg) => write!(f, "login failed: {}", msg),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

/// Something the client observed: a routed message or a lifecycle change.
///
/// One inbound message can produce several notifications, published in this
/// order: `Message`, `Response`, `Event`, `EventFor`, then the AsyncAGI or
/// originate specific ones.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Notification {
    /// TCP connection established; login follows.
    Connected,
    /// Login accepted.
    LoggedIn,
    /// Login rejected; the session will not retry.
    LoginFailed(String),
    /// Every inbound message.
    Message(Arc<AmiMessage>),
    /// A response carrying an `ActionID`.
    Response {
        action_id: String,
        message: Arc<AmiMessage>,
    },
    /// An event, by `Event` name.
    Event {
        name: String,
        message: Arc<AmiMessage>,
    },
    /// An event carrying an `ActionID` (e.g. list responses).
    EventFor {
        action_id: String,
        message: Arc<AmiMessage>,
    },
    /// AsyncAGI `Exec`: a queued AGI command finished.
    AgiExec {
        command_id: String,
        message: Arc<AmiMessage>,
    },
    /// `OriginateResponse` for an originate request.
    Originate {
        action_id: String,
        message: Arc<AmiMessage>,
    },
    /// A channel entered AsyncAGI. `env` is the decoded `Env` header.
    AgiSessionStart {
        message: Arc<AmiMessage>,
        env: HashMap<String, String>,
    },
    /// A channel left AsyncAGI.
    AgiSessionEnd(Arc<AmiMessage>),
    /// AsyncAGI `Start` for a single command.
    AgiCommandStart(Arc<AmiMessage>),
    /// AsyncAGI `End` for a single command.
    AgiCommandEnd(Arc<AmiMessage>),
    /// A transport error with no waiting caller.
    Error(String),
    /// The socket closed.
    Closed(DisconnectReason),
    /// A reconnect is scheduled after `delay`.
    Reconnecting { delay: Duration },
}

impl Notification {
    /// Topic name, e.g. `event:Hangup`, `response:<ActionID>`, `agi:start`.
    pub fn topic(&self) -> String {
        match self {
            Notification::Connected => "connect".to_string(),
            Notification::LoggedIn => "login".to_string(),
            Notification::LoginFailed(_) => "login:failed".to_string(),
            Notification::Message(_) => "message".to_string(),
            Notification::Response { action_id, .. } => format!("response:{}", action_id),
            Notification::Event { name, .. } => format!("event:{}", name),
            Notification::EventFor { action_id, .. } => format!("event:{}", action_id),
            Notification::AgiExec { command_id, .. } => format!("agi:exec:{}", command_id),
            Notification::Originate { action_id, .. } => format!("originate:{}", action_id),
            Notification::AgiSessionStart { .. } => "agi:start".to_string(),
            Notification::AgiSessionEnd(_) => "agi:end".to_string(),
            Notification::AgiCommandStart(_) => "agi:command:start".to_string(),
            Notification::AgiCommandEnd(_) => "agi:command:end".to_string(),
            Notification::Error(_) => "error".to_string(),
            Notification::Closed(_) => "close".to_string(),
            Notification::Reconnecting { .. } => "reconnect".to_string(),
        }
    }

    /// The message this notification carries, if any.
    pub fn message(&self) -> Option<&AmiMessage> {
        match self {
            Notification::Message(m)
            | Notification::Response { message: m, .. }
            | Notification::Event { message: m, .. }
            | Notification::EventFor { message: m, .. }
            | Notification::AgiExec { message: m, .. }
            | Notification::Originate { message: m, .. }
            | Notification::AgiSessionStart { message: m, .. }
            | Notification::AgiSessionEnd(m)
            | Notification::AgiCommandStart(m)
            | Notification::AgiCommandEnd(m) => Some(m),
            _ => None,
        }
    }
}

pub(crate) type NotificationItem = Result<Notification, AmiError>;

/// Publishing side, shared by the session task and request methods.
pub(crate) struct Publisher {
    tx: std::sync::Mutex<Option<mpsc::Sender<NotificationItem>>>,
    overflow: AtomicBool,
    dropped: AtomicU64,
}

impl Publisher {
    pub(crate) fn new(tx: mpsc::Sender<NotificationItem>) -> Self {
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            overflow: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<NotificationItem>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned
                .into_inner()
                .clone(),
        }
    }

    /// Try to deliver a notification without waiting.
    ///
    /// If the channel is full, drop the item, set the overflow flag, and
    /// increment the dropped counter. Before each dispatch, check the overflow
    /// flag and attempt to deliver a QueueFull error first. A closed channel
    /// (stream dropped) is ignored: requests keep working without a consumer.
    pub(crate) fn publish(&self, notification: Notification) {
        let Some(tx) = self.sender() else {
            return;
        };

        if self
            .overflow
            .load(Ordering::Relaxed)
        {
            match tx.try_send(Err(AmiError::QueueFull)) {
                Ok(()) => {
                    self.overflow
                        .store(false, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {}
            }
        }

        match tx.try_send(Ok(notification)) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow
                    .store(true, Ordering::Relaxed);
                self.dropped
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Notification queue full, dropping notification");
            }
        }
    }

    pub(crate) fn dropped_count(&self) -> u64 {
        self.dropped
            .load(Ordering::Relaxed)
    }

    /// Close the channel so the stream ends once drained.
    pub(crate) fn close(&self) {
        match self.tx.lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(poisoned) => {
                poisoned
                    .into_inner()
                    .take();
            }
        }
    }
}

/// Notification stream receiver (!Clone)
///
/// Items are `Result<Notification, AmiError>`. An `Err(AmiError::QueueFull)`
/// indicates that one or more notifications were dropped because the
/// application fell behind; see
/// [`AmiClient::dropped_event_count`](crate::AmiClient::dropped_event_count).
/// The stream ends when the session terminates for good.
pub struct AmiEventStream {
    rx: mpsc::Receiver<NotificationItem>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for AmiEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiEventStream")
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl AmiEventStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<NotificationItem>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self { rx, state_rx }
    }

    /// Receive the next notification, or None once the session has ended.
    pub async fn recv(&mut self) -> Option<NotificationItem> {
        self.rx
            .recv()
            .await
    }

    /// Current connection state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state_rx
            .borrow()
            .clone()
    }
}

impl futures_util::Stream for AmiEventStream {
    type Item = NotificationItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .poll_recv(cx)
    }
}
