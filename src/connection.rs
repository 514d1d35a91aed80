//! Connection management for AMI

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn, Instrument};

use crate::{
    action::{AgiRequest, AmiAction, OriginateRequest},
    codec::{self, classify, AmiCodec, Frame, Signal},
    config::AmiConfig,
    constants::{EVENT_ORIGINATE_RESPONSE, SOCKET_BUF_SIZE},
    error::{AmiError, AmiResult},
    headers::AmiHeader,
    message::AmiMessage,
    notification::{
        AmiEventStream, ConnectionState, DisconnectReason, Notification, Publisher,
    },
    registry::{complete, PendingReply, Registries, RegistryKind},
};

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, timeout_ms: u64) -> AmiResult<TcpStream> {
    let tcp_result = timeout(
        Duration::from_millis(timeout_ms),
        TcpStream::connect((host, port)),
    )
    .await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!("[CONNECT] TCP connect timed out after {}ms", timeout_ms);
            Err(AmiError::Timeout { timeout_ms })
        }
    }
}

/// Replace the value of a `Secret` line for logging.
fn redact_frame(wire: &str) -> String {
    wire.trim_end()
        .split("\r\n")
        .map(|line| {
            if line.starts_with("Secret:") {
                "Secret: [REDACTED]"
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Shared state between AmiClient handles and the session task
struct SharedState {
    config: AmiConfig,
    /// Write half of the current socket; `None` between connections.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Never held across an await.
    registries: std::sync::Mutex<Registries>,
    publisher: Publisher,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    span: tracing::Span,
}

impl SharedState {
    fn new(config: AmiConfig, publisher: Publisher, span: tracing::Span) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            registries: std::sync::Mutex::new(Registries::default()),
            publisher,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            span,
        }
    }

    fn registries(&self) -> std::sync::MutexGuard<'_, Registries> {
        match self.registries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown
            .load(Ordering::Acquire)
    }

    fn request_shutdown(&self) {
        self.shutdown
            .store(true, Ordering::Release);
        self.shutdown_notify
            .notify_one();
    }

    fn log_frame(&self, direction: &str, wire: &str) {
        if self.config.debug {
            debug!("[{}] {}", direction, redact_frame(wire));
        } else {
            trace!("[{}] {}", direction, redact_frame(wire));
        }
    }

    /// Encode and write one action on the current socket.
    async fn write_action(&self, action: &AmiAction) -> AmiResult<()> {
        let wire = codec::encode(action)?;

        let mut writer = self
            .writer
            .lock()
            .await;
        let Some(w) = writer.as_mut() else {
            return Err(AmiError::NotConnected);
        };

        self.log_frame("SEND", &wire);
        if let Err(e) = w
            .write_all(wire.as_bytes())
            .await
        {
            drop(writer);
            warn!("[SEND] Write failed: {}", e);
            self.publisher
                .publish(Notification::Error(format!("write failed: {}", e)));
            return Err(AmiError::Io(e));
        }
        Ok(())
    }

    /// Register a continuation under `id`, then write the action.
    ///
    /// Registration happens first so an immediate reply cannot be missed.
    /// If the write fails, the registration is withdrawn.
    async fn submit(
        &self,
        action: &AmiAction,
        registrations: &[(RegistryKind, &str)],
    ) -> AmiResult<Vec<PendingReply>> {
        let pending = {
            let mut registries = self.registries();
            registrations
                .iter()
                .map(|(kind, id)| registries.register(*kind, id))
                .collect::<Vec<_>>()
        };

        if let Err(e) = self
            .write_action(action)
            .await
        {
            let mut registries = self.registries();
            for (kind, id) in registrations {
                registries.take(*kind, id);
            }
            return Err(e);
        }
        Ok(pending)
    }

    async fn send_action(&self, mut action: AmiAction) -> AmiResult<PendingReply> {
        if action
            .name()
            .is_none()
        {
            return Err(AmiError::MissingAction);
        }
        let action_id = action.ensure_action_id();
        let mut pending = self
            .submit(&action, &[(RegistryKind::Action, &action_id)])
            .await?;
        pending
            .pop()
            .ok_or(AmiError::ConnectionClosed)
    }

    fn login_action(&self) -> AmiAction {
        AmiAction::new("Login")
            .field(AmiHeader::Username, &self.config.username)
            .field(AmiHeader::Secret, &self.config.secret)
            .field(AmiHeader::Events, self.config.events_flag())
    }

    fn take_continuation(
        &self,
        kind: RegistryKind,
        id: &str,
    ) -> Option<oneshot::Sender<AmiResult<AmiMessage>>> {
        self.registries()
            .take(kind, id)
    }

    /// Route one message, strictly in signal order.
    fn dispatch(&self, message: AmiMessage) {
        let signals = classify(&message);
        let message = Arc::new(message);

        for signal in signals {
            match signal {
                Signal::Message => self
                    .publisher
                    .publish(Notification::Message(message.clone())),
                Signal::Response => self.on_response(&message),
                Signal::Event => self.on_event(&message),
                Signal::AgiExec => self.on_agi_exec(&message),
                Signal::Originate => self.on_originate(&message),
                Signal::AgiSessionStart => {
                    let env = message
                        .agi_env()
                        .unwrap_or_default();
                    self.publisher
                        .publish(Notification::AgiSessionStart {
                            message: message.clone(),
                            env,
                        });
                }
                Signal::AgiSessionEnd => self
                    .publisher
                    .publish(Notification::AgiSessionEnd(message.clone())),
                Signal::AgiCommandStart => self
                    .publisher
                    .publish(Notification::AgiCommandStart(message.clone())),
                Signal::AgiCommandEnd => self
                    .publisher
                    .publish(Notification::AgiCommandEnd(message.clone())),
            }
        }
    }

    fn on_response(&self, message: &Arc<AmiMessage>) {
        let Some(action_id) = message.action_id() else {
            return;
        };
        self.publisher
            .publish(Notification::Response {
                action_id: action_id.to_string(),
                message: message.clone(),
            });

        // The terminal originate event also carries `Response`; it belongs
        // to the originate registry.
        if message.event() == Some(EVENT_ORIGINATE_RESPONSE) {
            return;
        }

        let tx = self
            .take_continuation(RegistryKind::Action, action_id);
        let result = if message.is_success() {
            Ok(AmiMessage::clone(message))
        } else {
            Err(AmiError::ActionFailed {
                message: message
                    .message_text()
                    .unwrap_or("")
                    .to_string(),
                response: Box::new(AmiMessage::clone(message)),
            })
        };
        complete(RegistryKind::Action, action_id, tx, result);
    }

    fn on_event(&self, message: &Arc<AmiMessage>) {
        if let Some(name) = message.event() {
            self.publisher
                .publish(Notification::Event {
                    name: name.to_string(),
                    message: message.clone(),
                });
        }
        if let Some(action_id) = message.action_id() {
            self.publisher
                .publish(Notification::EventFor {
                    action_id: action_id.to_string(),
                    message: message.clone(),
                });
        }
    }

    fn on_agi_exec(&self, message: &Arc<AmiMessage>) {
        let Some(command_id) = message.command_id() else {
            return;
        };
        self.publisher
            .publish(Notification::AgiExec {
                command_id: command_id.to_string(),
                message: message.clone(),
            });
        let tx = self
            .take_continuation(RegistryKind::Agi, command_id);
        complete(
            RegistryKind::Agi,
            command_id,
            tx,
            Ok(AmiMessage::clone(message)),
        );
    }

    fn on_originate(&self, message: &Arc<AmiMessage>) {
        let Some(action_id) = message.action_id() else {
            return;
        };
        self.publisher
            .publish(Notification::Originate {
                action_id: action_id.to_string(),
                message: message.clone(),
            });
        let tx = self
            .take_continuation(RegistryKind::Originate, action_id);
        let result = if message.is_success() {
            Ok(AmiMessage::clone(message))
        } else {
            Err(AmiError::OriginateFailed {
                reason: message
                    .get(AmiHeader::Reason)
                    .unwrap_or("")
                    .to_string(),
                response: Box::new(AmiMessage::clone(message)),
            })
        };
        complete(RegistryKind::Originate, action_id, tx, result);
    }

    /// Fail every outstanding continuation. Only used on client shutdown.
    fn fail_pending(&self) {
        let drained = self
            .registries()
            .drain();
        if !drained.is_empty() {
            debug!("Failing {} pending requests on shutdown", drained.len());
        }
        for tx in drained {
            let _ = tx.send(Err(AmiError::ConnectionClosed));
        }
    }
}

/// How one socket's session ended.
enum SessionEnd {
    Closed(DisconnectReason),
    LoginFailed(String),
    Shutdown,
}

/// Wait for the login reply while it is outstanding; otherwise never resolve.
async fn wait_login(login: &mut Option<PendingReply>) -> AmiResult<AmiMessage> {
    match login {
        Some(pending) => pending.await,
        None => std::future::pending().await,
    }
}

type FirstOutcome = Option<oneshot::Sender<AmiResult<()>>>;

fn report_first(first: &mut FirstOutcome, result: AmiResult<()>) {
    if let Some(tx) = first.take() {
        let _ = tx.send(result);
    }
}

/// Drive one socket: log in, then read and dispatch until it closes.
async fn run_socket(
    stream: TcpStream,
    shared: &SharedState,
    state_tx: &watch::Sender<ConnectionState>,
    first: &mut FirstOutcome,
) -> SessionEnd {
    // disconnect() may have run while the TCP connect was in flight.
    if shared.is_shutdown() {
        return SessionEnd::Shutdown;
    }

    let (reader, writer) = stream.into_split();
    {
        // Drop the previous write half before installing the new one.
        let mut slot = shared
            .writer
            .lock()
            .await;
        slot.take();
        *slot = Some(writer);
    }
    shared
        .publisher
        .publish(Notification::Connected);
    let _ = state_tx.send(ConnectionState::Authenticating);

    let login = match shared
        .send_action(shared.login_action())
        .await
    {
        Ok(pending) => pending,
        Err(e) => {
            warn!("[AUTH] Failed to send login: {}", e);
            return SessionEnd::Closed(DisconnectReason::IoError(e.to_string()));
        }
    };

    let login_id = login
        .id()
        .to_string();
    let end = read_loop(reader, AmiCodec::new(), shared, state_tx, first, Some(login)).await;

    // The login continuation belongs to this socket only.
    if shared
        .registries()
        .take(RegistryKind::Action, &login_id)
        .is_some()
    {
        debug!("[AUTH] Socket closed before the login reply");
    }
    end
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut codec: AmiCodec,
    shared: &SharedState,
    state_tx: &watch::Sender<ConnectionState>,
    first: &mut FirstOutcome,
    mut login: Option<PendingReply>,
) -> SessionEnd {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    loop {
        if shared.is_shutdown() {
            return SessionEnd::Shutdown;
        }

        tokio::select! {
            outcome = wait_login(&mut login) => {
                login = None;
                match outcome {
                    Ok(_) => {
                        info!("[AUTH] Logged in");
                        let _ = state_tx.send(ConnectionState::Ready);
                        shared.publisher.publish(Notification::LoggedIn);
                        report_first(first, Ok(()));
                    }
                    Err(e) => {
                        warn!("[AUTH] Login rejected: {}", e);
                        let text = e.to_string();
                        shared.publisher.publish(Notification::LoginFailed(text.clone()));
                        report_first(first, Err(AmiError::LoginFailed(text.clone())));
                        return SessionEnd::LoginFailed(text);
                    }
                }
            }
            _ = shared.shutdown_notify.notified() => {
                return SessionEnd::Shutdown;
            }
            read = reader.read(&mut read_buffer) => {
                let n = match read {
                    Ok(0) => {
                        info!("Connection closed (EOF)");
                        return SessionEnd::Closed(DisconnectReason::ConnectionClosed);
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Read error: {}", e);
                        shared.publisher.publish(Notification::Error(e.to_string()));
                        return SessionEnd::Closed(DisconnectReason::IoError(e.to_string()));
                    }
                };
                trace!("[RECV] Read {} bytes from socket", n);

                let frames = match codec.feed(&read_buffer[..n]) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("Codec error: {}", e);
                        shared.publisher.publish(Notification::Error(e.to_string()));
                        return SessionEnd::Closed(DisconnectReason::ProtocolError(e.to_string()));
                    }
                };
                for frame in frames {
                    match frame {
                        Frame::Ready => debug!("[RECV] Manager banner received"),
                        Frame::Message(message) => {
                            if shared.config.debug {
                                debug!("[RECV] {:?}", message);
                            } else {
                                trace!("[RECV] {:?}", message);
                            }
                            shared.dispatch(message);
                        }
                    }
                }
            }
        }
    }
}

/// Connect, serve, and reconnect per policy until told to stop.
async fn session_task(
    shared: Arc<SharedState>,
    state_tx: watch::Sender<ConnectionState>,
    mut first: FirstOutcome,
) {
    let host = shared
        .config
        .host
        .clone();
    let port = shared
        .config
        .port;

    loop {
        if shared.is_shutdown() {
            break;
        }

        let _ = state_tx.send(ConnectionState::Connecting);
        info!("Connecting to Asterisk manager at {}:{}", host, port);

        let end = match tcp_connect_with_timeout(&host, port, shared.config.connect_timeout_ms).await
        {
            Ok(stream) => run_socket(stream, &shared, &state_tx, &mut first).await,
            Err(e) => {
                shared
                    .publisher
                    .publish(Notification::Error(e.to_string()));
                let reason = DisconnectReason::ConnectFailed(e.to_string());
                report_first(&mut first, Err(e));
                SessionEnd::Closed(reason)
            }
        };

        // Tear down the socket; the codec went with read_loop.
        if let Some(mut writer) = shared
            .writer
            .lock()
            .await
            .take()
        {
            let _ = writer
                .shutdown()
                .await;
        }

        let reason = match end {
            SessionEnd::Shutdown => DisconnectReason::ClientRequested,
            SessionEnd::LoginFailed(text) => {
                let reason = DisconnectReason::LoginFailed(text);
                let _ = state_tx.send(ConnectionState::Disconnected(reason.clone()));
                shared
                    .publisher
                    .publish(Notification::Closed(reason));
                break;
            }
            SessionEnd::Closed(reason) => reason,
        };

        report_first(&mut first, Err(AmiError::ConnectionClosed));
        let _ = state_tx.send(ConnectionState::Disconnected(reason.clone()));
        shared
            .publisher
            .publish(Notification::Closed(reason));

        if shared.is_shutdown() {
            break;
        }
        let Some(delay) = shared
            .config
            .reconnect_delay()
        else {
            info!("Connection closed, reconnection disabled");
            break;
        };

        // Pending requests survive the reconnect; a reply on the new socket
        // still completes them.
        info!("Reconnecting in {}ms", delay.as_millis());
        shared
            .publisher
            .publish(Notification::Reconnecting { delay });
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown_notify.notified() => break,
        }
    }

    debug!("Session task exiting");
    shared
        .publisher
        .close();
}

/// Outstanding replies of an AsyncAGI command.
#[derive(Debug)]
pub struct AgiPending {
    pub action_id: String,
    pub command_id: String,
    /// Resolves when the manager accepts or rejects the command.
    pub accepted: PendingReply,
    /// Resolves with the `AsyncAGI` `Exec` event, if completion was requested.
    pub completed: Option<PendingReply>,
}

/// Outstanding replies of an originate request.
#[derive(Debug)]
pub struct OriginatePending {
    pub action_id: String,
    /// Resolves with the acceptance response (absent for synchronous mode).
    pub accepted: Option<PendingReply>,
    /// Resolves with the terminal `OriginateResponse` (synchronous mode, or
    /// when completion was requested).
    pub completed: Option<PendingReply>,
}

/// AMI client handle (Clone + Send)
///
/// All handles share one session task that owns the socket, reads and
/// dispatches inbound messages, and reconnects per the configured policy.
/// Pending requests are matched to replies by correlation ID, so any number
/// may be in flight.
#[derive(Clone)]
pub struct AmiClient {
    shared: Arc<SharedState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient")
            .field("state", &self.state())
            .finish()
    }
}

impl AmiClient {
    /// Connect and log in, returning once the session is ready.
    ///
    /// Fails with the connect or login error of the first attempt; in that
    /// case no reconnect is attempted.
    ///
    /// ```rust,no_run
    /// use asterisk_ami_tokio::{AmiAction, AmiClient, AmiConfig, AmiError};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), AmiError> {
    ///     let config = AmiConfig::new("127.0.0.1", 5038, "admin", "secret");
    ///     let (client, _events) = AmiClient::connect(config).await?;
    ///     let reply = client.action(AmiAction::new("CoreStatus")).await?;
    ///     println!("{:?}", reply.get("CoreCurrentCalls"));
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: AmiConfig) -> AmiResult<(Self, AmiEventStream)> {
        let (first_tx, first_rx) = oneshot::channel();
        let (client, events) = Self::spawn(config, Some(first_tx));
        match first_rx.await {
            Ok(Ok(())) => Ok((client, events)),
            Ok(Err(e)) => {
                client
                    .shared
                    .request_shutdown();
                Err(e)
            }
            Err(_) => Err(AmiError::ConnectionClosed),
        }
    }

    /// Start the session in the background without waiting for login.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: AmiConfig) -> (Self, AmiEventStream) {
        Self::spawn(config, None)
    }

    fn spawn(config: AmiConfig, first: FirstOutcome) -> (Self, AmiEventStream) {
        let queue_size = config
            .event_queue_size
            .max(1);
        let (event_tx, event_rx) = mpsc::channel(queue_size);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let span = config.session_span();

        let shared = Arc::new(SharedState::new(
            config,
            Publisher::new(event_tx),
            span.clone(),
        ));

        tokio::spawn(session_task(shared.clone(), state_tx, first).instrument(span));

        let events = AmiEventStream::new(event_rx, state_rx.clone());
        (AmiClient { shared, state_rx }, events)
    }

    /// Encode and write an action as-is. No correlation is set up.
    pub async fn send(&self, action: &AmiAction) -> AmiResult<()> {
        self.shared
            .write_action(action)
            .instrument(
                self.shared
                    .span
                    .clone(),
            )
            .await
    }

    /// Send an action and return a handle to its reply.
    ///
    /// Assigns a fresh `ActionID` unless the action carries one. Fails
    /// without sending if the action has no `Action` name.
    pub async fn send_action(&self, action: AmiAction) -> AmiResult<PendingReply> {
        self.shared
            .send_action(action)
            .instrument(
                self.shared
                    .span
                    .clone(),
            )
            .await
    }

    /// Send an action and wait for its response.
    ///
    /// A response other than `Success` yields [`AmiError::ActionFailed`]
    /// carrying the `Message` text and the raw response.
    pub async fn action(&self, action: AmiAction) -> AmiResult<AmiMessage> {
        self.send_action(action)
            .await?
            .await
    }

    /// Send an action without tracking its reply; returns its `ActionID`.
    pub async fn action_nowait(&self, mut action: AmiAction) -> AmiResult<String> {
        if action
            .name()
            .is_none()
        {
            return Err(AmiError::MissingAction);
        }
        let action_id = action.ensure_action_id();
        self.send(&action)
            .await?;
        Ok(action_id)
    }

    /// Queue an AsyncAGI command.
    ///
    /// `accepted` resolves on the manager's response to the `AGI` action;
    /// `completed` (if requested) on the `Exec` event for its `CommandID`.
    pub async fn agi(&self, request: AgiRequest) -> AmiResult<AgiPending> {
        let want_completion = request.complete;
        let (action, action_id, command_id) = request.into_action();

        let mut registrations = vec![(RegistryKind::Action, action_id.as_str())];
        if want_completion {
            registrations.push((RegistryKind::Agi, command_id.as_str()));
        }
        let mut pending = self
            .shared
            .submit(&action, &registrations)
            .instrument(
                self.shared
                    .span
                    .clone(),
            )
            .await?
            .into_iter();

        let accepted = pending
            .next()
            .ok_or(AmiError::ConnectionClosed)?;
        let completed = pending.next();
        Ok(AgiPending {
            action_id,
            command_id,
            accepted,
            completed,
        })
    }

    /// Originate a call. Always sent with `Async: true`.
    ///
    /// With `sync` set, only `completed` is returned and it resolves on the
    /// terminal `OriginateResponse`, failing with
    /// [`AmiError::OriginateFailed`] when the call did not go through.
    /// Otherwise `accepted` resolves on the acceptance response and
    /// `completed` is present only if requested.
    pub async fn originate(&self, request: OriginateRequest) -> AmiResult<OriginatePending> {
        let sync = request.sync;
        let want_completion = request.complete;
        let (action, action_id) = request.into_action();

        let registrations = if sync {
            vec![(RegistryKind::Originate, action_id.as_str())]
        } else if want_completion {
            vec![
                (RegistryKind::Action, action_id.as_str()),
                (RegistryKind::Originate, action_id.as_str()),
            ]
        } else {
            vec![(RegistryKind::Action, action_id.as_str())]
        };
        let mut pending = self
            .shared
            .submit(&action, &registrations)
            .instrument(
                self.shared
                    .span
                    .clone(),
            )
            .await?
            .into_iter();

        let (accepted, completed) = if sync {
            (None, pending.next())
        } else {
            (pending.next(), pending.next())
        };
        Ok(OriginatePending {
            action_id,
            accepted,
            completed,
        })
    }

    /// Send `Login` with the configured credentials.
    ///
    /// The session does this on every connect; call it only to re-login.
    pub async fn login(&self) -> AmiResult<AmiMessage> {
        self.action(self.shared.login_action())
            .await
    }

    /// Read a channel variable (or a global one when `channel` is `None`).
    pub async fn get_var(&self, channel: Option<&str>, variable: &str) -> AmiResult<String> {
        let mut action = AmiAction::new("GetVar");
        if let Some(channel) = channel {
            action.set(AmiHeader::Channel, channel);
        }
        action.set(AmiHeader::Variable, variable);
        let reply = self
            .action(action)
            .await?;
        Ok(reply
            .get(AmiHeader::Value)
            .unwrap_or("")
            .to_string())
    }

    /// Set a channel variable (or a global one when `channel` is `None`).
    pub async fn set_var(
        &self,
        channel: Option<&str>,
        variable: &str,
        value: &str,
    ) -> AmiResult<AmiMessage> {
        let mut action = AmiAction::new("SetVar");
        if let Some(channel) = channel {
            action.set(AmiHeader::Channel, channel);
        }
        action.set(AmiHeader::Variable, variable);
        action.set(AmiHeader::Value, value);
        self.action(action)
            .await
    }

    /// Send a `Ping` (keepalive).
    pub async fn ping(&self) -> AmiResult<AmiMessage> {
        self.action(AmiAction::new("Ping"))
            .await
    }

    /// Send `Logoff` and stop the session once the manager says goodbye.
    ///
    /// No reconnect follows, even with a reconnect delay configured.
    pub async fn logoff(&self) -> AmiResult<AmiMessage> {
        let pending = self
            .send_action(AmiAction::new("Logoff"))
            .await?;
        let result = match pending.await {
            Ok(reply) => Ok(reply),
            Err(AmiError::ActionFailed { response, .. })
                if response.response() == Some("Goodbye") =>
            {
                Ok(*response)
            }
            Err(e) => Err(e),
        };
        self.disconnect()
            .await?;
        result
    }

    /// Close the socket and stop reconnecting.
    ///
    /// Every outstanding request resolves with
    /// [`AmiError::ConnectionClosed`].
    pub async fn disconnect(&self) -> AmiResult<()> {
        info!("Client requested disconnect");
        self.shared
            .request_shutdown();
        let writer = self
            .shared
            .writer
            .lock()
            .await
            .take();
        if let Some(mut writer) = writer {
            writer
                .shutdown()
                .await
                .map_err(AmiError::Io)?;
        }
        self.shared
            .fail_pending();
        Ok(())
    }

    /// Wait until the session is logged in.
    ///
    /// Returns an error if the session is disconnected and will not come
    /// back (no reconnect policy, login rejected, or shut down).
    pub async fn wait_ready(&self) -> AmiResult<()> {
        let mut rx = self
            .state_rx
            .clone();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    ConnectionState::Ready => return Ok(()),
                    ConnectionState::Disconnected(DisconnectReason::LoginFailed(text)) => {
                        return Err(AmiError::LoginFailed(text.clone()))
                    }
                    ConnectionState::Disconnected(_)
                        if self.shared.is_shutdown()
                            || self
                                .shared
                                .config
                                .reconnect_delay()
                                .is_none() =>
                    {
                        return Err(AmiError::ConnectionClosed)
                    }
                    _ => {}
                }
            }
            rx.changed()
                .await
                .map_err(|_| AmiError::ConnectionClosed)?;
        }
    }

    /// Current connection state snapshot.
    pub fn state(&self) -> ConnectionState {
        self.state_rx
            .borrow()
            .clone()
    }

    /// Whether the session is logged in.
    pub fn is_logged_in(&self) -> bool {
        matches!(*self.state_rx.borrow(), ConnectionState::Ready)
    }

    /// Whether a socket is open (logged in or not).
    pub fn is_connected(&self) -> bool {
        matches!(
            *self.state_rx.borrow(),
            ConnectionState::Ready | ConnectionState::Authenticating
        )
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared
            .registries()
            .len()
    }

    /// Number of notifications dropped due to a full queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.shared
            .publisher
            .dropped_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationItem;
    use tokio::net::TcpListener;

    fn shared_state(config: AmiConfig) -> (SharedState, mpsc::Receiver<NotificationItem>) {
        let (tx, rx) = mpsc::channel(64);
        let shared = SharedState::new(config, Publisher::new(tx), tracing::Span::none());
        (shared, rx)
    }

    fn msg(pairs: &[(&str, &str)]) -> AmiMessage {
        pairs
            .iter()
            .copied()
            .collect()
    }

    fn topics(rx: &mut mpsc::Receiver<NotificationItem>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(
                item.unwrap()
                    .topic(),
            );
        }
        out
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener
            .local_addr()
            .unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[test]
    fn redact_hides_secret() {
        let wire = "Action: Login\r\nUsername: admin\r\nSecret: hunter2\r\n\r\n";
        let out = redact_frame(wire);
        assert_eq!(
            out,
            "Action: Login | Username: admin | Secret: [REDACTED]"
        );
    }

    #[test]
    fn connection_state_eq() {
        assert_eq!(ConnectionState::Ready, ConnectionState::Ready);
        assert_ne!(
            ConnectionState::Ready,
            ConnectionState::Disconnected(DisconnectReason::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn response_without_action_id_is_dropped() {
        let (shared, mut rx) = shared_state(AmiConfig::default());
        let _pending = shared
            .registries()
            .register(RegistryKind::Action, "a1");

        shared.dispatch(msg(&[("Response", "Success")]));

        assert_eq!(topics(&mut rx), vec!["message"]);
        assert_eq!(
            shared
                .registries()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn agi_exec_without_command_id_is_dropped() {
        let (shared, mut rx) = shared_state(AmiConfig::default());
        let _pending = shared
            .registries()
            .register(RegistryKind::Agi, "c1");

        shared.dispatch(msg(&[
            ("Event", "AsyncAGI"),
            ("SubEvent", "Exec"),
            ("Channel", "PJSIP/1000-1"),
        ]));

        assert_eq!(topics(&mut rx), vec!["message", "event:AsyncAGI"]);
        assert_eq!(
            shared
                .registries()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn originate_response_without_action_id_is_dropped() {
        let (shared, mut rx) = shared_state(AmiConfig::default());
        let _pending = shared
            .registries()
            .register(RegistryKind::Originate, "o1");

        shared.dispatch(msg(&[
            ("Event", "OriginateResponse"),
            ("Response", "Success"),
        ]));

        assert_eq!(
            topics(&mut rx),
            vec!["message", "event:OriginateResponse"]
        );
        assert_eq!(
            shared
                .registries()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn originate_response_leaves_acceptance_open() {
        let (shared, mut rx) = shared_state(AmiConfig::default());
        let accepted = shared
            .registries()
            .register(RegistryKind::Action, "o1");
        let completed = shared
            .registries()
            .register(RegistryKind::Originate, "o1");

        shared.dispatch(msg(&[
            ("Event", "OriginateResponse"),
            ("Response", "Success"),
            ("ActionID", "o1"),
        ]));

        assert_eq!(
            topics(&mut rx),
            vec![
                "message",
                "response:o1",
                "event:OriginateResponse",
                "event:o1",
                "originate:o1"
            ]
        );
        assert!(completed
            .await
            .unwrap()
            .is_event());
        assert_eq!(
            shared
                .registries()
                .len(),
            1
        );

        // The acceptance response arriving late still completes its entry.
        shared.dispatch(msg(&[("Response", "Success"), ("ActionID", "o1")]));
        assert!(accepted
            .await
            .unwrap()
            .is_response());
        assert_eq!(
            shared
                .registries()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn agi_lifecycle_notifications() {
        let (shared, mut rx) = shared_state(AmiConfig::default());

        shared.dispatch(msg(&[
            ("Event", "AsyncAGI"),
            ("SubEvent", "Start"),
            ("Command", "ANSWER"),
            ("CommandID", "c1"),
        ]));
        shared.dispatch(msg(&[
            ("Event", "AsyncAGI"),
            ("SubEvent", "End"),
            ("Command", "ANSWER"),
            ("CommandID", "c1"),
        ]));
        shared.dispatch(msg(&[("Event", "AsyncAGI"), ("SubEvent", "End")]));

        let lifecycle: Vec<String> = topics(&mut rx)
            .into_iter()
            .filter(|t| t.starts_with("agi:"))
            .collect();
        assert_eq!(
            lifecycle,
            vec!["agi:command:start", "agi:command:end", "agi:end"]
        );
    }

    #[tokio::test]
    async fn write_failure_publishes_error() {
        let (shared, mut rx) = shared_state(AmiConfig::default());
        let (client, _server) = socket_pair().await;
        let (_reader, mut writer) = client.into_split();
        writer
            .shutdown()
            .await
            .unwrap();
        *shared
            .writer
            .lock()
            .await = Some(writer);

        let result = shared
            .write_action(&AmiAction::new("Ping"))
            .await;
        assert!(matches!(result, Err(AmiError::Io(_))));
        assert_eq!(topics(&mut rx), vec!["error"]);
    }

    #[tokio::test]
    async fn send_without_socket_is_not_connected() {
        let (shared, mut rx) = shared_state(AmiConfig::default());
        let result = shared
            .send_action(AmiAction::new("Ping"))
            .await;
        assert!(matches!(result, Err(AmiError::NotConnected)));
        assert_eq!(
            shared
                .registries()
                .len(),
            0
        );
        assert!(topics(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn socket_opened_after_shutdown_sends_no_login() {
        let (shared, mut rx) = shared_state(AmiConfig::default());
        shared.request_shutdown();
        let (client, mut server) = socket_pair().await;
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connecting);

        let end = run_socket(client, &shared, &state_tx, &mut None).await;

        assert!(matches!(end, SessionEnd::Shutdown));
        assert!(shared
            .writer
            .lock()
            .await
            .is_none());
        assert_eq!(
            shared
                .registries()
                .len(),
            0
        );
        assert!(topics(&mut rx).is_empty());

        let mut buf = [0u8; 64];
        let n = server
            .read(&mut buf)
            .await
            .unwrap();
        assert_eq!(n, 0, "nothing should be written after shutdown");
    }

    #[tokio::test]
    async fn login_entry_removed_when_socket_closes_first() {
        let (shared, _rx) = shared_state(AmiConfig::default());
        let (client, server) = socket_pair().await;
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connecting);

        let mut first: FirstOutcome = None;
        let (end, _) = tokio::join!(run_socket(client, &shared, &state_tx, &mut first), async {
            // Read the login, then hang up without answering.
            let mut server = server;
            let mut buf = vec![0u8; 1024];
            let mut seen = Vec::new();
            while !seen.ends_with(b"\r\n\r\n") {
                let n = server
                    .read(&mut buf)
                    .await
                    .unwrap();
                assert!(n > 0);
                seen.extend_from_slice(&buf[..n]);
            }
            assert!(seen.starts_with(b"Action: Login\r\n"));
        });

        assert!(matches!(
            end,
            SessionEnd::Closed(DisconnectReason::ConnectionClosed)
        ));
        assert_eq!(
            shared
                .registries()
                .len(),
            0
        );
    }
}
