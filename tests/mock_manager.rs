//! Integration tests against an in-process mock Asterisk manager.
//!
//! Each test binds 127.0.0.1:0, plays the manager side of the conversation
//! line by line, and checks what the client observes.

use asterisk_ami_tokio::{
    AgiRequest, AmiAction, AmiClient, AmiConfig, AmiError, AmiEventStream, ConnectionState,
    DisconnectReason, Notification, OriginateRequest,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;

const BANNER: &str = "Asterisk Call Manager/5.0.1\r\n";
const STEP: Duration = Duration::from_secs(5);

/// Manager side of one accepted socket.
struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One received action, fields in wire order.
struct Received(Vec<(String, String)>);

impl Received {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn action_id(&self) -> &str {
        self.get("ActionID")
            .expect("action without ActionID")
    }
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Peer {
        let (stream, _) = timeout(STEP, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        let (reader, writer) = stream.into_split();
        let mut peer = Peer {
            reader: BufReader::new(reader),
            writer,
        };
        peer.send(BANNER)
            .await;
        peer
    }

    async fn send(&mut self, text: &str) {
        self.writer
            .write_all(text.as_bytes())
            .await
            .unwrap();
    }

    async fn read_action(&mut self) -> Received {
        let mut fields = Vec::new();
        loop {
            let mut line = String::new();
            let n = timeout(STEP, self.reader.read_line(&mut line))
                .await
                .expect("timed out reading action")
                .unwrap();
            assert!(n > 0, "client closed the socket mid-action");
            let line = line.trim_end_matches("\r\n");
            if line.is_empty() {
                if fields.is_empty() {
                    continue;
                }
                return Received(fields);
            }
            let (name, value) = line
                .split_once(": ")
                .expect("malformed line");
            fields.push((name.to_string(), value.to_string()));
        }
    }

    async fn reply(&mut self, action_id: &str, response: &str, extra: &[(&str, &str)]) {
        let mut text = format!("Response: {}\r\nActionID: {}\r\n", response, action_id);
        for (k, v) in extra {
            text.push_str(&format!("{}: {}\r\n", k, v));
        }
        text.push_str("\r\n");
        self.send(&text)
            .await;
    }

    /// Accept the login and answer it.
    async fn accept_login(&mut self) -> Received {
        let login = self
            .read_action()
            .await;
        assert_eq!(login.get("Action"), Some("Login"));
        self.reply(
            login.action_id(),
            "Success",
            &[("Message", "Authentication accepted")],
        )
        .await;
        login
    }
}

/// `RUST_LOG=asterisk_ami_tokio=trace` shows the wire traffic.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn listener() -> (TcpListener, AmiConfig) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let port = listener
        .local_addr()
        .unwrap()
        .port();
    let config = AmiConfig::new("127.0.0.1", port, "admin", "s3cret").with_debug(true);
    (listener, config)
}

/// Connect with a mock peer that accepts the login.
async fn connected(config: AmiConfig, listener: &TcpListener) -> (AmiClient, AmiEventStream, Peer) {
    let (client, peer) = tokio::join!(AmiClient::connect(config), async {
        let mut peer = Peer::accept(listener).await;
        peer.accept_login()
            .await;
        peer
    });
    let (client, events) = client.unwrap();
    (client, events, peer)
}

/// Receive notifications until one matches.
async fn wait_for<F>(events: &mut AmiEventStream, mut pred: F) -> Notification
where
    F: FnMut(&Notification) -> bool,
{
    loop {
        let item = timeout(STEP, events.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("stream ended");
        if let Ok(n) = item {
            if pred(&n) {
                return n;
            }
        }
    }
}

#[tokio::test]
async fn login_sends_credentials_and_events_flag() {
    let (listener, config) = listener().await;
    let config = config.with_events(false);

    let (client, (_peer, login)) = tokio::join!(AmiClient::connect(config), async {
        let mut peer = Peer::accept(&listener).await;
        let login = peer
            .accept_login()
            .await;
        (peer, login)
    });
    let (client, _events) = client.unwrap();

    assert_eq!(login.get("Username"), Some("admin"));
    assert_eq!(login.get("Secret"), Some("s3cret"));
    assert_eq!(login.get("Events"), Some("off"));
    assert!(client.is_logged_in());
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn login_rejected_fails_connect() {
    let (listener, config) = listener().await;
    let config = config.with_reconnect_delay(Duration::from_millis(50));

    let (result, _peer) = tokio::join!(AmiClient::connect(config), async {
        let mut peer = Peer::accept(&listener).await;
        let login = peer
            .read_action()
            .await;
        peer.reply(
            login.action_id(),
            "Error",
            &[("Message", "Authentication failed")],
        )
        .await;
        peer
    });

    match result {
        Err(AmiError::LoginFailed(msg)) => assert_eq!(msg, "Authentication failed"),
        other => panic!("expected LoginFailed, got {:?}", other),
    }

    // No retry after a rejected login.
    assert!(timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn connect_refused_reports_io_error() {
    let (listener, config) = listener().await;
    drop(listener);
    let result = AmiClient::connect(config).await;
    assert!(matches!(result, Err(AmiError::Io(_))));
}

#[tokio::test]
async fn ping_success_and_error_response() {
    let (listener, config) = listener().await;
    let (client, _events, mut peer) = connected(config, &listener).await;

    let (reply, _) = tokio::join!(client.ping(), async {
        let ping = peer
            .read_action()
            .await;
        assert_eq!(ping.get("Action"), Some("Ping"));
        peer.reply(ping.action_id(), "Success", &[("Ping", "Pong")])
            .await;
    });
    let reply = reply.unwrap();
    assert!(reply.is_success());
    assert_eq!(reply.get("Ping"), Some("Pong"));

    let (reply, _) = tokio::join!(client.action(AmiAction::new("Status")), async {
        let status = peer
            .read_action()
            .await;
        peer.reply(status.action_id(), "Error", &[("Message", "boom")])
            .await;
    });
    match reply {
        Err(AmiError::ActionFailed { message, response }) => {
            assert_eq!(message, "boom");
            assert_eq!(response.response(), Some("Error"));
        }
        other => panic!("expected ActionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn replies_match_by_action_id_out_of_order() {
    let (listener, config) = listener().await;
    let (client, _events, mut peer) = connected(config, &listener).await;

    let first = client
        .send_action(AmiAction::new("Ping").field("ActionID", "one"))
        .await
        .unwrap();
    let second = client
        .send_action(AmiAction::new("Ping").field("ActionID", "two"))
        .await
        .unwrap();
    assert_eq!(client.pending_requests(), 2);

    peer.read_action()
        .await;
    peer.read_action()
        .await;
    peer.reply("two", "Success", &[("Tag", "second")])
        .await;
    peer.reply("one", "Success", &[("Tag", "first")])
        .await;

    let second = second
        .await
        .unwrap();
    let first = first
        .await
        .unwrap();
    assert_eq!(first.get("Tag"), Some("first"));
    assert_eq!(second.get("Tag"), Some("second"));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn duplicate_reply_is_published_but_not_correlated() {
    let (listener, config) = listener().await;
    let (client, mut events, mut peer) = connected(config, &listener).await;

    let pending = client
        .send_action(AmiAction::new("Ping").field("ActionID", "dup"))
        .await
        .unwrap();
    peer.read_action()
        .await;
    peer.reply("dup", "Success", &[])
        .await;
    peer.reply("dup", "Error", &[("Message", "late")])
        .await;

    assert!(pending
        .await
        .unwrap()
        .is_success());

    // Both copies still reach subscribers.
    let late = wait_for(&mut events, |n| {
        matches!(n, Notification::Response { message, .. } if message.response() == Some("Error"))
    })
    .await;
    assert_eq!(late.topic(), "response:dup");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn action_without_name_is_rejected_before_sending() {
    let (listener, config) = listener().await;
    let (client, _events, _peer) = connected(config, &listener).await;

    let err = client
        .send_action(AmiAction::empty().field("Channel", "PJSIP/1"))
        .await
        .unwrap_err();
    assert!(matches!(err, AmiError::MissingAction));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn get_var_reads_value_header() {
    let (listener, config) = listener().await;
    let (client, _events, mut peer) = connected(config, &listener).await;

    let (value, _) = tokio::join!(client.get_var(Some("PJSIP/1000-1"), "CALLERID(num)"), async {
        let action = peer
            .read_action()
            .await;
        assert_eq!(action.get("Action"), Some("GetVar"));
        assert_eq!(action.get("Channel"), Some("PJSIP/1000-1"));
        assert_eq!(action.get("Variable"), Some("CALLERID(num)"));
        peer.reply(
            action.action_id(),
            "Success",
            &[("Variable", "CALLERID(num)"), ("Value", "1000")],
        )
        .await;
    });
    assert_eq!(value.unwrap(), "1000");
}

#[tokio::test]
async fn synchronous_originate_waits_for_originate_response() {
    let (listener, config) = listener().await;
    let (client, _events, mut peer) = connected(config, &listener).await;

    let pending = client
        .originate(
            OriginateRequest::new("PJSIP/1000")
                .field("Exten", "100")
                .field("Context", "default")
                .field("Priority", 1)
                .variable("A", "1")
                .variable("B", "2")
                .synchronous(),
        )
        .await
        .unwrap();
    assert!(pending
        .accepted
        .is_none());
    let mut completed = pending
        .completed
        .expect("synchronous originate tracks completion");

    let action = peer
        .read_action()
        .await;
    assert_eq!(action.get("Action"), Some("Originate"));
    assert_eq!(action.get("Async"), Some("true"));
    assert_eq!(action.get_all("Variable"), vec!["A=1", "B=2"]);
    let id = action
        .action_id()
        .to_string();
    assert_eq!(id, pending.action_id);

    // The acceptance response alone does not complete it.
    peer.reply(&id, "Success", &[("Message", "Originate successfully queued")])
        .await;
    assert!(timeout(Duration::from_millis(100), &mut completed)
        .await
        .is_err());

    peer.send(&format!(
        "Event: OriginateResponse\r\nResponse: Failure\r\nActionID: {}\r\nReason: 5\r\n\r\n",
        id
    ))
    .await;
    match timeout(STEP, completed)
        .await
        .unwrap()
    {
        Err(AmiError::OriginateFailed { reason, response }) => {
            assert_eq!(reason, "5");
            assert_eq!(response.event(), Some("OriginateResponse"));
        }
        other => panic!("expected OriginateFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn originate_with_completion_resolves_both() {
    let (listener, config) = listener().await;
    let (client, _events, mut peer) = connected(config, &listener).await;

    let pending = client
        .originate(
            OriginateRequest::new("PJSIP/1000")
                .field("Application", "Playback")
                .with_completion(),
        )
        .await
        .unwrap();
    let action = peer
        .read_action()
        .await;
    let id = action.action_id();
    peer.reply(id, "Success", &[])
        .await;
    peer.send(&format!(
        "Event: OriginateResponse\r\nResponse: Success\r\nActionID: {}\r\nChannel: PJSIP/1000-1\r\n\r\n",
        id
    ))
    .await;

    let accepted = pending
        .accepted
        .unwrap()
        .await
        .unwrap();
    assert!(accepted
        .event()
        .is_none());
    let done = pending
        .completed
        .unwrap()
        .await
        .unwrap();
    assert_eq!(done.get("Channel"), Some("PJSIP/1000-1"));
}

#[tokio::test]
async fn agi_command_accepted_then_executed() {
    let (listener, config) = listener().await;
    let (client, mut events, mut peer) = connected(config, &listener).await;

    let pending = client
        .agi(AgiRequest::new("PJSIP/1000-1", "EXEC Playback beep").with_completion())
        .await
        .unwrap();
    let action = peer
        .read_action()
        .await;
    assert_eq!(action.get("Action"), Some("AGI"));
    assert_eq!(action.get("Command"), Some("EXEC Playback beep"));
    assert_eq!(action.get("CommandID"), Some(pending.command_id.as_str()));
    assert_eq!(action.action_id(), pending.action_id);

    peer.reply(&pending.action_id, "Success", &[("Message", "Added AGI command to queue")])
        .await;
    peer.send(&format!(
        "Event: AsyncAGI\r\nSubEvent: Exec\r\nChannel: PJSIP/1000-1\r\nCommandID: {}\r\nResult: 200%20result%3D0%0A\r\n\r\n",
        pending.command_id
    ))
    .await;

    pending
        .accepted
        .await
        .unwrap();
    let exec = pending
        .completed
        .unwrap()
        .await
        .unwrap();
    assert_eq!(exec.get("Result"), Some("200%20result%3D0%0A"));

    let n = wait_for(&mut events, |n| matches!(n, Notification::AgiExec { .. })).await;
    assert_eq!(n.topic(), format!("agi:exec:{}", pending.command_id));
}

#[tokio::test]
async fn async_agi_start_publishes_decoded_env() {
    let (listener, config) = listener().await;
    let (_client, mut events, mut peer) = connected(config, &listener).await;

    peer.send(
        "Event: AsyncAGI\r\nSubEvent: Start\r\nChannel: PJSIP/1000-1\r\n\
         Env: agi_request%3A%20async%0Aagi_channel%3A%20PJSIP%2F1000-1%0A%0A\r\n\r\n",
    )
    .await;

    match wait_for(&mut events, |n| matches!(n, Notification::AgiSessionStart { .. })).await {
        Notification::AgiSessionStart { env, message } => {
            assert_eq!(env.get("agi_request").map(String::as_str), Some("async"));
            assert_eq!(
                env.get("agi_channel").map(String::as_str),
                Some("PJSIP/1000-1")
            );
            assert_eq!(message.get("Channel"), Some("PJSIP/1000-1"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn events_are_published_by_name_and_action_id() {
    let (listener, config) = listener().await;
    let (_client, mut events, mut peer) = connected(config, &listener).await;

    peer.send("Event: Hangup\r\nChannel: PJSIP/1000-1\r\nCause: 16\r\n\r\n")
        .await;
    peer.send("Event: PeerEntry\r\nActionID: list-1\r\nObjectName: 1000\r\n\r\n")
        .await;

    let hangup = wait_for(&mut events, |n| matches!(n, Notification::Event { .. })).await;
    assert_eq!(hangup.topic(), "event:Hangup");
    assert_eq!(
        hangup
            .message()
            .and_then(|m| m.get("Cause")),
        Some("16")
    );

    let entry = wait_for(&mut events, |n| matches!(n, Notification::EventFor { .. })).await;
    assert_eq!(entry.topic(), "event:list-1");
}

#[tokio::test]
async fn reconnects_after_close_and_keeps_pending() {
    let (listener, config) = listener().await;
    let config = config.with_reconnect_delay(Duration::from_millis(50));
    let (client, mut events, mut peer) = connected(config, &listener).await;

    let pending = client
        .send_action(AmiAction::new("Ping").field("ActionID", "survivor"))
        .await
        .unwrap();
    peer.read_action()
        .await;
    drop(peer);

    let closed = wait_for(&mut events, |n| matches!(n, Notification::Closed(_))).await;
    assert!(matches!(
        closed,
        Notification::Closed(DisconnectReason::ConnectionClosed)
    ));
    wait_for(&mut events, |n| matches!(n, Notification::Reconnecting { .. })).await;

    let mut peer = Peer::accept(&listener).await;
    peer.accept_login()
        .await;
    timeout(STEP, client.wait_ready())
        .await
        .unwrap()
        .unwrap();

    // A reply on the new socket still completes the earlier request.
    peer.reply("survivor", "Success", &[])
        .await;
    assert!(pending
        .await
        .unwrap()
        .is_success());
}

#[tokio::test]
async fn disconnect_fails_pending_and_ends_stream() {
    let (listener, config) = listener().await;
    let config = config.with_reconnect_delay(Duration::from_millis(50));
    let (client, mut events, mut peer) = connected(config, &listener).await;

    let pending = client
        .send_action(AmiAction::new("Ping"))
        .await
        .unwrap();
    peer.read_action()
        .await;

    client
        .disconnect()
        .await
        .unwrap();
    assert!(matches!(pending.await, Err(AmiError::ConnectionClosed)));

    // Drain until the stream ends; no reconnect happens.
    timeout(STEP, async { while events.recv().await.is_some() {} })
        .await
        .unwrap();
    assert!(timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());
    assert!(matches!(
        client
            .send_action(AmiAction::new("Ping"))
            .await,
        Err(AmiError::NotConnected)
    ));
}

#[tokio::test]
async fn logoff_accepts_goodbye() {
    let (listener, config) = listener().await;
    let (client, _events, mut peer) = connected(config, &listener).await;

    let (result, _) = tokio::join!(client.logoff(), async {
        let action = peer
            .read_action()
            .await;
        assert_eq!(action.get("Action"), Some("Logoff"));
        peer.reply(
            action.action_id(),
            "Goodbye",
            &[("Message", "Thanks for all the fish.")],
        )
        .await;
    });
    assert_eq!(
        result
            .unwrap()
            .response(),
        Some("Goodbye")
    );
    assert!(matches!(client.ping().await, Err(AmiError::NotConnected)));
}

#[tokio::test]
async fn login_interrupted_by_close_leaves_nothing_pending() {
    let (listener, config) = listener().await;
    let config = config.with_reconnect_delay(Duration::from_millis(50));
    let (client, _events) = AmiClient::start(config);

    // First socket hangs up without answering the login.
    let mut first = Peer::accept(&listener).await;
    let login = first
        .read_action()
        .await;
    assert_eq!(login.get("Action"), Some("Login"));
    drop(first);

    let mut second = Peer::accept(&listener).await;
    second
        .accept_login()
        .await;
    timeout(STEP, client.wait_ready())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn close_without_reconnect_is_terminal() {
    let (listener, config) = listener().await;
    let (client, mut events, peer) = connected(config, &listener).await;

    drop(peer);
    let closed = wait_for(&mut events, |n| matches!(n, Notification::Closed(_))).await;
    assert!(matches!(
        closed,
        Notification::Closed(DisconnectReason::ConnectionClosed)
    ));

    // Nothing follows the close: no Reconnecting, and the stream ends.
    let rest = timeout(STEP, async {
        let mut rest = Vec::new();
        while let Some(item) = events.recv().await {
            rest.push(item);
        }
        rest
    })
    .await
    .unwrap();
    assert!(rest.is_empty(), "unexpected notifications: {:?}", rest);
    assert_eq!(
        client.state(),
        ConnectionState::Disconnected(DisconnectReason::ConnectionClosed)
    );
    assert!(matches!(
        client.wait_ready().await,
        Err(AmiError::ConnectionClosed)
    ));
    assert!(timeout(Duration::from_millis(200), listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn action_nowait_sends_without_registering() {
    let (listener, config) = listener().await;
    let (client, _events, mut peer) = connected(config, &listener).await;

    let action_id = client
        .action_nowait(AmiAction::new("Ping"))
        .await
        .unwrap();
    assert!(!action_id.is_empty());
    assert_eq!(client.pending_requests(), 0);

    let sent = peer
        .read_action()
        .await;
    assert_eq!(sent.get("Action"), Some("Ping"));
    assert_eq!(sent.action_id(), action_id);

    let kept = client
        .action_nowait(AmiAction::new("Ping").field("ActionID", "mine"))
        .await
        .unwrap();
    assert_eq!(kept, "mine");
    assert_eq!(
        peer.read_action()
            .await
            .action_id(),
        "mine"
    );

    assert!(matches!(
        client
            .action_nowait(AmiAction::empty())
            .await,
        Err(AmiError::MissingAction)
    ));
}
