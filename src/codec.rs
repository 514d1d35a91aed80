//! AMI framing: byte stream to messages, actions to wire text

use crate::{
    action::{AmiAction, FieldValue},
    constants::{
        BUF_CHUNK, EVENT_ASYNC_AGI, EVENT_ORIGINATE_RESPONSE, LINE_SEPARATOR, MAX_LINE_LENGTH,
        SUBEVENT_END, SUBEVENT_EXEC, SUBEVENT_START,
    },
    error::{AmiError, AmiResult},
    headers::AmiHeader,
    message::AmiMessage,
};
use bytes::{Buf, BytesMut};
use tracing::{trace, warn};

const CRLF: &[u8] = b"\r\n";

/// One unit produced by the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The handshake line was consumed; the manager is ready for a login.
    Ready,
    /// A complete, non-empty message.
    Message(AmiMessage),
}

/// Classification signals derived from one message, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Every message.
    Message,
    /// `Response` header present.
    Response,
    /// `Event` header present.
    Event,
    /// `AsyncAGI` / `Start` without `Command`: a channel entered AsyncAGI.
    AgiSessionStart,
    /// `AsyncAGI` / `Start` with `Command`.
    AgiCommandStart,
    /// `AsyncAGI` / `End` without `Command`: the channel left AsyncAGI.
    AgiSessionEnd,
    /// `AsyncAGI` / `End` with `Command`.
    AgiCommandEnd,
    /// `AsyncAGI` / `Exec`: a queued AGI command finished.
    AgiExec,
    /// `OriginateResponse` event.
    Originate,
}

/// Classify a message into the signals a dispatcher reacts to.
pub fn classify(message: &AmiMessage) -> Vec<Signal> {
    let mut signals = vec![Signal::Message];
    if message.is_response() {
        signals.push(Signal::Response);
    }
    let Some(event) = message.event() else {
        return signals;
    };
    signals.push(Signal::Event);

    if event == EVENT_ASYNC_AGI {
        let has_command = message.contains(AmiHeader::Command);
        match message.get(AmiHeader::SubEvent) {
            Some(SUBEVENT_START) if has_command => signals.push(Signal::AgiCommandStart),
            Some(SUBEVENT_START) => signals.push(Signal::AgiSessionStart),
            Some(SUBEVENT_END) if has_command => signals.push(Signal::AgiCommandEnd),
            Some(SUBEVENT_END) => signals.push(Signal::AgiSessionEnd),
            Some(SUBEVENT_EXEC) => signals.push(Signal::AgiExec),
            _ => {}
        }
    }
    if event == EVENT_ORIGINATE_RESPONSE {
        signals.push(Signal::Originate);
    }
    signals
}

/// Line-reassembling AMI decoder.
///
/// Owned by exactly one socket; a reconnect gets a fresh instance.
#[derive(Debug)]
pub struct AmiCodec {
    buffer: BytesMut,
    lines: Vec<String>,
    banner: Option<String>,
    ready: bool,
}

impl AmiCodec {
    /// Create new codec
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUF_CHUNK),
            lines: Vec::new(),
            banner: None,
            ready: false,
        }
    }

    /// Append received bytes to the buffer.
    ///
    /// Fails if the unterminated tail grows past [`MAX_LINE_LENGTH`].
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        if self.buffer.len() > MAX_LINE_LENGTH && find_crlf(&self.buffer).is_none() {
            return Err(AmiError::LineTooLong {
                limit: MAX_LINE_LENGTH,
            });
        }
        Ok(())
    }

    /// Append bytes and iterate over the frames they complete.
    ///
    /// The iterator is lazy: lines are split off the buffer as it is
    /// advanced. Frames not consumed stay buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> AmiResult<Frames<'_>> {
        self.add_data(data)?;
        Ok(Frames { codec: self })
    }

    /// Try to produce the next frame from buffered data.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let line = self.next_line()?;

            if !self.ready {
                self.ready = true;
                trace!("[RECV] Handshake line: {:?}", line);
                if !line.is_empty() {
                    self.banner = Some(line);
                }
                return Some(Frame::Ready);
            }

            if !line.is_empty() {
                self.lines
                    .push(line);
                continue;
            }

            if self
                .lines
                .is_empty()
            {
                continue;
            }

            let lines = std::mem::take(&mut self.lines);
            let message = parse_lines(&lines);
            if message.is_empty() {
                trace!("[RECV] Dropping message with no headers");
                continue;
            }
            return Some(Frame::Message(message));
        }
    }

    /// Banner text sent by the manager, once seen.
    pub fn banner(&self) -> Option<&str> {
        self.banner
            .as_deref()
    }

    /// Whether the handshake line has been consumed.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Discard buffered bytes and any partially accumulated message.
    pub fn flush(&mut self) {
        self.buffer
            .clear();
        self.lines
            .clear();
    }

    fn next_line(&mut self) -> Option<String> {
        let pos = find_crlf(&self.buffer)?;
        let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
        self.buffer
            .advance(pos + CRLF.len());
        Some(line)
    }
}

impl Default for AmiCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy iterator over frames completed by buffered data.
pub struct Frames<'a> {
    codec: &'a mut AmiCodec,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.codec
            .next_frame()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len())
        .position(|w| w == CRLF)
}

/// Parse `Name: value` lines into a message.
///
/// Lines without a colon (or with an empty name) are ignored.
fn parse_lines(lines: &[String]) -> AmiMessage {
    let mut message = AmiMessage::new();
    for line in lines {
        let Some(colon_pos) = line.find(':') else {
            continue;
        };
        let name = line[..colon_pos].trim();
        if name.is_empty() {
            continue;
        }
        let value = line[colon_pos + 1..].trim();
        message.append(name, value);
    }
    message
}

fn validate_line_safe(header: &str, s: &str, what: &'static str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        warn!("[SEND] Rejecting {} with line break in {}", what, header);
        return Err(AmiError::InvalidField {
            header: header.to_string(),
            reason: "contains a line break",
        });
    }
    Ok(())
}

fn push_line(out: &mut String, name: &str, value: &str) -> AmiResult<()> {
    validate_line_safe(name, value, "value")?;
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str(LINE_SEPARATOR);
    Ok(())
}

/// Encode an action into wire text, terminated by a blank line.
///
/// List values produce one line per element with the name repeated.
/// Maps and nested lists cannot be expressed and are rejected, as are
/// names or values that would break line framing.
///
/// ```
/// use asterisk_ami_tokio::{codec::encode, AmiAction};
///
/// let action = AmiAction::new("Ping").field("ActionID", 7);
/// assert_eq!(encode(&action).unwrap(), "Action: Ping\r\nActionID: 7\r\n\r\n");
/// ```
pub fn encode(action: &AmiAction) -> AmiResult<String> {
    let mut out = String::new();
    for (name, value) in action.iter() {
        if name.is_empty() || name.contains(':') {
            warn!("[SEND] Rejecting invalid header name {:?}", name);
            return Err(AmiError::InvalidField {
                header: name.to_string(),
                reason: "not a valid header name",
            });
        }
        validate_line_safe(name, name, "name")?;

        match value {
            FieldValue::Text(s) => push_line(&mut out, name, s)?,
            FieldValue::Number(n) => push_line(&mut out, name, &n.to_string())?,
            FieldValue::List(items) => {
                for item in items {
                    match item {
                        FieldValue::Text(s) => push_line(&mut out, name, s)?,
                        FieldValue::Number(n) => push_line(&mut out, name, &n.to_string())?,
                        other => {
                            warn!("[SEND] Unhandled {} element in {}", other.kind(), name);
                            return Err(AmiError::UnsupportedValue {
                                header: name.to_string(),
                                kind: other.kind(),
                            });
                        }
                    }
                }
            }
            FieldValue::Map(_) => {
                warn!("[SEND] Unhandled map value in {}", name);
                return Err(AmiError::UnsupportedValue {
                    header: name.to_string(),
                    kind: value.kind(),
                });
            }
        }
    }
    out.push_str(LINE_SEPARATOR);
    Ok(out)
}
