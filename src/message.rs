//! Parsed AMI messages

use crate::constants::{ENV_PAIR_SEPARATOR, ENV_RECORD_SEPARATOR, RESPONSE_SUCCESS};
use crate::headers::AmiHeader;
use indexmap::IndexMap;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::HashMap;

/// Value of one header in a received message.
///
/// A header that appears once is `Single`; the same name repeated inside one
/// message collects every occurrence, in wire order, into `Multi`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    /// First (or only) value.
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::Single(v) => v,
            HeaderValue::Multi(values) => values
                .first()
                .map(|s| s.as_str())
                .unwrap_or(""),
        }
    }

    /// Every value in wire order.
    pub fn as_slice(&self) -> &[String] {
        match self {
            HeaderValue::Single(v) => std::slice::from_ref(v),
            HeaderValue::Multi(values) => values,
        }
    }

    fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(first) => {
                let first = std::mem::take(first);
                *self = HeaderValue::Multi(vec![first, value]);
            }
            HeaderValue::Multi(values) => values.push(value),
        }
    }
}

/// Coarse classification of a message by its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Carries a `Response` header.
    Response,
    /// Carries an `Event` header (and no `Response`).
    Event,
    /// Neither.
    Bare,
}

/// A message received from the manager: ordered headers.
///
/// Header names are case-sensitive wire tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AmiMessage {
    headers: IndexMap<String, HeaderValue>,
}

impl AmiMessage {
    /// Create an empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header occurrence. A repeated name turns into a `Multi` value.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .entry(name.into())
        {
            indexmap::map::Entry::Occupied(mut e) => e
                .get_mut()
                .push(value),
            indexmap::map::Entry::Vacant(e) => {
                e.insert(HeaderValue::Single(value));
            }
        }
    }

    /// Set or overwrite a header with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers
            .insert(name.into(), HeaderValue::Single(value.into()));
    }

    /// First value of a header.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.headers
            .get(name.as_ref())
            .map(HeaderValue::first)
    }

    /// Every value of a header in wire order (empty if absent).
    pub fn get_all(&self, name: impl AsRef<str>) -> &[String] {
        self.headers
            .get(name.as_ref())
            .map(HeaderValue::as_slice)
            .unwrap_or(&[])
    }

    /// Raw header value.
    pub fn header_value(&self, name: impl AsRef<str>) -> Option<&HeaderValue> {
        self.headers
            .get(name.as_ref())
    }

    /// Whether the header is present.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.headers
            .contains_key(name.as_ref())
    }

    /// Headers in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.headers
            .len()
    }

    /// True when no header was parsed.
    pub fn is_empty(&self) -> bool {
        self.headers
            .is_empty()
    }

    /// Classification derived from `Response` / `Event`.
    pub fn kind(&self) -> MessageKind {
        if self.contains(AmiHeader::Response) {
            MessageKind::Response
        } else if self.contains(AmiHeader::Event) {
            MessageKind::Event
        } else {
            MessageKind::Bare
        }
    }

    pub fn is_response(&self) -> bool {
        self.contains(AmiHeader::Response)
    }

    pub fn is_event(&self) -> bool {
        self.contains(AmiHeader::Event)
    }

    /// `ActionID`, if present and non-empty.
    pub fn action_id(&self) -> Option<&str> {
        self.get(AmiHeader::ActionId)
            .filter(|s| !s.is_empty())
    }

    /// `CommandID`, if present and non-empty.
    pub fn command_id(&self) -> Option<&str> {
        self.get(AmiHeader::CommandId)
            .filter(|s| !s.is_empty())
    }

    /// `Event` header.
    pub fn event(&self) -> Option<&str> {
        self.get(AmiHeader::Event)
    }

    /// `Response` header.
    pub fn response(&self) -> Option<&str> {
        self.get(AmiHeader::Response)
    }

    /// `Response: Success`.
    pub fn is_success(&self) -> bool {
        self.response() == Some(RESPONSE_SUCCESS)
    }

    /// `Message` header (human-readable reply text).
    pub fn message_text(&self) -> Option<&str> {
        self.get(AmiHeader::Message)
    }

    /// Decoded AsyncAGI `Env` block, if the message carries one.
    pub fn agi_env(&self) -> Option<HashMap<String, String>> {
        self.get(AmiHeader::Env)
            .map(decode_env)
    }
}

impl<K, V> FromIterator<(K, V)> for AmiMessage
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut message = AmiMessage::new();
        for (k, v) in iter {
            message.append(k, v);
        }
        message
    }
}

fn percent_decode_lossless(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Decode an AsyncAGI environment blob.
///
/// Records are separated by `%0A` and each record's key and value by
/// `%3A%20`. Records with an empty key are skipped; a record without a value
/// maps to an empty string. Remaining escapes in keys and values are
/// percent-decoded.
///
/// ```
/// # use asterisk_ami_tokio::decode_env;
/// let env = decode_env("FOO%3A%20bar%0ABAZ%3A%20qux");
/// assert_eq!(env["FOO"], "bar");
/// assert_eq!(env["BAZ"], "qux");
/// ```
pub fn decode_env(blob: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for record in blob.split(ENV_RECORD_SEPARATOR) {
        let mut pieces = record.splitn(2, ENV_PAIR_SEPARATOR);
        let key = pieces
            .next()
            .unwrap_or("");
        if key.is_empty() {
            continue;
        }
        let value = pieces
            .next()
            .unwrap_or("");
        env.insert(percent_decode_lossless(key), percent_decode_lossless(value));
    }
    env
}
