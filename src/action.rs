//! Outbound action frames and typed request builders

use crate::headers::AmiHeader;
use indexmap::IndexMap;
use uuid::Uuid;

/// Generate a fresh correlation token.
pub(crate) fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Value of one outbound field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Plain text, written as-is.
    Text(String),
    /// Integer, written in decimal.
    Number(i64),
    /// One wire line per element, each repeating the field name.
    List(Vec<FieldValue>),
    /// Key/value pairs. Must be flattened (see [`FieldValue::flatten_pairs`])
    /// before encoding; the codec rejects it otherwise.
    Map(Vec<(String, String)>),
}

impl FieldValue {
    /// Convert a `Map` into a `List` of `key=value` strings.
    /// Other kinds are returned unchanged.
    pub fn flatten_pairs(self) -> FieldValue {
        match self {
            FieldValue::Map(pairs) => FieldValue::List(
                pairs
                    .into_iter()
                    .map(|(k, v)| FieldValue::Text(format!("{}={}", k, v)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Text form of a scalar value.
    pub fn as_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Number(_) => "number",
            FieldValue::List(_) => "list",
            FieldValue::Map(_) => "map",
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<&String> for FieldValue {
    fn from(s: &String) -> Self {
        FieldValue::Text(s.clone())
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Text(if b { "true" } else { "false" }.to_string())
    }
}

macro_rules! number_field {
    ($($t:ty),+) => {
        $(
            impl From<$t> for FieldValue {
                fn from(n: $t) -> Self {
                    FieldValue::Number(i64::from(n))
                }
            }
        )+
    };
}

number_field!(i8, i16, i32, i64, u8, u16, u32);

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(items: Vec<T>) -> Self {
        FieldValue::List(
            items
                .into_iter()
                .map(Into::into)
                .collect(),
        )
    }
}

/// An outbound action: ordered fields, encoded by [`crate::codec::encode`].
///
/// ```
/// use asterisk_ami_tokio::AmiAction;
///
/// let action = AmiAction::new("Command")
///     .field("Command", "core show uptime")
///     .field("Timeout", 5);
/// assert_eq!(action.name(), Some("Command"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AmiAction {
    fields: IndexMap<String, FieldValue>,
}

impl AmiAction {
    /// Start an action with the given `Action` name.
    pub fn new(name: impl Into<String>) -> Self {
        let mut action = Self::default();
        action.set(AmiHeader::Action, name.into());
        action
    }

    /// An action with no fields; `Action` must be set before sending.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder form of [`set`](Self::set).
    pub fn field(mut self, name: impl AsRef<str>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Set or overwrite a field. An overwritten field keeps its position.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<FieldValue>) {
        self.fields
            .insert(name.as_ref().to_string(), value.into());
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<FieldValue> {
        self.fields
            .shift_remove(name.as_ref())
    }

    /// Look up a field.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&FieldValue> {
        self.fields
            .get(name.as_ref())
    }

    /// Text of a scalar field.
    pub fn get_text(&self, name: impl AsRef<str>) -> Option<String> {
        self.get(name)?
            .as_text()
    }

    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.fields
            .contains_key(name.as_ref())
    }

    /// The `Action` name, if set to non-empty text.
    pub fn name(&self) -> Option<&str> {
        match self.get(AmiHeader::Action) {
            Some(FieldValue::Text(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// The `ActionID`, if set.
    pub fn action_id(&self) -> Option<String> {
        self.get_text(AmiHeader::ActionId)
            .filter(|s| !s.is_empty())
    }

    /// Return the existing `ActionID`, or assign a fresh one.
    pub fn ensure_action_id(&mut self) -> String {
        if let Some(id) = self.action_id() {
            return id;
        }
        let id = new_correlation_id();
        self.set(AmiHeader::ActionId, id.clone());
        id
    }

    /// Copy every field of `other` into this action; `other` wins on conflicts.
    pub fn merge(&mut self, other: AmiAction) {
        for (name, value) in other.fields {
            self.fields
                .insert(name, value);
        }
    }

    /// Fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields
            .is_empty()
    }
}

/// An AsyncAGI command to run on a channel parked in `AGI(agi:async)`.
///
/// `ActionID` and `CommandID` are assigned when sent, unless set in `fields`.
#[derive(Debug, Clone, Default)]
pub struct AgiRequest {
    /// Channel running AsyncAGI.
    pub channel: String,
    /// AGI command line, e.g. `EXEC Playback demo-congrats`.
    pub command: String,
    /// Extra fields; these override the generated ones.
    pub fields: AmiAction,
    /// Also wait for the `AsyncAGI` `Exec` event that reports completion.
    pub complete: bool,
}

impl AgiRequest {
    pub fn new(channel: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            command: command.into(),
            fields: AmiAction::empty(),
            complete: false,
        }
    }

    /// Track completion of the command as well as its acceptance.
    pub fn with_completion(mut self) -> Self {
        self.complete = true;
        self
    }

    /// Build the `Action: AGI` frame with both correlation IDs.
    pub(crate) fn into_action(self) -> (AmiAction, String, String) {
        let mut action = AmiAction::new("AGI")
            .field(AmiHeader::Channel, self.channel)
            .field(AmiHeader::Command, self.command);
        action.merge(self.fields);
        let action_id = action.ensure_action_id();
        let command_id = match action.get_text(AmiHeader::CommandId) {
            Some(id) if !id.is_empty() => id,
            _ => {
                let id = new_correlation_id();
                action.set(AmiHeader::CommandId, id.clone());
                id
            }
        };
        // The action name is fixed regardless of what `fields` carried.
        action.set(AmiHeader::Action, "AGI");
        (action, action_id, command_id)
    }
}

/// A call origination. Always sent with `Async: true`.
#[derive(Debug, Clone, Default)]
pub struct OriginateRequest {
    /// `Channel`, `Exten`, `Context`, `Priority`, `Application`, ... as fields.
    pub fields: AmiAction,
    /// Channel variables, sent as repeated `Variable: key=value` lines.
    pub variables: Vec<(String, String)>,
    /// Complete the request only on the terminal `OriginateResponse` event.
    pub sync: bool,
    /// When not `sync`, additionally track the terminal `OriginateResponse`.
    pub complete: bool,
}

impl OriginateRequest {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            fields: AmiAction::empty().field(AmiHeader::Channel, channel.into()),
            ..Default::default()
        }
    }

    /// Builder form for an arbitrary originate field.
    pub fn field(mut self, name: impl AsRef<str>, value: impl Into<FieldValue>) -> Self {
        self.fields
            .set(name, value);
        self
    }

    /// Add a channel variable.
    pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .push((key.into(), value.into()));
        self
    }

    /// Wait for the call outcome instead of the acceptance.
    pub fn synchronous(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Track the call outcome in addition to the acceptance.
    pub fn with_completion(mut self) -> Self {
        self.complete = true;
        self
    }

    /// Build the `Action: Originate` frame.
    pub(crate) fn into_action(self) -> (AmiAction, String) {
        let mut action = AmiAction::new("Originate");
        action.merge(self.fields);
        let action_id = action.ensure_action_id();

        // A `Variable` field given as a map is flattened and joined with
        // the dedicated variable list.
        let mut variables: Vec<FieldValue> = match action.remove(AmiHeader::Variable) {
            Some(FieldValue::List(items)) => items,
            Some(map @ FieldValue::Map(_)) => match map.flatten_pairs() {
                FieldValue::List(items) => items,
                other => vec![other],
            },
            Some(other) => vec![other],
            None => Vec::new(),
        };
        variables.extend(
            self.variables
                .into_iter()
                .map(|(k, v)| FieldValue::Text(format!("{}={}", k, v))),
        );
        if !variables.is_empty() {
            action.set(AmiHeader::Variable, FieldValue::List(variables));
        }

        action.set(AmiHeader::Async, true);
        (action, action_id)
    }
}
