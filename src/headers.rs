//! Typed header names for AMI messages and actions.

/// Error returned when parsing an unrecognized header name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAmiHeaderError(pub String);

impl std::fmt::Display for ParseAmiHeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown AMI header: {}", self.0)
    }
}

impl std::error::Error for ParseAmiHeaderError {}

define_header_enum! {
    error_type: ParseAmiHeaderError,
    /// Header names the client reads or writes itself.
    ///
    /// Use with [`AmiMessage::get()`](crate::AmiMessage::get) and
    /// [`AmiAction::set()`](crate::AmiAction::set) for typed lookups.
    pub enum AmiHeader {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Event => "Event",
        SubEvent => "SubEvent",
        Message => "Message",
        Reason => "Reason",
        Command => "Command",
        CommandId => "CommandID",
        Async => "Async",
        Variable => "Variable",
        Value => "Value",
        Channel => "Channel",
        Username => "Username",
        Secret => "Secret",
        Env => "Env",
        Events => "Events",
    }
}
