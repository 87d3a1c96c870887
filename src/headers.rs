//! Typed field names for AMI records.

/// Error returned when parsing an unrecognized field name.
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
    /// Field names with meaning to the client.
    ///
    /// Keys are case-sensitive on the wire; [`FromStr`](std::str::FromStr) is
    /// case-insensitive for convenience when reading user input. Use with
    /// [`Record::get()`](crate::Record::get) for typed lookups.
    pub enum AmiHeader {
        Action => "Action",
        ActionId => "ActionID",
        Response => "Response",
        Message => "Message",
        Event => "Event",
        Privilege => "Privilege",
        Username => "Username",
        Secret => "Secret",
        /// Raw `Output` as sent by the server. Only the first one survives
        /// parsing, renamed to [`RealOutput`](AmiHeader::RealOutput).
        Output => "Output",
        RealOutput => "RealOutput",
        /// Accumulated body of a `Response: Follows` record.
        CommandResponse => "CommandResponse",
    }
}
