//! AMI records: flat field maps exchanged in both directions

use crate::{
    constants::{
        ACTION_LOGIN, ACTION_PING, HEARTBEAT_ACTION_ID, MESSAGE_AUTH_ACCEPTED, MESSAGE_TIMEOUT,
        RESPONSE_ERROR, RESPONSE_FOLLOWS, RESPONSE_SUCCESS,
    },
    error::{AmiError, AmiResult},
    headers::AmiHeader,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Classification of the `Response` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseStatus {
    /// `Response: Success`
    Success,
    /// `Response: Error`
    Error,
    /// `Response: Follows` (multi-line command output)
    Follows,
    /// Any other value.
    Other,
}

impl ResponseStatus {
    fn from_wire(value: &str) -> Self {
        match value {
            RESPONSE_SUCCESS => ResponseStatus::Success,
            RESPONSE_ERROR => ResponseStatus::Error,
            RESPONSE_FOLLOWS => ResponseStatus::Follows,
            _ => ResponseStatus::Other,
        }
    }
}

/// A single AMI record: an action, a response, or an event.
///
/// Field order carries no meaning on the wire. Field names are
/// case-sensitive.
///
/// ```
/// use asterisk_ami_tokio::{AmiHeader, Record};
///
/// let action = Record::action("CoreStatus").with("ActionID", "abc-1");
/// assert_eq!(action.get(AmiHeader::Action), Some("CoreStatus"));
/// assert_eq!(action.action_id(), Some("abc-1"));
/// ```
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    fields: HashMap<String, String>,
    /// Set only on the locally generated timeout reply.
    #[serde(skip)]
    synthetic: bool,
}

impl Record {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record with its `Action` field set.
    pub fn action(name: impl Into<String>) -> Self {
        Self::new().with(AmiHeader::Action, name)
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    /// Login action carrying credentials and a fresh `ActionID`.
    pub(crate) fn login(username: &str, secret: &str) -> Self {
        Self::action(ACTION_LOGIN)
            .with(AmiHeader::ActionId, uuid::Uuid::new_v4().to_string())
            .with(AmiHeader::Username, username)
            .with(AmiHeader::Secret, secret)
    }

    /// Heartbeat ping with the reserved `ActionID`.
    pub(crate) fn heartbeat() -> Self {
        Self::action(ACTION_PING).with(AmiHeader::ActionId, HEARTBEAT_ACTION_ID)
    }

    /// The reply delivered when a request times out locally.
    pub(crate) fn timeout(action_id: &str) -> Self {
        let mut record = Self::new()
            .with(AmiHeader::ActionId, action_id)
            .with(AmiHeader::Response, RESPONSE_ERROR)
            .with(AmiHeader::Message, MESSAGE_TIMEOUT);
        record.synthetic = true;
        record
    }

    /// Look up a field by name.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
        self.fields
            .get(name.as_ref())
            .map(|s| s.as_str())
    }

    /// Set or overwrite a field.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.fields
            .insert(name.as_ref().to_string(), value.into());
    }

    /// Remove a field, returning its value if it existed.
    pub fn remove(&mut self, name: impl AsRef<str>) -> Option<String> {
        self.fields
            .remove(name.as_ref())
    }

    /// Whether the field is present.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.fields
            .contains_key(name.as_ref())
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// `true` if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate over `(name, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// All fields as a map.
    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    /// Consume the record, returning its fields.
    pub fn into_fields(self) -> HashMap<String, String> {
        self.fields
    }

    /// `Action` field.
    pub fn action_name(&self) -> Option<&str> {
        self.get(AmiHeader::Action)
    }

    /// `ActionID` field, `None` if absent or empty.
    pub fn action_id(&self) -> Option<&str> {
        self.get(AmiHeader::ActionId)
            .filter(|id| !id.is_empty())
    }

    /// Return the `ActionID`, generating a UUID first if it is missing.
    pub fn ensure_action_id(&mut self) -> String {
        if let Some(id) = self.action_id() {
            return id.to_string();
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set(AmiHeader::ActionId, id.clone());
        id
    }

    /// Raw `Response` field.
    pub fn response(&self) -> Option<&str> {
        self.get(AmiHeader::Response)
    }

    /// Classification of the `Response` field, `None` for events.
    pub fn response_status(&self) -> Option<ResponseStatus> {
        self.response()
            .map(ResponseStatus::from_wire)
    }

    /// `Message` field.
    pub fn message(&self) -> Option<&str> {
        self.get(AmiHeader::Message)
    }

    /// `Event` field, present on unsolicited records.
    pub fn event(&self) -> Option<&str> {
        self.get(AmiHeader::Event)
    }

    /// Accumulated output of a `Response: Follows` record.
    pub fn command_response(&self) -> Option<&str> {
        self.get(AmiHeader::CommandResponse)
    }

    /// The first `Output` field of the record.
    pub fn real_output(&self) -> Option<&str> {
        self.get(AmiHeader::RealOutput)
    }

    /// `Response: Error` with `Message: Timeout`, whether generated locally
    /// or sent by the server.
    pub fn is_timeout(&self) -> bool {
        self.response_status() == Some(ResponseStatus::Error)
            && self.message() == Some(MESSAGE_TIMEOUT)
    }

    /// `true` only for the timeout reply generated by the client itself.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Whether a login reply grants access.
    ///
    /// Asterisk versions differ on which field carries the verdict, so either
    /// `Response: Success` or `Message: Authentication accepted` is enough.
    pub fn is_auth_accepted(&self) -> bool {
        self.response_status() == Some(ResponseStatus::Success)
            || self.message() == Some(MESSAGE_AUTH_ACCEPTED)
    }

    /// Reject names and values that would break line framing.
    pub fn validate(&self) -> AmiResult<()> {
        for (name, value) in self.iter() {
            if name.is_empty() || name.contains(&[':', '\r', '\n'][..]) {
                return Err(AmiError::InvalidHeader {
                    header: name.to_string(),
                });
            }
            if value.contains(&['\r', '\n'][..]) {
                return Err(AmiError::InvalidHeader {
                    header: format!("{}: value must not contain newlines", name),
                });
            }
        }
        Ok(())
    }

    /// Convert to a result based on the `Response` field.
    ///
    /// ```
    /// # use asterisk_ami_tokio::{AmiError, Record};
    /// let ok = Record::new().with("Response", "Success");
    /// assert!(ok.into_result().is_ok());
    ///
    /// let err = Record::new().with("Response", "Error").with("Message", "No such channel");
    /// assert!(matches!(err.into_result(), Err(AmiError::ActionFailed { .. })));
    /// ```
    pub fn into_result(self) -> AmiResult<Self> {
        match self.response_status() {
            Some(ResponseStatus::Error) => Err(AmiError::ActionFailed {
                message: self
                    .message()
                    .unwrap_or(RESPONSE_ERROR)
                    .to_string(),
            }),
            _ => Ok(self),
        }
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.iter() {
            if name == AmiHeader::Secret.as_str() {
                map.entry(&name, &"[REDACTED]");
            } else {
                map.entry(&name, &value);
            }
        }
        map.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            synthetic: false,
        }
    }
}

impl From<HashMap<String, String>> for Record {
    fn from(fields: HashMap<String, String>) -> Self {
        Self {
            fields,
            synthetic: false,
        }
    }
}
