//! Command Records
//!
//! The unit of the wire protocol. A record is UTF-8 text of the form
//! `keyword` or `keyword: payload`, terminated by [`COMMAND_DELIMITER`].
//!
//! [`CommandRecord`] is the untyped form produced by the channel. [`Command`]
//! is the typed form of everything a device may send; converting between the
//! two is an exact keyword match, so `incoming_contact` can never be confused
//! with `incoming_contact_photo_part`.

use crate::models::{Call, Contact, Message, Notification};
use crate::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use std::fmt;

/// Terminates every record on the wire
pub const COMMAND_DELIMITER: &[u8] = b"``;";

/// Separates keyword from payload
pub const PAYLOAD_SEPARATOR: &str = ": ";

/// Separates transfer id from chunk data in photo parts
pub const PART_SEPARATOR: &str = " | ";

/// Keywords used on the device link and the relay link
pub mod keywords {
    // device -> desktop
    pub const SERVER_HEARTBEAT: &str = "server_heartbeat";
    pub const CHECK_CONTACT_INFO_HASHES: &str = "check_contact_info_hashes";
    pub const CHECK_CONTACT_PHOTO_HASHES: &str = "check_contact_photo_hashes";
    pub const CHECK_MESSAGE_IDS: &str = "check_message_ids";
    pub const CHECK_CALL_IDS: &str = "check_call_ids";
    pub const INCOMING_CLIPBOARD: &str = "incoming_clipboard";
    pub const INCOMING_CONTACT: &str = "incoming_contact";
    pub const INCOMING_CONTACT_PHOTO_PART: &str = "incoming_contact_photo_part";
    pub const INCOMING_MESSAGE: &str = "incoming_message";
    pub const INCOMING_CALL: &str = "incoming_call";
    pub const INCOMING_NOTIFICATION: &str = "incoming_notification";
    pub const DELETE_CONTACT: &str = "delete_contact";
    pub const DELETE_MESSAGE: &str = "delete_message";
    pub const DELETE_CALL: &str = "delete_call";

    // desktop -> device
    pub const CLIENT_HEARTBEAT: &str = "client_heartbeat";
    pub const HAVE_CONTACT_HASHES: &str = "have_contact_hashes";
    pub const HAVE_CONTACT_PHOTO_HASHES: &str = "have_contact_photo_hashes";
    pub const HAVE_MESSAGE_IDS: &str = "have_message_ids";
    pub const HAVE_CALL_IDS: &str = "have_call_ids";
    pub const DO_SYNC: &str = "do_sync";
    pub const SEND_SMS: &str = "send_sms";

    // relay link
    pub const INCOMING_PHONE_DATA: &str = "incoming_phone_data";
    pub const REMOVE_PHONE_DATA: &str = "remove_phone_data";
    pub const CONNECTION_TEST: &str = "connection_test";
    pub const SEND_CLIPBOARD: &str = "send_clipboard";
    pub const SEND_FILE: &str = "send_file";
    pub const LOG: &str = "log";
}

/// An untyped record as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub keyword: String,
    pub payload: Option<String>,
}

impl CommandRecord {
    /// Create a record with an optional payload
    pub fn new(keyword: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            keyword: keyword.into(),
            payload,
        }
    }

    /// Create a keyword-only record
    pub fn bare(keyword: impl Into<String>) -> Self {
        Self::new(keyword, None)
    }

    /// Create a record carrying a payload
    pub fn with_payload(keyword: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::new(keyword, Some(payload.into()))
    }

    /// Parse one delimiter-free segment
    ///
    /// Returns `None` for an empty segment. The keyword is everything before
    /// the first `": "`; the rest, if any, is the payload.
    ///
    /// # Examples
    ///
    /// ```
    /// use synchrony_protocol::CommandRecord;
    ///
    /// let record = CommandRecord::parse("delete_call: 7").unwrap();
    /// assert_eq!(record.keyword, "delete_call");
    /// assert_eq!(record.payload.as_deref(), Some("7"));
    ///
    /// assert!(CommandRecord::parse("").is_none());
    /// ```
    pub fn parse(segment: &str) -> Option<Self> {
        if segment.is_empty() {
            return None;
        }

        match segment.split_once(PAYLOAD_SEPARATOR) {
            Some((keyword, payload)) => Some(Self::with_payload(keyword, payload)),
            None => Some(Self::bare(segment)),
        }
    }

    /// Serialize without the trailing delimiter
    pub fn to_wire(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{}{}{}", self.keyword, PAYLOAD_SEPARATOR, payload),
            None => self.keyword.clone(),
        }
    }

    /// Serialize including the trailing delimiter
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.to_wire().into_bytes();
        bytes.extend_from_slice(COMMAND_DELIMITER);
        bytes
    }

    /// Payload or an `InvalidPacket` error naming the keyword
    pub fn require_payload(&self) -> Result<&str> {
        self.payload.as_deref().ok_or_else(|| {
            ProtocolError::InvalidPacket(format!("'{}' requires a payload", self.keyword))
        })
    }

    /// Deserialize the payload as JSON
    pub fn json_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.require_payload()?)?)
    }
}

impl fmt::Display for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// One part of a chunked photo transfer, `"{transfer_id} | {data}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoPart {
    pub transfer_id: String,
    pub data: String,
}

/// Entity kinds the phone reconciles against the desktop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestKind {
    ContactInfo,
    ContactPhoto,
    Message,
    Call,
}

impl DigestKind {
    /// Keyword of the reply record
    pub fn reply_keyword(self) -> &'static str {
        match self {
            DigestKind::ContactInfo => keywords::HAVE_CONTACT_HASHES,
            DigestKind::ContactPhoto => keywords::HAVE_CONTACT_PHOTO_HASHES,
            DigestKind::Message => keywords::HAVE_MESSAGE_IDS,
            DigestKind::Call => keywords::HAVE_CALL_IDS,
        }
    }
}

/// Typed device command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ServerHeartbeat,
    Check(DigestKind),
    IncomingClipboard(String),
    IncomingContact(Contact),
    IncomingContactPhotoPart(PhotoPart),
    IncomingMessage(Message),
    IncomingCall(Call),
    IncomingNotification(Notification),
    DeleteContact(i64),
    DeleteMessage(i64),
    DeleteCall(i64),
}

impl Command {
    /// Keyword this command travels under
    pub fn keyword(&self) -> &'static str {
        use keywords::*;
        match self {
            Command::ServerHeartbeat => SERVER_HEARTBEAT,
            Command::Check(DigestKind::ContactInfo) => CHECK_CONTACT_INFO_HASHES,
            Command::Check(DigestKind::ContactPhoto) => CHECK_CONTACT_PHOTO_HASHES,
            Command::Check(DigestKind::Message) => CHECK_MESSAGE_IDS,
            Command::Check(DigestKind::Call) => CHECK_CALL_IDS,
            Command::IncomingClipboard(_) => INCOMING_CLIPBOARD,
            Command::IncomingContact(_) => INCOMING_CONTACT,
            Command::IncomingContactPhotoPart(_) => INCOMING_CONTACT_PHOTO_PART,
            Command::IncomingMessage(_) => INCOMING_MESSAGE,
            Command::IncomingCall(_) => INCOMING_CALL,
            Command::IncomingNotification(_) => INCOMING_NOTIFICATION,
            Command::DeleteContact(_) => DELETE_CONTACT,
            Command::DeleteMessage(_) => DELETE_MESSAGE,
            Command::DeleteCall(_) => DELETE_CALL,
        }
    }
}

impl TryFrom<&CommandRecord> for Command {
    type Error = ProtocolError;

    fn try_from(record: &CommandRecord) -> Result<Self> {
        use keywords::*;

        let command = match record.keyword.as_str() {
            SERVER_HEARTBEAT => Command::ServerHeartbeat,
            CHECK_CONTACT_INFO_HASHES => Command::Check(DigestKind::ContactInfo),
            CHECK_CONTACT_PHOTO_HASHES => Command::Check(DigestKind::ContactPhoto),
            CHECK_MESSAGE_IDS => Command::Check(DigestKind::Message),
            CHECK_CALL_IDS => Command::Check(DigestKind::Call),
            INCOMING_CLIPBOARD => {
                Command::IncomingClipboard(record.payload.clone().unwrap_or_default())
            }
            INCOMING_CONTACT => Command::IncomingContact(record.json_payload()?),
            INCOMING_CONTACT_PHOTO_PART => {
                let payload = record.require_payload()?;
                let (transfer_id, data) =
                    payload.split_once(PART_SEPARATOR).ok_or_else(|| {
                        ProtocolError::InvalidPacket(format!(
                            "photo part without '{}' separator",
                            PART_SEPARATOR
                        ))
                    })?;
                Command::IncomingContactPhotoPart(PhotoPart {
                    transfer_id: transfer_id.to_string(),
                    data: data.to_string(),
                })
            }
            INCOMING_MESSAGE => Command::IncomingMessage(record.json_payload()?),
            INCOMING_CALL => Command::IncomingCall(record.json_payload()?),
            INCOMING_NOTIFICATION => Command::IncomingNotification(record.json_payload()?),
            DELETE_CONTACT => Command::DeleteContact(parse_id(record)?),
            DELETE_MESSAGE => Command::DeleteMessage(parse_id(record)?),
            DELETE_CALL => Command::DeleteCall(parse_id(record)?),
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        Ok(command)
    }
}

fn parse_id(record: &CommandRecord) -> Result<i64> {
    let payload = record.require_payload()?;
    payload.trim().parse().map_err(|_| {
        ProtocolError::InvalidPacket(format!(
            "'{}' expects an integer id, got '{}'",
            record.keyword, payload
        ))
    })
}
