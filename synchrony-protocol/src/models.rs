//! Synced Record Types
//!
//! JSON shapes exchanged with the mobile app. Field names follow the app's
//! serializer (`mPrimaryKey`, `mName`, ...), so every field carries an explicit
//! rename.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contact as pushed by `incoming_contact`
///
/// Contacts are mutable on the phone: `hash` covers name, phones and emails
/// and changes whenever any of them does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    #[serde(rename = "mPrimaryKey")]
    pub primary_key: i64,

    #[serde(rename = "mName", default)]
    pub name: String,

    #[serde(rename = "mHash")]
    pub hash: i64,

    /// email type -> address
    #[serde(rename = "mEmails", default)]
    pub emails: BTreeMap<String, String>,

    /// phone type -> number
    #[serde(rename = "mPhones", default)]
    pub phones: BTreeMap<String, String>,
}

/// A reassembled contact photo ready for the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactPhoto {
    pub contact_id: i64,
    pub hash: i64,
    /// Decoded image bytes
    pub data: Vec<u8>,
}

/// An SMS as pushed by `incoming_message`
///
/// Messages are immutable once sent; they are inserted or deleted, never
/// updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "mId")]
    pub id: i64,

    #[serde(rename = "mThreadId", default)]
    pub thread_id: i64,

    #[serde(rename = "mNumber", default)]
    pub number: Option<String>,

    #[serde(rename = "mDateSent", default)]
    pub date_sent: Option<String>,

    #[serde(rename = "mType", default)]
    pub message_type: Option<String>,

    #[serde(rename = "mRead", default)]
    pub read: i64,

    #[serde(rename = "mBody", default)]
    pub body: Option<String>,
}

/// A call log entry as pushed by `incoming_call`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    #[serde(rename = "mId")]
    pub id: i64,

    #[serde(rename = "mNumber", default)]
    pub number: Option<String>,

    #[serde(rename = "mType", default)]
    pub call_type: Option<String>,

    #[serde(rename = "mDate", default)]
    pub date: Option<String>,

    #[serde(rename = "mDuration", default)]
    pub duration: Option<String>,
}

/// A phone notification mirrored to the desktop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "appName", default)]
    pub app_name: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(rename = "subText", default)]
    pub sub_text: Option<String>,

    #[serde(rename = "infoText", default)]
    pub info_text: Option<String>,
}

impl Notification {
    /// Summary line shown on the desktop
    ///
    /// `"{app}: {title}"` when both exist, otherwise whichever exists.
    pub fn summary(&self) -> String {
        match (&self.app_name, &self.title) {
            (Some(app), Some(title)) => format!("{}: {}", app, title),
            (Some(app), None) => app.clone(),
            (None, Some(title)) => title.clone(),
            (None, None) => "No Title".to_string(),
        }
    }

    /// Body text shown on the desktop
    pub fn body(&self) -> String {
        self.text
            .clone()
            .unwrap_or_else(|| "No Description".to_string())
    }
}

/// One `{id, digest}` entry of a reconciliation reply
///
/// Serialized as a two-element JSON array, which is what the phone expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(i64, i64)", into = "(i64, i64)")]
pub struct Digest {
    pub entity_id: i64,
    pub digest: i64,
}

impl Digest {
    pub fn new(entity_id: i64, digest: i64) -> Self {
        Self { entity_id, digest }
    }
}

impl From<(i64, i64)> for Digest {
    fn from((entity_id, digest): (i64, i64)) -> Self {
        Self { entity_id, digest }
    }
}

impl From<Digest> for (i64, i64) {
    fn from(d: Digest) -> Self {
        (d.entity_id, d.digest)
    }
}
