//! Reconciliation Responder
//!
//! The phone owns the diff. On `check_*` the desktop answers with what it
//! currently holds and the phone decides what to push or delete; this side
//! never compares anything itself.
//!
//! Contacts are mutable and reconciled by content hash, so an incoming
//! contact is looked up first and then inserted or updated. Messages and
//! calls are immutable and reconciled by id; incoming ones are always
//! inserted.

use crate::command::{CommandRecord, DigestKind};
use crate::models::{Call, Contact, Message};
use crate::store::RecordStore;
use crate::Result;
use std::sync::Arc;
use tracing::debug;

/// A store change requested by the phone
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    UpsertContact(Contact),
    InsertMessage(Message),
    InsertCall(Call),
    DeleteContact(i64),
    DeleteMessage(i64),
    DeleteCall(i64),
}

/// What an applied contact upsert turned into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Clone)]
pub struct ReconciliationResponder {
    store: Arc<dyn RecordStore>,
}

impl ReconciliationResponder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Build the `have_*` reply for a `check_*` request
    ///
    /// Read-only: enumerates the store and serialises the result.
    pub fn respond(&self, kind: DigestKind) -> Result<CommandRecord> {
        let payload = match kind {
            DigestKind::ContactInfo => serde_json::to_string(&self.store.contact_digests()?)?,
            DigestKind::ContactPhoto => {
                serde_json::to_string(&self.store.contact_photo_digests()?)?
            }
            DigestKind::Message => serde_json::to_string(&self.store.message_ids()?)?,
            DigestKind::Call => serde_json::to_string(&self.store.call_ids()?)?,
        };

        debug!("Answering {:?} check with {} bytes", kind, payload.len());
        Ok(CommandRecord::with_payload(kind.reply_keyword(), payload))
    }

    pub fn apply(&self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::UpsertContact(contact) => {
                let outcome = self.upsert_contact(contact)?;
                debug!("Contact {} {:?}", contact.primary_key, outcome);
            }
            Mutation::InsertMessage(message) => self.store.insert_message(message)?,
            Mutation::InsertCall(call) => self.store.insert_call(call)?,
            Mutation::DeleteContact(id) => self.store.delete_contact(*id)?,
            Mutation::DeleteMessage(id) => self.store.delete_message(*id)?,
            Mutation::DeleteCall(id) => self.store.delete_call(*id)?,
        }
        Ok(())
    }

    fn upsert_contact(&self, contact: &Contact) -> Result<UpsertOutcome> {
        if self.store.contact(contact.primary_key)?.is_some() {
            self.store.update_contact(contact)?;
            Ok(UpsertOutcome::Updated)
        } else {
            self.store.insert_contact(contact)?;
            Ok(UpsertOutcome::Inserted)
        }
    }
}
