//! Record Store
//!
//! Persistence boundary for synced contacts, photos, messages and calls.
//! The engine only needs a key-indexed insert/update/delete store plus
//! enumeration of ids and digests; [`MemoryStore`] and [`SqliteStore`] are
//! the two implementations shipped here.
//!
//! Stores are synchronous. Callers on the async runtime that may block for
//! long (photo writes) move the call onto `spawn_blocking`.

mod memory;
mod sqlite;

pub use memory::{MemoryStore, MemoryStoreFactory};
pub use sqlite::{SqliteStore, SqliteStoreFactory};

use crate::models::{Call, Contact, ContactPhoto, Digest, Message};
use crate::transport::DeviceDescriptor;
use crate::Result;
use std::sync::Arc;

/// Storage for one device's synced records
///
/// Messages and calls are immutable: inserting an id that already exists
/// leaves the stored record untouched.
pub trait RecordStore: Send + Sync {
    fn contact(&self, contact_id: i64) -> Result<Option<Contact>>;

    fn insert_contact(&self, contact: &Contact) -> Result<()>;

    /// Update name and hash; replace emails and phones if they differ
    fn update_contact(&self, contact: &Contact) -> Result<()>;

    /// Delete a contact together with its emails, phones and photo
    fn delete_contact(&self, contact_id: i64) -> Result<()>;

    fn contact_photo(&self, contact_id: i64) -> Result<Option<ContactPhoto>>;

    fn upsert_contact_photo(&self, photo: &ContactPhoto) -> Result<()>;

    fn insert_message(&self, message: &Message) -> Result<()>;

    fn delete_message(&self, message_id: i64) -> Result<()>;

    fn insert_call(&self, call: &Call) -> Result<()>;

    fn delete_call(&self, call_id: i64) -> Result<()>;

    /// `(contact_id, hash)` for every stored contact
    fn contact_digests(&self) -> Result<Vec<Digest>>;

    /// `(contact_id, photo_hash)` for every stored photo
    fn contact_photo_digests(&self) -> Result<Vec<Digest>>;

    fn message_ids(&self) -> Result<Vec<i64>>;

    fn call_ids(&self) -> Result<Vec<i64>>;
}

/// Opens the record store belonging to a device
pub trait StoreFactory: Send + Sync {
    fn open(&self, device: &DeviceDescriptor) -> Result<Arc<dyn RecordStore>>;
}
