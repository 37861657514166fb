//! In-memory record store

use super::{RecordStore, StoreFactory};
use crate::models::{Call, Contact, ContactPhoto, Digest, Message};
use crate::transport::DeviceDescriptor;
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Records {
    contacts: BTreeMap<i64, Contact>,
    photos: BTreeMap<i64, ContactPhoto>,
    messages: BTreeMap<i64, Message>,
    calls: BTreeMap<i64, Call>,
}

/// Record store kept entirely in memory
///
/// Used by tests and by embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        // a panicking writer cannot leave a map half-updated
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn message(&self, message_id: i64) -> Option<Message> {
        self.lock().messages.get(&message_id).cloned()
    }

    pub fn call(&self, call_id: i64) -> Option<Call> {
        self.lock().calls.get(&call_id).cloned()
    }
}

impl RecordStore for MemoryStore {
    fn contact(&self, contact_id: i64) -> Result<Option<Contact>> {
        Ok(self.lock().contacts.get(&contact_id).cloned())
    }

    fn insert_contact(&self, contact: &Contact) -> Result<()> {
        self.lock()
            .contacts
            .insert(contact.primary_key, contact.clone());
        Ok(())
    }

    fn update_contact(&self, contact: &Contact) -> Result<()> {
        self.insert_contact(contact)
    }

    fn delete_contact(&self, contact_id: i64) -> Result<()> {
        let mut records = self.lock();
        records.contacts.remove(&contact_id);
        records.photos.remove(&contact_id);
        Ok(())
    }

    fn contact_photo(&self, contact_id: i64) -> Result<Option<ContactPhoto>> {
        Ok(self.lock().photos.get(&contact_id).cloned())
    }

    fn upsert_contact_photo(&self, photo: &ContactPhoto) -> Result<()> {
        self.lock().photos.insert(photo.contact_id, photo.clone());
        Ok(())
    }

    fn insert_message(&self, message: &Message) -> Result<()> {
        self.lock()
            .messages
            .entry(message.id)
            .or_insert_with(|| message.clone());
        Ok(())
    }

    fn delete_message(&self, message_id: i64) -> Result<()> {
        self.lock().messages.remove(&message_id);
        Ok(())
    }

    fn insert_call(&self, call: &Call) -> Result<()> {
        self.lock()
            .calls
            .entry(call.id)
            .or_insert_with(|| call.clone());
        Ok(())
    }

    fn delete_call(&self, call_id: i64) -> Result<()> {
        self.lock().calls.remove(&call_id);
        Ok(())
    }

    fn contact_digests(&self) -> Result<Vec<Digest>> {
        Ok(self
            .lock()
            .contacts
            .values()
            .map(|c| Digest::new(c.primary_key, c.hash))
            .collect())
    }

    fn contact_photo_digests(&self) -> Result<Vec<Digest>> {
        Ok(self
            .lock()
            .photos
            .values()
            .map(|p| Digest::new(p.contact_id, p.hash))
            .collect())
    }

    fn message_ids(&self) -> Result<Vec<i64>> {
        Ok(self.lock().messages.keys().copied().collect())
    }

    fn call_ids(&self) -> Result<Vec<i64>> {
        Ok(self.lock().calls.keys().copied().collect())
    }
}

/// Hands out one shared [`MemoryStore`] per device address
///
/// Reopening an address returns the same store, so records survive
/// reconnects and can be inspected from outside the session.
#[derive(Debug, Default)]
pub struct MemoryStoreFactory {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store for `address`, created on first use
    pub fn store(&self, address: &str) -> Arc<MemoryStore> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(address.to_string())
            .or_default()
            .clone()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, device: &DeviceDescriptor) -> Result<Arc<dyn RecordStore>> {
        Ok(self.store(&device.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: i64, body: &str) -> Message {
        Message {
            id,
            thread_id: 1,
            number: Some("555".into()),
            date_sent: None,
            message_type: Some("1".into()),
            read: 0,
            body: Some(body.into()),
        }
    }

    #[test]
    fn test_message_insert_never_updates() {
        let store = MemoryStore::new();
        store.insert_message(&message(1, "first")).unwrap();
        store.insert_message(&message(1, "second")).unwrap();

        assert_eq!(store.message_ids().unwrap(), vec![1]);
        assert_eq!(store.message(1).unwrap().body.as_deref(), Some("first"));
    }

    #[test]
    fn test_delete_contact_drops_photo() {
        let store = MemoryStore::new();
        store
            .insert_contact(&Contact {
                primary_key: 3,
                name: "C".into(),
                hash: 9,
                emails: Default::default(),
                phones: Default::default(),
            })
            .unwrap();
        store
            .upsert_contact_photo(&ContactPhoto {
                contact_id: 3,
                hash: 4,
                data: vec![1, 2],
            })
            .unwrap();

        store.delete_contact(3).unwrap();
        assert!(store.contact_digests().unwrap().is_empty());
        assert!(store.contact_photo_digests().unwrap().is_empty());
    }

    #[test]
    fn test_factory_reuses_store_per_address() {
        let factory = MemoryStoreFactory::new();
        factory.store("AA").insert_call(&Call {
            id: 7,
            number: None,
            call_type: None,
            date: None,
            duration: None,
        })
        .unwrap();

        assert_eq!(factory.store("AA").call_ids().unwrap(), vec![7]);
        assert!(factory.store("BB").call_ids().unwrap().is_empty());
    }
}
