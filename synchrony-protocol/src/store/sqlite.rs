//! SQLite Record Store
//!
//! One database file per device, laid out as
//! `{data_dir}/Phones/{name} ({address})/data/records.db`.
//!
//! ## Schema
//!
//! - `people(contact_id PK, name, hash)`
//! - `contact_emails(contact_id, type, address)`
//! - `contact_phones(contact_id, type, number)`
//! - `contact_photos(contact_id PK, photo_hash, data BLOB)`
//! - `sms(id PK, thread_id, number, date_sent, type, read, body)`
//! - `calls(id PK, number, type, date, duration)`

use super::{RecordStore, StoreFactory};
use crate::models::{Call, Contact, ContactPhoto, Digest, Message};
use crate::transport::DeviceDescriptor;
use crate::{ProtocolError, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS people (
        contact_id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        hash INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS contact_emails (
        contact_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        address TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_contact_emails_contact
        ON contact_emails(contact_id);

    CREATE TABLE IF NOT EXISTS contact_phones (
        contact_id INTEGER NOT NULL,
        type TEXT NOT NULL,
        number TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_contact_phones_contact
        ON contact_phones(contact_id);

    CREATE TABLE IF NOT EXISTS contact_photos (
        contact_id INTEGER PRIMARY KEY,
        photo_hash INTEGER NOT NULL,
        data BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sms (
        id INTEGER PRIMARY KEY,
        thread_id INTEGER NOT NULL,
        number TEXT,
        date_sent TEXT,
        type TEXT,
        read INTEGER NOT NULL DEFAULT 0,
        body TEXT
    );

    CREATE TABLE IF NOT EXISTS calls (
        id INTEGER PRIMARY KEY,
        number TEXT,
        type TEXT,
        date TEXT,
        duration TEXT
    );
"#;

/// SQLite-backed [`RecordStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        info!("Opened record store at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Database kept in memory, for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ProtocolError::Database(format!("Lock error: {}", e)))
    }
}

/// Which contact correspondence table to touch
#[derive(Clone, Copy)]
enum Correspondence {
    Emails,
    Phones,
}

impl Correspondence {
    fn select(self) -> &'static str {
        match self {
            Correspondence::Emails => {
                "SELECT type, address FROM contact_emails WHERE contact_id = ?1"
            }
            Correspondence::Phones => {
                "SELECT type, number FROM contact_phones WHERE contact_id = ?1"
            }
        }
    }

    fn delete(self) -> &'static str {
        match self {
            Correspondence::Emails => "DELETE FROM contact_emails WHERE contact_id = ?1",
            Correspondence::Phones => "DELETE FROM contact_phones WHERE contact_id = ?1",
        }
    }

    fn insert(self) -> &'static str {
        match self {
            Correspondence::Emails => {
                "INSERT INTO contact_emails (contact_id, type, address) VALUES (?1, ?2, ?3)"
            }
            Correspondence::Phones => {
                "INSERT INTO contact_phones (contact_id, type, number) VALUES (?1, ?2, ?3)"
            }
        }
    }
}

fn load_correspondences(
    conn: &Connection,
    kind: Correspondence,
    contact_id: i64,
) -> rusqlite::Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare(kind.select())?;
    let rows = stmt.query_map(params![contact_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    rows.collect()
}

fn insert_correspondences(
    tx: &Transaction<'_>,
    kind: Correspondence,
    contact_id: i64,
    entries: &BTreeMap<String, String>,
) -> rusqlite::Result<()> {
    for (entry_type, value) in entries {
        tx.execute(kind.insert(), params![contact_id, entry_type, value])?;
    }
    Ok(())
}

/// Replace the stored entries only when they differ from `entries`
fn sync_correspondences(
    tx: &Transaction<'_>,
    kind: Correspondence,
    contact_id: i64,
    entries: &BTreeMap<String, String>,
) -> rusqlite::Result<()> {
    if &load_correspondences(tx, kind, contact_id)? == entries {
        return Ok(());
    }

    tx.execute(kind.delete(), params![contact_id])?;
    insert_correspondences(tx, kind, contact_id, entries)
}

fn query_digests(conn: &Connection, sql: &str) -> Result<Vec<Digest>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok(Digest::new(row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn query_ids(conn: &Connection, sql: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

impl RecordStore for SqliteStore {
    fn contact(&self, contact_id: i64) -> Result<Option<Contact>> {
        let conn = self.lock()?;

        let person = conn
            .query_row(
                "SELECT name, hash FROM people WHERE contact_id = ?1",
                params![contact_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let Some((name, hash)) = person else {
            return Ok(None);
        };

        Ok(Some(Contact {
            primary_key: contact_id,
            name,
            hash,
            emails: load_correspondences(&conn, Correspondence::Emails, contact_id)?,
            phones: load_correspondences(&conn, Correspondence::Phones, contact_id)?,
        }))
    }

    fn insert_contact(&self, contact: &Contact) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO people (contact_id, name, hash) VALUES (?1, ?2, ?3)",
            params![contact.primary_key, contact.name, contact.hash],
        )?;
        insert_correspondences(&tx, Correspondence::Emails, contact.primary_key, &contact.emails)?;
        insert_correspondences(&tx, Correspondence::Phones, contact.primary_key, &contact.phones)?;

        tx.commit()?;
        debug!("Inserted contact {}", contact.primary_key);
        Ok(())
    }

    fn update_contact(&self, contact: &Contact) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE people SET name = ?2, hash = ?3 WHERE contact_id = ?1",
            params![contact.primary_key, contact.name, contact.hash],
        )?;
        sync_correspondences(&tx, Correspondence::Emails, contact.primary_key, &contact.emails)?;
        sync_correspondences(&tx, Correspondence::Phones, contact.primary_key, &contact.phones)?;

        tx.commit()?;
        debug!("Updated contact {}", contact.primary_key);
        Ok(())
    }

    fn delete_contact(&self, contact_id: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM people WHERE contact_id = ?1", params![contact_id])?;
        tx.execute(Correspondence::Emails.delete(), params![contact_id])?;
        tx.execute(Correspondence::Phones.delete(), params![contact_id])?;
        tx.execute(
            "DELETE FROM contact_photos WHERE contact_id = ?1",
            params![contact_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn contact_photo(&self, contact_id: i64) -> Result<Option<ContactPhoto>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT photo_hash, data FROM contact_photos WHERE contact_id = ?1",
                params![contact_id],
                |row| {
                    Ok(ContactPhoto {
                        contact_id,
                        hash: row.get(0)?,
                        data: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    fn upsert_contact_photo(&self, photo: &ContactPhoto) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO contact_photos (contact_id, photo_hash, data)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(contact_id) DO UPDATE SET
                photo_hash = excluded.photo_hash,
                data = excluded.data
            "#,
            params![photo.contact_id, photo.hash, photo.data],
        )?;
        debug!(
            "Stored photo for contact {} ({} bytes)",
            photo.contact_id,
            photo.data.len()
        );
        Ok(())
    }

    fn insert_message(&self, message: &Message) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO sms (id, thread_id, number, date_sent, type, read, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                message.id,
                message.thread_id,
                message.number,
                message.date_sent,
                message.message_type,
                message.read,
                message.body,
            ],
        )?;
        Ok(())
    }

    fn delete_message(&self, message_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sms WHERE id = ?1", params![message_id])?;
        Ok(())
    }

    fn insert_call(&self, call: &Call) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO calls (id, number, type, date, duration)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![call.id, call.number, call.call_type, call.date, call.duration],
        )?;
        Ok(())
    }

    fn delete_call(&self, call_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM calls WHERE id = ?1", params![call_id])?;
        Ok(())
    }

    fn contact_digests(&self) -> Result<Vec<Digest>> {
        let conn = self.lock()?;
        query_digests(&conn, "SELECT contact_id, hash FROM people ORDER BY contact_id")
    }

    fn contact_photo_digests(&self) -> Result<Vec<Digest>> {
        let conn = self.lock()?;
        query_digests(
            &conn,
            "SELECT contact_id, photo_hash FROM contact_photos ORDER BY contact_id",
        )
    }

    fn message_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        query_ids(&conn, "SELECT id FROM sms ORDER BY id")
    }

    fn call_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock()?;
        query_ids(&conn, "SELECT id FROM calls ORDER BY id")
    }
}

/// Opens a [`SqliteStore`] per device below a data directory
#[derive(Debug, Clone)]
pub struct SqliteStoreFactory {
    data_dir: PathBuf,
}

impl SqliteStoreFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Directory holding everything synced from `device`
    ///
    /// Always a direct child of `{data_dir}/Phones`, whatever the device
    /// calls itself.
    pub fn device_dir(&self, device: &DeviceDescriptor) -> PathBuf {
        self.data_dir
            .join("Phones")
            .join(path_component(&format!("{} ({})", device.name, device.address)))
    }

    pub fn database_path(&self, device: &DeviceDescriptor) -> PathBuf {
        self.device_dir(device).join("data").join("records.db")
    }
}

fn path_component(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}

impl StoreFactory for SqliteStoreFactory {
    fn open(&self, device: &DeviceDescriptor) -> Result<Arc<dyn RecordStore>> {
        Ok(Arc::new(SqliteStore::open(self.database_path(device))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnectionEndpoint;
    use tempfile::TempDir;

    fn contact(id: i64, name: &str, hash: i64) -> Contact {
        Contact {
            primary_key: id,
            name: name.to_string(),
            hash,
            emails: BTreeMap::new(),
            phones: BTreeMap::new(),
        }
    }

    #[test]
    fn test_contact_insert_and_update() {
        let store = SqliteStore::open_in_memory().unwrap();

        let mut a = contact(1, "A", 5);
        a.phones.insert("Mobile".into(), "555".into());
        store.insert_contact(&a).unwrap();
        assert_eq!(store.contact(1).unwrap(), Some(a.clone()));

        a.name = "A Prime".into();
        a.hash = 6;
        a.phones.insert("Work".into(), "777".into());
        a.emails.insert("Home".into(), "a@example.com".into());
        store.update_contact(&a).unwrap();

        assert_eq!(store.contact(1).unwrap(), Some(a));
        assert_eq!(store.contact_digests().unwrap(), vec![Digest::new(1, 6)]);
    }

    #[test]
    fn test_delete_contact_cascades() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut c = contact(2, "B", 1);
        c.emails.insert("Work".into(), "b@example.com".into());
        store.insert_contact(&c).unwrap();
        store
            .upsert_contact_photo(&ContactPhoto {
                contact_id: 2,
                hash: 10,
                data: vec![0x89, 0x50],
            })
            .unwrap();

        store.delete_contact(2).unwrap();

        assert!(store.contact(2).unwrap().is_none());
        assert!(store.contact_photo(2).unwrap().is_none());
        let conn = store.lock().unwrap();
        let emails: i64 = conn
            .query_row("SELECT COUNT(*) FROM contact_emails", [], |row| row.get(0))
            .unwrap();
        assert_eq!(emails, 0);
    }

    #[test]
    fn test_photo_upsert_replaces() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (hash, data) in [(1, vec![1u8]), (2, vec![2u8, 2])] {
            store
                .upsert_contact_photo(&ContactPhoto {
                    contact_id: 4,
                    hash,
                    data,
                })
                .unwrap();
        }

        assert_eq!(store.contact_photo_digests().unwrap(), vec![Digest::new(4, 2)]);
        assert_eq!(store.contact_photo(4).unwrap().unwrap().data, vec![2, 2]);
    }

    #[test]
    fn test_messages_and_calls() {
        let store = SqliteStore::open_in_memory().unwrap();
        let message = Message {
            id: 11,
            thread_id: 2,
            number: Some("555".into()),
            date_sent: Some("1700000000000".into()),
            message_type: Some("1".into()),
            read: 1,
            body: Some("hi".into()),
        };
        store.insert_message(&message).unwrap();
        store.insert_message(&message).unwrap();
        store
            .insert_call(&Call {
                id: 5,
                number: Some("555".into()),
                call_type: Some("2".into()),
                date: None,
                duration: Some("30".into()),
            })
            .unwrap();

        assert_eq!(store.message_ids().unwrap(), vec![11]);
        assert_eq!(store.call_ids().unwrap(), vec![5]);

        store.delete_message(11).unwrap();
        store.delete_call(5).unwrap();
        assert!(store.message_ids().unwrap().is_empty());
        assert!(store.call_ids().unwrap().is_empty());
    }

    #[test]
    fn test_factory_lays_out_device_directory() {
        let temp = TempDir::new().unwrap();
        let factory = SqliteStoreFactory::new(temp.path());
        let device = DeviceDescriptor::new(
            "Pixel",
            "AA:BB:CC:DD:EE:FF",
            ConnectionEndpoint::Rfcomm {
                address: "AA:BB:CC:DD:EE:FF".into(),
                channel: 8,
            },
        );

        let store = factory.open(&device).unwrap();
        store.insert_contact(&contact(1, "A", 5)).unwrap();

        let expected = temp
            .path()
            .join("Phones")
            .join("Pixel (AA:BB:CC:DD:EE:FF)")
            .join("data")
            .join("records.db");
        assert!(expected.exists());

        let reopened = SqliteStore::open(&expected).unwrap();
        assert_eq!(reopened.contact_digests().unwrap(), vec![Digest::new(1, 5)]);
    }

    #[test]
    fn test_device_name_cannot_escape_phones_dir() {
        let temp = TempDir::new().unwrap();
        let factory = SqliteStoreFactory::new(temp.path());
        let device = DeviceDescriptor::rfcomm("../../evil/..", "AA:BB");

        let dir = factory.device_dir(&device);
        assert_eq!(dir.parent(), Some(temp.path().join("Phones").as_path()));
        assert_eq!(
            dir.file_name().and_then(|name| name.to_str()),
            Some(".._.._evil_.. (AA:BB)")
        );

        factory.open(&device).unwrap();
        assert!(dir.join("data").join("records.db").exists());
    }
}
