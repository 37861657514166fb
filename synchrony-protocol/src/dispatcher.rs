//! Command Dispatcher
//!
//! Routes each record read from a device to its handler. The keyword is
//! matched exactly through [`Command`], so every device keyword has exactly
//! one arm below.
//!
//! ## Failure handling
//!
//! - A record that does not parse returns a protocol error; the session logs
//!   it and keeps reading
//! - A failed reply send returns a transport error; the session reconnects
//! - Store and desktop-sink failures are logged here and the mutation is
//!   dropped; they never reach the session

use crate::channel::ChannelSender;
use crate::command::{keywords, Command, CommandRecord, PhotoPart};
use crate::reassembler::{ChunkReassembler, CompletedTransfer};
use crate::reconciliation::{Mutation, ReconciliationResponder};
use crate::sinks::Sinks;
use crate::store::RecordStore;
use crate::transport::DeviceDescriptor;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-connection state handlers may touch
///
/// Owned by one session worker and rebuilt on every reconnect, so photo
/// transfers in flight when a connection drops are discarded.
///
/// A completed photo is written off the runtime thread. Any later record
/// that reads or writes the store waits for pending photo writes first, so
/// the store always sees commands in arrival order.
pub struct SessionContext {
    device: DeviceDescriptor,
    sender: ChannelSender,
    responder: ReconciliationResponder,
    sinks: Sinks,
    reassembler: ChunkReassembler,
    last_activity_at: Option<Instant>,
    photo_writes: JoinSet<()>,
}

impl SessionContext {
    pub fn new(
        device: DeviceDescriptor,
        sender: ChannelSender,
        store: Arc<dyn RecordStore>,
        sinks: Sinks,
        chunk_ttl: Duration,
    ) -> Self {
        Self {
            device,
            sender,
            responder: ReconciliationResponder::new(store),
            sinks,
            reassembler: ChunkReassembler::new(chunk_ttl),
            last_activity_at: None,
            photo_writes: JoinSet::new(),
        }
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    pub fn last_activity_at(&self) -> Option<Instant> {
        self.last_activity_at
    }

    pub fn reassembler(&self) -> &ChunkReassembler {
        &self.reassembler
    }

    pub fn reassembler_mut(&mut self) -> &mut ChunkReassembler {
        &mut self.reassembler
    }

    /// Reap photo writes that have finished
    pub fn reap_photo_writes(&mut self) {
        while let Some(result) = self.photo_writes.try_join_next() {
            if let Err(e) = result {
                warn!(device = %self.device.address, "Photo write task failed: {}", e);
            }
        }
    }

    /// Wait for every pending photo write
    pub async fn flush_photo_writes(&mut self) {
        while let Some(result) = self.photo_writes.join_next().await {
            if let Err(e) = result {
                warn!(device = %self.device.address, "Photo write task failed: {}", e);
            }
        }
    }

    pub fn pending_photo_writes(&self) -> usize {
        self.photo_writes.len()
    }

    fn touch(&mut self) {
        self.last_activity_at = Some(Instant::now());
    }

    async fn apply(&mut self, mutation: Mutation) {
        self.flush_photo_writes().await;
        if let Err(e) = self.responder.apply(&mutation) {
            warn!(
                device = %self.device.address,
                "Dropping {:?}: {}",
                mutation, e
            );
        }
    }

    async fn store_photo(&mut self, transfer: CompletedTransfer) {
        self.flush_photo_writes().await;
        let store = self.responder.store().clone();
        let address = self.device.address.clone();

        self.photo_writes.spawn_blocking(move || {
            let transfer_id = transfer.transfer_id.clone();
            let result = transfer
                .into_photo()
                .and_then(|photo| store.upsert_contact_photo(&photo));

            match result {
                Ok(()) => debug!(device = %address, "Stored photo {}", transfer_id),
                Err(e) => warn!(device = %address, "Dropping photo {}: {}", transfer_id, e),
            }
        });
    }
}

/// Handle one record from the device
pub async fn dispatch(record: &CommandRecord, ctx: &mut SessionContext) -> Result<()> {
    let command = Command::try_from(record)?;
    ctx.touch();

    match command {
        Command::ServerHeartbeat => {
            ctx.sender.send(keywords::CLIENT_HEARTBEAT, None).await?;
        }
        Command::Check(kind) => {
            ctx.flush_photo_writes().await;
            match ctx.responder.respond(kind) {
                Ok(reply) => ctx.sender.send_record(reply).await?,
                Err(e) => warn!(
                    device = %ctx.device.address,
                    "Cannot answer {}: {}",
                    record.keyword, e
                ),
            }
        }
        Command::IncomingClipboard(text) => {
            if let Err(e) = ctx.sinks.clipboard.set_text(&text) {
                warn!(device = %ctx.device.address, "Clipboard update failed: {}", e);
            } else {
                info!("Clipboard received from {}", ctx.device);
            }
        }
        Command::IncomingContact(contact) => ctx.apply(Mutation::UpsertContact(contact)).await,
        Command::IncomingContactPhotoPart(part) => handle_photo_part(&part, ctx).await?,
        Command::IncomingMessage(message) => ctx.apply(Mutation::InsertMessage(message)).await,
        Command::IncomingCall(call) => ctx.apply(Mutation::InsertCall(call)).await,
        Command::IncomingNotification(notification) => {
            if let Err(e) = ctx.sinks.notifier.notify(&ctx.device.name, &notification).await {
                warn!(device = %ctx.device.address, "Notification failed: {}", e);
            }
        }
        Command::DeleteContact(id) => ctx.apply(Mutation::DeleteContact(id)).await,
        Command::DeleteMessage(id) => ctx.apply(Mutation::DeleteMessage(id)).await,
        Command::DeleteCall(id) => ctx.apply(Mutation::DeleteCall(id)).await,
    }

    Ok(())
}

async fn handle_photo_part(part: &PhotoPart, ctx: &mut SessionContext) -> Result<()> {
    if let Some(transfer) = ctx.reassembler.feed(part)? {
        ctx.store_photo(transfer).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelReader, FramedChannel};
    use crate::models::{Call, Contact, ContactPhoto, Digest, Message};
    use crate::sinks::RecordingSink;
    use crate::store::MemoryStore;
    use crate::ProtocolError;

    struct Harness {
        ctx: SessionContext,
        phone: ChannelReader,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_over(store.clone(), store)
    }

    /// `records` is what the context writes through; `store` is inspected
    fn harness_over(store: Arc<MemoryStore>, records: Arc<dyn RecordStore>) -> Harness {
        let (desktop, phone) = tokio::io::duplex(64 * 1024);
        let desktop = FramedChannel::new(desktop);
        let (phone, _phone_tx) = FramedChannel::new(phone).into_parts();
        let sink = RecordingSink::new();

        let ctx = SessionContext::new(
            DeviceDescriptor::rfcomm("Pixel", "AA:BB:CC:DD:EE:FF"),
            desktop.sender(),
            records,
            sink.sinks(),
            Duration::from_secs(300),
        );

        Harness {
            ctx,
            phone,
            store,
            sink,
        }
    }

    async fn run(h: &mut Harness, wire: &str) -> Result<()> {
        dispatch(&CommandRecord::parse(wire).unwrap(), &mut h.ctx).await
    }

    async fn reply(h: &mut Harness) -> Vec<CommandRecord> {
        h.phone.receive(Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered() {
        let mut h = harness();
        assert!(h.ctx.last_activity_at().is_none());

        run(&mut h, "server_heartbeat").await.unwrap();

        assert_eq!(reply(&mut h).await, vec![CommandRecord::bare("client_heartbeat")]);
        assert!(h.ctx.last_activity_at().is_some());
    }

    #[tokio::test]
    async fn test_incoming_contact_then_check() {
        let mut h = harness();
        run(
            &mut h,
            r#"incoming_contact: {"mPrimaryKey":1,"mName":"A","mHash":5,"mEmails":{},"mPhones":{}}"#,
        )
        .await
        .unwrap();

        assert_eq!(h.store.contact(1).unwrap().unwrap().name, "A");

        run(&mut h, "check_contact_info_hashes").await.unwrap();
        assert_eq!(
            reply(&mut h).await,
            vec![CommandRecord::with_payload("have_contact_hashes", "[[1,5]]")]
        );
    }

    #[tokio::test]
    async fn test_messages_and_deletes() {
        let mut h = harness();
        run(&mut h, r#"incoming_message: {"mId":3,"mThreadId":1,"mBody":"hi"}"#)
            .await
            .unwrap();
        run(&mut h, r#"incoming_call: {"mId":8,"mNumber":"555"}"#)
            .await
            .unwrap();
        assert_eq!(h.store.message_ids().unwrap(), vec![3]);
        assert_eq!(h.store.call_ids().unwrap(), vec![8]);

        run(&mut h, "delete_message: 3").await.unwrap();
        run(&mut h, "delete_call: 8").await.unwrap();
        assert!(h.store.message_ids().unwrap().is_empty());
        assert!(h.store.call_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_photo_parts_reach_store() {
        let mut h = harness();
        for wire in [
            "incoming_contact_photo_part: 4 | START 77",
            "incoming_contact_photo_part: 4 | aGVsbG8g",
            "incoming_contact_photo_part: 4 | d29ybGQ=",
            "incoming_contact_photo_part: 4 | END",
        ] {
            run(&mut h, wire).await.unwrap();
        }
        h.ctx.flush_photo_writes().await;

        let photo = h.store.contact_photo(4).unwrap().unwrap();
        assert_eq!(photo.hash, 77);
        assert_eq!(photo.data, b"hello world".to_vec());
        assert_eq!(h.ctx.reassembler().in_flight(), 0);
    }

    /// Store whose photo writes take a while to land
    struct SlowPhotoStore(Arc<MemoryStore>);

    impl RecordStore for SlowPhotoStore {
        fn contact(&self, contact_id: i64) -> Result<Option<Contact>> {
            self.0.contact(contact_id)
        }
        fn insert_contact(&self, contact: &Contact) -> Result<()> {
            self.0.insert_contact(contact)
        }
        fn update_contact(&self, contact: &Contact) -> Result<()> {
            self.0.update_contact(contact)
        }
        fn delete_contact(&self, contact_id: i64) -> Result<()> {
            self.0.delete_contact(contact_id)
        }
        fn contact_photo(&self, contact_id: i64) -> Result<Option<ContactPhoto>> {
            self.0.contact_photo(contact_id)
        }
        fn upsert_contact_photo(&self, photo: &ContactPhoto) -> Result<()> {
            std::thread::sleep(Duration::from_millis(50));
            self.0.upsert_contact_photo(photo)
        }
        fn insert_message(&self, message: &Message) -> Result<()> {
            self.0.insert_message(message)
        }
        fn delete_message(&self, message_id: i64) -> Result<()> {
            self.0.delete_message(message_id)
        }
        fn insert_call(&self, call: &Call) -> Result<()> {
            self.0.insert_call(call)
        }
        fn delete_call(&self, call_id: i64) -> Result<()> {
            self.0.delete_call(call_id)
        }
        fn contact_digests(&self) -> Result<Vec<Digest>> {
            self.0.contact_digests()
        }
        fn contact_photo_digests(&self) -> Result<Vec<Digest>> {
            self.0.contact_photo_digests()
        }
        fn message_ids(&self) -> Result<Vec<i64>> {
            self.0.message_ids()
        }
        fn call_ids(&self) -> Result<Vec<i64>> {
            self.0.call_ids()
        }
    }

    fn slow_photo_harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        harness_over(store.clone(), Arc::new(SlowPhotoStore(store)))
    }

    const PHOTO_4: [&str; 3] = [
        "incoming_contact_photo_part: 4 | START 77",
        "incoming_contact_photo_part: 4 | aGk=",
        "incoming_contact_photo_part: 4 | END",
    ];

    #[tokio::test]
    async fn test_delete_after_photo_applies_in_order() {
        let mut h = slow_photo_harness();
        run(
            &mut h,
            r#"incoming_contact: {"mPrimaryKey":4,"mName":"D","mHash":1,"mEmails":{},"mPhones":{}}"#,
        )
        .await
        .unwrap();
        for wire in PHOTO_4 {
            run(&mut h, wire).await.unwrap();
        }
        run(&mut h, "delete_contact: 4").await.unwrap();

        assert!(h.store.contact(4).unwrap().is_none());
        assert!(h.store.contact_photo_digests().unwrap().is_empty());
        assert_eq!(h.ctx.pending_photo_writes(), 0);
    }

    #[tokio::test]
    async fn test_check_right_after_photo_sees_it() {
        let mut h = slow_photo_harness();
        for wire in PHOTO_4 {
            run(&mut h, wire).await.unwrap();
        }
        run(&mut h, "check_contact_photo_hashes").await.unwrap();

        assert_eq!(
            reply(&mut h).await,
            vec![CommandRecord::with_payload("have_contact_photo_hashes", "[[4,77]]")]
        );
    }

    #[tokio::test]
    async fn test_sinks_receive_side_effects() {
        let mut h = harness();
        run(&mut h, "incoming_clipboard: copied text").await.unwrap();
        run(
            &mut h,
            r#"incoming_notification: {"appName":"Signal","title":"Bob","text":"hey"}"#,
        )
        .await
        .unwrap();

        assert_eq!(h.sink.clipboard_texts(), vec!["copied text".to_string()]);
        assert_eq!(
            h.sink.notification_texts(),
            vec![("Signal: Bob".to_string(), "hey".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_keyword_is_protocol_error() {
        let mut h = harness();
        let err = run(&mut h, "launch_rockets").await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(_)));
        assert!(!err.is_connection_fatal());
        assert!(h.ctx.last_activity_at().is_none());
    }

    #[tokio::test]
    async fn test_reply_to_closed_channel_is_fatal() {
        let mut h = harness();
        drop(h.phone);
        let err = dispatch(&CommandRecord::bare("server_heartbeat"), &mut h.ctx)
            .await
            .unwrap_err();
        assert!(err.is_connection_fatal());
    }
}
