//! Synchrony Protocol Implementation
//!
//! Session and command-channel engine that keeps a desktop in sync with
//! nearby phones. Each compatible phone gets one long-lived [`Session`] that
//! owns a delimiter-framed command channel, answers reconciliation checks
//! from a per-device [`RecordStore`], reassembles chunked contact photos and
//! forwards clipboard and notification traffic to desktop sinks.
//!
//! A [`Supervisor`] follows device discovery and owns the session table, and
//! a [`RelayLink`] bridges the sessions to one local companion process over
//! TCP.

pub mod channel;
pub mod command;
pub mod discovery;
pub mod dispatcher;
pub mod models;
pub mod reassembler;
pub mod reconciliation;
pub mod relay;
pub mod session;
pub mod sinks;
pub mod store;
pub mod supervisor;
pub mod transport;

mod error;

pub use channel::{
    BoxedStream, ChannelReader, ChannelSender, DelimiterCodec, FramedChannel,
    DEFAULT_MAX_FRAME_BYTES, DEFAULT_WRITE_TIMEOUT,
};
pub use command::{
    keywords, Command, CommandRecord, DigestKind, PhotoPart, COMMAND_DELIMITER,
    PART_SEPARATOR, PAYLOAD_SEPARATOR,
};
pub use discovery::{DeviceDiscovery, DiscoveredDevice, ServiceDescriptor, StaticDiscovery};
pub use dispatcher::{dispatch, SessionContext};
pub use error::{ErrorCategory, ProtocolError, Result};
pub use models::{Call, Contact, ContactPhoto, Digest, Message, Notification};
pub use reassembler::{ChunkReassembler, CompletedTransfer};
pub use reconciliation::{Mutation, ReconciliationResponder};
pub use relay::{PhoneData, RelayLink, RelayRequest, SessionTable, DEFAULT_RELAY_PORT};
pub use session::{
    Session, SessionConfig, SessionEvent, SessionHandle, SessionServices, SessionSnapshot,
    SessionState,
};
pub use sinks::{ClipboardSink, FileSender, Notifier, Sinks};
pub use store::{RecordStore, StoreFactory};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorHandle};
pub use transport::{
    ConnectionEndpoint, Connector, DefaultConnector, DeviceDescriptor, TcpConnector,
};

#[cfg(feature = "bluetooth")]
pub use discovery::BluezDiscovery;
#[cfg(feature = "bluetooth")]
pub use transport::RfcommConnector;
