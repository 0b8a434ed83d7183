//! Chat and file-transfer client for the IcoChat TCP server.
//!
//! [`SessionController`] is the entry point a front end drives; it owns one
//! [`Connection`] at a time, the [`TransferEngine`] bound to it and the
//! on-disk [`HistoryStore`].

pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod login;
pub mod session;
pub mod transfer;

pub use config::{DownloadFraming, ServerConfig, UploadFraming};
pub use connection::{ConnectOptions, Connection, ConnectionEvent, ConnectionState, Session};
pub use error::{ConnectError, SendError, SessionError, StoreError, TransferError};
pub use history::{ChatMessage, Direction, HistoryStore};
pub use login::{CredentialStore, LoginError, LoginOutcome, sign_in};
pub use session::{NotificationSink, SessionConfig, SessionController, SessionEvent};
pub use transfer::{
    FileTransferRequest, ListingDiff, ReceivedFile, RemoteFileListing, TransferDirection,
    TransferEngine,
};
