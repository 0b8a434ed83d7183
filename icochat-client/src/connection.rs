use std::{
    io,
    ops::{Deref, DerefMut},
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use icochat_core::{
    Inbound, MAX_RECEIVE_BYTES, PushbackReader, Tag, decode, is_name_rejection, split_announcement,
};
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, MutexGuard, mpsc, oneshot, watch},
    time::{Instant, sleep_until, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::DownloadFraming,
    error::{ConnectError, SendError, TransferError},
    transfer::{self, FileTransferRequest, ReceivedFile},
};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the server gets to reject a name before silence counts as acceptance.
pub const DEFAULT_NAME_GRACE: Duration = Duration::from_millis(750);

pub(crate) type SocketReader = PushbackReader<OwnedReadHalf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    NameNegotiation,
    Connected,
    Closing,
}

/// Read-only view of a live or last-known session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub state: ConnectionState,
    pub user_name: String,
    pub server_addr: String,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub name_grace: Duration,
    /// Where files announced by the server are written.
    pub incoming_dir: PathBuf,
    pub download_framing: DownloadFraming,
}

impl ConnectOptions {
    pub fn new(incoming_dir: impl Into<PathBuf>) -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            name_grace: DEFAULT_NAME_GRACE,
            incoming_dir: incoming_dir.into(),
            download_framing: DownloadFraming::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Negotiated { user_name: String },
    NameConflict { rejected: String },
    MessageReceived(String),
    FileReceived(ReceivedFile),
    IncomingFileFailed { file_name: String, error: TransferError },
    Progress(FileTransferRequest),
    Disconnected,
}

#[derive(Debug)]
enum LoopCommand {
    Lend(oneshot::Sender<ReaderLease>),
    NameResubmitted,
}

/// Exclusive loan of the socket's read half.
///
/// The receive loop parks until the lease is dropped, so the holder sees
/// every inbound byte in order. Dropping the lease hands the reader back.
#[derive(Debug)]
pub(crate) struct ReaderLease {
    reader: Option<SocketReader>,
    home: Option<oneshot::Sender<SocketReader>>,
}

impl Deref for ReaderLease {
    type Target = SocketReader;

    fn deref(&self) -> &SocketReader {
        self.reader.as_ref().expect("lease holds the reader until dropped")
    }
}

impl DerefMut for ReaderLease {
    fn deref_mut(&mut self) -> &mut SocketReader {
        self.reader.as_mut().expect("lease holds the reader until dropped")
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        if let (Some(reader), Some(home)) = (self.reader.take(), self.home.take()) {
            let _ = home.send(reader);
        }
    }
}

#[derive(Debug)]
struct Shared {
    server_addr: String,
    user_name: Arc<StdMutex<String>>,
    state: Arc<watch::Sender<ConnectionState>>,
    writer: Mutex<OwnedWriteHalf>,
    commands: mpsc::UnboundedSender<LoopCommand>,
    shutdown: watch::Sender<bool>,
}

/// Handle to one TCP session. Clones share the same socket.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

/// Opens the socket, sends the user name and starts the receive loop.
///
/// `state` is updated through every transition, including the failure path
/// back to `Disconnected`.
pub async fn connect(
    options: &ConnectOptions,
    server_addr: &str,
    user_name: &str,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<Connection, ConnectError> {
    state.send_replace(ConnectionState::Connecting);
    info!(server = %server_addr, user = %user_name, "connecting");

    let stream = match timeout(options.connect_timeout, TcpStream::connect(server_addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            state.send_replace(ConnectionState::Disconnected);
            warn!(server = %server_addr, error = %source, "connect failed");
            return Err(ConnectError::Unreachable {
                address: server_addr.to_owned(),
                source,
            });
        }
        Err(_) => {
            state.send_replace(ConnectionState::Disconnected);
            warn!(server = %server_addr, "connect timed out");
            return Err(ConnectError::Timeout {
                address: server_addr.to_owned(),
                timeout: options.connect_timeout,
            });
        }
    };
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();

    if let Err(source) = write_half.write_all(user_name.as_bytes()).await {
        state.send_replace(ConnectionState::Disconnected);
        return Err(ConnectError::Io {
            address: server_addr.to_owned(),
            source,
        });
    }
    state.send_replace(ConnectionState::NameNegotiation);

    let user_name = Arc::new(StdMutex::new(user_name.to_owned()));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let receive_loop = ReceiveLoop {
        commands: commands_rx,
        shutdown: shutdown_rx,
        events,
        state: Arc::clone(&state),
        user_name: Arc::clone(&user_name),
        options: options.clone(),
    };
    tokio::spawn(receive_loop.run(PushbackReader::new(read_half)));

    Ok(Connection {
        shared: Arc::new(Shared {
            server_addr: server_addr.to_owned(),
            user_name,
            state,
            writer: Mutex::new(write_half),
            commands: commands_tx,
            shutdown: shutdown_tx,
        }),
    })
}

impl Connection {
    pub fn server_addr(&self) -> &str {
        &self.shared.server_addr
    }

    pub fn user_name(&self) -> String {
        lock_name(&self.shared.user_name).clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn session(&self) -> Session {
        Session {
            state: self.state(),
            user_name: self.user_name(),
            server_addr: self.server_addr().to_owned(),
        }
    }

    /// Writes one chat line.
    pub async fn send(&self, text: &str) -> Result<(), SendError> {
        if self.state() != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        let mut shutdown = self.shutdown_signal();
        let mut writer = self.shared.writer.lock().await;
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => Err(SendError::NotConnected),
            written = writer.write_all(text.as_bytes()) => written.map_err(SendError::Io),
        }
    }

    /// Sends a replacement name after the server rejected the previous one.
    pub async fn resubmit_name(&self, name: &str) -> Result<(), SendError> {
        if self.state() != ConnectionState::NameNegotiation {
            return Err(SendError::NotNegotiating);
        }
        {
            let mut writer = self.shared.writer.lock().await;
            writer.write_all(name.as_bytes()).await?;
        }
        *lock_name(&self.shared.user_name) = name.to_owned();
        self.shared
            .commands
            .send(LoopCommand::NameResubmitted)
            .map_err(|_| SendError::NotConnected)?;
        info!(user = %name, "name resubmitted");
        Ok(())
    }

    /// Closes the socket. The receive loop emits nothing after this returns.
    pub async fn close(&self) {
        if self.state() == ConnectionState::Disconnected {
            self.shared.shutdown.send_replace(true);
            return;
        }
        self.shared.state.send_replace(ConnectionState::Closing);
        self.shared.shutdown.send_replace(true);
        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(err) = writer.shutdown().await {
                debug!(error = %err, "socket shutdown failed");
            }
        }
        self.shared.state.send_replace(ConnectionState::Disconnected);
        info!(server = %self.shared.server_addr, "connection closed");
    }

    pub(crate) fn signal_shutdown(&self) {
        self.shared.shutdown.send_replace(true);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    pub(crate) fn user_name_cell(&self) -> Arc<StdMutex<String>> {
        Arc::clone(&self.shared.user_name)
    }

    pub(crate) async fn lock_writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.shared.writer.lock().await
    }

    /// Borrows the read half from the receive loop.
    pub(crate) async fn lease_reader(&self) -> Result<ReaderLease, TransferError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .commands
            .send(LoopCommand::Lend(reply_tx))
            .map_err(|_| TransferError::NotConnected)?;
        let mut shutdown = self.shutdown_signal();
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => Err(TransferError::Canceled),
            lease = reply_rx => lease.map_err(|_| TransferError::NotConnected),
        }
    }
}

pub(crate) fn lock_name(cell: &StdMutex<String>) -> std::sync::MutexGuard<'_, String> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves once shutdown is requested or the owning connection is gone.
pub(crate) async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum Wake {
    Shutdown,
    Command(Option<LoopCommand>),
    GraceElapsed,
    Read(io::Result<usize>),
}

struct ReceiveLoop {
    commands: mpsc::UnboundedReceiver<LoopCommand>,
    shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Arc<watch::Sender<ConnectionState>>,
    user_name: Arc<StdMutex<String>>,
    options: ConnectOptions,
}

impl ReceiveLoop {
    async fn run(mut self, mut reader: SocketReader) {
        let mut buf = vec![0_u8; MAX_RECEIVE_BYTES];
        let mut grace_deadline = Some(Instant::now() + self.options.name_grace);
        let mut rejection_pending = false;

        loop {
            let negotiating = *self.state.borrow() == ConnectionState::NameNegotiation;
            let deadline = grace_deadline.filter(|_| negotiating && !rejection_pending);

            let wake = tokio::select! {
                biased;
                _ = cancelled(&mut self.shutdown) => Wake::Shutdown,
                command = self.commands.recv() => Wake::Command(command),
                _ = sleep_until_some(deadline) => Wake::GraceElapsed,
                read = reader.read_some(&mut buf) => Wake::Read(read),
            };

            match wake {
                Wake::Shutdown | Wake::Command(None) => {
                    debug!("receive loop stopping");
                    return;
                }
                Wake::Command(Some(LoopCommand::NameResubmitted)) => {
                    rejection_pending = false;
                    grace_deadline = Some(Instant::now() + self.options.name_grace);
                }
                Wake::Command(Some(LoopCommand::Lend(reply))) => {
                    reader = match self.lend(reader, reply).await {
                        Some(reader) => reader,
                        None => return,
                    };
                }
                Wake::GraceElapsed => {
                    grace_deadline = None;
                    self.mark_connected();
                }
                Wake::Read(Ok(0)) => {
                    self.hang_up("server closed the connection");
                    return;
                }
                Wake::Read(Ok(n)) => {
                    let unit = buf[..n].to_vec();
                    if is_name_rejection(&unit) {
                        rejection_pending = true;
                        self.reopen_negotiation();
                        let rejected = lock_name(&self.user_name).clone();
                        warn!(user = %rejected, "name rejected by server");
                        self.emit(ConnectionEvent::NameConflict { rejected });
                        continue;
                    }
                    if negotiating && !rejection_pending {
                        grace_deadline = None;
                        self.mark_connected();
                    }
                    if !self.dispatch(&mut reader, unit).await {
                        return;
                    }
                }
                Wake::Read(Err(err)) => {
                    if *self.shutdown.borrow() {
                        return;
                    }
                    warn!(error = %err, "receive failed");
                    self.hang_up("receive failed");
                    return;
                }
            }
        }
    }

    /// Returns false when the loop must stop.
    async fn dispatch(&mut self, reader: &mut SocketReader, unit: Vec<u8>) -> bool {
        match decode(&unit) {
            Inbound::Tagged {
                tag: Tag::File,
                payload,
            } => self.receive_file(reader, &payload).await,
            Inbound::Tagged { tag, .. } => {
                warn!(%tag, "ignoring unexpected tagged message");
                true
            }
            Inbound::PlainText(_) | Inbound::LengthPrefixedHeader(_) => {
                let text = String::from_utf8_lossy(&unit).into_owned();
                self.emit(ConnectionEvent::MessageReceived(text));
                true
            }
        }
    }

    async fn receive_file(&mut self, reader: &mut SocketReader, payload: &[u8]) -> bool {
        let file_name = match self.options.download_framing {
            DownloadFraming::UntilEof => String::from_utf8_lossy(payload).trim().to_owned(),
            DownloadFraming::Auto | DownloadFraming::LengthPrefixed => {
                let (name, leftover) = split_announcement(payload);
                reader.unread(leftover);
                name
            }
        };
        info!(file = %file_name, "incoming file announced");

        let events = self.events.clone();
        let result = transfer::receive_announced(
            reader,
            &file_name,
            &self.options.incoming_dir,
            self.options.download_framing,
            &mut self.shutdown,
            |progress: &FileTransferRequest| {
                let _ = events.send(ConnectionEvent::Progress(progress.clone()));
            },
        )
        .await;

        match result {
            Ok(file) => {
                info!(file = %file.file_name, bytes = file.size, "incoming file saved");
                self.emit(ConnectionEvent::FileReceived(file));
                true
            }
            Err(TransferError::Canceled) => false,
            Err(error) => {
                warn!(file = %file_name, error = %error, "incoming file failed");
                self.emit(ConnectionEvent::IncomingFileFailed { file_name, error });
                true
            }
        }
    }

    /// Hands the reader out and waits for it to come back.
    async fn lend(
        &mut self,
        reader: SocketReader,
        reply: oneshot::Sender<ReaderLease>,
    ) -> Option<SocketReader> {
        let (home_tx, home_rx) = oneshot::channel();
        let lease = ReaderLease {
            reader: Some(reader),
            home: Some(home_tx),
        };
        // A requester that gave up drops the lease, which sends the reader home.
        let _ = reply.send(lease);

        tokio::select! {
            biased;
            _ = cancelled(&mut self.shutdown) => None,
            returned = home_rx => match returned {
                Ok(reader) => Some(reader),
                Err(_) => {
                    self.hang_up("reader lost during transfer");
                    None
                }
            },
        }
    }

    fn mark_connected(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::NameNegotiation {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            let user_name = lock_name(&self.user_name).clone();
            info!(user = %user_name, "name accepted");
            self.emit(ConnectionEvent::Negotiated { user_name });
        }
    }

    /// A rejection that lands after the grace period undoes the acceptance.
    fn reopen_negotiation(&self) {
        let reopened = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::NameNegotiation;
                true
            } else {
                false
            }
        });
        if reopened {
            warn!("late name rejection, negotiating again");
        }
    }

    fn hang_up(&self, reason: &str) {
        if *self.shutdown.borrow() {
            return;
        }
        info!(%reason, "disconnected");
        self.state.send_replace(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected);
    }

    fn emit(&self, event: ConnectionEvent) {
        if *self.shutdown.borrow() {
            return;
        }
        let _ = self.events.send(event);
    }
}
