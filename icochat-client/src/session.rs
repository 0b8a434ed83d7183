use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::{DownloadFraming, ServerConfig, UploadFraming},
    connection::{
        self, ConnectOptions, Connection, ConnectionEvent, ConnectionState, DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_NAME_GRACE, Session, lock_name,
    },
    error::{SendError, SessionError, StoreError},
    history::{ChatMessage, HistoryStore},
    transfer::{FileTransferRequest, ReceivedFile, RemoteFileListing, TransferEngine},
};

/// Recorded as the sender of history notes about files the server pushed.
pub const SERVER_SENDER: &str = "server";

/// Desktop notifications and sounds, supplied by the front end.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, body: &str);

    fn play_sound(&self) {}
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub data_dir: PathBuf,
    pub incoming_dir: PathBuf,
    pub connect_timeout: Duration,
    pub name_grace: Duration,
    pub upload_framing: UploadFraming,
    pub download_framing: DownloadFraming,
    /// Drop relayed lines whose sender is our own name.
    pub filter_own_echo: bool,
}

impl SessionConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            incoming_dir: data_dir.join("incoming"),
            data_dir,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            name_grace: DEFAULT_NAME_GRACE,
            upload_framing: UploadFraming::default(),
            download_framing: DownloadFraming::default(),
            filter_own_echo: true,
        }
    }

    pub fn with_server_config(mut self, server: &ServerConfig) -> Self {
        self.upload_framing = server.upload_framing;
        self.download_framing = server.download_framing;
        self
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            name_grace: self.name_grace,
            incoming_dir: self.incoming_dir.clone(),
            download_framing: self.download_framing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected { user_name: String },
    MessageArrived(ChatMessage),
    FileArrived(ReceivedFile),
    NameConflict { rejected: String },
    TransferProgress(FileTransferRequest),
    TransferFailed { file_name: String, reason: String },
    Disconnected,
}

struct Attention {
    focused: bool,
    unread: u32,
}

struct ActiveSession {
    connection: Connection,
    engine: TransferEngine,
    pump: JoinHandle<()>,
}

/// Owns the connection lifecycle and everything the UI calls into.
pub struct SessionController {
    config: SessionConfig,
    store: Arc<StdMutex<HistoryStore>>,
    state: Arc<watch::Sender<ConnectionState>>,
    active: StdMutex<Option<ActiveSession>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    attention: Arc<StdMutex<Attention>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let store = HistoryStore::new(&config.data_dir);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let controller = Self {
            config,
            store: Arc::new(StdMutex::new(store)),
            state: Arc::new(state),
            active: StdMutex::new(None),
            events: events_tx,
            attention: Arc::new(StdMutex::new(Attention {
                focused: true,
                unread: 0,
            })),
            notifier: None,
        };
        (controller, events_rx)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Connects with the saved user name.
    pub async fn start(&self, server_addr: &str) -> Result<(), SessionError> {
        let user_name = self
            .with_store(|store| Ok(store.load_user_name()))
            .await?
            .ok_or(SessionError::MissingUserName)?;

        let claimed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(SessionError::AlreadyStarted);
        }
        if let Some(stale) = self.take_active() {
            stale.pump.abort();
        }

        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let connection = connection::connect(
            &self.config.connect_options(),
            server_addr,
            &user_name,
            Arc::clone(&self.state),
            conn_tx,
        )
        .await?;

        let engine = TransferEngine::new(
            connection.clone(),
            self.config.upload_framing,
            self.config.download_framing,
        );
        let pump = tokio::spawn(
            EventPump {
                store: Arc::clone(&self.store),
                events: self.events.clone(),
                attention: Arc::clone(&self.attention),
                notifier: self.notifier.clone(),
                user_name: connection.user_name_cell(),
                filter_own_echo: self.config.filter_own_echo,
            }
            .run(conn_rx),
        );

        *self.lock_active() = Some(ActiveSession {
            connection,
            engine,
            pump,
        });
        Ok(())
    }

    /// Closes the connection. No `Disconnected` event is emitted for a local stop.
    pub async fn stop(&self) {
        let Some(active) = self.take_active() else {
            return;
        };
        active.connection.close().await;
        info!("session stopped");
    }

    /// Records the message in history, then writes it to the socket.
    /// The text goes out as typed; only all-blank input is refused.
    pub async fn send_text(&self, text: &str) -> Result<(), SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let (connection, _) = self.current()?;
        if connection.state() != ConnectionState::Connected {
            return Err(SendError::NotConnected.into());
        }
        let message = ChatMessage::sent(connection.user_name(), text);
        if let Err(err) = self.with_store(move |store| store.append_message(&message)).await {
            warn!(error = %err, "sent message not saved");
        }
        connection.send(text).await?;
        Ok(())
    }

    pub async fn upload_file(&self, path: &Path) -> Result<u64, SessionError> {
        let (connection, engine) = self.current()?;
        let events = self.events.clone();
        let size = engine
            .upload(path, |progress| {
                let _ = events.send(SessionEvent::TransferProgress(progress.clone()));
            })
            .await?;

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let note = ChatMessage::sent(connection.user_name(), format!("uploaded file: {name}"));
        if let Err(err) = self.with_store(move |store| store.append_message(&note)).await {
            warn!(error = %err, "upload note not saved");
        }
        Ok(size)
    }

    pub async fn download_file(
        &self,
        file_name: &str,
        destination: &Path,
    ) -> Result<u64, SessionError> {
        let (_, engine) = self.current()?;
        let events = self.events.clone();
        let size = engine
            .download_to_path(file_name, destination, |progress| {
                let _ = events.send(SessionEvent::TransferProgress(progress.clone()));
            })
            .await?;
        Ok(size)
    }

    pub async fn refresh_file_list(&self) -> Result<RemoteFileListing, SessionError> {
        let (_, engine) = self.current()?;
        Ok(engine.list_files().await?)
    }

    /// Answers a `NameConflict` with a new name.
    pub async fn resubmit_name(&self, name: &str) -> Result<(), SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyUserName.into());
        }
        let (connection, _) = self.current()?;
        connection.resubmit_name(name).await?;
        Ok(())
    }

    /// Saves a new name for the next `start`.
    pub async fn rename(&self, name: &str) -> Result<(), SessionError> {
        let name = name.trim().to_owned();
        self.with_store(move |store| store.save_user_name(&name))
            .await
    }

    pub async fn saved_user_name(&self) -> Option<String> {
        self.with_store(|store| Ok(store.load_user_name()))
            .await
            .ok()
            .flatten()
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.with_store(|store| Ok(store.load_history()))
            .await
            .unwrap_or_default()
    }

    pub fn session(&self) -> Option<Session> {
        self.lock_active()
            .as_ref()
            .map(|active| active.connection.session())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the state equals `target`; false on timeout.
    pub async fn wait_for_state(&self, target: ConnectionState, wait: Duration) -> bool {
        let mut rx = self.state.subscribe();
        tokio::time::timeout(wait, rx.wait_for(|state| *state == target))
            .await
            .is_ok_and(|reached| reached.is_ok())
    }

    /// Focus resets the unread counter.
    pub fn set_focused(&self, focused: bool) {
        let mut attention = lock(&self.attention);
        attention.focused = focused;
        if focused {
            attention.unread = 0;
        }
    }

    pub fn unread(&self) -> u32 {
        lock(&self.attention).unread
    }

    fn current(&self) -> Result<(Connection, TransferEngine), SessionError> {
        self.lock_active()
            .as_ref()
            .map(|active| (active.connection.clone(), active.engine.clone()))
            .ok_or(SessionError::NotStarted)
    }

    fn take_active(&self) -> Option<ActiveSession> {
        self.lock_active().take()
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveSession>> {
        lock(&self.active)
    }

    async fn with_store<T, F>(&self, op: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&HistoryStore) -> Result<T, StoreError> + Send + 'static,
    {
        run_on_store(&self.store, op).await.map_err(SessionError::from)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.active).take() {
            active.connection.signal_shutdown();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run_on_store<T, F>(store: &Arc<StdMutex<HistoryStore>>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&HistoryStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&lock(&store)))
        .await
        .map_err(|err| StoreError::IoFailure {
            path: PathBuf::new(),
            source: std::io::Error::other(err.to_string()),
        })?
}

/// Translates connection events into session events, persisting on the way.
struct EventPump {
    store: Arc<StdMutex<HistoryStore>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    attention: Arc<StdMutex<Attention>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    user_name: Arc<StdMutex<String>>,
    filter_own_echo: bool,
}

impl EventPump {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                ConnectionEvent::Negotiated { user_name } => {
                    let saved = user_name.clone();
                    if let Err(err) =
                        run_on_store(&self.store, move |store| store.save_user_name(&saved)).await
                    {
                        warn!(error = %err, "user name not saved");
                    }
                    self.emit(SessionEvent::Connected { user_name });
                }
                ConnectionEvent::NameConflict { rejected } => {
                    self.emit(SessionEvent::NameConflict { rejected });
                }
                ConnectionEvent::MessageReceived(line) => {
                    let message = ChatMessage::from_relayed(&line);
                    if self.filter_own_echo && message.sender == *lock_name(&self.user_name) {
                        debug!("dropping echo of our own message");
                        continue;
                    }
                    self.persist(message.clone()).await;
                    self.bump_unread();
                    self.emit(SessionEvent::MessageArrived(message));
                }
                ConnectionEvent::FileReceived(file) => {
                    let note = ChatMessage::received(
                        SERVER_SENDER,
                        format!("received file: {}", file.file_name),
                    );
                    self.persist(note).await;
                    self.emit(SessionEvent::FileArrived(file));
                }
                ConnectionEvent::IncomingFileFailed { file_name, error } => {
                    self.emit(SessionEvent::TransferFailed {
                        file_name,
                        reason: error.to_string(),
                    });
                }
                ConnectionEvent::Progress(progress) => {
                    self.emit(SessionEvent::TransferProgress(progress));
                }
                ConnectionEvent::Disconnected => {
                    self.emit(SessionEvent::Disconnected);
                }
            }
        }
    }

    async fn persist(&self, message: ChatMessage) {
        if let Err(err) = run_on_store(&self.store, move |store| store.append_message(&message)).await
        {
            warn!(error = %err, "received message not saved");
        }
    }

    fn bump_unread(&self) {
        let unread = {
            let mut attention = lock(&self.attention);
            if attention.focused {
                return;
            }
            attention.unread += 1;
            attention.unread
        };
        if let Some(notifier) = &self.notifier {
            notifier.notify("IcoChat", &format!("{unread} new messages"));
            notifier.play_sound();
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
