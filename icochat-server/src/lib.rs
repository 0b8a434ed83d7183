use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
    time::Duration,
};

use icochat_core::{
    Credentials, Inbound, LENGTH_HEADER_BYTES, LIST_FILES, LoginResponse, MAX_RECEIVE_BYTES,
    NAME_IN_USE, PushbackReader, Tag, decode, encode_file_listing, encode_length_prefixed,
    encode_tagged, format_chat_line, parse_length_header, split_announcement,
};
use tokio::{
    io::{AsyncRead, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{RwLock, mpsc},
    time::timeout,
};
use tracing::{debug, error, info, warn};

/// Uploads are held in memory; anything larger is refused.
pub const MAX_UPLOAD_BYTES: u64 = 64 * 1024 * 1024;

/// An upload without a size header ends at end of stream or after this much silence.
pub const UNSIZED_UPLOAD_IDLE: Duration = Duration::from_millis(500);

/// How `DESCARGAR_ARCHIVO` replies are delimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DownloadReply {
    #[default]
    LengthPrefixed,
    /// Raw bytes, then the server closes the connection.
    CloseAfter,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Expect a 10-digit size header after `ARCHIVO:<name>`.
    pub upload_size_header: bool,
    pub download_reply: DownloadReply,
    /// Relay chat lines back to their sender as well.
    pub echo_to_sender: bool,
    /// email to password, checked by `CREDENTIALS:` logins.
    pub accounts: HashMap<String, String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            upload_size_header: true,
            download_reply: DownloadReply::default(),
            echo_to_sender: false,
            accounts: HashMap::new(),
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Bytes(Vec<u8>),
    Close,
}

#[derive(Debug, Default)]
struct ServerState {
    users: HashMap<String, mpsc::UnboundedSender<Outbound>>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
    options: Arc<ServerOptions>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    #[must_use]
    pub fn with_options(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    pub async fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.inner.read().await.users.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn stored_files(&self) -> Vec<String> {
        self.inner.read().await.files.keys().cloned().collect()
    }

    pub async fn file_contents(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.read().await.files.get(name).cloned()
    }

    pub async fn store_file(&self, name: &str, data: Vec<u8>) {
        self.inner.write().await.files.insert(name.to_owned(), data);
    }

    /// Sends a file to one connected user with an `ARCHIVO:` announcement.
    pub async fn push_file(&self, user: &str, name: &str, data: &[u8]) -> Result<(), String> {
        let tx = self
            .inner
            .read()
            .await
            .users
            .get(user)
            .cloned()
            .ok_or_else(|| format!("user {user} is not connected"))?;

        let mut message = encode_tagged(Tag::File, name);
        match self.options.download_reply {
            DownloadReply::LengthPrefixed => {
                let block = encode_length_prefixed(data).map_err(|err| err.to_string())?;
                message.extend_from_slice(&block);
                send(&tx, Outbound::Bytes(message));
            }
            DownloadReply::CloseAfter => {
                message.extend_from_slice(data);
                send(&tx, Outbound::Bytes(message));
                send(&tx, Outbound::Close);
            }
        }
        info!(user = %user, file = %name, bytes = data.len(), "file pushed");
        Ok(())
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    serve_with_shutdown(listener, state, std::future::pending()).await
}

/// Accepts clients until `shutdown` resolves. Open sessions keep running.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    state: AppState,
    shutdown: F,
) -> Result<(), String>
where
    F: Future<Output = ()>,
{
    info!(
        "chat server listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => {
                info!("chat server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted.map_err(|err| err.to_string())?,
        };
        let state = state.clone();
        tokio::spawn(async move {
            debug!(%peer, "client connected");
            if let Err(err) = handle_connection(state, stream).await {
                warn!(%peer, "session ended with error: {}", err);
            }
        });
    }
}

async fn handle_connection(state: AppState, stream: TcpStream) -> Result<(), String> {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = PushbackReader::new(read_half);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            match message {
                Outbound::Bytes(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            }
        }
    });

    let result = run_session(&state, &mut reader, &outbound_tx).await;
    drop(outbound_tx);
    let _ = send_task.await;
    result
}

async fn run_session<R>(
    state: &AppState,
    reader: &mut PushbackReader<R>,
    outbound: &mpsc::UnboundedSender<Outbound>,
) -> Result<(), String>
where
    R: AsyncRead + Unpin,
{
    let Some(name) = negotiate_name(state, reader, outbound).await? else {
        return Ok(());
    };
    let result = serve_user(state, &name, reader, outbound).await;
    state.inner.write().await.users.remove(&name);
    info!(user = %name, "user left");
    result
}

/// Registers the first free name. `None` when the client left or only logged in.
async fn negotiate_name<R>(
    state: &AppState,
    reader: &mut PushbackReader<R>,
    outbound: &mpsc::UnboundedSender<Outbound>,
) -> Result<Option<String>, String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; MAX_RECEIVE_BYTES];
    loop {
        let n = reader.read_some(&mut buf).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(None);
        }

        if let Inbound::Tagged {
            tag: Tag::Credentials,
            payload,
        } = decode(&buf[..n])
        {
            answer_login(state, &payload, outbound);
            send(outbound, Outbound::Close);
            return Ok(None);
        }

        let name = String::from_utf8_lossy(&buf[..n]).trim().to_owned();
        let mut server = state.inner.write().await;
        if name.is_empty() || server.users.contains_key(&name) {
            drop(server);
            info!(user = %name, "name rejected");
            send(outbound, Outbound::Bytes(NAME_IN_USE.as_bytes().to_vec()));
            continue;
        }
        server.users.insert(name.clone(), outbound.clone());
        info!(user = %name, "user joined");
        return Ok(Some(name));
    }
}

async fn serve_user<R>(
    state: &AppState,
    name: &str,
    reader: &mut PushbackReader<R>,
    outbound: &mpsc::UnboundedSender<Outbound>,
) -> Result<(), String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; MAX_RECEIVE_BYTES];
    loop {
        let n = reader.read_some(&mut buf).await.map_err(|e| e.to_string())?;
        if n == 0 {
            return Ok(());
        }
        let unit = buf[..n].to_vec();

        if unit == LIST_FILES.as_bytes() {
            let names = state.stored_files().await;
            let reply = encode_file_listing(&names).map_err(|e| e.to_string())?;
            send(outbound, Outbound::Bytes(reply));
            continue;
        }

        let keep_going = match decode(&unit) {
            Inbound::Tagged {
                tag: Tag::File,
                payload,
            } => receive_upload(state, name, reader, &payload).await?,
            Inbound::Tagged {
                tag: Tag::Download,
                payload,
            } => {
                let file_name = String::from_utf8_lossy(&payload).trim().to_owned();
                send_download(state, &file_name, outbound).await?
            }
            Inbound::Tagged {
                tag: Tag::Credentials,
                ..
            } => {
                warn!(user = %name, "login attempted on a chat connection");
                true
            }
            Inbound::PlainText(_) | Inbound::LengthPrefixedHeader(_) => {
                broadcast_chat(state, name, &String::from_utf8_lossy(&unit)).await;
                true
            }
        };
        if !keep_going {
            return Ok(());
        }
    }
}

/// Returns false once the upload ran to the end of the connection.
async fn receive_upload<R>(
    state: &AppState,
    user: &str,
    reader: &mut PushbackReader<R>,
    payload: &[u8],
) -> Result<bool, String>
where
    R: AsyncRead + Unpin,
{
    if !state.options.upload_size_header {
        let file_name = String::from_utf8_lossy(payload).trim().to_owned();
        let mut data = Vec::new();
        let mut buf = vec![0_u8; MAX_RECEIVE_BYTES];
        let mut connection_open = true;
        loop {
            let read = timeout(UNSIZED_UPLOAD_IDLE, reader.read_some(&mut buf)).await;
            let n = match read {
                Ok(read) => read.map_err(|e| e.to_string())?,
                Err(_) => break,
            };
            if n == 0 {
                connection_open = false;
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if data.len() as u64 > MAX_UPLOAD_BYTES {
                return Err(format!("upload {file_name} exceeds {MAX_UPLOAD_BYTES} bytes"));
            }
        }
        info!(user = %user, file = %file_name, bytes = data.len(), "unsized upload stored");
        state.store_file(&file_name, data).await;
        return Ok(connection_open);
    }

    let (file_name, leftover) = split_announcement(payload);
    reader.unread(leftover);

    let mut header = [0_u8; LENGTH_HEADER_BYTES];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| e.to_string())?;
    let length = parse_length_header(&header).map_err(|e| e.to_string())?;
    if length > MAX_UPLOAD_BYTES {
        return Err(format!(
            "upload {file_name} declares {length} bytes (max {MAX_UPLOAD_BYTES})"
        ));
    }
    let length = usize::try_from(length).map_err(|e| e.to_string())?;
    let mut data = vec![0_u8; length];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| e.to_string())?;

    info!(user = %user, file = %file_name, bytes = length, "upload stored");
    state.store_file(&file_name, data).await;
    Ok(true)
}

async fn send_download(
    state: &AppState,
    file_name: &str,
    outbound: &mpsc::UnboundedSender<Outbound>,
) -> Result<bool, String> {
    let data = state.file_contents(file_name).await;
    if data.is_none() {
        warn!(file = %file_name, "download of unknown file");
    }
    let data = data.unwrap_or_default();

    match state.options.download_reply {
        DownloadReply::LengthPrefixed => {
            let reply = encode_length_prefixed(&data).map_err(|e| e.to_string())?;
            send(outbound, Outbound::Bytes(reply));
            Ok(true)
        }
        DownloadReply::CloseAfter => {
            send(outbound, Outbound::Bytes(data));
            send(outbound, Outbound::Close);
            Ok(false)
        }
    }
}

async fn broadcast_chat(state: &AppState, sender: &str, text: &str) {
    let line = format_chat_line(sender, text).into_bytes();
    let recipients = {
        let server = state.inner.read().await;
        server
            .users
            .iter()
            .filter(|(name, _)| state.options.echo_to_sender || name.as_str() != sender)
            .map(|(_, tx)| tx.clone())
            .collect::<Vec<_>>()
    };
    debug!(user = %sender, recipients = recipients.len(), "chat relayed");
    for tx in recipients {
        send(&tx, Outbound::Bytes(line.clone()));
    }
}

fn answer_login(state: &AppState, payload: &[u8], outbound: &mpsc::UnboundedSender<Outbound>) {
    let response = match serde_json::from_slice::<Credentials>(payload) {
        Ok(credentials) => {
            let accepted = state
                .options
                .accounts
                .get(&credentials.email)
                .is_some_and(|password| *password == credentials.password);
            info!(email = %credentials.email, accepted, "login checked");
            if accepted {
                LoginResponse::received(true, "welcome")
            } else {
                LoginResponse::received(false, "invalid email or password")
            }
        }
        Err(err) => {
            warn!("malformed credentials: {}", err);
            LoginResponse::received(false, "malformed credentials")
        }
    };

    match serde_json::to_vec(&response) {
        Ok(bytes) => send(outbound, Outbound::Bytes(bytes)),
        Err(err) => error!("failed to serialize login response: {}", err),
    }
}

fn send(tx: &mpsc::UnboundedSender<Outbound>, message: Outbound) {
    let _ = tx.send(message);
}
