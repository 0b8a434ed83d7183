use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use icochat_core::{
    Command, FILE_CHUNK_BYTES, LENGTH_HEADER_BYTES, LIST_FILES, LengthPrefixedDecoder,
    decode_file_listing, encode_command, encode_length_header, parse_length_header,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard, watch},
};
use tracing::{debug, info, warn};

use crate::{
    config::{DownloadFraming, UploadFraming},
    connection::{Connection, ConnectionState, SocketReader, cancelled},
    error::TransferError,
};

/// Progress is reported at most once per this many bytes, plus once at the end.
pub const PROGRESS_STEP_BYTES: u64 = 64 * 1024;

const MAX_SANITIZED_NAME_CHARS: usize = 128;
const MAX_NAME_COLLISIONS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferRequest {
    pub file_name: String,
    pub direction: TransferDirection,
    /// Known for uploads and length-prefixed downloads.
    pub expected_size: Option<u64>,
    pub bytes_transferred: u64,
}

impl FileTransferRequest {
    pub fn new(
        file_name: impl Into<String>,
        direction: TransferDirection,
        expected_size: Option<u64>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            direction,
            expected_size,
            bytes_transferred: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.expected_size == Some(self.bytes_transferred)
    }
}

/// A file the server pushed to us, saved under the incoming directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFileListing {
    names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ListingDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl RemoteFileListing {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// What changed since `previous`, for callers that poll the listing.
    pub fn diff(&self, previous: &RemoteFileListing) -> ListingDiff {
        ListingDiff {
            added: self
                .names
                .iter()
                .filter(|name| !previous.contains(name))
                .cloned()
                .collect(),
            removed: previous
                .names
                .iter()
                .filter(|name| !self.contains(name))
                .cloned()
                .collect(),
        }
    }
}

/// Runs uploads, downloads and listings over one connection, one at a time.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    connection: Connection,
    gate: Arc<Mutex<()>>,
    upload_framing: UploadFraming,
    download_framing: DownloadFraming,
}

impl TransferEngine {
    pub fn new(
        connection: Connection,
        upload_framing: UploadFraming,
        download_framing: DownloadFraming,
    ) -> Self {
        Self {
            connection,
            gate: Arc::new(Mutex::new(())),
            upload_framing,
            download_framing,
        }
    }

    /// Claims the transfer slot without waiting.
    fn begin(&self) -> Result<MutexGuard<'_, ()>, TransferError> {
        let turn = self.gate.try_lock().map_err(|_| TransferError::Busy)?;
        if self.connection.state() != ConnectionState::Connected {
            return Err(TransferError::NotConnected);
        }
        Ok(turn)
    }

    /// Announces and streams a local file. Returns the number of bytes sent.
    pub async fn upload(
        &self,
        path: &Path,
        mut on_progress: impl FnMut(&FileTransferRequest),
    ) -> Result<u64, TransferError> {
        let _turn = self.begin()?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                TransferError::IoFailure(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                ))
            })?;

        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        let mut request = FileTransferRequest::new(file_name, TransferDirection::Upload, Some(size));
        let mut shutdown = self.connection.shutdown_signal();

        let mut writer = guarded(&mut shutdown, self.connection.lock_writer()).await?;
        let announcement = encode_command(&Command::AnnounceFile(file_name.to_owned()))?;
        guarded(&mut shutdown, writer.write_all(&announcement)).await??;

        let limit = match self.upload_framing {
            UploadFraming::SizeHeader => {
                let header = encode_length_header(size)?;
                guarded(&mut shutdown, writer.write_all(&header)).await??;
                size
            }
            UploadFraming::Unsized => u64::MAX,
        };
        info!(file = %file_name, bytes = size, framing = ?self.upload_framing, "upload started");

        let mut chunk = vec![0_u8; FILE_CHUNK_BYTES];
        let mut reported = 0;
        while request.bytes_transferred < limit {
            let want = chunk_len(limit - request.bytes_transferred, chunk.len());
            let n = file.read(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            guarded(&mut shutdown, writer.write_all(&chunk[..n])).await??;
            request.bytes_transferred += n as u64;
            if request.bytes_transferred - reported >= PROGRESS_STEP_BYTES {
                reported = request.bytes_transferred;
                on_progress(&request);
            }
        }
        guarded(&mut shutdown, writer.flush()).await??;

        if self.upload_framing == UploadFraming::SizeHeader && request.bytes_transferred < size {
            // The header already promised `size` bytes; the stream is now misaligned.
            warn!(file = %file_name, sent = request.bytes_transferred, size, "file shrank during upload");
            return Err(TransferError::IncompleteTransfer {
                expected: size,
                received: request.bytes_transferred,
            });
        }
        on_progress(&request);
        info!(file = %file_name, bytes = request.bytes_transferred, "upload finished");
        Ok(request.bytes_transferred)
    }

    /// Asks the server for its stored file names.
    pub async fn list_files(&self) -> Result<RemoteFileListing, TransferError> {
        let _turn = self.begin()?;
        let mut reader = self.connection.lease_reader().await?;
        let mut shutdown = self.connection.shutdown_signal();
        self.send_request(&mut shutdown, LIST_FILES.as_bytes()).await?;

        let mut decoder = LengthPrefixedDecoder::new();
        let mut buf = vec![0_u8; FILE_CHUNK_BYTES];
        while !decoder.is_complete() {
            let want = decoder.remaining().min(buf.len());
            let n = guarded(&mut shutdown, reader.read_some(&mut buf[..want])).await??;
            if n == 0 {
                break;
            }
            decoder.feed(&buf[..n])?;
        }
        let payload = decoder.finish()?;
        let names = decode_file_listing(&payload)?;
        debug!(files = names.len(), "file listing received");
        Ok(RemoteFileListing::new(names))
    }

    /// Streams a stored file into `dest`. Returns the number of bytes written.
    pub async fn request_download<W>(
        &self,
        file_name: &str,
        dest: &mut W,
        on_progress: impl FnMut(&FileTransferRequest),
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let _turn = self.begin()?;
        self.fetch(file_name, dest, on_progress).await
    }

    /// Downloads into `destination` through a `.part` file that is renamed only on success.
    pub async fn download_to_path(
        &self,
        file_name: &str,
        destination: &Path,
        on_progress: impl FnMut(&FileTransferRequest),
    ) -> Result<u64, TransferError> {
        let _turn = self.begin()?;
        let mut part = PartFile::create(destination).await?;
        match self.fetch(file_name, &mut part.file, on_progress).await {
            Ok(size) => {
                part.commit(destination).await?;
                Ok(size)
            }
            Err(err) => {
                part.discard().await;
                Err(err)
            }
        }
    }

    async fn fetch<W>(
        &self,
        file_name: &str,
        dest: &mut W,
        mut on_progress: impl FnMut(&FileTransferRequest),
    ) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut reader = self.connection.lease_reader().await?;
        let mut shutdown = self.connection.shutdown_signal();
        let request_bytes = encode_command(&Command::Download(file_name.to_owned()))?;
        self.send_request(&mut shutdown, &request_bytes).await?;
        info!(file = %file_name, framing = ?self.download_framing, "download started");

        let mut request = FileTransferRequest::new(file_name, TransferDirection::Download, None);
        let received = receive_stream(
            &mut *reader,
            dest,
            self.download_framing,
            &mut shutdown,
            &mut request,
            &mut on_progress,
        )
        .await?;
        guarded(&mut shutdown, dest.flush()).await??;
        info!(file = %file_name, bytes = received, "download finished");
        Ok(received)
    }

    async fn send_request(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        bytes: &[u8],
    ) -> Result<(), TransferError> {
        let mut writer = guarded(shutdown, self.connection.lock_writer()).await?;
        guarded(shutdown, writer.write_all(bytes)).await??;
        Ok(())
    }
}

/// Receives the file a server announced with `ARCHIVO:` and stores it under `incoming_dir`.
pub(crate) async fn receive_announced(
    reader: &mut SocketReader,
    file_name: &str,
    incoming_dir: &Path,
    framing: DownloadFraming,
    shutdown: &mut watch::Receiver<bool>,
    mut on_progress: impl FnMut(&FileTransferRequest),
) -> Result<ReceivedFile, TransferError> {
    tokio::fs::create_dir_all(incoming_dir).await?;
    let safe = sanitize_file_name(file_name);
    let staging = incoming_dir.join(&safe);
    let mut part = PartFile::create(&staging).await?;

    let mut request = FileTransferRequest::new(&safe, TransferDirection::Download, None);
    let received = receive_stream(
        reader,
        &mut part.file,
        framing,
        shutdown,
        &mut request,
        &mut on_progress,
    )
    .await;
    let size = match received {
        Ok(size) => size,
        Err(err) => {
            part.discard().await;
            return Err(err);
        }
    };

    let dest = unique_destination(incoming_dir, &safe);
    part.commit(&dest).await?;
    Ok(ReceivedFile {
        file_name: safe,
        path: dest,
        size,
    })
}

/// Copies one framed payload from `reader` to `dest`.
///
/// In `Auto` mode the first ten bytes decide: a valid length header bounds
/// the payload, anything else is data and the stream runs to end of stream.
async fn receive_stream<W, F>(
    reader: &mut SocketReader,
    dest: &mut W,
    framing: DownloadFraming,
    shutdown: &mut watch::Receiver<bool>,
    request: &mut FileTransferRequest,
    on_progress: &mut F,
) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
    F: FnMut(&FileTransferRequest),
{
    let declared = match framing {
        DownloadFraming::UntilEof => None,
        DownloadFraming::Auto | DownloadFraming::LengthPrefixed => {
            let mut header = [0_u8; LENGTH_HEADER_BYTES];
            let filled = guarded(shutdown, reader.read_up_to(&mut header)).await??;
            match parse_length_header(&header[..filled]) {
                Ok(length) => Some(length),
                Err(err) if framing == DownloadFraming::LengthPrefixed => return Err(err.into()),
                Err(_) => {
                    debug!(sniffed = filled, "no length header, reading to end of stream");
                    reader.unread(&header[..filled]);
                    None
                }
            }
        }
    };
    request.expected_size = declared;

    let mut buf = vec![0_u8; FILE_CHUNK_BYTES];
    let mut reported = 0;
    loop {
        let want = match declared {
            Some(total) if request.bytes_transferred >= total => break,
            Some(total) => chunk_len(total - request.bytes_transferred, buf.len()),
            None => buf.len(),
        };
        let n = guarded(shutdown, reader.read_some(&mut buf[..want])).await??;
        if n == 0 {
            break;
        }
        guarded(shutdown, dest.write_all(&buf[..n])).await??;
        request.bytes_transferred += n as u64;
        if request.bytes_transferred - reported >= PROGRESS_STEP_BYTES {
            reported = request.bytes_transferred;
            on_progress(request);
        }
    }

    if let Some(total) = declared {
        if request.bytes_transferred < total {
            return Err(TransferError::IncompleteTransfer {
                expected: total,
                received: request.bytes_transferred,
            });
        }
    }
    on_progress(request);
    Ok(request.bytes_transferred)
}

/// Races `fut` against connection shutdown.
async fn guarded<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<F::Output, TransferError> {
    tokio::select! {
        biased;
        _ = cancelled(shutdown) => Err(TransferError::Canceled),
        out = fut => Ok(out),
    }
}

fn chunk_len(remaining: u64, capacity: usize) -> usize {
    usize::try_from(remaining).map_or(capacity, |remaining| remaining.min(capacity))
}

struct PartFile {
    path: PathBuf,
    file: File,
}

impl PartFile {
    async fn create(final_path: &Path) -> io::Result<Self> {
        let mut name = final_path.as_os_str().to_owned();
        name.push(".part");
        let path = PathBuf::from(name);
        let file = File::create(&path).await?;
        Ok(Self { path, file })
    }

    async fn commit(mut self, final_path: &Path) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.path, final_path).await
    }

    async fn discard(self) {
        drop(self.file);
        if let Err(err) = tokio::fs::remove_file(&self.path).await {
            debug!(path = %self.path.display(), error = %err, "part file not removed");
        }
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "file.bin".to_string();
    }
    let mut out: String = trimmed
        .chars()
        .map(|ch| match ch {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .take(MAX_SANITIZED_NAME_CHARS)
        .collect();
    if out == "." || out == ".." {
        out = "file.bin".to_string();
    }
    out
}

/// First free `name`, `name (1)`, `name (2)`, ... in `dir`.
pub fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str());
    for i in 1..=MAX_NAME_COLLISIONS {
        let candidate = match ext {
            Some(ext) => dir.join(format!("{stem} ({i}).{ext}")),
            None => dir.join(format!("{stem} ({i})")),
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_path_separators() {
        assert_eq!(sanitize_file_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_file_name("  "), "file.bin");
        assert_eq!(sanitize_file_name(".."), "file.bin");
        assert_eq!(sanitize_file_name("a:b?.txt"), "a_b_.txt");
    }

    #[test]
    fn unique_destination_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("report (1).txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "report.txt"),
            dir.path().join("report (2).txt")
        );
        assert_eq!(
            unique_destination(dir.path(), "notes"),
            dir.path().join("notes")
        );
    }

    #[test]
    fn listing_diff_reports_both_sides() {
        let before = RemoteFileListing::new(vec!["a.txt".into(), "b.txt".into()]);
        let after = RemoteFileListing::new(vec!["b.txt".into(), "c.txt".into()]);
        let diff = after.diff(&before);
        assert_eq!(diff.added, vec!["c.txt".to_string()]);
        assert_eq!(diff.removed, vec!["a.txt".to_string()]);
        assert!(after.diff(&after).is_empty());
    }

    #[test]
    fn chunk_len_never_exceeds_capacity() {
        assert_eq!(chunk_len(10, 1024), 10);
        assert_eq!(chunk_len(u64::MAX, 1024), 1024);
    }
}
