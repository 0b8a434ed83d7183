use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use icochat_core::{
    Command, Credentials, LoginResponse, MAX_RECEIVE_BYTES, ProtocolError, encode_command,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{info, warn};

use crate::config::{JsonSaveError, load_json_from_path, save_json_with_retry};

pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_CREDENTIALS_BYTES: u64 = 64 * 1024;
const MAX_RESPONSE_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("server {address} is unreachable: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("no login response from {address} within {timeout:?}")]
    Timeout { address: String, timeout: Duration },
    #[error("login i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unexpected login response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub accepted: bool,
    pub message: String,
}

/// Checks credentials over a dedicated connection that the server closes afterwards.
pub async fn sign_in(
    address: &str,
    credentials: &Credentials,
    wait: Duration,
) -> Result<LoginOutcome, LoginError> {
    let timed_out = || LoginError::Timeout {
        address: address.to_owned(),
        timeout: wait,
    };

    let mut stream = match timeout(wait, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(LoginError::Connect {
                address: address.to_owned(),
                source,
            });
        }
        Err(_) => return Err(timed_out()),
    };

    let request = encode_command(&Command::Credentials(credentials.clone()))?;
    stream.write_all(&request).await?;

    let response = timeout(wait, read_response(&mut stream))
        .await
        .map_err(|_| timed_out())??;
    if !response.is_received() {
        return Err(LoginError::InvalidResponse(format!(
            "status {:?}",
            response.status
        )));
    }

    let outcome = LoginOutcome {
        accepted: response.accepted(),
        message: response.message,
    };
    info!(email = %credentials.email, accepted = outcome.accepted, "login answered");
    Ok(outcome)
}

/// Reads until the bytes parse as a response or the server hangs up.
async fn read_response(stream: &mut TcpStream) -> Result<LoginResponse, LoginError> {
    let mut received = Vec::new();
    let mut buf = [0_u8; MAX_RECEIVE_BYTES];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
        if let Ok(response) = serde_json::from_slice::<LoginResponse>(&received) {
            return Ok(response);
        }
        if received.len() > MAX_RESPONSE_BYTES {
            return Err(LoginError::InvalidResponse("response too large".to_owned()));
        }
    }
    serde_json::from_slice::<LoginResponse>(&received)
        .map_err(|err| LoginError::InvalidResponse(err.to_string()))
}

/// `credentials.json`, kept only while "remember me" is on.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CREDENTIALS_FILE),
        }
    }

    pub fn load(&self) -> Option<Credentials> {
        match load_json_from_path::<Credentials>(&self.path, MAX_CREDENTIALS_BYTES) {
            Ok(credentials) => Some(credentials),
            Err(err) if err.is_missing() => None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "saved credentials unreadable");
                None
            }
        }
    }

    pub fn save(&self, credentials: &Credentials) -> Result<(), JsonSaveError> {
        save_json_with_retry(&self.path, credentials)
    }

    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    /// Applies the "remember me" choice after a successful login.
    pub fn remember(&self, credentials: &Credentials, remember: bool) {
        let result = if remember {
            self.save(credentials).map_err(|err| err.to_string())
        } else {
            self.clear().map_err(|err| err.to_string())
        };
        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %err, "credential store not updated");
        }
    }
}
