use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use clap::Parser;
use icochat_client::{
    ChatMessage, ConnectionState, CredentialStore, Direction, NotificationSink, SessionConfig,
    SessionController, SessionEvent, TransferDirection, config, login,
};
use icochat_core::Credentials;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::mpsc,
};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

const HELP: &str = "\
commands:
  <text>                  send a chat message
  /upload PATH            upload a file
  /files                  list files on the server
  /download NAME [DEST]   download a file (default: ./NAME)
  /name NEW               pick another name
  /history                print saved history
  /away, /back            toggle unread notifications
  /quit                   leave";

#[derive(Parser, Debug)]
#[command(name = "icochat")]
struct ClientArgs {
    /// `host:port`; overrides server_config.json.
    #[arg(long)]
    server: Option<String>,
    #[arg(long)]
    user_name: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Keep the credentials for the next start.
    #[arg(long, default_value_t = false)]
    remember: bool,
    /// Show our own messages when the server echoes them back.
    #[arg(long, default_value_t = false)]
    show_own_echo: bool,
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

struct TerminalBell;

impl NotificationSink for TerminalBell {
    fn notify(&self, title: &str, body: &str) {
        eprintln!("[{title}] {body}");
    }

    fn play_sound(&self) {
        eprint!("\x07");
    }
}

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    let data_dir = args.data_dir.clone().unwrap_or_else(config::data_dir);
    let _ = std::fs::create_dir_all(&data_dir);
    init_logging(&data_dir);

    if let Err(err) = run(args, data_dir).await {
        error!("client exited: {}", err);
        eprintln!("icochat: {err}");
        std::process::exit(1);
    }
}

async fn run(args: ClientArgs, data_dir: PathBuf) -> Result<(), String> {
    let server_config = config::load_server_config(&data_dir);
    let address = args
        .server
        .clone()
        .unwrap_or_else(|| server_config.address());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    log_in(&args, &data_dir, &address).await?;

    let mut session_config = SessionConfig::new(&data_dir).with_server_config(&server_config);
    session_config.filter_own_echo = !args.show_own_echo;
    let (controller, events) = SessionController::new(session_config);
    let controller = Arc::new(controller.with_notifier(Arc::new(TerminalBell)));

    let user_name = match args.user_name.clone() {
        Some(name) => Some(name),
        None if controller.saved_user_name().await.is_none() => {
            println!("user name:");
            lines.next_line().await.map_err(|e| e.to_string())?
        }
        None => None,
    };
    if let Some(name) = user_name {
        controller.rename(&name).await.map_err(|e| e.to_string())?;
    }

    for message in controller.history().await {
        print_message(&message);
    }

    controller.start(&address).await.map_err(|e| e.to_string())?;
    info!(server = %address, "session started");
    let printer = tokio::spawn(print_events(events));

    let result = command_loop(&controller, &mut lines).await;
    controller.stop().await;
    printer.abort();
    result
}

async fn log_in(args: &ClientArgs, data_dir: &Path, address: &str) -> Result<(), String> {
    let store = CredentialStore::new(data_dir);
    let (credentials, remember) = match (&args.email, &args.password) {
        (Some(email), Some(password)) => (
            Credentials {
                email: email.clone(),
                password: password.clone(),
            },
            args.remember,
        ),
        _ => match store.load() {
            Some(saved) => (saved, true),
            None => return Ok(()),
        },
    };

    let outcome = login::sign_in(address, &credentials, login::DEFAULT_LOGIN_TIMEOUT)
        .await
        .map_err(|e| e.to_string())?;
    if !outcome.accepted {
        store.remember(&credentials, false);
        return Err(format!("login refused: {}", outcome.message));
    }
    store.remember(&credentials, remember);
    println!("* {}", outcome.message);
    Ok(())
}

async fn command_loop(
    controller: &Arc<SessionController>,
    lines: &mut StdinLines,
) -> Result<(), String> {
    println!("{HELP}");
    while let Some(raw) = lines.next_line().await.map_err(|e| e.to_string())? {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match command {
            "/quit" => break,
            "/help" => println!("{HELP}"),
            "/away" => controller.set_focused(false),
            "/back" => controller.set_focused(true),
            "/history" => {
                for message in controller.history().await {
                    print_message(&message);
                }
            }
            "/files" => match controller.refresh_file_list().await {
                Ok(listing) if listing.is_empty() => println!("* no files on the server"),
                Ok(listing) => {
                    for name in listing.names() {
                        println!("  {name}");
                    }
                }
                Err(err) => println!("* listing failed: {err}"),
            },
            "/upload" if !rest.is_empty() => {
                let controller = Arc::clone(controller);
                let path = PathBuf::from(rest);
                tokio::spawn(async move {
                    match controller.upload_file(&path).await {
                        Ok(bytes) => println!("* uploaded {} ({bytes} bytes)", path.display()),
                        Err(err) => println!("* upload failed: {err}"),
                    }
                });
            }
            "/download" if !rest.is_empty() => {
                let (name, dest) = match rest.split_once(' ') {
                    Some((name, dest)) => (name.to_owned(), PathBuf::from(dest.trim())),
                    None => (rest.to_owned(), PathBuf::from(rest)),
                };
                let controller = Arc::clone(controller);
                tokio::spawn(async move {
                    match controller.download_file(&name, &dest).await {
                        Ok(bytes) => println!("* saved {} ({bytes} bytes)", dest.display()),
                        Err(err) => println!("* download failed: {err}"),
                    }
                });
            }
            "/name" if !rest.is_empty() => {
                let result = if controller.state() == ConnectionState::NameNegotiation {
                    controller.resubmit_name(rest).await
                } else {
                    controller.rename(rest).await.map(|()| {
                        println!("* name saved; it applies on the next start");
                    })
                };
                if let Err(err) = result {
                    println!("* rename failed: {err}");
                }
            }
            _ if command.starts_with('/') => println!("{HELP}"),
            _ => {
                if let Err(err) = controller.send_text(&raw).await {
                    println!("* not sent: {err}");
                }
            }
        }
    }
    Ok(())
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected { user_name } => println!("* connected as {user_name}"),
            SessionEvent::MessageArrived(message) => print_message(&message),
            SessionEvent::FileArrived(file) => println!(
                "* received {} ({} bytes) -> {}",
                file.file_name,
                file.size,
                file.path.display()
            ),
            SessionEvent::NameConflict { rejected } => {
                println!("* name {rejected:?} is in use; pick another with /name NEW");
            }
            SessionEvent::TransferProgress(progress) => {
                let verb = match progress.direction {
                    TransferDirection::Upload => "sent",
                    TransferDirection::Download => "received",
                };
                match progress.expected_size {
                    Some(total) => println!(
                        "* {}: {verb} {}/{total} bytes",
                        progress.file_name, progress.bytes_transferred
                    ),
                    None => println!(
                        "* {}: {verb} {} bytes",
                        progress.file_name, progress.bytes_transferred
                    ),
                }
            }
            SessionEvent::TransferFailed { file_name, reason } => {
                warn!(file = %file_name, %reason, "incoming file failed");
                println!("* {file_name} failed: {reason}");
            }
            SessionEvent::Disconnected => println!("* disconnected from server"),
        }
    }
}

fn print_message(message: &ChatMessage) {
    match message.direction {
        Direction::Sent => println!("{} (you): {}", message.sender, message.body),
        Direction::Received => println!("{}: {}", message.sender, message.body),
    }
}

fn init_logging(data_dir: &Path) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let log_dir = data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("icochat.log");
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
