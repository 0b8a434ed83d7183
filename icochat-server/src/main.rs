use std::collections::HashMap;

use clap::Parser;
use icochat_server::{AppState, DownloadReply, ServerOptions, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "icochat-server")]
struct ServerArgs {
    #[arg(long, default_value = "0.0.0.0:12345")]
    bind_address: String,
    /// Read uploads until the client closes instead of expecting a size header.
    #[arg(long, default_value_t = false)]
    unsized_uploads: bool,
    /// Answer downloads with raw bytes and close the connection.
    #[arg(long, default_value_t = false)]
    close_after_download: bool,
    #[arg(long, default_value_t = false)]
    echo_to_sender: bool,
    /// Login account as `email=password`; repeatable.
    #[arg(long = "account", value_parser = parse_account)]
    accounts: Vec<(String, String)>,
}

fn parse_account(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((email, password)) if !email.is_empty() => {
            Ok((email.to_owned(), password.to_owned()))
        }
        _ => Err(format!("expected email=password, got {raw:?}")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ServerArgs::parse();
    let options = ServerOptions {
        upload_size_header: !args.unsized_uploads,
        download_reply: if args.close_after_download {
            DownloadReply::CloseAfter
        } else {
            DownloadReply::LengthPrefixed
        },
        echo_to_sender: args.echo_to_sender,
        accounts: args.accounts.into_iter().collect::<HashMap<_, _>>(),
    };

    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!("chat server starting on {}", args.bind_address);
    if let Err(err) = serve(listener, AppState::with_options(options)).await {
        warn!("chat server exited: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_argument_splits_on_first_equals() {
        assert_eq!(
            parse_account("ana@example.com=p=w"),
            Ok(("ana@example.com".to_owned(), "p=w".to_owned()))
        );
        assert!(parse_account("=secret").is_err());
        assert!(parse_account("nobody").is_err());
    }
}
