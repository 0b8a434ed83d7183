use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use icochat_client::{
    ChatMessage, ConnectionState, HistoryStore, NotificationSink, SessionConfig,
    SessionController, SessionError, SessionEvent, TransferError,
};
use icochat_server::{AppState, ServerOptions, serve_with_shutdown};
use tokio::{
    net::TcpListener,
    sync::{mpsc::UnboundedReceiver, oneshot},
    time::{sleep, timeout},
};

#[tokio::test]
async fn uploaded_file_downloads_byte_for_byte() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let (alice, mut events) = connected_client(&address, dir.path(), "alice").await;

    let source = dir.path().join("report.txt");
    let data: Vec<u8> = (0..200_000_u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&source, &data).expect("write source file");

    let sent = alice.upload_file(&source).await.expect("upload succeeds");
    assert_eq!(sent, data.len() as u64);
    wait_for_stored(&state, "report.txt").await;

    let dest = dir.path().join("copy.txt");
    let received = alice
        .download_file("report.txt", &dest)
        .await
        .expect("download succeeds");
    assert_eq!(received, data.len() as u64);
    assert_eq!(std::fs::read(&dest).expect("read download"), data);
    assert!(!dir.path().join("copy.txt.part").exists());

    let progress = drain(&mut events).await;
    assert!(progress.iter().any(|event| matches!(
        event,
        SessionEvent::TransferProgress(p) if p.file_name == "report.txt" && p.is_complete()
    )));

    let history = alice.history().await;
    assert_eq!(
        history.last(),
        Some(&ChatMessage::sent("alice", "uploaded file: report.txt"))
    );

    alice.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn file_name_with_a_digit_run_round_trips() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let (alice, _events) = connected_client(&address, dir.path(), "alice").await;

    let name = "IMG_20240101123456.jpg";
    let source = dir.path().join(name);
    std::fs::write(&source, b"hello").expect("write source file");

    assert_eq!(alice.upload_file(&source).await.expect("upload succeeds"), 5);
    wait_for_stored(&state, name).await;
    assert_eq!(state.stored_files().await, vec![name.to_owned()]);

    let dest = dir.path().join("copy.jpg");
    let received = alice
        .download_file(name, &dest)
        .await
        .expect("download succeeds");
    assert_eq!(received, 5);
    assert_eq!(std::fs::read(&dest).expect("read download"), b"hello");

    alice.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn pushed_file_with_a_digit_run_in_its_name_arrives() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let (alice, mut events) = connected_client(&address, dir.path(), "alice").await;

    state
        .push_file("alice", "IMG_20240101123456.jpg", b"hello")
        .await
        .expect("push to alice");

    let event = wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::FileArrived(_))
    })
    .await;
    let SessionEvent::FileArrived(file) = event else {
        unreachable!("filtered above");
    };
    assert_eq!(file.file_name, "IMG_20240101123456.jpg");
    assert_eq!(file.size, 5);
    assert_eq!(std::fs::read(&file.path).expect("read pushed file"), b"hello");

    alice.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn sent_text_keeps_its_whitespace() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let alice_dir = tempfile::tempdir().expect("create alice dir");
    let bob_dir = tempfile::tempdir().expect("create bob dir");
    let (alice, mut alice_events) = connected_client(&address, alice_dir.path(), "alice").await;
    let (bob, _bob_events) = connected_client(&address, bob_dir.path(), "bob").await;

    assert!(matches!(
        bob.send_text("   ").await,
        Err(SessionError::EmptyMessage)
    ));

    bob.send_text("  indented reply ").await.expect("bob sends");
    let event = wait_for_event(&mut alice_events, |event| {
        matches!(event, SessionEvent::MessageArrived(_))
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::MessageArrived(ChatMessage::received("bob", "  indented reply "))
    );
    assert_eq!(
        bob.history().await,
        vec![ChatMessage::sent("bob", "  indented reply ")]
    );

    alice.stop().await;
    bob.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn second_transfer_while_one_is_running_is_busy() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let (alice, _events) = connected_client(&address, dir.path(), "alice").await;

    let first = dir.path().join("first.bin");
    let second = dir.path().join("second.bin");
    std::fs::write(&first, vec![1_u8; 512 * 1024]).expect("write first file");
    std::fs::write(&second, vec![2_u8; 1024]).expect("write second file");

    let (first_result, second_result) =
        tokio::join!(alice.upload_file(&first), alice.upload_file(&second));
    assert_eq!(first_result.expect("first upload succeeds"), 512 * 1024);
    assert!(
        matches!(
            second_result,
            Err(SessionError::Transfer(TransferError::Busy))
        ),
        "unexpected result: {second_result:?}"
    );

    let retried = alice.upload_file(&second).await.expect("slot is free again");
    assert_eq!(retried, 1024);

    alice.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn file_list_reflects_server_store() {
    let state = AppState::new();
    state.store_file("b.txt", b"b".to_vec()).await;
    state.store_file("a.txt", b"a".to_vec()).await;
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let (alice, _events) = connected_client(&address, dir.path(), "alice").await;

    let first = alice.refresh_file_list().await.expect("first listing");
    assert_eq!(first.names(), ["a.txt".to_owned(), "b.txt".to_owned()]);

    state.store_file("c.txt", b"c".to_vec()).await;
    let second = alice.refresh_file_list().await.expect("second listing");
    let diff = second.diff(&first);
    assert_eq!(diff.added, vec!["c.txt".to_owned()]);
    assert!(diff.removed.is_empty());

    alice.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn received_message_is_in_history_when_the_event_arrives() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let alice_dir = tempfile::tempdir().expect("create alice dir");
    let bob_dir = tempfile::tempdir().expect("create bob dir");
    let (alice, mut alice_events) = connected_client(&address, alice_dir.path(), "alice").await;
    let (bob, _bob_events) = connected_client(&address, bob_dir.path(), "bob").await;

    bob.send_text("hola alice").await.expect("bob sends");
    let event = wait_for_event(&mut alice_events, |event| {
        matches!(event, SessionEvent::MessageArrived(_))
    })
    .await;
    let expected = ChatMessage::received("bob", "hola alice");
    assert_eq!(event, SessionEvent::MessageArrived(expected.clone()));
    assert_eq!(alice.history().await, vec![expected]);
    assert_eq!(
        bob.history().await,
        vec![ChatMessage::sent("bob", "hola alice")]
    );

    alice.stop().await;
    bob.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn own_echo_is_dropped_unless_the_filter_is_off() {
    let state = AppState::with_options(ServerOptions {
        echo_to_sender: true,
        ..ServerOptions::default()
    });
    let (address, shutdown_tx) = start_server(state.clone()).await;

    let filtered_dir = tempfile::tempdir().expect("create tempdir");
    let (filtered, mut filtered_events) =
        connected_client(&address, filtered_dir.path(), "alice").await;
    filtered.send_text("ping").await.expect("send ping");
    sleep(Duration::from_millis(300)).await;
    let seen = drain(&mut filtered_events).await;
    assert!(
        !seen
            .iter()
            .any(|event| matches!(event, SessionEvent::MessageArrived(_))),
        "echo was delivered: {seen:?}"
    );
    assert_eq!(filtered.history().await.len(), 1);
    filtered.stop().await;

    let open_dir = tempfile::tempdir().expect("create tempdir");
    let mut config = test_config(open_dir.path());
    config.filter_own_echo = false;
    let (open, mut open_events) = connected_with_config(&address, config, "carol").await;
    open.send_text("pong").await.expect("send pong");
    let event = wait_for_event(&mut open_events, |event| {
        matches!(event, SessionEvent::MessageArrived(_))
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::MessageArrived(ChatMessage::received("carol", "pong"))
    );

    open.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn pushed_file_lands_in_the_incoming_directory() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let (alice, mut events) = connected_client(&address, dir.path(), "alice").await;

    let data = vec![42_u8; 5000];
    state
        .push_file("alice", "notes.txt", &data)
        .await
        .expect("push to alice");

    let event = wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::FileArrived(_))
    })
    .await;
    let SessionEvent::FileArrived(file) = event else {
        unreachable!("filtered above");
    };
    assert_eq!(file.file_name, "notes.txt");
    assert_eq!(file.size, 5000);
    assert_eq!(file.path, dir.path().join("incoming").join("notes.txt"));
    assert_eq!(std::fs::read(&file.path).expect("read pushed file"), data);

    alice.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unread_counter_notifies_only_while_unfocused() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let alice_dir = tempfile::tempdir().expect("create alice dir");
    let bob_dir = tempfile::tempdir().expect("create bob dir");

    let notifier = Arc::new(RecordingNotifier::default());
    HistoryStore::new(alice_dir.path())
        .save_user_name("alice")
        .expect("save alice");
    let (alice, mut alice_events) = SessionController::new(test_config(alice_dir.path()));
    let alice = alice.with_notifier(notifier.clone());
    alice.start(&address).await.expect("alice starts");
    wait_for_event(&mut alice_events, |event| {
        matches!(event, SessionEvent::Connected { .. })
    })
    .await;
    let (bob, _bob_events) = connected_client(&address, bob_dir.path(), "bob").await;

    bob.send_text("seen").await.expect("send while focused");
    wait_for_event(&mut alice_events, |event| {
        matches!(event, SessionEvent::MessageArrived(_))
    })
    .await;
    assert_eq!(alice.unread(), 0);

    alice.set_focused(false);
    for text in ["one", "two"] {
        bob.send_text(text).await.expect("send while away");
        wait_for_event(&mut alice_events, |event| {
            matches!(event, SessionEvent::MessageArrived(_))
        })
        .await;
    }
    assert_eq!(alice.unread(), 2);
    assert_eq!(
        notifier.calls(),
        vec!["1 new messages".to_owned(), "2 new messages".to_owned()]
    );

    alice.set_focused(true);
    assert_eq!(alice.unread(), 0);

    alice.stop().await;
    bob.stop().await;
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn stop_closes_without_a_disconnected_event() {
    let state = AppState::new();
    let (address, shutdown_tx) = start_server(state.clone()).await;
    let dir = tempfile::tempdir().expect("create tempdir");
    let (alice, mut events) = connected_client(&address, dir.path(), "alice").await;
    assert_eq!(
        alice.session().map(|session| session.user_name),
        Some("alice".to_owned())
    );

    alice.stop().await;
    assert_eq!(alice.state(), ConnectionState::Disconnected);
    assert!(matches!(
        alice.send_text("too late").await,
        Err(SessionError::NotStarted)
    ));

    sleep(Duration::from_millis(200)).await;
    let after = drain(&mut events).await;
    assert!(
        !after.contains(&SessionEvent::Disconnected),
        "unexpected events after stop: {after:?}"
    );

    let _ = shutdown_tx.send(());
}

#[derive(Default)]
struct RecordingNotifier {
    bodies: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn calls(&self) -> Vec<String> {
        self.bodies.lock().expect("notifier lock").clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, _title: &str, body: &str) {
        self.bodies.lock().expect("notifier lock").push(body.to_owned());
    }
}

async fn start_server(state: AppState) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral server socket");
    let address = listener.local_addr().expect("server local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let _ = serve_with_shutdown(listener, state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    (address.to_string(), shutdown_tx)
}

fn test_config(dir: &Path) -> SessionConfig {
    let mut config = SessionConfig::new(dir);
    config.name_grace = Duration::from_millis(150);
    config
}

async fn connected_client(
    address: &str,
    dir: &Path,
    name: &str,
) -> (SessionController, UnboundedReceiver<SessionEvent>) {
    connected_with_config(address, test_config(dir), name).await
}

async fn connected_with_config(
    address: &str,
    config: SessionConfig,
    name: &str,
) -> (SessionController, UnboundedReceiver<SessionEvent>) {
    HistoryStore::new(&config.data_dir)
        .save_user_name(name)
        .expect("save user name");
    let (controller, mut events) = SessionController::new(config);
    controller.start(address).await.expect("session starts");
    let connected = wait_for_event(&mut events, |event| {
        matches!(event, SessionEvent::Connected { .. })
    })
    .await;
    assert_eq!(
        connected,
        SessionEvent::Connected {
            user_name: name.to_owned()
        }
    );
    (controller, events)
}

async fn wait_for_event<F>(events: &mut UnboundedReceiver<SessionEvent>, wanted: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event arrives")
}

async fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    tokio::task::yield_now().await;
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn wait_for_stored(state: &AppState, name: &str) {
    timeout(Duration::from_secs(3), async {
        while state.file_contents(name).await.is_none() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("server stores the upload");
}
