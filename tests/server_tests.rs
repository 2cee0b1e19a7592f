//! Integration tests for the server module

use procraft::client::Client;
use procraft::config::OperatorConfig;
use procraft::controller::{ControllerOptions, ControllerSet};
use procraft::protocol::{recv, send, ClientMessage, ServerMessage, PROTOCOL_VERSION};
use procraft::server::ServerListener;
use procraft::transport::{MemoryRemote, MemoryTransport};
use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct TestServer {
    socket_path: PathBuf,
    handle: JoinHandle<anyhow::Result<()>>,
    _shutdown: mpsc::Sender<()>,
    remotes: BTreeMap<&'static str, MemoryRemote>,
    _dir: TempDir,
}

fn operator(permissions: &[&str]) -> OperatorConfig {
    OperatorConfig {
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        ..Default::default()
    }
}

/// Two connected controllers; `alice` may use alpha, `root` may use both and
/// stop the server.
async fn start_server() -> TestServer {
    start_server_with(BTreeMap::new()).await
}

async fn start_server_with(extra_operators: BTreeMap<String, OperatorConfig>) -> TestServer {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("procraft.sock");

    let mut controllers = ControllerSet::default();
    let mut remotes = BTreeMap::new();
    for name in ["alpha", "beta"] {
        let (transport, mut sessions) = MemoryTransport::new();
        let options = ControllerOptions::new(name, Arc::new(transport))
            .with_command_delay(Duration::from_millis(20));
        let controller = controllers.create(options).unwrap();
        controller.connect().await.unwrap();
        remotes.insert(name, sessions.recv().await.unwrap());
    }

    let mut operators = BTreeMap::new();
    operators.insert("alice".to_string(), operator(&["controllers.alpha"]));
    operators.insert(
        "root".to_string(),
        operator(&["controllers.alpha", "controllers.beta", "server.shutdown"]),
    );
    operators.extend(extra_operators);

    let server = ServerListener::new(socket_path.clone(), Arc::new(controllers), operators);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let handle = tokio::spawn(async move { server.run(shutdown_rx).await });

    for _ in 0..100 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(socket_path.exists(), "server did not bind its socket");

    TestServer {
        socket_path,
        handle,
        _shutdown: shutdown_tx,
        remotes,
        _dir: dir,
    }
}

async fn next_message(stream: &mut UnixStream) -> ServerMessage {
    timeout(Duration::from_secs(2), recv::<ServerMessage, _>(stream))
        .await
        .expect("server replied in time")
        .expect("valid frame")
        .expect("connection open")
}

/// Connect and say Hello, returning the stream and the Hello reply
async fn raw_session(server: &TestServer, name: &str) -> (UnixStream, ServerMessage) {
    let mut stream = UnixStream::connect(&server.socket_path).await.unwrap();
    match next_message(&mut stream).await {
        ServerMessage::Welcome {
            protocol_version, ..
        } => assert_eq!(protocol_version, PROTOCOL_VERSION),
        other => panic!("Expected Welcome, got {:?}", other),
    }
    send(
        &mut stream,
        &ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            operator: name.to_string(),
        },
    )
    .await
    .unwrap();
    let reply = next_message(&mut stream).await;
    (stream, reply)
}

async fn read_input(remote: &mut MemoryRemote) -> Vec<u8> {
    let mut buf = [0u8; 256];
    let n = timeout(Duration::from_secs(2), remote.input.read(&mut buf))
        .await
        .expect("input arrived in time")
        .unwrap();
    buf[..n].to_vec()
}

#[tokio::test]
async fn test_hello_is_acknowledged() {
    let server = start_server().await;
    let (_stream, reply) = raw_session(&server, "alice").await;
    assert!(matches!(reply, ServerMessage::Ack { .. }), "got {:?}", reply);
}

#[tokio::test]
async fn test_unknown_operator_rejected() {
    let server = start_server().await;
    let (_stream, reply) = raw_session(&server, "mallory").await;
    match reply {
        ServerMessage::Error { message } => assert!(message.contains("Unknown operator")),
        other => panic!("Expected Error, got {:?}", other),
    }

    assert!(Client::connect(&server.socket_path, "mallory").await.is_err());
}

#[tokio::test]
async fn test_requests_need_hello() {
    let server = start_server().await;
    let mut stream = UnixStream::connect(&server.socket_path).await.unwrap();
    let _welcome = next_message(&mut stream).await;

    send(&mut stream, &ClientMessage::ListControllers).await.unwrap();
    match next_message(&mut stream).await {
        ServerMessage::Error { message } => assert!(message.contains("Hello")),
        other => panic!("Expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_list_only_shows_permitted_controllers() {
    let server = start_server().await;

    let mut alice = Client::connect(&server.socket_path, "alice").await.unwrap();
    let names: Vec<String> = alice.list().await.unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["alpha".to_string()]);

    let mut root = Client::connect(&server.socket_path, "root").await.unwrap();
    let names: Vec<String> = root.list().await.unwrap().into_iter().map(|c| c.name).collect();
    assert_eq!(names, vec!["alpha".to_string(), "beta".to_string()]);
}

#[tokio::test]
async fn test_run_reaches_the_session() {
    let mut server = start_server().await;
    let mut alice = Client::connect(&server.socket_path, "alice").await.unwrap();

    alice.run("alpha", "uptime").await.unwrap();

    let remote = server.remotes.get_mut("alpha").unwrap();
    assert_eq!(read_input(remote).await, b"uptime\n");
}

#[tokio::test]
async fn test_forbidden_controller_looks_missing() {
    let server = start_server().await;
    let mut alice = Client::connect(&server.socket_path, "alice").await.unwrap();

    let err = alice.run("beta", "uptime").await.unwrap_err();
    assert!(err.to_string().contains("No such controller"));
    let err = alice.attach("gamma").await.unwrap_err();
    assert!(err.to_string().contains("No such controller"));
}

#[tokio::test]
async fn test_attach_relays_both_directions() {
    let mut server = start_server().await;
    let (mut stream, _) = raw_session(&server, "alice").await;

    send(
        &mut stream,
        &ClientMessage::Attach {
            controller: "alpha".to_string(),
        },
    )
    .await
    .unwrap();
    assert!(matches!(
        next_message(&mut stream).await,
        ServerMessage::Attached { controller } if controller == "alpha"
    ));

    let remote = server.remotes.get_mut("alpha").unwrap();
    remote.stdout.write_all(b"login: ").await.unwrap();
    match next_message(&mut stream).await {
        ServerMessage::Output {
            controller, data, ..
        } => {
            assert_eq!(controller, "alpha");
            assert_eq!(data, b"login: ");
        }
        other => panic!("Expected Output, got {:?}", other),
    }

    send(
        &mut stream,
        &ClientMessage::Input {
            data: b"ls\n".to_vec(),
        },
    )
    .await
    .unwrap();
    assert_eq!(read_input(remote).await, b"ls\n");

    send(&mut stream, &ClientMessage::Detach).await.unwrap();
    assert!(matches!(
        next_message(&mut stream).await,
        ServerMessage::Detached
    ));
    send(&mut stream, &ClientMessage::ListControllers).await.unwrap();
    match next_message(&mut stream).await {
        ServerMessage::ControllerList { controllers } => {
            assert!(!controllers[0].is_attached);
            assert_eq!(controllers[0].viewers, 0);
        }
        other => panic!("Expected ControllerList, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reconnect_refused_while_ready() {
    let server = start_server().await;
    let mut root = Client::connect(&server.socket_path, "root").await.unwrap();

    let err = root.reconnect("beta").await.unwrap_err();
    assert!(err.to_string().contains("ready"));
}

#[tokio::test]
async fn test_shutdown_requires_permission() {
    let server = start_server().await;

    let mut alice = Client::connect(&server.socket_path, "alice").await.unwrap();
    assert!(alice.shutdown().await.is_err());

    let mut root = Client::connect(&server.socket_path, "root").await.unwrap();
    root.shutdown().await.unwrap();

    let result = timeout(Duration::from_secs(2), server.handle)
        .await
        .expect("server stopped in time")
        .unwrap();
    assert!(result.is_ok());
    assert!(!server.socket_path.exists());
}

#[tokio::test]
async fn test_second_hello_cannot_switch_operator() {
    let mut server = start_server().await;
    let (mut stream, reply) = raw_session(&server, "root").await;
    assert!(matches!(reply, ServerMessage::Ack { .. }));

    send(
        &mut stream,
        &ClientMessage::Attach {
            controller: "beta".to_string(),
        },
    )
    .await
    .unwrap();
    assert!(matches!(
        next_message(&mut stream).await,
        ServerMessage::Attached { .. }
    ));

    send(
        &mut stream,
        &ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            operator: "alice".to_string(),
        },
    )
    .await
    .unwrap();
    match next_message(&mut stream).await {
        ServerMessage::Error { message } => assert!(message.contains("Already authenticated as 'root'")),
        other => panic!("Expected Error, got {:?}", other),
    }

    // Still root: both controllers listed and the hook on beta intact.
    send(&mut stream, &ClientMessage::ListControllers).await.unwrap();
    match next_message(&mut stream).await {
        ServerMessage::ControllerList { controllers } => {
            assert_eq!(controllers.len(), 2);
            assert!(controllers[1].is_attached);
        }
        other => panic!("Expected ControllerList, got {:?}", other),
    }
    send(
        &mut stream,
        &ClientMessage::Input {
            data: b"id\n".to_vec(),
        },
    )
    .await
    .unwrap();
    let remote = server.remotes.get_mut("beta").unwrap();
    assert_eq!(read_input(remote).await, b"id\n");
}

#[tokio::test]
async fn test_operator_bound_to_peer_uid() {
    let owned_dir = tempdir().unwrap();
    let uid = std::fs::metadata(owned_dir.path()).unwrap().uid();

    let mut extra = BTreeMap::new();
    extra.insert(
        "mine".to_string(),
        OperatorConfig {
            uid: Some(uid),
            ..operator(&["controllers.alpha"])
        },
    );
    extra.insert(
        "theirs".to_string(),
        OperatorConfig {
            uid: Some(uid.wrapping_add(1)),
            ..operator(&["controllers.alpha"])
        },
    );
    let server = start_server_with(extra).await;

    let mut mine = Client::connect(&server.socket_path, "mine").await.unwrap();
    assert_eq!(mine.list().await.unwrap().len(), 1);

    let err = Client::connect(&server.socket_path, "theirs")
        .await
        .err()
        .expect("uid mismatch rejected");
    assert!(err.to_string().contains("not available"));
}
