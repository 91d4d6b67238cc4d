//! End-to-end tests over real loopback TCP.
//!
//! Every test starts its own server (or listener) on an ephemeral port and
//! talks to it through the public API only.

use orchestra_types::message::{
    CriticalException, LogLevel, LogMessage, MessageBody, Ping, TestEvent,
};
use orchestra_types::{ClientIdentity, ClientRole, OrchestrationConfig};
use orchestra_wire::{
    connect_client, start_server, AnyMessage, MessageRegistry, OrchestrationClient,
    OrchestrationHandle, OrchestrationListener, OrchestrationServer, StateError, StateId,
    StateValue, WireError,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_test::{assert_err, assert_ok};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Counter {
    value: u64,
}

impl StateValue for Counter {
    const TYPE_NAME: &'static str = "test.Counter";

    fn default_value() -> Self {
        Counter { value: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Blob {
    bytes: Vec<u8>,
}

impl StateValue for Blob {
    const TYPE_NAME: &'static str = "test.Blob";

    fn default_value() -> Self {
        Blob { bytes: Vec::new() }
    }
}

fn config() -> OrchestrationConfig {
    OrchestrationConfig::default()
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

async fn client(server: &OrchestrationServer, role: ClientRole) -> OrchestrationClient {
    connect_client(server.port(), role).await.unwrap()
}

/// The server registers a connection shortly after the client's handshake
/// completes; wait until it has.
async fn wait_for_clients(server: &OrchestrationServer, count: usize) {
    within(async {
        while server.connection_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
}

fn log(text: &str) -> LogMessage {
    LogMessage {
        tag: "test".into(),
        level: LogLevel::Info,
        message: text.into(),
    }
}

fn log_text(message: &AnyMessage) -> Option<String> {
    message.body::<LogMessage>().map(|m| m.message.clone())
}

// ---------------------------------------------------------------------------
// Connections directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_directory_tracks_clients() {
    let server = start_server(config()).await.unwrap();
    let mut directory = server.connections().await.unwrap();
    assert!(directory.value().is_empty());

    let a = client(&server, ClientRole::Tooling).await;
    let b = client(&server, ClientRole::Application).await;
    let a_id = a.identity().unwrap().client_id;
    let b_id = b.identity().unwrap().client_id;

    let both = within(directory.wait_for(|d| d.len() == 2)).await.unwrap();
    let a_entry = both.get(a_id).unwrap();
    assert_eq!(a_entry.client_role, ClientRole::Tooling);
    assert_eq!(a_entry.client_pid, std::process::id());
    assert_eq!(both.get(b_id).unwrap().client_role, ClientRole::Application);

    // The clients' own mirrors converge to the same set.
    let mut seen_by_a = a.connections().await.unwrap();
    within(seen_by_a.wait_for(|d| d == &both)).await.unwrap();

    b.close().await;
    let only_a = within(directory.wait_for(|d| d.len() == 1)).await.unwrap();
    assert!(only_a.contains(a_id));
    assert!(!only_a.contains(b_id));
    within(seen_by_a.wait_for(|d| d == &only_a)).await.unwrap();

    a.close().await;
    within(directory.wait_for(|d| d.is_empty())).await.unwrap();
    wait_for_clients(&server, 0).await;

    server.close().await;
}

#[tokio::test]
async fn test_connection_infos() {
    let server = start_server(config()).await.unwrap();
    let a = client(&server, ClientRole::Compiler).await;
    wait_for_clients(&server, 1).await;

    let infos = server.connection_infos();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].entry.client_id, a.identity().unwrap().client_id);
    assert_eq!(infos[0].entry.client_role, ClientRole::Compiler);
    assert!(infos[0].address.ip().is_loopback());

    server.close().await;
}

#[tokio::test]
async fn test_shared_identity_keeps_entry_until_last_close() {
    let server = start_server(config()).await.unwrap();
    let dial = OrchestrationConfig {
        port: server.port(),
        ..config()
    };
    let identity = ClientIdentity::current(ClientRole::Tooling);
    let first = OrchestrationClient::connect_as(&dial, identity.clone())
        .await
        .unwrap();
    let second = OrchestrationClient::connect_as(&dial, identity.clone())
        .await
        .unwrap();
    wait_for_clients(&server, 2).await;

    let mut directory = server.connections().await.unwrap();
    let shared = within(directory.wait_for(|d| d.contains(identity.client_id)))
        .await
        .unwrap();
    assert_eq!(shared.len(), 1);

    first.close().await;
    wait_for_clients(&server, 1).await;
    // A fresh read is ordered after the server processed the disconnect.
    let after_first = server.connections().await.unwrap().value();
    assert!(after_first.contains(identity.client_id));
    assert!(second.is_active());

    second.close().await;
    within(directory.wait_for(|d| d.is_empty())).await.unwrap();

    server.close().await;
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let server = start_server(config()).await.unwrap();
    let mut at_server = server.subscribe();
    let a = client(&server, ClientRole::Tooling).await;
    let mut at_client = a.subscribe();
    wait_for_clients(&server, 1).await;

    assert_ok!(a.send(log("A")).await);
    assert_ok!(a.send(log("B")).await);
    let first = within(at_server.recv()).await.unwrap();
    let second = within(at_server.recv()).await.unwrap();
    assert_eq!(log_text(&first).as_deref(), Some("A"));
    assert_eq!(log_text(&second).as_deref(), Some("B"));

    assert_ok!(server.send(log("A")).await);
    assert_ok!(server.send(log("B")).await);
    assert_eq!(
        log_text(&within(at_client.recv()).await.unwrap()).as_deref(),
        Some("A")
    );
    assert_eq!(
        log_text(&within(at_client.recv()).await.unwrap()).as_deref(),
        Some("B")
    );

    server.close().await;
}

#[tokio::test]
async fn test_oversized_send_fails_locally() {
    let small = OrchestrationConfig {
        max_frame_size: 1024,
        ..config()
    };
    let server = start_server(small.clone()).await.unwrap();
    let mut at_server = server.subscribe();
    let a = OrchestrationClient::connect(
        &OrchestrationConfig {
            port: server.port(),
            ..small
        },
        ClientRole::Tooling,
    )
    .await
    .unwrap();
    let mut at_client = a.subscribe();
    wait_for_clients(&server, 1).await;

    let big = TestEvent {
        payload: vec![7; 4096],
    };
    match a.send(big.clone()).await {
        Err(WireError::FrameTooLarge { size, max }) => {
            assert!(size > 1024);
            assert_eq!(max, 1024);
        }
        other => panic!("Expected FrameTooLarge, got {other:?}"),
    }
    assert!(matches!(
        server.send(big).await,
        Err(WireError::FrameTooLarge { .. })
    ));

    // A state value over the limit is refused before it leaves the mirror.
    let blob = StateId::<Blob>::new();
    assert!(matches!(
        a.states()
            .update(&blob, |_| Blob {
                bytes: vec![1; 4096]
            })
            .await,
        Err(StateError::Encode(_))
    ));

    // Nothing was written, so the connection is still usable both ways.
    assert!(a.is_active());
    assert_ok!(a.send(log("after")).await);
    assert_eq!(
        log_text(&within(at_server.recv()).await.unwrap()).as_deref(),
        Some("after")
    );
    assert_ok!(server.send(log("back")).await);
    assert_eq!(
        log_text(&within(at_client.recv()).await.unwrap()).as_deref(),
        Some("back")
    );
    let counter = StateId::<Counter>::new();
    let updated = a
        .states()
        .update(&counter, |c| Counter { value: c.value + 1 })
        .await
        .unwrap();
    assert_eq!(updated.value, 1);

    server.close().await;
}

#[tokio::test]
async fn test_broadcast_and_union_subscribe() {
    let server = start_server(config()).await.unwrap();
    let mut at_server = server.subscribe();
    let a = client(&server, ClientRole::Tooling).await;
    let b = client(&server, ClientRole::Application).await;
    let mut pings_at_a = a.subscribe_to::<Ping>();
    let mut pings_at_b = b.subscribe_to::<Ping>();
    wait_for_clients(&server, 2).await;

    let from_a = a.send(log("from a")).await.unwrap();
    let from_b = b.send(log("from b")).await.unwrap();
    let mut received = vec![
        within(at_server.recv()).await.unwrap().message_id().unwrap(),
        within(at_server.recv()).await.unwrap().message_id().unwrap(),
    ];
    received.sort_by_key(|id| id.to_string());
    let mut expected = vec![from_a, from_b];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(received, expected);

    let ping = server.send(Ping).await.unwrap();
    assert_eq!(within(pings_at_a.recv()).await.unwrap().0, ping);
    assert_eq!(within(pings_at_b.recv()).await.unwrap().0, ping);

    server.close().await;
}

#[tokio::test]
async fn test_filtered_subscription() {
    let server = start_server(config()).await.unwrap();
    let mut errors = server.subscribe_filtered(|m| {
        m.body::<LogMessage>()
            .is_some_and(|log| log.level == LogLevel::Error)
    });
    let a = client(&server, ClientRole::Application).await;

    a.send(log("fine")).await.unwrap();
    a.send(LogMessage {
        tag: "test".into(),
        level: LogLevel::Error,
        message: "broken".into(),
    })
    .await
    .unwrap();

    let only = within(errors.recv()).await.unwrap();
    assert_eq!(log_text(&only).as_deref(), Some("broken"));

    server.close().await;
}

#[tokio::test]
async fn test_server_close_reaches_client() {
    let server = start_server(config()).await.unwrap();
    let a = client(&server, ClientRole::Tooling).await;
    let mut inbox = a.subscribe();
    wait_for_clients(&server, 1).await;

    server.close().await;
    within(a.closed()).await;
    assert!(!a.is_active());
    assert!(!server.is_active());
    assert!(within(inbox.recv()).await.is_none());

    match a.send(Ping).await {
        Err(WireError::ConnectionClosed) => {}
        other => panic!("Expected ConnectionClosed, got {other:?}"),
    }
    assert_err!(server.send(Ping).await);
}

#[tokio::test]
async fn test_opaque_message_is_forwarded() {
    // A server built before CriticalException existed.
    let mut older = MessageRegistry::with_defaults();
    older.unregister(&CriticalException::CLASSIFIER);
    let server = OrchestrationServer::start_with_registry(config(), older)
        .await
        .unwrap();
    let mut at_server = server.subscribe();

    let sender = client(&server, ClientRole::Application).await;
    let receiver = client(&server, ClientRole::Tooling).await;
    let mut at_receiver = receiver.subscribe_to::<CriticalException>();
    wait_for_clients(&server, 2).await;

    let crash = CriticalException {
        client_role: ClientRole::Application,
        message: Some("stack overflow".into()),
        exception_class_name: None,
        stacktrace: vec!["main".into()],
    };
    let id = sender.send(crash.clone()).await.unwrap();

    let opaque = within(at_server.recv()).await.unwrap();
    assert!(opaque.is_opaque());
    assert_ok!(server.send_message(opaque).await);

    let (forwarded_id, forwarded) = within(at_receiver.recv()).await.unwrap();
    assert_eq!(forwarded_id, id);
    assert_eq!(forwarded, crash);

    server.close().await;
}

#[tokio::test]
async fn test_bad_handshake_does_not_stop_server() {
    let server = start_server(OrchestrationConfig {
        handshake_timeout_ms: 200,
        ..config()
    })
    .await
    .unwrap();

    // Silent peer: dropped after the handshake timeout.
    let mut silent = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = within(silent.read(&mut buf)).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    // Peer that opens with an ordinary frame instead of a handshake.
    let mut rude = TcpStream::connect(server.local_addr()).await.unwrap();
    rude.write_all(&[0, 0, 0, 0, 1]).await.unwrap();
    let read = within(rude.read(&mut buf)).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    let a = client(&server, ClientRole::Tooling).await;
    wait_for_clients(&server, 1).await;
    assert!(a.is_active());

    server.close().await;
}

// ---------------------------------------------------------------------------
// Replicated state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_updates_converge() {
    const N: u64 = 25;
    let server = start_server(config()).await.unwrap();
    let contended = OrchestrationConfig {
        port: server.port(),
        cas: orchestra_types::CasConfig {
            max_attempts: 1_000,
            ..Default::default()
        },
        ..config()
    };
    let a = OrchestrationClient::connect(&contended, ClientRole::Tooling)
        .await
        .unwrap();
    let b = OrchestrationClient::connect(&contended, ClientRole::Application)
        .await
        .unwrap();
    let id = StateId::<Counter>::new();

    let increment = |peer: &OrchestrationClient| {
        let peer_states = peer.states().clone();
        let id = id.clone();
        async move {
            for _ in 0..N {
                peer_states
                    .update(&id, |c| Counter { value: c.value + 1 })
                    .await
                    .unwrap();
            }
        }
    };
    within(async { tokio::join!(increment(&a), increment(&b)) }).await;

    assert_eq!(server.states().value(&id).await.unwrap().value, 2 * N);
    for peer in [&a, &b] {
        let mut cell = peer.states().get(&id).await.unwrap();
        within(cell.wait_for(|c| c.value == 2 * N)).await.unwrap();
    }

    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_update_retries_against_new_value() {
    let server = start_server(config()).await.unwrap();
    let a = Arc::new(client(&server, ClientRole::Tooling).await);
    let b = Arc::new(client(&server, ClientRole::Application).await);
    let id = StateId::<Counter>::named("cas");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let task = {
        let (a, b, id, seen) = (a.clone(), b.clone(), id.clone(), seen.clone());
        tokio::spawn(async move {
            a.states()
                .update(&id, |current| {
                    let first = {
                        let mut seen = seen.lock().unwrap();
                        seen.push(current.value);
                        seen.len() == 1
                    };
                    if first {
                        // B wins the race while A is still computing.
                        let handle = tokio::runtime::Handle::current();
                        tokio::task::block_in_place(|| {
                            handle.block_on(b.states().update(&id, |_| Counter { value: 10 }))
                        })
                        .unwrap();
                    }
                    Counter {
                        value: current.value + 1,
                    }
                })
                .await
        })
    };

    let result = within(task).await.unwrap().unwrap();
    assert_eq!(result.value, 11);
    assert_eq!(*seen.lock().unwrap(), vec![0, 10]);
    assert_eq!(server.states().value(&id).await.unwrap().value, 11);

    server.close().await;
}

#[tokio::test]
async fn test_noop_update_still_notifies() {
    let server = start_server(config()).await.unwrap();
    let a = client(&server, ClientRole::Tooling).await;
    let b = client(&server, ClientRole::Application).await;
    let id = StateId::<Counter>::named("noop");

    let mut at_b = b.states().get(&id).await.unwrap();
    a.states()
        .update(&id, |_| Counter { value: 1 })
        .await
        .unwrap();
    within(at_b.wait_for(|c| c.value == 1)).await.unwrap();

    a.states().update(&id, |same| same).await.unwrap();
    let after = within(at_b.changed()).await.unwrap();
    assert_eq!(after.value, 1);

    server.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_contention_exhausted() {
    let server = Arc::new(start_server(config()).await.unwrap());
    let single_shot = OrchestrationConfig {
        port: server.port(),
        cas: orchestra_types::CasConfig {
            max_attempts: 1,
            ..Default::default()
        },
        ..config()
    };
    let a = OrchestrationClient::connect(&single_shot, ClientRole::Tooling)
        .await
        .unwrap();
    let id = StateId::<Counter>::named("exhausted");

    let task = {
        let (server, id) = (server.clone(), id.clone());
        tokio::spawn(async move {
            a.states()
                .update(&id, |c| {
                    // The authority moves on under A's feet, every time.
                    let handle = tokio::runtime::Handle::current();
                    tokio::task::block_in_place(|| {
                        handle.block_on(
                            server
                                .states()
                                .update(&id, |c| Counter { value: c.value + 100 }),
                        )
                    })
                    .unwrap();
                    Counter { value: c.value + 1 }
                })
                .await
        })
    };

    match within(task).await.unwrap() {
        Err(StateError::ContentionExhausted { attempts }) => assert_eq!(attempts, 1),
        other => panic!("Expected ContentionExhausted, got {other:?}"),
    }
    assert_eq!(server.states().value(&id).await.unwrap().value, 100);

    server.close().await;
}

#[tokio::test]
async fn test_state_fails_after_close() {
    let server = start_server(config()).await.unwrap();
    let a = client(&server, ClientRole::Tooling).await;
    let id = StateId::<Counter>::new();
    let mut cell = a.states().get(&id).await.unwrap();

    a.close().await;
    assert!(matches!(
        within(cell.wait_for(|_| false)).await,
        Err(StateError::EngineStopped)
    ));
    assert!(a
        .states()
        .update(&id, |c| Counter { value: c.value + 1 })
        .await
        .is_err());

    server.close().await;
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_listener_hands_out_independent_clients() {
    let listener = OrchestrationListener::bind(&config()).await.unwrap();
    let dialer = connect_client(listener.port(), ClientRole::Application)
        .await
        .unwrap();
    let accepted = within(listener.accept()).await.unwrap();
    assert!(accepted.identity().is_none());
    assert_eq!(
        accepted.connection().client_identity(),
        dialer.identity()
    );

    listener.close();
    assert!(within(listener.accept()).await.is_none());

    // The accepted client outlives its listener.
    assert!(accepted.is_active());
    let mut inbox = accepted.subscribe();
    let id = dialer.send(Ping).await.unwrap();
    assert_eq!(within(inbox.recv()).await.unwrap().message_id(), Some(id));

    let mut replies = dialer.subscribe();
    assert_ok!(accepted.send(log("still here")).await);
    assert_eq!(
        log_text(&within(replies.recv()).await.unwrap()).as_deref(),
        Some("still here")
    );

    // The accepting side owns the state it shares with the dialer.
    let counter = StateId::<Counter>::new();
    dialer
        .states()
        .update(&counter, |c| Counter { value: c.value + 3 })
        .await
        .unwrap();
    assert_eq!(accepted.states().value(&counter).await.unwrap().value, 3);

    dialer.close().await;
    within(accepted.closed()).await;
}
