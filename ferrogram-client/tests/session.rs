mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Answer, ECHO, FakeServer, HOME, echo, echoed, eventually};
use ferrogram_client::{Client, InvocationError};
use tokio::time::Instant;

fn flood_then_ok(seconds: u32) -> FakeServer {
    let attempts = Arc::new(AtomicUsize::new(0));
    FakeServer::new(move |call| {
        if call.constructor() != ECHO {
            return Answer::error(400, "UNEXPECTED");
        }
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Answer::error(420, &format!("FLOOD_WAIT_{seconds}"))
        } else {
            Answer::Ok(echoed(call).to_le_bytes().to_vec())
        }
    })
}

#[tokio::test(start_paused = true)]
async fn short_flood_wait_is_slept_through() {
    let server = flood_then_ok(5);
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let started = Instant::now();
    let answer = client.invoke(&echo(7)).await.unwrap();
    assert_eq!(answer.0, 7i32.to_le_bytes());
    assert!(started.elapsed() >= Duration::from_secs(5), "retried after {:?}", started.elapsed());

    let sent = server.calls_of(ECHO);
    assert_eq!(sent.len(), 2);
    assert_eq!(echoed(&sent[0]), echoed(&sent[1]));
}

#[tokio::test(start_paused = true)]
async fn long_flood_wait_is_surfaced() {
    let server = flood_then_ok(30);
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let started = Instant::now();
    let err = client.invoke(&echo(7)).await.unwrap_err();
    assert!(matches!(err, InvocationError::FloodWait(d) if d == Duration::from_secs(30)), "{err:?}");
    assert_eq!(err.flood_wait(), Some(Duration::from_secs(30)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(server.calls_of(ECHO).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_is_resent_with_the_same_msg_id() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let server = FakeServer::new(move |call| match attempts.fetch_add(1, Ordering::SeqCst) {
        0 => Answer::Silent,
        _ => Answer::Ok(echoed(call).to_le_bytes().to_vec()),
    });
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let answer = client.invoke(&echo(11)).await.unwrap();
    assert_eq!(answer.0, 11i32.to_le_bytes());

    let sent = server.calls_of(ECHO);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].msg_id, sent[1].msg_id);
}

/// Answers the first `ECHO` with `first`, later ones with the echoed value.
fn first_then_echo(first: impl Fn(&common::Call) -> Answer + Send + Sync + 'static) -> FakeServer {
    let attempts = Arc::new(AtomicUsize::new(0));
    FakeServer::new(move |call| match attempts.fetch_add(1, Ordering::SeqCst) {
        0 => first(call),
        _ => Answer::Ok(echoed(call).to_le_bytes().to_vec()),
    })
}

#[tokio::test(start_paused = true)]
async fn pending_requests_are_replayed_after_a_reconnect() {
    let server = first_then_echo(|_| Answer::Silent);
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.invoke(&echo(21)).await }
    });
    eventually(|| server.calls_of(ECHO).len() == 1).await;
    server.disconnect(HOME);

    let answer = call.await.unwrap().unwrap();
    assert_eq!(answer.0, 21i32.to_le_bytes());
    assert_eq!(server.connections(), vec![HOME, HOME]);
    let sent = server.calls_of(ECHO);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].msg_id, sent[1].msg_id);
}

#[tokio::test(start_paused = true)]
async fn new_server_salt_is_adopted() {
    let server = FakeServer::new(|call| Answer::Ok(echoed(call).to_le_bytes().to_vec()));
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();
    server.require_salt(0x77);

    let answer = client.invoke(&echo(9)).await.unwrap();
    assert_eq!(answer.0, 9i32.to_le_bytes());
    // The first attempt never reached the handler.
    let sent = server.calls_of(ECHO);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].salt, 0x77);

    client.invoke(&echo(10)).await.unwrap();
    assert!(server.calls_of(ECHO).iter().all(|c| c.salt == 0x77));
}

#[tokio::test(start_paused = true)]
async fn msg_id_out_of_range_gets_a_fresh_id() {
    for code in [16, 17] {
        let server = first_then_echo(move |call| Answer::bad_msg(call, code));
        let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

        let answer = client.invoke(&echo(4)).await.unwrap();
        assert_eq!(answer.0, 4i32.to_le_bytes());
        let sent = server.calls_of(ECHO);
        assert_eq!(sent.len(), 2);
        assert!(sent[1].msg_id > sent[0].msg_id, "code {code}");
        assert_eq!(sent[0].session_id, sent[1].session_id);
    }
}

#[tokio::test(start_paused = true)]
async fn bad_seq_no_starts_a_new_session() {
    for code in [32, 33] {
        let server = first_then_echo(move |call| Answer::bad_msg(call, code));
        let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

        let answer = client.invoke(&echo(6)).await.unwrap();
        assert_eq!(answer.0, 6i32.to_le_bytes());
        let sent = server.calls_of(ECHO);
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].session_id, sent[1].session_id, "code {code}");
        assert_ne!(sent[0].msg_id, sent[1].msg_id);
        // Same connection throughout.
        assert_eq!(server.connections().len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn other_bad_msg_codes_fail_the_request() {
    let server = first_then_echo(|call| Answer::bad_msg(call, 64));
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let err = client.invoke(&echo(1)).await.unwrap_err();
    assert!(matches!(err, InvocationError::BadMessage(64)), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn answers_are_matched_by_msg_id() {
    let server = FakeServer::new(|call| Answer::Ok((echoed(call) * 2).to_le_bytes().to_vec()));
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let calls = (0..20).map(|i| {
        let client = client.clone();
        async move { (i, client.invoke(&echo(i)).await.unwrap()) }
    });
    for (i, answer) in futures::future::join_all(calls).await {
        assert_eq!(answer.0, (i * 2).to_le_bytes());
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_is_not_resent() {
    let server = FakeServer::new(|_| Answer::Silent);
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let gave_up = tokio::time::timeout(Duration::from_secs(1), client.invoke(&echo(1))).await;
    assert!(gave_up.is_err());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(server.calls_of(ECHO).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn session_string_round_trips() {
    let server = FakeServer::new(|_| Answer::Silent);
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();
    client.set_authorized(42, true).unwrap();

    let exported = client.export_session_string().unwrap();
    let (session, api_id) = ferrogram_client::PersistedSession::import_string(&exported).unwrap();
    assert_eq!(api_id, 1);
    assert_eq!(session.home_dc_id, 2);
    assert_eq!(session.user_id, Some(42));
    assert!(session.bot);
    assert_eq!(session.dc(2).and_then(|d| d.auth_key), Some(common::auth_key()));
}
