mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Answer, ECHO, FakeServer, HOME, dc_option, echo, echoed, eventually};
use ferrogram_client::{Client, InMemoryBackend, InvocationError, Mode, SessionBackend};
use ferrogram_tl::functions::auth;
use ferrogram_tl::{Identifiable, types};

const DC4: &str = "10.0.0.4:443";

fn two_dcs(handler: impl Fn(&common::Call) -> Answer + Send + Sync + 'static) -> FakeServer {
    FakeServer::with_options(vec![dc_option(2, "10.0.0.2", 443), dc_option(4, "10.0.0.4", 443)], handler)
}

#[tokio::test]
async fn concurrent_callers_share_one_new_session() {
    let server = two_dcs(|_| Answer::Silent);
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let sessions = futures::future::join_all((0..8).map(|_| client.session(4, Mode::Media))).await;
    assert!(sessions.iter().all(Result::is_ok));

    let to_dc4 = server.connections().iter().filter(|a| *a == DC4).count();
    assert_eq!(to_dc4, 1);
    assert_eq!(client.pool().session_count().await, 2);
}

#[tokio::test]
async fn user_migration_moves_the_home_dc() {
    let server = two_dcs(|call| match call.addr.as_str() {
        HOME => Answer::error(303, "USER_MIGRATE_4"),
        _ => Answer::Ok(echoed(call).to_le_bytes().to_vec()),
    });
    let mut config = server.config();
    let stored = config.session_backend.load().unwrap().unwrap();
    let backend = Arc::new(InMemoryBackend::with_session(stored));
    config.session_backend = backend.clone();

    let client = Client::connect_with(config, server.connector()).await.unwrap();
    let answer = client.invoke(&echo(3)).await.unwrap();
    assert_eq!(answer.0, 3i32.to_le_bytes());

    assert_eq!(client.pool().home_dc_id().unwrap(), 4);
    assert_eq!(backend.load().unwrap().unwrap().home_dc_id, 4);
    let sent = server.calls_of(ECHO);
    assert_eq!(sent.iter().map(|c| c.addr.as_str()).collect::<Vec<_>>(), vec![HOME, DC4]);
}

#[tokio::test]
async fn file_migration_only_redirects_the_request() {
    let server = two_dcs(|call| match call.addr.as_str() {
        HOME => Answer::error(303, "FILE_MIGRATE_4"),
        _ => Answer::Ok(vec![1, 0, 0, 0]),
    });
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    client.invoke(&echo(1)).await.unwrap();
    assert_eq!(client.pool().home_dc_id().unwrap(), 2);
}

#[tokio::test]
async fn migration_is_followed_once() {
    let server = two_dcs(|_| Answer::error(303, "FILE_MIGRATE_4"));
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    let err = client.invoke(&echo(1)).await.unwrap_err();
    assert_eq!(err.migrate_dc(), Some(4));
    assert_eq!(server.calls_of(ECHO).len(), 2);
}

#[tokio::test]
async fn authorization_is_copied_to_other_dcs() {
    let imports = Arc::new(AtomicUsize::new(0));
    let server = two_dcs(move |call| match call.constructor() {
        auth::ExportAuthorization::CONSTRUCTOR_ID => {
            let request: auth::ExportAuthorization = call.parse();
            assert_eq!(request.dc_id, 4);
            Answer::ok(&types::auth::ExportedAuthorization { id: 9, bytes: vec![1, 2, 3] })
        }
        auth::ImportAuthorization::CONSTRUCTOR_ID => {
            assert_eq!(call.addr, DC4);
            let request: auth::ImportAuthorization = call.parse();
            assert_eq!((request.id, request.bytes), (9, vec![1, 2, 3]));
            if imports.fetch_add(1, Ordering::SeqCst) == 0 {
                Answer::error(400, "AUTH_BYTES_INVALID")
            } else {
                Answer::Ok(vec![0x44, 0x33, 0x22, 0x11])
            }
        }
        _ => Answer::Ok(echoed(call).to_le_bytes().to_vec()),
    });
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();
    client.set_authorized(1000, false).unwrap();

    let answer = client.invoke_on_dc(4, &echo(5)).await.unwrap();
    assert_eq!(answer.0, 5i32.to_le_bytes());
    assert_eq!(server.calls_of(auth::ExportAuthorization::CONSTRUCTOR_ID).len(), 2);
    assert_eq!(server.calls_of(auth::ImportAuthorization::CONSTRUCTOR_ID).len(), 2);
}

#[tokio::test]
async fn unauthorized_clients_skip_the_transfer() {
    let server = two_dcs(|call| Answer::Ok(echoed(call).to_le_bytes().to_vec()));
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();

    client.invoke_on_dc(4, &echo(5)).await.unwrap();
    assert!(server.calls_of(auth::ExportAuthorization::CONSTRUCTOR_ID).is_empty());
}

#[tokio::test]
async fn undecryptable_frame_replaces_the_session() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let server = FakeServer::new(move |call| match attempts.fetch_add(1, Ordering::SeqCst) {
        0 => Answer::Silent,
        _ => Answer::Ok(echoed(call).to_le_bytes().to_vec()),
    });
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();
    let first = client.session(2, Mode::Primary).await.unwrap();

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.invoke(&echo(1)).await }
    });
    eventually(|| server.calls_of(ECHO).len() == 1).await;
    server.corrupt(HOME);

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, InvocationError::Security(_)), "{err:?}");
    assert!(first.is_closed());

    let answer = client.invoke(&echo(2)).await.unwrap();
    assert_eq!(answer.0, 2i32.to_le_bytes());
    assert_eq!(server.connections(), vec![HOME, HOME]);
    assert_eq!(client.pool().session_count().await, 1);
}

#[tokio::test]
async fn forgetting_the_session_deletes_it() {
    let server = FakeServer::new(|_| Answer::Silent);
    let mut config = server.config();
    let stored = config.session_backend.load().unwrap().unwrap();
    let backend = Arc::new(InMemoryBackend::with_session(stored));
    config.session_backend = backend.clone();

    let client = Client::connect_with(config, server.connector()).await.unwrap();
    client.forget_session().await.unwrap();
    assert!(backend.load().unwrap().is_none());
    assert_eq!(client.pool().session_count().await, 0);
}
