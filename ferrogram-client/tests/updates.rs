mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Answer, FakeServer, HOME, eventually};
use ferrogram_client::{
    Batch, Client, Difference, DifferenceState, Element, IDLE_PROBE_AFTER, InMemoryBackend, InvocationError, Position,
    Scope, SessionBackend, Sequence, UpdateSchema,
};
use ferrogram_tl::functions::updates::GetState;
use ferrogram_tl::{Identifiable, types};
use tokio::sync::mpsc;

const UPDATE: u32 = 0xabcd_0001;
const GET_DIFFERENCE: u32 = 0xabcd_0002;
const DIFFERENCE: u32 = 0xabcd_0003;
const SEQ_UPDATE: u32 = 0xabcd_0004;

/// `UPDATE pts:int count:int id:int`
fn update(pts: i32, count: i32, id: i32) -> Vec<u8> {
    [UPDATE as i32, pts, count, id].iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// `SEQ_UPDATE seq:int pts:int count:int id:int`, a one-update batch.
fn seq_update(seq: i32, pts: i32, count: i32, id: i32) -> Vec<u8> {
    [SEQ_UPDATE as i32, seq, pts, count, id].iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// `DIFFERENCE n:int ids... pts:int seq:int`
fn difference(ids: &[i32], pts: i32, seq: i32) -> Answer {
    let mut values = vec![DIFFERENCE as i32, ids.len() as i32];
    values.extend_from_slice(ids);
    values.extend([pts, seq]);
    Answer::Ok(values.iter().flat_map(|v| v.to_le_bytes()).collect())
}

fn ints(body: &[u8]) -> Vec<i32> {
    body.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
}

/// Updates are bare ids.
struct ToySchema;

impl UpdateSchema for ToySchema {
    type Update = i32;

    fn classify(&self, body: &[u8]) -> Option<Batch<i32>> {
        match ints(body)[..] {
            [id, pts, count, update] if id as u32 == UPDATE => Some(Batch::Updates {
                elements: vec![Element { scope: Scope::Common, sequence: Sequence::Pts { pts, count }, update }],
                seq: 0,
                seq_start: 0,
                date: 0,
            }),
            [id, seq, pts, count, update] if id as u32 == SEQ_UPDATE => Some(Batch::Updates {
                elements: vec![Element { scope: Scope::Common, sequence: Sequence::Pts { pts, count }, update }],
                seq,
                seq_start: seq,
                date: 0,
            }),
            _ => None,
        }
    }

    fn difference_request(&self, _: Scope, position: &Position) -> Vec<u8> {
        [GET_DIFFERENCE as i32, position.pts].iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn read_difference(&self, _: Scope, body: &[u8]) -> Result<Difference<i32>, InvocationError> {
        let values = ints(body);
        let n = values[1] as usize;
        let (pts, seq) = (values[2 + n], values[3 + n]);
        Ok(Difference {
            elements: values[2..2 + n].to_vec(),
            state: DifferenceState::Final(Position { pts, seq, ..Position::default() }),
        })
    }
}

fn server() -> FakeServer {
    FakeServer::new(|call| match call.constructor() {
        GetState::CONSTRUCTOR_ID => {
            Answer::ok(&types::updates::State { pts: 100, qts: 0, date: 1, seq: 0, unread_count: 0 })
        }
        GET_DIFFERENCE => {
            // Updates 2 and 3 are missing after pts 101; nothing else is.
            match ints(&call.body)[1] {
                101 => difference(&[2, 3], 103, 0),
                from => difference(&[], from, 0),
            }
        }
        _ => Answer::Silent,
    })
}

async fn next(rx: &mut mpsc::UnboundedReceiver<i32>) -> i32 {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
}

fn forward(tx: mpsc::UnboundedSender<i32>) -> impl Fn(i32) -> std::future::Ready<()> + Send + Sync + 'static {
    move |id| {
        let _ = tx.send(id);
        std::future::ready(())
    }
}

#[tokio::test]
async fn gap_is_filled_before_the_update_is_delivered() {
    let server = server();
    let mut config = server.config();
    let stored = config.session_backend.load().unwrap().unwrap();
    let backend = Arc::new(InMemoryBackend::with_session(stored));
    config.session_backend = backend.clone();
    // One worker keeps delivery order observable.
    config.session.update_workers = 1;

    let client = Client::connect_with(config, server.connector()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = client
        .spawn_updates(ToySchema, move |id: i32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(id);
            }
        })
        .unwrap();

    server.push(HOME, update(101, 1, 1));
    assert_eq!(next(&mut rx).await, 1);

    // Local pts is 101; this one needs 103 first.
    server.push(HOME, update(105, 2, 5));
    assert_eq!(next(&mut rx).await, 2);
    assert_eq!(next(&mut rx).await, 3);
    assert_eq!(next(&mut rx).await, 5);

    stream.stop().await;
    assert_eq!(server.calls_of(GET_DIFFERENCE).len(), 1);
    assert_eq!(backend.load().unwrap().unwrap().common.pts, 105);
}

#[tokio::test]
async fn stale_pts_is_checked_against_the_server() {
    let server = server();
    let mut config = server.config();
    let mut stored = config.session_backend.load().unwrap().unwrap();
    stored.common.pts = 105;
    config.session_backend = Arc::new(InMemoryBackend::with_session(stored));

    let client = Client::connect_with(config, server.connector()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = client
        .spawn_updates(ToySchema, move |id: i32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(id);
            }
        })
        .unwrap();

    // Starting from a known pts fetches a difference once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.calls_of(GET_DIFFERENCE).len(), 1);

    // Local pts is 105, so 104 was applied already; the server confirms it.
    server.push(HOME, update(104, 1, 4));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(server.calls_of(GET_DIFFERENCE).len(), 2);

    server.push(HOME, update(106, 1, 6));
    assert_eq!(next(&mut rx).await, 6);
    stream.stop().await;
    assert_eq!(server.calls_of(GET_DIFFERENCE).len(), 2);
}

#[tokio::test]
async fn identical_pushes_are_delivered_once() {
    let server = server();
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _stream = client
        .spawn_updates(ToySchema, move |id: i32| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(id);
            }
        })
        .unwrap();

    server.push(HOME, update(101, 1, 1));
    server.push(HOME, update(101, 1, 1));
    server.push(HOME, update(102, 1, 2));
    assert_eq!(next(&mut rx).await, 1);
    assert_eq!(next(&mut rx).await, 2);
}

#[tokio::test]
async fn seq_gap_is_filled_even_when_pts_follows() {
    let server = FakeServer::new(|call| match call.constructor() {
        GET_DIFFERENCE => match ints(&call.body)[1] {
            // Batches 12 and 13 carried no pts.
            101 => difference(&[5, 6], 101, 13),
            from => difference(&[], from, 10),
        },
        _ => Answer::Silent,
    });
    let mut config = server.config();
    let mut stored = config.session_backend.load().unwrap().unwrap();
    stored.common = Position { pts: 100, seq: 10, ..Position::default() };
    let backend = Arc::new(InMemoryBackend::with_session(stored));
    config.session_backend = backend.clone();
    config.session.update_workers = 1;

    let client = Client::connect_with(config, server.connector()).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let stream = client.spawn_updates(ToySchema, forward(tx)).unwrap();
    eventually(|| server.calls_of(GET_DIFFERENCE).len() == 1).await;

    server.push(HOME, seq_update(11, 101, 1, 1));
    assert_eq!(next(&mut rx).await, 1);

    // pts 102 follows 101, but seq jumps from 11 to 14.
    server.push(HOME, seq_update(14, 102, 1, 7));
    assert_eq!(next(&mut rx).await, 5);
    assert_eq!(next(&mut rx).await, 6);
    assert_eq!(next(&mut rx).await, 7);

    stream.stop().await;
    assert_eq!(server.calls_of(GET_DIFFERENCE).len(), 2);
    let common = backend.load().unwrap().unwrap().common;
    assert_eq!((common.pts, common.seq), (102, 14));
}

#[tokio::test(start_paused = true)]
async fn idle_stream_probes_the_server_state() {
    let server = server();
    let client = Client::connect_with(server.config(), server.connector()).await.unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let _stream = client.spawn_updates(ToySchema, forward(tx)).unwrap();
    eventually(|| server.calls_of(GetState::CONSTRUCTOR_ID).len() == 1).await;

    tokio::time::sleep(IDLE_PROBE_AFTER - Duration::from_secs(60)).await;
    assert_eq!(server.calls_of(GetState::CONSTRUCTOR_ID).len(), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    eventually(|| server.calls_of(GetState::CONSTRUCTOR_ID).len() == 2).await;
    assert!(server.calls_of(GET_DIFFERENCE).is_empty());
}
