//! An in-memory MTProto server for end-to-end tests.
//!
//! Every DC shares one auth key that the client already holds, so no
//! handshake runs. The server answers `invokeWithLayer`, pings and future
//! salt requests itself and hands everything else to the test's handler.
//! Tests can also drop a connection, send a frame that fails decryption, or
//! demand a server salt the client does not know yet.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ferrogram_client::{Config, Connector, DcEntry, InMemoryBackend, PersistedSession};
use ferrogram_client::transport::BoxedStream;
use ferrogram_crypto::{AuthKey, Side, decrypt_data_v2_as, encrypt_data_v2_as};
use ferrogram_mtproto::MessageClock;
use ferrogram_mtproto::encrypted::parse_plaintext;
use ferrogram_mtproto::service::{self, ID_MSG_CONTAINER, InnerMessage};
use ferrogram_mtproto::transport::{Framing, Intermediate};
use ferrogram_tl::{Deserializable, Identifiable, Serializable, constructor_id, functions, types};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

pub const HOME: &str = "10.0.0.2:443";
const INVOKE_WITH_LAYER: u32 = 0xda9b0d0d;

pub fn auth_key() -> [u8; 256] {
    std::array::from_fn(|i| (i * 31 % 251) as u8)
}

/// A request the handler is asked to answer.
#[derive(Clone, Debug)]
pub struct Call {
    pub addr: String,
    pub msg_id: i64,
    pub salt: i64,
    pub session_id: i64,
    pub body: Vec<u8>,
}

impl Call {
    pub fn constructor(&self) -> u32 {
        constructor_id(&self.body).unwrap_or(0)
    }

    pub fn parse<T: Deserializable>(&self) -> T {
        T::from_bytes(&self.body).expect("request does not decode")
    }
}

pub enum Answer {
    Ok(Vec<u8>),
    Error(i32, String),
    /// Say nothing; the client will resend.
    Silent,
    /// Send this body as is, instead of an `rpc_result`.
    Raw(Vec<u8>),
}

impl Answer {
    pub fn ok(value: &impl Serializable) -> Self {
        Answer::Ok(value.to_bytes())
    }

    pub fn error(code: i32, message: &str) -> Self {
        Answer::Error(code, message.to_string())
    }

    /// `bad_msg_notification` for `call` with the given error code.
    pub fn bad_msg(call: &Call, error_code: i32) -> Self {
        Answer::Raw(types::BadMsgNotification { bad_msg_id: call.msg_id, bad_msg_seqno: 0, error_code }.to_bytes())
    }
}

/// What a test can make a live connection do.
enum Control {
    Push(Vec<u8>),
    /// A frame whose ciphertext was damaged in transit.
    Corrupt,
    Close,
}

type Handler = Box<dyn Fn(&Call) -> Answer + Send + Sync>;

struct State {
    key: AuthKey,
    handler: Handler,
    dc_options: Vec<types::DcOption>,
    clock: Mutex<MessageClock>,
    calls: Mutex<Vec<Call>>,
    connections: Mutex<Vec<String>>,
    controls: Mutex<HashMap<String, mpsc::UnboundedSender<Control>>>,
    /// Messages under any other salt get `bad_server_salt`.
    salt: Mutex<Option<i64>>,
}

#[derive(Clone)]
pub struct FakeServer {
    state: Arc<State>,
}

pub fn dc_option(id: i32, ip: &str, port: i32) -> types::DcOption {
    types::DcOption { id, ip_address: ip.to_string(), port, ..Default::default() }
}

impl FakeServer {
    pub fn new(handler: impl Fn(&Call) -> Answer + Send + Sync + 'static) -> Self {
        Self::with_options(vec![dc_option(2, "10.0.0.2", 443)], handler)
    }

    pub fn with_options(
        dc_options: Vec<types::DcOption>,
        handler: impl Fn(&Call) -> Answer + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Arc::new(State {
                key: AuthKey::from_bytes(auth_key()),
                handler: Box::new(handler),
                dc_options,
                clock: Mutex::new(MessageClock::new(0)),
                calls: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                controls: Mutex::new(HashMap::new()),
                salt: Mutex::new(None),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector { state: Arc::clone(&self.state) })
    }

    /// A config whose stored session already holds the key for every DC
    /// the server advertises.
    pub fn config(&self) -> Config {
        let mut session = PersistedSession { home_dc_id: 2, ..PersistedSession::default() };
        for option in &self.state.dc_options {
            let entry = session.dc_mut(option.id);
            entry.ip = option.ip_address.clone();
            entry.port = option.port as u16;
            entry.auth_key = Some(auth_key());
            entry.salt = 1;
        }
        Config {
            api_id: 1,
            session_backend: Arc::new(InMemoryBackend::with_session(session)),
            ..Config::default()
        }
    }

    /// Every request the handler saw, `invokeWithLayer` included.
    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_of(&self, constructor: u32) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.constructor() == constructor).collect()
    }

    /// Addresses of every connection opened so far.
    pub fn connections(&self) -> Vec<String> {
        self.state.connections.lock().unwrap().clone()
    }

    /// Send an unsolicited message on the latest connection to `addr`.
    pub fn push(&self, addr: &str, body: Vec<u8>) {
        self.control(addr, Control::Push(body));
    }

    /// Close the latest connection to `addr`.
    pub fn disconnect(&self, addr: &str) {
        self.control(addr, Control::Close);
    }

    /// Send a frame on the latest connection to `addr` that will not decrypt.
    pub fn corrupt(&self, addr: &str) {
        self.control(addr, Control::Corrupt);
    }

    /// From now on, only accept messages under `salt`.
    pub fn require_salt(&self, salt: i64) {
        *self.state.salt.lock().unwrap() = Some(salt);
    }

    fn control(&self, addr: &str, control: Control) {
        let controls = self.state.controls.lock().unwrap();
        controls.get(addr).expect("no connection to that address").send(control).unwrap();
    }
}

/// Poll `condition` until it holds, sleeping in between.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}

pub fn dc_entry(session: &PersistedSession, dc_id: i32) -> Option<DcEntry> {
    session.dc(dc_id).cloned()
}

struct FakeConnector {
    state: Arc<State>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, addr: &str) -> io::Result<BoxedStream> {
        let (client, server) = tokio::io::duplex(4 << 20);
        self.state.connections.lock().unwrap().push(addr.to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.controls.lock().unwrap().insert(addr.to_string(), tx);
        tokio::spawn(serve(Arc::clone(&self.state), addr.to_string(), server, rx));
        Ok(Box::new(client))
    }
}

struct Peer {
    session_id: i64,
    salt: i64,
    seq: i32,
}

async fn serve(state: Arc<State>, addr: String, mut stream: DuplexStream, mut controls: mpsc::UnboundedReceiver<Control>) {
    let mut tag = [0u8; 4];
    if stream.read_exact(&mut tag).await.is_err() {
        return;
    }
    let mut framing = Intermediate::new();
    let mut peer = Peer { session_id: 0, salt: 0, seq: 0 };
    let mut buf = vec![0u8; 1 << 16];

    loop {
        let mut out = Vec::new();
        tokio::select! {
            n = stream.read(&mut buf) => {
                let n = match n {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                framing.feed(&buf[..n]);
                while let Ok(Some(frame)) = framing.next_frame() {
                    for body in state.answer(&addr, &mut peer, frame) {
                        framing.encode(&state.seal(&mut peer, &body), &mut out);
                    }
                }
            }
            Some(control) = controls.recv() => match control {
                Control::Push(body) => framing.encode(&state.seal(&mut peer, &body), &mut out),
                Control::Corrupt => {
                    let pong = types::Pong { msg_id: 0, ping_id: 0 }.to_bytes();
                    let mut sealed = state.seal(&mut peer, &pong);
                    if let Some(last) = sealed.last_mut() {
                        *last ^= 0xff;
                    }
                    framing.encode(&sealed, &mut out);
                }
                Control::Close => return,
            },
        }
        if !out.is_empty() && stream.write_all(&out).await.is_err() {
            return;
        }
    }
}

impl State {
    fn answer(&self, addr: &str, peer: &mut Peer, mut frame: Vec<u8>) -> Vec<Vec<u8>> {
        let Ok(plain) = decrypt_data_v2_as(&mut frame, &self.key, Side::Client) else {
            return Vec::new();
        };
        let Ok(msg) = parse_plaintext(plain, None) else {
            return Vec::new();
        };
        peer.session_id = msg.session_id;
        peer.salt = msg.salt;
        let (salt, session_id) = (msg.salt, msg.session_id);

        let required = *self.salt.lock().unwrap();
        if let Some(required) = required.filter(|&s| s != salt) {
            let bad = types::BadServerSalt {
                bad_msg_id: msg.msg_id,
                bad_msg_seqno: msg.seq_no,
                error_code: 48,
                new_server_salt: required,
            };
            return vec![bad.to_bytes()];
        }

        let messages = if constructor_id(&msg.body) == Some(ID_MSG_CONTAINER) {
            service::decode_container(&msg.body).unwrap_or_default()
        } else {
            vec![InnerMessage { msg_id: msg.msg_id, seq_no: msg.seq_no, body: msg.body }]
        };

        let mut replies = Vec::new();
        for m in messages {
            match constructor_id(&m.body).unwrap_or(0) {
                types::MsgsAck::CONSTRUCTOR_ID => {}
                functions::PingDelayDisconnect::CONSTRUCTOR_ID => {
                    if let Ok(ping) = functions::PingDelayDisconnect::from_bytes(&m.body) {
                        replies.push(types::Pong { msg_id: m.msg_id, ping_id: ping.ping_id }.to_bytes());
                    }
                }
                functions::GetFutureSalts::CONSTRUCTOR_ID => {
                    let now = self.now();
                    let salts = (0..4)
                        .map(|i| types::FutureSalt {
                            valid_since: now - 60 + i * 3600,
                            valid_until: now + (i + 1) * 3600,
                            salt: required.unwrap_or(1),
                        })
                        .collect();
                    replies.push(types::FutureSalts { req_msg_id: m.msg_id, now, salts }.to_bytes());
                }
                constructor => {
                    let call = Call { addr: addr.to_string(), msg_id: m.msg_id, salt, session_id, body: m.body };
                    self.calls.lock().unwrap().push(call.clone());
                    let answer = if constructor == INVOKE_WITH_LAYER {
                        Answer::ok(&types::Config {
                            date: self.now(),
                            expires: self.now() + 3600,
                            test_mode: false,
                            this_dc: 2,
                            dc_options: self.dc_options.clone(),
                        })
                    } else {
                        (self.handler)(&call)
                    };
                    match answer {
                        Answer::Ok(result) => replies.push(service::rpc_result(m.msg_id, &result)),
                        Answer::Error(code, message) => {
                            let error = types::RpcError { error_code: code, error_message: message };
                            replies.push(service::rpc_result(m.msg_id, &error.to_bytes()));
                        }
                        Answer::Silent => {}
                        Answer::Raw(body) => replies.push(body),
                    }
                }
            }
        }
        replies
    }

    fn seal(&self, peer: &mut Peer, body: &[u8]) -> Vec<u8> {
        let msg_id = self.clock.lock().unwrap().next_msg_id() | 1;
        peer.seq += 1;
        let seq_no = peer.seq * 2 - 1;

        let mut plain = Vec::with_capacity(32 + body.len());
        plain.extend(peer.salt.to_le_bytes());
        plain.extend(peer.session_id.to_le_bytes());
        plain.extend(msg_id.to_le_bytes());
        plain.extend(seq_no.to_le_bytes());
        plain.extend((body.len() as u32).to_le_bytes());
        plain.extend_from_slice(body);
        encrypt_data_v2_as(&plain, &self.key, Side::Server).unwrap()
    }

    fn now(&self) -> i32 {
        self.clock.lock().unwrap().server_now()
    }
}

/// A request the handlers below recognize: `ECHO` followed by one int.
pub const ECHO: u32 = 0x0ec4_0ec4;

pub fn echo(value: i32) -> ferrogram_tl::RawCall {
    let mut body = ECHO.to_le_bytes().to_vec();
    body.extend(value.to_le_bytes());
    ferrogram_tl::RawCall(body)
}

/// The int an `echo` request carries.
pub fn echoed(call: &Call) -> i32 {
    i32::from_le_bytes(call.body[4..8].try_into().unwrap())
}
