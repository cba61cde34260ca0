//! Classification of decrypted message bodies.
//!
//! Every body the server sends is one of a closed set of service messages or
//! an opaque push for the application layer. [`classify`] turns the leading
//! constructor ID into an [`Inbound`] so callers can match exhaustively.

use std::io::Read;

use ferrogram_tl::deserialize::{self, Cursor};
use ferrogram_tl::{Deserializable, Identifiable, Serializable, types};

// ─── Constructor IDs ─────────────────────────────────────────────────────────

pub const ID_RPC_RESULT: u32 = 0xf35c6d01;
pub const ID_MSG_CONTAINER: u32 = 0x73f1f8dc;
pub const ID_GZIP_PACKED: u32 = 0x3072cfa1;
const ID_RPC_ANSWER_UNKNOWN: u32 = 0x5e2ad36e;
const ID_RPC_ANSWER_DROPPED_RUNNING: u32 = 0xcd78e586;
const ID_RPC_ANSWER_DROPPED: u32 = 0xa43ad8b7;

/// Upper bound on a single inflated `gzip_packed` payload.
pub const MAX_INFLATED_LEN: u64 = 64 * 1024 * 1024;

// ─── Types ───────────────────────────────────────────────────────────────────

/// One message inside a `msg_container`.
#[derive(Clone, Debug, PartialEq)]
pub struct InnerMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// The answer carried by an `rpc_result`.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcOutcome {
    /// The serialized result object, already inflated if it was compressed.
    Ok(Vec<u8>),
    Err(types::RpcError),
    /// `rpc_answer_*` acknowledgements of a dropped answer.
    Dropped,
}

/// A decoded server message.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    RpcResult { req_msg_id: i64, outcome: RpcOutcome },
    Container(Vec<InnerMessage>),
    Ack(Vec<i64>),
    BadServerSalt(types::BadServerSalt),
    BadMsgNotification(types::BadMsgNotification),
    NewSessionCreated(types::NewSessionCreated),
    Pong(types::Pong),
    FutureSalts(types::FutureSalts),
    /// `msg_detailed_info` / `msg_new_detailed_info`: the answer must be acked.
    DetailedInfo { answer_msg_id: i64 },
    StateInfo(types::MsgsStateInfo),
    /// The server asks for messages to be sent again.
    ResendRequest(Vec<i64>),
    StateRequest(Vec<i64>),
    DestroySession { session_id: i64, existed: bool },
    /// Anything else: an update or other object for the application layer.
    Push(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("malformed service message: {0}")]
    Deserialize(#[from] deserialize::Error),
    #[error("gzip_packed payload could not be inflated")]
    Inflate,
    #[error("gzip_packed payload inflates past the 64 MiB limit")]
    InflatedTooLarge,
    #[error("container entry declares {declared} bytes but only {available} remain")]
    ContainerOverflow { declared: usize, available: usize },
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// Decode one decrypted message body.
pub fn classify(body: &[u8]) -> Result<Inbound, ServiceError> {
    let mut cur = Cursor::from_slice(body);
    let id = cur.peek_u32()?;

    Ok(match id {
        ID_RPC_RESULT => {
            cur.take(4)?;
            let req_msg_id = i64::deserialize(&mut cur)?;
            let rest = &body[cur.pos()..];
            Inbound::RpcResult { req_msg_id, outcome: decode_result(rest)? }
        }
        ID_MSG_CONTAINER => Inbound::Container(decode_container(body)?),
        ID_GZIP_PACKED => classify(&inflate_packed(body)?)?,
        types::MsgsAck::CONSTRUCTOR_ID => Inbound::Ack(types::MsgsAck::from_bytes(body)?.msg_ids),
        types::BadServerSalt::CONSTRUCTOR_ID => Inbound::BadServerSalt(types::BadServerSalt::from_bytes(body)?),
        types::BadMsgNotification::CONSTRUCTOR_ID => {
            Inbound::BadMsgNotification(types::BadMsgNotification::from_bytes(body)?)
        }
        types::NewSessionCreated::CONSTRUCTOR_ID => {
            Inbound::NewSessionCreated(types::NewSessionCreated::from_bytes(body)?)
        }
        types::Pong::CONSTRUCTOR_ID => Inbound::Pong(types::Pong::from_bytes(body)?),
        types::FutureSalts::CONSTRUCTOR_ID => Inbound::FutureSalts(types::FutureSalts::from_bytes(body)?),
        types::MsgDetailedInfo::CONSTRUCTOR_ID => Inbound::DetailedInfo {
            answer_msg_id: types::MsgDetailedInfo::from_bytes(body)?.answer_msg_id,
        },
        types::MsgNewDetailedInfo::CONSTRUCTOR_ID => Inbound::DetailedInfo {
            answer_msg_id: types::MsgNewDetailedInfo::from_bytes(body)?.answer_msg_id,
        },
        types::MsgsStateInfo::CONSTRUCTOR_ID => Inbound::StateInfo(types::MsgsStateInfo::from_bytes(body)?),
        types::MsgResendReq::CONSTRUCTOR_ID => {
            Inbound::ResendRequest(types::MsgResendReq::from_bytes(body)?.msg_ids)
        }
        types::MsgsStateReq::CONSTRUCTOR_ID => {
            Inbound::StateRequest(types::MsgsStateReq::from_bytes(body)?.msg_ids)
        }
        types::DestroySessionOk::CONSTRUCTOR_ID => Inbound::DestroySession {
            session_id: types::DestroySessionOk::from_bytes(body)?.session_id,
            existed: true,
        },
        types::DestroySessionNone::CONSTRUCTOR_ID => Inbound::DestroySession {
            session_id: types::DestroySessionNone::from_bytes(body)?.session_id,
            existed: false,
        },
        _ => Inbound::Push(body.to_vec()),
    })
}

fn decode_result(result: &[u8]) -> Result<RpcOutcome, ServiceError> {
    let id = Cursor::from_slice(result).peek_u32()?;
    Ok(match id {
        types::RpcError::CONSTRUCTOR_ID => RpcOutcome::Err(types::RpcError::from_bytes(result)?),
        ID_GZIP_PACKED => decode_result(&inflate_packed(result)?)?,
        ID_RPC_ANSWER_UNKNOWN | ID_RPC_ANSWER_DROPPED_RUNNING | ID_RPC_ANSWER_DROPPED => RpcOutcome::Dropped,
        _ => RpcOutcome::Ok(result.to_vec()),
    })
}

/// Split a `msg_container` into its messages.
pub fn decode_container(body: &[u8]) -> Result<Vec<InnerMessage>, ServiceError> {
    let mut cur = Cursor::from_slice(body);
    deserialize::expect_id(&mut cur, ID_MSG_CONTAINER)?;
    let count = i32::deserialize(&mut cur)?.max(0) as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let msg_id = i64::deserialize(&mut cur)?;
        let seq_no = i32::deserialize(&mut cur)?;
        let len = i32::deserialize(&mut cur)?.max(0) as usize;
        if len > cur.remaining() {
            return Err(ServiceError::ContainerOverflow { declared: len, available: cur.remaining() });
        }
        out.push(InnerMessage { msg_id, seq_no, body: cur.take(len)?.to_vec() });
    }
    Ok(out)
}

/// Inflate `gzip_packed#3072cfa1 packed_data:bytes`.
pub fn inflate_packed(body: &[u8]) -> Result<Vec<u8>, ServiceError> {
    let mut cur = Cursor::from_slice(body);
    deserialize::expect_id(&mut cur, ID_GZIP_PACKED)?;
    let packed = Vec::<u8>::deserialize(&mut cur)?;

    let mut out = Vec::new();
    flate2::read::GzDecoder::new(packed.as_slice())
        .take(MAX_INFLATED_LEN + 1)
        .read_to_end(&mut out)
        .map_err(|_| ServiceError::Inflate)?;
    if out.len() as u64 > MAX_INFLATED_LEN {
        return Err(ServiceError::InflatedTooLarge);
    }
    Ok(out)
}

/// Wrap `data` in `gzip_packed`.
pub fn gzip_pack(data: &[u8]) -> Vec<u8> {
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;

    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = enc.write_all(data);
    let packed = enc.finish().unwrap_or_default();

    let mut out = Vec::with_capacity(packed.len() + 8);
    ID_GZIP_PACKED.serialize(&mut out);
    packed.serialize(&mut out);
    out
}

/// Build a serialized `rpc_result` (used by servers and tests).
pub fn rpc_result(req_msg_id: i64, result: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + result.len());
    ID_RPC_RESULT.serialize(&mut out);
    req_msg_id.serialize(&mut out);
    out.extend_from_slice(result);
    out
}
