//! Concrete constructors.
//!
//! Handshake and service constructors come from the MTProto schema; the
//! rest are the few API objects the engine itself reads (DC list, exported
//! authorization, update state, file chunks and CDN material).

use crate::deserialize::{self, Buffer, expect_id};
use crate::{Deserializable, Identifiable, Serializable};

// ─── Auth key exchange ────────────────────────────────────────────────────────

tl_type! {
    /// `resPQ`: the server's answer to `req_pq_multi`.
    ResPq = 0x05162463 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        pq: Vec<u8>,
        server_public_key_fingerprints: Vec<i64>,
    }
}

tl_type! {
    /// `p_q_inner_data_dc`: RSA-encrypted inside `req_DH_params`.
    PQInnerDataDc = 0xa9f55f95 {
        pq: Vec<u8>,
        p: Vec<u8>,
        q: Vec<u8>,
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce: [u8; 32],
        dc: i32,
    }
}

tl_type! {
    ServerDhParamsOk = 0xd0e8075c {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_answer: Vec<u8>,
    }
}

tl_type! {
    ServerDhParamsFail = 0x79cb045d {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash: [u8; 16],
    }
}

tl_type! {
    /// Decrypted from `server_DH_params_ok.encrypted_answer`.
    ServerDhInnerData = 0xb5890dba {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        g: i32,
        dh_prime: Vec<u8>,
        g_a: Vec<u8>,
        server_time: i32,
    }
}

tl_type! {
    ClientDhInnerData = 0x6643b654 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        retry_id: i64,
        g_b: Vec<u8>,
    }
}

tl_type! {
    DhGenOk = 0x3bcbf734 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash1: [u8; 16],
    }
}

tl_type! {
    DhGenRetry = 0x46dc1fb9 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash2: [u8; 16],
    }
}

tl_type! {
    DhGenFail = 0xa69dae02 {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        new_nonce_hash3: [u8; 16],
    }
}

// ─── Service messages ─────────────────────────────────────────────────────────

tl_type! {
    RpcError = 0x2144ca19 {
        error_code: i32,
        error_message: String,
    }
}

tl_type! {
    Pong = 0x347773c5 {
        msg_id: i64,
        ping_id: i64,
    }
}

tl_type! {
    MsgsAck = 0x62d6b459 {
        msg_ids: Vec<i64>,
    }
}

tl_type! {
    BadMsgNotification = 0xa7eff811 {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
    }
}

tl_type! {
    BadServerSalt = 0xedab447b {
        bad_msg_id: i64,
        bad_msg_seqno: i32,
        error_code: i32,
        new_server_salt: i64,
    }
}

tl_type! {
    NewSessionCreated = 0x9ec20908 {
        first_msg_id: i64,
        unique_id: i64,
        server_salt: i64,
    }
}

tl_type! {
    FutureSalt = 0x0949d9dc {
        valid_since: i32,
        valid_until: i32,
        salt: i64,
    }
}

/// `future_salts#ae500895 req_msg_id:long now:int salts:vector<future_salt>`
///
/// The salts are a bare vector of bare `future_salt`.
#[derive(Clone, Debug, PartialEq)]
pub struct FutureSalts {
    pub req_msg_id: i64,
    pub now: i32,
    pub salts: Vec<FutureSalt>,
}

impl Identifiable for FutureSalts {
    const CONSTRUCTOR_ID: u32 = 0xae500895;
}

impl Serializable for FutureSalts {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.req_msg_id.serialize(buf);
        self.now.serialize(buf);
        (self.salts.len() as i32).serialize(buf);
        for s in &self.salts {
            s.valid_since.serialize(buf);
            s.valid_until.serialize(buf);
            s.salt.serialize(buf);
        }
    }
}

impl Deserializable for FutureSalts {
    fn deserialize(buf: Buffer) -> deserialize::Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        let req_msg_id = i64::deserialize(buf)?;
        let now = i32::deserialize(buf)?;
        let count = i32::deserialize(buf)?.max(0) as usize;
        let salts = (0..count)
            .map(|_| FutureSalt::deserialize_bare(buf))
            .collect::<deserialize::Result<_>>()?;
        Ok(Self { req_msg_id, now, salts })
    }
}

tl_type! {
    MsgDetailedInfo = 0x276d3ec6 {
        msg_id: i64,
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_type! {
    MsgNewDetailedInfo = 0x809db6df {
        answer_msg_id: i64,
        bytes: i32,
        status: i32,
    }
}

tl_type! {
    MsgResendReq = 0x7d861a08 {
        msg_ids: Vec<i64>,
    }
}

tl_type! {
    MsgsStateReq = 0xda69fb52 {
        msg_ids: Vec<i64>,
    }
}

tl_type! {
    MsgsStateInfo = 0x04deb57d {
        req_msg_id: i64,
        info: Vec<u8>,
    }
}

tl_type! {
    DestroySessionOk = 0xe22045fc {
        session_id: i64,
    }
}

tl_type! {
    DestroySessionNone = 0x62d350c9 {
        session_id: i64,
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

/// `dcOption`: one address the server advertises for a DC.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DcOption {
    pub ipv6: bool,
    pub media_only: bool,
    pub tcpo_only: bool,
    pub cdn: bool,
    pub r#static: bool,
    pub this_port_only: bool,
    pub id: i32,
    pub ip_address: String,
    pub port: i32,
    pub secret: Option<Vec<u8>>,
}

impl Identifiable for DcOption {
    const CONSTRUCTOR_ID: u32 = 0x18b7a10d;
}

impl Serializable for DcOption {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        let flags: u32 = (self.ipv6 as u32)
            | (self.media_only as u32) << 1
            | (self.tcpo_only as u32) << 2
            | (self.cdn as u32) << 3
            | (self.r#static as u32) << 4
            | (self.this_port_only as u32) << 5
            | (self.secret.is_some() as u32) << 10;
        flags.serialize(buf);
        self.id.serialize(buf);
        self.ip_address.serialize(buf);
        self.port.serialize(buf);
        self.secret.serialize(buf);
    }
}

impl Deserializable for DcOption {
    fn deserialize(buf: Buffer) -> deserialize::Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        let flags = u32::deserialize(buf)?;
        Ok(Self {
            ipv6: flags & 1 != 0,
            media_only: flags & (1 << 1) != 0,
            tcpo_only: flags & (1 << 2) != 0,
            cdn: flags & (1 << 3) != 0,
            r#static: flags & (1 << 4) != 0,
            this_port_only: flags & (1 << 5) != 0,
            id: i32::deserialize(buf)?,
            ip_address: String::deserialize(buf)?,
            port: i32::deserialize(buf)?,
            secret: if flags & (1 << 10) != 0 { Some(Vec::<u8>::deserialize(buf)?) } else { None },
        })
    }
}

/// The leading fields of `config#cc1a241e`.
///
/// The engine only needs the DC list; everything after `dc_options` is left
/// unread, and serialization writes this prefix alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Config {
    pub date: i32,
    pub expires: i32,
    pub test_mode: bool,
    pub this_dc: i32,
    pub dc_options: Vec<DcOption>,
}

impl Identifiable for Config {
    const CONSTRUCTOR_ID: u32 = 0xcc1a241e;
}

impl Serializable for Config {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        0u32.serialize(buf);
        self.date.serialize(buf);
        self.expires.serialize(buf);
        self.test_mode.serialize(buf);
        self.this_dc.serialize(buf);
        self.dc_options.serialize(buf);
    }
}

impl Deserializable for Config {
    fn deserialize(buf: Buffer) -> deserialize::Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        // Every flag before dc_options is a `true` flag and occupies no bytes.
        let _flags = u32::deserialize(buf)?;
        Ok(Self {
            date: i32::deserialize(buf)?,
            expires: i32::deserialize(buf)?,
            test_mode: bool::deserialize(buf)?,
            this_dc: i32::deserialize(buf)?,
            dc_options: Vec::<DcOption>::deserialize(buf)?,
        })
    }
}

// ─── Namespaced API objects ───────────────────────────────────────────────────

pub mod auth {
    tl_type! {
        ExportedAuthorization = 0xb434e2b8 {
            id: i64,
            bytes: Vec<u8>,
        }
    }
}

pub mod updates {
    tl_type! {
        /// `updates.state`: the server's current counters.
        State = 0xa56c2a3e {
            pts: i32,
            qts: i32,
            date: i32,
            seq: i32,
            unread_count: i32,
        }
    }
}

tl_type! {
    /// One verified range of a CDN file.
    FileHash = 0xf39b035c {
        offset: i64,
        limit: i32,
        hash: Vec<u8>,
    }
}

pub mod upload {
    use super::FileHash;

    tl_type! {
        /// A plain chunk. `r#type` is the `storage.FileType` constructor ID.
        File = 0x096a18d5 {
            r#type: u32,
            mtime: i32,
            bytes: Vec<u8>,
        }
    }

    tl_type! {
        FileCdnRedirect = 0xf18cda44 {
            dc_id: i32,
            file_token: Vec<u8>,
            encryption_key: Vec<u8>,
            encryption_iv: Vec<u8>,
            file_hashes: Vec<FileHash>,
        }
    }

    tl_type! {
        CdnFile = 0xa99fca4f {
            bytes: Vec<u8>,
        }
    }

    tl_type! {
        CdnFileReuploadNeeded = 0xeea8e46e {
            request_token: Vec<u8>,
        }
    }
}

tl_type! {
    /// A file uploaded in fewer than the big-file threshold's worth of parts.
    InputFile = 0xf52ff27f {
        id: i64,
        parts: i32,
        name: String,
        md5_checksum: String,
    }
}

tl_type! {
    InputFileBig = 0xfa4f0bb5 {
        id: i64,
        parts: i32,
        name: String,
    }
}
