//! RPC functions.

use crate::deserialize::{self, Buffer, expect_id};
use crate::{Blob, Deserializable, Identifiable, RemoteCall, Serializable, enums, types};

// ─── Auth key exchange ────────────────────────────────────────────────────────

tl_function! {
    ReqPqMulti = 0xbe7e8ef1 { nonce: [u8; 16] } -> types::ResPq
}

tl_function! {
    ReqDhParams = 0xd712e4be {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        p: Vec<u8>,
        q: Vec<u8>,
        public_key_fingerprint: i64,
        encrypted_data: Vec<u8>,
    } -> enums::ServerDhParams
}

tl_function! {
    SetClientDhParams = 0xf5045f1f {
        nonce: [u8; 16],
        server_nonce: [u8; 16],
        encrypted_data: Vec<u8>,
    } -> enums::SetClientDhParamsAnswer
}

// ─── Service ──────────────────────────────────────────────────────────────────

tl_function! {
    Ping = 0x7abe77ec { ping_id: i64 } -> types::Pong
}

tl_function! {
    /// Keepalive that also asks the server to close the connection after
    /// `disconnect_delay` seconds without another ping.
    PingDelayDisconnect = 0xf3427b8c { ping_id: i64, disconnect_delay: i32 } -> types::Pong
}

tl_function! {
    GetFutureSalts = 0xb921bd04 { num: i32 } -> types::FutureSalts
}

tl_function! {
    DestroySession = 0xe7512126 { session_id: i64 } -> enums::DestroySessionRes
}

// ─── Connection setup ─────────────────────────────────────────────────────────

/// `invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X`
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeWithLayer<X> {
    pub layer: i32,
    pub query: X,
}

impl<X> Identifiable for InvokeWithLayer<X> {
    const CONSTRUCTOR_ID: u32 = 0xda9b0d0d;
}

impl<X: Serializable> Serializable for InvokeWithLayer<X> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.layer.serialize(buf);
        self.query.serialize(buf);
    }
}

impl<X: RemoteCall> RemoteCall for InvokeWithLayer<X> {
    type Return = X::Return;
}

/// `initConnection#c1cd5ea9`, sent without the optional proxy and params.
#[derive(Clone, Debug, PartialEq)]
pub struct InitConnection<X> {
    pub api_id: i32,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_pack: String,
    pub lang_code: String,
    pub query: X,
}

impl<X> Identifiable for InitConnection<X> {
    const CONSTRUCTOR_ID: u32 = 0xc1cd5ea9;
}

impl<X: Serializable> Serializable for InitConnection<X> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        0u32.serialize(buf);
        self.api_id.serialize(buf);
        self.device_model.serialize(buf);
        self.system_version.serialize(buf);
        self.app_version.serialize(buf);
        self.system_lang_code.serialize(buf);
        self.lang_pack.serialize(buf);
        self.lang_code.serialize(buf);
        self.query.serialize(buf);
    }
}

impl<X: RemoteCall> RemoteCall for InitConnection<X> {
    type Return = X::Return;
}

pub mod help {
    tl_function! {
        GetConfig = 0xc4f9186b {} -> crate::types::Config
    }
}

pub mod auth {
    tl_function! {
        ExportAuthorization = 0xe5bfffcd { dc_id: i32 } -> crate::types::auth::ExportedAuthorization
    }

    tl_function! {
        /// The `auth.Authorization` answer is not needed by the engine.
        ImportAuthorization = 0xa57a7dad { id: i64, bytes: Vec<u8> } -> crate::Blob
    }
}

pub mod updates {
    tl_function! {
        GetState = 0xedd4882a {} -> crate::types::updates::State
    }
}

// ─── Files ────────────────────────────────────────────────────────────────────

pub mod upload {
    use super::*;

    /// `upload.getFile#be5335be`
    ///
    /// `location` is a serialized, boxed `InputFileLocation` supplied by the
    /// caller.
    #[derive(Clone, Debug, PartialEq)]
    pub struct GetFile {
        pub precise: bool,
        pub cdn_supported: bool,
        pub location: Blob,
        pub offset: i64,
        pub limit: i32,
    }

    impl Identifiable for GetFile {
        const CONSTRUCTOR_ID: u32 = 0xbe5335be;
    }

    impl Serializable for GetFile {
        fn serialize(&self, buf: &mut impl Extend<u8>) {
            Self::CONSTRUCTOR_ID.serialize(buf);
            let flags: u32 = (self.precise as u32) | (self.cdn_supported as u32) << 1;
            flags.serialize(buf);
            self.location.serialize(buf);
            self.offset.serialize(buf);
            self.limit.serialize(buf);
        }
    }

    /// The location has no length prefix, so it is everything between the
    /// flags and the trailing `offset:long limit:int`.
    impl Deserializable for GetFile {
        fn deserialize(buf: Buffer) -> deserialize::Result<Self> {
            expect_id(buf, Self::CONSTRUCTOR_ID)?;
            let flags = u32::deserialize(buf)?;
            let loc_len = buf.remaining().checked_sub(12).ok_or(deserialize::Error::UnexpectedEof)?;
            let location = Blob(buf.take(loc_len)?.to_vec());
            Ok(Self {
                precise: flags & 1 != 0,
                cdn_supported: flags & (1 << 1) != 0,
                location,
                offset: i64::deserialize(buf)?,
                limit: i32::deserialize(buf)?,
            })
        }
    }

    impl RemoteCall for GetFile {
        type Return = enums::upload::File;
    }

    tl_function! {
        GetCdnFile = 0x395f69da {
            file_token: Vec<u8>,
            offset: i64,
            limit: i32,
        } -> crate::enums::upload::CdnFile
    }

    tl_function! {
        ReuploadCdnFile = 0x9b2754a8 {
            file_token: Vec<u8>,
            request_token: Vec<u8>,
        } -> Vec<crate::types::FileHash>
    }

    tl_function! {
        GetCdnFileHashes = 0x91dc3f31 {
            file_token: Vec<u8>,
            offset: i64,
        } -> Vec<crate::types::FileHash>
    }

    tl_function! {
        SaveFilePart = 0xb304a621 {
            file_id: i64,
            file_part: i32,
            bytes: Vec<u8>,
        } -> bool
    }

    tl_function! {
        SaveBigFilePart = 0xde7b673d {
            file_id: i64,
            file_part: i32,
            file_total_parts: i32,
            bytes: Vec<u8>,
        } -> bool
    }
}
