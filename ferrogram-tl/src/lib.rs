//! TL types for the ferrogram MTProto engine.
//!
//! The engine treats application requests as opaque [`RemoteCall`]s. This
//! crate carries the serialization traits plus the hand-maintained subset of
//! the schema the engine itself speaks:
//!
//! | Module        | Contents                                                    |
//! |---------------|-------------------------------------------------------------|
//! | [`types`]     | Concrete constructors (bare types) as `struct`s             |
//! | [`functions`] | RPC functions as `struct`s implementing [`RemoteCall`]      |
//! | [`enums`]     | Boxed types with several constructors as `enum`s            |
//!
//! Any other request plugs in by implementing [`Serializable`] and
//! [`RemoteCall`]; [`RawCall`] carries pre-serialized bytes and returns the
//! response undecoded.
//!
//! ```rust
//! use ferrogram_tl::{functions, Serializable};
//!
//! let req = functions::Ping { ping_id: 7 };
//! assert_eq!(&req.to_bytes()[..4], &0x7abe77ecu32.to_le_bytes());
//! ```

#![deny(unsafe_code)]

#[macro_use]
mod macros;

pub mod deserialize;
pub mod enums;
pub mod functions;
pub mod serialize;
pub mod types;

pub use deserialize::{Cursor, Deserializable};
pub use serialize::Serializable;

/// API layer announced through `invokeWithLayer` unless configured otherwise.
pub const LAYER: i32 = 214;

/// Constructor ID of the boxed `Vector` type.
pub const VECTOR: u32 = 0x1cb5c415;
/// `boolTrue#997275b5`
pub const BOOL_TRUE: u32 = 0x997275b5;
/// `boolFalse#bc799737`
pub const BOOL_FALSE: u32 = 0xbc799737;

/// Bare vector: `vector` (lowercase) as opposed to the boxed `Vector`.
///
/// Used where the schema sends a length-prefixed list without the usual
/// `0x1cb5c415` constructor ID header.
#[derive(Clone, Debug, PartialEq)]
pub struct RawVec<T>(pub Vec<T>);

/// Opaque bytes passed through without interpretation.
///
/// Serializes verbatim and deserializes by consuming the rest of the buffer.
/// Used for generic `X` results and for schema values the engine only
/// forwards, such as a caller-built `InputFileLocation`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(v: Vec<u8>) -> Self { Self(v) }
}

/// A request serialized elsewhere (typically by a schema crate the engine
/// knows nothing about). The response comes back as a [`Blob`].
#[derive(Clone, Debug, PartialEq)]
pub struct RawCall(pub Vec<u8>);

impl Serializable for RawCall {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.0.iter().copied());
    }
}

impl RemoteCall for RawCall {
    type Return = Blob;
}

// ─── Core traits ──────────────────────────────────────────────────────────────

/// Every TL constructor has a unique 32-bit ID.
pub trait Identifiable {
    /// The constructor ID as specified in the TL schema.
    const CONSTRUCTOR_ID: u32;
}

/// Marks a function type that can be sent as an RPC call.
///
/// `Return` is the type the server responds with.
pub trait RemoteCall: Serializable {
    /// The deserialized response type.
    type Return: Deserializable;
}

/// Read the leading constructor ID of a serialized object, if any.
pub fn constructor_id(bytes: &[u8]) -> Option<u32> {
    bytes.get(..4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}
