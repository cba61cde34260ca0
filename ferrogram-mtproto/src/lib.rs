//! Sans-IO MTProto 2.0 protocol state.
//!
//! This crate handles:
//! * The DH auth key exchange ([`authentication`])
//! * Message ids, sequence numbers and plaintext framing ([`message`])
//! * Encrypted framing with salts and replay protection ([`encrypted`])
//! * Classification of decrypted server messages ([`service`])
//! * The TCP packet framings, including Obfuscated2 ([`transport`])
//!
//! Nothing here touches a socket or a clock-driven timer; the async engine
//! in `ferrogram-client` drives these types.

#![deny(unsafe_code)]

pub mod authentication;
pub mod encrypted;
pub mod message;
pub mod replay;
pub mod salts;
pub mod service;
pub mod transport;

pub use encrypted::{DecryptedMessage, EncryptedSession, OutgoingMessage};
pub use message::MessageClock;
pub use service::Inbound;
