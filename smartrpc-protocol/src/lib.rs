//! # smartrpc-protocol
//!
//! Wire protocol implementation for the bzr smart protocol.
//!
//! This crate provides:
//! - Bencode values used by protocol version three
//! - Framing primitives for all three protocol generations
//! - Incremental request/response encoders and decoders
//! - Protocol version markers and the remote release ratchet type

pub mod bencode;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod version;

pub use codec::{Decoder, Encoder, Headers};
pub use error::ProtocolError;
pub use frame::MessagePart;
pub use message::{MessageEvent, Payload, ReadvRange, Request, RequestBody, Response, ResponseStatus};
pub use version::{ProtocolVersion, RemoteVersion};

/// Default TCP port for `bzr://` URLs.
pub const DEFAULT_PORT: u16 = 4155;

/// Maximum size of a single V3 message part or V2 chunk (16 MiB).
pub const MAX_PART_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum length of a V1/V2 tuple or framing line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;
