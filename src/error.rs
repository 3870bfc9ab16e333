//! Error types for the relay core.
//!
//! Three surfaces, matching the three failure domains:
//! - [`CodecError`]: malformed text blocks or wire messages, raised
//!   synchronously by encode/decode — no partial output is ever returned.
//! - [`TransportError`]: UDP bind/send failures, surfaced to the caller of
//!   the failing operation and never retried by the core.
//! - [`MeshError`]: signaling/directory failures. A failed join is fatal to
//!   that join attempt only; per-link errors never abort other links.
//!
//! Silence on a link is *not* an error — it is a [`LinkState`] transition
//! owned by the health monitor.
//!
//! [`LinkState`]: crate::transport::health::LinkState

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from the frame codec (text line format and binary wire format).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Wire address did not start with `/` or had no id component.
    #[error("malformed wire address: {address:?}")]
    BadAddress { address: String },

    /// A percent-encoded address component did not decode to UTF-8.
    #[error("invalid percent-escape in address component")]
    InvalidEscape,

    /// A string field of a binary wire message was not valid UTF-8.
    #[error("wire string is not valid utf-8")]
    InvalidUtf8,

    /// A channel slot held something that does not parse as a number.
    #[error("non-numeric channel token {token:?}")]
    NonNumericChannel { token: String },

    /// A character record had fewer tokens than one channel block plus an id.
    #[error("character record too short: need an id plus {channels} channel values")]
    TruncatedRecord { channels: usize },

    /// No complete character record before the sentinel.
    #[error("no character records found in frame block")]
    EmptyBlock,

    /// Wire args cannot be split into equal per-character blocks.
    #[error("argument count {got} is not a multiple of the {block}-value character block")]
    UnevenArgs { got: usize, block: usize },

    /// Binary wire message ended before the advertised content.
    #[error("truncated wire message")]
    Truncated,

    /// Binary wire message carried an argument type we do not speak.
    #[error("unsupported wire argument type {tag:?}")]
    UnsupportedArg { tag: char },

    /// A skeleton must name at least one transform.
    #[error("skeleton has no transforms")]
    EmptySkeleton,

    /// Transform names within a skeleton must be unique.
    #[error("duplicate transform name {name:?}")]
    DuplicateTransform { name: String },
}

/// Errors from the UDP bridge.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket could not be bound (address in use, no permission, ...).
    #[error("failed to bind udp socket at {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A send or other socket operation failed.
    #[error("udp socket error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from the peer mesh and its signaling backend.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The signaling identity could not be established or was rejected.
    #[error("signaling failure: {0}")]
    Signaling(String),

    /// The peer directory could not be queried.
    #[error("peer directory unavailable: {0}")]
    Directory(String),

    /// Operation on a link that has already closed.
    #[error("link to peer {peer:?} is closed")]
    LinkClosed { peer: String },
}
