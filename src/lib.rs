//! Bunraku - real-time motion-capture relay over a peer mesh
//!
//! A capture rig streams skeleton frames over UDP; bunraku relays them to
//! every peer in a shared room and hands inbound peer frames to a local
//! playback tool, each payload tagged with the sending peer's id.
//!
//! - **`skeleton` / `frame`**: the rig model and its line-oriented text form
//! - **`codec`**: addressed binary messages multiplexing per-character frames
//! - **`transport`**: UDP ingress/egress plus per-link health monitoring
//! - **`mesh`**: peer directory reconciliation and link lifecycle
//! - **`session`**: one participant wired to both UDP legs

mod error;
mod frame;
mod skeleton;

pub use error::{CodecError, MeshError, TransportError};
pub use frame::{Frame, Segment, PRECISION, RECORD_SENTINEL};
pub use skeleton::{DataChannel, Skeleton, DATA_CHANNELS, DATA_CHANNEL_ORDER, STANDARD_TRANSFORMS};

pub mod codec;
pub mod mesh;
pub mod session;
pub mod transport;
