//! Wire protocol codec.
//!
//! This layer does serialization and nothing else: no routing, no
//! state mutation, no authentication. The message catalogue is the
//! public ABI of the controller.
//!
//! - [`buffer`]: append-only pack buffer and safe cursor-based unpack
//! - [`header`]: the framed message header with forwarding descriptor
//! - [`forward`]: fan-out span computation and return-list items
//! - [`msg`]: the message catalogue and per-variant pack/unpack

pub mod buffer;
pub mod forward;
pub mod header;
pub mod msg;

pub use buffer::{PackBuf, UnpackBuf};
pub use forward::{span, ForwardSpec, ReturnItem};
pub use header::Header;
pub use msg::{Message, MsgType};
