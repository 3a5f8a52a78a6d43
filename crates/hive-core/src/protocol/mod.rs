//! `@@MESSAGE@@` line protocol between the supervisor and its workers.
//!
//! One message per line over the worker's stdin/stdout. Lines without the
//! prefix are plain log output and pass through untouched. The reader is
//! tolerant: malformed frames are dropped, never fatal.

mod bus;
mod channel;
mod codec;
mod types;

pub use bus::{EventBus, HandlerError};
pub use channel::{ChannelError, ChannelSender, MAX_LINE_BYTES, WorkerChannel};
pub use codec::{Decoded, PREFIX, decode, encode, encode_envelope};
pub use types::*;
