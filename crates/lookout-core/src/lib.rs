//! Shared primitives for the Lookout block stream: the block event that flows from the
//! chain node to every dashboard, the envelope the hub pushes over websockets, and the
//! millisecond clock helpers both ends use for drift math.

mod block;
mod clock;
mod message;

pub use block::BlockEvent;
pub use clock::{seconds_between, unix_millis};
pub use message::{DecodeError, NormalizedBlockMessage, StreamMessage};
