//! Client side of the Lookout block stream: a reconnecting websocket to the hub that turns
//! pushed blocks into what a dashboard shows (latest head, clock drift, time since the last
//! block and a short new-block pulse).

mod backoff;
mod driver;
mod endpoint;
mod state;

pub use backoff::{ReconnectBackoff, RECONNECT_CEILING, RECONNECT_FLOOR};
pub use driver::{BlockStreamTracker, TrackerHandle};
pub use endpoint::{hub_endpoint, EndpointError, BLOCKS_PATH};
pub use state::{CloseInitiator, TrackerSnapshot, TrackerState, NEW_BLOCK_PULSE};
