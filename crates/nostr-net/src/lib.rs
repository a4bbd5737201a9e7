//! Relay connection lifecycle, NIP-01 wire framing, and the relay pool
//! (spec.md §4.4, §4.5 C4/C5).

pub mod error;
pub mod framing;
pub mod peer;
pub mod pool;
pub mod relay;

pub use error::{NetError, Result};
pub use framing::{ClientMessage, NostrCodec, PublishFailureReason, RelayMessage};
pub use peer::{ConnectionState, RelayInfo, RelayUrl};
pub use pool::{PooledMessage, RelayPool};
pub use relay::{ReconnectBackoff, RelayConnection, SubAccounting};
