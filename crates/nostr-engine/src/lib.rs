//! Subscription engine, publish outbox, profile manager, subscription
//! tracker, the `Ndk` host facade, and the NIP-46 remote signer (spec.md
//! §4.5-§4.8, §6 C6-C10).

pub mod engine;
pub mod error;
pub mod host;
pub mod outbox;
pub mod profile;
pub mod signer;
pub mod subscription;
pub mod tracker;

pub use engine::{EngineConfig, SubscriptionEngine};
pub use error::{EngineError, Result};
pub use host::{Ndk, NdkConfig};
pub use outbox::{AggregateStatus, FailReason, OutboxRecord, PublishConfig, PublishOutbox, RelayPublishStatus};
pub use profile::{Profile, ProfileConfig, ProfileManager};
pub use signer::{LocalSigner, PayloadCodec, RemoteSigner, RemoteSignerConfig, Signer};
pub use subscription::{Strategy, Subscription};
pub use tracker::{RelayMetrics, SubscriptionSnapshot, SubscriptionTracker, TrackerExport, TrackerStats};
