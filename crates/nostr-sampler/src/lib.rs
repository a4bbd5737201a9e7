//! Probabilistic signature-verification sampler with zero-tolerance relay
//! blacklisting (spec.md §4.2 C2).

pub mod error;
pub mod sampler;
pub mod trust;

pub use error::{Result, SamplerError};
pub use sampler::{Decision, EvilRelayNotice, Sampler};
pub use trust::{SamplerConfig, TrustCounters, TrustRegistry};
