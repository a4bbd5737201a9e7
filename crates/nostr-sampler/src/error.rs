//! Error types for the sampler.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SamplerError>;

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("relay {0} is blacklisted")]
    Blacklisted(String),
}
