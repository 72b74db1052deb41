use thiserror::Error;

/// Violations of the adaptation contract.
///
/// Every adaptor is called once per warmup draw and finalized exactly once
/// at the end of warmup. Breaking that contract is a programming error and
/// stops the sampler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdaptError {
    #[error("adaptor was already finalized")]
    AlreadyFinalized,
    #[error("adaptor received a draw after it was finalized")]
    AdaptAfterFinalize,
    #[error("adaptation draw {draw} is outside of the warmup window of {num_adapts} draws")]
    WindowExceeded { draw: u64, num_adapts: u64 },
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Could not find valid initial point: logp or gradient is not finite")]
    BadInitGrad(),
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Invalid sampler configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid mass matrix: {0}")]
    MassMatrix(String),
    #[error("Adaptation failed")]
    Adapt(#[from] AdaptError),
}

pub type Result<T> = std::result::Result<T, SamplerError>;
