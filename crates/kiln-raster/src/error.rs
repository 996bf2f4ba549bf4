use thiserror::Error;

use crate::resource::{Format, ResourceId};

/// Soft failures surfaced by the engine.
///
/// Anything that would leave the backend rendering with undefined state is a
/// panic instead; these variants are the conditions a caller can recover from
/// by retrying later or taking a slower path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("format {format:?} is not supported for {usage}")]
    UnsupportedFormat { format: Format, usage: &'static str },

    #[error("sample count {requested} is not supported (max {max})")]
    UnsupportedSampleCount { requested: u32, max: u32 },

    #[error("blit from {src:?} to {dst:?} is not supported; fall back to a copy")]
    UnsupportedBlit { src: Format, dst: Format },

    #[error("resource {0} is still referenced by in-flight rendering")]
    NotReady(ResourceId),

    #[error("resource {0} has already released its storage")]
    Released(ResourceId),

    #[error("range {offset}..{end} is out of bounds for resource {id} ({size} bytes)")]
    OutOfBounds {
        id: ResourceId,
        offset: u64,
        end: u64,
        size: u64,
    },

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidConfig {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;
