//! Error types for loss construction.

use burn_mask_split::MaskSplitError;
use thiserror::Error;

/// Error type for building tag-mask losses.
#[derive(Error, Debug)]
pub enum DeepDecoderError {
    /// The label set does not compile into a split engine.
    #[error("Failed to build the mask split engine")]
    MaskSplit(#[from] MaskSplitError),

    /// A class the loss looks up by name is missing.
    #[error("Label set has no class named {name}")]
    MissingClass {
        /// The missing class.
        name: String,
    },

    /// The ignore range reaches past the end of the label set.
    #[error("Label set needs a class after {name}, it has only {len} classes")]
    TruncatedLabelSet {
        /// The class that opens the ignore range.
        name: String,
        /// Number of classes in the set.
        len: usize,
    },
}

/// A specialized `Result` type for loss construction.
pub type DeepDecoderResult<T> = Result<T, DeepDecoderError>;
