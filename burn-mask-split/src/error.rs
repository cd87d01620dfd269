//! Error types for mask splitting.
//!
//! Shape and dtype problems are programming errors and abort through assertions.
//! What remains recoverable is the preparation of the label table that every
//! split engine compiles once when it is built.

use thiserror::Error;

/// The error type for `burn-mask-split` operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaskSplitError {
    /// The label set has no classes to split into.
    #[error("Label set is empty")]
    EmptyLabelSet,

    /// Two classes share a name, so name lookups would be ambiguous.
    #[error("Duplicate class name: {name}")]
    DuplicateClassName {
        /// The repeated name.
        name: String,
    },

    /// Two classes share a code, so a pixel would belong to both.
    #[error("Classes {first} and {second} share label code {code}")]
    DuplicateClassCode {
        /// The shared code.
        code: u32,
        /// The first class using the code.
        first: String,
        /// The second class using the code.
        second: String,
    },

    /// A label code does not fit into the device lookup table.
    #[error("Label code {code} of class {name} exceeds the maximum of {max}")]
    LabelCodeOutOfRange {
        /// The class carrying the code.
        name: String,
        /// The offending code.
        code: u32,
        /// The largest supported code.
        max: u32,
    },
}

/// A specialized `Result` type for `burn-mask-split` operations.
pub type MaskSplitResult<T> = Result<T, MaskSplitError>;
