//! Tag-mask reconstruction losses
//!
//! Losses that judge a reconstructed tag image by the statistics of the regions of the
//! tag mask it was rendered from. Segment statistics come from `burn-mask-split`.

pub mod backend;
mod error;
mod mask_loss;
mod segment;

pub use error::{DeepDecoderError, DeepDecoderResult};
pub use mask_loss::{MaskLoss, MaskLossConfig, MaskLossOutput};
pub use segment::{range_mean, segment_means, ClassRanges, SegmentMeans};

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    pub type TestBackend = NdArray;
    pub type TestAutodiffBackend = Autodiff<NdArray>;
}
