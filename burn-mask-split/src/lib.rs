//! Fused, differentiable segment statistics for the Burn deep learning framework
//!
//! Given a label map whose pixels carry integer class codes and an image of the same
//! size, this crate computes per-class masked image volumes and reduces them to
//! per-segment counts, means and variances. The forward split runs as one fused
//! classify-and-scatter on the backend and has a matching gradient, registered with
//! Burn's autodiff.

use burn::prelude::*;

#[cfg(feature = "autodiff")]
mod autodiff;
mod backend;
mod engine;
mod error;
mod labels;
mod reference;
mod split;
mod stats;

// Convenient re-exports
pub use backend::MaskSplitBackend;
pub use engine::{MaskSplit, MaskSplitConfig, SplitImpl, SplitPath};
pub use error::{MaskSplitError, MaskSplitResult};
pub use labels::{ClassLut, LabelClass, LabelSet, MaskClass, MAX_LABEL_CODE};
pub use reference::{reference_split, reference_split_grad};
pub use split::{mask_split, mask_split_grad, Connection, SplitGrads, SplitOutput, UpstreamGrad};
pub use stats::{segment_median, spatial_sum, to_mean_var_count, SegmentStats};

/// Mask split operations on image tensors.
pub trait TensorMaskSplit<B: MaskSplitBackend> {
    /// Splits the image by the classes in `labels`, see [`mask_split`].
    fn split_by(self, labels: Tensor<B, 4>, lut: &ClassLut) -> SplitOutput<B>;

    /// Per-segment mean, variance and count of the image.
    fn segment_stats(self, labels: Tensor<B, 4>, lut: &ClassLut) -> SegmentStats<B>;
}

impl<B: MaskSplitBackend> TensorMaskSplit<B> for Tensor<B, 4> {
    fn split_by(self, labels: Tensor<B, 4>, lut: &ClassLut) -> SplitOutput<B> {
        mask_split(labels, self, lut)
    }

    fn segment_stats(self, labels: Tensor<B, 4>, lut: &ClassLut) -> SegmentStats<B> {
        self.split_by(labels, lut).mean_var_count()
    }
}
