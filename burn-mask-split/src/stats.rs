//! Per-segment statistics computed from split volumes.

use burn::prelude::*;

/// Mean, variance and pixel count of every (class, batch) segment.
///
/// Every tensor has shape `[classes, batch]`.
#[derive(Debug, Clone)]
pub struct SegmentStats<B: Backend> {
    pub mean: Tensor<B, 2>,
    pub var: Tensor<B, 2>,
    pub count: Tensor<B, 2>,
}

impl<B: Backend> SegmentStats<B> {
    /// Statistics of a single class, shape `[1, batch]`.
    pub fn class(&self, index: usize) -> SegmentStats<B> {
        let pick = |t: &Tensor<B, 2>| t.clone().slice([index..index + 1]);
        SegmentStats {
            mean: pick(&self.mean),
            var: pick(&self.var),
            count: pick(&self.count),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.count.dims()[0]
    }

    pub fn batch_size(&self) -> usize {
        self.count.dims()[1]
    }
}

/// Sums a `[M, n, 1, S, S]` volume over its channel and spatial axes.
pub fn spatial_sum<B: Backend>(volume: Tensor<B, 5>) -> Tensor<B, 2> {
    let [classes, batch, ..] = volume.dims();
    volume
        .sum_dim(4)
        .sum_dim(3)
        .sum_dim(2)
        .reshape([classes, batch])
}

/// Reduces split volumes to per-segment mean, variance and pixel count.
///
/// Empty segments get a mean and variance of zero. The denominator is clamped to one
/// pixel, so neither the values nor their gradients become `NaN`.
pub fn to_mean_var_count<B: Backend>(
    sum: Tensor<B, 5>,
    pow: Tensor<B, 5>,
    count: Tensor<B, 5>,
) -> SegmentStats<B> {
    let count = spatial_sum(count);
    let denominator = count.clone().clamp_min(1.0);

    // Empty segments sum to zero, so the clamped division already yields zero.
    let mean = spatial_sum(sum) / denominator.clone();
    let var = spatial_sum(pow) / denominator - mean.clone().powi_scalar(2);

    SegmentStats { mean, var, count }
}

/// Median of the member pixels of every (class, batch) segment.
///
/// `masked` is a split volume of a non-negative image, so non-members are zero and
/// sort before every member. `count` holds the per-segment pixel counts as returned by
/// [`to_mean_var_count`]. Empty segments get a median of zero.
///
/// # Shapes
/// - masked: `[M, n, 1, S, S]`
/// - count: `[M, n]`
/// - output: `[M, n]`
pub fn segment_median<B: Backend>(masked: Tensor<B, 5>, count: Tensor<B, 2>) -> Tensor<B, 2> {
    let [classes, batch, channels, height, width] = masked.dims();
    let pixels = channels * height * width;

    let sorted = masked.reshape([classes, batch, pixels]).sort(2);

    let members = count.clone().round().int();
    let index = members
        .clone()
        .neg()
        .add_scalar(pixels as i64)
        .add(members.div_scalar(2))
        .clamp(0, pixels as i64 - 1)
        .reshape([classes, batch, 1]);

    let median = sorted.gather(2, index).reshape([classes, batch]);
    let empty = count.lower_equal_elem(0.0);
    median.mask_fill(empty, 0.0)
}
