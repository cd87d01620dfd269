//! # Mask loss
//!
//! Compares a reconstructed tag image with the tag mask it was rendered from. The loss
//! rewards a clear contrast between the black and white parts, a bright outer ring on a
//! flat background ring, and cells whose brightness is uniform and close to the mean of
//! their colour.

use burn::prelude::*;
use burn_mask_split::{
    LabelSet, MaskClass, MaskSplit, MaskSplitBackend, MaskSplitConfig, SegmentStats, SplitImpl,
};

use crate::{
    error::DeepDecoderResult,
    segment::{ClassRanges, SegmentMeans},
};

/// Weight of the background ring variance in the ring loss.
const BACKGROUND_VAR_WEIGHT: f64 = 0.25;

/// The outer white ring is large and only loosely constrained.
///
/// Its cell loss always uses a tenth of the configured mean weight and a fortieth of
/// the variance weight. This weighting is intended and applies to every loss built by
/// [`MaskLossConfig::init`].
const OUTER_RING_MEAN_DAMPING: f64 = 10.0;
/// See [`OUTER_RING_MEAN_DAMPING`].
const OUTER_RING_VAR_DAMPING: f64 = 40.0;

/// Configuration to create a [`MaskLoss`].
#[derive(Config, Debug)]
pub struct MaskLossConfig {
    /// Factor applied to every reported loss.
    #[config(default = "50.0")]
    pub scale: f64,
    /// Weight of the cell mean deviation.
    #[config(default = "1.0")]
    pub mean_weight: f64,
    /// Weight of the cell variance.
    #[config(default = "4.0")]
    pub var_weight: f64,
    /// Contrast between the white and black means below which the image is penalised.
    #[config(default = "0.25")]
    pub black_white_distance: f64,
    /// Contrast between the outer white ring and the background ring below which the
    /// image is penalised.
    #[config(default = "0.1")]
    pub ring_distance: f64,
    /// Cell mean deviations up to this value are free.
    #[config(default = "0.1")]
    pub mean_tolerance: f64,
    /// Mask split implementation.
    #[config(default = "SplitImpl::Auto")]
    pub implementation: SplitImpl,
}

impl MaskLossConfig {
    /// Initializes a mask loss over the tag-mask classes.
    pub fn init<B: MaskSplitBackend>(&self) -> DeepDecoderResult<MaskLoss<B>> {
        let labels = LabelSet::tag_mask();
        let ranges = ClassRanges::from_labels(&labels)?;
        let split = MaskSplitConfig::new()
            .with_implementation(self.implementation.clone())
            .init(&labels)?;

        let cells = MaskClass::BLACK
            .iter()
            .map(|&class| CellTarget {
                class,
                color: Color::Black,
                mean_weight: self.mean_weight,
                var_weight: self.var_weight,
            })
            .chain(MaskClass::WHITE.iter().map(|&class| {
                let (mean_weight, var_weight) = if class == MaskClass::OuterWhiteRing {
                    (
                        self.mean_weight / OUTER_RING_MEAN_DAMPING,
                        self.var_weight / OUTER_RING_VAR_DAMPING,
                    )
                } else {
                    (self.mean_weight, self.var_weight)
                };
                CellTarget {
                    class,
                    color: Color::White,
                    mean_weight,
                    var_weight,
                }
            }))
            .collect();

        Ok(MaskLoss {
            split,
            ranges,
            cells,
            scale: self.scale,
            black_white_distance: self.black_white_distance,
            ring_distance: self.ring_distance,
            mean_tolerance: self.mean_tolerance,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Black,
    White,
}

#[derive(Debug, Clone)]
struct CellTarget {
    class: MaskClass,
    color: Color,
    mean_weight: f64,
    var_weight: f64,
}

/// The terms of a mask loss, all multiplied by the configured scale.
#[derive(Debug, Clone)]
pub struct MaskLossOutput<B: Backend> {
    /// Mean over the batch of `loss_per_sample`, shape `[1]`.
    pub loss: Tensor<B, 1>,
    /// Shape `[batch]`.
    pub loss_per_sample: Tensor<B, 1>,
    /// Shape `[batch]`.
    pub black_white_loss: Tensor<B, 1>,
    /// Shape `[batch]`.
    pub ring_loss: Tensor<B, 1>,
    /// One row per black cell, then one per white cell, shape `[cells, batch]`.
    pub cell_losses: Tensor<B, 2>,
}

/// Tag-mask reconstruction loss.
#[derive(Debug)]
pub struct MaskLoss<B: MaskSplitBackend> {
    split: MaskSplit<B>,
    ranges: ClassRanges,
    cells: Vec<CellTarget>,
    scale: f64,
    black_white_distance: f64,
    ring_distance: f64,
    mean_tolerance: f64,
}

impl<B: MaskSplitBackend> MaskLoss<B> {
    /// Computes the loss of `image` against the tag mask `labels`.
    ///
    /// # Shapes
    /// - labels: `[N1, 1, S, S]` tag-mask codes, `S` even
    /// - image: `[N2, 1, S, S]`
    pub fn forward(&mut self, labels: Tensor<B, 4>, image: Tensor<B, 4>) -> MaskLossOutput<B> {
        let stats = self.split.stats(labels, image);
        self.forward_stats(&stats)
    }

    /// Computes the loss from precomputed tag-mask segment statistics.
    pub fn forward_stats(&self, stats: &SegmentStats<B>) -> MaskLossOutput<B> {
        let means = SegmentMeans::from_ranges(stats, &self.ranges);

        let black_white_loss = shortfall(
            means.white.clone() - means.black.clone(),
            self.black_white_distance,
        );

        let background = MaskClass::BackgroundRing.index();
        let ring_loss = shortfall(
            row(&stats.mean, MaskClass::OuterWhiteRing.index()) - row(&stats.mean, background),
            self.ring_distance,
        ) + row(&stats.var, background).mul_scalar(BACKGROUND_VAR_WEIGHT);

        let normalizer = self.cell_pixels(stats);
        let cell_losses = self
            .cells
            .iter()
            .map(|cell| {
                let target = match cell.color {
                    Color::Black => means.black.clone(),
                    Color::White => means.white.clone(),
                };
                self.cell_loss(stats, cell, target) / normalizer.clone()
            })
            .collect();
        let cell_losses = Tensor::stack::<2>(cell_losses, 0);

        let loss_per_sample =
            black_white_loss.clone() + ring_loss.clone() + cell_losses.clone().sum_dim(0).squeeze(0);

        MaskLossOutput {
            loss: loss_per_sample.clone().mean().mul_scalar(self.scale),
            loss_per_sample: loss_per_sample.mul_scalar(self.scale),
            black_white_loss: black_white_loss.mul_scalar(self.scale),
            ring_loss: ring_loss.mul_scalar(self.scale),
            cell_losses: cell_losses.mul_scalar(self.scale),
        }
    }

    pub fn split(&self) -> &MaskSplit<B> {
        &self.split
    }

    fn cell_loss(
        &self,
        stats: &SegmentStats<B>,
        cell: &CellTarget,
        target: Tensor<B, 1>,
    ) -> Tensor<B, 1> {
        let index = cell.class.index();
        let mean = row(&stats.mean, index);
        let var = row(&stats.var, index);
        let count = row(&stats.count, index);

        let tolerance = self.mean_tolerance * self.mean_tolerance;
        let mean_diff = (target - mean)
            .powi_scalar(2)
            .clamp_min(tolerance)
            .sub_scalar(tolerance);

        // Cells are weighted by their pixel count over the whole batch.
        let weight = count.clone().sum();
        let loss = (mean_diff.mul_scalar(cell.mean_weight) + var.mul_scalar(cell.var_weight))
            * weight;

        loss.mask_fill(count.equal_elem(0.0), 0.0)
    }

    /// Pixels of all classes but the background ring and the ignored region, shape `[1]`.
    fn cell_pixels(&self, stats: &SegmentStats<B>) -> Tensor<B, 1> {
        let background = MaskClass::BackgroundRing.index();
        let black = stats.count.clone().slice([0..background]).sum();
        let white = stats.count.clone().slice([self.ranges.white.clone()]).sum();

        (black + white).clamp_min(1.0)
    }
}

/// `(min(distance, minimum) − minimum)²`, zero once `distance` reaches `minimum`.
fn shortfall<B: Backend>(distance: Tensor<B, 1>, minimum: f64) -> Tensor<B, 1> {
    distance.clamp_max(minimum).sub_scalar(minimum).powi_scalar(2)
}

fn row<B: Backend>(tensor: &Tensor<B, 2>, index: usize) -> Tensor<B, 1> {
    tensor.clone().slice([index..index + 1]).squeeze(0)
}
