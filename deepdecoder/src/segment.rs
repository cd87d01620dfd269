//! Black, white and ignore means of tag-mask segments.

use std::ops::Range;

use burn::prelude::*;
use burn_mask_split::{LabelSet, MaskClass, SegmentStats};

use crate::error::{DeepDecoderError, DeepDecoderResult};

/// Contiguous class ranges around the ignored region of a label set.
///
/// Black classes come before `IGNORE`, white classes after it. The ignore range covers
/// `IGNORE` and the class that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRanges {
    pub black: Range<usize>,
    pub white: Range<usize>,
    pub ignore: Range<usize>,
}

impl ClassRanges {
    /// Locates the `IGNORE` class in `labels`.
    pub fn from_labels(labels: &LabelSet) -> DeepDecoderResult<Self> {
        let name = MaskClass::Ignore.name();
        let ignore = labels
            .index_of(name)
            .ok_or_else(|| DeepDecoderError::MissingClass {
                name: name.to_string(),
            })?;

        let len = labels.len();
        if ignore + 2 > len {
            return Err(DeepDecoderError::TruncatedLabelSet {
                name: name.to_string(),
                len,
            });
        }

        Ok(Self {
            black: 0..ignore,
            white: ignore + 1..len,
            ignore: ignore..ignore + 2,
        })
    }
}

/// Per-sample means of the black, white and ignored parts of a tag mask.
///
/// Every tensor has shape `[batch]`.
#[derive(Debug, Clone)]
pub struct SegmentMeans<B: Backend> {
    pub black: Tensor<B, 1>,
    pub white: Tensor<B, 1>,
    pub ignore: Tensor<B, 1>,
}

impl<B: Backend> SegmentMeans<B> {
    pub fn from_ranges(stats: &SegmentStats<B>, ranges: &ClassRanges) -> Self {
        Self {
            black: range_mean(stats, ranges.black.clone()),
            white: range_mean(stats, ranges.white.clone()),
            ignore: range_mean(stats, ranges.ignore.clone()),
        }
    }
}

/// Count-weighted means over the black, white and ignore class ranges of `labels`.
///
/// Ranges without any pixel get a mean of zero.
pub fn segment_means<B: Backend>(
    stats: &SegmentStats<B>,
    labels: &LabelSet,
) -> DeepDecoderResult<SegmentMeans<B>> {
    let ranges = ClassRanges::from_labels(labels)?;
    Ok(SegmentMeans::from_ranges(stats, &ranges))
}

/// Mean over the pixels of all classes in `range`, shape `[batch]`.
pub fn range_mean<B: Backend>(stats: &SegmentStats<B>, range: Range<usize>) -> Tensor<B, 1> {
    let batch = stats.batch_size();
    if range.is_empty() {
        return Tensor::zeros([batch], &stats.mean.device());
    }

    let count = stats.count.clone().slice([range.clone()]);
    let weighted = (stats.mean.clone().slice([range]) * count.clone()).sum_dim(0);
    let total = count.sum_dim(0).clamp_min(1.0);

    (weighted / total).reshape([batch])
}
