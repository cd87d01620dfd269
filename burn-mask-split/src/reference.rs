//! # Reference split
//!
//! Dense formulation of the mask split: one indicator mask per class, multiplied into the
//! image. It needs nothing beyond elementwise tensor operations, so it runs on every
//! backend and differentiates through ordinary autodiff. Memory grows with the number of
//! classes, which makes it the slow path on accelerators and the oracle for the fused
//! kernel everywhere else.

use burn::prelude::*;

use crate::{
    labels::ClassLut,
    split::{effective_batch, truncate, SplitGrads, SplitOutput, UpstreamGrad},
};

/// Splits `image` by the classes in `labels` with per-class indicator masks.
///
/// Produces the same volumes as [`mask_split`](crate::mask_split).
///
/// # Shapes
/// - labels: `[N1, 1, S, S]` with `S` even
/// - image: `[N2, 1, S, S]`
/// - output volumes: `[M, min(N1, N2), 1, S, S]`
///
/// # Panics
///
/// Panics on malformed shapes or non-`f32` inputs.
pub fn reference_split<B: Backend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    lut: &ClassLut,
) -> SplitOutput<B> {
    let batch = effective_batch(&labels, &image);
    let (labels, image) = truncate(labels, image, batch);

    let count = indicator_masks(&labels, lut);

    let image = image.unsqueeze_dim::<5>(0);
    let sum = count.clone() * image.clone();
    let pow = sum.clone() * image;

    SplitOutput { sum, pow, count }
}

/// Gradient of [`reference_split`] with respect to both inputs.
///
/// Same contract as [`mask_split_grad`](crate::mask_split_grad).
pub fn reference_split_grad<B: Backend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    upstream: UpstreamGrad<Tensor<B, 5>>,
    lut: &ClassLut,
) -> SplitGrads<B> {
    let batch = effective_batch(&labels, &image);
    let labels_grad = labels.zeros_like();
    let (labels, image) = truncate(labels, image, batch);

    let masks = indicator_masks(&labels, lut);
    let [_, channels, height, width] = image.dims();
    let project = |grad: Tensor<B, 5>| {
        assert_eq!(
            grad.dims(),
            [lut.num_classes(), batch, channels, height, width],
            "Upstream gradient shape must match the split volumes"
        );
        (grad * masks.clone()).sum_dim(0).squeeze::<4>(0)
    };

    let image_grad = match upstream {
        UpstreamGrad::Sum(sum) => project(sum),
        UpstreamGrad::Pow(pow) => project(pow) * image.mul_scalar(2.0),
        UpstreamGrad::Both { sum, pow } => project(sum) + project(pow) * image.mul_scalar(2.0),
    };

    SplitGrads {
        labels: labels_grad,
        image: image_grad,
    }
}

fn indicator_masks<B: Backend>(labels: &Tensor<B, 4>, lut: &ClassLut) -> Tensor<B, 5> {
    let masks = lut
        .codes()
        .iter()
        .map(|&code| labels.clone().equal_elem(code as f32).float())
        .collect();
    Tensor::stack(masks, 0)
}
