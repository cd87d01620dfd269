//! # Split backend
//!
//! [`MaskSplitBackend`] extends a Burn backend with the two primitive operations behind
//! mask splitting. The default method bodies are the fused kernels:
//!
//! - **forward**: classify the label map with one gather through the compiled lookup
//!   table, then scatter `image`, `image²` and `1` into rows `c`, `M + c` and `2M + c`
//!   of a zeroed `[3M, n, 1, S, S]` staging volume in a single launch. The three blocks
//!   are handed out as separate tensors.
//! - **backward**: gather the upstream gradient rows of each pixel's class and apply the
//!   chain rule, `∂sum/∂x = 1` and `∂pow/∂x = 2x`.
//!
//! Backends that need a different implementation override the methods; `Autodiff`
//! does so to give the sum and pow blocks their own backward nodes.
//!
//! The primitive operations expect already validated inputs truncated to the effective
//! batch size. Use [`mask_split`](crate::mask_split) and
//! [`mask_split_grad`](crate::mask_split_grad) for the checked entry points.

use burn::{
    prelude::*,
    tensor::{ops::FloatTensor, TensorPrimitive},
};

use crate::{
    labels::ClassLut,
    split::{SplitOutput, UpstreamGrad},
};

/// A backend that can split images by label class.
pub trait MaskSplitBackend: Backend {
    /// Whether tensors of this backend live on an accelerator.
    ///
    /// Decides which path [`SplitImpl::Auto`](crate::SplitImpl::Auto) takes.
    const ACCELERATED: bool = false;

    /// Fused forward split.
    ///
    /// # Shapes
    /// - labels: `[n, 1, S, S]`
    /// - image: `[n, 1, S, S]`
    /// - staging: `[3M, n, 1, S, S]`, all zeros
    /// - output: `[sum, pow, count]`, each `[M, n, 1, S, S]`: the masked image, the masked
    ///   squared image and the class indicator
    fn mask_split(
        labels: FloatTensor<Self>,
        image: FloatTensor<Self>,
        staging: FloatTensor<Self>,
        lut: &ClassLut,
    ) -> [FloatTensor<Self>; 3] {
        let stacked = split_kernel::<Self>(
            Tensor::from_primitive(TensorPrimitive::Float(labels)),
            Tensor::from_primitive(TensorPrimitive::Float(image)),
            Tensor::from_primitive(TensorPrimitive::Float(staging)),
            lut,
        );
        let SplitOutput { sum, pow, count } =
            SplitOutput::from_stacked(stacked, lut.num_classes());

        [sum, pow, count].map(|block| block.into_primitive().tensor())
    }

    /// Gradient of the forward split with respect to the image.
    ///
    /// # Shapes
    /// - labels: `[n, 1, S, S]`
    /// - image: `[n, 1, S, S]`
    /// - upstream: `[M, n, 1, S, S]` per connected output
    /// - output: `[n, 1, S, S]`
    fn mask_split_grad(
        labels: FloatTensor<Self>,
        image: FloatTensor<Self>,
        upstream: UpstreamGrad<FloatTensor<Self>>,
        lut: &ClassLut,
    ) -> FloatTensor<Self> {
        let grad = split_grad_kernel::<Self>(
            Tensor::from_primitive(TensorPrimitive::Float(labels)),
            Tensor::from_primitive(TensorPrimitive::Float(image)),
            upstream.map(|grad| Tensor::from_primitive(TensorPrimitive::Float(grad))),
            lut,
        );
        grad.into_primitive().tensor()
    }
}

#[cfg(feature = "ndarray")]
impl MaskSplitBackend for burn::backend::NdArray {}

#[cfg(feature = "wgpu")]
impl MaskSplitBackend for burn::backend::Wgpu {
    const ACCELERATED: bool = true;
}

#[cfg(feature = "cuda")]
impl MaskSplitBackend for burn::backend::Cuda {
    const ACCELERATED: bool = true;
}

fn split_kernel<B: Backend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    staging: Tensor<B, 5>,
    lut: &ClassLut,
) -> Tensor<B, 5> {
    let classes = lut.num_classes() as i64;
    let class_index = lut.classify(labels).unsqueeze_dim::<5>(0);

    let indices = Tensor::cat(
        vec![
            class_index.clone(),
            class_index.clone().add_scalar(classes),
            class_index.add_scalar(2 * classes),
        ],
        0,
    );

    let image = image.unsqueeze_dim::<5>(0);
    let values = Tensor::cat(
        vec![image.clone(), image.clone() * image.clone(), image.ones_like()],
        0,
    );

    // Every (block, pixel) pair hits a distinct row, so the summing scatter assigns.
    staging.scatter(0, indices, values)
}

fn split_grad_kernel<B: Backend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    upstream: UpstreamGrad<Tensor<B, 5>>,
    lut: &ClassLut,
) -> Tensor<B, 4> {
    let dims = image.dims();
    let class_index = lut.classify(labels).unsqueeze_dim::<5>(0);
    let image = image.unsqueeze_dim::<5>(0);

    let grad = match upstream {
        UpstreamGrad::Sum(sum) => sum.gather(0, class_index),
        UpstreamGrad::Pow(pow) => pow.gather(0, class_index) * image.mul_scalar(2.0),
        UpstreamGrad::Both { sum, pow } => {
            sum.gather(0, class_index.clone()) + pow.gather(0, class_index) * image.mul_scalar(2.0)
        }
    };

    grad.reshape(dims)
}
