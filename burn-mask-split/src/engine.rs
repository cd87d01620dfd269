//! # Mask split engine
//!
//! [`MaskSplit`] bundles a compiled label table with the implementation path chosen for
//! the backend and a staging volume that is kept between calls. Build it from a
//! [`MaskSplitConfig`]; the label table is validated once, at construction.

use burn::prelude::*;

use crate::{
    backend::MaskSplitBackend,
    error::MaskSplitResult,
    labels::{ClassLut, LabelSet},
    reference::{reference_split, reference_split_grad},
    split::{
        effective_batch, mask_split_grad, split_into, staging_shape, SplitGrads, SplitOutput,
        UpstreamGrad,
    },
    stats::SegmentStats,
};

/// Which implementation a [`MaskSplit`] engine runs.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum SplitImpl {
    /// The fused kernel on accelerated backends, the reference path otherwise.
    Auto,
    /// Always the fused kernel.
    Kernel,
    /// Always the reference path.
    Reference,
}

/// The implementation an engine settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPath {
    Kernel,
    Reference,
}

impl SplitImpl {
    /// Resolves the requested implementation for backend `B`.
    pub fn resolve<B: MaskSplitBackend>(&self) -> SplitPath {
        let path = match self {
            SplitImpl::Auto if B::ACCELERATED => SplitPath::Kernel,
            SplitImpl::Auto => SplitPath::Reference,
            SplitImpl::Kernel => SplitPath::Kernel,
            SplitImpl::Reference => {
                if B::ACCELERATED {
                    tracing::warn!(
                        backend = core::any::type_name::<B>(),
                        "An accelerator is available but the reference mask split was \
                         requested, expect it to be slow"
                    );
                }
                SplitPath::Reference
            }
        };
        tracing::debug!(requested = ?self, ?path, "Resolved mask split implementation");
        path
    }
}

/// Configuration to create a [`MaskSplit`] engine.
#[derive(Config, Debug)]
pub struct MaskSplitConfig {
    /// Implementation to run.
    #[config(default = "SplitImpl::Auto")]
    pub implementation: SplitImpl,
}

impl MaskSplitConfig {
    /// Compiles `labels` and resolves the implementation for backend `B`.
    ///
    /// # Errors
    ///
    /// Returns an error when the label set does not compile.
    pub fn init<B: MaskSplitBackend>(&self, labels: &LabelSet) -> MaskSplitResult<MaskSplit<B>> {
        let lut = labels.compile()?;
        let path = self.implementation.resolve::<B>();

        Ok(MaskSplit {
            lut,
            path,
            staging: None,
            allocations: 0,
        })
    }
}

#[derive(Debug)]
struct Staging<B: Backend> {
    shape: [usize; 5],
    device: B::Device,
    zeros: Tensor<B, 5>,
}

/// Splits images by label class and differentiates the split.
///
/// The fused path keeps its zeroed staging volume between calls and only reallocates it
/// when the input shape or device changes. The engine holds on to its handle, so the
/// scatter of every call writes into a copy of the zeros and the cached volume stays
/// clean. What is saved is the zero fill, not the copy. Calls that may reallocate take
/// `&mut self`; share an engine between threads only behind a lock.
#[derive(Debug)]
pub struct MaskSplit<B: MaskSplitBackend> {
    lut: ClassLut,
    path: SplitPath,
    staging: Option<Staging<B>>,
    allocations: usize,
}

impl<B: MaskSplitBackend> MaskSplit<B> {
    /// Splits `image` by the classes in `labels`.
    ///
    /// # Shapes
    /// - labels: `[N1, 1, S, S]` with `S` even
    /// - image: `[N2, 1, S, S]`
    /// - output volumes: `[M, min(N1, N2), 1, S, S]`
    pub fn forward(&mut self, labels: Tensor<B, 4>, image: Tensor<B, 4>) -> SplitOutput<B> {
        match self.path {
            SplitPath::Reference => reference_split(labels, image, &self.lut),
            SplitPath::Kernel => {
                let batch = effective_batch(&labels, &image);
                let shape = staging_shape(&self.lut, batch, &image);
                let staging = self.staging(shape, &image.device());

                split_into(labels, image, staging, batch, &self.lut)
            }
        }
    }

    /// Gradient of [`forward`](Self::forward) for the connected upstream gradients.
    ///
    /// # Shapes
    /// - upstream: `[M, min(N1, N2), 1, S, S]` per connected output
    pub fn backward(
        &self,
        labels: Tensor<B, 4>,
        image: Tensor<B, 4>,
        upstream: UpstreamGrad<Tensor<B, 5>>,
    ) -> SplitGrads<B> {
        match self.path {
            SplitPath::Reference => reference_split_grad(labels, image, upstream, &self.lut),
            SplitPath::Kernel => mask_split_grad(labels, image, upstream, &self.lut),
        }
    }

    /// Per-segment mean, variance and count, shape `[M, min(N1, N2)]`.
    pub fn stats(&mut self, labels: Tensor<B, 4>, image: Tensor<B, 4>) -> SegmentStats<B> {
        self.forward(labels, image).mean_var_count()
    }

    pub fn lut(&self) -> &ClassLut {
        &self.lut
    }

    pub fn path(&self) -> SplitPath {
        self.path
    }

    pub fn num_classes(&self) -> usize {
        self.lut.num_classes()
    }

    /// How many staging volumes this engine has allocated so far.
    ///
    /// Counts cache misses on shape or device. Each forward call still copies the cached
    /// volume before scattering into it.
    pub fn staging_allocations(&self) -> usize {
        self.allocations
    }

    fn staging(&mut self, shape: [usize; 5], device: &B::Device) -> Tensor<B, 5> {
        if let Some(staging) = &self.staging {
            if staging.shape == shape && &staging.device == device {
                return staging.zeros.clone();
            }
        }

        tracing::debug!(?shape, ?device, "Allocating mask split staging volume");
        let zeros = Tensor::zeros(shape, device);
        self.allocations += 1;
        self.staging = Some(Staging {
            shape,
            device: device.clone(),
            zeros: zeros.clone(),
        });
        zeros
    }
}
