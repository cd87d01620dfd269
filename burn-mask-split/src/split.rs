//! # Mask split
//!
//! Checked entry points for the fused split and its gradient.
//!
//! `mask_split` partitions the pixels of every image by label class and returns, per
//! class, the masked image, the masked squared image and the class indicator. Summing
//! those volumes over their spatial axes gives per-segment sums, sums of squares and
//! pixel counts (see [`crate::stats`]).
//!
//! Label maps and images may disagree on batch size. Only the first
//! `min(label batch, image batch)` rows take part; the remaining rows are dropped from
//! every output.

use burn::{
    prelude::*,
    tensor::{DType, TensorPrimitive},
};

use crate::{backend::MaskSplitBackend, labels::ClassLut, stats::SegmentStats};

/// Which split outputs receive an upstream gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connection {
    /// Only the masked image.
    Sum,
    /// Only the masked squared image.
    Pow,
    /// Both outputs.
    Both,
}

/// Upstream gradients of a split, tagged by their connection.
///
/// The variant is fixed when the bundle is built and selects the gradient kernel.
#[derive(Debug, Clone)]
pub enum UpstreamGrad<T> {
    /// Gradient with respect to the masked image.
    Sum(T),
    /// Gradient with respect to the masked squared image.
    Pow(T),
    /// Gradients with respect to both outputs.
    Both {
        /// Gradient with respect to the masked image.
        sum: T,
        /// Gradient with respect to the masked squared image.
        pow: T,
    },
}

impl<T> UpstreamGrad<T> {
    /// Bundles whichever gradients are connected.
    ///
    /// # Panics
    ///
    /// Panics when neither gradient is present: there is nothing to differentiate.
    pub fn new(sum: Option<T>, pow: Option<T>) -> Self {
        match (sum, pow) {
            (Some(sum), Some(pow)) => Self::Both { sum, pow },
            (Some(sum), None) => Self::Sum(sum),
            (None, Some(pow)) => Self::Pow(pow),
            (None, None) => panic!(
                "At least the sum or the pow gradient must be connected, nothing to differentiate"
            ),
        }
    }

    /// The connection this bundle was built with.
    pub const fn connection(&self) -> Connection {
        match self {
            Self::Sum(_) => Connection::Sum,
            Self::Pow(_) => Connection::Pow,
            Self::Both { .. } => Connection::Both,
        }
    }

    /// Converts every gradient in the bundle, keeping the connection.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> UpstreamGrad<U> {
        match self {
            Self::Sum(sum) => UpstreamGrad::Sum(f(sum)),
            Self::Pow(pow) => UpstreamGrad::Pow(f(pow)),
            Self::Both { sum, pow } => UpstreamGrad::Both {
                sum: f(sum),
                pow: f(pow),
            },
        }
    }

    fn for_each(&self, mut f: impl FnMut(&T)) {
        match self {
            Self::Sum(grad) | Self::Pow(grad) => f(grad),
            Self::Both { sum, pow } => {
                f(sum);
                f(pow);
            }
        }
    }
}

/// Per-pixel split volumes.
///
/// Every tensor has shape `[classes, batch, 1, size, size]`.
#[derive(Debug, Clone)]
pub struct SplitOutput<B: Backend> {
    /// Image values of the pixels belonging to each class, zero elsewhere.
    pub sum: Tensor<B, 5>,
    /// Squared image values of the pixels belonging to each class, zero elsewhere.
    pub pow: Tensor<B, 5>,
    /// One for the pixels belonging to each class, zero elsewhere.
    pub count: Tensor<B, 5>,
}

impl<B: Backend> SplitOutput<B> {
    /// Splits a stacked `[3M, ...]` volume into its three blocks.
    pub fn from_stacked(stacked: Tensor<B, 5>, classes: usize) -> Self {
        Self {
            sum: stacked.clone().slice([0..classes]),
            pow: stacked.clone().slice([classes..2 * classes]),
            count: stacked.slice([2 * classes..3 * classes]),
        }
    }

    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.count.dims()[0]
    }

    /// Effective batch size.
    pub fn batch_size(&self) -> usize {
        self.count.dims()[1]
    }

    /// Reduces the volumes to per-segment mean, variance and count.
    pub fn mean_var_count(self) -> SegmentStats<B> {
        crate::stats::to_mean_var_count(self.sum, self.pow, self.count)
    }
}

/// Gradients of a split with respect to both of its inputs.
#[derive(Debug, Clone)]
pub struct SplitGrads<B: Backend> {
    /// Always zero: classification is a step function.
    ///
    /// Shaped like the label map that was passed in.
    pub labels: Tensor<B, 4>,
    /// Gradient with respect to the image, `[n, 1, S, S]` for the effective batch `n`.
    pub image: Tensor<B, 4>,
}

/// Splits `image` by the classes in `labels` with the fused kernel.
///
/// # Shapes
/// - labels: `[N1, 1, S, S]` with `S` even
/// - image: `[N2, 1, S, S]`
/// - output volumes: `[M, min(N1, N2), 1, S, S]`
///
/// # Panics
///
/// Panics on malformed shapes or non-`f32` inputs.
pub fn mask_split<B: MaskSplitBackend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    lut: &ClassLut,
) -> SplitOutput<B> {
    let batch = effective_batch(&labels, &image);
    let staging = Tensor::zeros(staging_shape(lut, batch, &image), &image.device());

    split_into(labels, image, staging, batch, lut)
}

/// Gradient of [`mask_split`] for the connected upstream gradients.
///
/// # Shapes
/// - labels: `[N1, 1, S, S]`
/// - image: `[N2, 1, S, S]`
/// - upstream: `[M, min(N1, N2), 1, S, S]` per connected output
///
/// # Panics
///
/// Panics on malformed shapes, non-`f32` inputs, or upstream gradients that do not
/// match the split volumes.
pub fn mask_split_grad<B: MaskSplitBackend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    upstream: UpstreamGrad<Tensor<B, 5>>,
    lut: &ClassLut,
) -> SplitGrads<B> {
    let batch = effective_batch(&labels, &image);
    let [_, batch_dim, channels, height, width] = staging_shape(lut, batch, &image);
    let expected = [lut.num_classes(), batch_dim, channels, height, width];
    upstream.for_each(|grad| {
        assert_eq!(
            grad.dims(),
            expected,
            "Upstream gradient shape must match the split volumes"
        );
    });

    let labels_grad = labels.zeros_like();
    let (labels, image) = truncate(labels, image, batch);

    let image_grad = B::mask_split_grad(
        labels.into_primitive().tensor(),
        image.into_primitive().tensor(),
        upstream.map(|grad| grad.into_primitive().tensor()),
        lut,
    );

    SplitGrads {
        labels: labels_grad,
        image: Tensor::from_primitive(TensorPrimitive::Float(image_grad)),
    }
}

/// Runs the fused kernel into `staging`, which must be a zero volume of
/// [`staging_shape`].
pub(crate) fn split_into<B: MaskSplitBackend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    staging: Tensor<B, 5>,
    batch: usize,
    lut: &ClassLut,
) -> SplitOutput<B> {
    let (labels, image) = truncate(labels, image, batch);

    let [sum, pow, count] = B::mask_split(
        labels.into_primitive().tensor(),
        image.into_primitive().tensor(),
        staging.into_primitive().tensor(),
        lut,
    )
    .map(|block| Tensor::from_primitive(TensorPrimitive::Float(block)));

    SplitOutput { sum, pow, count }
}

/// Shape of the stacked `[3M, n, 1, S, S]` volume.
pub(crate) fn staging_shape<B: Backend>(
    lut: &ClassLut,
    batch: usize,
    image: &Tensor<B, 4>,
) -> [usize; 5] {
    let [_, channels, height, width] = image.dims();
    [3 * lut.num_classes(), batch, channels, height, width]
}

/// Validates a label map / image pair and returns the effective batch size.
pub(crate) fn effective_batch<B: Backend>(labels: &Tensor<B, 4>, image: &Tensor<B, 4>) -> usize {
    let label_dims = labels.dims();
    let image_dims = image.dims();

    assert_shape_ok("label map", label_dims);
    assert_shape_ok("image", image_dims);
    assert_eq!(
        label_dims[2..],
        image_dims[2..],
        "Label map {label_dims:?} and image {image_dims:?} must have the same spatial size"
    );
    assert_eq!(labels.dtype(), DType::F32, "Label map must be float32");
    assert_eq!(image.dtype(), DType::F32, "Image must be float32");

    let batch = label_dims[0].min(image_dims[0]);
    assert!(batch > 0, "Mask split needs at least one image");
    batch
}

fn assert_shape_ok(what: &str, [_, channels, height, width]: [usize; 4]) {
    assert_eq!(channels, 1, "The {what} must have a single channel, got {channels}");
    assert_eq!(
        height, width,
        "Height and width of the {what} must be equal, got {height}x{width}"
    );
    assert!(
        height > 0 && height % 2 == 0,
        "Side length of the {what} must be even, got {height}"
    );
}

pub(crate) fn truncate<B: Backend>(
    labels: Tensor<B, 4>,
    image: Tensor<B, 4>,
    batch: usize,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let labels = if labels.dims()[0] > batch {
        labels.slice([0..batch])
    } else {
        labels
    };
    let image = if image.dims()[0] > batch {
        image.slice([0..batch])
    } else {
        image
    };
    (labels, image)
}

#[cfg(test)]
mod tests {
    use burn::tensor::{ops::FloatElem, Distribution, Tolerance, Transaction};

    use super::*;
    use crate::{
        labels::LabelSet,
        reference::reference_split,
        tests::{random_labels, two_block_scenario, TestBackend},
    };

    type FT = FloatElem<TestBackend>;

    fn assert_split_eq(actual: SplitOutput<TestBackend>, expected: SplitOutput<TestBackend>) {
        let [sum, pow, count, sum_ref, pow_ref, count_ref] = Transaction::default()
            .register(actual.sum)
            .register(actual.pow)
            .register(actual.count)
            .register(expected.sum)
            .register(expected.pow)
            .register(expected.count)
            .execute()
            .try_into()
            .expect("Correct amount of tensor data");

        let tolerance = Tolerance::<FT>::rel_abs(1e-4, 1e-4);
        sum.assert_approx_eq::<FT>(&sum_ref, tolerance);
        pow.assert_approx_eq::<FT>(&pow_ref, tolerance);
        count.assert_approx_eq::<FT>(&count_ref, tolerance);
    }

    #[test]
    fn mask_split_two_block_scenario() {
        let device = Default::default();
        let (set, labels, image) = two_block_scenario::<TestBackend>(&device);
        let lut = set.compile().expect("valid label set");

        let split = mask_split(labels, image, &lut);
        assert_eq!(split.sum.dims(), [2, 1, 1, 4, 4]);

        let sum = split.sum.sum_dim(4).sum_dim(3).sum_dim(2).reshape([2]);
        let pow = split.pow.sum_dim(4).sum_dim(3).sum_dim(2).reshape([2]);
        let count = split.count.sum_dim(4).sum_dim(3).sum_dim(2).reshape([2]);

        sum.into_data()
            .assert_approx_eq::<FT>(&TensorData::from([4.0, 36.0]), Tolerance::default());
        pow.into_data()
            .assert_approx_eq::<FT>(&TensorData::from([4.0, 108.0]), Tolerance::default());
        count
            .into_data()
            .assert_approx_eq::<FT>(&TensorData::from([4.0, 12.0]), Tolerance::default());
    }

    #[test]
    fn mask_split_assigns_every_pixel_to_one_class() {
        let device = Default::default();
        let set = LabelSet::tag_mask();
        let lut = set.compile().expect("tag mask compiles");

        let labels = random_labels::<TestBackend>(&set, [3, 1, 8, 8], &device);
        let image = Tensor::random([3, 1, 8, 8], Distribution::Default, &device);

        let split = mask_split(labels, image, &lut);
        let per_pixel = split.count.clone().sum_dim(0);
        let per_image = split.count.sum_dim(0).sum_dim(4).sum_dim(3).sum_dim(2);

        per_pixel.into_data().assert_approx_eq::<FT>(
            &Tensor::<TestBackend, 5>::ones([1, 3, 1, 8, 8], &device).into_data(),
            Tolerance::default(),
        );
        per_image.reshape([3]).into_data().assert_approx_eq::<FT>(
            &TensorData::from([64.0, 64.0, 64.0]),
            Tolerance::default(),
        );
    }

    #[test]
    fn mask_split_matches_reference_across_sizes() {
        let device = Default::default();
        let set = LabelSet::tag_mask();
        let lut = set.compile().expect("tag mask compiles");

        for (batch, size) in [(1, 2), (3, 2), (2, 8), (1, 64), (3, 64)] {
            let labels = random_labels::<TestBackend>(&set, [batch, 1, size, size], &device);
            let image = Tensor::random(
                [batch, 1, size, size],
                Distribution::Uniform(-1.0, 1.0),
                &device,
            );

            let kernel = mask_split(labels.clone(), image.clone(), &lut);
            let reference = reference_split(labels, image, &lut);
            assert_split_eq(kernel, reference);
        }
    }

    #[test]
    fn mask_split_truncates_to_smaller_batch() {
        let device = Default::default();
        let set = LabelSet::tag_mask();
        let lut = set.compile().expect("tag mask compiles");

        let labels = random_labels::<TestBackend>(&set, [3, 1, 4, 4], &device);
        let image = Tensor::<TestBackend, 4>::random([2, 1, 4, 4], Distribution::Default, &device);

        let split = mask_split(labels.clone(), image.clone(), &lut);
        assert_eq!(split.batch_size(), 2);
        assert_eq!(split.sum.dims(), [set.len(), 2, 1, 4, 4]);

        // Same result as splitting the matching rows only.
        let expected = mask_split(labels.slice([0..2]), image.clone(), &lut);
        assert_split_eq(split, expected);

        let split = mask_split(
            random_labels::<TestBackend>(&set, [1, 1, 4, 4], &device),
            image,
            &lut,
        );
        assert_eq!(split.batch_size(), 1);
    }

    #[test]
    #[should_panic(expected = "must be even")]
    fn mask_split_rejects_odd_side() {
        let device = Default::default();
        let lut = LabelSet::tag_mask().compile().expect("tag mask compiles");
        let labels = Tensor::<TestBackend, 4>::zeros([1, 1, 3, 3], &device);
        let image = Tensor::<TestBackend, 4>::zeros([1, 1, 3, 3], &device);

        let _ = mask_split(labels, image, &lut);
    }

    #[test]
    #[should_panic(expected = "must be equal")]
    fn mask_split_rejects_non_square() {
        let device = Default::default();
        let lut = LabelSet::tag_mask().compile().expect("tag mask compiles");
        let labels = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 6], &device);
        let image = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 6], &device);

        let _ = mask_split(labels, image, &lut);
    }

    #[test]
    #[should_panic(expected = "single channel")]
    fn mask_split_rejects_multiple_channels() {
        let device = Default::default();
        let lut = LabelSet::tag_mask().compile().expect("tag mask compiles");
        let labels = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);
        let image = Tensor::<TestBackend, 4>::zeros([1, 3, 4, 4], &device);

        let _ = mask_split(labels, image, &lut);
    }

    #[test]
    #[should_panic(expected = "same spatial size")]
    fn mask_split_rejects_mismatched_sizes() {
        let device = Default::default();
        let lut = LabelSet::tag_mask().compile().expect("tag mask compiles");
        let labels = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device);
        let image = Tensor::<TestBackend, 4>::zeros([1, 1, 8, 8], &device);

        let _ = mask_split(labels, image, &lut);
    }

    #[test]
    #[should_panic(expected = "nothing")]
    fn upstream_grad_requires_a_connection() {
        let _ = UpstreamGrad::<Tensor<TestBackend, 5>>::new(None, None);
    }

    #[test]
    fn upstream_grad_tags_connection() {
        assert_eq!(UpstreamGrad::new(Some(1), None).connection(), Connection::Sum);
        assert_eq!(UpstreamGrad::new(None, Some(2)).connection(), Connection::Pow);
        assert_eq!(
            UpstreamGrad::new(Some(1), Some(2)).connection(),
            Connection::Both
        );
    }

    /// Weighted sum of the split outputs, the scalar the finite differences probe.
    fn objective(
        labels: &Tensor<TestBackend, 4>,
        image: Tensor<TestBackend, 4>,
        lut: &ClassLut,
        weight_sum: Option<&Tensor<TestBackend, 5>>,
        weight_pow: Option<&Tensor<TestBackend, 5>>,
    ) -> f32 {
        let split = mask_split(labels.clone(), image, lut);
        let mut total = 0.0;
        if let Some(weight) = weight_sum {
            total += (split.sum * weight.clone()).sum().into_scalar();
        }
        if let Some(weight) = weight_pow {
            total += (split.pow * weight.clone()).sum().into_scalar();
        }
        total
    }

    fn check_against_finite_differences(connect_sum: bool, connect_pow: bool) {
        let device = Default::default();
        let set = LabelSet::new([("A", 0), ("B", 1), ("C", 2)]);
        let lut = set.compile().expect("valid label set");
        let shape = [2, 1, 2, 2];

        let labels = random_labels::<TestBackend>(&set, shape, &device);
        let image = Tensor::<TestBackend, 4>::random(shape, Distribution::Uniform(-1.0, 1.0), &device);
        let weights_shape = [set.len(), 2, 1, 2, 2];
        let weight_sum = connect_sum.then(|| {
            Tensor::<TestBackend, 5>::random(weights_shape, Distribution::Uniform(-1.0, 1.0), &device)
        });
        let weight_pow = connect_pow.then(|| {
            Tensor::<TestBackend, 5>::random(weights_shape, Distribution::Uniform(-1.0, 1.0), &device)
        });

        let upstream = UpstreamGrad::new(weight_sum.clone(), weight_pow.clone());
        let grads = mask_split_grad(labels.clone(), image.clone(), upstream, &lut);
        let analytic = grads.image.into_data().to_vec::<f32>().expect("float data");

        let pixels = image.to_data().to_vec::<f32>().expect("float data");
        let step = 1e-2;
        for (index, expected) in analytic.iter().enumerate() {
            let probe = |delta: f32| {
                let mut values = pixels.clone();
                values[index] += delta;
                let image = Tensor::from_data(TensorData::new(values, shape), &device);
                objective(&labels, image, &lut, weight_sum.as_ref(), weight_pow.as_ref())
            };
            let numeric = (probe(step) - probe(-step)) / (2.0 * step);
            assert!(
                (numeric - expected).abs() < 1e-2,
                "Pixel {index}: numeric gradient {numeric} vs analytic {expected}"
            );
        }

        grads
            .labels
            .into_data()
            .assert_eq(&Tensor::<TestBackend, 4>::zeros(shape, &device).into_data(), true);
    }

    #[test]
    fn mask_split_grad_sum_matches_finite_differences() {
        check_against_finite_differences(true, false);
    }

    #[test]
    fn mask_split_grad_pow_matches_finite_differences() {
        check_against_finite_differences(false, true);
    }

    #[test]
    fn mask_split_grad_both_matches_finite_differences() {
        check_against_finite_differences(true, true);
    }

    #[test]
    fn mask_split_grad_broadcasts_per_segment_gradient() {
        let device = Default::default();
        let (set, labels, image) = two_block_scenario::<TestBackend>(&device);
        let lut = set.compile().expect("valid label set");

        // d(sum_A)/dx = 1 on A pixels, d(pow_B)/dx = 2x on B pixels.
        let grad_sum = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0], &device)
            .reshape([2, 1, 1, 1, 1])
            .expand([2, 1, 1, 4, 4]);
        let grad_pow = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device)
            .reshape([2, 1, 1, 1, 1])
            .expand([2, 1, 1, 4, 4]);

        let grads = mask_split_grad(
            labels,
            image,
            UpstreamGrad::new(Some(grad_sum), Some(grad_pow)),
            &lut,
        );

        let expected = TensorData::new(
            vec![
                1.0_f32, 1.0, 6.0, 6.0, //
                1.0, 1.0, 6.0, 6.0, //
                6.0, 6.0, 6.0, 6.0, //
                6.0, 6.0, 6.0, 6.0,
            ],
            [1, 1, 4, 4],
        );
        grads
            .image
            .into_data()
            .assert_approx_eq::<FT>(&expected, Tolerance::default());
    }

    #[test]
    fn mask_split_grad_uses_effective_batch() {
        let device = Default::default();
        let set = LabelSet::tag_mask();
        let lut = set.compile().expect("tag mask compiles");

        let labels = random_labels::<TestBackend>(&set, [2, 1, 4, 4], &device);
        let image = Tensor::<TestBackend, 4>::random([3, 1, 4, 4], Distribution::Default, &device);
        let upstream = Tensor::<TestBackend, 5>::ones([set.len(), 2, 1, 4, 4], &device);

        let grads = mask_split_grad(labels, image, UpstreamGrad::new(Some(upstream), None), &lut);

        assert_eq!(grads.image.dims(), [2, 1, 4, 4]);
        assert_eq!(grads.labels.dims(), [2, 1, 4, 4]);
        grads.image.into_data().assert_approx_eq::<FT>(
            &Tensor::<TestBackend, 4>::ones([2, 1, 4, 4], &device).into_data(),
            Tolerance::default(),
        );
    }

    #[test]
    #[should_panic(expected = "Upstream gradient shape")]
    fn mask_split_grad_rejects_mismatched_upstream() {
        let device = Default::default();
        let set = LabelSet::tag_mask();
        let lut = set.compile().expect("tag mask compiles");

        let labels = random_labels::<TestBackend>(&set, [1, 1, 4, 4], &device);
        let image = Tensor::<TestBackend, 4>::zeros([1, 1, 4, 4], &device);
        let upstream = Tensor::<TestBackend, 5>::ones([set.len(), 1, 1, 2, 2], &device);

        let _ = mask_split_grad(labels, image, UpstreamGrad::new(None, Some(upstream)), &lut);
    }
}
