//! Compile-time backend choice for the benchmark binary.
//!
//! `cuda` wins over `wgpu`, which wins over the default `ndarray`.

use burn::tensor::Device;
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        pub type SelectedBackend = burn::backend::Cuda;
        pub const BACKEND_NAME: &str = "cuda";
    } else if #[cfg(feature = "wgpu")] {
        pub type SelectedBackend = burn::backend::Wgpu;
        pub const BACKEND_NAME: &str = "wgpu";
    } else {
        pub type SelectedBackend = burn::backend::NdArray;
        pub const BACKEND_NAME: &str = "ndarray";
    }
}

/// First device of [`SelectedBackend`].
pub fn default_device() -> Device<SelectedBackend> {
    Default::default()
}

#[cfg(test)]
mod tests {
    use burn::prelude::*;

    use super::*;

    #[test]
    #[cfg(not(any(feature = "cuda", feature = "wgpu")))]
    fn default_features_select_ndarray() {
        assert_eq!(BACKEND_NAME, "ndarray");

        let device = default_device();
        let ones = Tensor::<SelectedBackend, 1>::ones([3], &device);
        assert_eq!(ones.sum().into_scalar(), 3.0);
    }
}
