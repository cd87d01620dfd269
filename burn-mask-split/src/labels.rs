//! # Label classes
//!
//! A label map stores one float-encoded integer code per pixel. This module holds the
//! ordered class tables that give those codes a name and an index, and the compiled
//! lookup table the split kernels use to classify a whole label map in one gather.
//!
//! Class order matters: downstream losses select contiguous index ranges by looking up
//! class names, so a [`LabelSet`] keeps its classes exactly in declaration order.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{MaskSplitError, MaskSplitResult};

/// Largest label code a [`LabelSet`] may use.
///
/// Codes index a dense device lookup table, so they are kept small.
pub const MAX_LABEL_CODE: u32 = u16::MAX as u32;

/// The regions of a rendered tag mask, in their canonical order.
///
/// Black parts use codes below 128, white parts codes above it and the ignored
/// region sits exactly at 128.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskClass {
    InnerBlackSemicircle,
    Cell0Black,
    Cell1Black,
    Cell2Black,
    Cell3Black,
    Cell4Black,
    Cell5Black,
    Cell6Black,
    Cell7Black,
    Cell8Black,
    Cell9Black,
    Cell10Black,
    Cell11Black,
    BackgroundRing,
    Ignore,
    Cell0White,
    Cell1White,
    Cell2White,
    Cell3White,
    Cell4White,
    Cell5White,
    Cell6White,
    Cell7White,
    Cell8White,
    Cell9White,
    Cell10White,
    Cell11White,
    OuterWhiteRing,
    InnerWhiteSemicircle,
}

impl MaskClass {
    /// Every class in canonical order.
    pub const ALL: [Self; 29] = [
        Self::InnerBlackSemicircle,
        Self::Cell0Black,
        Self::Cell1Black,
        Self::Cell2Black,
        Self::Cell3Black,
        Self::Cell4Black,
        Self::Cell5Black,
        Self::Cell6Black,
        Self::Cell7Black,
        Self::Cell8Black,
        Self::Cell9Black,
        Self::Cell10Black,
        Self::Cell11Black,
        Self::BackgroundRing,
        Self::Ignore,
        Self::Cell0White,
        Self::Cell1White,
        Self::Cell2White,
        Self::Cell3White,
        Self::Cell4White,
        Self::Cell5White,
        Self::Cell6White,
        Self::Cell7White,
        Self::Cell8White,
        Self::Cell9White,
        Self::Cell10White,
        Self::Cell11White,
        Self::OuterWhiteRing,
        Self::InnerWhiteSemicircle,
    ];

    /// Parts of the tag that are printed black.
    pub const BLACK: [Self; 13] = [
        Self::InnerBlackSemicircle,
        Self::Cell0Black,
        Self::Cell1Black,
        Self::Cell2Black,
        Self::Cell3Black,
        Self::Cell4Black,
        Self::Cell5Black,
        Self::Cell6Black,
        Self::Cell7Black,
        Self::Cell8Black,
        Self::Cell9Black,
        Self::Cell10Black,
        Self::Cell11Black,
    ];

    /// Parts of the tag that are printed white.
    pub const WHITE: [Self; 14] = [
        Self::Cell0White,
        Self::Cell1White,
        Self::Cell2White,
        Self::Cell3White,
        Self::Cell4White,
        Self::Cell5White,
        Self::Cell6White,
        Self::Cell7White,
        Self::Cell8White,
        Self::Cell9White,
        Self::Cell10White,
        Self::Cell11White,
        Self::OuterWhiteRing,
        Self::InnerWhiteSemicircle,
    ];

    /// Stable label code written into mask images.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::InnerBlackSemicircle => 0,
            Self::Cell0Black => 1,
            Self::Cell1Black => 2,
            Self::Cell2Black => 3,
            Self::Cell3Black => 4,
            Self::Cell4Black => 5,
            Self::Cell5Black => 6,
            Self::Cell6Black => 7,
            Self::Cell7Black => 8,
            Self::Cell8Black => 9,
            Self::Cell9Black => 10,
            Self::Cell10Black => 11,
            Self::Cell11Black => 12,
            Self::BackgroundRing => 13,
            Self::Ignore => 128,
            Self::Cell0White => 129,
            Self::Cell1White => 130,
            Self::Cell2White => 131,
            Self::Cell3White => 132,
            Self::Cell4White => 133,
            Self::Cell5White => 134,
            Self::Cell6White => 135,
            Self::Cell7White => 136,
            Self::Cell8White => 137,
            Self::Cell9White => 138,
            Self::Cell10White => 139,
            Self::Cell11White => 140,
            Self::OuterWhiteRing => 141,
            Self::InnerWhiteSemicircle => 142,
        }
    }

    /// Canonical upper-case name of the class.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InnerBlackSemicircle => "INNER_BLACK_SEMICIRCLE",
            Self::Cell0Black => "CELL_0_BLACK",
            Self::Cell1Black => "CELL_1_BLACK",
            Self::Cell2Black => "CELL_2_BLACK",
            Self::Cell3Black => "CELL_3_BLACK",
            Self::Cell4Black => "CELL_4_BLACK",
            Self::Cell5Black => "CELL_5_BLACK",
            Self::Cell6Black => "CELL_6_BLACK",
            Self::Cell7Black => "CELL_7_BLACK",
            Self::Cell8Black => "CELL_8_BLACK",
            Self::Cell9Black => "CELL_9_BLACK",
            Self::Cell10Black => "CELL_10_BLACK",
            Self::Cell11Black => "CELL_11_BLACK",
            Self::BackgroundRing => "BACKGROUND_RING",
            Self::Ignore => "IGNORE",
            Self::Cell0White => "CELL_0_WHITE",
            Self::Cell1White => "CELL_1_WHITE",
            Self::Cell2White => "CELL_2_WHITE",
            Self::Cell3White => "CELL_3_WHITE",
            Self::Cell4White => "CELL_4_WHITE",
            Self::Cell5White => "CELL_5_WHITE",
            Self::Cell6White => "CELL_6_WHITE",
            Self::Cell7White => "CELL_7_WHITE",
            Self::Cell8White => "CELL_8_WHITE",
            Self::Cell9White => "CELL_9_WHITE",
            Self::Cell10White => "CELL_10_WHITE",
            Self::Cell11White => "CELL_11_WHITE",
            Self::OuterWhiteRing => "OUTER_WHITE_RING",
            Self::InnerWhiteSemicircle => "INNER_WHITE_SEMICIRCLE",
        }
    }

    /// Position of the class in [`MaskClass::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A named class with its label code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelClass {
    /// Name used for range lookups.
    pub name: String,
    /// Integer code stored in the label map.
    pub code: u32,
}

/// An ordered set of label classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSet {
    classes: Vec<LabelClass>,
}

impl LabelSet {
    /// Creates a label set from `(name, code)` pairs, keeping their order.
    pub fn new<S: Into<String>>(classes: impl IntoIterator<Item = (S, u32)>) -> Self {
        Self {
            classes: classes
                .into_iter()
                .map(|(name, code)| LabelClass {
                    name: name.into(),
                    code,
                })
                .collect(),
        }
    }

    /// The tag-mask classes of [`MaskClass::ALL`].
    pub fn tag_mask() -> Self {
        Self::new(MaskClass::ALL.iter().map(|class| (class.name(), class.code())))
    }

    /// Number of classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the set has no classes.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// The classes in order.
    pub fn classes(&self) -> &[LabelClass] {
        &self.classes
    }

    /// Index of the class called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|class| class.name == name)
    }

    /// Index of the class whose code equals the label value.
    ///
    /// Returns `None` for values outside the set, which well-formed label maps never
    /// contain.
    pub fn classify(&self, value: f32) -> Option<usize> {
        self.classes
            .iter()
            .position(|class| class.code as f32 == value)
    }

    /// Validates the set and builds the lookup table used by the split kernels.
    ///
    /// # Errors
    ///
    /// Fails for an empty set, repeated names or codes, and codes above
    /// [`MAX_LABEL_CODE`].
    pub fn compile(&self) -> MaskSplitResult<ClassLut> {
        if self.classes.is_empty() {
            return Err(MaskSplitError::EmptyLabelSet);
        }

        for (i, class) in self.classes.iter().enumerate() {
            if class.code > MAX_LABEL_CODE {
                return Err(MaskSplitError::LabelCodeOutOfRange {
                    name: class.name.clone(),
                    code: class.code,
                    max: MAX_LABEL_CODE,
                });
            }
            for earlier in &self.classes[..i] {
                if earlier.name == class.name {
                    return Err(MaskSplitError::DuplicateClassName {
                        name: class.name.clone(),
                    });
                }
                if earlier.code == class.code {
                    return Err(MaskSplitError::DuplicateClassCode {
                        code: class.code,
                        first: earlier.name.clone(),
                        second: class.name.clone(),
                    });
                }
            }
        }

        let max_code = self
            .classes
            .iter()
            .map(|class| class.code)
            .max()
            .unwrap_or_default();

        // Codes that belong to no class map to class 0; such pixels break the
        // label map contract anyway.
        let mut table = vec![0_i64; max_code as usize + 1];
        for (index, class) in self.classes.iter().enumerate() {
            table[class.code as usize] = index as i64;
        }

        Ok(ClassLut {
            codes: self.classes.iter().map(|class| class.code).collect(),
            table,
        })
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::tag_mask()
    }
}

/// A compiled label set: class codes in order plus a dense code→index table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLut {
    codes: Vec<u32>,
    table: Vec<i64>,
}

impl ClassLut {
    /// Number of classes.
    pub fn num_classes(&self) -> usize {
        self.codes.len()
    }

    /// Class codes in class order.
    pub fn codes(&self) -> &[u32] {
        &self.codes
    }

    /// Uploads the code→index table to `device`.
    pub fn table<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        Tensor::from_data(
            TensorData::new(self.table.clone(), [self.table.len()]),
            device,
        )
    }

    /// Classifies every pixel of a label map with a single gather.
    ///
    /// # Shapes
    /// - labels: `[batch, 1, size, size]`
    /// - output: `[batch, 1, size, size]` class indices
    pub fn classify<B: Backend>(&self, labels: Tensor<B, 4>) -> Tensor<B, 4, Int> {
        let dims = labels.dims();
        let device = labels.device();
        let max_code = (self.table.len() - 1) as i64;

        let codes = labels
            .round()
            .int()
            .clamp(0, max_code)
            .reshape([dims.iter().product::<usize>()]);

        self.table::<B>(&device).select(0, codes).reshape(dims)
    }
}
