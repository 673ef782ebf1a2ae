//! Fixed-point ↔ float conversion.
//!
//! The single quantization law used everywhere in this crate:
//!
//! ```text
//! factor = scale * 2^radix
//! float  = fixed / factor
//! fixed  = round(float * factor)
//! ```

use crate::error::{Error, Result};
use crate::tensor::{FixedPointDescriptor, FixedPointDType, QuantizationV1};

impl FixedPointDescriptor {
    /// `scale * 2^radix`.
    pub fn factor(&self) -> f32 {
        self.scale.as_f32() * 2f32.powi(self.radix)
    }
}

/// Convert one fixed-point value to float.
///
/// # Example
///
/// ```
/// use kneron_plus::quantization::dequantize;
/// use kneron_plus::tensor::{FixedPointDescriptor, Scale};
///
/// let d = FixedPointDescriptor { radix: 2, scale: Scale::Float32(1.0) };
/// assert_eq!(dequantize(12, &d), 3.0);
/// ```
pub fn dequantize(value: i32, descriptor: &FixedPointDescriptor) -> f32 {
    value as f32 / descriptor.factor()
}

/// Convert one float to fixed point, saturating to the range of `dtype`.
///
/// ```
/// use kneron_plus::quantization::quantize;
/// use kneron_plus::tensor::{FixedPointDescriptor, FixedPointDType, Scale};
///
/// let d = FixedPointDescriptor { radix: 7, scale: Scale::Float32(1.0) };
/// assert_eq!(quantize(0.5, &d, FixedPointDType::Int8), 64);
/// assert_eq!(quantize(4.0, &d, FixedPointDType::Int8), 127);
/// ```
pub fn quantize(value: f32, descriptor: &FixedPointDescriptor, dtype: FixedPointDType) -> i32 {
    let (lo, hi) = match dtype {
        FixedPointDType::Int8 => (i8::MIN as f32, i8::MAX as f32),
        FixedPointDType::Int16 => (i16::MIN as f32, i16::MAX as f32),
    };
    (value * descriptor.factor()).round().clamp(lo, hi) as i32
}

/// Picks the quantization factor for each element of a tensor walked in
/// ONNX (row-major) order.
///
/// For channel-wise quantization the descriptor index advances once every
/// `axis_stride` elements, where `axis_stride` is the product of every
/// extent except the quantized axis.
#[derive(Debug, Clone)]
pub struct FactorSelector {
    factors: Vec<f32>,
    axis_stride: usize,
    channel_wise: bool,
}

impl FactorSelector {
    /// Selector over the whole tensor's descriptors.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidModel`] if there are no descriptors at all.
    pub fn new(quant: &QuantizationV1, onnx_shape: &[i32]) -> Result<Self> {
        if quant.descriptors.is_empty() {
            return Err(Error::InvalidModel(
                "tensor carries no quantization descriptors".into(),
            ));
        }
        let channel_wise = quant.is_channel_wise();
        let axis_stride = if channel_wise {
            onnx_shape
                .iter()
                .enumerate()
                .filter(|(axis, _)| *axis != quant.quantized_axis as usize)
                .map(|(_, &d)| d.max(0) as usize)
                .fold(1, usize::saturating_mul)
                .max(1)
        } else {
            1
        };
        Ok(Self {
            factors: quant.descriptors.iter().map(|d| d.factor()).collect(),
            axis_stride,
            channel_wise,
        })
    }

    /// Selector that always uses the first descriptor.
    pub fn whole_tensor(quant: &QuantizationV1) -> Result<Self> {
        let first = quant.descriptors.first().ok_or_else(|| {
            Error::InvalidModel("tensor carries no quantization descriptors".into())
        })?;
        Ok(Self {
            factors: vec![first.factor()],
            axis_stride: 1,
            channel_wise: false,
        })
    }

    pub fn axis_stride(&self) -> usize {
        self.axis_stride
    }

    /// Descriptor index used for the element at `onnx_offset`.
    pub fn descriptor_index(&self, onnx_offset: usize) -> usize {
        if self.channel_wise {
            onnx_offset / self.axis_stride
        } else {
            0
        }
    }

    /// Factor for the element at `onnx_offset`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] if the tensor has more channel slices than
    /// descriptors.
    pub fn factor(&self, onnx_offset: usize) -> Result<f32> {
        let idx = self.descriptor_index(onnx_offset);
        self.factors.get(idx).copied().ok_or_else(|| {
            Error::InvalidParam(format!(
                "quantization descriptor {} out of range (have {})",
                idx,
                self.factors.len()
            ))
        })
    }

    /// Dequantize a whole tensor already in ONNX order.
    pub fn apply(&self, fixed: impl IntoIterator<Item = i32>) -> Result<Vec<f32>> {
        fixed
            .into_iter()
            .enumerate()
            .map(|(offset, v)| Ok(v as f32 / self.factor(offset)?))
            .collect()
    }
}
