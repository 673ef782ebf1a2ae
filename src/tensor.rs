//! Model and tensor descriptors.
//!
//! These types describe what a loaded model looks like (inputs, outputs,
//! shapes, quantization) and what a single raw output node looks like when
//! it comes back from the device. The same [`TensorDescriptor`] is produced
//! by the container reader, by the raw result parser and by the checkpoint
//! decoder, so the layout and quantization codecs only ever see one shape.

use crate::error::{Error, Result};
use crate::wire;

/// Chip family a model was compiled for.
///
/// The target chip decides which firmware data-format table applies and
/// which channel ordering the NPU produces natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChip {
    Kl520,
    Kl720,
    Kl530,
    Kl730,
    Kl630,
    /// Unrecognized target id from the container.
    Unknown(u32),
}

impl From<u32> for TargetChip {
    fn from(v: u32) -> Self {
        match v {
            1 => TargetChip::Kl520,
            2 => TargetChip::Kl720,
            3 => TargetChip::Kl530,
            4 => TargetChip::Kl730,
            5 => TargetChip::Kl630,
            other => TargetChip::Unknown(other),
        }
    }
}

impl TargetChip {
    /// The chip family whose data-format table a device product uses.
    ///
    /// KL830 shares the KL730 NPU and therefore its tables.
    pub fn from_product_id(product_id: u16) -> Self {
        match product_id {
            wire::PRODUCT_ID_KL520 => TargetChip::Kl520,
            wire::PRODUCT_ID_KL720 => TargetChip::Kl720,
            wire::PRODUCT_ID_KL530 => TargetChip::Kl530,
            wire::PRODUCT_ID_KL630 => TargetChip::Kl630,
            wire::PRODUCT_ID_KL730 | wire::PRODUCT_ID_KL830 => TargetChip::Kl730,
            other => TargetChip::Unknown(other as u32),
        }
    }

    /// USB product id of the device running this chip, if there is one.
    pub fn product_id(&self) -> Option<u16> {
        match self {
            TargetChip::Kl520 => Some(wire::PRODUCT_ID_KL520),
            TargetChip::Kl720 => Some(wire::PRODUCT_ID_KL720),
            TargetChip::Kl530 => Some(wire::PRODUCT_ID_KL530),
            TargetChip::Kl630 => Some(wire::PRODUCT_ID_KL630),
            TargetChip::Kl730 => Some(wire::PRODUCT_ID_KL730),
            TargetChip::Unknown(_) => None,
        }
    }
}

/// Numeric element type, as carried by container and device metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    BFloat16,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 => 1,
            DType::Int16 | DType::UInt16 | DType::BFloat16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 => 8,
        }
    }

    /// Decode a type code used inside device frames.
    pub fn from_wire(code: u32) -> Option<Self> {
        Some(match code {
            wire::DTYPE_INT8 => DType::Int8,
            wire::DTYPE_INT16 => DType::Int16,
            wire::DTYPE_INT32 => DType::Int32,
            wire::DTYPE_INT64 => DType::Int64,
            wire::DTYPE_UINT8 => DType::UInt8,
            wire::DTYPE_UINT16 => DType::UInt16,
            wire::DTYPE_UINT32 => DType::UInt32,
            wire::DTYPE_UINT64 => DType::UInt64,
            wire::DTYPE_FLOAT32 => DType::Float32,
            wire::DTYPE_BFLOAT16 => DType::BFloat16,
            wire::DTYPE_DOUBLE64 => DType::Float64,
            _ => return None,
        })
    }
}

/// Quantization scale, kept in the type it was exported with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scale {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    /// Raw bfloat16 bits.
    BFloat16(u16),
    Float64(f64),
}

impl Scale {
    pub fn dtype(&self) -> DType {
        match self {
            Scale::Int8(_) => DType::Int8,
            Scale::Int16(_) => DType::Int16,
            Scale::Int32(_) => DType::Int32,
            Scale::Int64(_) => DType::Int64,
            Scale::UInt8(_) => DType::UInt8,
            Scale::UInt16(_) => DType::UInt16,
            Scale::UInt32(_) => DType::UInt32,
            Scale::UInt64(_) => DType::UInt64,
            Scale::Float32(_) => DType::Float32,
            Scale::BFloat16(_) => DType::BFloat16,
            Scale::Float64(_) => DType::Float64,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            Scale::Int8(v) => v as f32,
            Scale::Int16(v) => v as f32,
            Scale::Int32(v) => v as f32,
            Scale::Int64(v) => v as f32,
            Scale::UInt8(v) => v as f32,
            Scale::UInt16(v) => v as f32,
            Scale::UInt32(v) => v as f32,
            Scale::UInt64(v) => v as f32,
            Scale::Float32(v) => v,
            Scale::BFloat16(bits) => f32::from_bits((bits as u32) << 16),
            Scale::Float64(v) => v as f32,
        }
    }

    /// Read the `index`-th element of a packed little-endian scale array.
    pub fn read(dtype: DType, bytes: &[u8], index: usize) -> Result<Self> {
        let view = wire::ByteView::new(bytes);
        let off = index * dtype.size();
        Ok(match dtype {
            DType::Int8 => Scale::Int8(view.i8_at(off)?),
            DType::Int16 => Scale::Int16(view.i16_at(off)?),
            DType::Int32 => Scale::Int32(view.i32_at(off)?),
            DType::Int64 => Scale::Int64(view.i64_at(off)?),
            DType::UInt8 => Scale::UInt8(view.u8_at(off)?),
            DType::UInt16 => Scale::UInt16(view.u16_at(off)?),
            DType::UInt32 => Scale::UInt32(view.u32_at(off)?),
            DType::UInt64 => Scale::UInt64(view.u64_at(off)?),
            DType::Float32 => Scale::Float32(view.f32_at(off)?),
            DType::BFloat16 => Scale::BFloat16(view.u16_at(off)?),
            DType::Float64 => Scale::Float64(view.f64_at(off)?),
        })
    }
}

/// One `(radix, scale)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedPointDescriptor {
    pub radix: i32,
    pub scale: Scale,
}

/// Per-tensor or per-channel quantization parameters.
///
/// One descriptor means whole-tensor quantization; more than one means one
/// descriptor per slice along `quantized_axis`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationV1 {
    pub quantized_axis: u32,
    pub descriptors: Vec<FixedPointDescriptor>,
}

impl QuantizationV1 {
    pub fn is_channel_wise(&self) -> bool {
        self.descriptors.len() > 1
    }
}

/// Versioned quantization parameters. Only version 1 exists on the wire today.
#[derive(Debug, Clone, PartialEq)]
pub enum Quantization {
    V1(QuantizationV1),
}

impl Quantization {
    /// Whole-tensor quantization with a single float scale.
    pub fn single(quantized_axis: u32, radix: i32, scale: f32) -> Self {
        Quantization::V1(QuantizationV1 {
            quantized_axis,
            descriptors: vec![FixedPointDescriptor {
                radix,
                scale: Scale::Float32(scale),
            }],
        })
    }

    pub fn v1(&self) -> &QuantizationV1 {
        match self {
            Quantization::V1(q) => q,
        }
    }
}

/// Fixed 4-D shape description used by the legacy chips.
///
/// `npu_shape` and `onnx_shape` are `[N, C, H, W]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeInfoV1 {
    pub npu_shape: Vec<i32>,
    pub onnx_shape: Vec<i32>,
    pub axis_permutation_onnx_to_npu: Vec<i32>,
}

impl ShapeInfoV1 {
    /// NPU and ONNX shapes identical, identity permutation.
    pub fn identity(npu_shape: [i32; 4]) -> Self {
        Self {
            npu_shape: npu_shape.to_vec(),
            onnx_shape: npu_shape.to_vec(),
            axis_permutation_onnx_to_npu: vec![0, 1, 2, 3],
        }
    }
}

/// Arbitrary-rank shape with explicit ONNX and NPU strides (in elements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeInfoV2 {
    pub shape: Vec<i32>,
    pub stride_onnx: Vec<u32>,
    pub stride_npu: Vec<u32>,
}

impl ShapeInfoV2 {
    /// Build from a shape and NPU strides; ONNX strides are row-major.
    pub fn with_row_major_onnx(shape: Vec<i32>, stride_npu: Vec<u32>) -> Self {
        let stride_onnx = row_major_strides(&shape);
        Self {
            shape,
            stride_onnx,
            stride_npu,
        }
    }
}

/// Row-major strides for `shape`: rightmost axis has stride 1.
pub fn row_major_strides(shape: &[i32]) -> Vec<u32> {
    let mut strides = vec![1u32; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1].wrapping_mul(shape[axis + 1].max(0) as u32);
    }
    strides
}

/// Versioned shape description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeInfo {
    V1(ShapeInfoV1),
    V2(ShapeInfoV2),
}

impl ShapeInfo {
    /// The sequential (ONNX) shape a decoded tensor will have.
    pub fn onnx_shape(&self) -> &[i32] {
        match self {
            ShapeInfo::V1(v1) => &v1.onnx_shape,
            ShapeInfo::V2(v2) => &v2.shape,
        }
    }

    /// Product of all ONNX dimensions; negative extents count as zero and
    /// the count saturates at `usize::MAX`.
    pub fn num_elements(&self) -> usize {
        self.onnx_shape()
            .iter()
            .map(|&d| d.max(0) as usize)
            .fold(1, usize::saturating_mul)
    }
}

/// Element type a fixed-point decode produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixedPointDType {
    Int8,
    Int16,
}

/// How the NPU lays out one tensor in its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLayout {
    Npu4W4C8B,
    Npu1W16C8B,
    Npu16W1C8B,
    Npu8W1C16B,
    Npu4W4C8BHL,
    Npu16W1C8BHL,
    Npu1W16C8BHL,
    Npu1W16C8BChCompact,
    Npu1W16C8BHLChCompact,
    Raw8B,
    Raw16B,
    RawFloat,
    Unknown,
}

impl DataLayout {
    /// Map a firmware data-format code to a layout using the table of `chip`.
    ///
    /// Codes the chip does not produce map to [`DataLayout::Unknown`].
    ///
    /// | code | KL520 | KL720 | KL530 / KL630 | KL730 / KL830 |
    /// |---|---|---|---|---|
    /// | 0 | 4W4C8B | 1W16C8B | 1W16C8B | 1W16C8B |
    /// | 1 | 16W1C8B | 1W16C8BHL | 1W16C8BHL | 1W16C8BHL |
    /// | 2 | | 4W4C8B | 4W4C8B | 4W4C8B |
    /// | 3 | | 16W1C8B | 4W4C8BHL | 4W4C8BHL |
    /// | 4 | | 8W1C16B | 16W1C8B | 16W1C8B |
    /// | 5 | | | 16W1C8BHL | 16W1C8BHL |
    /// | 6 | | | 8W1C16B | 8W1C16B |
    /// | 7 | | | | 1W16C8B_CH_COMPACT |
    /// | 8 | | | | 1W16C8BHL_CH_COMPACT |
    /// | 100 | | RAW_8B | RAW_8B | RAW_8B |
    /// | 102 | | RAW_16B | RAW_16B | RAW_16B |
    /// | 126 | | RAW_FLOAT | RAW_FLOAT | RAW_FLOAT |
    pub fn from_format_code(code: u32, chip: TargetChip) -> Self {
        use DataLayout::*;
        match chip {
            TargetChip::Kl520 => match code {
                0 => Npu4W4C8B,
                1 => Npu16W1C8B,
                _ => Unknown,
            },
            TargetChip::Kl720 => match code {
                0 => Npu1W16C8B,
                1 => Npu1W16C8BHL,
                2 => Npu4W4C8B,
                3 => Npu16W1C8B,
                4 => Npu8W1C16B,
                100 => Raw8B,
                102 => Raw16B,
                126 => RawFloat,
                _ => Unknown,
            },
            TargetChip::Kl530 | TargetChip::Kl630 | TargetChip::Kl730 => match code {
                0 => Npu1W16C8B,
                1 => Npu1W16C8BHL,
                2 => Npu4W4C8B,
                3 => Npu4W4C8BHL,
                4 => Npu16W1C8B,
                5 => Npu16W1C8BHL,
                6 => Npu8W1C16B,
                7 if chip == TargetChip::Kl730 => Npu1W16C8BChCompact,
                8 if chip == TargetChip::Kl730 => Npu1W16C8BHLChCompact,
                100 => Raw8B,
                102 => Raw16B,
                126 => RawFloat,
                _ => Unknown,
            },
            TargetChip::Unknown(_) => Unknown,
        }
    }

    /// Element type of the fixed-point values this layout stores.
    pub fn fixed_point_dtype(&self) -> Option<FixedPointDType> {
        use DataLayout::*;
        match self {
            Npu4W4C8B | Npu1W16C8B | Npu1W16C8BChCompact | Npu16W1C8B | Raw8B => {
                Some(FixedPointDType::Int8)
            }
            Npu8W1C16B | Npu4W4C8BHL | Npu16W1C8BHL | Npu1W16C8BHL
            | Npu1W16C8BHLChCompact | Raw16B => Some(FixedPointDType::Int16),
            RawFloat | Unknown => None,
        }
    }

    /// High/low split 16-bit layouts.
    pub fn is_hl(&self) -> bool {
        matches!(
            self,
            DataLayout::Npu4W4C8BHL
                | DataLayout::Npu16W1C8BHL
                | DataLayout::Npu1W16C8BHL
                | DataLayout::Npu1W16C8BHLChCompact
        )
    }
}

/// One input or output tensor of a model, or one raw output node.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub index: u32,
    pub name: String,
    pub data_layout: DataLayout,
    pub shape_info: ShapeInfo,
    pub quantization: Quantization,
}

/// `major.minor.revision` of the container schema a model was exported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

/// Which device DDR region a [`BufferInfo`] entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLocation {
    Input,
    Output,
    Working,
    Weight,
    Unknown(u8),
}

impl From<u8> for BufferLocation {
    fn from(v: u8) -> Self {
        match v {
            0 => BufferLocation::Input,
            1 => BufferLocation::Output,
            2 => BufferLocation::Working,
            3 => BufferLocation::Weight,
            other => BufferLocation::Unknown(other),
        }
    }
}

/// Size of one device buffer a model needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub location: BufferLocation,
    pub len: u32,
}

/// One model inside a container.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleModelDescriptor {
    pub id: u32,
    pub target_chip: TargetChip,
    pub schema_version: SchemaVersion,
    pub input_nodes: Vec<TensorDescriptor>,
    pub output_nodes: Vec<TensorDescriptor>,
    pub buffer_info: Vec<BufferInfo>,
}

impl SingleModelDescriptor {
    /// Output buffer size the firmware reserves for this model, if declared.
    pub fn output_buffer_size(&self) -> Option<u32> {
        self.buffer_info
            .iter()
            .find(|b| b.location == BufferLocation::Output)
            .map(|b| b.len)
    }
}

/// Everything one container describes.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
    pub target_chip: TargetChip,
    pub models: Vec<SingleModelDescriptor>,
}

impl ModelDescriptor {
    pub fn model(&self, id: u32) -> Option<&SingleModelDescriptor> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Output buffer size of model `id`.
    ///
    /// # Errors
    ///
    /// - [`Error::ModelNotLoaded`] if no model has this id.
    /// - [`Error::InvalidModel`] if the model declares no output buffer.
    pub fn output_buffer_size(&self, id: u32) -> Result<u32> {
        let model = self.model(id).ok_or(Error::ModelNotLoaded(id))?;
        model
            .output_buffer_size()
            .ok_or_else(|| Error::InvalidModel(format!("model {} has no output buffer info", id)))
    }
}
