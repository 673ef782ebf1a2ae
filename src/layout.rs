//! NPU memory layout → sequential (ONNX) layout.
//!
//! Two decode paths exist, selected by the node's [`ShapeInfo`] version:
//!
//! - **Legacy 4-D** ([`ShapeInfo::V1`]): a fixed `[N, C, H, W]` tensor whose
//!   rows are padded to the packing's width alignment. The caller may ask
//!   for a channel reordering, which is translated per chip into a
//!   [`ChannelOrderingConvert`].
//! - **Strided N-D** ([`ShapeInfo::V2`]): walk the ONNX index space in
//!   row-major order and project each index through the NPU strides. No
//!   reordering is possible on this path.
//!
//! ```text
//! 8W1C16B  (legacy)  i16, row width padded to 8
//! 1W16C8B  (legacy)  i8,  channels packed in blocks of 16:
//!                    addr = (c/16)*H*W*16 + h*W*16 + w*16 + c%16
//! other 8-bit        i8,  row width padded to 16 (RAW_8B/RAW_16B unpadded)
//! ```

use crate::error::{Error, Result};
use crate::quantization::FactorSelector;
use crate::raw_output::RawNodeOutput;
use crate::tensor::{DataLayout, FixedPointDType, Quantization, ShapeInfo, ShapeInfoV1, ShapeInfoV2};
use crate::wire::{self, ByteView};

const LEGACY_WIDTH_ALIGN_16B: usize = 8;
const LEGACY_WIDTH_ALIGN_8B: usize = 16;
const CHANNEL_BLOCK: usize = 16;
const HL_HIGH_PLANE_OFFSET: usize = 16;

/// Channel order the caller wants a legacy tensor in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrdering {
    Hcw,
    Chw,
    Hwc,
    /// Whatever the device produced.
    #[default]
    Default,
}

/// Concrete permutation applied while unpacking a legacy tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrderingConvert {
    None,
    Chw2Hcw,
    Hcw2Chw,
    Chw2Hwc,
    Hcw2Hwc,
}

impl ChannelOrderingConvert {
    /// Translate a requested ordering for a device product.
    ///
    /// KL520 produces HCW natively; KL720, KL630, KL730 and KL830 produce
    /// CHW. Every other device gets no permutation.
    ///
    /// ```
    /// use kneron_plus::layout::{ChannelOrdering, ChannelOrderingConvert};
    /// use kneron_plus::wire::{PRODUCT_ID_KL520, PRODUCT_ID_KL720};
    ///
    /// assert_eq!(
    ///     ChannelOrderingConvert::resolve(PRODUCT_ID_KL520, ChannelOrdering::Chw),
    ///     ChannelOrderingConvert::Hcw2Chw,
    /// );
    /// assert_eq!(
    ///     ChannelOrderingConvert::resolve(PRODUCT_ID_KL720, ChannelOrdering::Chw),
    ///     ChannelOrderingConvert::None,
    /// );
    /// ```
    pub fn resolve(product_id: u16, ordering: ChannelOrdering) -> Self {
        match product_id {
            wire::PRODUCT_ID_KL520 => match ordering {
                ChannelOrdering::Chw => ChannelOrderingConvert::Hcw2Chw,
                ChannelOrdering::Hwc => ChannelOrderingConvert::Hcw2Hwc,
                _ => ChannelOrderingConvert::None,
            },
            wire::PRODUCT_ID_KL720
            | wire::PRODUCT_ID_KL630
            | wire::PRODUCT_ID_KL730
            | wire::PRODUCT_ID_KL830 => match ordering {
                ChannelOrdering::Hcw => ChannelOrderingConvert::Chw2Hcw,
                ChannelOrdering::Hwc => ChannelOrderingConvert::Chw2Hwc,
                _ => ChannelOrderingConvert::None,
            },
            _ => ChannelOrderingConvert::None,
        }
    }

    fn source_is_hcw(&self) -> bool {
        matches!(self, ChannelOrderingConvert::Hcw2Chw | ChannelOrderingConvert::Hcw2Hwc)
    }

    fn target(&self) -> Order {
        match self {
            ChannelOrderingConvert::None | ChannelOrderingConvert::Hcw2Chw => Order::Chw,
            ChannelOrderingConvert::Chw2Hcw => Order::Hcw,
            ChannelOrderingConvert::Chw2Hwc | ChannelOrderingConvert::Hcw2Hwc => Order::Hwc,
        }
    }
}

#[derive(Clone, Copy)]
enum Order {
    Chw,
    Hcw,
    Hwc,
}

/// Decoded fixed-point values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixedPointData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
}

impl FixedPointData {
    pub fn len(&self) -> usize {
        match self {
            FixedPointData::Int8(v) => v.len(),
            FixedPointData::Int16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> FixedPointDType {
        match self {
            FixedPointData::Int8(_) => FixedPointDType::Int8,
            FixedPointData::Int16(_) => FixedPointDType::Int16,
        }
    }

    /// Values widened to `i32`.
    pub fn to_i32(&self) -> Vec<i32> {
        match self {
            FixedPointData::Int8(v) => v.iter().map(|&x| x as i32).collect(),
            FixedPointData::Int16(v) => v.iter().map(|&x| x as i32).collect(),
        }
    }
}

/// A node decoded to fixed point, still carrying its quantization so the
/// caller can dequantize later.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedNodeOutput {
    pub name: String,
    pub shape: Vec<i32>,
    pub data: FixedPointData,
    pub quantization: Quantization,
}

impl FixedNodeOutput {
    pub fn num_elements(&self) -> usize {
        self.data.len()
    }
}

/// A node decoded all the way to float.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatNodeOutput {
    pub name: String,
    pub shape: Vec<i32>,
    pub data: Vec<f32>,
}

/// Unpack a raw node into sequential fixed-point values.
///
/// The output shape is the node's ONNX shape; with a legacy permutation the
/// values come out in the requested channel order.
///
/// # Errors
///
/// - [`Error::InvalidDataLayout`] for a layout the selected path cannot
///   decode, a permutation on the N-D path, or an HCW-sourced permutation
///   on `1W16C8B` data.
/// - [`Error::TruncatedData`] if the node's payload is shorter than its
///   shape and strides require.
pub fn decode_fixed(raw: &RawNodeOutput<'_>, convert: ChannelOrderingConvert) -> Result<FixedNodeOutput> {
    let desc = &raw.descriptor;
    let data = match &desc.shape_info {
        ShapeInfo::V1(v1) => decode_legacy(v1, desc.data_layout, raw.data, convert)?,
        ShapeInfo::V2(v2) => {
            if convert != ChannelOrderingConvert::None {
                return Err(Error::InvalidDataLayout(format!(
                    "node '{}' only supports the default channel ordering",
                    desc.name
                )));
            }
            decode_strided(v2, desc.data_layout, raw.data)?
        }
    };

    Ok(FixedNodeOutput {
        name: desc.name.clone(),
        shape: desc.shape_info.onnx_shape().to_vec(),
        data,
        quantization: desc.quantization.clone(),
    })
}

/// [`decode_fixed`] followed by dequantization (`fixed / (scale * 2^radix)`).
///
/// Legacy nodes always use their first quantization descriptor; N-D nodes
/// with several descriptors are dequantized per channel slice.
pub fn decode_float(raw: &RawNodeOutput<'_>, convert: ChannelOrderingConvert) -> Result<FloatNodeOutput> {
    let fixed = decode_fixed(raw, convert)?;
    let quant = fixed.quantization.v1();
    let selector = match &raw.descriptor.shape_info {
        ShapeInfo::V1(_) => FactorSelector::whole_tensor(quant)?,
        ShapeInfo::V2(v2) => FactorSelector::new(quant, &v2.shape)?,
    };
    let data = selector.apply(fixed.data.to_i32())?;
    Ok(FloatNodeOutput {
        name: fixed.name,
        shape: fixed.shape,
        data,
    })
}

fn dim(v: i32, what: &str) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::InvalidDataLayout(format!("negative {} {}", what, v)))
}

fn decode_legacy(
    v1: &ShapeInfoV1,
    layout: DataLayout,
    data: &[u8],
    convert: ChannelOrderingConvert,
) -> Result<FixedPointData> {
    if v1.npu_shape.len() != 4 {
        return Err(Error::InvalidDataLayout(format!(
            "legacy NPU shape must be 4-D, got {}-D",
            v1.npu_shape.len()
        )));
    }
    let channel = dim(v1.npu_shape[1], "channel")?;
    let height = dim(v1.npu_shape[2], "height")?;
    let width = dim(v1.npu_shape[3], "width")?;
    let overflow = || Error::InvalidDataLayout(format!("legacy shape {:?} overflows", v1.npu_shape));
    let count = wire::checked_extent(&[channel, height, width]).ok_or_else(overflow)?;
    let view = ByteView::new(data);

    match layout {
        DataLayout::Npu8W1C16B | DataLayout::Raw16B => {
            let aligned = if layout == DataLayout::Raw16B {
                width
            } else {
                wire::round_up(width, LEGACY_WIDTH_ALIGN_16B)
            };
            if count > 0 {
                let end = padded_rows_end(channel, height, aligned, width).ok_or_else(overflow)?;
                ensure_span(&view, end, 2)?;
            }
            let src = padded_rows(channel, height, aligned, convert.source_is_hcw());
            gather(channel, height, width, count, convert.target(), src)
                .into_iter()
                .map(|i| view.i16_at(i * 2))
                .collect::<Result<Vec<_>>>()
                .map(FixedPointData::Int16)
        }
        DataLayout::Npu1W16C8B => {
            if convert.source_is_hcw() {
                return Err(Error::InvalidDataLayout(format!(
                    "{:?} cannot be applied to 1W16C8B data",
                    convert
                )));
            }
            if count > 0 {
                let end = channel_blocks_end(channel, height, width).ok_or_else(overflow)?;
                ensure_span(&view, end, 1)?;
            }
            let block = height * width * CHANNEL_BLOCK;
            let src = move |c: usize, h: usize, w: usize| {
                (c / CHANNEL_BLOCK) * block + h * width * CHANNEL_BLOCK + w * CHANNEL_BLOCK + c % CHANNEL_BLOCK
            };
            gather(channel, height, width, count, convert.target(), src)
                .into_iter()
                .map(|i| view.i8_at(i))
                .collect::<Result<Vec<_>>>()
                .map(FixedPointData::Int8)
        }
        DataLayout::Npu4W4C8B
        | DataLayout::Npu16W1C8B
        | DataLayout::Npu1W16C8BChCompact
        | DataLayout::Raw8B => {
            let aligned = if layout == DataLayout::Raw8B {
                width
            } else {
                wire::round_up(width, LEGACY_WIDTH_ALIGN_8B)
            };
            if count > 0 {
                let end = padded_rows_end(channel, height, aligned, width).ok_or_else(overflow)?;
                ensure_span(&view, end, 1)?;
            }
            let src = padded_rows(channel, height, aligned, convert.source_is_hcw());
            gather(channel, height, width, count, convert.target(), src)
                .into_iter()
                .map(|i| view.i8_at(i))
                .collect::<Result<Vec<_>>>()
                .map(FixedPointData::Int8)
        }
        other => Err(Error::InvalidDataLayout(format!(
            "{:?} is not decodable on the legacy 4-D path",
            other
        ))),
    }
}

/// One past the highest element address a legacy node reads, in either
/// channel order. All extents must be non-zero.
fn padded_rows_end(channel: usize, height: usize, aligned_width: usize, width: usize) -> Option<usize> {
    wire::checked_extent(&[channel, height, aligned_width])?
        .checked_sub(aligned_width)?
        .checked_add(width)
}

fn channel_blocks_end(channel: usize, height: usize, width: usize) -> Option<usize> {
    let plane = height.checked_mul(width)?;
    let block = plane.checked_mul(CHANNEL_BLOCK)?;
    ((channel - 1) / CHANNEL_BLOCK)
        .checked_mul(block)?
        .checked_add((plane - 1) * CHANNEL_BLOCK + (channel - 1) % CHANNEL_BLOCK + 1)
}

/// Fail before touching the payload if it cannot hold `elements` values.
fn ensure_span(view: &ByteView<'_>, elements: usize, element_size: usize) -> Result<()> {
    let len = elements
        .checked_mul(element_size)
        .ok_or_else(|| Error::InvalidDataLayout(format!("{} elements overflow the address space", elements)))?;
    view.slice(0, len).map(|_| ())
}

/// Output buffer for `count` values, reporting a failed reservation.
fn output<T>(count: usize) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(count)
        .map_err(|_| Error::AllocationFailure(count.saturating_mul(std::mem::size_of::<T>())))?;
    Ok(out)
}

/// Element address inside row-padded CHW or HCW storage.
fn padded_rows(
    channel: usize,
    height: usize,
    aligned_width: usize,
    hcw: bool,
) -> impl Fn(usize, usize, usize) -> usize {
    move |c, h, w| {
        if hcw {
            h * channel * aligned_width + c * aligned_width + w
        } else {
            c * height * aligned_width + h * aligned_width + w
        }
    }
}

/// Source element indices in output order.
fn gather(
    channel: usize,
    height: usize,
    width: usize,
    count: usize,
    target: Order,
    src: impl Fn(usize, usize, usize) -> usize,
) -> Vec<usize> {
    let mut out = Vec::with_capacity(count);
    match target {
        Order::Chw => {
            for c in 0..channel {
                for h in 0..height {
                    for w in 0..width {
                        out.push(src(c, h, w));
                    }
                }
            }
        }
        Order::Hcw => {
            for h in 0..height {
                for c in 0..channel {
                    for w in 0..width {
                        out.push(src(c, h, w));
                    }
                }
            }
        }
        Order::Hwc => {
            for h in 0..height {
                for w in 0..width {
                    for c in 0..channel {
                        out.push(src(c, h, w));
                    }
                }
            }
        }
    }
    out
}

/// Extra offset that skips the padding between 16-channel groups.
#[derive(Clone, Copy)]
struct ChannelGroupCorrection {
    axis: usize,
    stride: usize,
}

impl ChannelGroupCorrection {
    fn locate(shape: &[usize], stride_npu: &[usize]) -> Result<Self> {
        let axis = stride_npu
            .iter()
            .rposition(|&s| s == 1)
            .ok_or_else(|| Error::InvalidDataLayout("channel-packed node has no unit-stride axis".into()))?;
        let widest = shape
            .iter()
            .zip(stride_npu)
            .enumerate()
            .filter(|(a, _)| *a != axis)
            .map(|(_, (&d, &s))| d.saturating_mul(s))
            .max()
            .unwrap_or(0);
        Ok(Self {
            axis,
            stride: widest.saturating_sub(CHANNEL_BLOCK),
        })
    }

    fn apply(&self, offset: usize, index: &[usize]) -> usize {
        offset + (index[self.axis] >> 4) * self.stride
    }
}

/// NPU element offset of the last ONNX index, which is the largest offset
/// the walk can reach. `shape` must have no zero extent.
fn last_npu_offset(
    shape: &[usize],
    stride_npu: &[usize],
    correction: Option<ChannelGroupCorrection>,
) -> Option<usize> {
    let base = shape
        .iter()
        .zip(stride_npu)
        .try_fold(0usize, |acc, (&d, &s)| (d - 1).checked_mul(s)?.checked_add(acc))?;
    match correction {
        Some(c) => ((shape[c.axis] - 1) >> 4).checked_mul(c.stride)?.checked_add(base),
        None => Some(base),
    }
}

/// Visit every ONNX index in row-major order (innermost axis fastest).
fn walk_onnx(shape: &[usize], mut visit: impl FnMut(&[usize]) -> Result<()>) -> Result<()> {
    if shape.iter().any(|&d| d == 0) {
        return Ok(());
    }
    let mut index = vec![0usize; shape.len()];
    loop {
        visit(&index)?;
        let mut axis = shape.len();
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

fn decode_strided(v2: &ShapeInfoV2, layout: DataLayout, data: &[u8]) -> Result<FixedPointData> {
    if v2.stride_npu.len() != v2.shape.len() {
        return Err(Error::InvalidDataLayout(format!(
            "{} NPU strides for a {}-D shape",
            v2.stride_npu.len(),
            v2.shape.len()
        )));
    }
    if matches!(layout, DataLayout::RawFloat | DataLayout::Unknown) {
        return Err(Error::InvalidDataLayout(format!(
            "{:?} is not decodable on the N-D path",
            layout
        )));
    }
    let shape = v2
        .shape
        .iter()
        .map(|&d| dim(d, "extent"))
        .collect::<Result<Vec<_>>>()?;
    let stride_npu: Vec<usize> = v2.stride_npu.iter().map(|&s| s as usize).collect();
    let overflow = || {
        Error::InvalidDataLayout(format!(
            "shape {:?} with NPU strides {:?} overflows",
            v2.shape, v2.stride_npu
        ))
    };
    let num = wire::checked_extent(&shape).ok_or_else(overflow)?;
    let view = ByteView::new(data);

    let correction = match layout {
        DataLayout::Npu1W16C8B | DataLayout::Npu1W16C8BHL => {
            Some(ChannelGroupCorrection::locate(&shape, &stride_npu)?)
        }
        _ => None,
    };
    if num > 0 {
        let last = last_npu_offset(&shape, &stride_npu, correction).ok_or_else(overflow)?;
        let end = match layout {
            DataLayout::Npu8W1C16B | DataLayout::Raw16B => last.checked_add(1).and_then(|n| n.checked_mul(2)),
            DataLayout::Npu4W4C8BHL
            | DataLayout::Npu1W16C8BHL
            | DataLayout::Npu1W16C8BHLChCompact
            | DataLayout::Npu16W1C8BHL => ((last >> 4) << 5)
                .checked_add((last & 15) + HL_HIGH_PLANE_OFFSET + 1),
            _ => last.checked_add(1),
        };
        ensure_span(&view, end.ok_or_else(overflow)?, 1)?;
    }
    let npu_offset = |index: &[usize]| -> usize {
        let off = index.iter().zip(&stride_npu).map(|(i, s)| i * s).sum();
        match correction {
            Some(c) => c.apply(off, index),
            None => off,
        }
    };

    match layout {
        DataLayout::Npu4W4C8B
        | DataLayout::Npu1W16C8B
        | DataLayout::Npu1W16C8BChCompact
        | DataLayout::Npu16W1C8B
        | DataLayout::Raw8B => {
            let mut out = output(num)?;
            walk_onnx(&shape, |index| {
                out.push(view.i8_at(npu_offset(index))?);
                Ok(())
            })?;
            Ok(FixedPointData::Int8(out))
        }
        DataLayout::Npu8W1C16B | DataLayout::Raw16B => {
            let mut out = output(num)?;
            walk_onnx(&shape, |index| {
                let word = view.u16_at(npu_offset(index) * 2)?;
                out.push((word & 0xfffe) as i16);
                Ok(())
            })?;
            Ok(FixedPointData::Int16(out))
        }
        DataLayout::Npu4W4C8BHL
        | DataLayout::Npu1W16C8BHL
        | DataLayout::Npu1W16C8BHLChCompact
        | DataLayout::Npu16W1C8BHL => {
            let mut out = output(num)?;
            walk_onnx(&shape, |index| {
                let off = npu_offset(index);
                let off = ((off >> 4) << 5) + (off & 15);
                let low = view.u8_at(off)? as u16;
                let high = view.u8_at(off + HL_HIGH_PLANE_OFFSET)? as u16;
                out.push((((low & 0x7f) + (high << 7)) << 1) as i16);
                Ok(())
            })?;
            Ok(FixedPointData::Int16(out))
        }
        other => Err(Error::InvalidDataLayout(format!(
            "{:?} is not decodable on the N-D path",
            other
        ))),
    }
}
