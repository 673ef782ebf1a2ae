//! Raw inference result parsing.
//!
//! A result frame is a header (v1 fixed or v2 offset-addressed, told apart
//! by the stamp's magic) followed by a chip-specific raw output region:
//!
//! ```text
//! magic      product        raw region
//! INFERENCE  KL520          out_node_num, node_metadata[n], payloads
//! INFERENCE  KL720          total_raw_len, total_nodes, onode[40] (56 B), payloads
//! INFERENCE  KL530/KL630    total_raw_len, total_nodes, onode[40] (52 B), payloads
//! INFERENCE  KL730/KL830    total_raw_len, total_nodes, onode[40] (56 B, u64 addr), payloads
//! INFERENCE_V2 KL730/KL830  npu_data_header { schema, size, node_num, node_header_v2[n], blob }
//! ```
//!
//! Node payloads are borrowed from the caller's buffer; nothing is copied.

use log::debug;

use crate::error::{Error, Result};
use crate::tensor::{
    DType, DataLayout, FixedPointDescriptor, Quantization, QuantizationV1, Scale, ShapeInfo,
    ShapeInfoV1, ShapeInfoV2, TargetChip, TensorDescriptor,
};
use crate::wire::{self, ByteView, HeaderStamp};

/// One output node still in NPU layout, borrowing its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNodeOutput<'a> {
    pub descriptor: TensorDescriptor,
    pub data: &'a [u8],
}

impl<'a> RawNodeOutput<'a> {
    pub fn new(descriptor: TensorDescriptor, data: &'a [u8]) -> Self {
        Self { descriptor, data }
    }

    pub fn num_bytes(&self) -> usize {
        self.data.len()
    }
}

/// One crop rectangle of an image inference request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CropBox {
    pub crop_box_index: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropBox {
    pub(crate) fn parse(view: &ByteView<'_>, offset: usize) -> Result<Self> {
        let w = view.u32_array(offset, 5)?;
        Ok(Self {
            crop_box_index: w[0],
            x: w[1],
            y: w[2],
            width: w[3],
            height: w[4],
        })
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        for v in [self.crop_box_index, self.x, self.y, self.width, self.height] {
            wire::put_u32(out, v);
        }
    }
}

/// How the device pre-processed one input before running the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreProcInfo {
    pub img_width: u32,
    pub img_height: u32,
    pub resized_img_width: u32,
    pub resized_img_height: u32,
    pub pad_top: u32,
    pub pad_bottom: u32,
    pub pad_left: u32,
    pub pad_right: u32,
    pub model_input_width: u32,
    pub model_input_height: u32,
    pub crop_area: CropBox,
}

impl PreProcInfo {
    fn parse(view: &ByteView<'_>, offset: usize) -> Result<Self> {
        let w = view.u32_array(offset, 10)?;
        Ok(Self {
            img_width: w[0],
            img_height: w[1],
            resized_img_width: w[2],
            resized_img_height: w[3],
            pad_top: w[4],
            pad_bottom: w[5],
            pad_left: w[6],
            pad_right: w[7],
            model_input_width: w[8],
            model_input_height: w[9],
            crop_area: CropBox::parse(view, offset + 40)?,
        })
    }
}

/// Result frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultVersion {
    V1,
    V2,
}

/// Decoded header of an inference result frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultHeader {
    pub stamp: HeaderStamp,
    pub version: ResultVersion,
    pub inference_number: u32,
    pub crop_number: u32,
    pub num_output_node: u32,
    pub product_id: u16,
    pub is_last_crop: bool,
    pub pre_proc_info: Vec<PreProcInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawLayout {
    Kl520,
    Onode(OnodeKind),
    NpuData,
}

/// Onode table generations of the v1 result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnodeKind {
    Kl720,
    Kl630(TargetChip),
    Kl730,
}

impl OnodeKind {
    fn size(&self) -> usize {
        match self {
            OnodeKind::Kl720 => wire::KL720_ONODE_SIZE,
            OnodeKind::Kl630(_) => wire::KL630_ONODE_SIZE,
            OnodeKind::Kl730 => wire::KL730_ONODE_SIZE,
        }
    }

    fn chip(&self) -> TargetChip {
        match self {
            OnodeKind::Kl720 => TargetChip::Kl720,
            OnodeKind::Kl630(chip) => *chip,
            OnodeKind::Kl730 => TargetChip::Kl730,
        }
    }
}

/// Per-node fields common to every onode generation.
struct Onode {
    index: u32,
    format: u32,
    npu_shape: [i32; 4],
    radix: i32,
    scale: f32,
    start_offset: usize,
    len: usize,
}

impl Onode {
    fn parse(kind: OnodeKind, view: &ByteView<'_>, at: usize) -> Result<Self> {
        match kind {
            OnodeKind::Kl720 => {
                let w = view.u32_array(at, 14)?;
                Ok(Self {
                    index: w[11],
                    format: w[4],
                    npu_shape: [1, w[10] as i32, w[8] as i32, w[9] as i32],
                    radix: w[12] as i32,
                    scale: f32::from_bits(w[13]),
                    start_offset: w[0] as usize,
                    len: w[1] as usize,
                })
            }
            OnodeKind::Kl630(_) | OnodeKind::Kl730 => {
                // 64-bit buf_addr on KL730 shifts everything after it by 4
                let shift = if kind == OnodeKind::Kl730 { 4 } else { 0 };
                let head = view.u32_array(at, 6)?;
                let tail = view.u32_array(at + 28 + shift, 6)?;
                Ok(Self {
                    index: head[0],
                    format: head[1],
                    npu_shape: [head[2] as i32, head[3] as i32, head[4] as i32, head[5] as i32],
                    radix: tail[2] as i32,
                    scale: f32::from_bits(tail[1]),
                    start_offset: tail[3] as usize,
                    len: tail[0] as usize,
                })
            }
        }
    }
}

/// A result frame with its raw output region located.
#[derive(Debug, Clone)]
pub struct RawResult<'a> {
    header: ResultHeader,
    layout: RawLayout,
    raw: ByteView<'a>,
}

impl<'a> RawResult<'a> {
    /// Parse the header of a result frame and locate its raw output region.
    ///
    /// # Errors
    ///
    /// - [`Error::BadHeaderStamp`] if the magic is not an inference result.
    /// - [`Error::InvalidParam`] for a product id the magic cannot carry.
    /// - [`Error::TruncatedData`] if the frame is shorter than its header
    ///   claims.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let view = ByteView::new(buf);
        let stamp = HeaderStamp::parse(buf)?;

        let (version, fields, pre_proc_info, raw) = match stamp.magic_type {
            wire::MAGIC_TYPE_INFERENCE => {
                let count = view.u32_at(wire::HEADER_STAMP_SIZE)? as usize;
                if count > wire::MAX_PRE_PROC_INFO_V1 {
                    return Err(Error::InvalidParam(format!(
                        "result carries {} pre-process entries, at most {} fit",
                        count,
                        wire::MAX_PRE_PROC_INFO_V1
                    )));
                }
                let info_at = wire::HEADER_STAMP_SIZE + 4;
                let pre_proc_info = (0..count)
                    .map(|i| PreProcInfo::parse(&view, info_at + i * wire::PRE_PROC_INFO_SIZE))
                    .collect::<Result<Vec<_>>>()?;
                let fields_at = info_at + wire::MAX_PRE_PROC_INFO_V1 * wire::PRE_PROC_INFO_SIZE;
                let fields = view.u32_array(fields_at, 4)?;
                let raw = view.tail(wire::RESULT_HEADER_V1_SIZE)?;
                (ResultVersion::V1, fields, pre_proc_info, raw)
            }
            wire::MAGIC_TYPE_INFERENCE_V2 => {
                let w = view.u32_array(wire::HEADER_STAMP_SIZE, 7)?;
                let mix = view.tail(wire::RESULT_HEADER_V2_SIZE)?;
                let (count, info_offset, raw_offset) = (w[4] as usize, w[5] as usize, w[6] as usize);
                if count > wire::MAX_INPUT_NODE_COUNT_V2 {
                    return Err(Error::InvalidParam(format!(
                        "result carries {} pre-process entries, at most {} fit",
                        count,
                        wire::MAX_INPUT_NODE_COUNT_V2
                    )));
                }
                let pre_proc_info = (0..count)
                    .map(|i| PreProcInfo::parse(&mix, info_offset + i * wire::PRE_PROC_INFO_SIZE))
                    .collect::<Result<Vec<_>>>()?;
                (ResultVersion::V2, w[0..4].to_vec(), pre_proc_info, mix.tail(raw_offset)?)
            }
            other => return Err(Error::BadHeaderStamp { magic: other }),
        };

        let product_id = fields[0] as u16;
        let layout = match (version, product_id) {
            (ResultVersion::V1, wire::PRODUCT_ID_KL520) => RawLayout::Kl520,
            (ResultVersion::V1, wire::PRODUCT_ID_KL720) => RawLayout::Onode(OnodeKind::Kl720),
            (ResultVersion::V1, wire::PRODUCT_ID_KL630) => RawLayout::Onode(OnodeKind::Kl630(TargetChip::Kl630)),
            (ResultVersion::V1, wire::PRODUCT_ID_KL530) => RawLayout::Onode(OnodeKind::Kl630(TargetChip::Kl530)),
            (ResultVersion::V1, wire::PRODUCT_ID_KL730 | wire::PRODUCT_ID_KL830) => {
                RawLayout::Onode(OnodeKind::Kl730)
            }
            (ResultVersion::V2, wire::PRODUCT_ID_KL730 | wire::PRODUCT_ID_KL830) => RawLayout::NpuData,
            (v, p) => {
                return Err(Error::InvalidParam(format!(
                    "product 0x{:x} is not supported on {:?} results",
                    p, v
                )))
            }
        };

        let mut result = Self {
            header: ResultHeader {
                stamp,
                version,
                inference_number: fields[1],
                crop_number: fields[2],
                num_output_node: 0,
                product_id,
                is_last_crop: fields[3] == 1,
                pre_proc_info,
            },
            layout,
            raw,
        };
        result.header.num_output_node = result.node_count()? as u32;
        Ok(result)
    }

    pub fn header(&self) -> &ResultHeader {
        &self.header
    }

    pub fn into_header(self) -> ResultHeader {
        self.header
    }

    /// Number of output nodes the raw region describes.
    pub fn node_count(&self) -> Result<usize> {
        let count = match self.layout {
            RawLayout::Kl520 => self.raw.u32_at(0)? as i64,
            RawLayout::Onode(_) => self.raw.i32_at(4)? as i64,
            RawLayout::NpuData => self.raw.u32_at(8)? as i64,
        };
        Ok(count.max(0) as usize)
    }

    /// Locate node `node_index` and build its descriptor.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParam`] if `node_index` is not below the node count.
    pub fn node(&self, node_index: u32) -> Result<RawNodeOutput<'a>> {
        let count = self.node_count()?;
        let idx = node_index as usize;
        if idx >= count {
            return Err(Error::InvalidParam(format!(
                "node index {} out of range, result has {} nodes",
                node_index, count
            )));
        }
        let node = match self.layout {
            RawLayout::Kl520 => self.kl520_node(idx, count)?,
            RawLayout::Onode(kind) => self.onode_node(kind, idx)?,
            RawLayout::NpuData => {
                let blob = self.raw.tail(wire::NPU_DATA_HEADER_SIZE)?;
                let node = parse_node_header_v2(&blob, idx, TargetChip::Kl730)?;
                debug!(
                    "Raw node {} '{}': {} bytes, {:?}",
                    idx,
                    node.descriptor.name,
                    node.data.len(),
                    node.descriptor.data_layout
                );
                node
            }
        };
        Ok(node)
    }

    fn kl520_node(&self, idx: usize, count: usize) -> Result<RawNodeOutput<'a>> {
        let meta = |i: usize| -> Result<(u32, u32, u32, i32, f32, u32)> {
            let at = 4 + i * wire::KL520_NODE_METADATA_SIZE;
            Ok((
                self.raw.u32_at(at)?,
                self.raw.u32_at(at + 4)?,
                self.raw.u32_at(at + 8)?,
                self.raw.i32_at(at + 12)?,
                self.raw.f32_at(at + 16)?,
                self.raw.u32_at(at + 20)?,
            ))
        };
        let overflow = || Error::InvalidDataLayout(format!("node {} payload offset overflows", idx));
        let payload_len = |h: u32, c: u32, w: u32| {
            wire::checked_extent(&[h as usize, c as usize, wire::round_up(w as usize, 16)]).ok_or_else(overflow)
        };

        let mut offset = 4 + count * wire::KL520_NODE_METADATA_SIZE;
        for i in 0..idx {
            let (h, c, w, ..) = meta(i)?;
            offset = offset.checked_add(payload_len(h, c, w)?).ok_or_else(overflow)?;
        }
        let (height, channel, width, radix, scale, format) = meta(idx)?;
        let data = self.raw.slice(offset, payload_len(height, channel, width)?)?;

        Ok(RawNodeOutput::new(
            legacy_descriptor(
                idx as u32,
                DataLayout::from_format_code(format, TargetChip::Kl520),
                [1, channel as i32, height as i32, width as i32],
                radix,
                scale,
            ),
            data,
        ))
    }

    fn onode_node(&self, kind: OnodeKind, idx: usize) -> Result<RawNodeOutput<'a>> {
        if idx >= wire::MAX_RAW_ONODE {
            return Err(Error::InvalidParam(format!(
                "node index {} exceeds the {}-entry onode table",
                idx,
                wire::MAX_RAW_ONODE
            )));
        }
        let onode = Onode::parse(kind, &self.raw, wire::RAW_TABLE_PREFIX_SIZE + idx * kind.size())?;
        let payload_at = wire::RAW_TABLE_PREFIX_SIZE + wire::MAX_RAW_ONODE * kind.size();
        let data = self.raw.slice(payload_at + onode.start_offset, onode.len)?;

        Ok(RawNodeOutput::new(
            legacy_descriptor(
                onode.index,
                DataLayout::from_format_code(onode.format, kind.chip()),
                onode.npu_shape,
                onode.radix,
                onode.scale,
            ),
            data,
        ))
    }
}

/// Locate node `node_index` in a result frame.
///
/// # Errors
///
/// See [`RawResult::parse`] and [`RawResult::node`].
pub fn retrieve_raw_node(node_index: u32, buf: &[u8]) -> Result<RawNodeOutput<'_>> {
    RawResult::parse(buf)?.node(node_index)
}

pub(crate) fn legacy_descriptor(
    index: u32,
    data_layout: DataLayout,
    npu_shape: [i32; 4],
    radix: i32,
    scale: f32,
) -> TensorDescriptor {
    TensorDescriptor {
        index,
        name: String::new(),
        data_layout,
        shape_info: ShapeInfo::V1(ShapeInfoV1::identity(npu_shape)),
        quantization: Quantization::single(1, radix, scale),
    }
}

/// Parse the `index`-th 19-word node header at the start of `blob`.
///
/// Every offset inside the header is relative to the start of `blob`.
pub(crate) fn parse_node_header_v2<'a>(
    blob: &ByteView<'a>,
    index: usize,
    chip: TargetChip,
) -> Result<RawNodeOutput<'a>> {
    let w = blob.u32_array(index * wire::NODE_HEADER_V2_SIZE, 19)?;
    let [node_index, name_len, name_offset, layout_code, shape_len, shape_dtype, shape_offset, stride_onnx_dtype, stride_onnx_offset, stride_npu_dtype, stride_npu_offset, quantized_axis, quant_len, radix_dtype, radix_offset, scale_dtype, scale_offset, data_len, data_offset] =
        <[u32; 19]>::try_from(w).map_err(|_| Error::InvalidParam("short node header".into()))?;

    if shape_dtype != wire::DTYPE_INT32
        || stride_onnx_dtype != wire::DTYPE_UINT32
        || stride_npu_dtype != wire::DTYPE_UINT32
    {
        return Err(Error::InvalidParam(format!(
            "unsupported node {} shape/stride types ({}, {}, {})",
            node_index, shape_dtype, stride_onnx_dtype, stride_npu_dtype
        )));
    }

    let name_bytes = blob.slice(name_offset as usize, name_len as usize)?;
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

    let rank = shape_len as usize;
    let shape_info = ShapeInfoV2 {
        shape: blob.i32_array(shape_offset as usize, rank)?,
        stride_onnx: blob.u32_array(stride_onnx_offset as usize, rank)?,
        stride_npu: blob.u32_array(stride_npu_offset as usize, rank)?,
    };

    let quantization = fixed_point_descriptors(
        blob,
        quantized_axis,
        quant_len as usize,
        (radix_dtype, radix_offset as usize),
        (scale_dtype, scale_offset as usize),
    )?;

    Ok(RawNodeOutput::new(
        TensorDescriptor {
            index: node_index,
            name,
            data_layout: DataLayout::from_format_code(layout_code, chip),
            shape_info: ShapeInfo::V2(shape_info),
            quantization,
        },
        blob.slice(data_offset as usize, data_len as usize)?,
    ))
}

fn fixed_point_descriptors(
    blob: &ByteView<'_>,
    quantized_axis: u32,
    count: usize,
    (radix_dtype, radix_offset): (u32, usize),
    (scale_dtype, scale_offset): (u32, usize),
) -> Result<Quantization> {
    let scale_dtype = DType::from_wire(scale_dtype)
        .ok_or_else(|| Error::InvalidParam(format!("unknown scale type {}", scale_dtype)))?;
    let scale_bytes = blob.tail(scale_offset)?;

    let descriptors = (0..count)
        .map(|i| {
            let radix = match radix_dtype {
                wire::DTYPE_INT8 => blob.i8_at(radix_offset + i)? as i32,
                wire::DTYPE_INT16 => blob.i16_at(radix_offset + i * 2)? as i32,
                wire::DTYPE_INT32 => blob.i32_at(radix_offset + i * 4)?,
                other => {
                    return Err(Error::InvalidParam(format!("unsupported radix type {}", other)))
                }
            };
            Ok(FixedPointDescriptor {
                radix,
                scale: Scale::read(scale_dtype, scale_bytes.bytes(), i)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Quantization::V1(QuantizationV1 {
        quantized_axis,
        descriptors,
    }))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::wire::{put_i32, put_u32};

    #[test]
    fn v1_kl720_header_and_nodes() {
        let mut frame = v1_header(wire::PRODUCT_ID_KL720, 42, true);
        frame.extend(kl720_raw(&[
            (100, [1, 1, 4], vec![1, 2, 3, 4]),
            (100, [2, 1, 2], vec![5, 6, 7, 8]),
        ]));
        let frame = finish(frame);

        let result = RawResult::parse(&frame).unwrap();
        let header = result.header();
        assert_eq!(header.version, ResultVersion::V1);
        assert_eq!(header.inference_number, 42);
        assert_eq!(header.num_output_node, 2);
        assert!(header.is_last_crop);

        let node = result.node(1).unwrap();
        assert_eq!(node.data, &[5, 6, 7, 8]);
        assert_eq!(node.descriptor.data_layout, DataLayout::Raw8B);
        assert_eq!(node.descriptor.shape_info.onnx_shape(), &[1, 2, 1, 2]);
        assert_eq!(node.descriptor.quantization.v1().descriptors[0].radix, 2);
    }

    #[test]
    fn node_index_past_count_is_invalid_param() {
        let mut frame = v1_header(wire::PRODUCT_ID_KL720, 0, true);
        frame.extend(kl720_raw(&[(100, [1, 1, 1], vec![9])]));
        let frame = finish(frame);
        assert!(matches!(retrieve_raw_node(1, &frame), Err(Error::InvalidParam(_))));
    }

    #[test]
    fn kl520_payloads_are_packed_back_to_back() {
        let mut frame = v1_header(wire::PRODUCT_ID_KL520, 1, true);
        put_u32(&mut frame, 2);
        for (h, c, w) in [(1u32, 1u32, 3u32), (2, 1, 1)] {
            for v in [h, c, w] {
                put_u32(&mut frame, v);
            }
            put_i32(&mut frame, 0);
            frame.extend_from_slice(&1.0f32.to_le_bytes());
            put_u32(&mut frame, 1);
        }
        frame.extend(std::iter::repeat(7u8).take(16));
        frame.extend(std::iter::repeat(9u8).take(32));
        let frame = finish(frame);

        let node = retrieve_raw_node(1, &frame).unwrap();
        assert_eq!(node.num_bytes(), 32);
        assert!(node.data.iter().all(|&b| b == 9));
        assert_eq!(node.descriptor.data_layout, DataLayout::Npu16W1C8B);
        assert_eq!(node.descriptor.shape_info.onnx_shape(), &[1, 1, 2, 1]);
    }

    #[test]
    fn kl520_oversized_metadata_is_an_error() {
        let mut frame = v1_header(wire::PRODUCT_ID_KL520, 1, true);
        put_u32(&mut frame, 2);
        for (h, c, w) in [(u32::MAX, u32::MAX, u32::MAX), (1, 1, 1)] {
            for v in [h, c, w] {
                put_u32(&mut frame, v);
            }
            put_i32(&mut frame, 0);
            frame.extend_from_slice(&1.0f32.to_le_bytes());
            put_u32(&mut frame, 1);
        }
        frame.extend(std::iter::repeat(0u8).take(32));
        let frame = finish(frame);

        for idx in [0, 1] {
            assert!(matches!(
                retrieve_raw_node(idx, &frame),
                Err(Error::InvalidDataLayout(_))
            ));
        }
    }

    #[test]
    fn v2_node_headers_resolve_through_blob() {
        let frame = v2_frame(
            5,
            false,
            &[NodeV2 {
                name: "logits",
                layout: 100,
                shape: vec![1, 3],
                stride_npu: vec![3, 1],
                radix: vec![1],
                scale: vec![0.5],
                data: vec![1, 2, 3],
            }],
        );
        let result = RawResult::parse(&frame).unwrap();
        assert_eq!(result.header().version, ResultVersion::V2);
        assert!(!result.header().is_last_crop);
        assert_eq!(result.header().num_output_node, 1);

        let node = result.node(0).unwrap();
        assert_eq!(node.descriptor.name, "logits");
        assert_eq!(node.data, &[1, 2, 3]);
        match &node.descriptor.shape_info {
            ShapeInfo::V2(v2) => {
                assert_eq!(v2.shape, vec![1, 3]);
                assert_eq!(v2.stride_onnx, vec![3, 1]);
            }
            other => panic!("unexpected shape info {:?}", other),
        }
        assert_eq!(
            node.descriptor.quantization.v1().descriptors[0].scale,
            Scale::Float32(0.5)
        );
    }

    #[test]
    fn unknown_magic_is_bad_header_stamp() {
        let frame = finish(stamp(0xDEAD_BEEF, 0));
        assert!(matches!(
            RawResult::parse(&frame),
            Err(Error::BadHeaderStamp { magic: 0xDEAD_BEEF })
        ));
    }

    #[test]
    fn v2_magic_from_older_chip_is_rejected() {
        let mut frame = v2_frame(0, true, &[]);
        frame[24..28].copy_from_slice(&(wire::PRODUCT_ID_KL720 as u32).to_le_bytes());
        assert!(matches!(RawResult::parse(&frame), Err(Error::InvalidParam(_))));
    }

    #[test]
    fn truncated_onode_payload_is_reported() {
        let mut frame = v1_header(wire::PRODUCT_ID_KL720, 0, true);
        let mut raw = kl720_raw(&[(100, [1, 1, 8], vec![0; 8])]);
        raw.truncate(raw.len() - 4);
        frame.extend(raw);
        let frame = finish(frame);
        assert!(matches!(retrieve_raw_node(0, &frame), Err(Error::TruncatedData { .. })));
    }
}
