//! Debug checkpoints.
//!
//! With checkpoints enabled the firmware streams intermediate data
//! (pre-processed images, raw NPU outputs around CPU operations) to the
//! host in CHECKPOINT frames. Node checkpoints are normalized into the same
//! [`TensorDescriptor`] model used for results, so
//! [`layout::decode_float`](crate::layout::decode_float) works on them
//! unchanged.

use std::ops::Range;

use log::debug;

use crate::error::{Error, Result};
use crate::group::DeviceGroup;
use crate::raw_output::{self, RawNodeOutput};
use crate::tensor::{DataLayout, FixedPointDType, TargetChip, TensorDescriptor};
use crate::transport::Transport;
use crate::wire::{self, ByteView, HeaderStamp};

pub const CHECKPOINT_BEFORE_PREPROCESS: u32 = 0x1;
pub const CHECKPOINT_AFTER_PREPROCESS: u32 = 0x2;
pub const CHECKPOINT_AFTER_INFERENCE: u32 = 0x4;
pub const CHECKPOINT_BEFORE_CPU_OP: u32 = 0x8;
pub const CHECKPOINT_AFTER_CPU_OP: u32 = 0x10;

const TAG_OFFSET: usize = wire::HEADER_STAMP_SIZE;
const V1_METADATA_OFFSET: usize = TAG_OFFSET + 12;
const V1_TOTAL_SIZE_OFFSET: usize = V1_METADATA_OFFSET + wire::MAX_CHECKPOINT_NODE_V1 * wire::KL520_NODE_METADATA_SIZE;
const V1_RAW_OFFSET: usize = V1_TOTAL_SIZE_OFFSET + 4;
const V2_DATA_OFFSET: usize = TAG_OFFSET + 16;

/// Where in the pipeline a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointTag {
    BeforePreprocess,
    AfterPreprocess,
    AfterInference,
    BeforeCpuOp,
    AfterCpuOp,
}

impl CheckpointTag {
    pub fn from_wire(tag: u32) -> Option<Self> {
        match tag {
            CHECKPOINT_BEFORE_PREPROCESS => Some(CheckpointTag::BeforePreprocess),
            CHECKPOINT_AFTER_PREPROCESS => Some(CheckpointTag::AfterPreprocess),
            CHECKPOINT_AFTER_INFERENCE => Some(CheckpointTag::AfterInference),
            CHECKPOINT_BEFORE_CPU_OP => Some(CheckpointTag::BeforeCpuOp),
            CHECKPOINT_AFTER_CPU_OP => Some(CheckpointTag::AfterCpuOp),
            _ => None,
        }
    }

    /// The enable flag that produces this checkpoint.
    pub fn flag(&self) -> u32 {
        match self {
            CheckpointTag::BeforePreprocess => CHECKPOINT_BEFORE_PREPROCESS,
            CheckpointTag::AfterPreprocess => CHECKPOINT_AFTER_PREPROCESS,
            CheckpointTag::AfterInference => CHECKPOINT_AFTER_INFERENCE,
            CheckpointTag::BeforeCpuOp => CHECKPOINT_BEFORE_CPU_OP,
            CheckpointTag::AfterCpuOp => CHECKPOINT_AFTER_CPU_OP,
        }
    }
}

/// Output nodes captured at a node checkpoint, with their raw NPU data.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointNodes {
    pub stamp: HeaderStamp,
    pub tag: CheckpointTag,
    pub target_inf_model: i32,
    pub nodes: Vec<TensorDescriptor>,
    /// Payloads of all nodes, back to back.
    pub raw_output: Vec<u8>,
    ranges: Vec<Range<usize>>,
}

impl CheckpointNodes {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// View node `index` the same way a result node is viewed.
    pub fn node(&self, index: usize) -> Result<RawNodeOutput<'_>> {
        let descriptor = self.nodes.get(index).ok_or(Error::InvalidIndex {
            requested: index,
            available: self.nodes.len(),
        })?;
        let range = self.ranges[index].clone();
        let data = self.raw_output.get(range.clone()).ok_or_else(|| {
            Error::InvalidCheckpointData(format!(
                "node {} spans {:?} beyond {} bytes of raw output",
                index,
                range,
                self.raw_output.len()
            ))
        })?;
        Ok(RawNodeOutput::new(descriptor.clone(), data))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointPayload {
    /// The device has no more checkpoints for the current inference.
    End,
    /// A pre-processing checkpoint: the whole frame, stamp included.
    Preprocess { tag: CheckpointTag, bytes: Vec<u8> },
    Nodes(CheckpointNodes),
}

fn invalid(e: Error) -> Error {
    match e {
        Error::TruncatedData { offset, len, available } => Error::InvalidCheckpointData(format!(
            "{} bytes at offset {} exceed the {}-byte frame",
            len, offset, available
        )),
        other => other,
    }
}

/// Decode one checkpoint frame.
///
/// `chip` selects the data-format table for node layouts; pass the target
/// of the loaded model.
///
/// # Errors
///
/// [`Error::InvalidCheckpointData`] for a frame that is not a checkpoint,
/// carries an unknown tag or references data beyond its end.
pub fn decode_checkpoint(buf: &[u8], chip: TargetChip) -> Result<CheckpointPayload> {
    let stamp = HeaderStamp::parse(buf).map_err(invalid)?;
    let v2 = match stamp.magic_type {
        wire::MAGIC_TYPE_CHECKPOINT_DATA => false,
        wire::MAGIC_TYPE_CHECKPOINT_DATA_V2 => true,
        other => {
            return Err(Error::InvalidCheckpointData(format!(
                "magic 0x{:08X} is not a checkpoint",
                other
            )))
        }
    };
    if buf.len() == wire::HEADER_STAMP_SIZE {
        return Ok(CheckpointPayload::End);
    }

    let view = ByteView::new(buf);
    let raw_tag = view.u32_at(TAG_OFFSET).map_err(invalid)?;
    let tag = CheckpointTag::from_wire(raw_tag)
        .ok_or_else(|| Error::InvalidCheckpointData(format!("unknown checkpoint tag 0x{:X}", raw_tag)))?;

    match tag {
        CheckpointTag::BeforePreprocess | CheckpointTag::AfterPreprocess => {
            let bytes = view.slice(0, stamp.total_size as usize).map_err(invalid)?;
            Ok(CheckpointPayload::Preprocess {
                tag,
                bytes: bytes.to_vec(),
            })
        }
        _ if v2 => decode_nodes_v2(&view, stamp, tag, chip).map_err(invalid),
        _ => decode_nodes_v1(&view, stamp, tag, chip).map_err(invalid),
    }
}

fn decode_nodes_v1(view: &ByteView<'_>, stamp: HeaderStamp, tag: CheckpointTag, chip: TargetChip) -> Result<CheckpointPayload> {
    let target_inf_model = view.i32_at(TAG_OFFSET + 4)?;
    let num_nodes = view.u32_at(TAG_OFFSET + 8)? as usize;
    if num_nodes > wire::MAX_CHECKPOINT_NODE_V1 {
        return Err(Error::InvalidCheckpointData(format!(
            "{} nodes exceed the {}-entry metadata table",
            num_nodes,
            wire::MAX_CHECKPOINT_NODE_V1
        )));
    }
    let total_output_size = view.u32_at(V1_TOTAL_SIZE_OFFSET)? as usize;
    let raw_output = view.slice(V1_RAW_OFFSET, total_output_size)?.to_vec();

    let mut nodes = Vec::with_capacity(num_nodes);
    let mut ranges = Vec::with_capacity(num_nodes);
    let mut offset: usize = 0;
    for i in 0..num_nodes {
        let at = V1_METADATA_OFFSET + i * wire::KL520_NODE_METADATA_SIZE;
        let [height, channel, width] = [view.u32_at(at)?, view.u32_at(at + 4)?, view.u32_at(at + 8)?];
        let data_layout = DataLayout::from_format_code(view.u32_at(at + 20)?, chip);

        let element = match data_layout.fixed_point_dtype() {
            Some(FixedPointDType::Int16) => 2,
            _ => 1,
        };
        let extent = [height as usize, channel as usize, wire::round_up(width as usize, 16), element];
        let end = wire::checked_extent(&extent)
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| {
                Error::InvalidCheckpointData(format!(
                    "node {} extent {}x{}x{} overflows",
                    i, height, channel, width
                ))
            })?;
        ranges.push(offset..end);
        offset = end;

        nodes.push(raw_output::legacy_descriptor(
            i as u32,
            data_layout,
            [1, channel as i32, height as i32, width as i32],
            view.i32_at(at + 12)?,
            view.f32_at(at + 16)?,
        ));
    }

    Ok(CheckpointPayload::Nodes(CheckpointNodes {
        stamp,
        tag,
        target_inf_model,
        nodes,
        raw_output,
        ranges,
    }))
}

fn decode_nodes_v2(view: &ByteView<'_>, stamp: HeaderStamp, tag: CheckpointTag, chip: TargetChip) -> Result<CheckpointPayload> {
    let target_inf_model = view.i32_at(TAG_OFFSET + 4)?;
    let total_output_size = view.u32_at(TAG_OFFSET + 8)? as usize;
    let num_nodes = view.u32_at(TAG_OFFSET + 12)? as usize;
    let blob = view.tail(V2_DATA_OFFSET)?;

    let mut nodes = Vec::new();
    let mut ranges = Vec::new();
    let mut raw_output = Vec::with_capacity(total_output_size.min(blob.len()));
    for i in 0..num_nodes {
        let node = raw_output::parse_node_header_v2(&blob, i, chip)?;
        ranges.push(raw_output.len()..raw_output.len() + node.data.len());
        raw_output.extend_from_slice(node.data);
        let mut descriptor = node.descriptor;
        descriptor.index = i as u32;
        nodes.push(descriptor);
    }
    if raw_output.len() > total_output_size {
        return Err(Error::InvalidCheckpointData(format!(
            "node payloads total {} bytes, header declares {}",
            raw_output.len(),
            total_output_size
        )));
    }

    Ok(CheckpointPayload::Nodes(CheckpointNodes {
        stamp,
        tag,
        target_inf_model,
        nodes,
        raw_output,
        ranges,
    }))
}

impl<T: Transport> DeviceGroup<T> {
    /// Enable or disable the checkpoints in `flags` on every device.
    pub fn set_debug_checkpoints(&mut self, flags: u32, enable: bool) -> Result<()> {
        let frame = wire::command_frame(wire::COMMAND_SET_DBG_CHECKPOINT, &[flags, enable as u32]);
        for index in 0..self.len() {
            self.command(index, &frame)?;
        }
        Ok(())
    }

    /// Read and decode the next checkpoint from the device at `recv_cursor`.
    ///
    /// Frames land in the group's scratch buffer, grown to
    /// `checkpoint_buffer_size` on first use. Node layouts are resolved
    /// against the loaded model's chip, or the group's product when no
    /// model is loaded.
    pub fn receive_checkpoint(&mut self) -> Result<CheckpointPayload> {
        let chip = self
            .model()
            .map(|m| m.target_chip)
            .unwrap_or_else(|| TargetChip::from_product_id(self.product_id()));
        let frame = self.read_current_scratch()?;
        let payload = decode_checkpoint(frame, chip)?;
        match &payload {
            CheckpointPayload::End => debug!("Checkpoint stream ended on device {}", self.recv_cursor()),
            CheckpointPayload::Preprocess { tag, bytes } => {
                debug!("Checkpoint {:?}: {} bytes", tag, bytes.len())
            }
            CheckpointPayload::Nodes(nodes) => debug!(
                "Checkpoint {:?} of model {}: {} node(s)",
                nodes.tag,
                nodes.target_inf_model,
                nodes.node_count()
            ),
        }
        self.advance_recv();
        Ok(payload)
    }
}
