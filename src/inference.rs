//! High-level inference API.
//!
//! Everything here is a method on [`DeviceGroup`] (sending requests,
//! receiving results, device toggles) or a free function over a result
//! buffer the caller already holds (node retrieval).
//!
//! # Example
//!
//! ```rust,no_run
//! use kneron_plus::inference::{self, GenericDataInferenceDesc};
//! use kneron_plus::layout::ChannelOrdering;
//! use kneron_plus::transport::ScriptedTransport;
//! use kneron_plus::{DeviceGroup, GroupConfig};
//!
//! # let container = Vec::<u8>::new();
//! # let tensor = vec![0u8; 224 * 224 * 3];
//! let mut group = DeviceGroup::new(vec![ScriptedTransport::new()], 0x720, GroupConfig::default())?;
//! group.load_model(&container)?;
//!
//! group.generic_data_inference_send(&GenericDataInferenceDesc {
//!     inference_number: 0,
//!     model_id: 1,
//!     input_node_data: vec![&tensor],
//! })?;
//!
//! let mut result = vec![0u8; group.config().result_buffer_size as usize];
//! let header = group.generic_data_inference_receive(&mut result)?;
//! for node in 0..header.num_output_node {
//!     let output = inference::retrieve_float_node(node, &result, ChannelOrdering::Default)?;
//!     println!("{}: {:?}", output.name, output.shape);
//! }
//! # Ok::<(), kneron_plus::Error>(())
//! ```

use log::debug;

use crate::error::{Error, Result};
use crate::group::{verify_header_stamp, DeviceGroup};
use crate::layout::{self, ChannelOrdering, ChannelOrderingConvert, FixedNodeOutput, FloatNodeOutput};
use crate::raw_output::{CropBox, RawNodeOutput, RawResult, ResultHeader};
use crate::transport::Transport;
use crate::wire::{self, put_u32, HeaderStamp};

pub use crate::raw_output::retrieve_raw_node;

/// Pixel format of an image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Rgb565,
    Rgba8888,
    Yuyv,
    YCbCr422CrY1CbY0,
    YCbCr422CbY1CrY0,
    YCbCr422Y1CrY0Cb,
    YCbCr422Y1CbY0Cr,
    YCbCr422CrY0CbY1,
    YCbCr422CbY0CrY1,
    YCbCr422Y0CrY1Cb,
    YCbCr422Y0CbY1Cr,
    Raw8,
    Yuv420,
}

impl ImageFormat {
    /// Firmware format code.
    pub fn code(&self) -> u32 {
        match self {
            ImageFormat::Rgb565 => 0x60,
            ImageFormat::Rgba8888 => 0x0D,
            ImageFormat::Yuyv => 0x2F,
            ImageFormat::YCbCr422CrY1CbY0 => 0x30,
            ImageFormat::YCbCr422CbY1CrY0 => 0x31,
            ImageFormat::YCbCr422Y1CrY0Cb => 0x32,
            ImageFormat::YCbCr422Y1CbY0Cr => 0x33,
            ImageFormat::YCbCr422CrY0CbY1 => 0x34,
            ImageFormat::YCbCr422CbY0CrY1 => 0x35,
            ImageFormat::YCbCr422Y0CrY1Cb => 0x36,
            ImageFormat::YCbCr422Y0CbY1Cr => 0x37,
            ImageFormat::Raw8 => 0x04,
            ImageFormat::Yuv420 => 0x70,
        }
    }

    /// Bytes one `width × height` image occupies.
    ///
    /// ```
    /// use kneron_plus::inference::ImageFormat;
    ///
    /// assert_eq!(ImageFormat::Rgb565.image_size(4, 2), 16);
    /// assert_eq!(ImageFormat::Yuv420.image_size(4, 2), 12);
    /// ```
    pub fn image_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            ImageFormat::Rgba8888 => pixels * 4,
            ImageFormat::Raw8 => pixels,
            ImageFormat::Yuv420 => pixels * 3 / 2,
            _ => pixels * 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    Disable,
    #[default]
    Enable,
}

impl ResizeMode {
    fn code(&self) -> u32 {
        match self {
            ResizeMode::Disable => 1,
            ResizeMode::Enable => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingMode {
    Disable,
    #[default]
    Corner,
    Symmetric,
}

impl PaddingMode {
    fn code(&self) -> u32 {
        match self {
            PaddingMode::Disable => 1,
            PaddingMode::Corner => 2,
            PaddingMode::Symmetric => 3,
        }
    }
}

/// Pixel normalization the firmware applies before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizeMode {
    Disable,
    #[default]
    Kneron,
    TensorFlow,
    Yolo,
    /// A firmware-specific mode, passed through as is.
    Other(u32),
}

impl NormalizeMode {
    fn code(&self) -> u32 {
        match self {
            NormalizeMode::Disable => 0xFF,
            NormalizeMode::Kneron => 1,
            NormalizeMode::TensorFlow => 2,
            NormalizeMode::Yolo => 3,
            NormalizeMode::Other(code) => *code,
        }
    }
}

/// One image input node.
#[derive(Debug, Clone)]
pub struct InputNodeImage<'a> {
    pub width: u32,
    pub height: u32,
    pub resize_mode: ResizeMode,
    pub padding_mode: PaddingMode,
    pub image_format: ImageFormat,
    pub normalize_mode: NormalizeMode,
    /// Up to [`wire::MAX_CROP_BOX`] regions; empty infers the whole image.
    pub crops: Vec<CropBox>,
    pub image: &'a [u8],
}

impl InputNodeImage<'_> {
    fn encode_header(&self, out: &mut Vec<u8>) {
        for v in [
            self.width,
            self.height,
            self.resize_mode.code(),
            self.padding_mode.code(),
            self.image_format.code(),
            self.normalize_mode.code(),
            self.crops.len() as u32,
        ] {
            put_u32(out, v);
        }
        for i in 0..wire::MAX_CROP_BOX {
            self.crops.get(i).copied().unwrap_or_default().encode_into(out);
        }
    }
}

/// A request that lets the firmware pre-process every input image.
#[derive(Debug, Clone)]
pub struct GenericImageInferenceDesc<'a> {
    pub inference_number: u32,
    pub model_id: u32,
    pub input_node_images: Vec<InputNodeImage<'a>>,
}

/// A request that bypasses pre-processing: each input is already a model tensor.
#[derive(Debug, Clone)]
pub struct GenericDataInferenceDesc<'a> {
    pub inference_number: u32,
    pub model_id: u32,
    pub input_node_data: Vec<&'a [u8]>,
}

fn inference_stamp(job_id: u32, total_size: usize, total_image: usize, image_index: usize) -> HeaderStamp {
    HeaderStamp {
        magic_type: wire::MAGIC_TYPE_INFERENCE,
        total_size: total_size as u32,
        job_id,
        status_code: 0,
        total_image: total_image as u32,
        image_index: image_index as u32,
    }
}

impl<T: Transport> DeviceGroup<T> {
    /// Shared request checks, in firmware order.
    fn check_input_nodes(&self, model_id: u32, count: usize) -> Result<()> {
        let limit = self.max_input_node_count();
        if count > limit {
            return Err(Error::InvalidParam(format!(
                "{} input nodes exceed the limit of {}",
                count, limit
            )));
        }
        let model = self
            .model()
            .and_then(|m| m.model(model_id))
            .ok_or(Error::ModelNotLoaded(model_id))?;
        if model.input_nodes.len() != count {
            return Err(Error::InputNodeCountMismatch {
                expected: model.input_nodes.len(),
                actual: count,
            });
        }
        let slots = self.config().input_buffer_count as usize;
        if count > slots {
            return Err(Error::InvalidParam(format!(
                "{} input nodes exceed the {} device input slots",
                count, slots
            )));
        }
        Ok(())
    }

    fn check_frame_size(&self, total_size: usize) -> Result<()> {
        let limit = self.config().input_buffer_size as usize;
        if total_size > limit {
            return Err(Error::PayloadTooLarge {
                size: total_size,
                limit,
            });
        }
        Ok(())
    }

    /// Send one image inference request to the next device.
    ///
    /// Every input node becomes its own `(header, image)` frame pair carrying
    /// `total_image`/`image_index` so the device can reassemble them. All
    /// validation happens before the first byte is written.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParam`] for too many inputs, too many crops or an
    ///   image buffer shorter than its declared size.
    /// - [`Error::ModelNotLoaded`] / [`Error::InputNodeCountMismatch`].
    /// - [`Error::PayloadTooLarge`] if a frame exceeds the device input slot.
    pub fn generic_image_inference_send(&mut self, desc: &GenericImageInferenceDesc<'_>) -> Result<()> {
        let count = desc.input_node_images.len();
        self.check_input_nodes(desc.model_id, count)?;

        let mut frames = Vec::with_capacity(count);
        for (i, node) in desc.input_node_images.iter().enumerate() {
            if node.crops.len() > wire::MAX_CROP_BOX {
                return Err(Error::InvalidParam(format!(
                    "{} crop boxes exceed the limit of {}",
                    node.crops.len(),
                    wire::MAX_CROP_BOX
                )));
            }
            let image_size = node.image_format.image_size(node.width, node.height);
            let image = node.image.get(..image_size).ok_or_else(|| {
                Error::InvalidParam(format!(
                    "image {} holds {} bytes, {}x{} {:?} needs {}",
                    i,
                    node.image.len(),
                    node.width,
                    node.height,
                    node.image_format,
                    image_size
                ))
            })?;
            let total = wire::IMAGE_INFERENCE_HEADER_SIZE + image_size;
            self.check_frame_size(total)?;

            let mut header = Vec::with_capacity(wire::IMAGE_INFERENCE_HEADER_SIZE);
            inference_stamp(wire::JOB_ID_GENERIC_IMAGE_INFERENCE, total, count, i).encode_into(&mut header);
            put_u32(&mut header, desc.inference_number);
            put_u32(&mut header, desc.model_id);
            node.encode_header(&mut header);
            frames.push((header, image));
        }

        self.send_frames(&frames)
    }

    /// Send one pre-processing-bypass request to the next device.
    pub fn generic_data_inference_send(&mut self, desc: &GenericDataInferenceDesc<'_>) -> Result<()> {
        let count = desc.input_node_data.len();
        self.check_input_nodes(desc.model_id, count)?;

        let mut frames = Vec::with_capacity(count);
        for (i, data) in desc.input_node_data.iter().enumerate() {
            let total = wire::DATA_INFERENCE_HEADER_SIZE + data.len();
            self.check_frame_size(total)?;

            let mut header = Vec::with_capacity(wire::DATA_INFERENCE_HEADER_SIZE);
            inference_stamp(wire::JOB_ID_GENERIC_DATA_INFERENCE, total, count, i).encode_into(&mut header);
            put_u32(&mut header, desc.inference_number);
            put_u32(&mut header, desc.model_id);
            put_u32(&mut header, data.len() as u32);
            frames.push((header, *data));
        }

        self.send_frames(&frames)
    }

    fn receive_result(&mut self, buf: &mut [u8], expected_job_id: u32) -> Result<ResultHeader> {
        let n = self.read_current(buf)?;
        let frame = &buf[..n];
        verify_header_stamp(frame, expected_job_id, 0)?;
        let header = RawResult::parse(frame)?.into_header();
        debug!(
            "Result #{} crop {} from device {}: {} node(s), last crop {}",
            header.inference_number,
            header.crop_number,
            self.recv_cursor(),
            header.num_output_node,
            header.is_last_crop
        );
        if header.is_last_crop {
            self.advance_recv();
        }
        Ok(header)
    }

    /// Receive the next result of either request kind into `buf`.
    ///
    /// The receive cursor only moves on the last crop of a request, so
    /// multi-crop results are all read from the same device.
    pub fn generic_inference_receive(&mut self, buf: &mut [u8]) -> Result<ResultHeader> {
        self.receive_result(buf, 0)
    }

    /// Like [`generic_inference_receive`](Self::generic_inference_receive),
    /// but requires an image inference result.
    pub fn generic_image_inference_receive(&mut self, buf: &mut [u8]) -> Result<ResultHeader> {
        self.receive_result(buf, wire::JOB_ID_GENERIC_IMAGE_INFERENCE)
    }

    /// Like [`generic_inference_receive`](Self::generic_inference_receive),
    /// but requires a pre-processing-bypass result.
    pub fn generic_data_inference_receive(&mut self, buf: &mut [u8]) -> Result<ResultHeader> {
        self.receive_result(buf, wire::JOB_ID_GENERIC_DATA_INFERENCE)
    }

    /// Send a caller-built inference header plus optional payload.
    ///
    /// The header must start with a [`HeaderStamp`] whose `job_id`,
    /// `total_image` and `image_index` the caller filled in; magic and total
    /// size are stamped here.
    pub fn customized_inference_send(&mut self, header: &mut [u8], image: Option<&[u8]>) -> Result<()> {
        let stamp = HeaderStamp::parse(header)?;
        if stamp.total_image as usize > wire::MAX_INPUT_NODE_COUNT_V2 {
            return Err(Error::InvalidParam(format!(
                "total_image {} exceeds {}",
                stamp.total_image,
                wire::MAX_INPUT_NODE_COUNT_V2
            )));
        }
        if stamp.image_index >= stamp.total_image {
            return Err(Error::InvalidParam(format!(
                "image_index {} not below total_image {}",
                stamp.image_index, stamp.total_image
            )));
        }
        let payload = image.unwrap_or(&[]);
        let total = header.len() + payload.len();
        self.check_frame_size(total)?;
        HeaderStamp::patch(header, wire::MAGIC_TYPE_INFERENCE, total as u32)?;

        self.send_frames(&[(header.to_vec(), payload)])
    }

    /// Receive a customized result, returning the number of bytes read.
    ///
    /// Unlike generic results there is no crop tracking: the receive cursor
    /// moves after every accepted frame.
    pub fn customized_inference_receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read_current(buf)?;
        verify_header_stamp(&buf[..n], 0, 0)?;
        self.advance_recv();
        Ok(n)
    }

    fn stamp_customized(&self, cmd: &mut [u8]) -> Result<()> {
        self.check_frame_size(cmd.len())?;
        HeaderStamp::patch(cmd, wire::MAGIC_TYPE_CUSTOMIZED, cmd.len() as u32)
    }

    /// Send a caller-built command and read the device's CUSTOMIZED reply.
    pub fn customized_command_send(&mut self, cmd: &mut [u8], reply: &mut [u8]) -> Result<usize> {
        self.stamp_customized(cmd)?;
        let n = self.exchange(self.send_cursor(), cmd, reply)?;
        let stamp = HeaderStamp::parse(&reply[..n])?;
        if stamp.magic_type != wire::MAGIC_TYPE_CUSTOMIZED {
            return Err(Error::BadHeaderStamp {
                magic: stamp.magic_type,
            });
        }
        self.advance_send();
        Ok(n)
    }

    /// Send a caller-built command without waiting for a reply.
    pub fn customized_command_noack_send(&mut self, cmd: &mut [u8]) -> Result<()> {
        self.stamp_customized(cmd)?;
        self.send_frames(&[(cmd.to_vec(), &[])])
    }

    /// Let every device drop queued frames when its input FIFO is full.
    pub fn configure(&mut self, enable_frame_drop: bool) -> Result<()> {
        self.control_all(wire::CONTROL_FIFOQ_ENABLE_DROPPABLE, enable_frame_drop as u16, 0)
    }

    /// Apply the settings from [`GroupConfig`](crate::GroupConfig) that live on the devices.
    pub fn apply_config(&mut self) -> Result<()> {
        let enable = self.config().enable_frame_drop;
        self.configure(enable)
    }

    pub fn set_profile_enable(&mut self, enable: bool) -> Result<()> {
        let frame = wire::command_frame(wire::COMMAND_SET_PROFILE_ENABLE, &[enable as u32]);
        self.command(0, &frame)
    }

    pub fn set_performance_monitor_enable(&mut self, enable: bool) -> Result<()> {
        let frame = wire::command_frame(wire::COMMAND_SET_PERFORMANCE_MONITOR_ENABLE, &[enable as u32]);
        self.command(0, &frame)
    }

    /// Read the first device's profiling statistics into `buf`.
    ///
    /// The reply is firmware-defined and returned as is; the result is the
    /// number of bytes received.
    pub fn profile_statistics(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.statistics(wire::COMMAND_GET_PROFILE_STATISTICS, buf)
    }

    /// Read the first device's performance-monitor counters into `buf`.
    pub fn performance_monitor_statistics(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.statistics(wire::COMMAND_GET_PERFORMANCE_MONITOR_STATISTICS, buf)
    }

    fn statistics(&mut self, command_id: u32, buf: &mut [u8]) -> Result<usize> {
        let n = self.exchange(0, &wire::command_frame(command_id, &[]), buf)?;
        if n == 0 {
            return Err(Error::TruncatedData {
                offset: 0,
                len: buf.len(),
                available: 0,
            });
        }
        debug!("Statistics 0x{:x}: {} bytes", command_id, n);
        Ok(n)
    }
}

fn decode_node<R>(
    node_index: u32,
    buf: &[u8],
    ordering: ChannelOrdering,
    decode: impl FnOnce(&RawNodeOutput<'_>, ChannelOrderingConvert) -> Result<R>,
) -> Result<R> {
    let result = RawResult::parse(buf)?;
    let raw = result.node(node_index)?;
    let convert = ChannelOrderingConvert::resolve(result.header().product_id, ordering);
    decode(&raw, convert)
}

/// Decode output node `node_index` to sequential fixed-point values.
///
/// `ordering` only matters for legacy 4-D outputs; the device's product id
/// decides which permutation it maps to.
pub fn retrieve_fixed_node(node_index: u32, buf: &[u8], ordering: ChannelOrdering) -> Result<FixedNodeOutput> {
    decode_node(node_index, buf, ordering, layout::decode_fixed)
}

/// Decode and dequantize output node `node_index`.
pub fn retrieve_float_node(node_index: u32, buf: &[u8], ordering: ChannelOrdering) -> Result<FloatNodeOutput> {
    decode_node(node_index, buf, ordering, layout::decode_float)
}
