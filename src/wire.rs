// Wire-level constants and little-endian helpers shared by the framer, the
// raw result parser and the checkpoint decoder. Everything on the wire is
// little-endian and 4-byte aligned.

use crate::error::{Error, Result};

// Frame magic types
pub const MAGIC_TYPE_COMMAND: u32 = 0xAB67_CD13;
pub const MAGIC_TYPE_INFERENCE: u32 = 0x11FF_22AA;
pub const MAGIC_TYPE_CUSTOMIZED: u32 = 0x11FF_33CC;
pub const MAGIC_TYPE_CHECKPOINT_DATA: u32 = 0x34AB_F977;
pub const MAGIC_TYPE_INFERENCE_V2: u32 = 0x11FF_22AB;
pub const MAGIC_TYPE_CHECKPOINT_DATA_V2: u32 = 0x34AB_F978;

// Firmware job ids
pub const JOB_ID_GENERIC_IMAGE_INFERENCE: u32 = 10;
pub const JOB_ID_GENERIC_DATA_INFERENCE: u32 = 17;

// Command ids carried in COMMAND frames
pub const COMMAND_SET_PROFILE_ENABLE: u32 = 0x21;
pub const COMMAND_GET_PROFILE_STATISTICS: u32 = 0x22;
pub const COMMAND_SET_PERFORMANCE_MONITOR_ENABLE: u32 = 0x23;
pub const COMMAND_GET_PERFORMANCE_MONITOR_STATISTICS: u32 = 0x24;
pub const COMMAND_SET_DBG_CHECKPOINT: u32 = 0x2A;

// USB control requests
pub const CONTROL_FIFOQ_ENABLE_DROPPABLE: u32 = 0x07;

// USB identities
pub const KNERON_VENDOR_ID: u16 = 0x3231;
pub const PRODUCT_ID_KL520: u16 = 0x100;
pub const PRODUCT_ID_KL720: u16 = 0x720;
pub const PRODUCT_ID_KL530: u16 = 0x530;
pub const PRODUCT_ID_KL630: u16 = 0x630;
pub const PRODUCT_ID_KL730: u16 = 0x732;
pub const PRODUCT_ID_KL830: u16 = 0x832;

// Limits
pub const MAX_GROUP_DEVICE: usize = 20;
pub const MAX_INPUT_NODE_COUNT_V1: usize = 5;
pub const MAX_INPUT_NODE_COUNT_V2: usize = 50;
pub const MAX_CROP_BOX: usize = 4;
pub const MAX_PRE_PROC_INFO_V1: usize = 5;
pub const MAX_RAW_ONODE: usize = 40;
pub const MAX_CHECKPOINT_NODE_V1: usize = 50;

// Fixed frame sizes in bytes
pub const HEADER_STAMP_SIZE: usize = 24;
pub const COMMAND_HEADER_SIZE: usize = 12;
pub const CROP_BOX_SIZE: usize = 20;
pub const PRE_PROC_INFO_SIZE: usize = 60;
pub const IMAGE_HEADER_SIZE: usize = 28 + MAX_CROP_BOX * CROP_BOX_SIZE;
pub const IMAGE_INFERENCE_HEADER_SIZE: usize = HEADER_STAMP_SIZE + 8 + IMAGE_HEADER_SIZE;
pub const DATA_INFERENCE_HEADER_SIZE: usize = HEADER_STAMP_SIZE + 12;
pub const RESULT_HEADER_V1_SIZE: usize =
    HEADER_STAMP_SIZE + 4 + MAX_PRE_PROC_INFO_V1 * PRE_PROC_INFO_SIZE + 16;
pub const RESULT_HEADER_V2_SIZE: usize = HEADER_STAMP_SIZE + 28;
pub const KL520_NODE_METADATA_SIZE: usize = 24;
pub const KL720_ONODE_SIZE: usize = 14 * 4;
pub const KL630_ONODE_SIZE: usize = 13 * 4;
pub const KL730_ONODE_SIZE: usize = 56;
pub const RAW_TABLE_PREFIX_SIZE: usize = 8;
pub const NPU_DATA_HEADER_SIZE: usize = 12;
pub const NODE_HEADER_V2_SIZE: usize = 19 * 4;

// Numeric type codes used inside device frames
pub const DTYPE_INT8: u32 = 1;
pub const DTYPE_INT16: u32 = 2;
pub const DTYPE_INT32: u32 = 3;
pub const DTYPE_INT64: u32 = 4;
pub const DTYPE_UINT8: u32 = 5;
pub const DTYPE_UINT16: u32 = 6;
pub const DTYPE_UINT32: u32 = 7;
pub const DTYPE_UINT64: u32 = 8;
pub const DTYPE_FLOAT32: u32 = 9;
pub const DTYPE_BFLOAT16: u32 = 10;
pub const DTYPE_DOUBLE64: u32 = 11;

/// Round `value` up to the next multiple of `align` (`align` > 0).
pub fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Product of `dims`, or `None` if it does not fit in `usize`.
pub fn checked_extent(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// The 24-byte preamble that starts every inference and checkpoint frame.
///
/// On results `status_code` is the firmware verdict (0 = success); on
/// requests `total_image`/`image_index` let the device reassemble a
/// multi-input inference from its per-node frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderStamp {
    pub magic_type: u32,
    pub total_size: u32,
    pub job_id: u32,
    pub status_code: u32,
    pub total_image: u32,
    pub image_index: u32,
}

impl HeaderStamp {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let r = ByteView::new(buf);
        Ok(Self {
            magic_type: r.u32_at(0)?,
            total_size: r.u32_at(4)?,
            job_id: r.u32_at(8)?,
            status_code: r.u32_at(12)?,
            total_image: r.u32_at(16)?,
            image_index: r.u32_at(20)?,
        })
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        for word in [
            self.magic_type,
            self.total_size,
            self.job_id,
            self.status_code,
            self.total_image,
            self.image_index,
        ] {
            put_u32(out, word);
        }
    }

    /// Overwrite the magic and size words of an already encoded stamp.
    pub(crate) fn patch(buf: &mut [u8], magic_type: u32, total_size: u32) -> Result<()> {
        if buf.len() < HEADER_STAMP_SIZE {
            return Err(Error::InvalidParam(format!(
                "header of {} bytes is shorter than a header stamp",
                buf.len()
            )));
        }
        buf[0..4].copy_from_slice(&magic_type.to_le_bytes());
        buf[4..8].copy_from_slice(&total_size.to_le_bytes());
        Ok(())
    }
}

/// A COMMAND frame: `magic, total_size, command_id` followed by `args`.
pub fn command_frame(command_id: u32, args: &[u32]) -> Vec<u8> {
    let total = COMMAND_HEADER_SIZE + args.len() * 4;
    let mut out = Vec::with_capacity(total);
    put_u32(&mut out, MAGIC_TYPE_COMMAND);
    put_u32(&mut out, total as u32);
    put_u32(&mut out, command_id);
    for &arg in args {
        put_u32(&mut out, arg);
    }
    out
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Bounds-checked little-endian reads at absolute offsets.
///
/// Device frames are addressed by offsets the device itself wrote, so every
/// read goes through here and fails with [`Error::TruncatedData`] instead of
/// panicking.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    buf: &'a [u8],
}

impl<'a> ByteView<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset.checked_add(len).ok_or(Error::TruncatedData {
            offset,
            len,
            available: self.buf.len(),
        })?;
        self.buf.get(offset..end).ok_or(Error::TruncatedData {
            offset,
            len,
            available: self.buf.len(),
        })
    }

    /// View starting at `offset` and running to the end of the buffer.
    pub fn tail(&self, offset: usize) -> Result<ByteView<'a>> {
        let len = self.buf.len().checked_sub(offset).ok_or(Error::TruncatedData {
            offset,
            len: 0,
            available: self.buf.len(),
        })?;
        Ok(ByteView::new(self.slice(offset, len)?))
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let s = self.slice(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(s);
        Ok(out)
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn i8_at(&self, offset: usize) -> Result<i8> {
        Ok(i8::from_le_bytes(self.array(offset)?))
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array(offset)?))
    }

    pub fn i16_at(&self, offset: usize) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array(offset)?))
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(offset)?))
    }

    pub fn i32_at(&self, offset: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array(offset)?))
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array(offset)?))
    }

    pub fn i64_at(&self, offset: usize) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array(offset)?))
    }

    pub fn f32_at(&self, offset: usize) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array(offset)?))
    }

    pub fn f64_at(&self, offset: usize) -> Result<f64> {
        Ok(f64::from_le_bytes(self.array(offset)?))
    }

    /// `count` consecutive words starting at `offset`.
    pub fn u32_array(&self, offset: usize, count: usize) -> Result<Vec<u32>> {
        (0..count).map(|i| self.u32_at(offset + i * 4)).collect()
    }

    pub fn i32_array(&self, offset: usize, count: usize) -> Result<Vec<i32>> {
        (0..count).map(|i| self.i32_at(offset + i * 4)).collect()
    }
}
