//! Reader for the `.kne` model container.
//!
//! A container is a flatbuffer whose root table describes the target chip and
//! one or more compiled models. Only the fields the host runtime needs are
//! read; everything else (weights, command streams) is left to the firmware.
//!
//! ```text
//! table KNEContent  { header: KNEHeader; models: [Model]; }
//! table KNEHeader   { target: uint; }
//! table Model       { header: ModelHeader; }
//! table ModelHeader { id: uint; schema_version: SchemaVersion;
//!                     inputs: [Tensor]; outputs: [Tensor]; buffer_info: [BufferInfo]; }
//! table SchemaVersion { major_num: uint; minor_num: uint; revision_num: uint; }
//! table Tensor      { name: string; format: uint; shape: [int]; stride_aligned: [uint];
//!                     ch_dim: int; quantization: QuantizationParameters;
//!                     npu_shape: [int]; axis_permutation: [int]; }
//! table QuantizationParameters { radix: [byte]; scale: [ubyte];
//!                                scale_count: uint; scale_type: DataType; }
//! table BufferInfo  { buffer: Location; len: uint; }
//! enum DataType : ubyte { Int8, Int16, Int32, Int64, UInt8, UInt16, UInt32,
//!                         UInt64, Float, Bfloat16, Double }
//! enum Location : ubyte { INPUT_BUFFER, OUTPUT_BUFFER, WORKING_BUFFER, WEIGHT_BUFFER }
//! ```
//!
//! Field slots follow declaration order. Tensors carrying `npu_shape` come
//! from legacy exports and produce [`ShapeInfo::V1`]; all others produce
//! [`ShapeInfo::V2`] with row-major ONNX strides and the container's aligned
//! strides as NPU strides.

use log::debug;

use crate::error::{Error, Result};
use crate::tensor::{
    BufferInfo, BufferLocation, DType, DataLayout, FixedPointDescriptor, ModelDescriptor,
    Quantization, QuantizationV1, Scale, SchemaVersion, ShapeInfo, ShapeInfoV1, ShapeInfoV2,
    SingleModelDescriptor, TargetChip, TensorDescriptor,
};
use crate::wire::ByteView;

mod slot {
    pub const CONTENT_HEADER: usize = 0;
    pub const CONTENT_MODELS: usize = 1;

    pub const HEADER_TARGET: usize = 0;

    pub const MODEL_HEADER: usize = 0;

    pub const MODEL_ID: usize = 0;
    pub const MODEL_SCHEMA_VERSION: usize = 1;
    pub const MODEL_INPUTS: usize = 2;
    pub const MODEL_OUTPUTS: usize = 3;
    pub const MODEL_BUFFER_INFO: usize = 4;

    pub const VERSION_MAJOR: usize = 0;
    pub const VERSION_MINOR: usize = 1;
    pub const VERSION_REVISION: usize = 2;

    pub const TENSOR_NAME: usize = 0;
    pub const TENSOR_FORMAT: usize = 1;
    pub const TENSOR_SHAPE: usize = 2;
    pub const TENSOR_STRIDE_ALIGNED: usize = 3;
    pub const TENSOR_CH_DIM: usize = 4;
    pub const TENSOR_QUANTIZATION: usize = 5;
    pub const TENSOR_NPU_SHAPE: usize = 6;
    pub const TENSOR_AXIS_PERMUTATION: usize = 7;

    pub const QUANT_RADIX: usize = 0;
    pub const QUANT_SCALE: usize = 1;
    pub const QUANT_SCALE_COUNT: usize = 2;
    pub const QUANT_SCALE_TYPE: usize = 3;

    pub const BUFFER_LOCATION: usize = 0;
    pub const BUFFER_LEN: usize = 1;
}

/// Parse a container into a [`ModelDescriptor`].
///
/// The first structural problem aborts the whole parse.
///
/// # Errors
///
/// [`Error::InvalidModel`] if the buffer is not a well-formed container, a
/// required table is missing, a data-type code is unknown or any offset
/// points outside the buffer.
pub fn parse(bytes: &[u8]) -> Result<ModelDescriptor> {
    let root = Table::root(bytes)?;

    let header = root
        .table(slot::CONTENT_HEADER)?
        .ok_or_else(|| invalid("container has no header"))?;
    let target_chip = TargetChip::from(header.u32_or(slot::HEADER_TARGET, 0)?);

    let models_vec = root
        .vector(slot::CONTENT_MODELS)?
        .ok_or_else(|| invalid("container has no model list"))?;

    let mut models = Vec::with_capacity(models_vec.len());
    for i in 0..models_vec.len() {
        let model = models_vec.table_at(i)?;
        models.push(parse_model(&model, target_chip)?);
    }

    debug!(
        "parsed container: target {:?}, {} model(s)",
        target_chip,
        models.len()
    );

    Ok(ModelDescriptor {
        target_chip,
        models,
    })
}

fn parse_model(model: &Table<'_>, target_chip: TargetChip) -> Result<SingleModelDescriptor> {
    let header = model
        .table(slot::MODEL_HEADER)?
        .ok_or_else(|| invalid("model has no header"))?;

    let id = header.u32_or(slot::MODEL_ID, 0)?;

    let schema_version = match header.table(slot::MODEL_SCHEMA_VERSION)? {
        Some(v) => SchemaVersion {
            major: v.u32_or(slot::VERSION_MAJOR, 0)?,
            minor: v.u32_or(slot::VERSION_MINOR, 0)?,
            revision: v.u32_or(slot::VERSION_REVISION, 0)?,
        },
        None => return Err(invalid(format!("model {} has no schema version", id))),
    };

    let inputs = header
        .vector(slot::MODEL_INPUTS)?
        .ok_or_else(|| invalid(format!("model {} has no input tensors", id)))?;
    let outputs = header
        .vector(slot::MODEL_OUTPUTS)?
        .ok_or_else(|| invalid(format!("model {} has no output tensors", id)))?;

    let input_nodes = (0..inputs.len())
        .map(|i| parse_tensor(&inputs.table_at(i)?, i as u32, target_chip))
        .collect::<Result<Vec<_>>>()?;
    let output_nodes = (0..outputs.len())
        .map(|i| parse_tensor(&outputs.table_at(i)?, i as u32, target_chip))
        .collect::<Result<Vec<_>>>()?;

    let mut buffer_info = Vec::new();
    if let Some(infos) = header.vector(slot::MODEL_BUFFER_INFO)? {
        for i in 0..infos.len() {
            let info = infos.table_at(i)?;
            buffer_info.push(BufferInfo {
                location: BufferLocation::from(info.u8_or(slot::BUFFER_LOCATION, 0)?),
                len: info.u32_or(slot::BUFFER_LEN, 0)?,
            });
        }
    }

    Ok(SingleModelDescriptor {
        id,
        target_chip,
        schema_version,
        input_nodes,
        output_nodes,
        buffer_info,
    })
}

fn parse_tensor(tensor: &Table<'_>, index: u32, target_chip: TargetChip) -> Result<TensorDescriptor> {
    let name = tensor.string(slot::TENSOR_NAME)?.unwrap_or_default().to_string();
    let data_layout =
        DataLayout::from_format_code(tensor.u32_or(slot::TENSOR_FORMAT, 0)?, target_chip);

    let shape = match tensor.vector(slot::TENSOR_SHAPE)? {
        Some(v) => v.i32s()?,
        None => Vec::new(),
    };

    let shape_info = match tensor.vector(slot::TENSOR_NPU_SHAPE)? {
        Some(npu) => {
            let npu_shape = npu.i32s()?;
            if npu_shape.len() != 4 {
                return Err(invalid(format!(
                    "tensor '{}' has a {}-D legacy NPU shape",
                    name,
                    npu_shape.len()
                )));
            }
            let axis_permutation_onnx_to_npu = match tensor.vector(slot::TENSOR_AXIS_PERMUTATION)? {
                Some(p) => p.i32s()?,
                None => (0..npu_shape.len() as i32).collect(),
            };
            let onnx_shape = if shape.is_empty() { npu_shape.clone() } else { shape };
            ShapeInfo::V1(ShapeInfoV1 {
                npu_shape,
                onnx_shape,
                axis_permutation_onnx_to_npu,
            })
        }
        None => {
            let stride_npu = match tensor.vector(slot::TENSOR_STRIDE_ALIGNED)? {
                Some(v) => v.u32s()?,
                None => Vec::new(),
            };
            if stride_npu.len() != shape.len() {
                return Err(invalid(format!(
                    "tensor '{}' has {} dims but {} aligned strides",
                    name,
                    shape.len(),
                    stride_npu.len()
                )));
            }
            ShapeInfo::V2(ShapeInfoV2::with_row_major_onnx(shape, stride_npu))
        }
    };

    let ch_dim = tensor.i32_or(slot::TENSOR_CH_DIM, 0)?;
    let quantized_axis = u32::try_from(ch_dim)
        .map_err(|_| invalid(format!("tensor '{}' has negative channel dim {}", name, ch_dim)))?;

    let quant = tensor
        .table(slot::TENSOR_QUANTIZATION)?
        .ok_or_else(|| invalid(format!("tensor '{}' has no quantization parameters", name)))?;
    let descriptors = parse_fixed_point_descriptors(&quant)?;

    Ok(TensorDescriptor {
        index,
        name,
        data_layout,
        shape_info,
        quantization: Quantization::V1(QuantizationV1 {
            quantized_axis,
            descriptors,
        }),
    })
}

/// Descriptor count is `max(scale_count, len(radix))`. A single radix is
/// shared by every descriptor, and the scale only advances when the
/// container declares more than one.
fn parse_fixed_point_descriptors(quant: &Table<'_>) -> Result<Vec<FixedPointDescriptor>> {
    let scale_type = quant.u8_or(slot::QUANT_SCALE_TYPE, 0)?;
    let dtype = container_dtype(scale_type)
        .ok_or_else(|| invalid(format!("unknown scale data type {}", scale_type)))?;

    let radix: Vec<i8> = match quant.vector(slot::QUANT_RADIX)? {
        Some(v) => v.bytes(1)?.iter().map(|&b| b as i8).collect(),
        None => Vec::new(),
    };
    let scale_bytes: &[u8] = match quant.vector(slot::QUANT_SCALE)? {
        Some(v) => v.bytes(1)?,
        None => &[],
    };
    let scale_count = quant.u32_or(slot::QUANT_SCALE_COUNT, 0)? as usize;

    let count = scale_count.max(radix.len());
    let mut descriptors = Vec::with_capacity(count);
    for idx in 0..count {
        let r = if radix.len() == 1 {
            radix[0]
        } else {
            *radix
                .get(idx)
                .ok_or_else(|| invalid(format!("radix vector too short for descriptor {}", idx)))?
        };
        let scale_index = if scale_count > 1 { idx } else { 0 };
        let scale = Scale::read(dtype, scale_bytes, scale_index)
            .map_err(|_| invalid(format!("scale vector too short for descriptor {}", idx)))?;
        descriptors.push(FixedPointDescriptor {
            radix: r as i32,
            scale,
        });
    }
    Ok(descriptors)
}

fn container_dtype(code: u8) -> Option<DType> {
    Some(match code {
        0 => DType::Int8,
        1 => DType::Int16,
        2 => DType::Int32,
        3 => DType::Int64,
        4 => DType::UInt8,
        5 => DType::UInt16,
        6 => DType::UInt32,
        7 => DType::UInt64,
        8 => DType::Float32,
        9 => DType::BFloat16,
        10 => DType::Float64,
        _ => return None,
    })
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidModel(msg.into())
}

fn structural(e: Error) -> Error {
    match e {
        Error::TruncatedData { offset, len, available } => Error::InvalidModel(format!(
            "offset {} (+{}) outside container of {} bytes",
            offset, len, available
        )),
        other => other,
    }
}

/// A flatbuffer table located at `pos`.
struct Table<'a> {
    view: ByteView<'a>,
    pos: usize,
    vtable: usize,
    vtable_len: usize,
}

impl<'a> Table<'a> {
    fn root(buf: &'a [u8]) -> Result<Self> {
        let view = ByteView::new(buf);
        let rel = view.u32_at(0).map_err(structural)? as usize;
        Self::at(view, rel)
    }

    fn at(view: ByteView<'a>, pos: usize) -> Result<Self> {
        let soffset = view.i32_at(pos).map_err(structural)? as i64;
        let vtable = pos as i64 - soffset;
        if vtable < 0 {
            return Err(invalid(format!("table at {} has a vtable before the buffer", pos)));
        }
        let vtable = vtable as usize;
        let vtable_len = view.u16_at(vtable).map_err(structural)? as usize;
        if vtable_len < 4 {
            return Err(invalid(format!("vtable at {} is {} bytes", vtable, vtable_len)));
        }
        view.slice(vtable, vtable_len).map_err(structural)?;
        Ok(Self {
            view,
            pos,
            vtable,
            vtable_len,
        })
    }

    /// Absolute position of field `slot`, or `None` when absent.
    fn field(&self, slot: usize) -> Result<Option<usize>> {
        let entry = 4 + slot * 2;
        if entry + 2 > self.vtable_len {
            return Ok(None);
        }
        let rel = self.view.u16_at(self.vtable + entry).map_err(structural)? as usize;
        Ok((rel != 0).then_some(self.pos + rel))
    }

    fn u32_or(&self, slot: usize, default: u32) -> Result<u32> {
        match self.field(slot)? {
            Some(at) => self.view.u32_at(at).map_err(structural),
            None => Ok(default),
        }
    }

    fn i32_or(&self, slot: usize, default: i32) -> Result<i32> {
        match self.field(slot)? {
            Some(at) => self.view.i32_at(at).map_err(structural),
            None => Ok(default),
        }
    }

    fn u8_or(&self, slot: usize, default: u8) -> Result<u8> {
        match self.field(slot)? {
            Some(at) => self.view.u8_at(at).map_err(structural),
            None => Ok(default),
        }
    }

    fn deref(&self, slot: usize) -> Result<Option<usize>> {
        match self.field(slot)? {
            Some(at) => {
                let rel = self.view.u32_at(at).map_err(structural)? as usize;
                Ok(Some(at + rel))
            }
            None => Ok(None),
        }
    }

    fn table(&self, slot: usize) -> Result<Option<Table<'a>>> {
        self.deref(slot)?
            .map(|target| Table::at(self.view, target))
            .transpose()
    }

    fn vector(&self, slot: usize) -> Result<Option<Vector<'a>>> {
        match self.deref(slot)? {
            Some(target) => {
                let len = self.view.u32_at(target).map_err(structural)? as usize;
                Ok(Some(Vector {
                    view: self.view,
                    start: target + 4,
                    len,
                }))
            }
            None => Ok(None),
        }
    }

    fn string(&self, slot: usize) -> Result<Option<&'a str>> {
        match self.vector(slot)? {
            Some(v) => {
                let bytes = v.bytes(1)?;
                std::str::from_utf8(bytes)
                    .map(Some)
                    .map_err(|_| invalid("string field is not UTF-8"))
            }
            None => Ok(None),
        }
    }
}

struct Vector<'a> {
    view: ByteView<'a>,
    start: usize,
    len: usize,
}

impl<'a> Vector<'a> {
    fn len(&self) -> usize {
        self.len
    }

    fn bytes(&self, elem_size: usize) -> Result<&'a [u8]> {
        let total = self
            .len
            .checked_mul(elem_size)
            .ok_or_else(|| invalid("vector length overflows"))?;
        self.view.slice(self.start, total).map_err(structural)
    }

    fn i32s(&self) -> Result<Vec<i32>> {
        self.bytes(4)?;
        self.view.i32_array(self.start, self.len).map_err(structural)
    }

    fn u32s(&self) -> Result<Vec<u32>> {
        self.bytes(4)?;
        self.view.u32_array(self.start, self.len).map_err(structural)
    }

    fn table_at(&self, i: usize) -> Result<Table<'a>> {
        let at = self.start + i * 4;
        let rel = self.view.u32_at(at).map_err(structural)? as usize;
        Table::at(self.view, at + rel)
    }
}

/// Minimal flatbuffer writer for building containers in tests.
#[cfg(test)]
pub(crate) mod test_support {
    pub enum Field {
        U32(u32),
        I32(i32),
        U8(u8),
        Str(String),
        I32s(Vec<i32>),
        U32s(Vec<u32>),
        Bytes(Vec<u8>),
        Table(Obj),
        Tables(Vec<Obj>),
    }

    /// A table; the position in the list is the field slot.
    pub struct Obj(pub Vec<Option<Field>>);

    pub fn finish(root: &Obj) -> Vec<u8> {
        let mut buf = vec![0u8; 4];
        let pos = write_obj(&mut buf, root);
        buf[0..4].copy_from_slice(&(pos as u32).to_le_bytes());
        buf
    }

    fn align4(buf: &mut Vec<u8>) {
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    fn patch(buf: &mut [u8], at: usize, target: usize) {
        buf[at..at + 4].copy_from_slice(&((target - at) as u32).to_le_bytes());
    }

    fn write_obj(buf: &mut Vec<u8>, obj: &Obj) -> usize {
        align4(buf);
        let vt_pos = buf.len();
        let vt_len = 4 + 2 * obj.0.len();
        let present = obj.0.iter().filter(|f| f.is_some()).count();
        buf.extend_from_slice(&(vt_len as u16).to_le_bytes());
        buf.extend_from_slice(&((4 + 4 * present) as u16).to_le_bytes());
        let mut k = 0;
        for f in &obj.0 {
            let off = if f.is_some() {
                k += 1;
                4 + 4 * (k - 1)
            } else {
                0
            };
            buf.extend_from_slice(&(off as u16).to_le_bytes());
        }
        align4(buf);

        let table_pos = buf.len();
        buf.extend_from_slice(&((table_pos - vt_pos) as i32).to_le_bytes());
        let mut deferred = Vec::new();
        for f in obj.0.iter().flatten() {
            let at = buf.len();
            match f {
                Field::U32(v) => buf.extend_from_slice(&v.to_le_bytes()),
                Field::I32(v) => buf.extend_from_slice(&v.to_le_bytes()),
                Field::U8(v) => buf.extend_from_slice(&[*v, 0, 0, 0]),
                _ => {
                    buf.extend_from_slice(&[0; 4]);
                    deferred.push((at, f));
                }
            }
        }
        for (at, f) in deferred {
            let target = write_child(buf, f);
            patch(buf, at, target);
        }
        table_pos
    }

    fn write_child(buf: &mut Vec<u8>, f: &Field) -> usize {
        align4(buf);
        let pos = buf.len();
        match f {
            Field::Str(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
                buf.push(0);
            }
            Field::I32s(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                v.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes()));
            }
            Field::U32s(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                v.iter().for_each(|x| buf.extend_from_slice(&x.to_le_bytes()));
            }
            Field::Bytes(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v);
            }
            Field::Table(o) => return write_obj(buf, o),
            Field::Tables(objs) => {
                buf.extend_from_slice(&(objs.len() as u32).to_le_bytes());
                let first = buf.len();
                buf.extend(std::iter::repeat(0u8).take(4 * objs.len()));
                for (i, o) in objs.iter().enumerate() {
                    let target = write_obj(buf, o);
                    patch(buf, first + 4 * i, target);
                }
            }
            Field::U32(_) | Field::I32(_) | Field::U8(_) => unreachable!("scalars are inline"),
        }
        align4(buf);
        pos
    }

    /// Quantization table with float32 scales.
    pub fn quantization(radix: &[i8], scales: &[f32]) -> Obj {
        let scale_bytes = scales.iter().flat_map(|s| s.to_le_bytes()).collect();
        Obj(vec![
            Some(Field::Bytes(radix.iter().map(|&r| r as u8).collect())),
            Some(Field::Bytes(scale_bytes)),
            Some(Field::U32(scales.len() as u32)),
            Some(Field::U8(8)),
        ])
    }

    pub fn tensor(name: &str, format: u32, shape: &[i32], stride: &[u32], quant: Obj) -> Obj {
        Obj(vec![
            Some(Field::Str(name.to_string())),
            Some(Field::U32(format)),
            Some(Field::I32s(shape.to_vec())),
            Some(Field::U32s(stride.to_vec())),
            Some(Field::I32(1)),
            Some(Field::Table(quant)),
        ])
    }

    /// Legacy tensor carrying a 4-D NPU shape.
    pub fn legacy_tensor(name: &str, format: u32, npu_shape: [i32; 4], quant: Obj) -> Obj {
        Obj(vec![
            Some(Field::Str(name.to_string())),
            Some(Field::U32(format)),
            Some(Field::I32s(npu_shape.to_vec())),
            None,
            Some(Field::I32(1)),
            Some(Field::Table(quant)),
            Some(Field::I32s(npu_shape.to_vec())),
        ])
    }

    /// Model table; `version` of `None` leaves the schema version slot empty.
    pub fn model(id: u32, version: Option<[u32; 3]>, inputs: Vec<Obj>, outputs: Vec<Obj>, output_buffer: u32) -> Obj {
        let header = Obj(vec![
            Some(Field::U32(id)),
            version.map(|v| Field::Table(Obj(v.iter().map(|&x| Some(Field::U32(x))).collect()))),
            Some(Field::Tables(inputs)),
            Some(Field::Tables(outputs)),
            Some(Field::Tables(vec![Obj(vec![
                Some(Field::U8(1)),
                Some(Field::U32(output_buffer)),
            ])])),
        ]);
        Obj(vec![Some(Field::Table(header))])
    }

    pub fn container_of(target: u32, models: Vec<Obj>) -> Vec<u8> {
        finish(&Obj(vec![
            Some(Field::Table(Obj(vec![Some(Field::U32(target))]))),
            Some(Field::Tables(models)),
        ]))
    }

    /// Container whose models all carry schema version 1.2.3.
    pub fn container(target: u32, models: Vec<(u32, Vec<Obj>, Vec<Obj>, u32)>) -> Vec<u8> {
        let models = models
            .into_iter()
            .map(|(id, inputs, outputs, output_buffer)| model(id, Some([1, 2, 3]), inputs, outputs, output_buffer))
            .collect();
        container_of(target, models)
    }
}
