pub mod error;
pub mod wire;
pub mod tensor;
pub mod container;
pub mod quantization;
pub mod layout;
pub mod raw_output;
pub mod transport;
pub mod config;
mod buffer;
pub mod group;
pub mod inference;
pub mod checkpoint;

pub use error::{Error, Result};
pub use config::GroupConfig;
pub use group::{verify_header_stamp, DeviceGroup};
pub use container::parse as parse_container;
pub use layout::{ChannelOrdering, ChannelOrderingConvert, FixedNodeOutput, FloatNodeOutput};
pub use raw_output::{RawNodeOutput, RawResult, ResultHeader};
pub use checkpoint::{decode_checkpoint, CheckpointPayload};
pub use tensor::{
    DataLayout, ModelDescriptor, Quantization, ShapeInfo, TargetChip, TensorDescriptor,
};
pub use transport::{Connector, DeviceDescriptor, ScriptedTransport, Transport};
