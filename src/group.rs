//! Device group and frame transport.
//!
//! A [`DeviceGroup`] addresses several identical accelerators as one unit.
//! Requests go round-robin through `send_cursor`; results are read
//! round-robin through `recv_cursor`. The two cursors move independently so
//! one thread can keep sending while another drains results.
//!
//! Cursors only move after a transfer fully succeeds. A timeout, a
//! transport fault or a rejected header leaves them where they were, so the
//! caller can retry the same device.

use std::time::Duration;

use log::{debug, info, warn};

use crate::buffer::ScratchBuffer;
use crate::config::GroupConfig;
use crate::container;
use crate::error::{Error, Result};
use crate::tensor::ModelDescriptor;
use crate::transport::{Connector, DeviceDescriptor, Transport};
use crate::wire::{self, HeaderStamp};

/// A set of accelerators of one product, driven as a single device.
pub struct DeviceGroup<T> {
    devices: Vec<T>,
    product_id: u16,
    config: GroupConfig,
    model: Option<ModelDescriptor>,
    send_cursor: usize,
    recv_cursor: usize,
    scratch: ScratchBuffer,
}

/// Verify the stamp at the start of a result frame.
///
/// Checks run in a fixed order: magic, device status, job id, size. An
/// expected value of 0 skips that check.
///
/// # Errors
///
/// - [`Error::BadHeaderStamp`] if the magic is neither result generation.
/// - [`Error::DeviceReportedStatus`] with the firmware's own code.
/// - [`Error::JobIdMismatch`] / [`Error::SizeMismatch`].
pub fn verify_header_stamp(buf: &[u8], expected_job_id: u32, expected_size: u32) -> Result<HeaderStamp> {
    let stamp = HeaderStamp::parse(buf)?;
    if stamp.magic_type != wire::MAGIC_TYPE_INFERENCE && stamp.magic_type != wire::MAGIC_TYPE_INFERENCE_V2 {
        warn!(
            "Unexpected result stamp: magic 0x{:08X}, size {}, job {}, status {}",
            stamp.magic_type, stamp.total_size, stamp.job_id, stamp.status_code
        );
        return Err(Error::BadHeaderStamp {
            magic: stamp.magic_type,
        });
    }
    if stamp.status_code != 0 {
        return Err(Error::DeviceReportedStatus(stamp.status_code));
    }
    if expected_job_id > 0 && stamp.job_id != expected_job_id {
        return Err(Error::JobIdMismatch {
            expected: expected_job_id,
            actual: stamp.job_id,
        });
    }
    if expected_size > 0 && stamp.total_size != expected_size {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual: stamp.total_size,
        });
    }
    Ok(stamp)
}

impl<T: Transport> DeviceGroup<T> {
    /// Wrap already opened transports.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidParam`] for an empty group or more than
    ///   [`wire::MAX_GROUP_DEVICE`] devices.
    /// - [`Error::Config`] if `config` does not validate.
    pub fn new(devices: Vec<T>, product_id: u16, config: GroupConfig) -> Result<Self> {
        if devices.is_empty() || devices.len() > wire::MAX_GROUP_DEVICE {
            return Err(Error::InvalidParam(format!(
                "a device group holds 1 to {} devices, got {}",
                wire::MAX_GROUP_DEVICE,
                devices.len()
            )));
        }
        config.validate()?;
        info!(
            "Device group of {} device(s), product 0x{:x}",
            devices.len(),
            product_id
        );
        Ok(Self {
            devices,
            product_id,
            config,
            model: None,
            send_cursor: 0,
            recv_cursor: 0,
            scratch: ScratchBuffer::default(),
        })
    }

    /// Open every connectable descriptor and group the results.
    ///
    /// All descriptors must share one product id.
    pub fn connect<C>(connector: &mut C, descriptors: &[DeviceDescriptor], config: GroupConfig) -> Result<Self>
    where
        C: Connector<Device = T>,
    {
        let usable: Vec<&DeviceDescriptor> = descriptors.iter().filter(|d| d.is_connectable).collect();
        let first = usable
            .first()
            .ok_or_else(|| Error::InvalidParam("no connectable device".into()))?;
        if let Some(other) = usable.iter().find(|d| d.product_id != first.product_id) {
            return Err(Error::InvalidParam(format!(
                "cannot group product 0x{:x} with 0x{:x}",
                other.product_id, first.product_id
            )));
        }
        let product_id = first.product_id;

        let mut devices = Vec::with_capacity(usable.len());
        for descriptor in usable {
            debug!(
                "Opening device on port {} ({})",
                descriptor.port_id, descriptor.port_path
            );
            devices.push(connector.open(descriptor)?);
        }
        Self::new(devices, product_id, config)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Change the per-transfer timeout; 0 waits forever.
    pub fn set_timeout(&mut self, timeout_ms: u32) {
        self.config.timeout_ms = timeout_ms;
    }

    pub fn device(&self, index: usize) -> Option<&T> {
        self.devices.get(index)
    }

    pub fn device_mut(&mut self, index: usize) -> Option<&mut T> {
        self.devices.get_mut(index)
    }

    pub fn send_cursor(&self) -> usize {
        self.send_cursor
    }

    pub fn recv_cursor(&self) -> usize {
        self.recv_cursor
    }

    /// Input node limit of this product's firmware.
    pub fn max_input_node_count(&self) -> usize {
        match self.product_id {
            wire::PRODUCT_ID_KL730 | wire::PRODUCT_ID_KL830 => wire::MAX_INPUT_NODE_COUNT_V2,
            _ => wire::MAX_INPUT_NODE_COUNT_V1,
        }
    }

    /// Parse a model container and make it the group's loaded model.
    ///
    /// The previous model is replaced only if parsing succeeds.
    pub fn load_model(&mut self, container_bytes: &[u8]) -> Result<&ModelDescriptor> {
        let descriptor = container::parse(container_bytes)?;
        Ok(self.set_model(descriptor))
    }

    pub fn set_model(&mut self, descriptor: ModelDescriptor) -> &ModelDescriptor {
        info!(
            "Loaded {} model(s) for {:?}",
            descriptor.models.len(),
            descriptor.target_chip
        );
        self.model.insert(descriptor)
    }

    pub fn model(&self) -> Option<&ModelDescriptor> {
        self.model.as_ref()
    }

    /// Write `(header, payload)` frames to the device at `send_cursor`, then
    /// advance it. Empty payloads are not written.
    pub(crate) fn send_frames(&mut self, frames: &[(Vec<u8>, &[u8])]) -> Result<()> {
        let timeout = self.timeout();
        let index = self.send_cursor;
        let device = &mut self.devices[index];
        for (header, payload) in frames {
            debug!(
                "Sending {} + {} bytes to device {}",
                header.len(),
                payload.len(),
                index
            );
            device.write(header, timeout)?;
            if !payload.is_empty() {
                device.write(payload, timeout)?;
            }
        }
        self.advance_send();
        Ok(())
    }

    /// Read one frame from the device at `recv_cursor` without moving it.
    pub(crate) fn read_current(&mut self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.timeout();
        self.devices[self.recv_cursor].read(buf, timeout)
    }

    /// Read one frame from the device at `recv_cursor` into the scratch
    /// buffer and return the received bytes.
    pub(crate) fn read_current_scratch(&mut self) -> Result<&[u8]> {
        let timeout = self.timeout();
        let wanted = self.config.checkpoint_buffer_size as usize;
        let buf = self.scratch.ensure(wanted)?;
        let n = self.devices[self.recv_cursor].read(buf, timeout)?;
        Ok(&self.scratch.as_slice()[..n])
    }

    /// Send `command` to one device and read its reply into `reply`.
    pub(crate) fn exchange(&mut self, index: usize, command: &[u8], reply: &mut [u8]) -> Result<usize> {
        let timeout = self.timeout();
        let available = self.devices.len();
        let device = self.devices.get_mut(index).ok_or(Error::InvalidIndex {
            requested: index,
            available,
        })?;
        device.write(command, timeout)?;
        device.read(reply, timeout)
    }

    /// Send a COMMAND frame to one device and check the u32 return code.
    pub(crate) fn command(&mut self, index: usize, command: &[u8]) -> Result<()> {
        let mut reply = [0u8; 4];
        let n = self.exchange(index, command, &mut reply)?;
        if n < reply.len() {
            return Err(Error::TruncatedData {
                offset: 0,
                len: reply.len(),
                available: n,
            });
        }
        match u32::from_le_bytes(reply) {
            0 => Ok(()),
            code => Err(Error::DeviceReportedStatus(code)),
        }
    }

    /// Issue a vendor control request to every device, stopping at the first failure.
    pub(crate) fn control_all(&mut self, request: u32, arg1: u16, arg2: u16) -> Result<()> {
        let timeout = self.timeout();
        for device in &mut self.devices {
            device.control(request, arg1, arg2, timeout)?;
        }
        Ok(())
    }

    pub(crate) fn advance_send(&mut self) {
        self.send_cursor = (self.send_cursor + 1) % self.devices.len();
    }

    pub(crate) fn advance_recv(&mut self) {
        self.recv_cursor = (self.recv_cursor + 1) % self.devices.len();
        debug!("Receive cursor -> {}", self.recv_cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ScriptedTransport;

    fn group(n: usize) -> DeviceGroup<ScriptedTransport> {
        let devices = (0..n).map(|_| ScriptedTransport::new()).collect();
        DeviceGroup::new(devices, wire::PRODUCT_ID_KL720, GroupConfig::default()).unwrap()
    }

    fn stamp(magic: u32, status: u32, job: u32, size: u32) -> Vec<u8> {
        let mut out = Vec::new();
        HeaderStamp {
            magic_type: magic,
            total_size: size,
            job_id: job,
            status_code: status,
            ..Default::default()
        }
        .encode_into(&mut out);
        out
    }

    #[test]
    fn empty_or_oversized_groups_are_rejected() {
        assert!(DeviceGroup::<ScriptedTransport>::new(vec![], 0x720, GroupConfig::default()).is_err());
        let too_many = (0..=wire::MAX_GROUP_DEVICE).map(|_| ScriptedTransport::new()).collect();
        assert!(matches!(
            DeviceGroup::new(too_many, 0x720, GroupConfig::default()),
            Err(Error::InvalidParam(_))
        ));
    }

    #[test]
    fn stamp_checks_run_in_order() {
        let bad_magic = stamp(wire::MAGIC_TYPE_COMMAND, 7, 99, 99);
        assert!(matches!(
            verify_header_stamp(&bad_magic, 10, 24),
            Err(Error::BadHeaderStamp { .. })
        ));

        let status = stamp(wire::MAGIC_TYPE_INFERENCE, 7, 99, 99);
        assert!(matches!(
            verify_header_stamp(&status, 10, 24),
            Err(Error::DeviceReportedStatus(7))
        ));

        let job = stamp(wire::MAGIC_TYPE_INFERENCE_V2, 0, 99, 99);
        assert!(matches!(
            verify_header_stamp(&job, 10, 24),
            Err(Error::JobIdMismatch { expected: 10, actual: 99 })
        ));
        assert!(matches!(
            verify_header_stamp(&job, 0, 24),
            Err(Error::SizeMismatch { expected: 24, actual: 99 })
        ));
        assert!(verify_header_stamp(&job, 0, 0).is_ok());
    }

    #[test]
    fn send_cursor_wraps_round_robin() {
        let mut g = group(3);
        for expected in [1, 2, 0, 1] {
            g.send_frames(&[(vec![0; 4], &[1, 2][..])]).unwrap();
            assert_eq!(g.send_cursor(), expected);
        }
        assert_eq!(g.device(0).unwrap().written.len(), 4);
        assert_eq!(g.device(2).unwrap().written.len(), 2);
    }

    #[test]
    fn failed_write_keeps_send_cursor() {
        let mut g = group(2);
        g.device_mut(0).unwrap().fail_write(1);
        assert!(g.send_frames(&[(vec![0; 4], &[1][..])]).is_err());
        assert_eq!(g.send_cursor(), 0);
    }

    #[test]
    fn command_return_code_is_passed_through() {
        let mut g = group(1);
        g.device_mut(0).unwrap().push_frame(5u32.to_le_bytes().to_vec());
        assert!(matches!(g.command(0, &[0; 12]), Err(Error::DeviceReportedStatus(5))));
        g.device_mut(0).unwrap().push_frame(0u32.to_le_bytes().to_vec());
        g.command(0, &[0; 12]).unwrap();
    }

    #[test]
    fn failed_model_load_keeps_previous_model() {
        let mut g = group(1);
        assert!(g.load_model(&[1, 2, 3]).is_err());
        assert!(g.model().is_none());
    }

    #[test]
    fn connect_skips_busy_devices_and_refuses_mixed_products() {
        struct Opener(usize);
        impl Connector for Opener {
            type Device = ScriptedTransport;
            fn open(&mut self, _d: &DeviceDescriptor) -> Result<ScriptedTransport> {
                self.0 += 1;
                Ok(ScriptedTransport::new())
            }
        }
        let desc = |pid: u16, ok: bool| DeviceDescriptor {
            product_id: pid,
            is_connectable: ok,
            ..Default::default()
        };

        let mut opener = Opener(0);
        let g = DeviceGroup::connect(
            &mut opener,
            &[desc(0x720, true), desc(0x520, false), desc(0x720, true)],
            GroupConfig::default(),
        )
        .unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(opener.0, 2);

        assert!(matches!(
            DeviceGroup::connect(&mut opener, &[desc(0x720, true), desc(0x630, true)], GroupConfig::default()),
            Err(Error::InvalidParam(_))
        ));
    }
}
