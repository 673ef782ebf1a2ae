//! Device transport seam.
//!
//! The runtime never talks to USB directly. A [`Connector`] opens devices
//! described by a [`DeviceDescriptor`] and hands back a [`Transport`] per
//! device; the device group only ever uses bulk read/write and a vendor
//! control request.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Negotiated USB link speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UsbSpeed {
    #[default]
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
    SuperPlusX2,
}

/// One attached accelerator as reported by device scanning.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub port_id: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub link_speed: UsbSpeed,
    /// Kneron serial number.
    pub kn_number: u32,
    /// False when another process already holds the device.
    pub is_connectable: bool,
    pub port_path: String,
    pub firmware: String,
}

/// Bulk and control access to one device.
///
/// A zero `timeout` means wait forever.
pub trait Transport {
    /// Write all of `data` to the bulk-out endpoint.
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<()>;

    /// Read one bulk-in transfer into `buf`, returning the number of bytes.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Issue a vendor control request.
    fn control(&mut self, request: u32, arg1: u16, arg2: u16, timeout: Duration) -> Result<()>;
}

/// Opens transports for descriptors found by scanning.
pub trait Connector {
    type Device: Transport;

    fn open(&mut self, descriptor: &DeviceDescriptor) -> Result<Self::Device>;
}

/// What a [`ScriptedTransport`] returns for the next read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Frame(Vec<u8>),
    Timeout,
    Failure(String),
}

/// In-memory transport driven by a queue of replies.
///
/// Every write and control request is recorded. Reads pop the reply queue;
/// an empty queue behaves like a device that never answers.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    pub written: Vec<Vec<u8>>,
    pub controls: Vec<(u32, u16, u16)>,
    replies: VecDeque<Reply>,
    failing_writes: VecDeque<bool>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&mut self, reply: Reply) -> &mut Self {
        self.replies.push_back(reply);
        self
    }

    pub fn push_frame(&mut self, frame: Vec<u8>) -> &mut Self {
        self.push_reply(Reply::Frame(frame))
    }

    /// Make the `n`-th write from now (0-based) fail.
    pub fn fail_write(&mut self, n: usize) -> &mut Self {
        if self.failing_writes.len() <= n {
            self.failing_writes.resize(n + 1, false);
        }
        self.failing_writes[n] = true;
        self
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}

impl Transport for ScriptedTransport {
    fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<()> {
        if self.failing_writes.pop_front().unwrap_or(false) {
            return Err(Error::TransportFailure("scripted write failure".into()));
        }
        self.written.push(data.to_vec());
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        match self.replies.pop_front() {
            Some(Reply::Frame(frame)) => {
                if frame.len() > buf.len() {
                    return Err(Error::TransportFailure(format!(
                        "{}-byte transfer overflows {}-byte buffer",
                        frame.len(),
                        buf.len()
                    )));
                }
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            Some(Reply::Failure(msg)) => Err(Error::TransportFailure(msg)),
            Some(Reply::Timeout) | None => Err(Error::Timeout),
        }
    }

    fn control(&mut self, request: u32, arg1: u16, arg2: u16, _timeout: Duration) -> Result<()> {
        self.controls.push((request, arg1, arg2));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reads_follow_queue() {
        let mut t = ScriptedTransport::new();
        t.push_frame(vec![1, 2, 3]).push_reply(Reply::Timeout);

        let mut buf = [0u8; 8];
        assert_eq!(t.read(&mut buf, Duration::ZERO).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert!(t.read(&mut buf, Duration::ZERO).unwrap_err().is_timeout());
        assert!(t.read(&mut buf, Duration::ZERO).unwrap_err().is_timeout());
    }

    #[test]
    fn oversized_frame_is_transport_failure() {
        let mut t = ScriptedTransport::new();
        t.push_frame(vec![0; 16]);
        let mut buf = [0u8; 4];
        assert!(matches!(
            t.read(&mut buf, Duration::ZERO),
            Err(Error::TransportFailure(_))
        ));
    }

    #[test]
    fn scripted_write_failure_is_not_recorded() {
        let mut t = ScriptedTransport::new();
        t.fail_write(1);
        t.write(b"a", Duration::ZERO).unwrap();
        assert!(t.write(b"b", Duration::ZERO).is_err());
        t.write(b"c", Duration::ZERO).unwrap();
        assert_eq!(t.written, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn descriptor_serializes_to_toml() {
        let d = DeviceDescriptor {
            port_id: 3,
            vendor_id: 0x3231,
            product_id: 0x720,
            link_speed: UsbSpeed::Super,
            kn_number: 0xABCD,
            is_connectable: true,
            port_path: "1-2".into(),
            firmware: "KDP2".into(),
        };
        let text = toml::to_string(&d).unwrap();
        assert!(text.contains("link_speed = \"Super\""));
        let back: DeviceDescriptor = toml::from_str(&text).unwrap();
        assert_eq!(back, d);
    }
}
