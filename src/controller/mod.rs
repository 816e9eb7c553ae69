//! Controller subsystem for the USB pad/knob controller
//!
//! Turns raw endpoint reports into typed events:
//!
//! 1. [`usb_link`] - Device discovery, interface claim and raw report reads
//! 2. [`report_decoder`] - Report to [`event::ControllerEvent`] mapping
//! 3. [`device_reader`] - Read loop feeding decoded events into the queue
//!
//! # Architecture
//!
//! ```text
//! USB endpoint ──► UsbLink ──► report_decoder ──► DeviceReader ──► EventQueue
//!                  (Report)    (ControllerEvent)
//! ```

pub mod device_reader;
pub mod event;
pub mod report_decoder;
pub mod usb_link;

pub use device_reader::{DeviceLost, DeviceReader, ReaderStats, ReportSource};
pub use event::{ControllerEvent, Report, REPORT_SIZE};
pub use usb_link::{DeviceError, DeviceSettings, TransferKind, UsbLink};
