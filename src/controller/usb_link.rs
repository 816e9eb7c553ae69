//! USB link to the pad controller
//!
//! Wraps the `nusb` device and the claimed input interface. The link is a
//! two-state machine: [`Detached`] after the device has been opened and
//! [`Claimed`] once the configuration is selected and the interface claimed.
//! Only a claimed link can read reports.

use nusb::transfer::{RequestBuffer, TransferError};
use serde::{Deserialize, Serialize};
use statum::{machine, state};
use std::io;
use tracing::{debug, info, warn};

use super::device_reader::ReportSource;
use super::event::{Report, REPORT_SIZE};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Interrupt,
    Bulk,
}

// Device identification and endpoint layout
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub configuration: u8,
    pub interface: u8,
    pub alt_setting: u8,
    /// Endpoint number, without the direction bit
    pub endpoint: u8,
    pub transfer: TransferKind,
    pub detach_kernel_driver: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x09e8,
            product_id: 0x0075,
            configuration: 1,
            interface: 1,
            alt_setting: 0,
            endpoint: 1,
            transfer: TransferKind::Interrupt,
            detach_kernel_driver: true,
        }
    }
}

impl DeviceSettings {
    /// Address of the inbound endpoint (direction bit set)
    pub fn endpoint_address(&self) -> u8 {
        0x80 | (self.endpoint & 0x0f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Unable to enumerate USB devices: {0}")]
    Enumerate(#[source] io::Error),

    #[error("No USB device {vendor_id:04x}:{product_id:04x} found")]
    NotFound { vendor_id: u16, product_id: u16 },

    #[error("Failed to open USB device: {0}")]
    Open(#[source] io::Error),

    #[error("Failed to select configuration {configuration}: {source}")]
    Configuration {
        configuration: u8,
        #[source]
        source: io::Error,
    },

    #[error("Failed to claim interface {interface}: {source}")]
    Claim {
        interface: u8,
        #[source]
        source: io::Error,
    },

    #[error("Failed to select alternate setting {alt_setting} of interface {interface}: {source}")]
    AltSetting {
        interface: u8,
        alt_setting: u8,
        #[source]
        source: io::Error,
    },

    #[error("Interface has not been claimed")]
    NotClaimed,

    #[error("Read from endpoint {endpoint:#04x} failed: {source}")]
    Transfer {
        endpoint: u8,
        #[source]
        source: TransferError,
    },
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Detached,
    Claimed,
}

#[machine]
pub struct UsbLink<S: LinkState> {
    settings: DeviceSettings,
    device: nusb::Device,
    interface: Option<nusb::Interface>,
}

impl UsbLink<Detached> {
    /// Finds the controller by vendor/product id and opens it
    pub fn open(settings: DeviceSettings) -> Result<Self, DeviceError> {
        info!(
            "Looking for USB device {:04x}:{:04x}",
            settings.vendor_id, settings.product_id
        );

        let device_info = nusb::list_devices()
            .map_err(DeviceError::Enumerate)?
            .find(|d| d.vendor_id() == settings.vendor_id && d.product_id() == settings.product_id)
            .ok_or(DeviceError::NotFound {
                vendor_id: settings.vendor_id,
                product_id: settings.product_id,
            })?;

        info!(
            "Found '{}' on bus {} address {}",
            device_info.product_string().unwrap_or("Unknown"),
            device_info.bus_number(),
            device_info.device_address()
        );

        let device = device_info.open().map_err(DeviceError::Open)?;
        Ok(Self::new(settings, device, None))
    }

    /// Selects the configuration, claims the interface and its alternate
    /// setting, and transitions to [`Claimed`]
    pub fn claim(mut self) -> Result<UsbLink<Claimed>, DeviceError> {
        let configuration = self.settings.configuration;
        let active = self
            .device
            .active_configuration()
            .map(|c| c.configuration_value())
            .ok();
        if active == Some(configuration) {
            debug!("Configuration {} already active", configuration);
        } else {
            info!("Selecting configuration {} (active: {:?})", configuration, active);
            self.device
                .set_configuration(configuration)
                .map_err(|source| DeviceError::Configuration {
                    configuration,
                    source,
                })?;
        }

        let interface_number = self.settings.interface;
        let claimed = if self.settings.detach_kernel_driver {
            self.device.detach_and_claim_interface(interface_number)
        } else {
            self.device.claim_interface(interface_number)
        };
        let interface = claimed.map_err(|source| DeviceError::Claim {
            interface: interface_number,
            source,
        })?;

        let alt_setting = self.settings.alt_setting;
        if let Err(source) = interface.set_alt_setting(alt_setting) {
            return Err(DeviceError::AltSetting {
                interface: interface_number,
                alt_setting,
                source,
            });
        }

        info!(
            "Claimed interface ({}, {}), reading endpoint {:#04x} ({:?} transfers)",
            interface_number,
            alt_setting,
            self.settings.endpoint_address(),
            self.settings.transfer
        );

        self.interface = Some(interface);
        Ok(self.transition())
    }
}

impl ReportSource for UsbLink<Claimed> {
    async fn read_report(&mut self) -> Result<Report, DeviceError> {
        let endpoint = self.settings.endpoint_address();
        let transfer = self.settings.transfer;
        let interface = self.interface.as_ref().ok_or(DeviceError::NotClaimed)?;

        loop {
            let buffer = RequestBuffer::new(REPORT_SIZE);
            let completion = match transfer {
                TransferKind::Interrupt => interface.interrupt_in(endpoint, buffer).await,
                TransferKind::Bulk => interface.bulk_in(endpoint, buffer).await,
            };
            let data = completion
                .into_result()
                .map_err(|source| DeviceError::Transfer { endpoint, source })?;

            if data.is_empty() {
                debug!("Empty transfer from endpoint {:#04x}, reading again", endpoint);
                continue;
            }
            if data.len() < REPORT_SIZE {
                warn!(
                    "Short report ({} of {} bytes), padding with zeros",
                    data.len(),
                    REPORT_SIZE
                );
            }
            return Ok(Report::from_slice(&data));
        }
    }
}
