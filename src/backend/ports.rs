use serde::Serialize;
use thiserror::Error;

/// Espressif USB VID.
pub const ESP32_S3_VID: u16 = 0x303A;
/// ESP32-S3 built-in USB serial/JTAG PID.
pub const ESP32_S3_PID: u16 = 0x1001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DevicePort {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Error, Debug)]
pub enum DiscoverError {
    #[error("serial discovery failed: {0}")]
    Serial(#[from] serialport::Error),
}

pub fn discover_ports() -> Result<Vec<DevicePort>, DiscoverError> {
    Ok(select_device_ports(serialport::available_ports()?))
}

/// First detected device port, if any.
pub fn find_device_port() -> Result<Option<String>, DiscoverError> {
    Ok(discover_ports()?.into_iter().next().map(|p| p.port_name))
}

pub(crate) fn select_device_ports(ports: Vec<serialport::SerialPortInfo>) -> Vec<DevicePort> {
    let mut out: Vec<DevicePort> = Vec::new();

    for p in ports {
        let serialport::SerialPortInfo {
            port_name,
            port_type,
        } = p;

        let serialport::SerialPortType::UsbPort(usb) = port_type else {
            continue;
        };

        if usb.vid != ESP32_S3_VID || usb.pid != ESP32_S3_PID {
            continue;
        }

        out.push(DevicePort {
            port_name,
            vid: usb.vid,
            pid: usb.pid,
            serial_number: usb.serial_number,
            manufacturer: usb.manufacturer,
            product: usb.product,
        });
    }

    out.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    out
}
