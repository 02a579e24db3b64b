//! Serial port handling
//!
//! Bluetooth SPP adapters appear as serial devices once bound to an RFCOMM
//! channel (`/dev/rfcommN` on Linux, an outgoing `COMn` port on Windows).

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use super::{LinkError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/rfcomm0" or "COM5")
    pub name: String,

    /// True for Bluetooth-bound ports
    pub bluetooth: bool,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (bluetooth, product) = match info.port_type {
            SerialPortType::BluetoothPort => (true, None),
            SerialPortType::UsbPort(usb_info) => (false, usb_info.product),
            _ => (false, None),
        };
        let bluetooth = bluetooth || info.port_name.contains("rfcomm");

        Self {
            name: info.port_name,
            bluetooth,
            product,
        }
    }
}

/// Sort key: rfcomm ports first (numerically), then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("rfcomm") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    (1, 0, basename.to_string())
}

/// List serial ports a Bluetooth adapter may be reachable through
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // udev does not always report rfcomm nodes through the enumeration API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("rfcomm") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        bluetooth: true,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port configured 8N1 without handshake, DTR and RTS low
pub fn open_port(name: &str, baud_rate: Option<u32>) -> Result<Box<dyn SerialPort>, LinkError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);

    let mut port = serialport::new(name, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(1))
        .open()?;

    port.write_data_terminal_ready(false)?;
    port.write_request_to_send(false)?;
    Ok(port)
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), LinkError> {
    port.clear(serialport::ClearBuffer::All)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // only checks that enumeration does not panic
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} (bluetooth: {})", port.name, port.bluetooth);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB0",
            "/dev/rfcomm1",
            "/dev/rfcomm10",
            "/dev/rfcomm0",
            "/dev/ttyACM0",
        ];
        let mut ports: Vec<PortInfo> = names
            .into_iter()
            .map(|n| PortInfo {
                name: n.to_string(),
                bluetooth: n.contains("rfcomm"),
                product: None,
            })
            .collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/rfcomm0",
                "/dev/rfcomm1",
                "/dev/rfcomm10",
                "/dev/ttyACM0",
                "/dev/ttyUSB0",
            ]
        );
    }
}
