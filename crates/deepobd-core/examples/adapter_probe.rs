//! Bluetooth Adapter Probe
//!
//! Connects to a BMW-FAST adapter or ELM327, sends one request telegram and
//! prints the response.
//!
//! Usage:
//!   cargo run --example adapter_probe -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       RFCOMM tty, COM port or host:port (default: /dev/rfcomm0)
//!   --elm             Talk to an ELM327 instead of a dedicated adapter
//!   --target ADDR     ECU address in hex (default: 12)
//!   --service HEX     Request payload in hex (default: 22F190)
//!   --timeout MS      Response timeout in ms (default: 1000)
//!   --list            List serial ports and exit

use std::time::Duration;

use deepobd_core::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut port_name = "/dev/rfcomm0".to_string();
    let mut elm327 = false;
    let mut target = 0x12u8;
    let mut service = vec![0x22, 0xF1, 0x90];
    let mut timeout_ms = 1000u64;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    port_name = args[i].clone();
                }
            }
            "--elm" => {
                elm327 = true;
            }
            "--target" => {
                i += 1;
                if i < args.len() {
                    target = u8::from_str_radix(&args[i], 16).unwrap_or(0x12);
                }
            }
            "--service" => {
                i += 1;
                if i < args.len() {
                    match hex::decode(&args[i]) {
                        Ok(bytes) if !bytes.is_empty() => service = bytes,
                        _ => eprintln!("Ignoring invalid service {}", args[i]),
                    }
                }
            }
            "--timeout" | "-t" => {
                i += 1;
                if i < args.len() {
                    timeout_ms = args[i].parse().unwrap_or(1000);
                }
            }
            "--list" => {
                for port in BluetoothTransport::list_ports() {
                    println!(
                        "{}{}{}",
                        port.name,
                        if port.bluetooth { "  [bluetooth]" } else { "" },
                        port.product
                            .as_deref()
                            .map(|p| format!("  {}", p))
                            .unwrap_or_default()
                    );
                }
                return;
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            arg if !arg.starts_with('-') => {
                port_name = arg.to_string();
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_help();
                return;
            }
        }
        i += 1;
    }

    let port = if elm327 {
        format!("BLUETOOTH:{};ELM327", port_name)
    } else {
        format!("BLUETOOTH:{}", port_name)
    };

    println!("=== Bluetooth Adapter Probe ===");
    println!("Port: {}", port);
    println!();

    let mut transport = match BluetoothTransport::new(TransportConfig::default()) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return;
        }
    };
    if let Err(e) = transport.connect(&port) {
        eprintln!("Connect failed: {}", e);
        return;
    }

    if !elm327 {
        match transport.update_adapter_info(false) {
            Ok(()) => println!(
                "Adapter type {:#06x}, version {:#06x}",
                transport.adapter_type().unwrap_or_default(),
                transport.adapter_version().unwrap_or_default()
            ),
            Err(e) => println!("Adapter did not identify: {}", e),
        }
    }

    let request = Telegram::new(target, 0xF1, service).to_bytes();
    println!("Request:  {}", hex::encode_upper(&request));
    if let Err(e) = transport.send_data(&request, false, 0.0) {
        eprintln!("Send failed: {}", e);
        return;
    }

    let timeout = Duration::from_millis(timeout_ms);
    let tel_end = Duration::from_millis(100);
    match read_telegram(&mut transport, timeout, tel_end) {
        Ok(response) => {
            println!("Response: {}", hex::encode_upper(&response));
            match Telegram::from_bytes(&response) {
                Ok(tel) => println!(
                    "  from {:02X} to {:02X}, {} payload bytes",
                    tel.source,
                    tel.target,
                    tel.payload.len()
                ),
                Err(e) => println!("  invalid telegram: {}", e),
            }
        }
        Err(e) => eprintln!("Receive failed: {}", e),
    }

    for (name, value) in transport.interface_info() {
        println!("{:>16}: {:?}", name, value);
    }

    if let Err(e) = transport.disconnect() {
        eprintln!("Disconnect: {}", e);
    }
}

/// Read the header first to learn the telegram length, then the rest
fn read_telegram(
    transport: &mut BluetoothTransport,
    timeout: Duration,
    tel_end: Duration,
) -> Result<Vec<u8>, TransportError> {
    let log = TracingLog;
    let mut response = vec![0u8; 4];
    transport.receive_data(&mut response, timeout, tel_end, Some(&log))?;
    if response[0] & 0x3F == 0 && response[3] == 0 {
        let mut len = [0u8; 2];
        transport.receive_data(&mut len, tel_end, tel_end, Some(&log))?;
        response.extend_from_slice(&len);
    }

    let total = match (response[0] & 0x3F, response[3]) {
        (0, 0) => 6 + u16::from_be_bytes([response[4], response[5]]) as usize + 1,
        (0, len) => 4 + len as usize + 1,
        (len, _) => 3 + len as usize + 1,
    };

    let mut rest = vec![0u8; total.saturating_sub(response.len())];
    if !rest.is_empty() {
        transport.receive_data(&mut rest, tel_end, tel_end, Some(&log))?;
        response.extend_from_slice(&rest);
    }
    Ok(response)
}

fn print_help() {
    println!("Bluetooth Adapter Probe");
    println!();
    println!("Usage: adapter_probe [OPTIONS] [PORT]");
    println!();
    println!("Options:");
    println!("  --port PORT       RFCOMM tty, COM port or host:port (default: /dev/rfcomm0)");
    println!("  --elm             Talk to an ELM327 instead of a dedicated adapter");
    println!("  --target ADDR     ECU address in hex (default: 12)");
    println!("  --service HEX     Request payload in hex (default: 22F190)");
    println!("  --timeout MS      Response timeout in ms (default: 1000)");
    println!("  --list            List serial ports and exit");
    println!("  --help            Show this help");
}
