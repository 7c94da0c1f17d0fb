//! Serial modem driver shim over the `serialport` crate.
//!
//! Deliberately thin: open and initialize the port, dial and parse
//! the result code, hang up by DTR or escape, shuttle raw bytes for
//! the handshake, and run post-disconnect commands. The blocking
//! serial I/O runs on the blocking thread pool; each port belongs to
//! one worker so there is never lock contention on the inner handle.

use crate::config::{HangupMethod, ModemInstanceConfig, UsbId};
use crate::modem::{DialOutcome, DialResultCode, ModemError, ModemFactory, ModemPort};
use async_trait::async_trait;
use serialport::{ClearBuffer, SerialPort};
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

/// Result codes a Hayes-compatible modem terminates a dial with.
const DIAL_TERMINATORS: &[(&str, DialResultCode)] = &[
    ("CONNECT", DialResultCode::Connect),
    ("BUSY", DialResultCode::Busy),
    ("NO CARRIER", DialResultCode::NoCarrier),
    ("NO ANSWER", DialResultCode::NoAnswer),
    ("NO DIALTONE", DialResultCode::NoDialtone),
    ("NO DIAL TONE", DialResultCode::NoDialtone),
    ("ERROR", DialResultCode::Error),
];

/// Extracts the final result code (and CONNECT speed suffix) from
/// accumulated modem output. Command echo lines never match because
/// result codes start the line.
fn parse_dial_result(text: &str) -> Option<DialOutcome> {
    for line in text.lines().map(str::trim) {
        for (token, code) in DIAL_TERMINATORS {
            if let Some(rest) = line.strip_prefix(token) {
                if *code == DialResultCode::Connect {
                    let speed = rest.trim();
                    return Some(DialOutcome::connected(if speed.is_empty() {
                        None
                    } else {
                        Some(speed.to_string())
                    }));
                }
                return Some(DialOutcome::of(*code));
            }
        }
    }
    None
}

fn serial_err(e: &serialport::Error) -> ModemError {
    ModemError::Serial(e.to_string())
}

/// Reads whatever is available right now without waiting for more.
fn drain_blocking(port: &mut dyn SerialPort) -> Result<String, ModemError> {
    let available = port.bytes_to_read().map_err(|e| serial_err(&e))?;
    if available == 0 {
        return Ok(String::new());
    }
    let mut buf = vec![0u8; available as usize];
    port.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Writes a command line and collects output until one of
/// `terminators` appears or `timeout` elapses.
fn command_blocking(
    port: &mut dyn SerialPort,
    line: &str,
    terminators: &[&str],
    timeout: Duration,
    paginate: bool,
) -> Result<String, ModemError> {
    port.write_all(line.as_bytes())?;
    port.write_all(b"\r")?;
    port.flush()?;

    let deadline = Instant::now() + timeout;
    let mut collected = String::new();
    let mut chunk = [0u8; 256];
    loop {
        match port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                collected.push_str(&String::from_utf8_lossy(&chunk[..n]));
                if terminators.iter().any(|t| collected.contains(t)) {
                    return Ok(collected);
                }
                // chipsets with paged output wait for a keystroke
                if paginate {
                    let _ = port.write_all(b" ");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(ModemError::Io(e)),
        }
        if Instant::now() >= deadline {
            if collected.is_empty() {
                return Err(ModemError::Timeout(timeout));
            }
            return Ok(collected);
        }
    }
}

fn init_blocking(port: &mut dyn SerialPort, config: &ModemInstanceConfig) -> Result<(), ModemError> {
    let _ = port.clear(ClearBuffer::All);
    command_blocking(port, "ATZ", &["OK", "ERROR"], config.timings.command_timeout(), false)?;
    for cmd in &config.init_commands {
        let response =
            command_blocking(port, cmd, &["OK", "ERROR"], config.timings.command_timeout(), false)?;
        if response.contains("ERROR") {
            warn!(command = %cmd, "init command rejected");
        }
    }
    Ok(())
}

fn open_blocking(config: &ModemInstanceConfig) -> Result<Box<dyn SerialPort>, ModemError> {
    let mut port = serialport::new(&config.device, config.baud_rate)
        .timeout(config.timings.read_timeout())
        .open()
        .map_err(|e| ModemError::Open(format!("{}: {e}", config.device)))?;
    init_blocking(port.as_mut(), config)?;
    Ok(port)
}

/// Locates a USB device's sysfs name by vendor/product id.
fn find_usb_device(usb: &UsbId) -> Option<String> {
    let entries = std::fs::read_dir("/sys/bus/usb/devices").ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let vendor = std::fs::read_to_string(path.join("idVendor")).unwrap_or_default();
        let product = std::fs::read_to_string(path.join("idProduct")).unwrap_or_default();
        if vendor.trim().eq_ignore_ascii_case(&usb.vendor_id)
            && product.trim().eq_ignore_ascii_case(&usb.product_id)
        {
            return entry.file_name().into_string().ok();
        }
    }
    None
}

/// Cable-level reset: unbind and rebind the device on the usb bus
/// driver.
fn usb_reset_blocking(usb: &UsbId) -> Result<(), ModemError> {
    let device = find_usb_device(usb).ok_or_else(|| {
        ModemError::Reset(format!(
            "usb device {}:{} not found",
            usb.vendor_id, usb.product_id
        ))
    })?;
    std::fs::write("/sys/bus/usb/drivers/usb/unbind", &device)
        .map_err(|e| ModemError::Reset(format!("unbind {device}: {e}")))?;
    std::thread::sleep(Duration::from_millis(500));
    std::fs::write("/sys/bus/usb/drivers/usb/bind", &device)
        .map_err(|e| ModemError::Reset(format!("bind {device}: {e}")))?;
    Ok(())
}

/// `ModemPort` over a serial device.
pub struct SerialModemPort {
    io: SharedPort,
    config: ModemInstanceConfig,
}

impl SerialModemPort {
    async fn run_blocking<T, F>(&self, op: F) -> Result<T, ModemError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialPort, &ModemInstanceConfig) -> Result<T, ModemError>
            + Send
            + 'static,
    {
        let io = self.io.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = io.lock().expect("serial lock");
            op(guard.as_mut(), &config)
        })
        .await
        .map_err(|e| ModemError::Serial(format!("blocking task: {e}")))?
    }
}

#[async_trait]
impl ModemPort for SerialModemPort {
    async fn dial(&mut self, dial_string: &str) -> Result<DialOutcome, ModemError> {
        let command = format!("ATD{}{}", self.config.dial_prefix, dial_string);
        debug!(%command, "dialing");
        self.run_blocking(move |port, config| {
            // dialing plus carrier negotiation both fit in the window
            let window = config.timings.dial_timeout()
                + Duration::from_secs(config.timings.carrier_timeout_secs);
            let terminators: Vec<&str> = DIAL_TERMINATORS.iter().map(|(t, _)| *t).collect();
            let output = command_blocking(port, &command, &terminators, window, false)?;
            trace!(%output, "dial output");
            parse_dial_result(&output).ok_or(ModemError::Timeout(window))
        })
        .await
    }

    async fn hangup(&mut self) -> Result<(), ModemError> {
        self.run_blocking(|port, config| match config.hangup_method {
            HangupMethod::Dtr => {
                port.write_data_terminal_ready(false)
                    .map_err(|e| serial_err(&e))?;
                std::thread::sleep(Duration::from_millis(config.timings.dtr_hold_ms));
                port.write_data_terminal_ready(true)
                    .map_err(|e| serial_err(&e))?;
                std::thread::sleep(Duration::from_millis(config.timings.dtr_stabilize_ms));
                // give the carrier until dtr_max_wait to actually drop
                let deadline =
                    Instant::now() + Duration::from_millis(config.timings.dtr_max_wait_ms);
                while Instant::now() < deadline {
                    if !port.read_carrier_detect().map_err(|e| serial_err(&e))? {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(config.timings.dtr_wait_ms));
                }
                Ok(())
            }
            HangupMethod::Escape => {
                std::thread::sleep(Duration::from_millis(config.timings.dtr_wait_ms));
                port.write_all(b"+++")?;
                port.flush()?;
                std::thread::sleep(Duration::from_millis(config.timings.dtr_wait_ms));
                command_blocking(port, "ATH", &["OK", "ERROR"], config.timings.command_timeout(), false)
                    .map(|_| ())
            }
        })
        .await
    }

    async fn reset(&mut self) -> Result<(), ModemError> {
        self.run_blocking(|port, config| init_blocking(port, config)).await
    }

    async fn recover(&mut self) -> Result<(), ModemError> {
        if self.reset().await.is_ok() {
            return Ok(());
        }
        let Some(usb) = self.config.usb.clone() else {
            return Err(ModemError::Reset("soft reset failed, no usb id".to_string()));
        };
        warn!(device = %self.config.device, "soft reset failed, attempting USB reset");

        let io = self.io.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            usb_reset_blocking(&usb)?;
            let fresh = open_blocking(&config)?;
            *io.lock().expect("serial lock") = fresh;
            Ok(())
        })
        .await
        .map_err(|e| ModemError::Serial(format!("blocking task: {e}")))?
    }

    async fn in_data_mode(&mut self) -> Result<bool, ModemError> {
        self.run_blocking(|port, _| port.read_carrier_detect().map_err(|e| serial_err(&e)))
            .await
    }

    async fn command(&mut self, command: &str) -> Result<String, ModemError> {
        let command = command.to_string();
        self.run_blocking(move |port, config| {
            command_blocking(
                port,
                &command,
                &["OK", "ERROR"],
                config.timings.command_timeout(),
                config.pagination,
            )
        })
        .await
    }

    async fn drain_input(&mut self) -> Result<String, ModemError> {
        self.run_blocking(|port, _| drain_blocking(port)).await
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<(), ModemError> {
        let data = data.to_vec();
        self.run_blocking(move |port, _| {
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read_data(&mut self, timeout: Duration) -> Result<Vec<u8>, ModemError> {
        self.run_blocking(move |port, _| {
            let deadline = Instant::now() + timeout;
            let mut collected = Vec::new();
            let mut chunk = [0u8; 512];
            loop {
                match port.read(&mut chunk) {
                    Ok(0) => {}
                    Ok(n) => collected.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => return Err(ModemError::Io(e)),
                }
                if !collected.is_empty() || Instant::now() >= deadline {
                    return Ok(collected);
                }
            }
        })
        .await
    }

    async fn close(&mut self) {
        // hold DTR high on exit so the line is released cleanly
        let _ = self
            .run_blocking(|port, _| {
                port.write_data_terminal_ready(true).map_err(|e| serial_err(&e))
            })
            .await;
    }
}

/// Factory over real serial devices.
pub struct SerialModemFactory;

#[async_trait]
impl ModemFactory for SerialModemFactory {
    async fn open(
        &self,
        config: &ModemInstanceConfig,
    ) -> Result<Box<dyn ModemPort>, ModemError> {
        let config = config.clone();
        let opened = {
            let config = config.clone();
            tokio::task::spawn_blocking(move || open_blocking(&config))
                .await
                .map_err(|e| ModemError::Serial(format!("blocking task: {e}")))??
        };
        Ok(Box::new(SerialModemPort {
            io: Arc::new(Mutex::new(opened)),
            config,
        }))
    }

    async fn usb_reset(&self, config: &ModemInstanceConfig) -> Result<(), ModemError> {
        let Some(usb) = config.usb.clone() else {
            return Err(ModemError::Reset("modem has no usb id configured".to_string()));
        };
        tokio::task::spawn_blocking(move || usb_reset_blocking(&usb))
            .await
            .map_err(|e| ModemError::Serial(format!("blocking task: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_with_speed_suffix() {
        let outcome = parse_dial_result("ATD74950001122\r\nCONNECT 33600/ARQ/V34\r\n").unwrap();
        assert_eq!(outcome.code, DialResultCode::Connect);
        assert_eq!(outcome.connect_speed.as_deref(), Some("33600/ARQ/V34"));
    }

    #[test]
    fn bare_connect_has_no_speed() {
        let outcome = parse_dial_result("CONNECT\r\n").unwrap();
        assert_eq!(outcome.code, DialResultCode::Connect);
        assert!(outcome.connect_speed.is_none());
    }

    #[test]
    fn busy_and_friends() {
        assert_eq!(parse_dial_result("BUSY\r\n").unwrap().code, DialResultCode::Busy);
        assert_eq!(
            parse_dial_result("NO CARRIER\r\n").unwrap().code,
            DialResultCode::NoCarrier
        );
        assert_eq!(
            parse_dial_result("NO DIAL TONE\r\n").unwrap().code,
            DialResultCode::NoDialtone
        );
    }

    #[test]
    fn echo_lines_are_ignored() {
        // the dialed command echo must not be mistaken for a result
        assert!(parse_dial_result("ATD74950001122\r\n").is_none());
    }
}
