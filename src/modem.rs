//! The modem collaborator boundary.
//!
//! The scheduling core never speaks AT commands; it drives a modem
//! through [`ModemPort`] and obtains ports through [`ModemFactory`].
//! The serial implementation lives in [`crate::serial`]; tests use
//! scripted mocks.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a modem device.
#[derive(Debug, Error)]
pub enum ModemError {
    #[error("device I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial: {0}")]
    Serial(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("device open failed: {0}")]
    Open(String),

    #[error("device reset failed: {0}")]
    Reset(String),
}

impl ModemError {
    /// Whether this error indicates the device itself is unhealthy
    /// (cable-level or driver-level), as opposed to a call result.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Serial(_) | Self::Reset(_))
    }
}

/// Final modem result code for a dial attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DialResultCode {
    /// Carrier negotiated; the line is up.
    Connect,
    /// Network-signalled busy.
    Busy,
    NoCarrier,
    NoAnswer,
    NoDialtone,
    /// Modem reported ERROR.
    Error,
}

impl DialResultCode {
    pub fn is_connect(self) -> bool {
        self == Self::Connect
    }

    pub fn is_busy(self) -> bool {
        self == Self::Busy
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Busy => "BUSY",
            Self::NoCarrier => "NO CARRIER",
            Self::NoAnswer => "NO ANSWER",
            Self::NoDialtone => "NO DIALTONE",
            Self::Error => "ERROR",
        }
    }
}

/// What a dial attempt produced at the modem level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOutcome {
    pub code: DialResultCode,
    /// The CONNECT suffix, e.g. `"33600/ARQ/V34"`, when connected.
    pub connect_speed: Option<String>,
}

impl DialOutcome {
    pub fn connected(speed: Option<String>) -> Self {
        Self {
            code: DialResultCode::Connect,
            connect_speed: speed,
        }
    }

    pub fn of(code: DialResultCode) -> Self {
        Self {
            code,
            connect_speed: None,
        }
    }
}

/// One physical modem. Implementations are not thread-safe; a port is
/// owned by exactly one worker and driven strictly serially.
#[async_trait]
pub trait ModemPort: Send + Sync {
    /// Dials the full dial string and waits for a result code within
    /// the device's configured dial timeout.
    async fn dial(&mut self, dial_string: &str) -> Result<DialOutcome, ModemError>;

    /// Drops the call using the configured hangup method.
    async fn hangup(&mut self) -> Result<(), ModemError>;

    /// Soft reset (ATZ and re-init).
    async fn reset(&mut self) -> Result<(), ModemError>;

    /// Heavier recovery: soft reset, then a USB-level reset when the
    /// device is USB-attached.
    async fn recover(&mut self) -> Result<(), ModemError>;

    /// Whether the modem still has carrier (is in data mode).
    async fn in_data_mode(&mut self) -> Result<bool, ModemError>;

    /// Executes a raw command in command mode and returns the
    /// response text. Used for post-disconnect statistics.
    async fn command(&mut self, command: &str) -> Result<String, ModemError>;

    /// Reads and discards any pending output, returning it for the
    /// log.
    async fn drain_input(&mut self) -> Result<String, ModemError>;

    /// Writes raw bytes on the data stream (connected state).
    async fn send_data(&mut self, data: &[u8]) -> Result<(), ModemError>;

    /// Reads whatever data arrives within `timeout`; empty result
    /// means the line stayed quiet.
    async fn read_data(&mut self, timeout: Duration) -> Result<Vec<u8>, ModemError>;

    /// Releases the device.
    async fn close(&mut self);
}

/// Opens modem ports and performs device-level resets. One factory
/// serves the whole pool.
#[async_trait]
pub trait ModemFactory: Send + Sync {
    async fn open(
        &self,
        config: &crate::config::ModemInstanceConfig,
    ) -> Result<Box<dyn ModemPort>, ModemError>;

    /// USB-level reset by the configured vendor/product id. Returns
    /// an error when the device is not USB-attached or cannot be
    /// found.
    async fn usb_reset(
        &self,
        config: &crate::config::ModemInstanceConfig,
    ) -> Result<(), ModemError>;
}
