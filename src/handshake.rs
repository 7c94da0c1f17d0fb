//! Session-layer handshake boundary.
//!
//! The scheduling core only needs "run the handshake on this
//! connected port, give me the peer identity or a reason". The EMSI
//! implementation here is deliberately thin: enough of the frame
//! exchange to identify the remote mailer and report failures
//! usefully.

use crate::config::EmsiConfig;
use crate::domain::job::PeerInfo;
use crate::modem::{ModemError, ModemPort};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Handshake failures; recorded in the outcome, never unwound.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("modem during handshake: {0}")]
    Modem(#[from] ModemError),

    #[error("handshake cancelled")]
    Cancelled,
}

/// Runs the session-layer handshake over a connected modem link.
#[async_trait]
pub trait Handshaker: Send + Sync {
    async fn handshake(
        &self,
        port: &mut dyn ModemPort,
        token: &CancellationToken,
    ) -> Result<PeerInfo, HandshakeError>;
}

const EMSI_INQ: &[u8] = b"**EMSI_INQC816\r";
const EMSI_ACK: &[u8] = b"**EMSI_ACKA490\r";
const EMSI_DAT_HEADER: &[u8] = b"**EMSI_DAT";
const READ_SLICE: Duration = Duration::from_millis(250);

/// CRC16-CCITT (poly 0x1021, init 0) as used by EMSI frames.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Splits an EMSI_DAT payload into its `{...}` groups.
fn brace_groups(data: &str) -> Vec<String> {
    let mut groups = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for ch in data.chars() {
        match ch {
            '{' => {
                if depth == 0 {
                    current.clear();
                } else {
                    current.push(ch);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    groups.push(current.clone());
                } else {
                    current.push(ch);
                }
            }
            _ if depth > 0 => current.push(ch),
            _ => {}
        }
    }
    groups
}

/// Splits an IDENT group into its `[...]` subfields.
fn bracket_fields(data: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut inside = false;
    for ch in data.chars() {
        match ch {
            '[' => {
                inside = true;
                current.clear();
            }
            ']' => {
                if inside {
                    fields.push(current.clone());
                }
                inside = false;
            }
            _ if inside => current.push(ch),
            _ => {}
        }
    }
    fields
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Extracts peer identity from a decoded EMSI_DAT payload.
///
/// Group layout: `{EMSI}{addresses}{password}{link}{compat}{product}
/// {mailer}{version}{serial}` optionally followed by extension pairs
/// such as `{IDENT}{[system][location][sysop][phone][speed][flags]}`.
fn parse_dat_payload(payload: &str) -> Result<PeerInfo, HandshakeError> {
    let groups = brace_groups(payload);
    if groups.first().map(String::as_str) != Some("EMSI") {
        return Err(HandshakeError::Protocol(
            "EMSI_DAT payload does not start with {EMSI}".to_string(),
        ));
    }
    if groups.len() < 2 {
        return Err(HandshakeError::Protocol("EMSI_DAT too short".to_string()));
    }

    let mut info = PeerInfo {
        address: non_empty(groups[1].split_whitespace().next().unwrap_or("")),
        ..PeerInfo::default()
    };
    if let Some(mailer) = groups.get(6) {
        let version = groups.get(7).map(String::as_str).unwrap_or("");
        info.mailer = non_empty(&format!("{} {}", mailer.trim(), version.trim()));
    }

    let mut iter = groups.iter().skip(9);
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        if key == "IDENT" {
            let fields = bracket_fields(value);
            info.system_name = fields.first().and_then(|f| non_empty(f));
            info.location = fields.get(1).and_then(|f| non_empty(f));
            info.sysop = fields.get(2).and_then(|f| non_empty(f));
        }
    }
    Ok(info)
}

/// Renders our own EMSI_DAT frame from the configured identity.
fn build_dat_frame(config: &EmsiConfig) -> Vec<u8> {
    let protocols = config.protocols.join(",");
    let payload = format!(
        "{{EMSI}}{{{addr}}}{{}}{{8N1,PUA}}{{{protos},ARC,XMA}}{{FE}}{{modem-test}}{{{version}}}{{0}}{{IDENT}}{{[{system}][{location}][{sysop}][-Unpublished-][{speed}][XA]}}",
        addr = config.address,
        protos = protocols,
        version = env!("CARGO_PKG_VERSION"),
        system = config.system_name,
        location = config.location,
        sysop = config.sysop,
        speed = 33_600,
    );
    let body = format!("EMSI_DAT{len:04X}{payload}", len = payload.len());
    let crc = crc16(body.as_bytes());
    format!("**{body}{crc:04X}\r").into_bytes()
}

/// Scans `buffer` for a complete EMSI_DAT frame; returns its decoded
/// payload when present.
fn extract_dat_payload(buffer: &[u8]) -> Option<Result<String, HandshakeError>> {
    let start = buffer
        .windows(EMSI_DAT_HEADER.len())
        .position(|w| w == EMSI_DAT_HEADER)?;
    let after = &buffer[start + EMSI_DAT_HEADER.len()..];
    if after.len() < 4 {
        return None;
    }
    let len_text = std::str::from_utf8(&after[..4]).ok()?;
    let payload_len = usize::from_str_radix(len_text, 16).ok()?;
    if after.len() < 4 + payload_len + 4 {
        return None;
    }
    let payload = &after[4..4 + payload_len];
    let crc_text = std::str::from_utf8(&after[4 + payload_len..4 + payload_len + 4]).ok()?;
    let claimed = u16::from_str_radix(crc_text, 16).ok();

    let mut checked = Vec::with_capacity(8 + 4 + payload_len);
    checked.extend_from_slice(b"EMSI_DAT");
    checked.extend_from_slice(&after[..4 + payload_len]);
    if claimed != Some(crc16(&checked)) {
        return Some(Err(HandshakeError::Protocol(
            "EMSI_DAT CRC mismatch".to_string(),
        )));
    }
    Some(Ok(String::from_utf8_lossy(payload).to_string()))
}

/// Thin EMSI driver: inquire, exchange DAT frames, report the peer.
pub struct EmsiHandshaker {
    config: EmsiConfig,
}

impl EmsiHandshaker {
    pub fn new(config: EmsiConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Handshaker for EmsiHandshaker {
    async fn handshake(
        &self,
        port: &mut dyn ModemPort,
        token: &CancellationToken,
    ) -> Result<PeerInfo, HandshakeError> {
        let timeout = self.config.timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buffer: Vec<u8> = Vec::new();
        let mut dat_sent = false;

        if self.config.initial_strategy != "listen" {
            port.send_data(EMSI_INQ).await?;
            trace!("EMSI_INQ sent");
        }

        loop {
            if token.is_cancelled() {
                return Err(HandshakeError::Cancelled);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HandshakeError::Timeout(timeout));
            }

            let chunk = port.read_data(READ_SLICE).await?;
            if !chunk.is_empty() {
                buffer.extend_from_slice(&chunk);
            }

            if let Some(result) = extract_dat_payload(&buffer) {
                let payload = result?;
                port.send_data(EMSI_ACK).await?;
                port.send_data(EMSI_ACK).await?;
                let peer = parse_dat_payload(&payload)?;
                debug!(address = ?peer.address, system = ?peer.system_name, "EMSI handshake complete");
                return Ok(peer);
            }

            let text = String::from_utf8_lossy(&buffer);
            if !dat_sent && (text.contains("EMSI_REQ") || text.contains("EMSI_INQ")) {
                port.send_data(&build_dat_frame(&self.config)).await?;
                dat_sent = true;
                trace!("EMSI_DAT sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EmsiConfig {
        EmsiConfig {
            address: "2:5020/9999".to_string(),
            system_name: "Test System".to_string(),
            sysop: "Test Sysop".to_string(),
            location: "Moscow".to_string(),
            timeout_secs: 60,
            protocols: vec!["ZAP".to_string()],
            initial_strategy: "inquire".to_string(),
        }
    }

    #[test]
    fn crc16_matches_known_vector() {
        // CCITT with zero init over "123456789"
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn own_dat_frame_round_trips_through_extractor() {
        let frame = build_dat_frame(&test_config());
        let payload = extract_dat_payload(&frame).unwrap().unwrap();
        let info = parse_dat_payload(&payload).unwrap();
        assert_eq!(info.address.as_deref(), Some("2:5020/9999"));
        assert_eq!(info.system_name.as_deref(), Some("Test System"));
        assert_eq!(info.sysop.as_deref(), Some("Test Sysop"));
        assert_eq!(info.location.as_deref(), Some("Moscow"));
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let mut frame = build_dat_frame(&test_config());
        let len = frame.len();
        frame[len - 3] = b'0';
        frame[len - 2] = b'0';
        assert!(matches!(
            extract_dat_payload(&frame),
            Some(Err(HandshakeError::Protocol(_)))
        ));
    }

    #[test]
    fn incomplete_frame_yields_none() {
        let frame = build_dat_frame(&test_config());
        assert!(extract_dat_payload(&frame[..frame.len() / 2]).is_none());
    }

    #[test]
    fn payload_without_emsi_marker_is_protocol_error() {
        assert!(matches!(
            parse_dat_payload("{NOPE}{2:1/1}"),
            Err(HandshakeError::Protocol(_))
        ));
    }

    #[test]
    fn brace_groups_handle_nesting() {
        let groups = brace_groups("{a}{b {c} d}{e}");
        assert_eq!(groups, vec!["a", "b {c} d", "e"]);
    }
}
