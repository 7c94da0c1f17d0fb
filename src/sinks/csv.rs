//! Delimited-text sink: fixed column order, header written once,
//! append-only. An existing file with a different header is refused
//! at open so two incompatible runs never interleave columns.

use super::{FlatRecord, ResultSink, SinkError};
use crate::domain::job::ResultEnvelope;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

const HEADER: &str = "timestamp,modem,phone,address,test_num,intermediate,operator_name,\
operator_prefix,success,window_closed,message,dial_ms,handshake_ms,connect_speed,\
peer_address,peer_system,peer_mailer,rx_speed_bps,tx_speed_bps,snr_db,\
cdr_disposition,cdr_hangup_cause,cdr_billsec,cdr_duration,cdr_trunk,voip_status";

/// Quotes a field when it contains the delimiter, quotes, or
/// newlines.
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn opt_i64(v: Option<i64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

fn render(rec: &FlatRecord) -> String {
    let fields = [
        rec.timestamp.clone(),
        rec.modem.clone(),
        rec.phone.clone(),
        rec.address.clone(),
        rec.test_num.to_string(),
        rec.intermediate.to_string(),
        rec.operator_name.clone(),
        rec.operator_prefix.clone(),
        rec.success.to_string(),
        rec.window_closed.to_string(),
        rec.message.clone(),
        rec.dial_ms.to_string(),
        rec.handshake_ms.to_string(),
        rec.connect_speed.clone(),
        rec.peer_address.clone(),
        rec.peer_system.clone(),
        rec.peer_mailer.clone(),
        opt_i64(rec.rx_speed_bps),
        opt_i64(rec.tx_speed_bps),
        rec.snr_db.map(|v| v.to_string()).unwrap_or_default(),
        rec.cdr_disposition.clone(),
        opt_i64(rec.cdr_hangup_cause),
        opt_i64(rec.cdr_billsec),
        opt_i64(rec.cdr_duration),
        rec.cdr_trunk.clone(),
        rec.voip_status.clone(),
    ];
    fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Append-only delimited file sink.
pub struct CsvSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl CsvSink {
    /// Opens (or creates) the file, writing the header on first use
    /// and verifying it on reopen.
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        let existing = tokio::fs::read_to_string(path).await.ok();
        let needs_header = match existing.as_deref() {
            None | Some("") => true,
            Some(content) => {
                let found = content.lines().next().unwrap_or("").trim_end();
                if found != HEADER {
                    return Err(SinkError::HeaderMismatch {
                        expected: HEADER.to_string(),
                        found: found.to_string(),
                    });
                }
                false
            }
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        if needs_header {
            file.write_all(HEADER.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        info!(path = %path.display(), "csv sink opened");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl ResultSink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    async fn write_record(&self, record: &ResultEnvelope) -> Result<(), SinkError> {
        let line = render(&FlatRecord::from(record));
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        tracing::debug!(path = %self.path.display(), "csv sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_quotes_only_when_needed() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn header_and_rows_have_matching_arity() {
        let rec = FlatRecord {
            timestamp: "t".to_string(),
            modem: "m".to_string(),
            phone: "p".to_string(),
            address: String::new(),
            test_num: 1,
            intermediate: false,
            operator_name: String::new(),
            operator_prefix: String::new(),
            success: true,
            window_closed: false,
            message: "ok".to_string(),
            dial_ms: 10,
            handshake_ms: 20,
            connect_speed: String::new(),
            peer_address: String::new(),
            peer_system: String::new(),
            peer_mailer: String::new(),
            rx_speed_bps: None,
            tx_speed_bps: None,
            snr_db: None,
            cdr_disposition: String::new(),
            cdr_hangup_cause: None,
            cdr_billsec: None,
            cdr_duration: None,
            cdr_trunk: String::new(),
            voip_status: String::new(),
        };
        let header_cols = HEADER.split(',').count();
        let row_cols = render(&rec).split(',').count();
        assert_eq!(header_cols, row_cols);
    }
}
