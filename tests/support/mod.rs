//! Shared mocks for integration tests: scripted modems, canned
//! handshakes, and static CDR sources.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modem_test::cdr::{CdrError, CdrLookup, VoipCdrLookup};
use modem_test::config::{Config, EmsiConfig, ModemInstanceConfig, TestConfig};
use modem_test::dialer::{AttemptObserver, DialEngine, DialSettings};
use modem_test::domain::cdr::{CdrRecord, Disposition, VoipCdrRecord};
use modem_test::domain::job::{PeerInfo, RetryAttempt, TestOutcome};
use modem_test::domain::operator::Operator;
use modem_test::domain_types::PhoneNumber;
use modem_test::handshake::{HandshakeError, Handshaker};
use modem_test::modem::{DialOutcome, DialResultCode, ModemError, ModemFactory, ModemPort};
use modem_test::time_provider::skipping_time_provider;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Scripted modem: dial attempts consume the scripted results in
/// order; the last script entry repeats once the script runs dry.
#[derive(Default)]
pub struct MockModem {
    pub dial_script: Mutex<VecDeque<Result<DialOutcome, String>>>,
    pub dialed: Arc<Mutex<Vec<String>>>,
    pub hangups: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
    pub data_mode: Arc<AtomicBool>,
    pub command_response: String,
}

impl MockModem {
    pub fn with_script(script: Vec<Result<DialOutcome, String>>) -> Self {
        Self {
            dial_script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn always_connect() -> Self {
        Self::with_script(vec![Ok(DialOutcome::connected(Some("33600/V34".into())))])
    }
}

pub fn connect() -> Result<DialOutcome, String> {
    Ok(DialOutcome::connected(Some("33600/V34".into())))
}

pub fn busy() -> Result<DialOutcome, String> {
    Ok(DialOutcome::of(DialResultCode::Busy))
}

pub fn no_carrier() -> Result<DialOutcome, String> {
    Ok(DialOutcome::of(DialResultCode::NoCarrier))
}

#[async_trait]
impl ModemPort for MockModem {
    async fn dial(&mut self, dial_string: &str) -> Result<DialOutcome, ModemError> {
        self.dialed.lock().unwrap().push(dial_string.to_string());
        let mut script = self.dial_script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match next {
            Some(Ok(outcome)) => {
                if outcome.code.is_connect() {
                    self.data_mode.store(true, Ordering::SeqCst);
                }
                Ok(outcome)
            }
            Some(Err(message)) => Err(ModemError::Serial(message)),
            None => Ok(DialOutcome::of(DialResultCode::NoCarrier)),
        }
    }

    async fn hangup(&mut self) -> Result<(), ModemError> {
        self.hangups.fetch_add(1, Ordering::SeqCst);
        self.data_mode.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), ModemError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.data_mode.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&mut self) -> Result<(), ModemError> {
        self.reset().await
    }

    async fn in_data_mode(&mut self) -> Result<bool, ModemError> {
        Ok(self.data_mode.load(Ordering::SeqCst))
    }

    async fn command(&mut self, _command: &str) -> Result<String, ModemError> {
        Ok(self.command_response.clone())
    }

    async fn drain_input(&mut self) -> Result<String, ModemError> {
        Ok(String::new())
    }

    async fn send_data(&mut self, _data: &[u8]) -> Result<(), ModemError> {
        Ok(())
    }

    async fn read_data(&mut self, _timeout: Duration) -> Result<Vec<u8>, ModemError> {
        Ok(Vec::new())
    }

    async fn close(&mut self) {}
}

/// Handshaker that answers from a script; defaults to success with a
/// fixed peer.
pub struct MockHandshaker {
    script: Mutex<VecDeque<Result<PeerInfo, String>>>,
}

impl MockHandshaker {
    pub fn ok() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_script(script: Vec<Result<PeerInfo, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    pub fn peer() -> PeerInfo {
        PeerInfo {
            address: Some("2:5020/1042".to_string()),
            system_name: Some("Remote System".to_string()),
            sysop: Some("Remote Sysop".to_string()),
            location: Some("Moscow".to_string()),
            mailer: Some("binkd 1.1".to_string()),
        }
    }
}

#[async_trait]
impl Handshaker for MockHandshaker {
    async fn handshake(
        &self,
        _port: &mut dyn ModemPort,
        _token: &CancellationToken,
    ) -> Result<PeerInfo, HandshakeError> {
        match self.script.lock().unwrap().pop_front() {
            None => Ok(Self::peer()),
            Some(Ok(peer)) => Ok(peer),
            Some(Err(reason)) => Err(HandshakeError::Protocol(reason)),
        }
    }
}

/// CDR source returning a fixed record for every lookup.
pub struct StaticCdr(pub Option<CdrRecord>);

#[async_trait]
impl CdrLookup for StaticCdr {
    async fn lookup(
        &self,
        _token: &CancellationToken,
        _phone: &PhoneNumber,
        _call_time: DateTime<Utc>,
    ) -> Result<Option<CdrRecord>, CdrError> {
        Ok(self.0.clone())
    }
}

pub struct StaticVoipCdr(pub Option<VoipCdrRecord>);

#[async_trait]
impl VoipCdrLookup for StaticVoipCdr {
    async fn lookup(
        &self,
        _token: &CancellationToken,
        _phone: &PhoneNumber,
        _call_time: DateTime<Utc>,
    ) -> Result<Option<VoipCdrRecord>, CdrError> {
        Ok(self.0.clone())
    }
}

pub fn cdr_record(disposition: Disposition, billsec: i64, cause: Option<i32>) -> CdrRecord {
    CdrRecord {
        call_start: Utc::now(),
        dst_number: "74950001122".to_string(),
        disposition,
        hangup_cause: cause,
        billsec,
        duration: billsec,
        trunk: Some("trunk-1".to_string()),
        hangup_side: None,
        early_media: false,
    }
}

/// Observer that records everything it sees.
#[derive(Default)]
pub struct CollectingObserver {
    pub retries: Mutex<Vec<RetryAttempt>>,
    pub operator_results: Mutex<Vec<(TestOutcome, Operator)>>,
}

#[async_trait]
impl AttemptObserver for CollectingObserver {
    async fn on_retry_attempt(&self, attempt: RetryAttempt) {
        self.retries.lock().unwrap().push(attempt);
    }

    async fn on_operator_result(&self, outcome: TestOutcome, operator: Operator) {
        self.operator_results.lock().unwrap().push((outcome, operator));
    }
}

pub fn fast_settings() -> DialSettings {
    DialSettings {
        retry_count: 2,
        retry_delay: Duration::from_millis(5),
        cdr_lookup_delay: Duration::from_millis(1),
        post_disconnect_commands: Vec::new(),
        post_disconnect_delay: Duration::from_millis(1),
    }
}

/// Engine wired to the skipping time provider so delays collapse.
pub fn engine(
    handshaker: MockHandshaker,
    cdr: Option<CdrRecord>,
    settings: DialSettings,
) -> DialEngine {
    let cdr: Option<Arc<dyn CdrLookup>> =
        cdr.map(|record| Arc::new(StaticCdr(Some(record))) as Arc<dyn CdrLookup>);
    DialEngine::new(
        Arc::new(handshaker),
        cdr,
        None,
        None,
        settings,
        skipping_time_provider(),
    )
}

pub fn phone(s: &str) -> PhoneNumber {
    PhoneNumber::try_new(s).unwrap()
}

pub fn operator(name: &str, prefix: &str) -> Operator {
    Operator {
        name: name.to_string(),
        prefix: prefix.to_string(),
    }
}

/// Factory producing mock modems; used by pool tests. Each opened
/// modem gets a copy of the configured dial script (default: always
/// connect).
pub struct MockModemFactory {
    pub fail_devices: Vec<String>,
    pub script: Option<Vec<Result<DialOutcome, String>>>,
}

impl MockModemFactory {
    pub fn new() -> Self {
        Self {
            fail_devices: Vec::new(),
            script: None,
        }
    }

    pub fn with_script(script: Vec<Result<DialOutcome, String>>) -> Self {
        Self {
            fail_devices: Vec::new(),
            script: Some(script),
        }
    }
}

#[async_trait]
impl ModemFactory for MockModemFactory {
    async fn open(
        &self,
        config: &ModemInstanceConfig,
    ) -> Result<Box<dyn ModemPort>, ModemError> {
        if self.fail_devices.contains(&config.device) {
            return Err(ModemError::Open(format!("{} unavailable", config.device)));
        }
        let modem = match &self.script {
            Some(script) => MockModem::with_script(script.clone()),
            None => MockModem::always_connect(),
        };
        Ok(Box::new(modem))
    }

    async fn usb_reset(&self, _config: &ModemInstanceConfig) -> Result<(), ModemError> {
        Err(ModemError::Reset("not usb attached".to_string()))
    }
}

pub fn emsi_config() -> EmsiConfig {
    EmsiConfig {
        address: "2:5020/9999".to_string(),
        system_name: "Test Node".to_string(),
        sysop: "Test Sysop".to_string(),
        location: "Moscow".to_string(),
        timeout_secs: 5,
        protocols: vec!["ZAP".to_string()],
        initial_strategy: "inquire".to_string(),
    }
}

/// Minimal config with `n` enabled mock modems and fast timings.
pub fn config_with_modems(n: usize) -> Config {
    let modems = (0..n)
        .map(|i| ModemInstanceConfig {
            name: format!("mock{i}"),
            device: format!("/dev/mock{i}"),
            baud_rate: 115_200,
            dial_prefix: String::new(),
            hangup_method: modem_test::config::HangupMethod::Dtr,
            timings: modem_test::config::ModemTimings::default(),
            init_commands: Vec::new(),
            post_disconnect_commands: Vec::new(),
            stats_profile: None,
            pagination: false,
            enabled: true,
            usb: None,
        })
        .collect();
    Config {
        modems,
        emsi: emsi_config(),
        test: TestConfig {
            destinations: vec!["74950001122".to_string()],
            retry_count: 1,
            retry_delay_secs: 0,
            cdr_lookup_delay_secs: 0,
            inter_test_delay_secs: 0,
            ..TestConfig::default()
        },
        sinks: modem_test::config::SinksConfig::default(),
        cdr: None,
        voip_cdr: None,
        directory: None,
        pid_file: "~/.modem-test/modem-test.pid".to_string(),
    }
}
