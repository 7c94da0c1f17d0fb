//! Post-disconnect line statistics parsing.
//!
//! After hangup the worker issues the configured post-disconnect
//! commands (`ATI6`, `AT&V1`, ...) and feeds the raw text through the
//! profile matching its chipset. Profiles are regex-driven; the
//! first command whose output parses wins.

use crate::domain::job::LineStats;
use regex::Regex;

/// Parses one chipset family's statistics dump.
pub trait StatsParser: Send + Sync {
    fn profile(&self) -> &str;

    /// `None` when the text does not look like this chipset's report.
    fn parse(&self, text: &str) -> Option<LineStats>;
}

struct RegexStatsParser {
    profile: &'static str,
    rx_speed: Regex,
    tx_speed: Regex,
    snr: Regex,
    rx_level: Regex,
    retrains: Regex,
}

impl RegexStatsParser {
    fn capture_f32(re: &Regex, text: &str) -> Option<f32> {
        re.captures(text)?.get(1)?.as_str().parse().ok()
    }

    fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
        re.captures(text)?.get(1)?.as_str().parse().ok()
    }
}

impl StatsParser for RegexStatsParser {
    fn profile(&self) -> &str {
        self.profile
    }

    fn parse(&self, text: &str) -> Option<LineStats> {
        let rx_speed = Self::capture_u32(&self.rx_speed, text);
        let tx_speed = Self::capture_u32(&self.tx_speed, text);
        // a dump with neither speed is not this chipset's report
        if rx_speed.is_none() && tx_speed.is_none() {
            return None;
        }
        Some(LineStats {
            rx_speed_bps: rx_speed,
            tx_speed_bps: tx_speed,
            snr_db: Self::capture_f32(&self.snr, text),
            rx_level_dbm: Self::capture_f32(&self.rx_level, text).map(|v| -v.abs()),
            retrains: Self::capture_u32(&self.retrains, text),
            profile: self.profile.to_string(),
        })
    }
}

/// Builds the parser for a configured profile name; `None` for
/// unknown profiles (stats collection disabled with a warning at the
/// call site).
pub fn parser_for_profile(name: &str) -> Option<Box<dyn StatsParser>> {
    match name {
        "usr" => Some(Box::new(RegexStatsParser {
            profile: "usr",
            rx_speed: Regex::new(r"(?m)Rate\s+(\d+)/\d+").unwrap(),
            tx_speed: Regex::new(r"(?m)Rate\s+\d+/(\d+)").unwrap(),
            snr: Regex::new(r"(?mi)Signal/Noise\s+Ratio\s+(\d+(?:\.\d+)?)").unwrap(),
            rx_level: Regex::new(r"(?mi)Receive\s+Level\s+-?(\d+(?:\.\d+)?)").unwrap(),
            retrains: Regex::new(r"(?mi)Retrains\s+(?:Requested|Granted)?\s*(\d+)").unwrap(),
        })),
        "conexant" => Some(Box::new(RegexStatsParser {
            profile: "conexant",
            rx_speed: Regex::new(r"(?mi)RX\s+Speed\s*[:=]?\s*(\d+)").unwrap(),
            tx_speed: Regex::new(r"(?mi)TX\s+Speed\s*[:=]?\s*(\d+)").unwrap(),
            snr: Regex::new(r"(?mi)SNR\s*[:=]?\s*(\d+(?:\.\d+)?)").unwrap(),
            rx_level: Regex::new(r"(?mi)RX\s+Level\s*[:=]?\s*-?(\d+(?:\.\d+)?)").unwrap(),
            retrains: Regex::new(r"(?mi)Retrain(?:s|\s+count)?\s*[:=]?\s*(\d+)").unwrap(),
        })),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USR_DUMP: &str = "\
USRobotics Courier V.Everything Link Diagnostics...

Chars sent            312      Chars Received        5120
Rate  33600/31200     Modulation            V.34
Signal/Noise  Ratio   36.2     Receive Level         -18
Retrains Requested    1        Retrains Granted      1
";

    const CONEXANT_DUMP: &str = "\
TX Speed : 26400
RX Speed : 28800
SNR : 34.5
RX Level : -21.0
Retrain count : 0
";

    #[test]
    fn usr_profile_extracts_figures() {
        let parser = parser_for_profile("usr").unwrap();
        let stats = parser.parse(USR_DUMP).unwrap();
        assert_eq!(stats.rx_speed_bps, Some(33_600));
        assert_eq!(stats.tx_speed_bps, Some(31_200));
        assert_eq!(stats.snr_db, Some(36.2));
        assert_eq!(stats.rx_level_dbm, Some(-18.0));
        assert_eq!(stats.retrains, Some(1));
        assert_eq!(stats.profile, "usr");
    }

    #[test]
    fn conexant_profile_extracts_figures() {
        let parser = parser_for_profile("conexant").unwrap();
        let stats = parser.parse(CONEXANT_DUMP).unwrap();
        assert_eq!(stats.rx_speed_bps, Some(28_800));
        assert_eq!(stats.tx_speed_bps, Some(26_400));
        assert_eq!(stats.rx_level_dbm, Some(-21.0));
    }

    #[test]
    fn foreign_dump_is_rejected() {
        let parser = parser_for_profile("usr").unwrap();
        assert!(parser.parse("OK\r\nNO CARRIER\r\n").is_none());
    }

    #[test]
    fn unknown_profile_is_none() {
        assert!(parser_for_profile("nonesuch").is_none());
    }
}
