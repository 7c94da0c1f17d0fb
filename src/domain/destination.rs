//! Destinations: a dialable phone number plus the directory metadata
//! and availability rule attached to it.

use crate::domain::availability::AvailabilityRule;
use crate::domain_types::PhoneNumber;
use serde::{Deserialize, Serialize};

/// Directory metadata for a destination. Informational only; two
/// destinations with the same phone share mutual exclusion no matter
/// how their metadata differs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Network address, e.g. `2:5020/1042`.
    pub address: Option<String>,
    pub system_name: Option<String>,
    pub sysop: Option<String>,
    pub location: Option<String>,
}

/// One telephone destination to test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub phone: PhoneNumber,
    #[serde(default)]
    pub metadata: NodeMetadata,
    /// Time-of-day call windows; `None` means callable 24h.
    #[serde(default)]
    pub availability: Option<AvailabilityRule>,
}

impl Destination {
    /// Bare destination with no metadata and no call windows.
    pub fn bare(phone: PhoneNumber) -> Self {
        Self {
            phone,
            metadata: NodeMetadata::default(),
            availability: None,
        }
    }

    /// Short display label: the address when known, else the phone.
    pub fn label(&self) -> String {
        match &self.metadata.address {
            Some(addr) => format!("{} ({})", addr, self.phone),
            None => self.phone.to_string(),
        }
    }
}
