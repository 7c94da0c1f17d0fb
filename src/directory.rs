//! Destination directory client.
//!
//! Fetches destination lists for configured phone prefixes from the
//! directory HTTP API, applies the continuous-mail filter, and drops
//! phones matching the "except" prefixes. Exclusion happens here,
//! before any per-prefix operator override is consulted, so an
//! excluded phone never reaches the scheduler.

use crate::config::DirectoryConfig;
use crate::domain::availability::AvailabilityRule;
use crate::domain::destination::{Destination, NodeMetadata};
use crate::domain_types::PhoneNumber;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory API failures; fatal at startup when the directory is
/// the only destination source.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory response: {0}")]
    Decode(String),
}

/// Destination source seam; tests feed in static sets.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// All destinations for one phone prefix.
    async fn destinations_for_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<Destination>, DirectoryError>;
}

/// One node entry as the directory API returns it.
#[derive(Debug, Deserialize)]
struct DirectoryNode {
    phone: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    system_name: Option<String>,
    #[serde(default)]
    sysop: Option<String>,
    #[serde(default)]
    location: Option<String>,
    /// Continuous mail: callable around the clock.
    #[serde(default)]
    cm: bool,
    /// Daily call windows as `HH:MM-HH:MM`, for non-CM nodes.
    #[serde(default)]
    call_windows: Vec<String>,
}

/// HTTP directory client.
pub struct HttpDirectoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectoryClient {
    pub fn new(base_url: String) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn destinations_for_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<Destination>, DirectoryError> {
        let url = format!("{}/nodes", self.base_url.trim_end_matches('/'));
        let nodes: Vec<DirectoryNode> = self
            .client
            .get(&url)
            .query(&[("phone_prefix", prefix)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut destinations = Vec::with_capacity(nodes.len());
        for node in nodes {
            let Ok(phone) = PhoneNumber::try_new(node.phone.clone()) else {
                warn!(phone = %node.phone, "directory returned unusable phone, skipping");
                continue;
            };
            let availability = if node.cm {
                None
            } else {
                let windows: Vec<_> = node
                    .call_windows
                    .iter()
                    .filter_map(|w| match w.parse() {
                        Ok(window) => Some(window),
                        Err(e) => {
                            warn!(%phone, window = %w, error = %e, "bad call window, ignoring");
                            None
                        }
                    })
                    .collect();
                if windows.is_empty() {
                    None
                } else {
                    Some(AvailabilityRule::new(windows))
                }
            };
            destinations.push(Destination {
                phone,
                metadata: NodeMetadata {
                    address: node.address,
                    system_name: node.system_name,
                    sysop: node.sysop,
                    location: node.location,
                },
                availability,
            });
        }
        Ok(destinations)
    }
}

/// Whether a phone falls under any of the except prefixes
/// (`+`-stripped on both sides).
fn is_excluded(phone: &PhoneNumber, except_prefixes: &[String]) -> bool {
    let digits = phone.without_plus();
    except_prefixes
        .iter()
        .any(|prefix| digits.starts_with(prefix.trim_start_matches('+')))
}

/// Resolves the full destination set for a directory configuration:
/// query every prefix, optionally keep CM-only nodes, apply the
/// except list, and de-duplicate by phone.
pub async fn resolve_destinations(
    client: &dyn DirectoryClient,
    config: &DirectoryConfig,
) -> Result<Vec<Destination>, DirectoryError> {
    let mut seen = std::collections::HashSet::new();
    let mut destinations = Vec::new();

    for prefix in &config.prefixes {
        let fetched = client.destinations_for_prefix(prefix).await?;
        info!(prefix, count = fetched.len(), "directory prefix resolved");
        for dest in fetched {
            if config.cm_only && dest.availability.is_some() {
                continue;
            }
            if is_excluded(&dest.phone, &config.except_prefixes) {
                continue;
            }
            if seen.insert(dest.phone.clone()) {
                destinations.push(dest);
            }
        }
    }
    Ok(destinations)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticDirectory(Vec<Destination>);

    #[async_trait]
    impl DirectoryClient for StaticDirectory {
        async fn destinations_for_prefix(
            &self,
            prefix: &str,
        ) -> Result<Vec<Destination>, DirectoryError> {
            Ok(self
                .0
                .iter()
                .filter(|d| d.phone.without_plus().starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    fn dest(phone: &str) -> Destination {
        Destination::bare(PhoneNumber::try_new(phone).unwrap())
    }

    fn windowed(phone: &str) -> Destination {
        let mut d = dest(phone);
        d.availability = Some(AvailabilityRule::new(vec!["02:00-06:00".parse().unwrap()]));
        d
    }

    fn config(prefixes: &[&str], cm_only: bool, except: &[&str]) -> DirectoryConfig {
        DirectoryConfig {
            url: "http://example".to_string(),
            prefixes: prefixes.iter().map(ToString::to_string).collect(),
            cm_only,
            except_prefixes: except.iter().map(ToString::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn cm_only_drops_windowed_destinations() {
        let client = StaticDirectory(vec![dest("74950001111"), windowed("74950002222")]);
        let resolved = resolve_destinations(&client, &config(&["7495"], true, &[]))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].phone.as_ref(), "74950001111");
    }

    #[tokio::test]
    async fn except_prefixes_exclude_before_anything_else() {
        let client = StaticDirectory(vec![dest("74950001111"), dest("74959998888")]);
        let resolved = resolve_destinations(&client, &config(&["7495"], false, &["7495999"]))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].phone.as_ref(), "74950001111");
    }

    #[tokio::test]
    async fn duplicate_phones_across_prefixes_are_merged() {
        let client = StaticDirectory(vec![dest("74950001111")]);
        let resolved = resolve_destinations(&client, &config(&["7495", "74950"], false, &[]))
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn exclusion_strips_plus_on_both_sides() {
        let phone = PhoneNumber::try_new("+74959990000").unwrap();
        assert!(is_excluded(&phone, &["+7495999".to_string()]));
        assert!(is_excluded(&phone, &["7495999".to_string()]));
        assert!(!is_excluded(&phone, &["7499".to_string()]));
    }
}
