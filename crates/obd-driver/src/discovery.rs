//! Adapter discovery: scan scoring, widening, endpoint negotiation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::AdapterConfig;
use crate::error::DriverError;
use crate::transport::{Advertisement, EndpointInfo, ObdTransport};

/// Which scan phase produced the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectPhase {
    /// Matched under the strict filters
    Initial,
    /// Matched only after the filters were relaxed
    Widened,
}

/// Scan result handed to the connect path
#[derive(Debug, Clone)]
pub struct DiscoveredAdapter {
    pub advertisement: Advertisement,
    pub phase: ConnectPhase,
}

/// Name fragments that identify common ELM327-family adapters
pub const ADAPTER_KEYWORDS: &[&str] = &["EDIAG", "OBD", "ELM", "VCI", "VLINK"];

const SCORE_ADDRESS: u32 = 100;
const SCORE_NAME: u32 = 10;
const SCORE_SERVICE: u32 = 5;
const SCORE_WIDENED: u32 = 1;

const BLUETOOTH_BASE_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

/// Normalize an endpoint or service id for comparison. Long-form ids on the
/// Bluetooth base collapse to their 16-bit short form.
pub fn normalize_id(id: &str) -> String {
    let lower = id.trim().to_lowercase();
    if lower.len() == 36 && lower.starts_with("0000") && lower.ends_with(BLUETOOTH_BASE_SUFFIX) {
        return lower[4..8].to_string();
    }
    lower
}

/// Normalize an adapter address: uppercase, separators stripped
pub fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect::<String>()
        .to_uppercase()
}

/// Score an advertisement against the configured hints.
///
/// An address match dominates, a name keyword beats a service id, and in the
/// widened phase any named device scores at the bottom of the ladder.
pub fn score_advertisement(
    adv: &Advertisement,
    config: &AdapterConfig,
    phase: ConnectPhase,
) -> u32 {
    if let Some(want) = config.device_address.as_deref() {
        let want = normalize_address(want);
        let got = normalize_address(&adv.address);
        if !want.is_empty() && (got == want || got.ends_with(&want)) {
            return SCORE_ADDRESS;
        }
    }

    if let Some(name) = adv.local_name.as_deref() {
        let upper = name.to_uppercase();
        let configured = config.device_name.as_deref().map(str::to_uppercase);
        let keyword_hit = ADAPTER_KEYWORDS.iter().any(|k| upper.contains(k))
            || configured.map_or(false, |n| !n.is_empty() && upper.contains(&n));
        if keyword_hit {
            return SCORE_NAME;
        }
    }

    if let Some(service) = config.service_id.as_deref() {
        let want = normalize_id(service);
        if adv
            .service_ids
            .iter()
            .any(|s| normalize_id(s) == want)
        {
            return SCORE_SERVICE;
        }
    }

    if phase == ConnectPhase::Widened && adv.local_name.as_deref().map_or(false, |n| !n.is_empty())
    {
        return SCORE_WIDENED;
    }

    0
}

/// When to relax the filters: halfway through the budget, but always leaving
/// at least 1.5 s for the widened pass. Degenerate budgets fall back to 40%.
fn widen_after(timeout: Duration) -> Duration {
    let candidate = (timeout / 2).min(timeout.saturating_sub(Duration::from_millis(1500)));
    if candidate.is_zero() {
        timeout.mul_f64(0.4)
    } else {
        candidate
    }
}

fn widen_extension(timeout: Duration) -> Duration {
    timeout.mul_f64(0.4)
}

async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

/// Scan for an adapter and pick the best-scoring candidate.
///
/// The scan widens at most once: if nothing matched the strict filters by
/// `widen_after`, the filters relax and the deadline extends by 40% of the
/// original budget. An address match connects immediately; lesser matches
/// wait out a short settle window in case a better candidate appears.
pub async fn discover(
    transport: &dyn ObdTransport,
    config: &AdapterConfig,
    mut cancel: Option<watch::Receiver<bool>>,
) -> Result<DiscoveredAdapter, DriverError> {
    let timeout = config.discovery_timeout();
    let mut rx = transport.scan().await?;

    let start = tokio::time::Instant::now();
    let mut deadline = start + timeout;
    let mut widen_at = Some(start + widen_after(timeout));
    let mut phase = ConnectPhase::Initial;
    let mut settle_until: Option<tokio::time::Instant> = None;
    let mut best: Option<(u32, Advertisement)> = None;

    loop {
        let wake = [Some(deadline), widen_at, settle_until]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(deadline);

        tokio::select! {
            _ = cancelled(&mut cancel) => {
                debug!("Adapter scan cancelled");
                return Err(DriverError::Cancelled);
            }
            maybe_adv = rx.recv() => match maybe_adv {
                Some(adv) => {
                    let score = score_advertisement(&adv, config, phase);
                    if score == 0 {
                        debug!(address = %adv.address, name = ?adv.local_name, "Ignoring advertisement");
                        continue;
                    }
                    debug!(address = %adv.address, name = ?adv.local_name, score, ?phase, "Candidate adapter");
                    if score >= SCORE_ADDRESS {
                        return Ok(DiscoveredAdapter { advertisement: adv, phase });
                    }
                    if best.as_ref().map_or(true, |(s, _)| score > *s) {
                        best = Some((score, adv));
                    }
                    if settle_until.is_none() {
                        settle_until = Some(tokio::time::Instant::now() + config.candidate_settle());
                    }
                }
                None => {
                    return match best.take() {
                        Some((_, adv)) => Ok(DiscoveredAdapter { advertisement: adv, phase }),
                        None => Err(DriverError::AdapterNotFound),
                    };
                }
            },
            _ = tokio::time::sleep_until(wake) => {
                let now = tokio::time::Instant::now();

                if settle_until.map_or(false, |s| now >= s) {
                    if let Some((_, adv)) = best.take() {
                        return Ok(DiscoveredAdapter { advertisement: adv, phase });
                    }
                    settle_until = None;
                }

                if widen_at.map_or(false, |w| now >= w) {
                    widen_at = None;
                    if best.is_none() {
                        phase = ConnectPhase::Widened;
                        deadline += widen_extension(timeout);
                        warn!(
                            extension_ms = widen_extension(timeout).as_millis() as u64,
                            "No adapter matched the strict filters, widening scan"
                        );
                    }
                    continue;
                }

                if now >= deadline {
                    return match best.take() {
                        Some((_, adv)) => Ok(DiscoveredAdapter { advertisement: adv, phase }),
                        None => Err(DriverError::DiscoveryTimeout(timeout)),
                    };
                }
            }
        }
    }
}

/// Resolve the write and notify endpoints on a freshly connected link.
///
/// The configured ids are tried first; when they are absent the first
/// endpoint with a suitable capability flag is used (`write` before
/// `write_without_response`, `notify` before `indicate`).
pub fn negotiate_endpoints(
    endpoints: &[EndpointInfo],
    config: &AdapterConfig,
) -> Result<(String, String), DriverError> {
    let write = pick_endpoint(
        endpoints,
        config.write_endpoint.as_deref(),
        |e| e.write,
        |e| e.write_without_response,
    )
    .ok_or_else(|| DriverError::CharacteristicNotFound("write".to_string()))?;

    let notify = pick_endpoint(
        endpoints,
        config.notify_endpoint.as_deref(),
        |e| e.notify,
        |e| e.indicate,
    )
    .ok_or_else(|| DriverError::CharacteristicNotFound("notify".to_string()))?;

    Ok((write, notify))
}

fn pick_endpoint(
    endpoints: &[EndpointInfo],
    wanted: Option<&str>,
    primary: impl Fn(&EndpointInfo) -> bool,
    secondary: impl Fn(&EndpointInfo) -> bool,
) -> Option<String> {
    if let Some(wanted) = wanted {
        let wanted = normalize_id(wanted);
        if let Some(e) = endpoints.iter().find(|e| normalize_id(&e.id) == wanted) {
            return Some(e.id.clone());
        }
    }
    endpoints
        .iter()
        .find(|e| primary(e))
        .or_else(|| endpoints.iter().find(|e| secondary(e)))
        .map(|e| e.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn adv(address: &str, name: Option<&str>, services: &[&str]) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            local_name: name.map(str::to_string),
            service_ids: services.iter().map(|s| s.to_string()).collect(),
            rssi: None,
        }
    }

    #[rstest]
    #[case("0000fff0-0000-1000-8000-00805f9b34fb", "fff0")]
    #[case("FFF0", "fff0")]
    #[case("fff0", "fff0")]
    #[case("12345678-0000-1000-8000-00805f9b34fb", "12345678-0000-1000-8000-00805f9b34fb")]
    fn test_normalize_id(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_id(input), expected);
    }

    #[test]
    fn test_normalize_address_strips_separators() {
        assert_eq!(normalize_address("aa:bb:cc:dd:ee:ff"), "AABBCCDDEEFF");
        assert_eq!(normalize_address("AA-BB-CC"), "AABBCC");
    }

    #[test]
    fn test_address_match_beats_name_match() {
        let config = AdapterConfig {
            device_address: Some("dd:ee:ff".to_string()),
            ..Default::default()
        };
        let by_addr = adv("AA:BB:CC:DD:EE:FF", None, &[]);
        let by_name = adv("11:22:33:44:55:66", Some("EDIAG-99"), &[]);
        assert!(
            score_advertisement(&by_addr, &config, ConnectPhase::Initial)
                > score_advertisement(&by_name, &config, ConnectPhase::Initial)
        );
    }

    #[rstest]
    #[case("EDIAG-1234")]
    #[case("obdlink mx")]
    #[case("Vlink Pro")]
    #[case("ELM327 WiFi")]
    fn test_keyword_names_match(#[case] name: &str) {
        let config = AdapterConfig::default();
        let a = adv("11:22:33:44:55:66", Some(name), &[]);
        assert_eq!(score_advertisement(&a, &config, ConnectPhase::Initial), SCORE_NAME);
    }

    #[test]
    fn test_configured_name_matches() {
        let config = AdapterConfig {
            device_name: Some("mytool".to_string()),
            ..Default::default()
        };
        let a = adv("11:22:33:44:55:66", Some("MYTOOL-7"), &[]);
        assert_eq!(score_advertisement(&a, &config, ConnectPhase::Initial), SCORE_NAME);
    }

    #[test]
    fn test_service_id_matches_long_form() {
        let config = AdapterConfig {
            service_id: Some("fff0".to_string()),
            ..Default::default()
        };
        let a = adv(
            "11:22:33:44:55:66",
            None,
            &["0000fff0-0000-1000-8000-00805f9b34fb"],
        );
        assert_eq!(score_advertisement(&a, &config, ConnectPhase::Initial), SCORE_SERVICE);
    }

    #[test]
    fn test_unknown_device_only_scores_when_widened() {
        let config = AdapterConfig::default();
        let a = adv("11:22:33:44:55:66", Some("SOMEDONGLE"), &[]);
        assert_eq!(score_advertisement(&a, &config, ConnectPhase::Initial), 0);
        assert_eq!(
            score_advertisement(&a, &config, ConnectPhase::Widened),
            SCORE_WIDENED
        );
    }

    #[test]
    fn test_nameless_device_never_scores_without_hints() {
        let config = AdapterConfig::default();
        let a = adv("11:22:33:44:55:66", None, &[]);
        assert_eq!(score_advertisement(&a, &config, ConnectPhase::Widened), 0);
    }

    #[test]
    fn test_widen_after_leaves_room_for_second_phase() {
        assert_eq!(
            widen_after(Duration::from_millis(10_000)),
            Duration::from_millis(5_000)
        );
        // Small budgets: widen earlier than the halfway point
        assert_eq!(
            widen_after(Duration::from_millis(2_000)),
            Duration::from_millis(500)
        );
        // Degenerate budgets fall back to 40%
        assert_eq!(
            widen_after(Duration::from_millis(1_000)),
            Duration::from_millis(400)
        );
    }

    fn endpoint(id: &str, write: bool, wwr: bool, notify: bool, indicate: bool) -> EndpointInfo {
        EndpointInfo {
            id: id.to_string(),
            write,
            write_without_response: wwr,
            notify,
            indicate,
        }
    }

    #[test]
    fn test_negotiate_prefers_configured_ids() {
        let config = AdapterConfig {
            write_endpoint: Some("0000fff2-0000-1000-8000-00805f9b34fb".to_string()),
            notify_endpoint: Some("FFF1".to_string()),
            ..Default::default()
        };
        let endpoints = vec![
            endpoint("aaaa", true, false, false, false),
            endpoint("fff2", true, true, false, false),
            endpoint("fff1", false, false, true, false),
        ];
        let (write, notify) = negotiate_endpoints(&endpoints, &config).unwrap();
        assert_eq!(write, "fff2");
        assert_eq!(notify, "fff1");
    }

    #[test]
    fn test_negotiate_falls_back_to_capability_flags() {
        let config = AdapterConfig {
            write_endpoint: Some("dead".to_string()),
            notify_endpoint: Some("beef".to_string()),
            ..Default::default()
        };
        let endpoints = vec![
            endpoint("1111", false, true, false, false),
            endpoint("2222", false, false, false, true),
        ];
        let (write, notify) = negotiate_endpoints(&endpoints, &config).unwrap();
        assert_eq!(write, "1111");
        assert_eq!(notify, "2222");
    }

    #[test]
    fn test_negotiate_fails_without_notify_capable_endpoint() {
        let config = AdapterConfig::default();
        let endpoints = vec![endpoint("1111", true, false, false, false)];
        let err = negotiate_endpoints(&endpoints, &config).unwrap_err();
        assert!(matches!(err, DriverError::CharacteristicNotFound(_)));
    }
}
