use crate::error::{PieceError, Result};
use serde::{Deserialize, Serialize};

/// Fields reported by the tool after a successful proposal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProposedDeal {
    pub deal_uuid: String,
    pub storage_provider: String,
    pub client_wallet: String,
    pub payload_cid: String,
    pub commp: String,
    pub start_epoch: i64,
    pub end_epoch: i64,
    pub provider_collateral: f64,
}

/// Parse a `key: value` proposal response.
///
/// Blank lines, lines without a colon and unknown keys are ignored. The
/// collateral is given as `"<decimal> <unit>"` and the unit is dropped.
pub fn parse_deal_response(text: &str) -> Result<ProposedDeal> {
    let mut deal = ProposedDeal::default();

    for line in text.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "deal uuid" => deal.deal_uuid = value.to_string(),
            "storage provider" => deal.storage_provider = value.to_string(),
            "client wallet" => deal.client_wallet = value.to_string(),
            "payload cid" => deal.payload_cid = value.to_string(),
            "commp" => deal.commp = value.to_string(),
            "start epoch" => deal.start_epoch = parse_epoch("start epoch", value)?,
            "end epoch" => deal.end_epoch = parse_epoch("end epoch", value)?,
            "provider collateral" => {
                let amount = value.split_whitespace().next().unwrap_or_default();
                deal.provider_collateral = amount.parse().map_err(|_| {
                    PieceError::ParseResponse(format!("invalid provider collateral: {}", value))
                })?;
            }
            _ => {}
        }
    }

    if deal.deal_uuid.is_empty() {
        return Err(PieceError::ParseResponse(
            "deal uuid not found in response".to_string(),
        ));
    }

    Ok(deal)
}

fn parse_epoch(field: &str, value: &str) -> Result<i64> {
    value
        .parse()
        .map_err(|_| PieceError::ParseResponse(format!("invalid {}: {}", field, value)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Success,
    Error,
    Sealing,
    InProgress,
}

/// Substrings that classify a status-query response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSignals {
    pub success: Vec<String>,
    pub error: Vec<String>,
    pub sealing: Vec<String>,
}

impl Default for StatusSignals {
    fn default() -> Self {
        Self {
            success: vec!["Proving".to_string()],
            error: vec!["Error".to_string()],
            sealing: Vec::new(),
        }
    }
}

impl StatusSignals {
    /// Success markers win over error markers, which win over sealing markers.
    pub fn classify(&self, text: &str) -> StatusSignal {
        let contains_any = |markers: &[String]| {
            markers
                .iter()
                .any(|marker| !marker.is_empty() && text.contains(marker.as_str()))
        };

        if contains_any(&self.success) {
            StatusSignal::Success
        } else if contains_any(&self.error) {
            StatusSignal::Error
        } else if contains_any(&self.sealing) {
            StatusSignal::Sealing
        } else {
            StatusSignal::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = "
sent deal proposal
  deal uuid: 9f2c5e1a-0000-4000-8000-000000000001
  storage provider: f01000
  client wallet: f1client
  payload cid: bafkreipayload
  url: offline
  commp: baga6ea4seaqpiece
  start epoch: 3000000
  end epoch: 4500000
  provider collateral: 0.123 mFIL
";

    #[test]
    fn test_parse_full_response() {
        let deal = parse_deal_response(RESPONSE).unwrap();
        assert_eq!(deal.deal_uuid, "9f2c5e1a-0000-4000-8000-000000000001");
        assert_eq!(deal.storage_provider, "f01000");
        assert_eq!(deal.client_wallet, "f1client");
        assert_eq!(deal.payload_cid, "bafkreipayload");
        assert_eq!(deal.commp, "baga6ea4seaqpiece");
        assert_eq!(deal.start_epoch, 3_000_000);
        assert_eq!(deal.end_epoch, 4_500_000);
        assert!((deal.provider_collateral - 0.123).abs() < 1e-9);
    }

    #[test]
    fn test_parse_requires_uuid() {
        let result = parse_deal_response("storage provider: f01000\ncommp: x\n");
        assert!(matches!(result, Err(PieceError::ParseResponse(_))));
        assert!(parse_deal_response("").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_numbers() {
        assert!(parse_deal_response("deal uuid: u\nstart epoch: soon\n").is_err());
        assert!(parse_deal_response("deal uuid: u\nprovider collateral: lots FIL\n").is_err());
    }

    #[test]
    fn test_parse_ignores_noise() {
        let deal = parse_deal_response("garbage line\n\nfoo: bar\ndeal uuid:  u-1  \n").unwrap();
        assert_eq!(deal.deal_uuid, "u-1");
        assert_eq!(deal.start_epoch, 0);
    }

    #[test]
    fn test_classify_precedence() {
        let signals = StatusSignals {
            success: vec!["Proving".to_string()],
            error: vec!["Error".to_string()],
            sealing: vec!["Sealing".to_string()],
        };

        assert_eq!(
            signals.classify("deal status: Proving"),
            StatusSignal::Success
        );
        assert_eq!(
            signals.classify("Proving (Error earlier)"),
            StatusSignal::Success
        );
        assert_eq!(
            signals.classify("deal status: Error: rejected"),
            StatusSignal::Error
        );
        assert_eq!(
            signals.classify("deal status: Sealing"),
            StatusSignal::Sealing
        );
        assert_eq!(
            signals.classify("deal status: Transferred"),
            StatusSignal::InProgress
        );
    }

    #[test]
    fn test_default_signals_never_report_sealing() {
        let signals = StatusSignals::default();
        assert_eq!(signals.classify("Sealing"), StatusSignal::InProgress);
        assert_eq!(signals.classify("Proving"), StatusSignal::Success);
    }
}
