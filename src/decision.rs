//! Decision validation pipeline.
//!
//! The oracle is untrusted text generation. Raw output goes through
//! structural repair, strict schema validation against the exact market
//! snapshot the oracle was shown, and server-side economic sizing. No oracle
//! output can authorize an amount the system did not itself compute, and a
//! rejected pipeline run degrades to the no-op path, never a same-tick retry.

use serde::Deserialize;

use crate::market::{MarketSnapshot, Side};
use crate::money::{Credits, CENT};

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    market_id: String,
    side: String,
    confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedItem {
    pub market_id: String,
    pub side: Side,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Pass,
    Stake(Vec<ValidatedItem>),
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

// =============================================================================
// (a) structural repair
// =============================================================================

/// Salvage near-valid JSON: strip markdown fences and surrounding prose down
/// to the outermost object, drop trailing commas. Returns None when there is
/// no object to find.
pub fn repair_raw(raw: &str) -> Option<String> {
    let mut s = raw.trim();
    if let Some(stripped) = s.strip_prefix("```json") {
        s = stripped;
    } else if let Some(stripped) = s.strip_prefix("```") {
        s = stripped;
    }
    if let Some(stripped) = s.strip_suffix("```") {
        s = stripped;
    }

    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end < start {
        return None;
    }
    let body = &s[start..=end];

    // Drop commas that sit directly before a closing bracket.
    let mut out = String::with_capacity(body.len());
    let mut in_string = false;
    let mut escaped = false;
    for ch in body.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '}' | ']' => {
                while out.ends_with(|c: char| c.is_whitespace()) {
                    out.pop();
                }
                if out.ends_with(',') {
                    out.pop();
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    Some(out)
}

// =============================================================================
// (b) strict schema validation
// =============================================================================

/// Validate repaired oracle output against the snapshot the oracle was shown.
/// Hallucinated market ids are dropped at the item level; everything else
/// malformed rejects the whole decision.
pub fn validate(
    raw: &str,
    snapshot: &MarketSnapshot,
    max_items: usize,
) -> Result<Decision, Rejection> {
    let repaired = repair_raw(raw).ok_or_else(|| Rejection::new("no JSON object in output"))?;
    let parsed: RawDecision = serde_json::from_str(&repaired)
        .map_err(|e| Rejection::new(format!("unparseable decision: {}", e)))?;

    match parsed.action.as_str() {
        "pass" => Ok(Decision::Pass),
        "stake" => {
            if parsed.items.is_empty() {
                return Err(Rejection::new("stake action with no items"));
            }
            if parsed.items.len() > max_items {
                return Err(Rejection::new(format!(
                    "{} items exceeds cap of {}",
                    parsed.items.len(),
                    max_items
                )));
            }
            let mut items: Vec<ValidatedItem> = Vec::new();
            for item in &parsed.items {
                let side = Side::parse(&item.side)
                    .ok_or_else(|| Rejection::new(format!("unrecognized side {:?}", item.side)))?;
                if !(item.confidence > 0.0 && item.confidence <= 1.0) {
                    return Err(Rejection::new(format!(
                        "confidence {} out of (0, 1]",
                        item.confidence
                    )));
                }
                // Markets the oracle was never shown are dropped, not fatal.
                if !snapshot.contains_market(&item.market_id) {
                    continue;
                }
                if items.iter().any(|i| i.market_id == item.market_id) {
                    continue;
                }
                items.push(ValidatedItem {
                    market_id: item.market_id.clone(),
                    side,
                    confidence: item.confidence,
                });
            }
            if items.is_empty() {
                return Err(Rejection::new("no valid items remain"));
            }
            Ok(Decision::Stake(items))
        }
        other => Err(Rejection::new(format!("unrecognized action {:?}", other))),
    }
}

// =============================================================================
// (c) server-side economic sizing
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SizingParams {
    pub stake_fraction: f64,
    pub min_stake: Credits,
}

/// Headroom available for new stakes: the configured fraction of balance
/// minus what is already committed, never negative.
pub fn stake_headroom(balance: Credits, open_stake: Credits, max_open_fraction: f64) -> Credits {
    let cap = balance.scale_by(max_open_fraction);
    cap.checked_sub(open_stake).unwrap_or(Credits::ZERO).max(Credits::ZERO)
}

/// Deterministic stake size: confidence x headroom x fixed fraction, rounded
/// down to cent granularity. Below the minimum stake the answer is zero.
pub fn size_stake(confidence: f64, headroom: Credits, params: &SizingParams) -> Credits {
    let sized = headroom
        .scale_by(params.stake_fraction)
        .scale_by(confidence)
        .floor_to(Credits::from_units(CENT));
    if sized < params.min_stake {
        Credits::ZERO
    } else {
        sized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Market, MarketStatus};

    fn snapshot(ids: &[&str]) -> MarketSnapshot {
        MarketSnapshot {
            markets: ids
                .iter()
                .map(|id| Market {
                    id: id.to_string(),
                    question: format!("q-{}", id),
                    deadline: 9999,
                    pool: Credits::from_whole(100),
                    status: MarketStatus::Open,
                    outcome: None,
                })
                .collect(),
            commitments: Vec::new(),
        }
    }

    #[test]
    fn repair_strips_fences_and_prose() {
        let raw = "Sure! Here is my decision:\n```json\n{\"action\": \"pass\"}\n```\nGood luck!";
        let repaired = repair_raw(raw).unwrap();
        let v: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["action"], "pass");
    }

    #[test]
    fn repair_drops_trailing_commas() {
        let raw = r#"{"action": "stake", "items": [{"market_id": "m1", "side": "yes", "confidence": 0.8,},],}"#;
        let repaired = repair_raw(raw).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&repaired).is_ok());
    }

    #[test]
    fn repair_preserves_commas_inside_strings() {
        let raw = r#"{"action": "pass", "note": "a,]"}"#;
        let repaired = repair_raw(raw).unwrap();
        let v: serde_json::Value = serde_json::from_str(&repaired).unwrap();
        assert_eq!(v["note"], "a,]");
    }

    #[test]
    fn garbage_is_rejected_not_repaired() {
        assert!(repair_raw("I refuse to answer.").is_none());
        assert!(validate("total nonsense", &snapshot(&["m1"]), 3).is_err());
    }

    #[test]
    fn pass_action_validates() {
        let d = validate(r#"{"action": "pass"}"#, &snapshot(&["m1"]), 3).unwrap();
        assert_eq!(d, Decision::Pass);
    }

    #[test]
    fn unknown_action_rejected() {
        let err = validate(r#"{"action": "yolo"}"#, &snapshot(&["m1"]), 3).unwrap_err();
        assert!(err.reason.contains("unrecognized action"));
    }

    #[test]
    fn item_cap_enforced() {
        let raw = r#"{"action":"stake","items":[
            {"market_id":"m1","side":"yes","confidence":0.5},
            {"market_id":"m2","side":"yes","confidence":0.5},
            {"market_id":"m3","side":"yes","confidence":0.5},
            {"market_id":"m4","side":"yes","confidence":0.5}]}"#;
        let err = validate(raw, &snapshot(&["m1", "m2", "m3", "m4"]), 3).unwrap_err();
        assert!(err.reason.contains("cap"));
    }

    #[test]
    fn hallucinated_markets_dropped_at_item_level() {
        let raw = r#"{"action":"stake","items":[
            {"market_id":"real","side":"yes","confidence":0.7},
            {"market_id":"imaginary","side":"no","confidence":0.9}]}"#;
        match validate(raw, &snapshot(&["real"]), 3).unwrap() {
            Decision::Stake(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].market_id, "real");
            }
            other => panic!("expected stake, got {:?}", other),
        }
    }

    #[test]
    fn all_hallucinated_degrades_to_rejection() {
        let raw = r#"{"action":"stake","items":[
            {"market_id":"fake1","side":"yes","confidence":0.7}]}"#;
        let err = validate(raw, &snapshot(&["real"]), 3).unwrap_err();
        assert!(err.reason.contains("no valid items"));
    }

    #[test]
    fn out_of_range_confidence_rejects_whole_decision() {
        for bad in ["0.0", "1.5", "-0.2"] {
            let raw = format!(
                r#"{{"action":"stake","items":[{{"market_id":"m1","side":"yes","confidence":{}}}]}}"#,
                bad
            );
            assert!(validate(&raw, &snapshot(&["m1"]), 3).is_err(), "confidence {}", bad);
        }
    }

    #[test]
    fn duplicate_market_ids_collapse_to_first() {
        let raw = r#"{"action":"stake","items":[
            {"market_id":"m1","side":"yes","confidence":0.7},
            {"market_id":"m1","side":"no","confidence":0.3}]}"#;
        match validate(raw, &snapshot(&["m1"]), 3).unwrap() {
            Decision::Stake(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].side, Side::Yes);
            }
            other => panic!("expected stake, got {:?}", other),
        }
    }

    #[test]
    fn sizing_is_deterministic_and_floored() {
        let params = SizingParams {
            stake_fraction: 0.25,
            min_stake: Credits::from_whole(1),
        };
        // 100 headroom x 0.25 fraction x 0.8 confidence = 20.00
        let sized = size_stake(0.8, Credits::from_whole(100), &params);
        assert_eq!(sized, Credits::from_whole(20));
        // Tiny headroom sizes below min stake and collapses to zero.
        assert_eq!(size_stake(0.9, Credits::from_whole(2), &params), Credits::ZERO);
    }

    #[test]
    fn headroom_never_negative() {
        let h = stake_headroom(Credits::from_whole(10), Credits::from_whole(50), 0.5);
        assert_eq!(h, Credits::ZERO);
        let h = stake_headroom(Credits::from_whole(100), Credits::from_whole(10), 0.5);
        assert_eq!(h, Credits::from_whole(40));
    }
}
