//! Delivery hint derivation.
//!
//! A forked reply should land on the same user channel that drove the
//! original conversation. The hint is recovered from address strings of the
//! form `<channel>:<kind>:<value>[:topic:<topicId>]` found on inbound
//! (`message_received.from`) and outbound (`message_sent.to`) lifecycle
//! events, preferring the edited payload, then the history slice, then the
//! whole session's recent lifecycle events.

use std::collections::HashSet;

use serde_json::Value;

use forked_core::payload::{extract_str, payload_type};
use forked_store::EventRow;

/// How many trailing lifecycle events of the whole session to scan in the
/// last-resort candidate pass.
const SESSION_SCAN_WINDOW: usize = 200;

/// Where to deliver the forked reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryHint {
    pub channel: String,
    pub to: String,
    pub thread_id: Option<String>,
}

/// Parse an address string into a hint.
///
/// `telegram:group:-100:topic:42` → channel `telegram`, to `-100`,
/// thread `42`. Unknown kinds keep the joined tail as the target.
#[must_use]
pub fn parse_address(address: &str) -> Option<DeliveryHint> {
    let parts: Vec<&str> = address.split(':').collect();
    if parts.len() < 3 || parts[0].is_empty() {
        return None;
    }
    let channel = parts[0].to_lowercase();
    let kind = parts[1];
    let tail = &parts[2..];

    let (to, thread_id) = match kind {
        "group" | "direct" => {
            let to = tail[0].to_string();
            let thread_id = match tail.get(1) {
                Some(&"topic") => tail.get(2).map(|t| (*t).to_string()),
                _ => None,
            };
            (to, thread_id)
        }
        _ => (tail.join(":"), None),
    };

    if to.is_empty() {
        return None;
    }
    Some(DeliveryHint {
        channel,
        to,
        thread_id,
    })
}

/// The expected channel of a session: the third `:`-segment of an
/// `agent:`-prefixed session key.
#[must_use]
pub fn session_channel(session_key: Option<&str>) -> Option<String> {
    let key = session_key?;
    if !key.starts_with("agent:") {
        return None;
    }
    key.split(':').nth(2).map(str::to_lowercase)
}

/// Derive the delivery hint for a fork.
///
/// Candidates, in order:
/// 1. the edited payload's own `from` (`message_received`) or `to`
///    (`message_sent`)
/// 2. the most recent non-synthetic inbound address in the history slice
///    whose channel matches the session channel
/// 3. the same for outbound addresses
/// 4. the inbound-then-outbound search over the session's trailing
///    lifecycle events
///
/// A candidate is adopted only when its channel is configured — or when the
/// configured set is empty (tolerant fallback).
#[must_use]
pub fn derive_hint(
    edited_payload: &Value,
    history: &[EventRow],
    session_events: &[EventRow],
    session_key: Option<&str>,
    configured_channels: &HashSet<String>,
) -> Option<DeliveryHint> {
    let expected = session_channel(session_key);
    let accept = |hint: DeliveryHint| -> Option<DeliveryHint> {
        if configured_channels.is_empty() || configured_channels.contains(&hint.channel) {
            Some(hint)
        } else {
            None
        }
    };

    // 1. The edited payload names its own endpoint.
    if let Some(address) = payload_address(edited_payload) {
        if let Some(hint) = parse_address(address).and_then(accept) {
            return Some(hint);
        }
    }

    // 2–3. History slice: inbound first, then outbound.
    for direction in [Direction::Inbound, Direction::Outbound] {
        if let Some(hint) = scan(history, direction, expected.as_deref())
            .and_then(accept)
        {
            return Some(hint);
        }
    }

    // 4. Whole-session lifecycle tail.
    let tail_start = session_events.len().saturating_sub(SESSION_SCAN_WINDOW);
    let tail = &session_events[tail_start..];
    for direction in [Direction::Inbound, Direction::Outbound] {
        if let Some(hint) = scan(tail, direction, expected.as_deref()).and_then(accept) {
            return Some(hint);
        }
    }

    None
}

#[derive(Clone, Copy)]
enum Direction {
    Inbound,
    Outbound,
}

/// Most recent matching address in `events` for the given direction.
fn scan(events: &[EventRow], direction: Direction, expected: Option<&str>) -> Option<DeliveryHint> {
    for event in events.iter().rev() {
        let data = event.data_value();
        let address = match (direction, payload_type(&data)) {
            (Direction::Inbound, Some("message_received")) => extract_str(&data, "from"),
            (Direction::Outbound, Some("message_sent")) => extract_str(&data, "to"),
            _ => None,
        };
        let Some(address) = address else { continue };

        // Replays written by the fork engine are marked synthetic; routing
        // off them would echo into the void.
        if data.get("synthetic").and_then(Value::as_bool) == Some(true) {
            continue;
        }

        let Some(hint) = parse_address(address) else {
            continue;
        };
        if let Some(expected) = expected {
            if hint.channel != expected {
                continue;
            }
        }
        return Some(hint);
    }
    None
}

fn payload_address(payload: &Value) -> Option<&str> {
    match payload_type(payload) {
        Some("message_received") => extract_str(payload, "from"),
        Some("message_sent") => extract_str(payload, "to"),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
