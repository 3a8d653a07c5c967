//! Fork orchestration.
//!
//! A fork re-runs the agent from a chosen event with edited inputs. The
//! engine writes a placeholder run carrying the `fork_info` record first —
//! linkage depends on it being durable before the gateway call — then
//! optionally rewinds the filesystem, derives a delivery hint, drives the
//! gateway, and finally links the gateway-created run into the placeholder.
//!
//! Pending forks are tracked FIFO and adopted by the first unrelated run
//! that appears; a reaper expires them after five minutes.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use forked_core::{now_ms, Stream};
use forked_gateway::GatewayClient;
use forked_settings::Settings;
use forked_store::{payload_to_string, NewEvent, StoreError, TraceStore};

use crate::hint::{derive_hint, DeliveryHint};
use crate::lineage::LineageTracker;
use crate::rewind::RewindEngine;

/// Control flag the UI smuggles inside the edited payload to request a
/// filesystem rewind before the fork runs. Stripped before persisting.
const REWIND_FIRST_KEY: &str = "__forkedRewindFirst";

/// Pending forks older than this are reaped.
const PENDING_FORK_TTL: Duration = Duration::from_secs(5 * 60);

/// Reaper tick interval.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Telegram pre-echo messages are cut at this many characters.
const ECHO_LIMIT: usize = 3000;

/// A fork awaiting its gateway-created run.
#[derive(Clone, Debug)]
pub struct PendingFork {
    pub origin_run_id: String,
    pub fork_from_seq: i64,
    pub started_at_ms: i64,
    pub session_key: Option<String>,
    pub modified_payload: Value,
}

/// FIFO registry of pending forks.
#[derive(Default)]
pub struct ForkRegistry {
    inner: Mutex<VecDeque<(String, PendingFork)>>,
}

impl ForkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending fork under its placeholder run id.
    pub fn insert(&self, placeholder_run_id: String, pending: PendingFork) {
        self.inner.lock().push_back((placeholder_run_id, pending));
    }

    /// Drop a pending fork (gateway failure, rewind failure).
    pub fn remove(&self, placeholder_run_id: &str) -> Option<PendingFork> {
        let mut inner = self.inner.lock();
        let pos = inner.iter().position(|(id, _)| id == placeholder_run_id)?;
        inner.remove(pos).map(|(_, pending)| pending)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Remove pending forks started before `cutoff_ms`; returns the count.
    pub fn reap_started_before(&self, cutoff_ms: i64) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|(_, pending)| pending.started_at_ms >= cutoff_ms);
        before - inner.len()
    }

    /// Attempt to adopt `new_run_id` into the FIFO-oldest pending fork.
    ///
    /// Idempotent: an already-linked run is never re-linked, and a run that
    /// *is* the placeholder or origin of the oldest pending fork leaves the
    /// registry untouched.
    pub fn try_link(
        &self,
        new_run_id: &str,
        store: &TraceStore,
        lineage: &LineageTracker,
    ) -> bool {
        if lineage.is_linked(new_run_id) {
            return false;
        }

        let adopted = {
            let mut inner = self.inner.lock();
            let adoptable = inner.front().is_some_and(|(placeholder, pending)| {
                placeholder.as_str() != new_run_id && pending.origin_run_id != new_run_id
            });
            if adoptable {
                inner.pop_front()
            } else {
                None
            }
        };
        let Some((placeholder, pending)) = adopted else {
            return false;
        };

        if let Err(e) = store.stamp_fork_lineage(new_run_id, &placeholder) {
            warn!(error = %e, new_run_id, "failed to stamp fork lineage");
        }
        lineage.link_fork_child(new_run_id, &placeholder, pending.session_key.as_deref());
        info!(new_run_id, placeholder, "linked fork child");
        true
    }
}

/// Spawn the pending-fork reaper task.
pub fn spawn_reaper(registry: Arc<ForkRegistry>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAPER_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ttl_ms = i64::try_from(PENDING_FORK_TTL.as_millis()).unwrap_or(i64::MAX);
                    let reaped = registry.reap_started_before(now_ms() - ttl_ms);
                    if reaped > 0 {
                        info!(reaped, "expired pending forks");
                    }
                }
            }
        }
    })
}

/// What went wrong, for API status mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkFailure {
    /// Pre-fork rewind failed; the placeholder remains.
    Rewind,
    /// The gateway conversation failed; the placeholder remains.
    Gateway,
}

/// Result of a fork request.
#[derive(Clone, Debug)]
pub struct ForkOutcome {
    pub success: bool,
    pub new_run_id: String,
    pub linked: bool,
    pub gateway_result: Option<Value>,
    pub message: Option<String>,
    pub failure: Option<ForkFailure>,
}

/// The fork engine.
pub struct ForkEngine {
    store: Arc<TraceStore>,
    lineage: Arc<LineageTracker>,
    registry: Arc<ForkRegistry>,
    rewind: Arc<RewindEngine>,
    gateway: Arc<GatewayClient>,
    settings: Arc<Settings>,
}

impl ForkEngine {
    pub fn new(
        store: Arc<TraceStore>,
        lineage: Arc<LineageTracker>,
        registry: Arc<ForkRegistry>,
        rewind: Arc<RewindEngine>,
        gateway: Arc<GatewayClient>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            lineage,
            registry,
            rewind,
            gateway,
            settings,
        }
    }

    /// Execute a fork of `origin_run_id` from `fork_from_seq` with an edited
    /// payload.
    pub async fn fork(
        &self,
        origin_run_id: &str,
        fork_from_seq: i64,
        modified_payload: Value,
    ) -> Result<ForkOutcome, StoreError> {
        let started_at = now_ms();

        // 1. History slice strictly before the fork point.
        let history: Vec<_> = self
            .store
            .list_events_by_run(origin_run_id)?
            .into_iter()
            .filter(|e| e.seq < fork_from_seq)
            .collect();

        // 2. Session key of the origin.
        let session_key = self.store.latest_session_key_for_run(origin_run_id)?;

        // 3. Detach the rewind control flag; the remainder is the edit.
        let (edited_payload, rewind_ctrl) = split_rewind_control(modified_payload);

        // 4. Replay message.
        let replay_message = choose_replay_message(&edited_payload, &history);

        // 5. Placeholder run with the fork record, written before anything
        //    can go wrong downstream.
        let new_run_id = placeholder_run_id(origin_run_id, started_at);
        let fork_info = json!({
            "type": "fork_info",
            "originalRunId": origin_run_id,
            "forkFromSeq": fork_from_seq,
            "modifiedData": edited_payload.clone(),
        });
        let placeholder_events = [
            NewEvent {
                run_id: new_run_id.clone(),
                session_key: session_key.clone(),
                seq: 0,
                stream: Stream::ForkInfo.as_str().to_string(),
                ts: started_at,
                data: payload_to_string(&fork_info),
                is_fork: true,
                forked_from_run_id: Some(origin_run_id.to_string()),
                created_at: started_at,
            },
            NewEvent {
                run_id: new_run_id.clone(),
                session_key: session_key.clone(),
                seq: 1,
                stream: Stream::Lifecycle.as_str().to_string(),
                ts: started_at,
                data: payload_to_string(&json!({
                    "type": "message_received",
                    "source": "forked",
                    "content": replay_message.clone(),
                    "timestamp": started_at,
                    "synthetic": true,
                })),
                is_fork: true,
                forked_from_run_id: Some(origin_run_id.to_string()),
                created_at: started_at,
            },
        ];
        let _ = self.store.insert_events_atomic(&placeholder_events)?;

        // 6. Pending registration; the placeholder becomes the session head.
        self.registry.insert(
            new_run_id.clone(),
            PendingFork {
                origin_run_id: origin_run_id.to_string(),
                fork_from_seq,
                started_at_ms: started_at,
                session_key: session_key.clone(),
                modified_payload: edited_payload.clone(),
            },
        );
        self.lineage
            .note_explicit_fork(&new_run_id, origin_run_id, session_key.as_deref());

        // 7. Optional pre-fork rewind.
        if let Some(ctrl) = rewind_ctrl {
            if let Err(e) = self.rewind_before_fork(&new_run_id, &ctrl, &edited_payload, session_key.as_deref()) {
                let _ = self.registry.remove(&new_run_id);
                return Ok(ForkOutcome {
                    success: false,
                    new_run_id,
                    linked: false,
                    gateway_result: None,
                    message: Some(e),
                    failure: Some(ForkFailure::Rewind),
                });
            }
        }

        // 8. Delivery hint.
        let session_events = match session_key.as_deref() {
            Some(key) => self
                .store
                .list_traces(key)?
                .into_iter()
                .filter(|e| e.stream == Stream::Lifecycle.as_str())
                .collect(),
            None => Vec::new(),
        };
        let hint = derive_hint(
            &edited_payload,
            &history,
            &session_events,
            session_key.as_deref(),
            &self.settings.configured_channels,
        );

        // 9. Telegram-only pre-echo, so the user sees their edit in-channel.
        if let Some(hint) = hint.as_ref().filter(|h| h.channel == "telegram") {
            let echo = format!("FORKED (YOU): {}", truncate_chars(&replay_message, ECHO_LIMIT));
            if let Err(e) = self.gateway.send_message(&hint.channel, &hint.to, &echo).await {
                warn!(kind = e.kind(), error = %e, "fork pre-echo failed");
            }
        }

        // 10. Drive the agent.
        let gateway_result = match self
            .gateway
            .run_agent(&replay_message, session_key.as_deref())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "gateway agent call failed");
                let _ = self.registry.remove(&new_run_id);
                return Ok(ForkOutcome {
                    success: false,
                    new_run_id,
                    linked: false,
                    gateway_result: None,
                    message: Some(e.to_string()),
                    failure: Some(ForkFailure::Gateway),
                });
            }
        };

        // 11. Deliver the terminal text back to the user channel.
        let reply_text = extract_reply_text(&gateway_result);
        if let (Some(text), Some(hint)) = (reply_text.as_deref(), hint.as_ref()) {
            if let Err(e) = self.gateway.send_message(&hint.channel, &hint.to, text).await {
                warn!(kind = e.kind(), error = %e, "fork reply delivery failed");
            }
        }

        // 12. Linkage: prefer the runId the gateway reported, then scan the
        //     store for runs born after the fork started.
        let mut linked = self.link_from_result(&gateway_result);
        if !linked {
            linked = self.link_by_scan(&new_run_id, origin_run_id, started_at, session_key.as_deref())?;
        }

        Ok(ForkOutcome {
            success: true,
            new_run_id,
            linked,
            gateway_result: Some(gateway_result),
            message: None,
            failure: None,
        })
    }

    fn rewind_before_fork(
        &self,
        placeholder_run_id: &str,
        ctrl: &RewindControl,
        edited_payload: &Value,
        session_key: Option<&str>,
    ) -> Result<(), String> {
        let outcome = self
            .rewind
            .execute(&ctrl.run_id, ctrl.target_seq)
            .map_err(|e| e.to_string())?;

        // Audit inside the placeholder run so the branch shows its own
        // rewind.
        let now = now_ms();
        let data = json!({
            "type": "rewind_executed",
            "runId": ctrl.run_id,
            "targetSeq": ctrl.target_seq,
            "backupId": outcome.backup_id,
            "filesAffected": outcome.files_affected,
        });
        let audit = NewEvent {
            run_id: placeholder_run_id.to_string(),
            session_key: session_key.map(String::from),
            seq: 2,
            stream: Stream::Rewind.as_str().to_string(),
            ts: now,
            data: payload_to_string(&data),
            is_fork: true,
            forked_from_run_id: None,
            created_at: now,
        };
        if let Err(e) = self.store.insert_event(&audit) {
            warn!(error = %e, "failed to append fork rewind audit");
        }

        // A config-change edit lands on disk after the rewind so the forked
        // run starts from the edited file.
        if edited_payload.get("type").and_then(Value::as_str) == Some("config_change") {
            if let Some(path) = edited_payload.get("filePath").and_then(Value::as_str) {
                let body = edited_payload
                    .get("currentRaw")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .or_else(|| {
                        edited_payload
                            .get("currentContent")
                            .map(|v| serde_json::to_string_pretty(v).unwrap_or_default())
                    });
                if let Some(body) = body {
                    if let Err(e) = write_config_file(path, &body) {
                        warn!(path, error = %e, "failed to write edited config");
                    }
                }
            }
        }

        Ok(())
    }

    fn link_from_result(&self, gateway_result: &Value) -> bool {
        let reported = gateway_result
            .pointer("/payload/runId")
            .or_else(|| gateway_result.pointer("/runId"))
            .and_then(Value::as_str);
        match reported {
            Some(run_id) if !self.lineage.is_linked(run_id) => {
                self.registry.try_link(run_id, &self.store, &self.lineage)
            }
            _ => false,
        }
    }

    fn link_by_scan(
        &self,
        placeholder_run_id: &str,
        origin_run_id: &str,
        started_at: i64,
        session_key: Option<&str>,
    ) -> Result<bool, StoreError> {
        let candidates = self.store.runs_created_after(
            started_at - 1000,
            session_key,
            &[placeholder_run_id, origin_run_id],
        )?;
        let candidates = if candidates.is_empty() && session_key.is_some() {
            self.store.runs_created_after(
                started_at - 1000,
                None,
                &[placeholder_run_id, origin_run_id],
            )?
        } else {
            candidates
        };

        for candidate in candidates {
            if self.registry.try_link(&candidate, &self.store, &self.lineage) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

struct RewindControl {
    run_id: String,
    target_seq: i64,
}

/// Strip `__forkedRewindFirst` out of the payload; it must never persist.
fn split_rewind_control(mut payload: Value) -> (Value, Option<RewindControl>) {
    let ctrl = payload
        .as_object_mut()
        .and_then(|map| map.remove(REWIND_FIRST_KEY))
        .and_then(|flag| {
            let run_id = flag.get("runId")?.as_str()?.to_string();
            let target_seq = flag.get("targetSeq")?.as_i64()?;
            Some(RewindControl { run_id, target_seq })
        });
    (payload, ctrl)
}

/// Pick the message the forked run replays.
///
/// Preference: the edit's own `prompt`/`message`/`content`, then the newest
/// inbound content or LLM prompt in the history, then the serialized edit.
fn choose_replay_message(edited_payload: &Value, history: &[forked_store::EventRow]) -> String {
    for key in ["prompt", "message", "content"] {
        if let Some(text) = edited_payload.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return text.to_string();
            }
        }
    }

    for event in history.iter().rev() {
        let data = event.data_value();
        match data.get("type").and_then(Value::as_str) {
            Some("message_received") => {
                if let Some(content) = data.get("content").and_then(Value::as_str) {
                    return content.to_string();
                }
            }
            Some("llm_input") => {
                if let Some(prompt) = data.get("prompt").and_then(Value::as_str) {
                    return prompt.to_string();
                }
            }
            _ => {}
        }
    }

    payload_to_string(edited_payload)
}

fn placeholder_run_id(origin_run_id: &str, now: i64) -> String {
    let prefix: String = origin_run_id.chars().take(8).collect();
    format!("fork_{prefix}_{now}")
}

/// Concatenated `result.payloads[*].text` of the terminal response.
fn extract_reply_text(gateway_result: &Value) -> Option<String> {
    let payloads = gateway_result
        .pointer("/payload/result/payloads")
        .or_else(|| gateway_result.pointer("/result/payloads"))?
        .as_array()?;
    let text: Vec<&str> = payloads
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return None;
    }
    Some(text.join("\n"))
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}

fn write_config_file(path: &str, body: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, body)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use forked_store::EventRow;

    fn history_event(seq: i64, data: Value) -> EventRow {
        EventRow {
            id: seq,
            run_id: "R1".into(),
            session_key: Some("S".into()),
            seq,
            stream: "lifecycle".into(),
            ts: 1000 + seq,
            data: data.to_string(),
            is_fork: false,
            forked_from_run_id: None,
            created_at: 1000 + seq,
        }
    }

    #[test]
    fn split_rewind_control_detaches_flag() {
        let payload = json!({
            "prompt": "hi",
            "__forkedRewindFirst": {"runId": "R1", "targetSeq": 7}
        });
        let (edited, ctrl) = split_rewind_control(payload);
        let ctrl = ctrl.unwrap();
        assert_eq!(ctrl.run_id, "R1");
        assert_eq!(ctrl.target_seq, 7);
        assert!(edited.get(REWIND_FIRST_KEY).is_none());
        assert_eq!(edited["prompt"], "hi");
    }

    #[test]
    fn split_rewind_control_absent() {
        let (edited, ctrl) = split_rewind_control(json!({"prompt": "hi"}));
        assert!(ctrl.is_none());
        assert_eq!(edited["prompt"], "hi");
    }

    #[test]
    fn replay_message_prefers_edit_fields() {
        let history = vec![history_event(
            1,
            json!({"type": "message_received", "content": "older"}),
        )];
        assert_eq!(
            choose_replay_message(&json!({"prompt": "edited"}), &history),
            "edited"
        );
        assert_eq!(
            choose_replay_message(&json!({"message": "msg"}), &history),
            "msg"
        );
        assert_eq!(
            choose_replay_message(&json!({"content": "body"}), &history),
            "body"
        );
    }

    #[test]
    fn replay_message_walks_history_in_reverse() {
        let history = vec![
            history_event(1, json!({"type": "llm_input", "prompt": "first"})),
            history_event(2, json!({"type": "message_received", "content": "latest"})),
        ];
        assert_eq!(choose_replay_message(&json!({}), &history), "latest");
    }

    #[test]
    fn replay_message_falls_back_to_serialized_edit() {
        let edited = json!({"weird": true});
        assert_eq!(
            choose_replay_message(&edited, &[]),
            payload_to_string(&edited)
        );
    }

    #[test]
    fn placeholder_id_shape() {
        let id = placeholder_run_id("0123456789abcdef", 1700000000000);
        assert_eq!(id, "fork_01234567_1700000000000");
        // Short origins keep what they have.
        assert_eq!(placeholder_run_id("ab", 5), "fork_ab_5");
    }

    #[test]
    fn extract_reply_text_concatenates() {
        let result = json!({
            "payload": {"result": {"payloads": [{"text": "a"}, {"noText": 1}, {"text": "b"}]}}
        });
        assert_eq!(extract_reply_text(&result).as_deref(), Some("a\nb"));
        assert!(extract_reply_text(&json!({})).is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 3), "hél");
        assert_eq!(truncate_chars("hi", 3000), "hi");
    }

    // ── Registry ─────────────────────────────────────────────────────

    fn pending(origin: &str) -> PendingFork {
        PendingFork {
            origin_run_id: origin.into(),
            fork_from_seq: 5,
            started_at_ms: now_ms(),
            session_key: Some("S".into()),
            modified_payload: json!({}),
        }
    }

    #[test]
    fn registry_insert_remove() {
        let registry = ForkRegistry::new();
        registry.insert("P1".into(), pending("M"));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("P1").is_some());
        assert!(registry.remove("P1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_reaps_old_entries() {
        let registry = ForkRegistry::new();
        let mut old = pending("M");
        old.started_at_ms = 1000;
        registry.insert("P-old".into(), old);
        registry.insert("P-new".into(), pending("M"));

        let reaped = registry.reap_started_before(now_ms() - 60_000);
        assert_eq!(reaped, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn try_link_adopts_unrelated_run() {
        let store = TraceStore::in_memory().unwrap();
        let lineage = LineageTracker::default();
        let registry = ForkRegistry::new();

        store
            .insert_event(&NewEvent {
                run_id: "N1".into(),
                session_key: Some("S".into()),
                seq: 1,
                stream: "lifecycle".into(),
                ts: 1000,
                data: "{}".into(),
                is_fork: false,
                forked_from_run_id: None,
                created_at: 1000,
            })
            .unwrap();
        registry.insert("P1".into(), pending("M"));

        assert!(registry.try_link("N1", &store, &lineage));
        assert!(registry.is_empty());
        assert!(lineage.is_linked("N1"));

        let rows = store.list_events_by_run("N1").unwrap();
        assert!(rows[0].is_fork);
        assert_eq!(rows[0].forked_from_run_id.as_deref(), Some("P1"));
        assert_eq!(lineage.session_fork_head("S").as_deref(), Some("P1"));
    }

    #[test]
    fn try_link_skips_placeholder_and_origin() {
        let store = TraceStore::in_memory().unwrap();
        let lineage = LineageTracker::default();
        let registry = ForkRegistry::new();
        registry.insert("P1".into(), pending("M"));

        assert!(!registry.try_link("P1", &store, &lineage));
        assert!(!registry.try_link("M", &store, &lineage));
        assert_eq!(registry.len(), 1, "pending fork must survive");
    }

    #[test]
    fn try_link_is_idempotent() {
        let store = TraceStore::in_memory().unwrap();
        let lineage = LineageTracker::default();
        let registry = ForkRegistry::new();
        registry.insert("P1".into(), pending("M"));
        registry.insert("P2".into(), pending("M"));

        assert!(registry.try_link("N1", &store, &lineage));
        // Second call with the same run must not consume P2.
        assert!(!registry.try_link("N1", &store, &lineage));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn reaper_task_shuts_down() {
        let registry = Arc::new(ForkRegistry::new());
        let cancel = CancellationToken::new();
        let handle = spawn_reaper(registry, cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
