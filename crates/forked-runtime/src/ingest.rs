//! The ingest pipeline.
//!
//! Every tracer connection feeds parsed frames into one shared queue; a
//! single worker drains it, which gives per-run write ordering for free
//! (frames of one run arrive on one connection in `seq` order). Each frame
//! runs the full pipeline: background-run synthesis, lineage resolution,
//! persist, pending-fork linkage, snapshot extraction.
//!
//! A bad frame never stalls the stream — parse and store failures are
//! logged and the worker moves on.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use forked_core::{now_ms, FileSnapshotView, PayloadKind, TraceFrame};
use forked_store::{payload_to_string, NewEvent, TraceStore};

use crate::fork::ForkRegistry;
use crate::lineage::LineageTracker;

/// Queue depth between connection readers and the pipeline worker.
const QUEUE_CAPACITY: usize = 1024;

/// The shared ingest pipeline.
pub struct IngestPipeline {
    store: Arc<TraceStore>,
    lineage: Arc<LineageTracker>,
    forks: Arc<ForkRegistry>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<TraceStore>,
        lineage: Arc<LineageTracker>,
        forks: Arc<ForkRegistry>,
    ) -> Self {
        Self {
            store,
            lineage,
            forks,
        }
    }

    /// Spawn the pipeline worker. Returns the frame sender handed to every
    /// tracer connection and the worker handle.
    pub fn spawn(
        self: Arc<Self>,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<TraceFrame>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<TraceFrame>(QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Keep draining queued frames during shutdown until the
                    // senders hang up.
                    frame = rx.recv() => match frame {
                        Some(frame) => self.process_frame(frame),
                        None => break,
                    },
                    () = cancel.cancelled(), if !cancel.is_cancelled() => {},
                }
                if cancel.is_cancelled() && rx.is_empty() {
                    break;
                }
            }
            debug!("ingest pipeline drained");
        });
        (tx, handle)
    }

    /// Run one frame through the whole pipeline.
    pub fn process_frame(&self, frame: TraceFrame) {
        let kind = PayloadKind::of(&frame.data);

        // 1. Background events (config/setup-file changes) arrive without a
        //    run id; attach them to the live session or drop them.
        let run_id = match self.resolve_run_id(&frame, kind) {
            Some(run_id) => run_id,
            None => return,
        };
        let session_key = frame.session_key.as_deref();

        // 2. Lineage resolution, including the fork promotion heuristic.
        let recorded_events = match self.store.count_events_for_run(&run_id) {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, run_id, "dropping frame: count query failed");
                return;
            }
        };
        let resolution = self.lineage.observe(
            &run_id,
            session_key,
            kind == PayloadKind::ForkInfo,
            recorded_events,
        );
        if resolution.promoted {
            if let Err(e) = self
                .store
                .stamp_fork_lineage(&run_id, resolution.forked_from_run_id.as_deref().unwrap_or(""))
            {
                warn!(error = %e, run_id, "failed to back-fill promoted lineage");
            }
        }

        // 3. Persist.
        let event = NewEvent {
            run_id: run_id.clone(),
            session_key: session_key.map(String::from),
            seq: frame.seq,
            stream: frame.stream.as_str().to_string(),
            ts: frame.ts,
            data: payload_to_string(&frame.data),
            is_fork: resolution.is_fork,
            forked_from_run_id: resolution.forked_from_run_id.clone(),
            created_at: now_ms(),
        };
        if let Err(e) = self.store.insert_event(&event) {
            warn!(error = %e, run_id, seq = frame.seq, "dropping frame: store write failed");
            return;
        }

        // 4. A brand-new run may be the child a pending fork is waiting for.
        if resolution.first_seen && !self.forks.is_empty() {
            let _ = self.forks.try_link(&run_id, &self.store, &self.lineage);
        }

        // 5. Inline file snapshots.
        if kind.carries_snapshot() {
            self.extract_snapshot(&run_id, frame.seq, kind, &frame.data);
        }
    }

    fn resolve_run_id(&self, frame: &TraceFrame, kind: PayloadKind) -> Option<String> {
        if !frame.run_id_missing() {
            return frame.run_id.clone();
        }

        if !kind.is_whole_file_change() {
            debug!(?kind, seq = frame.seq, "dropping frame without run id");
            return None;
        }

        // Attach background filesystem events to the live session. Without
        // any known session there is nothing to attach to.
        let session_key = frame
            .session_key
            .clone()
            .or_else(|| self.lineage.bg_session_key());
        let Some(session_key) = session_key else {
            debug!(seq = frame.seq, "dropping background frame: no session known");
            return None;
        };
        let prefix: String = session_key.chars().take(8).collect();
        Some(format!("bg_{prefix}_{}_{}", frame.ts, frame.seq))
    }

    fn extract_snapshot(&self, run_id: &str, seq: i64, kind: PayloadKind, data: &serde_json::Value) {
        let Some(view) = FileSnapshotView::extract(data) else {
            return;
        };
        let now = now_ms();

        let result = match kind {
            PayloadKind::ToolCallStart => self
                .store
                .insert_snapshot_start(
                    run_id,
                    seq,
                    view.tool_name.as_deref(),
                    &view.file_path,
                    view.content_before.as_deref(),
                    view.existed_before.unwrap_or(false),
                    now,
                )
                .map(|_| ()),
            PayloadKind::ToolCallEnd => self
                .store
                .update_snapshot_end(
                    run_id,
                    &view.file_path,
                    view.content_after.as_deref(),
                    view.exists_after,
                )
                .map(|matched| {
                    if !matched {
                        debug!(run_id, file = %view.file_path, "tool end without open snapshot");
                    }
                }),
            PayloadKind::ConfigChange | PayloadKind::SetupFileChange => self
                .store
                .insert_snapshot_whole_file(
                    run_id,
                    seq,
                    view.tool_name.as_deref(),
                    &view.file_path,
                    view.content_before.as_deref(),
                    view.content_after.as_deref(),
                    view.existed_before.unwrap_or(false),
                    view.exists_after,
                    now,
                )
                .map(|_| ()),
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!(error = %e, run_id, file = %view.file_path, "snapshot write failed");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use forked_core::Stream;
    use serde_json::{json, Value};

    fn pipeline() -> (Arc<IngestPipeline>, Arc<TraceStore>, Arc<LineageTracker>) {
        let store = Arc::new(TraceStore::in_memory().unwrap());
        let lineage = Arc::new(LineageTracker::default());
        let forks = Arc::new(ForkRegistry::new());
        let pipeline = Arc::new(IngestPipeline::new(
            store.clone(),
            lineage.clone(),
            forks,
        ));
        (pipeline, store, lineage)
    }

    fn frame(run_id: Option<&str>, session: Option<&str>, seq: i64, stream: Stream, data: Value) -> TraceFrame {
        TraceFrame {
            run_id: run_id.map(String::from),
            session_key: session.map(String::from),
            seq,
            stream,
            ts: 1000 + seq,
            data,
        }
    }

    #[test]
    fn frames_persist_in_order() {
        let (pipeline, store, _) = pipeline();
        pipeline.process_frame(frame(
            Some("R1"),
            Some("S"),
            1,
            Stream::Lifecycle,
            json!({"type": "session_start"}),
        ));
        pipeline.process_frame(frame(
            Some("R1"),
            Some("S"),
            2,
            Stream::Assistant,
            json!({"type": "llm_input", "prompt": "hi"}),
        ));

        let rows = store.list_events_by_run("R1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].seq, 1);
        assert_eq!(rows[1].seq, 2);

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].event_count, 2);
        assert_eq!(sessions[0].llm_input_count, 1);
    }

    #[test]
    fn snapshot_pair_extracted() {
        let (pipeline, store, _) = pipeline();
        pipeline.process_frame(frame(
            Some("R1"),
            Some("S"),
            1,
            Stream::Tool,
            json!({
                "type": "tool_call_start",
                "toolName": "write",
                "filePath": "/tmp/a",
                "fileSnapshot": {"filePath": "/tmp/a", "contentBefore": "X", "existedBefore": true}
            }),
        ));
        pipeline.process_frame(frame(
            Some("R1"),
            Some("S"),
            2,
            Stream::Tool,
            json!({
                "type": "tool_call_end",
                "toolName": "write",
                "fileSnapshot": {"filePath": "/tmp/a", "contentAfter": "Y", "existsAfter": true}
            }),
        ));

        let snaps = store.list_snapshots("R1").unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].content_before.as_deref(), Some("X"));
        assert_eq!(snaps[0].content_after.as_deref(), Some("Y"));
    }

    #[test]
    fn background_config_change_synthesizes_run() {
        let (pipeline, store, _) = pipeline();
        // Establish a live session first.
        pipeline.process_frame(frame(
            Some("R1"),
            Some("agent:main:telegram:g1"),
            1,
            Stream::Lifecycle,
            json!({"type": "session_start"}),
        ));
        pipeline.process_frame(frame(
            Some("unknown"),
            None,
            3,
            Stream::Tool,
            json!({
                "type": "config_change",
                "filePath": "/tmp/cfg",
                "fileSnapshot": {"filePath": "/tmp/cfg", "contentBefore": "{}", "contentAfter": "{\"a\":1}", "existedBefore": true, "existsAfter": true}
            }),
        ));

        let sessions = store.list_sessions().unwrap();
        let bg = sessions.iter().find(|s| s.run_id.starts_with("bg_")).unwrap();
        assert!(bg.run_id.starts_with("bg_agent:ma"));

        let snaps = store.list_snapshots(&bg.run_id).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].content_after.as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn background_event_without_known_session_dropped() {
        let (pipeline, store, _) = pipeline();
        pipeline.process_frame(frame(
            Some("unknown"),
            None,
            1,
            Stream::Tool,
            json!({"type": "config_change", "filePath": "/tmp/cfg", "fileSnapshot": {"filePath": "/tmp/cfg"}}),
        ));
        assert_eq!(store.event_count().unwrap(), 0);
    }

    #[test]
    fn runless_ordinary_event_dropped() {
        let (pipeline, store, _) = pipeline();
        pipeline.process_frame(frame(
            None,
            Some("S"),
            1,
            Stream::Assistant,
            json!({"type": "llm_output"}),
        ));
        assert_eq!(store.event_count().unwrap(), 0);
    }

    #[test]
    fn new_run_promoted_into_fork_head() {
        let (pipeline, store, lineage) = pipeline();
        // Main run with history.
        for seq in 1..=4 {
            pipeline.process_frame(frame(
                Some("M"),
                Some("S"),
                seq,
                Stream::Lifecycle,
                json!({}),
            ));
        }
        lineage.note_explicit_fork("P", "M", Some("S"));

        // A fresh run in the same session gets adopted.
        pipeline.process_frame(frame(Some("N"), Some("S"), 1, Stream::Lifecycle, json!({})));
        pipeline.process_frame(frame(Some("N"), Some("S"), 2, Stream::Lifecycle, json!({})));

        let rows = store.list_events_by_run("N").unwrap();
        assert!(rows.iter().all(|r| r.is_fork));
        assert!(rows
            .iter()
            .all(|r| r.forked_from_run_id.as_deref() == Some("P")));

        // The long-lived main run is untouched.
        let main_rows = store.list_events_by_run("M").unwrap();
        assert!(main_rows.iter().all(|r| !r.is_fork));
    }

    #[test]
    fn bad_snapshot_payload_does_not_stall() {
        let (pipeline, store, _) = pipeline();
        // tool_call_start without a file path: event persists, snapshot is
        // skipped.
        pipeline.process_frame(frame(
            Some("R1"),
            Some("S"),
            1,
            Stream::Tool,
            json!({"type": "tool_call_start", "fileSnapshot": {}}),
        ));
        assert_eq!(store.event_count().unwrap(), 1);
        assert!(store.list_snapshots("R1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn worker_drains_queue_then_stops() {
        let (pipeline, store, _) = pipeline();
        let cancel = CancellationToken::new();
        let (tx, handle) = pipeline.spawn(cancel.clone());

        tx.send(frame(Some("R1"), Some("S"), 1, Stream::Lifecycle, json!({})))
            .await
            .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(store.event_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn worker_stops_on_cancel() {
        let (pipeline, _store, _) = pipeline();
        let cancel = CancellationToken::new();
        let (tx, handle) = pipeline.spawn(cancel.clone());

        cancel.cancel();
        handle.await.unwrap();
        drop(tx);
    }
}
