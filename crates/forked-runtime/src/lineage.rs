//! In-memory lineage reconstruction.
//!
//! The tracer never says "this run forked from that one" — the link is
//! implicit in arrival timing and session keys. [`LineageTracker`] holds the
//! maps that make the topology explicit: run → (parent, session), session →
//! latest explicit fork head, plus the memoized explicit-ancestor walk used
//! for branch assignment.
//!
//! All state lives behind one lock bundle; no lock is held across I/O.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use forked_core::MAIN_BRANCH;
use forked_store::TraceStore;

/// Default promotion threshold: a run with at most this many recorded events
/// may be adopted into a session's explicit fork head.
pub const DEFAULT_PROMOTION_THRESHOLD: i64 = 2;

/// Lineage entry for one run.
#[derive(Clone, Debug, Default)]
pub struct RunLineage {
    pub is_fork: bool,
    pub forked_from_run_id: Option<String>,
    pub session_key: Option<String>,
}

/// Outcome of observing one event for lineage purposes.
#[derive(Clone, Debug, Default)]
pub struct Resolution {
    pub is_fork: bool,
    pub forked_from_run_id: Option<String>,
    /// The run was just promoted; existing store rows need the stamp too.
    pub promoted: bool,
    /// First event ever observed for this run.
    pub first_seen: bool,
}

#[derive(Default)]
struct LineageState {
    runs: HashMap<String, RunLineage>,
    /// session key → run id of the most recent explicit fork placeholder.
    session_fork_heads: HashMap<String, String>,
    /// Runs known to carry a `fork_info` event.
    explicit_forks: HashSet<String>,
    /// Fork children already linked to a placeholder.
    linked_fork_runs: HashSet<String>,
    /// Memoized `NearestExplicitAncestor` results.
    ancestor_cache: HashMap<String, Option<String>>,
    /// Latest non-null session key seen on a `fork_info` event.
    last_fork_session_key: Option<String>,
    /// Latest non-null session key seen anywhere.
    last_session_key: Option<String>,
}

/// Shared lineage map, safe for concurrent ingest and API reads.
pub struct LineageTracker {
    state: RwLock<LineageState>,
    /// Promotion heuristic threshold (see module docs). Tunable because the
    /// heuristic can mis-classify very short legitimate runs.
    promotion_threshold: i64,
}

impl LineageTracker {
    /// Create a tracker with the given promotion threshold.
    pub fn new(promotion_threshold: i64) -> Self {
        Self {
            state: RwLock::new(LineageState::default()),
            promotion_threshold,
        }
    }

    /// Rebuild in-memory state from the store (startup).
    pub fn hydrate_from(&self, store: &TraceStore) -> forked_store::Result<()> {
        let sessions = store.list_sessions()?;
        let mut state = self.state.write();
        for row in &sessions {
            let _ = state.runs.insert(
                row.run_id.clone(),
                RunLineage {
                    is_fork: row.is_fork,
                    forked_from_run_id: row.forked_from_run_id.clone(),
                    session_key: row.session_key.clone(),
                },
            );
            if row.is_fork {
                let _ = state.linked_fork_runs.insert(row.run_id.clone());
            }
        }
        drop(state);

        // Explicit forks need a per-run store probe; done outside the lock.
        for row in &sessions {
            if store.run_has_fork_info(&row.run_id)? {
                let mut state = self.state.write();
                let _ = state.explicit_forks.insert(row.run_id.clone());
            }
        }
        Ok(())
    }

    /// Observe an incoming event for run `run_id`.
    ///
    /// `recorded_events` is the number of events already persisted for the
    /// run (consulted only for the promotion heuristic). Returns the lineage
    /// stamp to persist with the event.
    pub fn observe(
        &self,
        run_id: &str,
        session_key: Option<&str>,
        is_fork_info: bool,
        recorded_events: i64,
    ) -> Resolution {
        let mut state = self.state.write();

        if let Some(key) = session_key {
            state.last_session_key = Some(key.to_string());
            if is_fork_info {
                state.last_fork_session_key = Some(key.to_string());
            }
        }
        if is_fork_info {
            let _ = state.explicit_forks.insert(run_id.to_string());
            // A new explicit fork invalidates memoized ancestor walks.
            state.ancestor_cache.clear();
        }

        let first_seen = !state.runs.contains_key(run_id);
        let entry = state.runs.entry(run_id.to_string()).or_default();
        if let Some(key) = session_key {
            if entry.session_key.as_deref() != Some(key) {
                entry.session_key = Some(key.to_string());
            }
        }
        let mut resolution = Resolution {
            is_fork: entry.is_fork,
            forked_from_run_id: entry.forked_from_run_id.clone(),
            promoted: false,
            first_seen,
        };

        // Promotion: a genuinely-new gateway run produced by a fork shows up
        // right after the placeholder with few prior events. Long-lived runs
        // must never be rewritten.
        if !resolution.is_fork && recorded_events <= self.promotion_threshold {
            let effective_key = session_key
                .map(String::from)
                .or_else(|| state.runs.get(run_id).and_then(|r| r.session_key.clone()));
            if let Some(key) = effective_key {
                if let Some(head) = state.session_fork_heads.get(&key).cloned() {
                    if head != run_id {
                        debug!(run_id, head, "promoting run into explicit fork head");
                        let entry = state.runs.entry(run_id.to_string()).or_default();
                        entry.is_fork = true;
                        entry.forked_from_run_id = Some(head.clone());
                        let _ = state.linked_fork_runs.insert(run_id.to_string());
                        state.ancestor_cache.clear();
                        resolution.is_fork = true;
                        resolution.forked_from_run_id = Some(head);
                        resolution.promoted = true;
                    }
                }
            }
        }

        resolution
    }

    /// Record an explicit fork placeholder and make it the session's head.
    pub fn note_explicit_fork(
        &self,
        placeholder_run_id: &str,
        origin_run_id: &str,
        session_key: Option<&str>,
    ) {
        let mut state = self.state.write();
        let _ = state.explicit_forks.insert(placeholder_run_id.to_string());
        let _ = state.runs.insert(
            placeholder_run_id.to_string(),
            RunLineage {
                is_fork: true,
                forked_from_run_id: Some(origin_run_id.to_string()),
                session_key: session_key.map(String::from),
            },
        );
        if let Some(key) = session_key {
            let _ = state
                .session_fork_heads
                .insert(key.to_string(), placeholder_run_id.to_string());
            state.last_fork_session_key = Some(key.to_string());
        }
        state.ancestor_cache.clear();
    }

    /// Link a fork child to its placeholder.
    pub fn link_fork_child(&self, run_id: &str, placeholder_run_id: &str, session_key: Option<&str>) {
        let mut state = self.state.write();
        let entry = state.runs.entry(run_id.to_string()).or_default();
        entry.is_fork = true;
        entry.forked_from_run_id = Some(placeholder_run_id.to_string());
        let _ = state.linked_fork_runs.insert(run_id.to_string());
        if let Some(key) = session_key {
            let _ = state
                .session_fork_heads
                .insert(key.to_string(), placeholder_run_id.to_string());
        }
        state.ancestor_cache.clear();
    }

    /// Whether the run has already been linked as a fork child.
    pub fn is_linked(&self, run_id: &str) -> bool {
        self.state.read().linked_fork_runs.contains(run_id)
    }

    /// Current explicit fork head for a session, if any.
    pub fn session_fork_head(&self, session_key: &str) -> Option<String> {
        self.state.read().session_fork_heads.get(session_key).cloned()
    }

    /// Lineage entry for a run.
    pub fn run(&self, run_id: &str) -> Option<RunLineage> {
        self.state.read().runs.get(run_id).cloned()
    }

    /// Session key for background-event synthesis: the latest key seen on a
    /// `fork_info` event, else the latest key seen anywhere.
    pub fn bg_session_key(&self) -> Option<String> {
        let state = self.state.read();
        state
            .last_fork_session_key
            .clone()
            .or_else(|| state.last_session_key.clone())
    }

    /// Walk parent pointers until a run with a `fork_info` event is found.
    ///
    /// Memoized; guarded against cycles with a visited set (a malformed
    /// lineage insert must not hang the daemon).
    pub fn nearest_explicit_ancestor(&self, run_id: &str) -> Option<String> {
        if let Some(cached) = self.state.read().ancestor_cache.get(run_id) {
            return cached.clone();
        }

        let result = {
            let state = self.state.read();
            let mut visited: HashSet<&str> = HashSet::new();
            let mut current = run_id;
            loop {
                if !visited.insert(current) {
                    break None;
                }
                if state.explicit_forks.contains(current) {
                    break Some(current.to_string());
                }
                match state
                    .runs
                    .get(current)
                    .and_then(|r| r.forked_from_run_id.as_deref())
                {
                    Some(parent) => current = parent,
                    None => break None,
                }
            }
        };

        let _ = self
            .state
            .write()
            .ancestor_cache
            .insert(run_id.to_string(), result.clone());
        result
    }

    /// Branch key for a run: itself when it is an explicit fork, its nearest
    /// explicit ancestor when it is a fork child, `main` otherwise.
    pub fn branch_key(&self, run_id: &str) -> String {
        {
            let state = self.state.read();
            if state.explicit_forks.contains(run_id) {
                return run_id.to_string();
            }
            let is_fork = state.runs.get(run_id).is_some_and(|r| r.is_fork);
            if !is_fork {
                return MAIN_BRANCH.to_string();
            }
        }
        let parent = {
            let state = self.state.read();
            state
                .runs
                .get(run_id)
                .and_then(|r| r.forked_from_run_id.clone())
        };
        match parent {
            Some(parent) => self
                .nearest_explicit_ancestor(&parent)
                .unwrap_or_else(|| MAIN_BRANCH.to_string()),
            None => MAIN_BRANCH.to_string(),
        }
    }
}

impl Default for LineageTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PROMOTION_THRESHOLD)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
