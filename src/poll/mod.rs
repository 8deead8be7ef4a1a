pub mod cycle;


use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::activity::{new_event, ActivityLog};
use crate::classify;
use crate::config::TrackerConfig;
use crate::model::scope::TrackerScope;
use crate::model::story::Story;
use crate::notify::Notifier;
use crate::remote::RemoteClient;
use crate::store::StateStore;
use cycle::CycleResult;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PollPhase {
    #[default]
    Idle,
    Polling,
    /// Stays put until the credential is replaced.
    AuthFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Success {
        stories: usize,
        new_changes: usize,
        testing: usize,
        notified: bool,
    },
    /// The tracker cannot be polled until a sprint is selected.
    Incomplete(String),
    AuthFailed(String),
    TransientError(String),
    /// Already in flight, or the tracker went away mid-poll.
    Skipped,
}

impl PollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PollOutcome::Success { .. })
    }
}

/// In-memory view of a tracker between polls.
#[derive(Debug, Clone, Default)]
pub struct TrackerRuntime {
    pub phase: PollPhase,
    pub live_stories: Vec<Story>,
    pub status_text: String,
    pub last_polled_at: Option<DateTime<Utc>>,
    in_flight: bool,
}

/// Marks a tracker as in flight for as long as it lives.
struct InFlight<'a> {
    runtime: &'a Mutex<HashMap<String, TrackerRuntime>>,
    id: String,
}

impl<'a> InFlight<'a> {
    fn begin(runtime: &'a Mutex<HashMap<String, TrackerRuntime>>, id: &str) -> Option<Self> {
        let mut map = lock(runtime);
        let entry = map.entry(id.to_string()).or_default();
        if entry.in_flight {
            return None;
        }
        entry.in_flight = true;
        entry.phase = PollPhase::Polling;
        Some(Self {
            runtime,
            id: id.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(rt) = lock(self.runtime).get_mut(&self.id) {
            rt.in_flight = false;
            if rt.phase == PollPhase::Polling {
                rt.phase = PollPhase::Idle;
            }
        }
    }
}

/// Schedules and runs polls for every tracker sharing one credential.
pub struct Orchestrator {
    client: RemoteClient,
    notifier: Arc<dyn Notifier>,
    activity: Option<ActivityLog>,
    trackers: Mutex<Vec<TrackerConfig>>,
    store: Mutex<StateStore>,
    runtime: Mutex<HashMap<String, TrackerRuntime>>,
    credential: Mutex<Option<String>>,
    halted: AtomicBool,
    pass_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        client: RemoteClient,
        notifier: Arc<dyn Notifier>,
        mut store: StateStore,
        trackers: Vec<TrackerConfig>,
        active_tracker: Option<String>,
        credential: Option<String>,
    ) -> Self {
        let fallback = trackers.first().map(|t| t.id.as_str());
        if let Some(active) = active_tracker.as_deref().or(fallback) {
            store.adopt_legacy(active);
        }
        store.retain_trackers(trackers.iter().map(|t| t.id.as_str()));
        store.set_active(active_tracker);

        Self {
            client,
            notifier,
            activity: None,
            trackers: Mutex::new(trackers),
            store: Mutex::new(store),
            runtime: Mutex::new(HashMap::new()),
            credential: Mutex::new(credential),
            halted: AtomicBool::new(false),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_activity_log(mut self, log: ActivityLog) -> Self {
        self.activity = Some(log);
        self
    }

    pub fn trackers(&self) -> Vec<TrackerConfig> {
        lock(&self.trackers).clone()
    }

    /// Adds a tracker or replaces its configuration. A changed sprint or
    /// project set is picked up by scope fencing on the next poll.
    pub fn upsert_tracker(&self, tracker: TrackerConfig) {
        let mut trackers = lock(&self.trackers);
        match trackers.iter_mut().find(|t| t.id == tracker.id) {
            Some(existing) => *existing = tracker,
            None => trackers.push(tracker),
        }
    }

    /// Deletes a tracker with its persisted state. A poll still in flight
    /// for it finishes without effect.
    pub fn remove_tracker(&self, id: &str) {
        lock(&self.trackers).retain(|t| t.id != id);
        lock(&self.runtime).remove(id);
        lock(&self.store).remove(id);
    }

    pub fn replace_credential(&self, credential: String) {
        *lock(&self.credential) = Some(credential);
        self.halted.store(false, Ordering::SeqCst);
        for rt in lock(&self.runtime).values_mut() {
            if rt.phase == PollPhase::AuthFailed {
                rt.phase = PollPhase::Idle;
                rt.status_text = "Credential updated".to_string();
            }
        }
        info!("credential replaced, polling resumed");
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn runtime(&self, id: &str) -> Option<TrackerRuntime> {
        lock(&self.runtime).get(id).cloned()
    }

    pub fn status_text(&self, id: &str) -> Option<String> {
        self.runtime(id).map(|rt| rt.status_text)
    }

    pub fn live_stories(&self, id: &str) -> Vec<Story> {
        self.runtime(id).map(|rt| rt.live_stories).unwrap_or_default()
    }

    #[cfg(test)]
    pub fn with_store<R>(&self, f: impl FnOnce(&StateStore) -> R) -> R {
        f(&lock(&self.store))
    }

    pub fn is_due(&self, tracker: &TrackerConfig, now: DateTime<Utc>) -> bool {
        if let Some(rt) = lock(&self.runtime).get(&tracker.id) {
            if rt.in_flight || rt.phase == PollPhase::AuthFailed {
                return false;
            }
        }
        let last = lock(&self.store)
            .tracker(&tracker.id)
            .and_then(|s| s.last_checked_at);
        match last {
            Some(last) => now - last >= tracker.poll_interval(),
            None => true,
        }
    }

    /// Polls every tracker whose interval has elapsed. Returns immediately
    /// when another pass is still running or polling is halted.
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Vec<(String, PollOutcome)> {
        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("previous poll pass still running, skipping tick");
            return Vec::new();
        };
        if self.is_halted() {
            return Vec::new();
        }
        let due: Vec<TrackerConfig> = self
            .trackers()
            .into_iter()
            .filter(|t| self.is_due(t, now))
            .collect();
        if due.is_empty() {
            return Vec::new();
        }
        self.run_pass(due, now).await
    }

    /// Polls the named tracker, or all of them, regardless of schedule.
    pub async fn force_refresh(
        &self,
        tracker_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<(String, PollOutcome)> {
        let _pass = self.pass_lock.lock().await;
        if self.is_halted() {
            warn!("polling halted until the credential is replaced");
            return Vec::new();
        }
        let selected: Vec<TrackerConfig> = self
            .trackers()
            .into_iter()
            .filter(|t| tracker_id.map_or(true, |id| t.id == id))
            .collect();
        self.run_pass(selected, now).await
    }

    async fn run_pass(
        &self,
        trackers: Vec<TrackerConfig>,
        now: DateTime<Utc>,
    ) -> Vec<(String, PollOutcome)> {
        let credential = lock(&self.credential).clone();
        let Some(credential) = credential else {
            self.halted.store(true, Ordering::SeqCst);
            let message = "No API key configured".to_string();
            for tracker in &trackers {
                self.set_status(&tracker.id, PollPhase::AuthFailed, &message);
            }
            warn!("{message}");
            return trackers
                .into_iter()
                .map(|t| (t.id, PollOutcome::AuthFailed(message.clone())))
                .collect();
        };

        let outcomes = join_all(
            trackers
                .iter()
                .map(|tracker| self.poll_tracker(tracker, &credential, now)),
        )
        .await;

        if outcomes.iter().any(PollOutcome::is_success) {
            let configured: Vec<String> = self.trackers().into_iter().map(|t| t.id).collect();
            let mut store = lock(&self.store);
            store.retain_trackers(configured.iter().map(String::as_str));
            if let Err(e) = store.persist(now) {
                warn!(error = %e, "failed to persist tracker state");
            }
        }

        trackers.into_iter().map(|t| t.id).zip(outcomes).collect()
    }

    async fn poll_tracker(
        &self,
        tracker: &TrackerConfig,
        credential: &str,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        let Some(_in_flight) = InFlight::begin(&self.runtime, &tracker.id) else {
            debug!(tracker = %tracker.id, "poll already in flight");
            return PollOutcome::Skipped;
        };

        let Some(scope) = tracker.scope() else {
            let message = format!("{}: no sprint selected", tracker.display_name());
            self.set_status(&tracker.id, PollPhase::Idle, &message);
            return PollOutcome::Incomplete(message);
        };

        let lower_bound = {
            let mut store = lock(&self.store);
            let (state, reset) = store.fence(&tracker.id, &scope);
            if reset {
                debug!(tracker = %tracker.id, "starting from sprint start");
            }
            state.query_lower_bound(&scope)
        };
        debug!(tracker = %tracker.id, %lower_bound, "polling");

        match cycle::fetch_cycle(&self.client, credential, &scope, lower_bound, now).await {
            Ok(result) => self.apply(tracker, &scope, result, now),
            Err(err) if err.is_auth() => {
                self.halted.store(true, Ordering::SeqCst);
                let message = format!("Authentication failed: {err}");
                warn!(tracker = %tracker.id, "{message}");
                self.set_status(&tracker.id, PollPhase::AuthFailed, &message);
                self.record_activity(&tracker.id, "auth-failed", &message);
                PollOutcome::AuthFailed(message)
            }
            Err(err) => {
                let message = format!("Poll failed: {err}");
                warn!(tracker = %tracker.id, "{message}");
                self.set_status(&tracker.id, PollPhase::Idle, &message);
                self.record_activity(&tracker.id, "poll-failed", &message);
                PollOutcome::TransientError(message)
            }
        }
    }

    /// Merges a finished cycle into the tracker's state and fires the
    /// notification. Runs without suspension points.
    fn apply(
        &self,
        tracker: &TrackerConfig,
        scope: &TrackerScope,
        result: CycleResult,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        let configured = lock(&self.trackers)
            .iter()
            .find(|t| t.id == tracker.id)
            .and_then(TrackerConfig::scope);
        if configured.as_ref() != Some(scope) {
            debug!(tracker = %tracker.id, "tracker reconfigured during poll, discarding result");
            return PollOutcome::Skipped;
        }

        let classified = classify::classify(&result.stories);

        let mut store = lock(&self.store);
        let Some(state) = store.tracker_mut(&tracker.id) else {
            debug!(tracker = %tracker.id, "tracker removed during poll, discarding result");
            return PollOutcome::Skipped;
        };
        if !state.matches(scope) {
            debug!(tracker = %tracker.id, "scope changed during poll, discarding result");
            return PollOutcome::Skipped;
        }

        let new_changes = state.merge_changes(&result.changes);
        state.cursor = Some(result.next_cursor);
        state.last_checked_at = Some(now);

        let diff = classify::diff(&state.classified_stories, &classified);
        state.classified_stories = classified.clone();

        let mut notified = false;
        if diff.should_notify() {
            match self.notifier.notify(tracker, &diff.added, &diff.removed) {
                Ok(()) => {
                    state.last_notification_at = Some(now);
                    notified = true;
                }
                Err(e) => warn!(tracker = %tracker.id, error = %e, "notification failed"),
            }
        }
        drop(store);

        let status = format!(
            "{} stories, {} new changes, {} ready for testing",
            result.stories.len(),
            new_changes.len(),
            classified.len()
        );
        info!(tracker = %tracker.id, sprint = %result.sprint.name, "{status}");

        let outcome = PollOutcome::Success {
            stories: result.stories.len(),
            new_changes: new_changes.len(),
            testing: classified.len(),
            notified,
        };
        if let Some(rt) = lock(&self.runtime).get_mut(&tracker.id) {
            rt.live_stories = result.stories;
            rt.status_text = status;
            rt.phase = PollPhase::Idle;
            rt.last_polled_at = Some(now);
        }
        outcome
    }

    fn set_status(&self, id: &str, phase: PollPhase, text: &str) {
        let mut runtime = lock(&self.runtime);
        let rt = runtime.entry(id.to_string()).or_default();
        rt.phase = phase;
        rt.status_text = text.to_string();
    }

    fn record_activity(&self, tracker: &str, event: &str, message: &str) {
        if let Some(log) = &self.activity {
            if let Err(e) = log.append(&new_event(tracker, event, Vec::new(), Some(message))) {
                warn!(error = %e, "failed to append activity event");
            }
        }
    }
}
