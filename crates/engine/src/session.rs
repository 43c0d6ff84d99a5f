use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use partway_protocol::{PartOutcome, UploadProgress, UploadSession, UploadState};
use partway_resume::StoredSession;
use partway_staging::StagedSource;

use crate::authorizer::PartAuthorizer;
use crate::config::SpeedConfig;
use crate::speed::SpeedEstimator;

// ---------------------------------------------------------------------------
// Lifecycle phases
// ---------------------------------------------------------------------------

/// Where a session is in its lifecycle, as the coordinator sees it.
///
/// The wire state is a projection of this: waiting for a slot, reconciling
/// with the backend, and finalizing all surface as `uploading`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Phase {
    /// Source registered, length check still in flight.
    Preparing,
    /// Ready to transfer but every session slot is taken.
    Waiting,
    Uploading,
    /// Asking the backend which parts it already has before dispatching.
    Reconciling,
    /// Every part confirmed, completion call in flight.
    Finalizing { attempts: u32 },
    Paused,
    Error { message: String },
}

impl Phase {
    pub(crate) fn wire_state(&self) -> UploadState {
        match self {
            Phase::Preparing => UploadState::Preparing,
            Phase::Waiting
            | Phase::Uploading
            | Phase::Reconciling
            | Phase::Finalizing { .. } => UploadState::Uploading,
            Phase::Paused => UploadState::Paused,
            Phase::Error { .. } => UploadState::Error,
        }
    }

    /// Phases that count against the concurrent-session cap.
    pub(crate) fn occupies_slot(&self) -> bool {
        matches!(
            self,
            Phase::Uploading | Phase::Reconciling | Phase::Finalizing { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Part bookkeeping
// ---------------------------------------------------------------------------

/// Tracks every part of a session through queued, in-flight and completed.
///
/// Dispatch order is always the lowest queued part number, so a failed part
/// goes to the front of the line when it is requeued and completed parts
/// are never revisited.
#[derive(Debug)]
pub(crate) struct PartTracker {
    total_parts: u32,
    queued: BTreeSet<u32>,
    in_flight: BTreeSet<u32>,
    completed: BTreeMap<u32, PartOutcome>,
    retries: HashMap<u32, u32>,
}

impl PartTracker {
    pub(crate) fn new(total_parts: u32) -> Self {
        Self {
            total_parts,
            queued: (1..=total_parts).collect(),
            in_flight: BTreeSet::new(),
            completed: BTreeMap::new(),
            retries: HashMap::new(),
        }
    }

    /// Rebuild a tracker from outcomes confirmed before a restart.
    pub(crate) fn restore(total_parts: u32, confirmed: Vec<PartOutcome>) -> Self {
        let mut tracker = Self::new(total_parts);
        for outcome in confirmed {
            tracker.absorb_one(outcome);
        }
        tracker
    }

    pub(crate) fn next_to_dispatch(&self) -> Option<u32> {
        self.queued.first().copied()
    }

    pub(crate) fn mark_dispatched(&mut self, part: u32) {
        self.queued.remove(&part);
        self.in_flight.insert(part);
    }

    /// Record a locally observed completion. Returns false when the part
    /// was already confirmed through another path.
    pub(crate) fn complete(&mut self, outcome: PartOutcome) -> bool {
        let part = outcome.part_number;
        self.in_flight.remove(&part);
        self.queued.remove(&part);
        self.retries.remove(&part);
        if self.completed.contains_key(&part) {
            return false;
        }
        self.completed.insert(part, outcome);
        true
    }

    /// Put a failed part back in line unless the backend confirmed it in
    /// the meantime.
    pub(crate) fn requeue(&mut self, part: u32) {
        self.in_flight.remove(&part);
        if !self.completed.contains_key(&part) {
            self.queued.insert(part);
        }
    }

    /// Bump the failure count for `part` and return the new total.
    pub(crate) fn record_failure(&mut self, part: u32) -> u32 {
        let count = self.retries.entry(part).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn clear_retries(&mut self) {
        self.retries.clear();
    }

    /// Merge outcomes the backend reports as confirmed. Returns the bytes
    /// newly accounted for.
    pub(crate) fn absorb(&mut self, confirmed: Vec<PartOutcome>) -> u64 {
        confirmed
            .into_iter()
            .map(|outcome| self.absorb_one(outcome))
            .sum()
    }

    fn absorb_one(&mut self, outcome: PartOutcome) -> u64 {
        let part = outcome.part_number;
        if part < 1 || part > self.total_parts || self.completed.contains_key(&part) {
            return 0;
        }
        self.queued.remove(&part);
        let size = outcome.size;
        self.completed.insert(part, outcome);
        size
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.completed.len() as u32 == self.total_parts
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn bytes_completed(&self) -> u64 {
        self.completed.values().map(|outcome| outcome.size).sum()
    }

    /// Confirmed outcomes in part-number order, ready for the completion
    /// request.
    pub(crate) fn outcomes(&self) -> Vec<PartOutcome> {
        self.completed.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Per-session runtime state
// ---------------------------------------------------------------------------

/// Everything the coordinator holds for one live session.
pub(crate) struct SessionRuntime {
    pub(crate) session: UploadSession,
    pub(crate) source: StagedSource,
    pub(crate) phase: Phase,
    pub(crate) tracker: PartTracker,
    pub(crate) authorizer: Arc<PartAuthorizer>,
    pub(crate) speed: SpeedEstimator,
    pub(crate) bytes_uploaded: u64,
    pub(crate) last_part: Option<PartOutcome>,
    pub(crate) started_at: DateTime<Utc>,
    /// Set on rehydrated sessions until the backend has been asked which
    /// parts it already holds.
    pub(crate) needs_reconcile: bool,
    /// Distinguishes this incarnation from an earlier one with the same id
    /// whose transfers may still be landing.
    pub(crate) generation: u64,
}

impl SessionRuntime {
    pub(crate) fn new(
        session: UploadSession,
        source: StagedSource,
        authorizer: Arc<PartAuthorizer>,
        speed: SpeedConfig,
        generation: u64,
    ) -> Self {
        let total_parts = session.total_parts();
        Self {
            session,
            source,
            phase: Phase::Preparing,
            tracker: PartTracker::new(total_parts),
            authorizer,
            speed: SpeedEstimator::new(speed),
            bytes_uploaded: 0,
            last_part: None,
            started_at: Utc::now(),
            needs_reconcile: false,
            generation,
        }
    }

    /// Rebuild a session from its persisted record. It comes back paused
    /// and flagged for reconciliation against the backend.
    pub(crate) fn rehydrated(
        record: StoredSession,
        source: StagedSource,
        authorizer: Arc<PartAuthorizer>,
        speed: SpeedConfig,
        generation: u64,
    ) -> Self {
        let total_parts = record.session.total_parts();
        let tracker = PartTracker::restore(total_parts, record.parts);
        let bytes_uploaded = tracker.bytes_completed();
        let started_at = record.session.created_at;
        Self {
            session: record.session,
            source,
            phase: Phase::Paused,
            tracker,
            authorizer,
            speed: SpeedEstimator::new(speed),
            bytes_uploaded,
            last_part: record.progress.last_part_completed,
            started_at,
            needs_reconcile: true,
            generation,
        }
    }

    /// Live progress snapshot.
    pub(crate) fn progress(&self) -> UploadProgress {
        let total = self.session.size;
        let percent = if total > 0 {
            ((self.bytes_uploaded as f64 / total as f64) * 100.0).min(100.0)
        } else {
            0.0
        };
        UploadProgress {
            session_id: self.session.id.clone(),
            filename: self.session.display_filename().to_string(),
            bytes_uploaded: self.bytes_uploaded,
            total_bytes: total,
            percent,
            speed_bps: self.speed.bytes_per_second(),
            eta_seconds: self
                .speed
                .eta_seconds(total.saturating_sub(self.bytes_uploaded)),
            last_part_completed: self.last_part.clone(),
            state: self.phase.wire_state(),
            error: match &self.phase {
                Phase::Error { message } => Some(message.clone()),
                _ => None,
            },
            started_at: self.started_at,
        }
    }

    /// Snapshot for paused, queued or cancelled moments, where rate and ETA
    /// are meaningless.
    pub(crate) fn idle_progress(&self, state: UploadState) -> UploadProgress {
        let mut progress = self.progress();
        progress.speed_bps = 0.0;
        progress.eta_seconds = None;
        progress.last_part_completed = None;
        progress.state = state;
        progress.error = None;
        progress
    }

    /// Terminal snapshot after the backend accepted the completion call.
    pub(crate) fn completion_progress(&self) -> UploadProgress {
        let total = self.session.size;
        UploadProgress {
            session_id: self.session.id.clone(),
            filename: self.session.display_filename().to_string(),
            bytes_uploaded: total,
            total_bytes: total,
            percent: 100.0,
            speed_bps: 0.0,
            eta_seconds: Some(0.0),
            last_part_completed: None,
            state: UploadState::Completed,
            error: None,
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(part: u32, size: u64) -> PartOutcome {
        PartOutcome {
            etag: format!("etag-{part}"),
            part_number: part,
            size,
        }
    }

    #[test]
    fn dispatches_lowest_queued_part() {
        let mut tracker = PartTracker::new(5);
        assert_eq!(tracker.next_to_dispatch(), Some(1));

        tracker.mark_dispatched(1);
        tracker.mark_dispatched(2);
        assert_eq!(tracker.next_to_dispatch(), Some(3));
    }

    #[test]
    fn requeued_part_jumps_the_line() {
        let mut tracker = PartTracker::new(5);
        for part in 1..=3 {
            tracker.mark_dispatched(part);
        }
        assert_eq!(tracker.next_to_dispatch(), Some(4));

        tracker.requeue(2);
        assert_eq!(tracker.next_to_dispatch(), Some(2));
        assert_eq!(tracker.in_flight_count(), 2);
    }

    #[test]
    fn completion_is_recorded_once() {
        let mut tracker = PartTracker::new(3);
        tracker.mark_dispatched(1);
        assert!(tracker.complete(outcome(1, 100)));
        assert!(!tracker.complete(outcome(1, 100)));
        assert_eq!(tracker.bytes_completed(), 100);
        assert_eq!(tracker.in_flight_count(), 0);
    }

    #[test]
    fn completed_part_is_never_redispatched() {
        let mut tracker = PartTracker::new(3);
        tracker.mark_dispatched(1);
        tracker.complete(outcome(1, 100));
        tracker.requeue(1);
        assert_eq!(tracker.next_to_dispatch(), Some(2));
    }

    #[test]
    fn restore_skips_confirmed_parts() {
        let tracker = PartTracker::restore(4, vec![outcome(1, 100), outcome(3, 100)]);
        assert_eq!(tracker.next_to_dispatch(), Some(2));
        assert_eq!(tracker.bytes_completed(), 200);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn absorb_merges_remote_confirmations() {
        let mut tracker = PartTracker::new(4);
        tracker.mark_dispatched(1);
        tracker.complete(outcome(1, 100));

        let added = tracker.absorb(vec![outcome(1, 100), outcome(2, 100), outcome(9, 100)]);
        assert_eq!(added, 100);
        assert_eq!(tracker.next_to_dispatch(), Some(3));
        assert_eq!(tracker.bytes_completed(), 200);
    }

    #[test]
    fn failure_counters_accumulate_until_cleared() {
        let mut tracker = PartTracker::new(3);
        assert_eq!(tracker.record_failure(2), 1);
        assert_eq!(tracker.record_failure(2), 2);
        assert_eq!(tracker.record_failure(3), 1);

        tracker.clear_retries();
        assert_eq!(tracker.record_failure(2), 1);
    }

    #[test]
    fn success_resets_a_part_failure_counter() {
        let mut tracker = PartTracker::new(3);
        tracker.record_failure(1);
        tracker.record_failure(1);
        tracker.mark_dispatched(1);
        tracker.complete(outcome(1, 100));
        assert_eq!(tracker.record_failure(1), 1);
    }

    #[test]
    fn outcomes_come_back_sorted() {
        let mut tracker = PartTracker::new(3);
        for part in [3, 1, 2] {
            tracker.mark_dispatched(part);
            tracker.complete(outcome(part, 50));
        }
        assert!(tracker.is_complete());
        let parts: Vec<u32> = tracker
            .outcomes()
            .iter()
            .map(|outcome| outcome.part_number)
            .collect();
        assert_eq!(parts, vec![1, 2, 3]);
    }

    #[test]
    fn wire_state_projection() {
        assert_eq!(Phase::Preparing.wire_state(), UploadState::Preparing);
        assert_eq!(Phase::Waiting.wire_state(), UploadState::Uploading);
        assert_eq!(Phase::Reconciling.wire_state(), UploadState::Uploading);
        assert_eq!(
            Phase::Finalizing { attempts: 1 }.wire_state(),
            UploadState::Uploading
        );
        assert_eq!(
            Phase::Error {
                message: "boom".into()
            }
            .wire_state(),
            UploadState::Error
        );
        assert!(Phase::Uploading.occupies_slot());
        assert!(!Phase::Paused.occupies_slot());
    }
}
