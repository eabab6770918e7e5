//! The posting decision engine
//!
//! Every decision is a pure function of (current time, state): no sleeping,
//! no clocks, no IO. The worker supplies the time and persists the state;
//! this module only decides what happens next and how pacing evolves.
//!
//! Pacing: a successful upload draws a uniformly random cooldown from the
//! configured window (human-like spacing); a failure raises the backoff
//! level and delays exponentially from a base, capped. Time-scheduled
//! entries preempt the backlog; whether they also preempt the success
//! cooldown is the `scheduled_bypass_pacing` policy switch (they never
//! preempt failure backoff).

use rand::Rng;
use std::collections::HashSet;

use crate::config::PacingConfig;
use crate::types::{HistoryRecord, MediaItem, MediaStatus, Outcome, State};

#[derive(Debug, Clone)]
pub struct PacingPolicy {
    pub min_success_delay: u64,
    pub max_success_delay: u64,
    pub base_retry_delay: u64,
    pub max_backoff_level: u32,
    pub max_attempts: u32,
    pub scheduled_bypass_pacing: bool,
}

impl PacingPolicy {
    pub fn from_config(config: &PacingConfig) -> Self {
        Self {
            min_success_delay: config.min_success_delay_secs,
            max_success_delay: config.max_success_delay_secs,
            base_retry_delay: config.base_retry_delay_secs,
            max_backoff_level: config.max_backoff_level,
            max_attempts: config.max_attempts,
            scheduled_bypass_pacing: config.scheduled_bypass_pacing,
        }
    }

    /// Failure delay for a given backoff level: base * 2^level, capped at
    /// the max level's delay.
    pub fn retry_delay(&self, level: u32) -> u64 {
        let capped = level.min(self.max_backoff_level);
        self.base_retry_delay.saturating_mul(1u64 << capped.min(62))
    }
}

/// Where a dispatched item came from, so the outcome can be routed back to
/// the right table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOrigin {
    Backlog,
    Scheduled { entry_id: String },
}

#[derive(Debug, Clone)]
pub struct Dispatch {
    pub item: MediaItem,
    pub origin: DispatchOrigin,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Dispatch(Dispatch),
    /// Nothing due. `wake_at` is the earliest time anything could become
    /// due, or None when both tables are empty.
    Idle { wake_at: Option<i64> },
}

pub struct Scheduler {
    policy: PacingPolicy,
}

impl Scheduler {
    pub fn new(policy: PacingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    /// Decide the single next action at time `now`.
    ///
    /// On dispatch the chosen item is marked `Uploading` (and its attempt
    /// counter incremented) in the same transition that returns it, so a
    /// second call can never pick the same item. That is a correctness
    /// invariant, not an optimization.
    pub fn next_action(&self, now: i64, state: &mut State) -> Decision {
        let pacing_open = state.pacing.next_allowed_at <= now;
        // Failure backoff gates everything; the success cooldown gates
        // scheduled entries only when bypass is off.
        let scheduled_open = if self.policy.scheduled_bypass_pacing {
            state.pacing.backoff_level == 0 || pacing_open
        } else {
            pacing_open
        };

        if scheduled_open {
            // Earliest due entry wins; ties broken by insertion order
            // because min_by_key keeps the first minimum.
            let due = state
                .scheduled
                .iter_mut()
                .filter(|e| {
                    e.target_at <= now
                        && matches!(
                            e.item.status,
                            MediaStatus::Pending | MediaStatus::Scheduled
                        )
                })
                .min_by_key(|e| e.target_at);

            if let Some(entry) = due {
                entry.item.status = MediaStatus::Uploading;
                entry.item.attempts += 1;
                return Decision::Dispatch(Dispatch {
                    item: entry.item.clone(),
                    origin: DispatchOrigin::Scheduled {
                        entry_id: entry.id.clone(),
                    },
                });
            }
        }

        if pacing_open {
            if let Some(item) = state
                .backlog
                .iter_mut()
                .find(|i| i.status == MediaStatus::Pending)
            {
                item.status = MediaStatus::Uploading;
                item.attempts += 1;
                return Decision::Dispatch(Dispatch {
                    item: item.clone(),
                    origin: DispatchOrigin::Backlog,
                });
            }
        }

        Decision::Idle {
            wake_at: self.wake_hint(now, state),
        }
    }

    /// Earliest time anything could become dispatchable.
    fn wake_hint(&self, now: i64, state: &State) -> Option<i64> {
        let mut hint: Option<i64> = None;
        let mut consider = |t: i64| {
            hint = Some(match hint {
                Some(h) => h.min(t),
                None => t,
            });
        };

        let scheduled_gate =
            if self.policy.scheduled_bypass_pacing && state.pacing.backoff_level == 0 {
                now // success cooldown does not hold scheduled entries back
            } else {
                state.pacing.next_allowed_at
            };
        for entry in &state.scheduled {
            if matches!(
                entry.item.status,
                MediaStatus::Pending | MediaStatus::Scheduled
            ) {
                consider(entry.target_at.max(scheduled_gate));
            }
        }

        if state
            .backlog
            .iter()
            .any(|i| i.status == MediaStatus::Pending)
        {
            consider(state.pacing.next_allowed_at.max(now));
        }

        hint
    }

    /// Record a successful upload: the item leaves its table, pacing enters
    /// a fresh randomized cooldown and the backoff level resets.
    pub fn record_success(
        &self,
        now: i64,
        state: &mut State,
        dispatch: &Dispatch,
        remote_id: &str,
    ) -> HistoryRecord {
        let item = self.remove_dispatched(state, dispatch);
        // The dispatched copy carries the incremented counter too
        let attempts = item
            .as_ref()
            .map(|i| i.attempts)
            .unwrap_or(dispatch.item.attempts);

        let delay = if self.policy.min_success_delay >= self.policy.max_success_delay {
            self.policy.min_success_delay
        } else {
            rand::thread_rng()
                .gen_range(self.policy.min_success_delay..=self.policy.max_success_delay)
        };

        state.pacing.last_success_at = Some(now);
        state.pacing.backoff_level = 0;
        state.pacing.next_allowed_at = now + delay as i64;

        HistoryRecord {
            item_id: dispatch.item.id.clone(),
            filename: dispatch.item.filename.clone(),
            outcome: Outcome::Success {
                remote_id: remote_id.to_string(),
            },
            recorded_at: now,
            attempts,
        }
    }

    /// Record a failed upload. Transient failures re-enqueue the item and
    /// raise the backoff; a terminal failure, or exhausting the attempt
    /// cap, removes the item and returns the Failure record to append.
    pub fn record_failure(
        &self,
        now: i64,
        state: &mut State,
        dispatch: &Dispatch,
        reason: &str,
        terminal: bool,
    ) -> Option<HistoryRecord> {
        let level = (state.pacing.backoff_level + 1).min(self.policy.max_backoff_level);
        state.pacing.backoff_level = level;
        // Non-decreasing outside the explicit success reset
        state.pacing.next_allowed_at = state
            .pacing
            .next_allowed_at
            .max(now + self.policy.retry_delay(level) as i64);

        let attempts = self
            .find_dispatched(state, dispatch)
            .map(|i| i.attempts)
            .unwrap_or(dispatch.item.attempts);
        let exhausted = attempts >= self.policy.max_attempts;

        if terminal || exhausted {
            self.remove_dispatched(state, dispatch);
            return Some(HistoryRecord {
                item_id: dispatch.item.id.clone(),
                filename: dispatch.item.filename.clone(),
                outcome: Outcome::Failure {
                    reason: reason.to_string(),
                },
                recorded_at: now,
                attempts,
            });
        }

        // Retryable: back to Pending. Backlog items go to the back of the
        // queue; schedule entries keep their slot and target.
        match &dispatch.origin {
            DispatchOrigin::Backlog => {
                if let Some(pos) = state.backlog.iter().position(|i| i.id == dispatch.item.id) {
                    if let Some(mut item) = state.backlog.remove(pos) {
                        item.status = MediaStatus::Pending;
                        state.backlog.push_back(item);
                    }
                }
            }
            DispatchOrigin::Scheduled { entry_id } => {
                if let Some(entry) = state.scheduled.iter_mut().find(|e| &e.id == entry_id) {
                    entry.item.status = MediaStatus::Pending;
                }
            }
        }
        None
    }

    /// Record a dispatch that never reached the platform: no session could
    /// be established (rejected credentials, auth cooldown). Pacing still
    /// backs off, but the item's attempt counter is rolled back and no
    /// history is written — the attempt cap only counts attempts the
    /// platform actually saw, so a fixed password later lets the item
    /// publish normally.
    pub fn record_session_failure(&self, now: i64, state: &mut State, dispatch: &Dispatch) {
        let level = (state.pacing.backoff_level + 1).min(self.policy.max_backoff_level);
        state.pacing.backoff_level = level;
        state.pacing.next_allowed_at = state
            .pacing
            .next_allowed_at
            .max(now + self.policy.retry_delay(level) as i64);

        match &dispatch.origin {
            DispatchOrigin::Backlog => {
                if let Some(item) = state.backlog.iter_mut().find(|i| i.id == dispatch.item.id) {
                    item.status = MediaStatus::Pending;
                    item.attempts = item.attempts.saturating_sub(1);
                }
            }
            DispatchOrigin::Scheduled { entry_id } => {
                if let Some(entry) = state.scheduled.iter_mut().find(|e| &e.id == entry_id) {
                    entry.item.status = MediaStatus::Pending;
                    entry.item.attempts = entry.item.attempts.saturating_sub(1);
                }
            }
        }
    }

    /// Startup recovery: an item found `Uploading` was in flight when the
    /// process died. If history already holds a Success for it the attempt
    /// completed and the item is dropped; otherwise it is retryable.
    pub fn recover(&self, state: &mut State, successes: &HashSet<String>) -> usize {
        let mut recovered = 0;

        let mut requeue = |item: &mut MediaItem| {
            if item.status == MediaStatus::Uploading {
                item.status = MediaStatus::Pending;
                recovered += 1;
                true
            } else {
                false
            }
        };

        state.backlog.retain_mut(|item| {
            if item.status == MediaStatus::Uploading && successes.contains(&item.id) {
                tracing::info!(id = %item.id, "interrupted upload already recorded; dropping");
                return false;
            }
            requeue(item);
            true
        });
        state.scheduled.retain_mut(|entry| {
            if entry.item.status == MediaStatus::Uploading && successes.contains(&entry.item.id) {
                tracing::info!(id = %entry.item.id, "interrupted upload already recorded; dropping");
                return false;
            }
            requeue(&mut entry.item);
            true
        });

        recovered
    }

    fn find_dispatched<'a>(&self, state: &'a State, dispatch: &Dispatch) -> Option<&'a MediaItem> {
        match &dispatch.origin {
            DispatchOrigin::Backlog => state.backlog.iter().find(|i| i.id == dispatch.item.id),
            DispatchOrigin::Scheduled { entry_id } => state
                .scheduled
                .iter()
                .find(|e| &e.id == entry_id)
                .map(|e| &e.item),
        }
    }

    fn remove_dispatched(&self, state: &mut State, dispatch: &Dispatch) -> Option<MediaItem> {
        match &dispatch.origin {
            DispatchOrigin::Backlog => state
                .backlog
                .iter()
                .position(|i| i.id == dispatch.item.id)
                .and_then(|pos| state.backlog.remove(pos)),
            DispatchOrigin::Scheduled { entry_id } => state
                .scheduled
                .iter()
                .position(|e| &e.id == entry_id)
                .map(|pos| state.scheduled.remove(pos).item),
        }
    }
}
