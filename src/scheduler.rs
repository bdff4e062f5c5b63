//! Timing policies for rule execution.
//!
//! The [`AnalysisScheduler`] decides when a rule's callback runs. It has
//! two modes that coexist:
//!
//! **Individual mode.** Each rule id owns one timer slot. Scheduling a rule
//! with content it has already fired on (or already has queued) is a no-op;
//! otherwise the old timer is cancelled and a new one armed. The delay
//! depends on the trigger:
//!
//! | Trigger | Delay |
//! |---------|-------|
//! | `word`, `sentence` | `trigger_batch` (100 ms) so rapid completions coalesce |
//! | `custom` | [`resolve_custom_delay`] over the parsed interval |
//! | `manual` | immediate |
//!
//! **Batch mode.** [`request_batch`](AnalysisScheduler::request_batch) runs
//! every rule at once. Only one batch is ever in flight; requests that
//! arrive meanwhile collapse into a single follow-up run on the newest
//! content, started `batch_rerun_delay` after the active one settles.
//!
//! # Staleness
//!
//! Every armed timer gets a fresh token. A callback receives its token in
//! [`RuleFire`] and must check [`is_current`](AnalysisScheduler::is_current)
//! before applying its result: cancelling or resetting a rule bumps the
//! token, so late results are dropped rather than aborted. Batches carry an
//! epoch that plays the same role for [`reset_all_timers`](AnalysisScheduler::reset_all_timers).
//!
//! For one rule id, fires are strictly sequential: while a callback is
//! still running, a new schedule is parked and armed once it returns.
//! Distinct rule ids run fully independently.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::HarnessError;
use crate::rules::TriggerTiming;

pub type RuleFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Invoked when a rule's timer fires.
pub type RuleCallback = Arc<dyn Fn(RuleFire) -> RuleFuture + Send + Sync>;

pub type BatchFuture = Pin<Box<dyn Future<Output = BatchSummary> + Send + 'static>>;

/// Runs every enabled rule for one batch and reports once all have settled.
pub type BatchRunner = Arc<dyn Fn(BatchRun) -> BatchFuture + Send + Sync>;

/// Handed to a [`RuleCallback`] when its timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleFire {
    pub rule_id: String,
    pub content: String,
    pub token: u64,
}

/// Handed to a [`BatchRunner`] for each batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRun {
    pub content: String,
    pub epoch: u64,
    pub run: u64,
}

/// Aggregate result of one batch. Successes and failures count alike
/// toward completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<HarnessError>,
    /// Rules whose results arrived after a reset and were dropped.
    pub discarded: Vec<String>,
}

impl BatchSummary {
    pub fn successes(&self) -> usize {
        self.succeeded.len()
    }

    pub fn errors(&self) -> usize {
        self.failed.len()
    }

    pub fn settled(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.discarded.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    TimerArmed { rule_id: String, delay: Duration },
    RuleFired { rule_id: String, token: u64 },
    TimerCancelled { rule_id: String },
    Countdown { rule_id: String, remaining: Duration },
    CountdownCleared { rule_id: String },
    BatchStarted { run: u64 },
    BatchCoalesced,
    BatchSettled { run: u64, summary: BatchSummary },
}

/// Result of a schedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A timer was armed with this delay.
    Armed(Duration),
    /// Content matched what already fired or is already queued.
    Unchanged,
    /// The rule's previous call is still running; armed when it returns.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRequest {
    Started,
    Coalesced,
}

/// Read-only view of one rule's timer slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleTimerSnapshot {
    pub armed: bool,
    pub in_flight: bool,
    pub pending_content: Option<String>,
    pub last_trigger_content: Option<String>,
    pub countdown_remaining: Option<Duration>,
}

/// Parse `"1d2h3m4s"`-style intervals. Components may appear in any
/// order or be omitted. Returns `None` for unparsable or zero input.
pub fn parse_delay(input: &str) -> Option<Duration> {
    let mut total_ms: u64 = 0;
    let mut digits = String::new();

    for ch in input.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }
        let unit_ms: u64 = match ch.to_ascii_lowercase() {
            'd' => 86_400_000,
            'h' => 3_600_000,
            'm' => 60_000,
            's' => 1_000,
            _ => return None,
        };
        if digits.is_empty() {
            return None;
        }
        let n: u64 = digits.parse().ok()?;
        total_ms = total_ms.checked_add(n.checked_mul(unit_ms)?)?;
        digits.clear();
    }

    if !digits.is_empty() || total_ms == 0 {
        return None;
    }
    Some(Duration::from_millis(total_ms))
}

/// Delay for a `custom` rule.
///
/// With no prior fire, or once `configured` has fully elapsed since it,
/// the rule fires after `min_settle` (a typing-pause debounce). Otherwise
/// it waits out the rest of the interval, but never less than `min_settle`.
pub fn resolve_custom_delay(
    configured: Duration,
    since_last_fire: Option<Duration>,
    min_settle: Duration,
) -> Duration {
    match since_last_fire {
        None => min_settle,
        Some(elapsed) if elapsed >= configured => min_settle,
        Some(elapsed) => (configured - elapsed).max(min_settle),
    }
}

struct Countdown {
    start: Instant,
    duration: Duration,
    ticker: JoinHandle<()>,
}

impl Countdown {
    fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.start.elapsed())
    }
}

struct Deferred {
    callback: RuleCallback,
    timing: TriggerTiming,
    custom_delay: Option<String>,
}

#[derive(Default)]
struct RuleTimerState {
    token: u64,
    timer: Option<JoinHandle<()>>,
    last_trigger_content: Option<String>,
    pending_content: Option<String>,
    last_fire: Option<Instant>,
    countdown: Option<Countdown>,
    /// Token of the callback currently running, if any.
    in_flight: Option<u64>,
    deferred: Option<Deferred>,
}

impl RuleTimerState {
    fn stop_timer(&mut self) -> bool {
        match self.timer.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    fn stop_countdown(&mut self) -> bool {
        match self.countdown.take() {
            Some(c) => {
                c.ticker.abort();
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct BatchState {
    is_generating: bool,
    has_pending: bool,
    latest_content: Option<String>,
    epoch: u64,
    runs: u64,
}

#[derive(Default)]
struct SchedulerState {
    rules: HashMap<String, RuleTimerState>,
    visible_results: HashSet<String>,
    next_token: u64,
    batch: BatchState,
}

impl SchedulerState {
    fn fresh_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }
}

struct Inner {
    state: Mutex<SchedulerState>,
    settings: SchedulerConfig,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Cloneable handle; clones share the same timers.
#[derive(Clone)]
pub struct AnalysisScheduler {
    inner: Arc<Inner>,
}

impl AnalysisScheduler {
    pub fn new(settings: SchedulerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                settings,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Individual mode
    // ═══════════════════════════════════════════════════════════════════

    /// Arm (or re-arm) the timer for `rule_id`.
    ///
    /// No-op when `content` equals either the content the rule last fired
    /// on or the content already queued for its next fire.
    pub fn schedule_prompt_feedback(
        &self,
        rule_id: &str,
        callback: RuleCallback,
        timing: TriggerTiming,
        content: &str,
        custom_delay: Option<&str>,
    ) -> ScheduleOutcome {
        let mut state = self.lock();
        let entry = state.rules.entry(rule_id.to_string()).or_default();

        if entry.last_trigger_content.as_deref() == Some(content)
            || entry.pending_content.as_deref() == Some(content)
        {
            return ScheduleOutcome::Unchanged;
        }
        self.arm_or_defer(&mut state, rule_id, callback, timing, content, custom_delay)
    }

    /// Fire `rule_id` immediately, bypassing content suppression.
    pub fn fire_now(&self, rule_id: &str, callback: RuleCallback, content: &str) -> ScheduleOutcome {
        let mut state = self.lock();
        state.rules.entry(rule_id.to_string()).or_default();
        self.arm_or_defer(
            &mut state,
            rule_id,
            callback,
            TriggerTiming::Manual,
            content,
            None,
        )
    }

    fn arm_or_defer(
        &self,
        state: &mut SchedulerState,
        rule_id: &str,
        callback: RuleCallback,
        timing: TriggerTiming,
        content: &str,
        custom_delay: Option<&str>,
    ) -> ScheduleOutcome {
        let in_flight = state
            .rules
            .get(rule_id)
            .is_some_and(|e| e.in_flight.is_some());
        if in_flight {
            if let Some(entry) = state.rules.get_mut(rule_id) {
                entry.stop_timer();
                entry.stop_countdown();
                entry.pending_content = Some(content.to_string());
                entry.deferred = Some(Deferred {
                    callback,
                    timing,
                    custom_delay: custom_delay.map(str::to_string),
                });
            }
            debug!(rule = rule_id, "rule call in flight; schedule deferred");
            return ScheduleOutcome::Deferred;
        }
        let delay = self.arm(state, rule_id, callback, timing, content, custom_delay);
        ScheduleOutcome::Armed(delay)
    }

    /// Cancel any existing timer and arm a new one. Caller holds the lock.
    fn arm(
        &self,
        state: &mut SchedulerState,
        rule_id: &str,
        callback: RuleCallback,
        timing: TriggerTiming,
        content: &str,
        custom_delay: Option<&str>,
    ) -> Duration {
        let token = state.fresh_token();
        let has_visible = state.visible_results.contains(rule_id);
        let settings = &self.inner.settings;
        let entry = state.rules.entry(rule_id.to_string()).or_default();

        entry.stop_timer();
        let had_countdown = entry.stop_countdown();
        entry.deferred = None;
        entry.pending_content = Some(content.to_string());
        entry.token = token;

        let delay = delay_for(settings, timing, custom_delay, entry.last_fire);

        let sched = self.clone();
        let id = rule_id.to_string();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sched.fire(id, token, callback).await;
        }));

        let wants_countdown =
            timing == TriggerTiming::Custom && delay > settings.min_settle() && has_visible;
        if wants_countdown {
            entry.countdown = Some(self.start_countdown(rule_id, token, delay));
        }

        if had_countdown && !wants_countdown {
            self.emit(SchedulerEvent::CountdownCleared {
                rule_id: rule_id.to_string(),
            });
        }
        debug!(rule = rule_id, delay_ms = delay.as_millis() as u64, "timer armed");
        self.emit(SchedulerEvent::TimerArmed {
            rule_id: rule_id.to_string(),
            delay,
        });
        delay
    }

    fn start_countdown(&self, rule_id: &str, token: u64, delay: Duration) -> Countdown {
        let sched = self.clone();
        let id = rule_id.to_string();
        let tick = self.inner.settings.countdown_tick();
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let remaining = {
                    let state = sched.lock();
                    match state.rules.get(&id) {
                        Some(e) if e.token == token => e.countdown.as_ref().map(Countdown::remaining),
                        _ => None,
                    }
                };
                let Some(remaining) = remaining else { break };
                sched.emit(SchedulerEvent::Countdown {
                    rule_id: id.clone(),
                    remaining,
                });
                if remaining.is_zero() {
                    break;
                }
            }
        });
        Countdown {
            start: Instant::now(),
            duration: delay,
            ticker,
        }
    }

    /// Timer expiry: claim the slot, run the callback, then re-arm any
    /// schedule that arrived while it was running.
    async fn fire(&self, rule_id: String, token: u64, callback: RuleCallback) {
        let fire = {
            let mut state = self.lock();
            let Some(entry) = state.rules.get_mut(&rule_id) else {
                return;
            };
            if entry.token != token {
                return;
            }
            // Dropping our own handle detaches it; a later cancel must not
            // abort the callback below.
            entry.timer = None;
            let had_countdown = entry.stop_countdown();
            let content = entry.pending_content.take().unwrap_or_default();
            entry.last_trigger_content = Some(content.clone());
            entry.last_fire = Some(Instant::now());
            entry.in_flight = Some(token);
            if had_countdown {
                self.emit(SchedulerEvent::CountdownCleared {
                    rule_id: rule_id.clone(),
                });
            }
            RuleFire {
                rule_id: rule_id.clone(),
                content,
                token,
            }
        };

        info!(rule = %rule_id, "rule fired");
        self.emit(SchedulerEvent::RuleFired {
            rule_id: rule_id.clone(),
            token,
        });
        callback(fire).await;

        let mut state = self.lock();
        let Some(entry) = state.rules.get_mut(&rule_id) else {
            return;
        };
        if entry.in_flight != Some(token) {
            return;
        }
        entry.in_flight = None;
        let Some(deferred) = entry.deferred.take() else {
            return;
        };
        let Some(content) = entry.pending_content.clone() else {
            return;
        };
        debug!(rule = %rule_id, "arming deferred schedule");
        self.arm(
            &mut state,
            &rule_id,
            deferred.callback,
            deferred.timing,
            &content,
            deferred.custom_delay.as_deref(),
        );
    }

    /// Clear a rule's timer, countdown and pending content. Any call
    /// already running for it has its result invalidated.
    pub fn clear_rule_timer(&self, rule_id: &str) -> bool {
        let mut state = self.lock();
        let token = state.fresh_token();
        let Some(entry) = state.rules.get_mut(rule_id) else {
            debug!("{}", HarnessError::lookup("rule", rule_id));
            return false;
        };
        entry.stop_timer();
        let had_countdown = entry.stop_countdown();
        entry.pending_content = None;
        entry.deferred = None;
        entry.token = token;
        drop(state);

        if had_countdown {
            self.emit(SchedulerEvent::CountdownCleared {
                rule_id: rule_id.to_string(),
            });
        }
        self.emit(SchedulerEvent::TimerCancelled {
            rule_id: rule_id.to_string(),
        });
        true
    }

    /// Cancel every rule timer and clear batch-mode flags.
    pub fn reset_all_timers(&self) {
        let mut state = self.lock();
        let cancelled: Vec<String> = state.rules.keys().cloned().collect();
        for entry in state.rules.values_mut() {
            entry.stop_timer();
            entry.stop_countdown();
        }
        state.rules.clear();
        state.visible_results.clear();
        state.batch.is_generating = false;
        state.batch.has_pending = false;
        state.batch.latest_content = None;
        state.batch.epoch += 1;
        drop(state);

        info!(rules = cancelled.len(), "scheduler reset");
        for rule_id in cancelled {
            self.emit(SchedulerEvent::TimerCancelled { rule_id });
        }
    }

    /// True if `token` is still the authoritative call for `rule_id`.
    pub fn is_current(&self, rule_id: &str, token: u64) -> bool {
        self.lock()
            .rules
            .get(rule_id)
            .is_some_and(|e| e.token == token)
    }

    /// Record whether `rule_id` has a result on screen; this gates the countdown.
    pub fn set_visible_result(&self, rule_id: &str, visible: bool) {
        let mut state = self.lock();
        if visible {
            state.visible_results.insert(rule_id.to_string());
        } else {
            state.visible_results.remove(rule_id);
        }
    }

    /// Delay a schedule for `rule_id` would get right now.
    pub fn resolve_delay(
        &self,
        rule_id: &str,
        timing: TriggerTiming,
        custom_delay: Option<&str>,
    ) -> Duration {
        let state = self.lock();
        let last_fire = state.rules.get(rule_id).and_then(|e| e.last_fire);
        delay_for(&self.inner.settings, timing, custom_delay, last_fire)
    }

    pub fn countdown_remaining(&self, rule_id: &str) -> Option<Duration> {
        self.lock()
            .rules
            .get(rule_id)
            .and_then(|e| e.countdown.as_ref().map(Countdown::remaining))
    }

    pub fn armed_timer_count(&self) -> usize {
        self.lock()
            .rules
            .values()
            .filter(|e| e.timer.is_some())
            .count()
    }

    pub fn rule_state(&self, rule_id: &str) -> Option<RuleTimerSnapshot> {
        self.lock().rules.get(rule_id).map(|e| RuleTimerSnapshot {
            armed: e.timer.is_some(),
            in_flight: e.in_flight.is_some(),
            pending_content: e.pending_content.clone(),
            last_trigger_content: e.last_trigger_content.clone(),
            countdown_remaining: e.countdown.as_ref().map(Countdown::remaining),
        })
    }

    // ═══════════════════════════════════════════════════════════════════
    // Batch mode
    // ═══════════════════════════════════════════════════════════════════

    /// Start a batch run over `content`, or, if one is already in flight,
    /// queue a single follow-up run on the newest content.
    pub fn request_batch(&self, content: &str, runner: BatchRunner) -> BatchRequest {
        let mut state = self.lock();
        if state.batch.is_generating {
            state.batch.has_pending = true;
            state.batch.latest_content = Some(content.to_string());
            drop(state);
            debug!("batch in flight; request coalesced");
            self.emit(SchedulerEvent::BatchCoalesced);
            return BatchRequest::Coalesced;
        }
        state.batch.is_generating = true;
        state.batch.runs += 1;
        let run = BatchRun {
            content: content.to_string(),
            epoch: state.batch.epoch,
            run: state.batch.runs,
        };
        drop(state);

        let sched = self.clone();
        tokio::spawn(async move { sched.drive_batches(run, runner).await });
        BatchRequest::Started
    }

    async fn drive_batches(self, mut run: BatchRun, runner: BatchRunner) {
        loop {
            self.emit(SchedulerEvent::BatchStarted { run: run.run });
            let summary = runner(run.clone()).await;
            info!(
                run = run.run,
                successes = summary.successes(),
                errors = summary.errors(),
                "batch settled"
            );
            self.emit(SchedulerEvent::BatchSettled {
                run: run.run,
                summary,
            });

            {
                let mut state = self.lock();
                if state.batch.epoch != run.epoch {
                    return;
                }
                if !state.batch.has_pending {
                    state.batch.is_generating = false;
                    return;
                }
            }

            tokio::time::sleep(self.inner.settings.batch_rerun_delay()).await;

            let mut state = self.lock();
            if state.batch.epoch != run.epoch {
                return;
            }
            let Some(content) = state.batch.latest_content.take() else {
                warn!("pending batch without content");
                state.batch.has_pending = false;
                state.batch.is_generating = false;
                return;
            };
            state.batch.has_pending = false;
            state.batch.runs += 1;
            run = BatchRun {
                content,
                epoch: run.epoch,
                run: state.batch.runs,
            };
        }
    }

    pub fn is_generating(&self) -> bool {
        self.lock().batch.is_generating
    }

    pub fn has_pending_batch(&self) -> bool {
        self.lock().batch.has_pending
    }

    /// True if no reset has happened since `epoch` was handed out.
    pub fn batch_is_current(&self, epoch: u64) -> bool {
        self.lock().batch.epoch == epoch
    }
}

fn delay_for(
    settings: &SchedulerConfig,
    timing: TriggerTiming,
    custom_delay: Option<&str>,
    last_fire: Option<Instant>,
) -> Duration {
    match timing {
        TriggerTiming::Word | TriggerTiming::Sentence => settings.trigger_batch(),
        TriggerTiming::Manual => Duration::ZERO,
        TriggerTiming::Custom => {
            let configured = custom_delay
                .and_then(parse_delay)
                .unwrap_or_else(|| settings.default_custom());
            resolve_custom_delay(
                configured,
                last_fire.map(|t| t.elapsed()),
                settings.min_settle(),
            )
        }
    }
}
