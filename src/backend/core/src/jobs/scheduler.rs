//! Periodic scheduler: a static table of calendar entries, evaluated
//! against UTC once per tick.
//!
//! Each entry fires at most once per due instant (the minute its rule
//! names), gated by an in-memory `last_fired` timestamp. Ticks missed
//! while the process is down are not backfilled; a restart inside a due
//! minute can refire that minute, so downstream handlers see
//! at-least-once scheduling.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc, Weekday};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::engine::JobEngine;
use super::Priority;

/// Maximum tick interval; the scheduler must observe every minute.
pub const MAX_TICK_INTERVAL: Duration = Duration::from_secs(60);

// ═══════════════════════════════════════════════════════════════════════════════
// Calendar Rules
// ═══════════════════════════════════════════════════════════════════════════════

/// When a periodic entry is due, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CalendarRule {
    /// Every day at `hour:minute`
    Daily { hour: u32, minute: u32 },
    /// Every week on `weekday` at `hour:minute`
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
    /// Every `every` hours (on hours divisible by it) at `minute`
    EveryHours { every: u32, minute: u32 },
}

impl CalendarRule {
    /// The due instant covering `now`, if the rule matches now's
    /// minute. Due instants are whole minutes.
    pub fn due_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let matches = match self {
            Self::Daily { hour, minute } => now.hour() == *hour && now.minute() == *minute,
            Self::Weekly {
                weekday,
                hour,
                minute,
            } => now.weekday() == *weekday && now.hour() == *hour && now.minute() == *minute,
            Self::EveryHours { every, minute } => {
                *every > 0 && now.hour() % *every == 0 && now.minute() == *minute
            }
        };
        if !matches {
            return None;
        }
        Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), now.minute(), 0)
            .single()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Schedule Table
// ═══════════════════════════════════════════════════════════════════════════════

/// One row in the periodic schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub job_name: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub rule: CalendarRule,
    /// Priority override; `None` uses the job's registered default
    #[serde(default)]
    pub priority: Option<Priority>,
}

impl ScheduleEntry {
    pub fn new(job_name: impl Into<String>, rule: CalendarRule) -> Self {
        Self {
            job_name: job_name.into(),
            args: Vec::new(),
            rule,
            priority: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// The platform's standard calendar.
pub fn platform_schedule() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry::new(
            "generate_daily_recommendations",
            CalendarRule::Daily { hour: 2, minute: 0 },
        )
        .priority(Priority::high()),
        ScheduleEntry::new(
            "retrain_collaborative_model",
            CalendarRule::Weekly {
                weekday: Weekday::Sun,
                hour: 3,
                minute: 0,
            },
        ),
        ScheduleEntry::new(
            "extract_user_features",
            CalendarRule::EveryHours { every: 6, minute: 15 },
        ),
        ScheduleEntry::new(
            "cleanup_expired_results",
            CalendarRule::Daily { hour: 4, minute: 30 },
        )
        .priority(Priority::low()),
    ]
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluates the schedule table on a tick loop and submits due entries.
pub struct PeriodicScheduler {
    entries: Vec<ScheduleEntry>,
    last_fired: Vec<Option<DateTime<Utc>>>,
}

impl PeriodicScheduler {
    pub fn new(entries: Vec<ScheduleEntry>) -> Self {
        let last_fired = vec![None; entries.len()];
        Self {
            entries,
            last_fired,
        }
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Evaluate the table at `now`, returning the entries that just
    /// became due. Re-evaluating within the same minute returns
    /// nothing; each entry fires once per due instant.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ScheduleEntry> {
        let mut due = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if let Some(instant) = entry.rule.due_at(now) {
                if self.last_fired[idx] != Some(instant) {
                    self.last_fired[idx] = Some(instant);
                    due.push(entry.clone());
                }
            }
        }
        due
    }

    /// Run the tick loop until shutdown, submitting due entries through
    /// the engine.
    pub async fn run(
        mut self,
        engine: Arc<JobEngine>,
        tick_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let tick_interval = tick_interval.min(MAX_TICK_INTERVAL);
        tracing::info!(
            entries = self.entries.len(),
            tick_secs = tick_interval.as_secs(),
            "Periodic scheduler started"
        );

        let mut ticker = tokio::time::interval(tick_interval);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // A dropped sender means there is nobody left to
                    // order shutdown; stop rather than spin.
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            for entry in self.tick(Utc::now()) {
                counter!("talentum_schedule_fired_total", "job" => entry.job_name.clone())
                    .increment(1);
                match engine
                    .submit(&entry.job_name, entry.args.clone(), entry.priority, Duration::ZERO)
                    .await
                {
                    Ok(job_id) => {
                        tracing::info!(
                            job = %entry.job_name,
                            job_id = %job_id,
                            "Scheduled job submitted"
                        );
                    }
                    Err(e) => {
                        // The due instant is already marked fired; a
                        // failed submit is logged, not backfilled.
                        tracing::error!(
                            job = %entry.job_name,
                            error = %e,
                            "Failed to submit scheduled job"
                        );
                    }
                }
            }
        }

        tracing::info!("Periodic scheduler stopped");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
