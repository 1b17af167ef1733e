//! Cron triggers: a 5-field, timezone-aware evaluator and the per-automation
//! scheduling tasks.
//!
//! DST policy: local times inside a spring-forward gap are skipped; on a
//! fall-back overlap the earliest (pre-transition) instant wins.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::executor::AutomationExecutor;
use super::model::{Automation, TriggerConfig};
use super::store::AutomationStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Expression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
enum CronField {
    Any,
    /// Sorted, deduplicated admissible values.
    Values(Vec<u32>),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Values(values) => values.binary_search(&value).is_ok(),
        }
    }
}

/// A parsed `minute hour day-of-month month day-of-week` expression.
/// Day-of-week runs Sunday=0 through Saturday=6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(format!(
                "expected 5 cron fields, got {} in '{expression}'",
                fields.len()
            ));
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 6)?,
        })
    }

    fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }

    /// Next firing instant strictly after `after`, evaluated in `tz`,
    /// returned in UTC. Scans minute by minute, bounded at one year.
    pub fn next_after(&self, after: DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let seconds_into_minute = local.second() as i64;
        let mut candidate = local + chrono::Duration::seconds(60 - seconds_into_minute);
        candidate = candidate.with_second(0).unwrap_or(candidate);

        let minutes_in_year = 366 * 24 * 60;
        for _ in 0..minutes_in_year {
            if self.matches_local(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(instant) => {
                        return Some(instant.with_timezone(&Utc))
                    }
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc))
                    }
                    // Spring-forward gap: this wall-clock minute does not
                    // exist in tz.
                    chrono::LocalResult::None => {}
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<CronField, String> {
    if raw == "*" {
        return Ok(CronField::Any);
    }

    let mut values = Vec::new();
    for part in raw.split(',') {
        if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("bad step value '{part}'"))?;
            if step == 0 {
                return Err(format!("step of zero in '{part}'"));
            }
            values.extend((min..=max).filter(|v| v % step == 0));
        } else if let Some((start, end)) = part.split_once('-') {
            let start: u32 = start
                .parse()
                .map_err(|_| format!("bad range start '{part}'"))?;
            let end: u32 = end.parse().map_err(|_| format!("bad range end '{part}'"))?;
            if start > end || start < min || end > max {
                return Err(format!("range '{part}' outside {min}-{max}"));
            }
            values.extend(start..=end);
        } else {
            let value: u32 = part
                .parse()
                .map_err(|_| format!("bad cron value '{part}'"))?;
            if value < min || value > max {
                return Err(format!("value {value} outside {min}-{max}"));
            }
            values.push(value);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

/// Resolve an optional timezone name; unknown names fall back to UTC with a
/// warning so the automation still fires.
pub fn resolve_tz(timezone: Option<&str>) -> chrono_tz::Tz {
    match timezone {
        None => chrono_tz::UTC,
        Some(name) => name.parse().unwrap_or_else(|_| {
            tracing::warn!(timezone = name, "unknown timezone, using UTC");
            chrono_tz::UTC
        }),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scheduling task per active cron automation. Unparseable expressions
/// are logged and not installed; the automation record stays active.
pub struct CronScheduler {
    store: Arc<AutomationStore>,
    executor: Arc<AutomationExecutor>,
    tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(store: Arc<AutomationStore>, executor: Arc<AutomationExecutor>) -> Self {
        Self {
            store,
            executor,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Install every active cron automation (startup and reload path).
    pub fn start(&self) {
        for automation in self.store.list_active() {
            self.install(&automation);
        }
    }

    pub fn install(&self, automation: &Automation) {
        let Some(TriggerConfig::Cron(trigger)) = &automation.trigger else {
            return;
        };
        let expr = match CronExpr::parse(&trigger.schedule) {
            Ok(expr) => expr,
            Err(e) => {
                tracing::warn!(
                    automation = %automation.name,
                    schedule = %trigger.schedule,
                    error = %e,
                    "cron schedule failed to parse, not installing"
                );
                return;
            }
        };
        let tz = resolve_tz(trigger.timezone.as_deref());

        // Replace any prior task for this automation.
        self.remove(automation.id);

        let automation_id = automation.id;
        let name = automation.name.clone();
        let store = self.store.clone();
        let executor = self.executor.clone();
        let schedule = trigger.schedule.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = expr.next_after(Utc::now(), tz) else {
                    tracing::warn!(automation = %name, "cron produced no next occurrence");
                    break;
                };
                if let Err(e) = store.update(automation_id, |a| a.next_scheduled_at = Some(next)) {
                    tracing::warn!(error = %e, "failed to persist next_scheduled_at");
                    break;
                }

                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                let trigger_data = serde_json::json!({
                    "trigger": "cron",
                    "schedule": schedule,
                    "scheduled_at": next,
                });
                match executor.queue_execution(automation_id, trigger_data) {
                    Ok(execution_id) => {
                        tracing::info!(
                            automation = %name,
                            %execution_id,
                            "cron fired"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(automation = %name, error = %e, "cron enqueue skipped");
                    }
                }
            }
        });
        self.tasks.lock().insert(automation.id, handle);
    }

    pub fn remove(&self, automation_id: Uuid) {
        if let Some(handle) = self.tasks.lock().remove(&automation_id) {
            handle.abort();
        }
    }

    /// Re-create the scheduling task from the stored record.
    pub fn reload(&self, automation_id: Uuid) {
        self.remove(automation_id);
        if let Some(automation) = self.store.get(automation_id) {
            if automation.status == super::model::AutomationStatus::Active {
                self.install(&automation);
            }
        }
    }

    pub fn installed_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
