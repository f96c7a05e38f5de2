//! Time-based task submission
//!
//! Schedules are written in a small, enumerable natural-language vocabulary.
//! Unrecognised phrases fail parsing explicitly; nothing is guessed. The
//! original phrase is kept on the rule for audit.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::CancelToken;
use crate::router::{SubmitOptions, TaskRouter};

/// Error types for schedule parsing
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleParseError {
    #[error("Unrecognised schedule pattern: '{0}'")]
    Unrecognised(String),

    #[error("Invalid time of day in '{0}'")]
    InvalidTime(String),
}

/// The structured form a phrase parses into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Fixed interval in seconds
    Every { interval_secs: u64 },
    /// Every day at a fixed local time
    DailyAt { hour: u32, minute: u32 },
    /// Monday through Friday at a fixed local time
    WeekdaysAt { hour: u32, minute: u32 },
}

/// A parsed schedule rule
///
/// `original` preserves the phrase as written, so what fires can always be
/// traced back to what was asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub original: String,
    pub kind: RuleKind,
}

impl ScheduleRule {
    /// Parse a natural-language schedule phrase
    ///
    /// Recognised: "every minute", "every hour", "every day",
    /// "every morning", "every evening", "daily at HH:MM",
    /// "weekdays at HH:MM".
    pub fn parse(input: &str) -> Result<Self, ScheduleParseError> {
        let normalized = input.trim().to_lowercase();

        let kind = match normalized.as_str() {
            "every minute" => RuleKind::Every { interval_secs: 60 },
            "every hour" => RuleKind::Every { interval_secs: 60 * 60 },
            "every day" => RuleKind::Every { interval_secs: 24 * 60 * 60 },
            "every morning" => RuleKind::DailyAt { hour: 9, minute: 0 },
            "every evening" => RuleKind::DailyAt { hour: 18, minute: 0 },
            _ => {
                if let Some(time) = normalized.strip_prefix("daily at ") {
                    let (hour, minute) = parse_time(time).ok_or_else(|| ScheduleParseError::InvalidTime(input.to_string()))?;
                    RuleKind::DailyAt { hour, minute }
                } else if let Some(time) = normalized.strip_prefix("weekdays at ") {
                    let (hour, minute) = parse_time(time).ok_or_else(|| ScheduleParseError::InvalidTime(input.to_string()))?;
                    RuleKind::WeekdaysAt { hour, minute }
                } else {
                    return Err(ScheduleParseError::Unrecognised(input.to_string()));
                }
            }
        };

        Ok(Self {
            original: input.trim().to_string(),
            kind,
        })
    }

    /// Next fire time strictly after `now`
    pub fn next_fire(&self, now: DateTime<Local>) -> DateTime<Local> {
        match &self.kind {
            RuleKind::Every { interval_secs } => now + ChronoDuration::seconds(*interval_secs as i64),
            RuleKind::DailyAt { hour, minute } => next_at_time(now, *hour, *minute, false),
            RuleKind::WeekdaysAt { hour, minute } => next_at_time(now, *hour, *minute, true),
        }
    }
}

fn parse_time(input: &str) -> Option<(u32, u32)> {
    let (h, m) = input.trim().split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn next_at_time(now: DateTime<Local>, hour: u32, minute: u32, weekdays_only: bool) -> DateTime<Local> {
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
    let mut candidate = now
        .with_time(target_time)
        .single()
        .unwrap_or(now);

    if candidate <= now {
        candidate += ChronoDuration::days(1);
    }
    if weekdays_only {
        while matches!(candidate.weekday(), chrono::Weekday::Sat | chrono::Weekday::Sun) {
            candidate += ChronoDuration::days(1);
        }
    }
    candidate
}

/// A schedule bound to a prompt
#[derive(Debug, Clone)]
pub struct Schedule {
    pub rule: ScheduleRule,
    pub prompt: String,
    pub options: SubmitOptions,
}

/// Fires scheduled submissions into the router
pub struct Scheduler {
    schedules: Vec<(Schedule, DateTime<Local>)>,
    router: TaskRouter,
}

impl Scheduler {
    pub fn new(router: TaskRouter, schedules: Vec<Schedule>) -> Self {
        let now = Local::now();
        let schedules = schedules
            .into_iter()
            .map(|s| {
                let next = s.rule.next_fire(now);
                (s, next)
            })
            .collect();
        Self { schedules, router }
    }

    /// Tick until cancelled, submitting any schedule whose time has come
    pub async fn run(mut self, cancel: CancelToken) {
        info!(count = self.schedules.len(), "Scheduler started");
        let tick = std::time::Duration::from_secs(15);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = cancel.cancelled() => break,
            }

            let now = Local::now();
            for (schedule, next_at) in &mut self.schedules {
                if now < *next_at {
                    continue;
                }
                info!(pattern = %schedule.rule.original, "Schedule fired");
                match self.router.submit(&schedule.prompt, schedule.options.clone()).await {
                    Ok(task_id) => info!(%task_id, "Scheduled task submitted"),
                    Err(e) => warn!(error = %e, "Scheduled submission failed"),
                }
                *next_at = schedule.rule.next_fire(now);
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).single().unwrap()
    }

    #[test]
    fn test_parse_vocabulary() {
        assert_eq!(
            ScheduleRule::parse("every hour").unwrap().kind,
            RuleKind::Every { interval_secs: 3600 }
        );
        assert_eq!(
            ScheduleRule::parse("Every Day").unwrap().kind,
            RuleKind::Every { interval_secs: 86400 }
        );
        assert_eq!(
            ScheduleRule::parse("every morning").unwrap().kind,
            RuleKind::DailyAt { hour: 9, minute: 0 }
        );
        assert_eq!(
            ScheduleRule::parse("daily at 14:30").unwrap().kind,
            RuleKind::DailyAt { hour: 14, minute: 30 }
        );
        assert_eq!(
            ScheduleRule::parse("weekdays at 08:15").unwrap().kind,
            RuleKind::WeekdaysAt { hour: 8, minute: 15 }
        );
    }

    #[test]
    fn test_unrecognised_pattern_fails_explicitly() {
        assert!(matches!(
            ScheduleRule::parse("whenever you feel like it"),
            Err(ScheduleParseError::Unrecognised(_))
        ));
        assert!(matches!(
            ScheduleRule::parse("daily at 25:00"),
            Err(ScheduleParseError::InvalidTime(_))
        ));
    }

    #[test]
    fn test_original_phrase_preserved() {
        let rule = ScheduleRule::parse("Every Morning").unwrap();
        assert_eq!(rule.original, "Every Morning");
    }

    #[test]
    fn test_next_fire_interval() {
        let rule = ScheduleRule::parse("every hour").unwrap();
        // 2026-07-01 is a Wednesday
        let now = at(2026, 7, 1, 10, 0);
        assert_eq!(rule.next_fire(now), at(2026, 7, 1, 11, 0));
    }

    #[test]
    fn test_next_fire_daily_before_and_after() {
        let rule = ScheduleRule::parse("daily at 14:30").unwrap();
        let before = at(2026, 7, 1, 10, 0);
        assert_eq!(rule.next_fire(before), at(2026, 7, 1, 14, 30));

        let after = at(2026, 7, 1, 15, 0);
        assert_eq!(rule.next_fire(after), at(2026, 7, 2, 14, 30));
    }

    #[test]
    fn test_next_fire_weekdays_skips_weekend() {
        let rule = ScheduleRule::parse("weekdays at 09:00").unwrap();
        // 2026-07-03 is a Friday
        let friday_late = at(2026, 7, 3, 12, 0);
        // Saturday and Sunday are skipped
        assert_eq!(rule.next_fire(friday_late), at(2026, 7, 6, 9, 0));
    }
}
