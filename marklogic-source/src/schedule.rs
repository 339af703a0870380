use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TriggerConfig;
use crate::error::{Error, Result};

/// Cron schedule evaluated in a fixed timezone.
#[derive(Debug, Clone)]
pub(crate) struct Trigger {
    schedule: Schedule,
    timezone: Tz,
}

impl Trigger {
    pub(crate) fn new(config: &TriggerConfig) -> Result<Self> {
        let schedule = Schedule::from_str(&config.schedule).map_err(|e| {
            Error::Schedule(format!("Invalid cron expression '{}': {e}", config.schedule))
        })?;
        let timezone = match config.timezone.as_deref() {
            None => Tz::UTC,
            Some(name) => name.parse::<Tz>().unwrap_or_else(|e| {
                warn!(timezone = name, %e, "Unknown timezone, falling back to UTC");
                Tz::UTC
            }),
        };
        Ok(Self { schedule, timezone })
    }

    /// Next fire time strictly after `after`.
    pub(crate) fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }
}

/// Invokes `tick` right away and then at every fire time of `trigger` until `cancel` is
/// cancelled or the schedule has no upcoming fire time. Returns the number of ticks.
pub(crate) async fn run_scheduled<F, Fut>(
    trigger: &Trigger,
    cancel: &CancellationToken,
    mut tick: F,
) -> u64
where
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticks = 0;
    let mut fire_time = Utc::now();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        tick(fire_time).await;
        ticks += 1;

        let Some(next) = trigger.next_after(Utc::now()) else {
            info!("Schedule has no upcoming fire time");
            break;
        };
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(next = %next, ?delay, "Waiting for the next run");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        fire_time = next;
    }
    ticks
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::TimeZone;

    use super::*;

    fn trigger(schedule: &str, timezone: Option<&str>) -> Result<Trigger> {
        Trigger::new(&TriggerConfig {
            schedule: schedule.to_string(),
            timezone: timezone.map(str::to_string),
        })
    }

    #[test]
    fn test_next_after() {
        let minutely = trigger("0 * * * * *", None).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 30).unwrap();
        assert_eq!(
            minutely.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 16, 0).unwrap())
        );
    }

    #[test]
    fn test_timezone() {
        // 02:00 in Berlin is 00:00 UTC during summer time
        let berlin = trigger("0 0 2 * * *", Some("Europe/Berlin")).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        assert_eq!(
            berlin.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 7, 2, 0, 0, 0).unwrap())
        );

        let fallback = trigger("0 0 2 * * *", Some("Mars/Olympus")).unwrap();
        assert_eq!(
            fallback.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 7, 2, 2, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_invalid_schedule() {
        assert!(matches!(
            trigger("every minute", None),
            Err(Error::Schedule(_))
        ));
    }

    #[tokio::test]
    async fn test_runs_immediately_and_stops_on_cancel() {
        let yearly = trigger("0 0 0 1 1 *", None).unwrap();
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            let count = Arc::clone(&count);
            async move {
                run_scheduled(&yearly, &cancel, |_| {
                    let count = Arc::clone(&count);
                    async move {
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let ticks = handle.await.unwrap();
        assert_eq!(ticks, 1);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_ticks_on_schedule() {
        let secondly = trigger("* * * * * *", None).unwrap();
        let cancel = CancellationToken::new();
        let count = AtomicU64::new(0);

        let ticks = tokio::time::timeout(
            Duration::from_secs(5),
            run_scheduled(&secondly, &cancel, |_| {
                if count.fetch_add(1, Ordering::Relaxed) == 1 {
                    cancel.cancel();
                }
                async {}
            }),
        )
        .await
        .unwrap();
        assert_eq!(ticks, 2);
    }
}
