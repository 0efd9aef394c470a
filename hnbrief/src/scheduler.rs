use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::select;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::crawler::Crawler;
use crate::digest::DigestPublisher;
use crate::mailer::DistributionReport;

pub const DEFAULT_CRAWL_COUNT: usize = 30;

/// Parse "HH:MM" trigger times, sorted and deduplicated.
pub fn parse_times(times: &[String]) -> Result<Vec<NaiveTime>> {
    let mut parsed = times
        .iter()
        .map(|t| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .with_context(|| format!("invalid scheduler time '{}', expected HH:MM", t))
        })
        .collect::<Result<Vec<_>>>()?;
    parsed.sort();
    parsed.dedup();
    Ok(parsed)
}

/// First trigger strictly after `now`, wrapping to the next day.
pub fn next_run_after(now: DateTime<Utc>, times: &[NaiveTime]) -> Option<DateTime<Utc>> {
    let today = now.date_naive();
    let tomorrow = today + ChronoDuration::days(1);
    times
        .iter()
        .map(|t| today.and_time(*t).and_utc())
        .find(|candidate| *candidate > now)
        .or_else(|| times.first().map(|t| tomorrow.and_time(*t).and_utc()))
}

/// Held for the duration of a run; releases the job on drop.
pub struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub crawled: usize,
    /// Set when the crawl failed; the digest is still published from stored stories
    pub crawl_error: Option<String>,
    pub distribution: DistributionReport,
}

/// The daily crawl + publish job, shared by the scheduler and the HTTP routes.
pub struct DailyJob {
    crawler: Arc<Crawler>,
    publisher: Arc<DigestPublisher>,
    crawl_count: usize,
    running: AtomicBool,
}

impl DailyJob {
    pub fn new(crawler: Arc<Crawler>, publisher: Arc<DigestPublisher>, crawl_count: usize) -> Self {
        Self {
            crawler,
            publisher,
            crawl_count,
            running: AtomicBool::new(false),
        }
    }

    pub fn crawler(&self) -> &Crawler {
        &self.crawler
    }

    pub fn publisher(&self) -> &DigestPublisher {
        &self.publisher
    }

    /// Claim the job. `None` while another run holds it.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(&self.running))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Crawl then publish, or `Ok(None)` if a run is already in progress.
    ///
    /// A failed crawl does not hold back the digest; only a publish failure is an
    /// error.
    pub async fn run_once(&self) -> Result<Option<RunReport>> {
        let Some(_guard) = self.try_begin() else {
            warn!("daily job already running, skipping this trigger");
            return Ok(None);
        };

        info!(count = self.crawl_count, "daily job: crawling");
        let (crawled, crawl_error) = match self.crawler.crawl(self.crawl_count).await {
            Ok(results) => (results.len(), None),
            Err(e) => {
                error!(%e, "daily job: crawl failed, publishing stored stories");
                (0, Some(e.to_string()))
            }
        };

        info!(crawled, "daily job: publishing digest");
        let distribution = self.publisher.publish().await.context("digest publish failed")?;

        Ok(Some(RunReport {
            crawled,
            crawl_error,
            distribution,
        }))
    }
}

/// Fire the daily job at each configured time until `shutdown` is notified.
///
/// Every trigger runs on its own task so a slow run never delays the next tick.
pub async fn run_scheduler(job: Arc<DailyJob>, times: Vec<NaiveTime>, shutdown: Arc<Notify>) -> Result<()> {
    if times.is_empty() {
        return Err(anyhow!("scheduler has no trigger times configured"));
    }
    info!(?times, "scheduler: started");

    loop {
        let now = Utc::now();
        let Some(next) = next_run_after(now, &times) else {
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next = %next, "scheduler: next run");

        select! {
            _ = tokio::time::sleep(wait) => {
                let job = job.clone();
                tokio::spawn(async move {
                    match job.run_once().await {
                        Ok(Some(report)) => info!(
                            crawled = report.crawled,
                            crawl_failed = report.crawl_error.is_some(),
                            sent = report.distribution.sent,
                            failed = report.distribution.failed,
                            "scheduler: run finished"
                        ),
                        Ok(None) => {}
                        Err(e) => error!(error = %format!("{:#}", e), "scheduler: run failed"),
                    }
                });
            },
            _ = shutdown.notified() => {
                info!("scheduler: shutdown requested, exiting loop");
                break;
            }
        }
    }

    info!("scheduler: stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn times(list: &[&str]) -> Vec<NaiveTime> {
        parse_times(&list.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn parses_and_sorts_times() {
        let parsed = times(&["18:30", "06:00", "18:30"]);
        assert_eq!(
            parsed,
            vec![
                NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(18, 30, 0).unwrap()
            ]
        );
        assert!(parse_times(&["25:00".to_string()]).is_err());
        assert!(parse_times(&["noon".to_string()]).is_err());
    }

    #[test]
    fn next_run_same_day() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let next = next_run_after(now, &times(&["06:00", "18:30"])).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 18, 30, 0).unwrap());
    }

    #[test]
    fn next_run_wraps_past_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        let next = next_run_after(now, &times(&["06:00", "18:30"])).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 6, 0, 0).unwrap());
    }

    #[test]
    fn trigger_at_exact_time_moves_on() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        let next = next_run_after(now, &times(&["06:00"])).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 6, 0, 0).unwrap());
    }

    #[test]
    fn no_times_no_run() {
        assert!(next_run_after(Utc::now(), &[]).is_none());
    }
}
