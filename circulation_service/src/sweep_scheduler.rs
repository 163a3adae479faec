use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use opentelemetry_sdk::util::tokio_interval_stream;

use circulation_engine::{Circulation, CirculationError};

use crate::api::SweepResponse;

/// Expires stale reservations, then flags loans past their due date
pub async fn run_maintenance(
    circulation: &Circulation,
    now: DateTime<Utc>,
) -> Result<SweepResponse, CirculationError> {
    let report = circulation.sweep_expired(now).await?;
    let overdue_loans = circulation.mark_overdue_loans(now).await?;
    Ok(SweepResponse {
        expired: report.expired as u64,
        failed: report.failed as u64,
        overdue_loans: overdue_loans as u64,
    })
}

pub struct SweepScheduler {
    circulation: Arc<Circulation>,
    interval: Duration,
}

impl SweepScheduler {
    pub fn new(circulation: Arc<Circulation>, interval: Duration) -> Self {
        Self {
            circulation,
            interval,
        }
    }

    /// Never returns, a failed tick is logged and retried on the next one
    pub async fn start(self) {
        let mut ticks = tokio_interval_stream(self.interval);
        while ticks.next().await.is_some() {
            match run_maintenance(&self.circulation, Utc::now()).await {
                Ok(report) => tracing::info!(
                    expired = report.expired,
                    failed = report.failed,
                    overdue_loans = report.overdue_loans,
                    "Sweep finished"
                ),
                Err(err) => tracing::error!("Sweep failed {}", err),
            }
        }
    }
}

#[cfg(test)]
mod sweep_scheduler_tests {
    use chrono::Duration;

    use circulation_engine::notifications::InMemoryNotificationSink;
    use circulation_engine::store::InMemoryCirculationStore;
    use circulation_engine::CirculationPolicy;

    use super::*;

    #[tokio::test]
    /// One maintenance pass over a stale queue and a late loan
    /// 1. A reservation made with a zero hold period is already stale
    /// 2. A loan issued with a past due date is late
    /// 3. The pass expires the one and flags the other
    /// 4. A second pass expires nothing and only refreshes the late loan
    async fn test_run_maintenance() {
        let sink = Arc::new(InMemoryNotificationSink::new());
        let policy = CirculationPolicy {
            hold_period_days: 0,
            ..CirculationPolicy::default()
        };
        let circulation = Circulation::new(
            Arc::new(InMemoryCirculationStore::new()),
            sink.clone(),
            &policy,
        );
        let now = Utc::now();

        let empty = circulation.add_book("Solaris".to_string(), 0).await.unwrap();
        circulation
            .create_reservation(empty.book_id, 1, String::new())
            .await
            .unwrap();
        let shelf = circulation.add_book("Ubik".to_string(), 1).await.unwrap();
        circulation
            .issue_book(shelf.book_id, 2, Some(now - Duration::days(2)))
            .await
            .unwrap();

        let later = now + Duration::seconds(1);
        assert_eq!(
            run_maintenance(&circulation, later).await.unwrap(),
            SweepResponse {
                expired: 1,
                failed: 0,
                overdue_loans: 1,
            }
        );
        assert_eq!(
            run_maintenance(&circulation, later).await.unwrap(),
            SweepResponse {
                expired: 0,
                failed: 0,
                overdue_loans: 1,
            }
        );
        assert!(circulation.queue(empty.book_id).await.unwrap().is_empty());
        assert_eq!(sink.sent_to(1).len(), 2);
    }
}
