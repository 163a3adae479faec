use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::api::{
    Book, BookId, DrainReport, FineId, FulfillmentResult, Loan, LoanClosure, LoanId, PatronId,
    PaymentReceipt, RequestId, Reservation, ReservationId, ReservationRequest, SweepReport,
};
use crate::config::CirculationPolicy;
use crate::error::CirculationError;
use crate::expiration_sweeper::ExpirationSweeper;
use crate::fines::FineCalculator;
use crate::fulfillment::FulfillmentCoordinator;
use crate::inventory_ledger::InventoryLedger;
use crate::loan_desk::LoanDesk;
use crate::notifications::{dispatch, NotificationSink};
use crate::request_workflow::ReservationRequestWorkflow;
use crate::reservation_queue::ReservationQueueManager;
use crate::store::CirculationStore;
use crate::unit_of_work::UnitOfWork;

/// Entry point of the engine.
///
/// Every operation runs in its own unit of work: committed on success,
/// rolled back on error. Notifications of a unit are delivered only
/// after its commit.
pub struct Circulation {
    store: Arc<dyn CirculationStore>,
    notifications: Arc<dyn NotificationSink>,
    ledger: InventoryLedger,
    queue: ReservationQueueManager,
    requests: ReservationRequestWorkflow,
    fulfillment: FulfillmentCoordinator,
    sweeper: ExpirationSweeper,
    fines: FineCalculator,
    desk: LoanDesk,
}

impl Circulation {
    pub fn new(
        store: Arc<dyn CirculationStore>,
        notifications: Arc<dyn NotificationSink>,
        policy: &CirculationPolicy,
    ) -> Self {
        let queue = ReservationQueueManager::new(policy.hold_period());
        let fulfillment =
            FulfillmentCoordinator::new(queue, policy.loan_period(), policy.collection_window());
        Self {
            store,
            notifications,
            ledger: InventoryLedger,
            queue,
            requests: ReservationRequestWorkflow::new(queue, LoanDesk::new(policy.loan_period())),
            fulfillment,
            sweeper: ExpirationSweeper::new(queue),
            fines: FineCalculator::new(policy.fine_rate_per_day, fulfillment),
            desk: LoanDesk::new(policy.loan_period()),
        }
    }

    async fn begin(&self) -> Result<UnitOfWork, CirculationError> {
        Ok(UnitOfWork::begin(self.store.as_ref()).await?)
    }

    async fn finish<T>(
        &self,
        unit: UnitOfWork,
        result: Result<T, CirculationError>,
    ) -> Result<T, CirculationError> {
        match result {
            Ok(value) => {
                let notifications = unit.commit().await?;
                dispatch(self.notifications.as_ref(), notifications).await;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = unit.rollback().await {
                    tracing::error!("Failed to roll back unit: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn add_book(
        &self,
        title: String,
        total_copies: i32,
    ) -> Result<Book, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.ledger.add_book(&mut unit, title, total_copies).await;
        self.finish(unit, result).await
    }

    pub async fn get_book(&self, book_id: BookId) -> Result<Book, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.ledger.book(&mut unit, book_id).await;
        self.finish(unit, result).await
    }

    /// New copies go to the waiting patrons before landing on the shelf
    #[tracing::instrument(skip(self))]
    pub async fn add_copies(&self, book_id: BookId, count: i32) -> Result<Book, CirculationError> {
        let mut unit = self.begin().await?;
        let result = async {
            self.ledger.add_copies(&mut unit, book_id, count).await?;
            self.fulfillment
                .drain(&mut unit, book_id, Utc::now())
                .await?;
            self.ledger.book(&mut unit, book_id).await
        }
        .await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_reservation(
        &self,
        book_id: BookId,
        patron_id: PatronId,
        notes: String,
    ) -> Result<Reservation, CirculationError> {
        let now = Utc::now();
        let mut unit = self.begin().await?;
        let result = async {
            let reservation = self
                .queue
                .create(&mut unit, book_id, patron_id, notes, now)
                .await?;
            self.drain_behind(&mut unit, reservation, now).await
        }
        .await;
        self.finish(unit, result).await
    }

    /// A reservation joining a queue with copies on the shelf is served in
    /// the same unit, the returned value reflects that
    async fn drain_behind(
        &self,
        unit: &mut UnitOfWork,
        reservation: Reservation,
        now: DateTime<Utc>,
    ) -> Result<Reservation, CirculationError> {
        self.fulfillment.drain(unit, reservation.book_id, now).await?;
        Ok(unit
            .store()
            .get_reservation(reservation.reservation_id)
            .await?
            .unwrap_or(reservation))
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        patron_id: PatronId,
    ) -> Result<Reservation, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.queue.cancel(&mut unit, reservation_id, patron_id).await;
        self.finish(unit, result).await
    }

    pub async fn next_in_queue(
        &self,
        book_id: BookId,
    ) -> Result<Option<Reservation>, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.queue.next_in_queue(&mut unit, book_id).await;
        self.finish(unit, result).await
    }

    pub async fn queue(&self, book_id: BookId) -> Result<Vec<Reservation>, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.queue.queue(&mut unit, book_id).await;
        self.finish(unit, result).await
    }

    pub async fn patron_reservations(
        &self,
        patron_id: PatronId,
    ) -> Result<Vec<Reservation>, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.queue.patron_reservations(&mut unit, patron_id).await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn submit_request(
        &self,
        book_id: BookId,
        patron_id: PatronId,
        notes: String,
    ) -> Result<ReservationRequest, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self
            .requests
            .submit(&mut unit, book_id, patron_id, notes, Utc::now())
            .await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn approve_request(
        &self,
        request_id: RequestId,
    ) -> Result<Reservation, CirculationError> {
        let now = Utc::now();
        let mut unit = self.begin().await?;
        let result = async {
            let reservation = self.requests.approve(&mut unit, request_id, now).await?;
            self.drain_behind(&mut unit, reservation, now).await
        }
        .await;
        self.finish(unit, result).await
    }

    /// Approves the request by lending a copy from the shelf
    #[tracing::instrument(skip(self))]
    pub async fn issue_request(&self, request_id: RequestId) -> Result<Loan, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self
            .requests
            .approve_with_loan(&mut unit, request_id, Utc::now())
            .await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn reject_request(
        &self,
        request_id: RequestId,
    ) -> Result<ReservationRequest, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.requests.reject(&mut unit, request_id).await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_request(
        &self,
        request_id: RequestId,
        patron_id: PatronId,
    ) -> Result<ReservationRequest, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.requests.cancel(&mut unit, request_id, patron_id).await;
        self.finish(unit, result).await
    }

    pub async fn pending_requests(&self) -> Result<Vec<ReservationRequest>, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.requests.pending(&mut unit).await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn try_fulfill(&self, book_id: BookId) -> Result<FulfillmentResult, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self
            .fulfillment
            .try_fulfill(&mut unit, book_id, Utc::now())
            .await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn drain_availability(&self, book_id: BookId) -> Result<DrainReport, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.fulfillment.drain(&mut unit, book_id, Utc::now()).await;
        self.finish(unit, result).await
    }

    pub async fn on_book_returned(&self, book_id: BookId) -> Result<DrainReport, CirculationError> {
        self.drain_availability(book_id).await
    }

    pub async fn on_availability_increased(
        &self,
        book_id: BookId,
    ) -> Result<DrainReport, CirculationError> {
        self.drain_availability(book_id).await
    }

    /// Expires every reservation due before `now`, one unit per reservation
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.sweeper.candidates(&mut unit, now).await;
        let candidates = self.finish(unit, result).await?;

        let mut report = SweepReport::default();
        for reservation_id in candidates {
            let mut unit = self.begin().await?;
            let result = self.sweeper.expire_one(&mut unit, reservation_id, now).await;
            match self.finish(unit, result).await {
                Ok(Some(_)) => report.expired += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(reservation_id, "Failed to expire reservation: {}", e);
                    report.failed += 1;
                }
            }
        }
        if report.expired > 0 || report.failed > 0 {
            tracing::info!(
                expired = report.expired,
                failed = report.failed,
                "Expiration sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn run_expiration_sweep(&self) -> Result<SweepReport, CirculationError> {
        self.sweep_expired(Utc::now()).await
    }

    /// Drains every book that has a free copy and a waiting patron
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_availability(&self) -> Result<DrainReport, CirculationError> {
        let mut unit = self.begin().await?;
        let result = unit
            .store()
            .books_awaiting_fulfillment()
            .await
            .map_err(CirculationError::from);
        let books = self.finish(unit, result).await?;

        let mut total = DrainReport::default();
        for book_id in books {
            match self.drain_availability(book_id).await {
                Ok(report) => {
                    total.processed += report.processed;
                    total.loans_created += report.loans_created;
                    total.degraded += report.degraded;
                }
                Err(e) => tracing::error!(book_id, "Failed to reconcile availability: {}", e),
            }
        }
        Ok(total)
    }

    #[tracing::instrument(skip(self))]
    pub async fn issue_book(
        &self,
        book_id: BookId,
        patron_id: PatronId,
        due_at: Option<DateTime<Utc>>,
    ) -> Result<Loan, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self
            .desk
            .issue_book(&mut unit, book_id, patron_id, due_at, Utc::now())
            .await;
        self.finish(unit, result).await
    }

    pub async fn patron_loans(&self, patron_id: PatronId) -> Result<Vec<Loan>, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.desk.patron_loans(&mut unit, patron_id).await;
        self.finish(unit, result).await
    }

    /// Closes the loan and hands the copy to the queue in the same unit
    #[tracing::instrument(skip(self))]
    pub async fn close_loan(
        &self,
        loan_id: LoanId,
        returned_at: Option<DateTime<Utc>>,
        override_fine_amount: Option<Decimal>,
    ) -> Result<LoanClosure, CirculationError> {
        let now = Utc::now();
        let mut unit = self.begin().await?;
        let result = self
            .fines
            .close_loan(
                &mut unit,
                loan_id,
                returned_at.unwrap_or(now),
                override_fine_amount,
                now,
            )
            .await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_payment(
        &self,
        fine_id: FineId,
        amount: Decimal,
        method: String,
        receipt_number: String,
    ) -> Result<PaymentReceipt, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self
            .fines
            .record_payment(
                &mut unit,
                fine_id,
                amount,
                method,
                receipt_number,
                Utc::now(),
            )
            .await;
        self.finish(unit, result).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn mark_overdue_loans(&self, now: DateTime<Utc>) -> Result<usize, CirculationError> {
        let mut unit = self.begin().await?;
        let result = self.fines.mark_overdue_loans(&mut unit, now).await;
        self.finish(unit, result).await.map(|loans| loans.len())
    }
}

#[cfg(test)]
mod tests_circulation {
    use chrono::Duration;
    use itertools::Itertools;
    use rust_decimal_macros::dec;

    use crate::notifications::InMemoryNotificationSink;
    use crate::state::{LoanState, RequestState, ReservationState};
    use crate::store::{FailPoint, InMemoryCirculationStore};

    use super::*;

    fn circulation() -> (Circulation, InMemoryCirculationStore, Arc<InMemoryNotificationSink>) {
        let store = InMemoryCirculationStore::new();
        let sink = Arc::new(InMemoryNotificationSink::new());
        let circulation = Circulation::new(
            Arc::new(store.clone()),
            sink.clone(),
            &CirculationPolicy::default(),
        );
        (circulation, store, sink)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    /// Concurrent reservations on an empty queue never share a priority
    /// 1. Book with no free copy
    /// 2. Two patrons reserve at the same time, repeated on several books
    /// 3. Every queue holds priorities {1, 2}
    async fn test_concurrent_reservations_get_distinct_priorities() {
        let (circulation, _, _) = circulation();
        let circulation = Arc::new(circulation);

        for _ in 0..20 {
            let book = circulation.add_book("Dune".to_string(), 0).await.unwrap();
            let handles = (1..=2)
                .map(|patron_id| {
                    let circulation = circulation.clone();
                    tokio::spawn(async move {
                        circulation
                            .create_reservation(book.book_id, patron_id, String::new())
                            .await
                    })
                })
                .collect_vec();
            let mut priorities = vec![];
            for handle in handles {
                priorities.push(handle.await.unwrap().unwrap().priority);
            }
            priorities.sort();
            assert_eq!(priorities, vec![1, 2]);
        }
    }

    #[tokio::test]
    /// Full return scenario through the facade
    /// 1. One copy lent to patron 1, patrons 2 and 3 wait
    /// 2. Patron 1 returns it three days late
    /// 3. Patron 2 gets the copy, patron 3 becomes first, shelf stays empty
    /// 4. Notifications are delivered after commit in order
    async fn test_return_hands_copy_to_next_patron() {
        let (circulation, _, sink) = circulation();
        let book = circulation.add_book("Dune".to_string(), 1).await.unwrap();
        let loan = circulation
            .issue_book(book.book_id, 1, Some(Utc::now() - Duration::days(3)))
            .await
            .unwrap();
        circulation
            .create_reservation(book.book_id, 2, String::new())
            .await
            .unwrap();
        circulation
            .create_reservation(book.book_id, 3, String::new())
            .await
            .unwrap();

        let closure = circulation.close_loan(loan.loan_id, None, None).await.unwrap();
        assert_eq!(closure.loan.status, LoanState::Returned);
        assert_eq!(closure.fine.map(|f| f.amount), Some(dec!(300)));
        assert_eq!(closure.drain.loans_created, 1);

        assert_eq!(circulation.get_book(book.book_id).await.unwrap().available_copies, 0);
        let queue = circulation.queue(book.book_id).await.unwrap();
        assert_eq!(
            queue.iter().map(|r| (r.patron_id, r.priority)).collect_vec(),
            vec![(3, 1)]
        );
        let patron_2_loans = circulation.patron_loans(2).await.unwrap();
        assert_eq!(patron_2_loans.len(), 1);
        assert!(patron_2_loans[0].reservation_id.is_some());

        assert_eq!(sink.sent_to(1).len(), 3);
        assert_eq!(sink.sent_to(2).len(), 2);
        assert!(sink.sent_to(2)[1].contains("automatically issued"));
    }

    #[tokio::test]
    /// Rolled back units deliver nothing
    /// 1. Patron submits a request and then reserves directly
    /// 2. Approval fails - request stays pending, no extra notification
    async fn test_failed_approval_sends_nothing() {
        let (circulation, _, sink) = circulation();
        let book = circulation.add_book("Ubik".to_string(), 0).await.unwrap();
        let request = circulation
            .submit_request(book.book_id, 4, String::new())
            .await
            .unwrap();
        circulation
            .create_reservation(book.book_id, 4, String::new())
            .await
            .unwrap();
        let delivered = sink.sent().len();

        assert!(matches!(
            circulation.approve_request(request.request_id).await,
            Err(CirculationError::DuplicateActiveReservation { .. })
        ));
        assert_eq!(sink.sent().len(), delivered);
        assert_eq!(
            circulation.pending_requests().await.unwrap()[0].status,
            RequestState::Pending
        );
        assert_eq!(circulation.queue(book.book_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    /// Sweep expires stale reservations and can be re-run safely
    /// 1. Three reservations, sweep a day after the hold period
    /// 2. All three expire, queue is empty, no loans exist
    /// 3. Second sweep with the same time changes nothing
    async fn test_sweep_is_idempotent() {
        let (circulation, _, sink) = circulation();
        let book = circulation.add_book("Solaris".to_string(), 0).await.unwrap();
        for patron_id in 1..=3 {
            circulation
                .create_reservation(book.book_id, patron_id, String::new())
                .await
                .unwrap();
        }
        let later = Utc::now() + Duration::days(8);

        let report = circulation.sweep_expired(later).await.unwrap();
        assert_eq!(report, SweepReport { expired: 3, failed: 0 });
        assert!(circulation.queue(book.book_id).await.unwrap().is_empty());
        assert!(circulation.patron_loans(1).await.unwrap().is_empty());
        let history = circulation.patron_reservations(3).await.unwrap();
        assert_eq!(history[0].status, ReservationState::Expired);

        let delivered = sink.sent().len();
        let report = circulation.sweep_expired(later).await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert_eq!(sink.sent().len(), delivered);

        assert_eq!(
            circulation.run_expiration_sweep().await.unwrap(),
            SweepReport::default()
        );
    }

    #[tokio::test]
    /// Availability events
    /// 1. Two patrons wait for a book without copies
    /// 2. Adding one copy issues it to the first patron right away
    /// 3. Copy put back directly in the store is picked up by reconciliation
    async fn test_availability_events_drain_queue() {
        let (circulation, store, _) = circulation();
        let book = circulation.add_book("Dune".to_string(), 0).await.unwrap();
        for patron_id in [1, 2] {
            circulation
                .create_reservation(book.book_id, patron_id, String::new())
                .await
                .unwrap();
        }

        let book = circulation.add_copies(book.book_id, 1).await.unwrap();
        assert_eq!((book.total_copies, book.available_copies), (1, 0));
        assert_eq!(circulation.patron_loans(1).await.unwrap().len(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.update_copies(book.book_id, 2, 1).await.unwrap();
        tx.commit().await.unwrap();

        let report = circulation.reconcile_availability().await.unwrap();
        assert_eq!(report.loans_created, 1);
        assert_eq!(circulation.patron_loans(2).await.unwrap().len(), 1);
        assert_eq!(
            circulation.on_availability_increased(book.book_id).await.unwrap(),
            DrainReport::default()
        );
        assert!(matches!(
            circulation.try_fulfill(book.book_id).await,
            Err(CirculationError::NothingToFulfill(..))
        ));
    }

    #[tokio::test]
    /// Degraded auto-issue is committed together with the return
    /// 1. Copy lent to patron 1, patron 2 waits, loan creation breaks
    /// 2. Return succeeds, patron 2 is asked to collect the copy
    /// 3. Copy stays on the shelf, patron 2 has no loan
    async fn test_degraded_fulfillment_is_committed() {
        let (circulation, store, sink) = circulation();
        let book = circulation.add_book("Dune".to_string(), 1).await.unwrap();
        let loan = circulation.issue_book(book.book_id, 1, None).await.unwrap();
        circulation
            .create_reservation(book.book_id, 2, String::new())
            .await
            .unwrap();
        store.fail_on(FailPoint::InsertLoan);

        let closure = circulation.close_loan(loan.loan_id, None, None).await.unwrap();
        assert_eq!(closure.fine, None);
        assert_eq!(closure.drain.degraded, 1);
        assert_eq!(circulation.get_book(book.book_id).await.unwrap().available_copies, 1);
        assert!(circulation.patron_loans(2).await.unwrap().is_empty());
        assert!(sink.sent_to(2)[1].starts_with("Good news!"));

        store.clear_fail_points();
        assert!(circulation.next_in_queue(book.book_id).await.unwrap().is_none());
    }

    #[tokio::test]
    /// Fines through the facade
    /// 1. Loan overdue by two days is marked by the overdue sweep
    /// 2. Return raises a 200 fine, paid in full
    async fn test_overdue_fine_and_payment() {
        let (circulation, _, _) = circulation();
        let book = circulation.add_book("Dune".to_string(), 1).await.unwrap();
        let loan = circulation
            .issue_book(book.book_id, 1, Some(Utc::now() - Duration::days(2)))
            .await
            .unwrap();

        assert_eq!(circulation.mark_overdue_loans(Utc::now()).await.unwrap(), 1);
        assert_eq!(
            circulation.patron_loans(1).await.unwrap()[0].status,
            LoanState::Overdue
        );

        let fine = circulation
            .close_loan(loan.loan_id, None, None)
            .await
            .unwrap()
            .fine
            .unwrap();
        let receipt = circulation
            .record_payment(fine.fine_id, dec!(200), "cash".to_string(), "R-9".to_string())
            .await
            .unwrap();
        assert_eq!(receipt.outstanding, Decimal::ZERO);
        assert_eq!(receipt.payment.amount, dec!(200));
    }

    #[tokio::test]
    /// Reserving a book that sits on the shelf lends it right away
    /// 1. Book with one copy, patron 1 reserves it
    /// 2. Reservation comes back fulfilled with a loan tied to it
    /// 3. Shelf and queue are empty
    /// 4. Patron 2 reserves next and waits at priority 1
    async fn test_reservation_on_free_copy_is_fulfilled() {
        let (circulation, _, sink) = circulation();
        let book = circulation.add_book("Dune".to_string(), 1).await.unwrap();

        let reservation = circulation
            .create_reservation(book.book_id, 1, String::new())
            .await
            .unwrap();
        assert_eq!(reservation.status, ReservationState::Fulfilled);
        assert!(reservation.fulfilled_at.is_some());
        let loans = circulation.patron_loans(1).await.unwrap();
        assert_eq!(loans.len(), 1);
        assert_eq!(loans[0].reservation_id, Some(reservation.reservation_id));
        assert_eq!(circulation.get_book(book.book_id).await.unwrap().available_copies, 0);
        assert!(circulation.queue(book.book_id).await.unwrap().is_empty());
        assert!(sink.sent_to(1)[1].contains("automatically issued"));

        let waiting = circulation
            .create_reservation(book.book_id, 2, String::new())
            .await
            .unwrap();
        assert_eq!((waiting.status, waiting.priority), (ReservationState::Active, 1));
    }

    #[tokio::test]
    /// Request approval on a stocked book
    /// 1. Approving into a reservation while a copy is free lends it at once
    /// 2. Approving with a loan issues the next copy directly
    /// 3. With the shelf empty the second kind of approval is refused and the request stays pending
    async fn test_request_approvals_use_free_copies() {
        let (circulation, _, sink) = circulation();
        let book = circulation.add_book("Ubik".to_string(), 2).await.unwrap();
        let mut requests = vec![];
        for patron_id in 1..=3 {
            requests.push(
                circulation
                    .submit_request(book.book_id, patron_id, String::new())
                    .await
                    .unwrap(),
            );
        }

        let reservation = circulation
            .approve_request(requests[0].request_id)
            .await
            .unwrap();
        assert_eq!(reservation.status, ReservationState::Fulfilled);
        assert_eq!(circulation.patron_loans(1).await.unwrap().len(), 1);

        let loan = circulation
            .issue_request(requests[1].request_id)
            .await
            .unwrap();
        assert_eq!((loan.patron_id, loan.reservation_id), (2, None));
        assert_eq!(circulation.get_book(book.book_id).await.unwrap().available_copies, 0);
        assert_eq!(sink.sent_to(2).len(), 1);

        assert!(matches!(
            circulation.issue_request(requests[2].request_id).await,
            Err(CirculationError::InsufficientCopies(..))
        ));
        let pending = circulation.pending_requests().await.unwrap();
        assert_eq!(pending.iter().map(|r| r.patron_id).collect_vec(), vec![3]);
        assert_eq!(sink.sent_to(3).len(), 0);
    }

    struct BrokenNotificationSink;

    #[async_trait::async_trait]
    impl NotificationSink for BrokenNotificationSink {
        async fn notify(&self, _patron_id: PatronId, _message: &str) -> anyhow::Result<()> {
            anyhow::bail!("mail server is down")
        }
    }

    #[tokio::test]
    /// Failed delivery does not undo committed work
    /// 1. Every notification fails
    /// 2. Issue, reservation and return all succeed
    /// 3. The copy went to the waiting patron and the queue moved on
    async fn test_failing_sink_keeps_committed_state() {
        let store = InMemoryCirculationStore::new();
        let circulation = Circulation::new(
            Arc::new(store.clone()),
            Arc::new(BrokenNotificationSink),
            &CirculationPolicy::default(),
        );
        let book = circulation.add_book("Dune".to_string(), 1).await.unwrap();
        let loan = circulation.issue_book(book.book_id, 1, None).await.unwrap();
        let reservation = circulation
            .create_reservation(book.book_id, 2, String::new())
            .await
            .unwrap();
        assert_eq!(
            circulation.queue(book.book_id).await.unwrap(),
            vec![reservation.clone()]
        );

        let closure = circulation.close_loan(loan.loan_id, None, None).await.unwrap();
        assert_eq!(closure.drain.loans_created, 1);
        assert_eq!(
            circulation.patron_reservations(2).await.unwrap()[0].status,
            ReservationState::Fulfilled
        );
        assert_eq!(circulation.patron_loans(2).await.unwrap().len(), 1);
        assert_eq!(
            circulation.patron_loans(1).await.unwrap()[0].status,
            LoanState::Returned
        );
        assert_eq!(circulation.get_book(book.book_id).await.unwrap().available_copies, 0);
    }
}
