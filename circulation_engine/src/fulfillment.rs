use chrono::{DateTime, Duration, Utc};

use crate::api::{Book, BookId, DrainReport, FulfillmentResult, Loan, NewLoan, Reservation};
use crate::error::CirculationError;
use crate::inventory_ledger::InventoryLedger;
use crate::notifications::messages;
use crate::reservation_queue::ReservationQueueManager;
use crate::state::{Lifecycle, ReservationState};
use crate::unit_of_work::UnitOfWork;

const AUTO_ISSUE_SAVEPOINT: &str = "auto_issue";

/// Turns free copies into loans for the head of the queue.
///
/// Auto-issue runs inside a savepoint of the caller's unit. If any step
/// fails the savepoint is rolled back and the reservation is still
/// fulfilled, but the patron is asked to collect the copy in person.
#[derive(Debug, Clone, Copy)]
pub struct FulfillmentCoordinator {
    loan_period: Duration,
    collection_window: Duration,
    queue: ReservationQueueManager,
    ledger: InventoryLedger,
}

impl FulfillmentCoordinator {
    pub fn new(
        queue: ReservationQueueManager,
        loan_period: Duration,
        collection_window: Duration,
    ) -> Self {
        Self {
            loan_period,
            collection_window,
            queue,
            ledger: InventoryLedger,
        }
    }

    pub async fn try_fulfill(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        now: DateTime<Utc>,
    ) -> Result<FulfillmentResult, CirculationError> {
        self.attempt(unit, book_id, now)
            .await?
            .ok_or(CirculationError::NothingToFulfill(book_id))
    }

    /// Fulfills reservations while copies and queue last.
    /// A degraded attempt ends the drain.
    pub async fn drain(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        now: DateTime<Utc>,
    ) -> Result<DrainReport, CirculationError> {
        let mut report = DrainReport::default();
        while let Some(result) = self.attempt(unit, book_id, now).await? {
            report.processed += 1;
            match result {
                FulfillmentResult::Fulfilled { .. } => report.loans_created += 1,
                FulfillmentResult::Degraded { .. } => {
                    report.degraded += 1;
                    break;
                }
            }
        }
        if report.processed > 0 {
            tracing::info!(
                book_id,
                processed = report.processed,
                loans_created = report.loans_created,
                "Availability drained"
            );
        }
        Ok(report)
    }

    /// `None` when there is no free copy or nobody is waiting
    async fn attempt(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        now: DateTime<Utc>,
    ) -> Result<Option<FulfillmentResult>, CirculationError> {
        let book = self.ledger.lock(unit, book_id).await?;
        if book.available_copies <= 0 {
            return Ok(None);
        }
        let Some(reservation) = self.queue.next_in_queue(unit, book_id).await? else {
            return Ok(None);
        };

        unit.savepoint(AUTO_ISSUE_SAVEPOINT).await?;
        match self.auto_issue(unit, &book, reservation.clone(), now).await {
            Ok((reservation, loan)) => {
                unit.release_savepoint(AUTO_ISSUE_SAVEPOINT).await?;
                tracing::info!(
                    reservation_id = reservation.reservation_id,
                    loan_id = loan.loan_id,
                    book_id,
                    patron_id = reservation.patron_id,
                    "Reservation auto-issued"
                );
                Ok(Some(FulfillmentResult::Fulfilled { reservation, loan }))
            }
            Err(e) => {
                tracing::warn!(
                    reservation_id = reservation.reservation_id,
                    book_id,
                    "Auto-issue failed, falling back to manual collection: {}",
                    e
                );
                unit.rollback_to_savepoint(AUTO_ISSUE_SAVEPOINT).await?;
                unit.release_savepoint(AUTO_ISSUE_SAVEPOINT).await?;
                let reservation = self
                    .hold_for_collection(unit, &book, reservation, now)
                    .await?;
                Ok(Some(FulfillmentResult::Degraded {
                    reservation,
                    reason: e.to_string(),
                }))
            }
        }
    }

    async fn auto_issue(
        &self,
        unit: &mut UnitOfWork,
        book: &Book,
        mut reservation: Reservation,
        now: DateTime<Utc>,
    ) -> Result<(Reservation, Loan), CirculationError> {
        reservation.status = reservation
            .status
            .transition_to(ReservationState::Fulfilled)?;
        reservation.fulfilled_at = Some(now);
        reservation.notified_at = Some(now);
        unit.store().update_reservation(&reservation).await?;

        let due_at = now + self.loan_period;
        let loan = unit
            .store()
            .insert_loan(NewLoan {
                book_id: book.book_id,
                patron_id: reservation.patron_id,
                reservation_id: Some(reservation.reservation_id),
                issued_at: now,
                due_at,
            })
            .await?;

        self.ledger.decrement(unit, book.book_id).await?;
        self.queue
            .renumber(unit, book.book_id, reservation.priority)
            .await?;

        unit.notify(
            reservation.patron_id,
            messages::auto_issued(&book.title, due_at),
        );
        Ok((reservation, loan))
    }

    async fn hold_for_collection(
        &self,
        unit: &mut UnitOfWork,
        book: &Book,
        mut reservation: Reservation,
        now: DateTime<Utc>,
    ) -> Result<Reservation, CirculationError> {
        reservation.fulfilled_at = Some(now);
        reservation.notified_at = Some(now);
        self.queue
            .leave_queue(unit, &mut reservation, ReservationState::Fulfilled)
            .await?;
        unit.notify(
            reservation.patron_id,
            messages::ready_for_collection(&book.title, self.collection_window.num_hours()),
        );
        Ok(reservation)
    }
}
