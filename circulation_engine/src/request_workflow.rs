use chrono::{DateTime, Utc};

use crate::api::{
    BookId, Loan, NewReservationRequest, PatronId, RequestId, Reservation, ReservationRequest,
};
use crate::error::CirculationError;
use crate::inventory_ledger::InventoryLedger;
use crate::loan_desk::LoanDesk;
use crate::notifications::messages;
use crate::reservation_queue::ReservationQueueManager;
use crate::state::{Lifecycle, RequestState};
use crate::store::StoreError;
use crate::unit_of_work::UnitOfWork;

/// Moderated intake: a patron asks, a librarian decides.
#[derive(Debug, Clone, Copy)]
pub struct ReservationRequestWorkflow {
    queue: ReservationQueueManager,
    desk: LoanDesk,
    ledger: InventoryLedger,
}

impl ReservationRequestWorkflow {
    pub fn new(queue: ReservationQueueManager, desk: LoanDesk) -> Self {
        Self {
            queue,
            desk,
            ledger: InventoryLedger,
        }
    }

    pub async fn submit(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        patron_id: PatronId,
        notes: String,
        now: DateTime<Utc>,
    ) -> Result<ReservationRequest, CirculationError> {
        self.ledger.lock(unit, book_id).await?;

        if unit
            .store()
            .find_active_reservation(book_id, patron_id)
            .await?
            .is_some()
        {
            return Err(CirculationError::DuplicateActiveReservation { book_id, patron_id });
        }
        if unit
            .store()
            .find_pending_request(book_id, patron_id)
            .await?
            .is_some()
        {
            return Err(CirculationError::DuplicatePendingRequest { book_id, patron_id });
        }

        let request = match unit
            .store()
            .insert_request(NewReservationRequest {
                book_id,
                patron_id,
                submitted_at: now,
                notes,
            })
            .await
        {
            Err(StoreError::UniqueViolation(_)) => {
                return Err(CirculationError::DuplicatePendingRequest { book_id, patron_id })
            }
            other => other?,
        };
        tracing::info!(
            request_id = request.request_id,
            book_id,
            patron_id,
            "Reservation request submitted"
        );
        Ok(request)
    }

    /// Approves the request and queues the reservation in one go.
    /// When the reservation cannot be created the error is returned and the
    /// caller rolls the unit back, leaving the request pending.
    pub async fn approve(
        &self,
        unit: &mut UnitOfWork,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Reservation, CirculationError> {
        let mut request = self.locked_request(unit, request_id).await?;
        request.status = request.status.transition_to(RequestState::Approved)?;
        unit.store().update_request(&request).await?;

        let reservation = self
            .queue
            .create(
                unit,
                request.book_id,
                request.patron_id,
                request.notes.clone(),
                now,
            )
            .await?;
        tracing::info!(
            request_id,
            reservation_id = reservation.reservation_id,
            "Reservation request approved"
        );
        Ok(reservation)
    }

    /// Approves the request by lending a copy from the shelf straight away.
    /// Fails with `InsufficientCopies` when the shelf is empty, the request
    /// then stays pending once the caller rolls back.
    pub async fn approve_with_loan(
        &self,
        unit: &mut UnitOfWork,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Loan, CirculationError> {
        let mut request = self.locked_request(unit, request_id).await?;
        request.status = request.status.transition_to(RequestState::Approved)?;
        unit.store().update_request(&request).await?;

        let (book, loan) = self
            .desk
            .lend(unit, request.book_id, request.patron_id, None, now)
            .await?;
        unit.notify(
            request.patron_id,
            messages::request_issued(&book.title, loan.due_at),
        );
        tracing::info!(
            request_id,
            loan_id = loan.loan_id,
            "Reservation request approved with a loan"
        );
        Ok(loan)
    }

    pub async fn reject(
        &self,
        unit: &mut UnitOfWork,
        request_id: RequestId,
    ) -> Result<ReservationRequest, CirculationError> {
        let mut request = self.locked_request(unit, request_id).await?;
        request.status = request.status.transition_to(RequestState::Rejected)?;
        unit.store().update_request(&request).await?;

        let book = self.ledger.book(unit, request.book_id).await?;
        unit.notify(request.patron_id, messages::request_rejected(&book.title));
        tracing::info!(request_id, "Reservation request rejected");
        Ok(request)
    }

    /// Patron withdraws their own pending request
    pub async fn cancel(
        &self,
        unit: &mut UnitOfWork,
        request_id: RequestId,
        patron_id: PatronId,
    ) -> Result<ReservationRequest, CirculationError> {
        let mut request = match self.locked_request(unit, request_id).await {
            Err(CirculationError::RequestNotFound(_)) => {
                return Err(CirculationError::RequestNotFoundOrNotCancellable(request_id))
            }
            other => other?,
        };
        if request.status != RequestState::Pending || request.patron_id != patron_id {
            return Err(CirculationError::RequestNotFoundOrNotCancellable(
                request_id,
            ));
        }
        request.status = request.status.transition_to(RequestState::Cancelled)?;
        unit.store().update_request(&request).await?;
        tracing::info!(request_id, patron_id, "Reservation request cancelled");
        Ok(request)
    }

    pub async fn pending(
        &self,
        unit: &mut UnitOfWork,
    ) -> Result<Vec<ReservationRequest>, CirculationError> {
        Ok(unit.store().pending_requests().await?)
    }

    /// Reads the request again after taking its book lock
    async fn locked_request(
        &self,
        unit: &mut UnitOfWork,
        request_id: RequestId,
    ) -> Result<ReservationRequest, CirculationError> {
        let book_id = unit
            .store()
            .get_request(request_id)
            .await?
            .ok_or(CirculationError::RequestNotFound(request_id))?
            .book_id;
        self.ledger.lock(unit, book_id).await?;
        unit.store()
            .get_request(request_id)
            .await?
            .ok_or(CirculationError::RequestNotFound(request_id))
    }
}
