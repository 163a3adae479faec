use rust_decimal::Decimal;

use crate::api::{BookId, FineId, LoanId, PatronId, RequestId, ReservationId};
use crate::state::TransitionError;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller mistake, retrying the same call fails again
    Validation,
    /// Lost a race on shared queue state, safe to retry with backoff
    Consistency,
    /// Store failure, the whole unit was rolled back
    Transactional,
}

#[derive(Debug, thiserror::Error)]
pub enum CirculationError {
    #[error("Patron {patron_id} already holds an active reservation for book {book_id}")]
    DuplicateActiveReservation { book_id: BookId, patron_id: PatronId },

    #[error("Patron {patron_id} already has a pending reservation request for book {book_id}")]
    DuplicatePendingRequest { book_id: BookId, patron_id: PatronId },

    #[error("Reservation {0} not found or cannot be cancelled")]
    NotFoundOrNotCancellable(ReservationId),

    #[error("Reservation request {0} not found or cannot be cancelled")]
    RequestNotFoundOrNotCancellable(RequestId),

    #[error("No copies of book {0} available")]
    InsufficientCopies(BookId),

    #[error("Book {0} already has all of its copies on the shelf")]
    CopiesExceedTotal(BookId),

    #[error("Invalid number of copies {0}")]
    InvalidCopyCount(i32),

    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("Reservation request {0} not found")]
    RequestNotFound(RequestId),

    #[error("Loan {0} not found")]
    LoanNotFound(LoanId),

    #[error("Fine {0} not found")]
    FineNotFound(FineId),

    #[error("Loan {0} already has a fine recorded")]
    FineAlreadyRecorded(LoanId),

    #[error("Invalid fine amount {0}")]
    InvalidFineAmount(Decimal),

    #[error("Invalid payment amount {0}")]
    InvalidPaymentAmount(Decimal),

    #[error("Payment of {amount} exceeds outstanding {outstanding} on fine {fine_id}")]
    PaymentExceedsOutstanding {
        fine_id: FineId,
        amount: Decimal,
        outstanding: Decimal,
    },

    #[error("Nothing to fulfill for book {0}")]
    NothingToFulfill(BookId),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Reservation queue of book {0} is not densely numbered")]
    QueueInconsistent(BookId),

    #[error("Store failure {0}")]
    Store(#[from] StoreError),
}

impl CirculationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::QueueInconsistent(_) => ErrorKind::Consistency,
            Self::Store(_) => ErrorKind::Transactional,
            _ => ErrorKind::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Consistency
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BookNotFound(_)
                | Self::RequestNotFound(_)
                | Self::LoanNotFound(_)
                | Self::FineNotFound(_)
                | Self::NotFoundOrNotCancellable(_)
                | Self::RequestNotFoundOrNotCancellable(_)
        )
    }
}
