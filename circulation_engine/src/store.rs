pub use in_memory_store::InMemoryCirculationStore;
#[cfg(test)]
pub use in_memory_store::FailPoint;
pub use postgres_store::{PostgresCirculationStore, PostgresCirculationStoreConfig};

use chrono::{DateTime, Utc};

use crate::api::{
    Book, BookId, Fine, FineId, Loan, LoanId, NewBook, NewFine, NewLoan, NewPayment,
    NewReservation, NewReservationRequest, PatronId, Payment, Priority, RequestId, Reservation,
    ReservationId, ReservationRequest,
};

mod in_memory_store;
mod postgres_store;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Corrupted row: {0}")]
    Corrupted(String),

    #[error("Transaction already finished")]
    TransactionClosed,

    #[error("Other error {0}")]
    Other(String),
}

/// Entry point to the persistent circulation state.
#[async_trait::async_trait]
pub trait CirculationStore: Send + Sync {
    /// Opens a transaction, every multi-step operation runs inside one
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// Row-level access to the circulation tables inside one transaction.
///
/// Nothing is visible to other transactions until [`StoreTransaction::commit`].
/// Dropping the transaction without committing discards every write.
#[async_trait::async_trait]
pub trait StoreTransaction: Send {
    /// Adds book to the catalog with all copies available
    async fn add_book(&mut self, book: NewBook) -> Result<Book, StoreError>;
    async fn get_book(&mut self, book_id: BookId) -> Result<Option<Book>, StoreError>;
    /// Reads the book and holds its lock until the transaction ends,
    /// this is the serialization point for everything touching the book's queue
    async fn lock_book(&mut self, book_id: BookId) -> Result<Option<Book>, StoreError>;
    async fn update_copies(
        &mut self,
        book_id: BookId,
        total_copies: i32,
        available_copies: i32,
    ) -> Result<(), StoreError>;
    /// Books with at least one free copy and a non-empty queue
    async fn books_awaiting_fulfillment(&mut self) -> Result<Vec<BookId>, StoreError>;

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> Result<Reservation, StoreError>;
    async fn get_reservation(
        &mut self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError>;
    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError>;
    /// Active reservations of the book ordered by priority
    async fn active_reservations(&mut self, book_id: BookId)
        -> Result<Vec<Reservation>, StoreError>;
    async fn find_active_reservation(
        &mut self,
        book_id: BookId,
        patron_id: PatronId,
    ) -> Result<Option<Reservation>, StoreError>;
    /// Decrements the priority of every active reservation of the book
    /// positioned after `removed_priority`, returns number of shifted rows
    async fn shift_priorities_after(
        &mut self,
        book_id: BookId,
        removed_priority: Priority,
    ) -> Result<u64, StoreError>;
    /// Active reservations whose `expires_at` is strictly before `now`
    async fn expired_reservation_ids(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, StoreError>;
    async fn patron_reservations(
        &mut self,
        patron_id: PatronId,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn insert_request(
        &mut self,
        request: NewReservationRequest,
    ) -> Result<ReservationRequest, StoreError>;
    async fn get_request(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<ReservationRequest>, StoreError>;
    async fn update_request(&mut self, request: &ReservationRequest) -> Result<(), StoreError>;
    async fn find_pending_request(
        &mut self,
        book_id: BookId,
        patron_id: PatronId,
    ) -> Result<Option<ReservationRequest>, StoreError>;
    /// Pending requests, oldest first
    async fn pending_requests(&mut self) -> Result<Vec<ReservationRequest>, StoreError>;

    async fn insert_loan(&mut self, loan: NewLoan) -> Result<Loan, StoreError>;
    async fn get_loan(&mut self, loan_id: LoanId) -> Result<Option<Loan>, StoreError>;
    async fn update_loan(&mut self, loan: &Loan) -> Result<(), StoreError>;
    /// Unreturned loans whose `due_at` is strictly before `now`
    async fn loans_past_due(&mut self, now: DateTime<Utc>) -> Result<Vec<Loan>, StoreError>;
    async fn patron_loans(&mut self, patron_id: PatronId) -> Result<Vec<Loan>, StoreError>;

    async fn insert_fine(&mut self, fine: NewFine) -> Result<Fine, StoreError>;
    async fn get_fine(&mut self, fine_id: FineId) -> Result<Option<Fine>, StoreError>;
    async fn update_fine(&mut self, fine: &Fine) -> Result<(), StoreError>;
    async fn fine_for_loan(&mut self, loan_id: LoanId) -> Result<Option<Fine>, StoreError>;
    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment, StoreError>;
    async fn payments_for_fine(&mut self, fine_id: FineId) -> Result<Vec<Payment>, StoreError>;

    /// Marks a point the transaction can be rolled back to without abandoning it
    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;
    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
