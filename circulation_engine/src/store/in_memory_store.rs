use std::collections::BTreeMap;
#[cfg(test)]
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api::{
    Book, BookId, Fine, FineId, Loan, LoanId, NewBook, NewFine, NewLoan, NewPayment,
    NewReservation, NewReservationRequest, PatronId, Payment, PaymentId, Priority, RequestId,
    Reservation, ReservationId, ReservationRequest,
};
use crate::state::{FineState, LoanState, RequestState, ReservationState};
use crate::store::{CirculationStore, StoreError, StoreTransaction};

#[derive(Default, Clone)]
struct Sequences {
    book: i32,
    reservation: i32,
    request: i32,
    loan: i32,
    fine: i32,
    payment: i32,
}

fn next_id(sequence: &mut i32) -> i32 {
    *sequence += 1;
    *sequence
}

#[derive(Default, Clone)]
struct CirculationTables {
    books: BTreeMap<BookId, Book>,
    reservations: BTreeMap<ReservationId, Reservation>,
    requests: BTreeMap<RequestId, ReservationRequest>,
    loans: BTreeMap<LoanId, Loan>,
    fines: BTreeMap<FineId, Fine>,
    payments: BTreeMap<PaymentId, Payment>,
    sequences: Sequences,
}

/// Operations that can be forced to fail to exercise rollback paths
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    InsertLoan,
}

/// Keeps all tables behind a single async mutex.
///
/// A transaction owns the mutex guard for its whole lifetime and works on a
/// copy of the tables, so transactions are fully serialized and a rollback
/// is simply dropping the copy.
#[derive(Default, Clone)]
pub struct InMemoryCirculationStore {
    tables: Arc<Mutex<CirculationTables>>,
    #[cfg(test)]
    fail_points: Arc<parking_lot::Mutex<HashSet<FailPoint>>>,
}

impl InMemoryCirculationStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn fail_on(&self, point: FailPoint) {
        self.fail_points.lock().insert(point);
    }

    #[cfg(test)]
    pub fn clear_fail_points(&self) {
        self.fail_points.lock().clear();
    }
}

#[async_trait::async_trait]
impl CirculationStore for InMemoryCirculationStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let committed = self.tables.clone().lock_owned().await;
        let working = committed.clone();
        Ok(Box::new(InMemoryTransaction {
            committed,
            working,
            savepoints: vec![],
            #[cfg(test)]
            fail_points: self.fail_points.clone(),
        }))
    }
}

struct InMemoryTransaction {
    committed: OwnedMutexGuard<CirculationTables>,
    working: CirculationTables,
    savepoints: Vec<(String, CirculationTables)>,
    #[cfg(test)]
    fail_points: Arc<parking_lot::Mutex<HashSet<FailPoint>>>,
}

impl InMemoryTransaction {
    #[cfg(test)]
    fn check_fail_point(&self, point: FailPoint) -> Result<(), StoreError> {
        if self.fail_points.lock().contains(&point) {
            Err(StoreError::Other(format!("Injected failure at {:?}", point)))
        } else {
            Ok(())
        }
    }

    fn savepoint_position(&self, name: &str) -> Result<usize, StoreError> {
        self.savepoints
            .iter()
            .rposition(|(savepoint, _)| savepoint == name)
            .ok_or_else(|| StoreError::Other(format!("Savepoint {} does not exist", name)))
    }
}

#[async_trait::async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn add_book(&mut self, book: NewBook) -> Result<Book, StoreError> {
        let book_id = next_id(&mut self.working.sequences.book);
        let book = Book {
            book_id,
            title: book.title,
            total_copies: book.total_copies,
            available_copies: book.total_copies,
        };
        self.working.books.insert(book_id, book.clone());
        Ok(book)
    }

    async fn get_book(&mut self, book_id: BookId) -> Result<Option<Book>, StoreError> {
        Ok(self.working.books.get(&book_id).cloned())
    }

    async fn lock_book(&mut self, book_id: BookId) -> Result<Option<Book>, StoreError> {
        // The transaction already holds the whole store exclusively
        self.get_book(book_id).await
    }

    async fn update_copies(
        &mut self,
        book_id: BookId,
        total_copies: i32,
        available_copies: i32,
    ) -> Result<(), StoreError> {
        let book = self
            .working
            .books
            .get_mut(&book_id)
            .ok_or_else(|| StoreError::Other(format!("Book {} does not exist", book_id)))?;
        book.total_copies = total_copies;
        book.available_copies = available_copies;
        Ok(())
    }

    async fn books_awaiting_fulfillment(&mut self) -> Result<Vec<BookId>, StoreError> {
        let tables = &self.working;
        Ok(tables
            .reservations
            .values()
            .filter(|reservation| reservation.status == ReservationState::Active)
            .map(|reservation| reservation.book_id)
            .unique()
            .filter(|book_id| {
                tables
                    .books
                    .get(book_id)
                    .map(|book| book.available_copies > 0)
                    .unwrap_or_default()
            })
            .sorted()
            .collect_vec())
    }

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> Result<Reservation, StoreError> {
        if self
            .find_active_reservation(reservation.book_id, reservation.patron_id)
            .await?
            .is_some()
        {
            return Err(StoreError::UniqueViolation(format!(
                "active reservation of patron {} for book {}",
                reservation.patron_id, reservation.book_id
            )));
        }
        let reservation_id = next_id(&mut self.working.sequences.reservation);
        let reservation = Reservation {
            reservation_id,
            book_id: reservation.book_id,
            patron_id: reservation.patron_id,
            created_at: reservation.created_at,
            status: ReservationState::Active,
            priority: reservation.priority,
            expires_at: reservation.expires_at,
            fulfilled_at: None,
            notified_at: None,
            notes: reservation.notes,
        };
        self.working
            .reservations
            .insert(reservation_id, reservation.clone());
        Ok(reservation)
    }

    async fn get_reservation(
        &mut self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self.working.reservations.get(&reservation_id).cloned())
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError> {
        match self.working.reservations.get_mut(&reservation.reservation_id) {
            Some(stored) => {
                *stored = reservation.clone();
                Ok(())
            }
            None => Err(StoreError::Other(format!(
                "Reservation {} does not exist",
                reservation.reservation_id
            ))),
        }
    }

    async fn active_reservations(
        &mut self,
        book_id: BookId,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self
            .working
            .reservations
            .values()
            .filter(|r| r.book_id == book_id && r.status == ReservationState::Active)
            .sorted_by_key(|r| (r.priority, r.reservation_id))
            .cloned()
            .collect_vec())
    }

    async fn find_active_reservation(
        &mut self,
        book_id: BookId,
        patron_id: PatronId,
    ) -> Result<Option<Reservation>, StoreError> {
        Ok(self
            .working
            .reservations
            .values()
            .find(|r| {
                r.book_id == book_id
                    && r.patron_id == patron_id
                    && r.status == ReservationState::Active
            })
            .cloned())
    }

    async fn shift_priorities_after(
        &mut self,
        book_id: BookId,
        removed_priority: Priority,
    ) -> Result<u64, StoreError> {
        let mut shifted = 0;
        for reservation in self.working.reservations.values_mut().filter(|r| {
            r.book_id == book_id
                && r.status == ReservationState::Active
                && r.priority > removed_priority
        }) {
            reservation.priority -= 1;
            shifted += 1;
        }
        Ok(shifted)
    }

    async fn expired_reservation_ids(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, StoreError> {
        Ok(self
            .working
            .reservations
            .values()
            .filter(|r| r.status == ReservationState::Active && r.expires_at < now)
            .map(|r| r.reservation_id)
            .collect_vec())
    }

    async fn patron_reservations(
        &mut self,
        patron_id: PatronId,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self
            .working
            .reservations
            .values()
            .filter(|r| r.patron_id == patron_id)
            .sorted_by_key(|r| {
                (
                    r.status != ReservationState::Active,
                    r.priority,
                    r.reservation_id,
                )
            })
            .cloned()
            .collect_vec())
    }

    async fn insert_request(
        &mut self,
        request: NewReservationRequest,
    ) -> Result<ReservationRequest, StoreError> {
        if self
            .find_pending_request(request.book_id, request.patron_id)
            .await?
            .is_some()
        {
            return Err(StoreError::UniqueViolation(format!(
                "pending request of patron {} for book {}",
                request.patron_id, request.book_id
            )));
        }
        let request_id = next_id(&mut self.working.sequences.request);
        let request = ReservationRequest {
            request_id,
            book_id: request.book_id,
            patron_id: request.patron_id,
            submitted_at: request.submitted_at,
            status: RequestState::Pending,
            notes: request.notes,
        };
        self.working.requests.insert(request_id, request.clone());
        Ok(request)
    }

    async fn get_request(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<ReservationRequest>, StoreError> {
        Ok(self.working.requests.get(&request_id).cloned())
    }

    async fn update_request(&mut self, request: &ReservationRequest) -> Result<(), StoreError> {
        match self.working.requests.get_mut(&request.request_id) {
            Some(stored) => {
                *stored = request.clone();
                Ok(())
            }
            None => Err(StoreError::Other(format!(
                "Request {} does not exist",
                request.request_id
            ))),
        }
    }

    async fn find_pending_request(
        &mut self,
        book_id: BookId,
        patron_id: PatronId,
    ) -> Result<Option<ReservationRequest>, StoreError> {
        Ok(self
            .working
            .requests
            .values()
            .find(|r| {
                r.book_id == book_id && r.patron_id == patron_id && r.status == RequestState::Pending
            })
            .cloned())
    }

    async fn pending_requests(&mut self) -> Result<Vec<ReservationRequest>, StoreError> {
        Ok(self
            .working
            .requests
            .values()
            .filter(|r| r.status == RequestState::Pending)
            .sorted_by_key(|r| (r.submitted_at, r.request_id))
            .cloned()
            .collect_vec())
    }

    async fn insert_loan(&mut self, loan: NewLoan) -> Result<Loan, StoreError> {
        #[cfg(test)]
        self.check_fail_point(FailPoint::InsertLoan)?;

        let loan_id = next_id(&mut self.working.sequences.loan);
        let loan = Loan {
            loan_id,
            book_id: loan.book_id,
            patron_id: loan.patron_id,
            reservation_id: loan.reservation_id,
            issued_at: loan.issued_at,
            due_at: loan.due_at,
            returned_at: None,
            status: LoanState::Issued,
            fine_amount: Default::default(),
        };
        self.working.loans.insert(loan_id, loan.clone());
        Ok(loan)
    }

    async fn get_loan(&mut self, loan_id: LoanId) -> Result<Option<Loan>, StoreError> {
        Ok(self.working.loans.get(&loan_id).cloned())
    }

    async fn update_loan(&mut self, loan: &Loan) -> Result<(), StoreError> {
        match self.working.loans.get_mut(&loan.loan_id) {
            Some(stored) => {
                *stored = loan.clone();
                Ok(())
            }
            None => Err(StoreError::Other(format!(
                "Loan {} does not exist",
                loan.loan_id
            ))),
        }
    }

    async fn loans_past_due(&mut self, now: DateTime<Utc>) -> Result<Vec<Loan>, StoreError> {
        Ok(self
            .working
            .loans
            .values()
            .filter(|l| l.status != LoanState::Returned && l.due_at < now)
            .cloned()
            .collect_vec())
    }

    async fn patron_loans(&mut self, patron_id: PatronId) -> Result<Vec<Loan>, StoreError> {
        Ok(self
            .working
            .loans
            .values()
            .filter(|l| l.patron_id == patron_id)
            .sorted_by_key(|l| (l.issued_at, l.loan_id))
            .rev()
            .cloned()
            .collect_vec())
    }

    async fn insert_fine(&mut self, fine: NewFine) -> Result<Fine, StoreError> {
        if self.fine_for_loan(fine.loan_id).await?.is_some() {
            return Err(StoreError::UniqueViolation(format!(
                "fine for loan {}",
                fine.loan_id
            )));
        }
        let fine_id = next_id(&mut self.working.sequences.fine);
        let fine = Fine {
            fine_id,
            loan_id: fine.loan_id,
            patron_id: fine.patron_id,
            amount: fine.amount,
            reason: fine.reason,
            status: FineState::Pending,
            created_at: fine.created_at,
        };
        self.working.fines.insert(fine_id, fine.clone());
        Ok(fine)
    }

    async fn get_fine(&mut self, fine_id: FineId) -> Result<Option<Fine>, StoreError> {
        Ok(self.working.fines.get(&fine_id).cloned())
    }

    async fn update_fine(&mut self, fine: &Fine) -> Result<(), StoreError> {
        match self.working.fines.get_mut(&fine.fine_id) {
            Some(stored) => {
                *stored = fine.clone();
                Ok(())
            }
            None => Err(StoreError::Other(format!(
                "Fine {} does not exist",
                fine.fine_id
            ))),
        }
    }

    async fn fine_for_loan(&mut self, loan_id: LoanId) -> Result<Option<Fine>, StoreError> {
        Ok(self
            .working
            .fines
            .values()
            .find(|f| f.loan_id == loan_id)
            .cloned())
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment, StoreError> {
        let payment_id = next_id(&mut self.working.sequences.payment);
        let payment = Payment {
            payment_id,
            fine_id: payment.fine_id,
            patron_id: payment.patron_id,
            amount: payment.amount,
            method: payment.method,
            receipt_number: payment.receipt_number,
            paid_at: payment.paid_at,
        };
        self.working.payments.insert(payment_id, payment.clone());
        Ok(payment)
    }

    async fn payments_for_fine(&mut self, fine_id: FineId) -> Result<Vec<Payment>, StoreError> {
        Ok(self
            .working
            .payments
            .values()
            .filter(|p| p.fine_id == fine_id)
            .cloned()
            .collect_vec())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.savepoints
            .push((name.to_string(), self.working.clone()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let position = self.savepoint_position(name)?;
        // Like SQL, the savepoint itself survives the rollback
        self.savepoints.truncate(position + 1);
        self.working = self.savepoints[position].1.clone();
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let position = self.savepoint_position(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryTransaction {
            mut committed,
            working,
            ..
        } = *self;
        *committed = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
