use chrono::{DateTime, Duration, Utc};

use crate::api::{Book, BookId, Loan, NewLoan, PatronId};
use crate::error::CirculationError;
use crate::inventory_ledger::InventoryLedger;
use crate::notifications::messages;
use crate::unit_of_work::UnitOfWork;

/// Over-the-counter issuing of copies.
#[derive(Debug, Clone, Copy)]
pub struct LoanDesk {
    loan_period: Duration,
    ledger: InventoryLedger,
}

impl LoanDesk {
    pub fn new(loan_period: Duration) -> Self {
        Self {
            loan_period,
            ledger: InventoryLedger,
        }
    }

    pub async fn issue_book(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        patron_id: PatronId,
        due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Loan, CirculationError> {
        let (book, loan) = self.lend(unit, book_id, patron_id, due_at, now).await?;
        unit.notify(patron_id, messages::book_issued(&book.title, loan.due_at));
        Ok(loan)
    }

    /// Takes a copy off the shelf and records the loan, the caller tells the patron
    pub(crate) async fn lend(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        patron_id: PatronId,
        due_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(Book, Loan), CirculationError> {
        let book = self.ledger.decrement(unit, book_id).await?;
        let due_at = due_at.unwrap_or(now + self.loan_period);
        let loan = unit
            .store()
            .insert_loan(NewLoan {
                book_id,
                patron_id,
                reservation_id: None,
                issued_at: now,
                due_at,
            })
            .await?;
        tracing::info!(loan_id = loan.loan_id, book_id, patron_id, "Book issued");
        Ok((book, loan))
    }

    pub async fn patron_loans(
        &self,
        unit: &mut UnitOfWork,
        patron_id: PatronId,
    ) -> Result<Vec<Loan>, CirculationError> {
        Ok(unit.store().patron_loans(patron_id).await?)
    }
}
