use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::api::{FineId, Loan, LoanClosure, LoanId, NewFine, NewPayment, PaymentReceipt};
use crate::error::CirculationError;
use crate::fulfillment::FulfillmentCoordinator;
use crate::inventory_ledger::InventoryLedger;
use crate::notifications::messages;
use crate::state::{FineState, Lifecycle, LoanState};
use crate::store::StoreError;
use crate::unit_of_work::UnitOfWork;

/// Penalty for a late return: whole days late times the daily rate.
/// Returning on or before the due date costs nothing.
pub fn compute_fine(
    due_at: DateTime<Utc>,
    returned_at: DateTime<Utc>,
    rate_per_day: Decimal,
) -> Decimal {
    let days_late = (returned_at - due_at).num_days().max(0);
    Decimal::from(days_late) * rate_per_day
}

/// Closes loans, raises fines and records their payments.
#[derive(Debug, Clone, Copy)]
pub struct FineCalculator {
    rate_per_day: Decimal,
    fulfillment: FulfillmentCoordinator,
    ledger: InventoryLedger,
}

impl FineCalculator {
    pub fn new(rate_per_day: Decimal, fulfillment: FulfillmentCoordinator) -> Self {
        Self {
            rate_per_day,
            fulfillment,
            ledger: InventoryLedger,
        }
    }

    pub fn compute_fine(&self, due_at: DateTime<Utc>, returned_at: DateTime<Utc>) -> Decimal {
        compute_fine(due_at, returned_at, self.rate_per_day)
    }

    /// Returns the loan, raises its fine and offers the freed copy to the
    /// queue, all inside the caller's unit.
    pub async fn close_loan(
        &self,
        unit: &mut UnitOfWork,
        loan_id: LoanId,
        returned_at: DateTime<Utc>,
        override_fine_amount: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Result<LoanClosure, CirculationError> {
        if let Some(amount) = override_fine_amount {
            if amount.is_sign_negative() {
                return Err(CirculationError::InvalidFineAmount(amount));
            }
        }

        let mut loan = self.locked_loan(unit, loan_id).await?;
        let book = self.ledger.lock(unit, loan.book_id).await?;

        loan.status = loan.status.transition_to(LoanState::Returned)?;
        let amount = override_fine_amount
            .unwrap_or_else(|| self.compute_fine(loan.due_at, returned_at));
        loan.returned_at = Some(returned_at);
        loan.fine_amount = amount;
        unit.store().update_loan(&loan).await?;

        self.ledger.increment(unit, book.book_id).await?;
        unit.notify(loan.patron_id, messages::book_returned(&book.title));

        let fine = if amount > Decimal::ZERO {
            if unit.store().fine_for_loan(loan_id).await?.is_some() {
                return Err(CirculationError::FineAlreadyRecorded(loan_id));
            }
            let fine = match unit
                .store()
                .insert_fine(NewFine {
                    loan_id,
                    patron_id: loan.patron_id,
                    amount,
                    reason: format!("Late return of book '{}'", book.title),
                    created_at: now,
                })
                .await
            {
                Err(StoreError::UniqueViolation(_)) => {
                    return Err(CirculationError::FineAlreadyRecorded(loan_id))
                }
                other => other?,
            };
            tracing::info!(
                loan_id,
                fine_id = fine.fine_id,
                amount = %amount,
                "Fine recorded"
            );
            unit.notify(loan.patron_id, messages::fine_charged(&book.title, amount));
            Some(fine)
        } else {
            None
        };

        tracing::info!(loan_id, book_id = book.book_id, "Loan closed");
        let drain = self.fulfillment.drain(unit, book.book_id, now).await?;
        Ok(LoanClosure { loan, fine, drain })
    }

    pub async fn record_payment(
        &self,
        unit: &mut UnitOfWork,
        fine_id: FineId,
        amount: Decimal,
        method: String,
        receipt_number: String,
        now: DateTime<Utc>,
    ) -> Result<PaymentReceipt, CirculationError> {
        if amount <= Decimal::ZERO {
            return Err(CirculationError::InvalidPaymentAmount(amount));
        }

        let loan_id = unit
            .store()
            .get_fine(fine_id)
            .await?
            .ok_or(CirculationError::FineNotFound(fine_id))?
            .loan_id;
        let loan = self.locked_loan(unit, loan_id).await?;
        let book = self.ledger.book(unit, loan.book_id).await?;
        let mut fine = unit
            .store()
            .get_fine(fine_id)
            .await?
            .ok_or(CirculationError::FineNotFound(fine_id))?;

        let settled = fine.status.transition_to(FineState::Paid)?;
        let paid: Decimal = unit
            .store()
            .payments_for_fine(fine_id)
            .await?
            .iter()
            .map(|payment| payment.amount)
            .sum();
        let outstanding = fine.amount - paid;
        if amount > outstanding {
            return Err(CirculationError::PaymentExceedsOutstanding {
                fine_id,
                amount,
                outstanding,
            });
        }

        let payment = unit
            .store()
            .insert_payment(NewPayment {
                fine_id,
                patron_id: fine.patron_id,
                amount,
                method,
                receipt_number,
                paid_at: now,
            })
            .await?;
        let outstanding = outstanding - amount;
        if outstanding.is_zero() {
            fine.status = settled;
            unit.store().update_fine(&fine).await?;
            tracing::info!(fine_id, "Fine settled");
        }

        unit.notify(
            fine.patron_id,
            messages::payment_recorded(&book.title, amount),
        );
        tracing::info!(
            fine_id,
            payment_id = payment.payment_id,
            amount = %amount,
            "Payment recorded"
        );
        Ok(PaymentReceipt {
            payment,
            fine,
            outstanding,
        })
    }

    /// Flags unreturned loans past their due date and refreshes the fine
    /// accrued so far. The fine itself is only raised when the loan closes.
    pub async fn mark_overdue_loans(
        &self,
        unit: &mut UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<Vec<Loan>, CirculationError> {
        let mut marked = vec![];
        for mut loan in unit.store().loans_past_due(now).await? {
            if loan.status == LoanState::Issued {
                loan.status = loan.status.transition_to(LoanState::Overdue)?;
            }
            loan.fine_amount = self.compute_fine(loan.due_at, now);
            unit.store().update_loan(&loan).await?;
            marked.push(loan);
        }
        if !marked.is_empty() {
            tracing::info!(count = marked.len(), "Overdue loans refreshed");
        }
        Ok(marked)
    }

    /// Reads the loan again after taking its book lock
    async fn locked_loan(
        &self,
        unit: &mut UnitOfWork,
        loan_id: LoanId,
    ) -> Result<Loan, CirculationError> {
        let book_id = unit
            .store()
            .get_loan(loan_id)
            .await?
            .ok_or(CirculationError::LoanNotFound(loan_id))?
            .book_id;
        self.ledger.lock(unit, book_id).await?;
        unit.store()
            .get_loan(loan_id)
            .await?
            .ok_or(CirculationError::LoanNotFound(loan_id))
    }
}

#[cfg(test)]
mod fines_tests {
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    use crate::api::{Book, NewLoan};
    use crate::reservation_queue::ReservationQueueManager;
    use crate::state::ReservationState;
    use crate::store::InMemoryCirculationStore;

    use super::*;

    fn calculator() -> FineCalculator {
        FineCalculator::new(
            dec!(100),
            FulfillmentCoordinator::new(
                ReservationQueueManager::new(Duration::days(7)),
                Duration::days(14),
                Duration::hours(24),
            ),
        )
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 10, 0, 0).unwrap()
    }

    /// Book with its single copy lent to patron 1, due on 2024-01-10
    async fn lent_book(store: &InMemoryCirculationStore) -> (Book, Loan) {
        let mut unit = UnitOfWork::begin(store).await.unwrap();
        let book = InventoryLedger
            .add_book(&mut unit, "Dune".to_string(), 1)
            .await
            .unwrap();
        InventoryLedger
            .decrement(&mut unit, book.book_id)
            .await
            .unwrap();
        let loan = unit
            .store()
            .insert_loan(NewLoan {
                book_id: book.book_id,
                patron_id: 1,
                reservation_id: None,
                issued_at: at(1),
                due_at: at(10),
            })
            .await
            .unwrap();
        unit.commit().await.unwrap();
        (book, loan)
    }

    #[test]
    fn fine_counts_whole_days_late() {
        assert_eq!(compute_fine(at(10), at(13), dec!(100)), dec!(300));
        assert_eq!(compute_fine(at(10), at(10), dec!(100)), dec!(0));
        assert_eq!(compute_fine(at(10), at(2), dec!(100)), dec!(0));
        assert_eq!(
            compute_fine(at(10), at(11) + Duration::hours(23), dec!(100)),
            dec!(100)
        );
        let mut previous = Decimal::ZERO;
        for day in 11..20 {
            let fine = compute_fine(at(10), at(day), dec!(2.5));
            assert!(fine > previous);
            previous = fine;
        }
    }

    #[tokio::test]
    /// Late return raises a fine
    /// 1. Loan due 2024-01-10 returned 2024-01-13
    /// 2. Loan is returned with fine amount 300, a pending fine is recorded
    /// 3. Copy is back on the shelf, patron gets receipt and fine notice
    /// 4. Closing the loan again is rejected
    async fn test_late_return_records_fine() {
        let store = InMemoryCirculationStore::new();
        let (book, loan) = lent_book(&store).await;
        let calculator = calculator();

        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        let closure = calculator
            .close_loan(&mut unit, loan.loan_id, at(13), None, at(13))
            .await
            .unwrap();
        assert_eq!(closure.loan.status, LoanState::Returned);
        assert_eq!(closure.loan.returned_at, Some(at(13)));
        assert_eq!(closure.loan.fine_amount, dec!(300));
        let fine = closure.fine.unwrap();
        assert_eq!(fine.amount, dec!(300));
        assert_eq!(fine.status, FineState::Pending);
        assert_eq!(fine.reason, "Late return of book 'Dune'");
        assert_eq!(
            InventoryLedger
                .book(&mut unit, book.book_id)
                .await
                .unwrap()
                .available_copies,
            1
        );

        assert!(matches!(
            calculator
                .close_loan(&mut unit, loan.loan_id, at(14), None, at(14))
                .await,
            Err(CirculationError::InvalidTransition(..))
        ));

        let messages = unit
            .commit()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.message)
            .collect::<Vec<_>>();
        assert_eq!(
            messages,
            vec![
                "Your book 'Dune' has been returned successfully.".to_string(),
                "You have been charged a fine of 300.00 for late return of 'Dune'. \
                 Please settle the payment at the library."
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    /// Return on the due date costs nothing
    /// 1. Loan due 2024-01-10 returned the same day
    /// 2. No fine record, fine amount 0
    /// 3. Negative override is rejected before anything changes
    async fn test_on_time_return_has_no_fine() {
        let store = InMemoryCirculationStore::new();
        let (_book, loan) = lent_book(&store).await;
        let calculator = calculator();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();

        assert!(matches!(
            calculator
                .close_loan(&mut unit, loan.loan_id, at(10), Some(dec!(-1)), at(10))
                .await,
            Err(CirculationError::InvalidFineAmount(..))
        ));

        let closure = calculator
            .close_loan(&mut unit, loan.loan_id, at(10), None, at(10))
            .await
            .unwrap();
        assert_eq!(closure.fine, None);
        assert_eq!(closure.loan.fine_amount, Decimal::ZERO);
        assert_eq!(unit.store().fine_for_loan(loan.loan_id).await.unwrap(), None);
        assert!(matches!(
            calculator
                .close_loan(&mut unit, loan.loan_id + 1, at(10), None, at(10))
                .await,
            Err(CirculationError::LoanNotFound(..))
        ));
    }

    #[tokio::test]
    /// Returned copy is handed to the waiting patron in the same unit
    /// 1. Patrons 2 and 3 wait for the lent copy
    /// 2. Patron 1 returns it late with an overridden fine of 50
    /// 3. Patron 2 gets a loan, patron 3 moves to priority 1, shelf stays empty
    async fn test_return_drains_queue() {
        let store = InMemoryCirculationStore::new();
        let (book, loan) = lent_book(&store).await;
        let calculator = calculator();
        let queue = ReservationQueueManager::new(Duration::days(7));

        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        for patron_id in [2, 3] {
            queue
                .create(&mut unit, book.book_id, patron_id, String::new(), at(5))
                .await
                .unwrap();
        }
        let closure = calculator
            .close_loan(&mut unit, loan.loan_id, at(12), Some(dec!(50)), at(12))
            .await
            .unwrap();
        assert_eq!(closure.fine.map(|f| f.amount), Some(dec!(50)));
        assert_eq!(closure.drain.loans_created, 1);

        let new_loan = unit.store().patron_loans(2).await.unwrap().remove(0);
        assert_eq!(new_loan.due_at, at(26));
        assert_eq!(
            unit.store().patron_reservations(2).await.unwrap()[0].status,
            ReservationState::Fulfilled
        );
        let waiting = unit.store().active_reservations(book.book_id).await.unwrap();
        assert_eq!((waiting[0].patron_id, waiting[0].priority), (3, 1));
        assert_eq!(
            InventoryLedger
                .book(&mut unit, book.book_id)
                .await
                .unwrap()
                .available_copies,
            0
        );
    }

    #[tokio::test]
    /// Fine settled in two payments
    /// 1. Zero and excessive payments are rejected
    /// 2. Partial payment of 100 leaves 200 outstanding, fine still pending
    /// 3. Payment of 200 settles the fine
    /// 4. Paying a settled fine is rejected
    async fn test_payments_settle_fine() {
        let store = InMemoryCirculationStore::new();
        let (_book, loan) = lent_book(&store).await;
        let calculator = calculator();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        let fine = calculator
            .close_loan(&mut unit, loan.loan_id, at(13), None, at(13))
            .await
            .unwrap()
            .fine
            .unwrap();

        assert!(matches!(
            calculator
                .record_payment(&mut unit, fine.fine_id, dec!(0), "cash".into(), "R-0".into(), at(14))
                .await,
            Err(CirculationError::InvalidPaymentAmount(..))
        ));
        assert!(matches!(
            calculator
                .record_payment(&mut unit, fine.fine_id, dec!(301), "cash".into(), "R-0".into(), at(14))
                .await,
            Err(CirculationError::PaymentExceedsOutstanding { .. })
        ));

        let receipt = calculator
            .record_payment(&mut unit, fine.fine_id, dec!(100), "cash".into(), "R-1".into(), at(14))
            .await
            .unwrap();
        assert_eq!(receipt.outstanding, dec!(200));
        assert_eq!(receipt.fine.status, FineState::Pending);

        let receipt = calculator
            .record_payment(&mut unit, fine.fine_id, dec!(200), "card".into(), "R-2".into(), at(15))
            .await
            .unwrap();
        assert_eq!(receipt.outstanding, Decimal::ZERO);
        assert_eq!(receipt.fine.status, FineState::Paid);
        assert_eq!(
            unit.store().get_fine(fine.fine_id).await.unwrap().unwrap().status,
            FineState::Paid
        );

        assert!(matches!(
            calculator
                .record_payment(&mut unit, fine.fine_id, dec!(1), "cash".into(), "R-3".into(), at(16))
                .await,
            Err(CirculationError::InvalidTransition(..))
        ));
        assert!(matches!(
            calculator
                .record_payment(&mut unit, 999, dec!(1), "cash".into(), "R-4".into(), at(16))
                .await,
            Err(CirculationError::FineNotFound(999))
        ));
    }

    #[tokio::test]
    /// Overdue marking refreshes the accrued amount without raising a fine
    /// 1. Loan due 2024-01-10, sweep on 2024-01-09 changes nothing
    /// 2. Sweep on 2024-01-12 marks it overdue with 200 accrued
    /// 3. Sweep on 2024-01-15 keeps it overdue with 500 accrued
    async fn test_mark_overdue_loans() {
        let store = InMemoryCirculationStore::new();
        let (_book, loan) = lent_book(&store).await;
        let calculator = calculator();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();

        assert!(calculator
            .mark_overdue_loans(&mut unit, at(9))
            .await
            .unwrap()
            .is_empty());

        let marked = calculator.mark_overdue_loans(&mut unit, at(12)).await.unwrap();
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].status, LoanState::Overdue);
        assert_eq!(marked[0].fine_amount, dec!(200));

        let marked = calculator.mark_overdue_loans(&mut unit, at(15)).await.unwrap();
        assert_eq!(marked[0].status, LoanState::Overdue);
        assert_eq!(
            unit.store().get_loan(loan.loan_id).await.unwrap().unwrap().fine_amount,
            dec!(500)
        );
        assert_eq!(unit.store().fine_for_loan(loan.loan_id).await.unwrap(), None);
    }
}
