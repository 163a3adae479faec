use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::state::{FineState, LoanState, RequestState, ReservationState};

pub type BookId = i32;
pub type PatronId = i32;
pub type ReservationId = i32;
pub type RequestId = i32;
pub type LoanId = i32;
pub type FineId = i32;
pub type PaymentId = i32;

/// Position of a reservation in its book's queue, 1 is served first
pub type Priority = i32;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Book {
    pub book_id: BookId,
    pub title: String,
    pub total_copies: i32,
    pub available_copies: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewBook {
    pub title: String,
    pub total_copies: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub created_at: DateTime<Utc>,
    pub status: ReservationState,
    /// Dense among active reservations of the book; terminal
    /// reservations keep the value they last held
    pub priority: Priority,
    pub expires_at: DateTime<Utc>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct NewReservation {
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub created_at: DateTime<Utc>,
    pub priority: Priority,
    pub expires_at: DateTime<Utc>,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReservationRequest {
    pub request_id: RequestId,
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub submitted_at: DateTime<Utc>,
    pub status: RequestState,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct NewReservationRequest {
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub submitted_at: DateTime<Utc>,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Loan {
    pub loan_id: LoanId,
    pub book_id: BookId,
    pub patron_id: PatronId,
    /// Set when the loan was produced by auto-issue
    pub reservation_id: Option<ReservationId>,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: LoanState,
    pub fine_amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct NewLoan {
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub reservation_id: Option<ReservationId>,
    pub issued_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Fine {
    pub fine_id: FineId,
    pub loan_id: LoanId,
    pub patron_id: PatronId,
    pub amount: Decimal,
    pub reason: String,
    pub status: FineState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFine {
    pub loan_id: LoanId,
    pub patron_id: PatronId,
    pub amount: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Payment {
    pub payment_id: PaymentId,
    pub fine_id: FineId,
    pub patron_id: PatronId,
    pub amount: Decimal,
    pub method: String,
    pub receipt_number: String,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub fine_id: FineId,
    pub patron_id: PatronId,
    pub amount: Decimal,
    pub method: String,
    pub receipt_number: String,
    pub paid_at: DateTime<Utc>,
}

/// Outcome of one auto-issue attempt for the head of a queue
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum FulfillmentResult {
    /// Copy handed over: the reservation produced a loan
    Fulfilled { reservation: Reservation, loan: Loan },
    /// Loan creation failed; the patron was told to collect the copy manually
    Degraded {
        reservation: Reservation,
        reason: String,
    },
}

impl FulfillmentResult {
    pub fn reservation(&self) -> &Reservation {
        match self {
            Self::Fulfilled { reservation, .. } | Self::Degraded { reservation, .. } => {
                reservation
            }
        }
    }

    pub fn loan(&self) -> Option<&Loan> {
        match self {
            Self::Fulfilled { loan, .. } => Some(loan),
            Self::Degraded { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DrainReport {
    pub processed: usize,
    pub loans_created: usize,
    pub degraded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LoanClosure {
    pub loan: Loan,
    pub fine: Option<Fine>,
    pub drain: DrainReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PaymentReceipt {
    pub payment: Payment,
    pub fine: Fine,
    /// Still owed after this payment
    pub outstanding: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
}
