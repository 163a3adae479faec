use chrono::{DateTime, Utc};
use paperclip::actix::Apiv2Schema;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use circulation_engine::api::{
    Book, DrainReport, Fine, Loan, LoanClosure, PaymentReceipt, Reservation, ReservationRequest,
};
use circulation_engine::state::Lifecycle;

pub use circulation_engine::api::{
    BookId, FineId, LoanId, PatronId, PaymentId, Priority, RequestId, ReservationId,
};

/// Unix seconds to UTC, `None` when out of range
pub fn from_timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Money travels as a JSON number, stored with two decimal places
pub fn from_amount(amount: f64) -> Option<Decimal> {
    if !amount.is_finite() {
        return None;
    }
    Decimal::try_from(amount).ok().map(|value| value.round_dp(2))
}

fn to_amount(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookDetails {
    pub title: String,
    pub total_copies: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookResponse {
    pub book_id: BookId,
    pub title: String,
    pub total_copies: i32,
    pub available_copies: i32,
}

impl From<Book> for BookResponse {
    fn from(book: Book) -> Self {
        Self {
            book_id: book.book_id,
            title: book.title,
            total_copies: book.total_copies,
            available_copies: book.available_copies,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct AddCopies {
    pub count: i32,
}

/// Body of reservation and request creation
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct PatronNote {
    pub patron_id: PatronId,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct PatronAction {
    pub patron_id: PatronId,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct ReservationResponse {
    pub reservation_id: ReservationId,
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub created_at: i64,
    pub status: String,
    pub priority: Priority,
    pub expires_at: i64,
    pub fulfilled_at: Option<i64>,
    pub notified_at: Option<i64>,
    pub notes: String,
}

impl From<Reservation> for ReservationResponse {
    fn from(reservation: Reservation) -> Self {
        Self {
            reservation_id: reservation.reservation_id,
            book_id: reservation.book_id,
            patron_id: reservation.patron_id,
            created_at: reservation.created_at.timestamp(),
            status: reservation.status.as_str().to_string(),
            priority: reservation.priority,
            expires_at: reservation.expires_at.timestamp(),
            fulfilled_at: reservation.fulfilled_at.map(|at| at.timestamp()),
            notified_at: reservation.notified_at.map(|at| at.timestamp()),
            notes: reservation.notes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct RequestResponse {
    pub request_id: RequestId,
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub submitted_at: i64,
    pub status: String,
    pub notes: String,
}

impl From<ReservationRequest> for RequestResponse {
    fn from(request: ReservationRequest) -> Self {
        Self {
            request_id: request.request_id,
            book_id: request.book_id,
            patron_id: request.patron_id,
            submitted_at: request.submitted_at.timestamp(),
            status: request.status.as_str().to_string(),
            notes: request.notes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct IssueBook {
    pub patron_id: PatronId,
    /// Defaults to the configured loan period from now
    pub due_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Apiv2Schema)]
pub struct LoanResponse {
    pub loan_id: LoanId,
    pub book_id: BookId,
    pub patron_id: PatronId,
    pub reservation_id: Option<ReservationId>,
    pub issued_at: i64,
    pub due_at: i64,
    pub returned_at: Option<i64>,
    pub status: String,
    pub fine_amount: f64,
}

impl From<Loan> for LoanResponse {
    fn from(loan: Loan) -> Self {
        Self {
            loan_id: loan.loan_id,
            book_id: loan.book_id,
            patron_id: loan.patron_id,
            reservation_id: loan.reservation_id,
            issued_at: loan.issued_at.timestamp(),
            due_at: loan.due_at.timestamp(),
            returned_at: loan.returned_at.map(|at| at.timestamp()),
            status: loan.status.as_str().to_string(),
            fine_amount: to_amount(loan.fine_amount),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Apiv2Schema)]
pub struct ReturnLoan {
    /// Defaults to now
    pub returned_at: Option<i64>,
    /// Replaces the computed late fee
    pub fine_amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Apiv2Schema)]
pub struct FineResponse {
    pub fine_id: FineId,
    pub loan_id: LoanId,
    pub patron_id: PatronId,
    pub amount: f64,
    pub reason: String,
    pub status: String,
    pub created_at: i64,
}

impl From<Fine> for FineResponse {
    fn from(fine: Fine) -> Self {
        Self {
            fine_id: fine.fine_id,
            loan_id: fine.loan_id,
            patron_id: fine.patron_id,
            amount: to_amount(fine.amount),
            reason: fine.reason,
            status: fine.status.as_str().to_string(),
            created_at: fine.created_at.timestamp(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct DrainResponse {
    pub processed: u64,
    pub loans_created: u64,
    pub degraded: u64,
}

impl From<DrainReport> for DrainResponse {
    fn from(report: DrainReport) -> Self {
        Self {
            processed: report.processed as u64,
            loans_created: report.loans_created as u64,
            degraded: report.degraded as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Apiv2Schema)]
pub struct LoanClosureResponse {
    pub loan: LoanResponse,
    pub fine: Option<FineResponse>,
    pub drain: DrainResponse,
}

impl From<LoanClosure> for LoanClosureResponse {
    fn from(closure: LoanClosure) -> Self {
        Self {
            loan: closure.loan.into(),
            fine: closure.fine.map(FineResponse::from),
            drain: closure.drain.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Apiv2Schema)]
pub struct PaymentDetails {
    pub amount: f64,
    pub method: String,
    #[serde(default)]
    pub receipt_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Apiv2Schema)]
pub struct PaymentResponse {
    pub payment_id: PaymentId,
    pub fine: FineResponse,
    pub amount: f64,
    pub outstanding: f64,
    pub paid_at: i64,
}

impl From<PaymentReceipt> for PaymentResponse {
    fn from(receipt: PaymentReceipt) -> Self {
        Self {
            payment_id: receipt.payment.payment_id,
            amount: to_amount(receipt.payment.amount),
            paid_at: receipt.payment.paid_at.timestamp(),
            fine: receipt.fine.into(),
            outstanding: to_amount(receipt.outstanding),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct SweepResponse {
    pub expired: u64,
    pub failed: u64,
    pub overdue_loans: u64,
}
