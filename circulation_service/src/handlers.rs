use std::sync::Arc;

use actix_web::http::header::LOCATION;
use actix_web::web::Data;
use actix_web::Error;
use actix_web::HttpResponse;
use chrono::Utc;
use paperclip::actix::{
    api_v2_operation,
    web::{self},
};

use circulation_engine::{Circulation, CirculationError, ErrorKind};

use crate::api::{
    from_amount, from_timestamp, AddCopies, BookDetails, BookId, BookResponse, DrainResponse,
    FineId, IssueBook, LoanClosureResponse, LoanId, LoanResponse, PatronAction, PatronId,
    PatronNote, PaymentDetails, PaymentResponse, RequestId, RequestResponse, ReservationId,
    ReservationResponse, ReturnLoan,
};
use crate::sweep_scheduler::run_maintenance;

/// Maps an engine error onto a status code, the body carries the message.
/// Store failures are logged here and never leak to the caller.
fn error_response(operation: &str, err: CirculationError) -> HttpResponse {
    match err.kind() {
        ErrorKind::Transactional => {
            tracing::error!("{} failed {}", operation, err);
            HttpResponse::InternalServerError().finish()
        }
        ErrorKind::Consistency => {
            tracing::warn!("{} lost a race {}", operation, err);
            HttpResponse::Conflict().json(err.to_string())
        }
        ErrorKind::Validation if err.is_not_found() => HttpResponse::NotFound().json(err.to_string()),
        ErrorKind::Validation => match err {
            CirculationError::InvalidCopyCount(_)
            | CirculationError::InvalidFineAmount(_)
            | CirculationError::InvalidPaymentAmount(_)
            | CirculationError::PaymentExceedsOutstanding { .. } => {
                HttpResponse::BadRequest().json(err.to_string())
            }
            _ => HttpResponse::Conflict().json(err.to_string()),
        },
    }
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(message)
}

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

#[api_v2_operation]
pub async fn add_book(
    circulation: Data<Arc<Circulation>>,
    details: web::Json<BookDetails>,
) -> Result<HttpResponse, Error> {
    let details = details.into_inner();
    Ok(
        match circulation
            .add_book(details.title, details.total_copies)
            .await
        {
            Ok(book) => HttpResponse::Created()
                .append_header((LOCATION, format!("/api/book/{}", book.book_id)))
                .json(BookResponse::from(book)),
            Err(err) => error_response("Add book", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_book(
    circulation: Data<Arc<Circulation>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match circulation.get_book(book_id.into_inner()).await {
        Ok(book) => HttpResponse::Ok().json(BookResponse::from(book)),
        Err(err) => error_response("Get book", err),
    })
}

#[api_v2_operation]
pub async fn add_copies(
    circulation: Data<Arc<Circulation>>,
    book_id: web::Path<BookId>,
    body: web::Json<AddCopies>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation
            .add_copies(book_id.into_inner(), body.count)
            .await
        {
            Ok(book) => HttpResponse::Ok().json(BookResponse::from(book)),
            Err(err) => error_response("Add copies", err),
        },
    )
}

#[api_v2_operation]
pub async fn get_queue(
    circulation: Data<Arc<Circulation>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match circulation.queue(book_id.into_inner()).await {
        Ok(queue) => HttpResponse::Ok().json(
            queue
                .into_iter()
                .map(ReservationResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(err) => error_response("Get queue", err),
    })
}

#[api_v2_operation]
pub async fn create_reservation(
    circulation: Data<Arc<Circulation>>,
    book_id: web::Path<BookId>,
    body: web::Json<PatronNote>,
) -> Result<HttpResponse, Error> {
    let body = body.into_inner();
    Ok(
        match circulation
            .create_reservation(book_id.into_inner(), body.patron_id, body.notes)
            .await
        {
            Ok(reservation) => HttpResponse::Created()
                .append_header((
                    LOCATION,
                    format!("/api/reservation/{}", reservation.reservation_id),
                ))
                .json(ReservationResponse::from(reservation)),
            Err(err) => error_response("Create reservation", err),
        },
    )
}

#[api_v2_operation]
pub async fn submit_request(
    circulation: Data<Arc<Circulation>>,
    book_id: web::Path<BookId>,
    body: web::Json<PatronNote>,
) -> Result<HttpResponse, Error> {
    let body = body.into_inner();
    Ok(
        match circulation
            .submit_request(book_id.into_inner(), body.patron_id, body.notes)
            .await
        {
            Ok(request) => HttpResponse::Created()
                .append_header((LOCATION, format!("/api/request/{}", request.request_id)))
                .json(RequestResponse::from(request)),
            Err(err) => error_response("Submit request", err),
        },
    )
}

#[api_v2_operation]
pub async fn issue_book(
    circulation: Data<Arc<Circulation>>,
    book_id: web::Path<BookId>,
    body: web::Json<IssueBook>,
) -> Result<HttpResponse, Error> {
    let body = body.into_inner();
    let due_at = match body.due_at {
        Some(secs) => match from_timestamp(secs) {
            Some(due_at) => Some(due_at),
            None => return Ok(bad_request(format!("Invalid due date {}", secs))),
        },
        None => None,
    };
    Ok(
        match circulation
            .issue_book(book_id.into_inner(), body.patron_id, due_at)
            .await
        {
            Ok(loan) => HttpResponse::Created().json(LoanResponse::from(loan)),
            Err(err) => error_response("Issue book", err),
        },
    )
}

/// Hands newly available copies to the queue, e.g. after an external restock
#[api_v2_operation]
pub async fn availability_increased(
    circulation: Data<Arc<Circulation>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation
            .on_availability_increased(book_id.into_inner())
            .await
        {
            Ok(report) => HttpResponse::Ok().json(DrainResponse::from(report)),
            Err(err) => error_response("Drain availability", err),
        },
    )
}

#[api_v2_operation]
pub async fn pending_requests(circulation: Data<Arc<Circulation>>) -> Result<HttpResponse, Error> {
    Ok(match circulation.pending_requests().await {
        Ok(requests) => HttpResponse::Ok().json(
            requests
                .into_iter()
                .map(RequestResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(err) => error_response("List pending requests", err),
    })
}

#[api_v2_operation]
pub async fn approve_request(
    circulation: Data<Arc<Circulation>>,
    request_id: web::Path<RequestId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation.approve_request(request_id.into_inner()).await {
            Ok(reservation) => HttpResponse::Ok().json(ReservationResponse::from(reservation)),
            Err(err) => error_response("Approve request", err),
        },
    )
}

/// Approves a request by lending a copy from the shelf, 409 when none is left
#[api_v2_operation]
pub async fn issue_request(
    circulation: Data<Arc<Circulation>>,
    request_id: web::Path<RequestId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation.issue_request(request_id.into_inner()).await {
            Ok(loan) => HttpResponse::Created().json(LoanResponse::from(loan)),
            Err(err) => error_response("Issue request", err),
        },
    )
}

#[api_v2_operation]
pub async fn reject_request(
    circulation: Data<Arc<Circulation>>,
    request_id: web::Path<RequestId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation.reject_request(request_id.into_inner()).await {
            Ok(request) => HttpResponse::Ok().json(RequestResponse::from(request)),
            Err(err) => error_response("Reject request", err),
        },
    )
}

#[api_v2_operation]
pub async fn cancel_request(
    circulation: Data<Arc<Circulation>>,
    request_id: web::Path<RequestId>,
    body: web::Json<PatronAction>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation
            .cancel_request(request_id.into_inner(), body.patron_id)
            .await
        {
            Ok(request) => HttpResponse::Ok().json(RequestResponse::from(request)),
            Err(err) => error_response("Cancel request", err),
        },
    )
}

#[api_v2_operation]
pub async fn cancel_reservation(
    circulation: Data<Arc<Circulation>>,
    reservation_id: web::Path<ReservationId>,
    body: web::Json<PatronAction>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation
            .cancel_reservation(reservation_id.into_inner(), body.patron_id)
            .await
        {
            Ok(reservation) => HttpResponse::Ok().json(ReservationResponse::from(reservation)),
            Err(err) => error_response("Cancel reservation", err),
        },
    )
}

#[api_v2_operation]
pub async fn patron_reservations(
    circulation: Data<Arc<Circulation>>,
    patron_id: web::Path<PatronId>,
) -> Result<HttpResponse, Error> {
    Ok(
        match circulation.patron_reservations(patron_id.into_inner()).await {
            Ok(reservations) => HttpResponse::Ok().json(
                reservations
                    .into_iter()
                    .map(ReservationResponse::from)
                    .collect::<Vec<_>>(),
            ),
            Err(err) => error_response("List patron reservations", err),
        },
    )
}

#[api_v2_operation]
pub async fn patron_loans(
    circulation: Data<Arc<Circulation>>,
    patron_id: web::Path<PatronId>,
) -> Result<HttpResponse, Error> {
    Ok(match circulation.patron_loans(patron_id.into_inner()).await {
        Ok(loans) => HttpResponse::Ok().json(
            loans
                .into_iter()
                .map(LoanResponse::from)
                .collect::<Vec<_>>(),
        ),
        Err(err) => error_response("List patron loans", err),
    })
}

#[api_v2_operation]
pub async fn return_loan(
    circulation: Data<Arc<Circulation>>,
    loan_id: web::Path<LoanId>,
    body: web::Json<ReturnLoan>,
) -> Result<HttpResponse, Error> {
    let body = body.into_inner();
    let returned_at = match body.returned_at {
        Some(secs) => match from_timestamp(secs) {
            Some(returned_at) => Some(returned_at),
            None => return Ok(bad_request(format!("Invalid return date {}", secs))),
        },
        None => None,
    };
    let fine_amount = match body.fine_amount {
        Some(amount) => match from_amount(amount) {
            Some(amount) => Some(amount),
            None => return Ok(bad_request(format!("Invalid fine amount {}", amount))),
        },
        None => None,
    };
    Ok(
        match circulation
            .close_loan(loan_id.into_inner(), returned_at, fine_amount)
            .await
        {
            Ok(closure) => HttpResponse::Ok().json(LoanClosureResponse::from(closure)),
            Err(err) => error_response("Return loan", err),
        },
    )
}

#[api_v2_operation]
pub async fn record_payment(
    circulation: Data<Arc<Circulation>>,
    fine_id: web::Path<FineId>,
    body: web::Json<PaymentDetails>,
) -> Result<HttpResponse, Error> {
    let body = body.into_inner();
    let Some(amount) = from_amount(body.amount) else {
        return Ok(bad_request(format!("Invalid payment amount {}", body.amount)));
    };
    Ok(
        match circulation
            .record_payment(fine_id.into_inner(), amount, body.method, body.receipt_number)
            .await
        {
            Ok(receipt) => HttpResponse::Created().json(PaymentResponse::from(receipt)),
            Err(err) => error_response("Record payment", err),
        },
    )
}

/// Runs the periodic maintenance on demand
#[api_v2_operation]
pub async fn sweep(circulation: Data<Arc<Circulation>>) -> Result<HttpResponse, Error> {
    Ok(match run_maintenance(&circulation, Utc::now()).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(err) => error_response("Sweep", err),
    })
}
