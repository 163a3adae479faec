use anyhow::{bail, Context};
use reqwest::header::LOCATION;
use reqwest::{Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use serde::de::DeserializeOwned;

use crate::api::{
    AddCopies, BookDetails, BookId, BookResponse, DrainResponse, FineId, IssueBook,
    LoanClosureResponse, LoanId, LoanResponse, PatronAction, PatronId, PatronNote, PaymentDetails,
    PaymentResponse, RequestId, RequestResponse, ReservationId, ReservationResponse, ReturnLoan,
    SweepResponse,
};

pub struct CirculationClient {
    url: String,
    client: ClientWithMiddleware,
}

/// Body of a successful response, the error message otherwise
async fn read_json<T: DeserializeOwned>(response: Response, action: &str) -> anyhow::Result<T> {
    if response.status().is_success() {
        Ok(response.json().await?)
    } else {
        let status = response.status();
        let error: String = response.json().await.unwrap_or_default();
        bail!("Failed to {} ({}) {}", action, status, error)
    }
}

/// `None` when the service refused the call with 409
async fn read_json_unless_conflict<T: DeserializeOwned>(
    response: Response,
    action: &str,
) -> anyhow::Result<Option<T>> {
    if response.status() == StatusCode::CONFLICT {
        Ok(None)
    } else {
        read_json(response, action).await.map(Some)
    }
}

impl CirculationClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let client = ClientBuilder::new(reqwest_client)
            // Insert the tracing middleware
            .with(TracingMiddleware::default())
            .build();

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    /// Calls GET /health endpoint
    pub async fn health(&self) -> anyhow::Result<bool> {
        let response = self
            .client
            .get(format!("{}/health", self.url))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    /// Calls POST /api/book endpoint
    /// Returns book_id of added book taken from the location header
    pub async fn add_book(&self, details: BookDetails) -> anyhow::Result<BookId> {
        let response = self
            .client
            .post(format!("{}/api/book", self.url))
            .json(&details)
            .send()
            .await?;

        if !response.status().is_success() {
            let error: String = response.json().await.unwrap_or_default();
            bail!("Failed to add book {}", error)
        }

        let location_header = response
            .headers()
            .get(LOCATION)
            .context("No location header")?;

        location_header
            .to_str()
            .context("Failed to convert header to str")?
            .strip_prefix("/api/book/")
            .context("Invalid location header")?
            .parse()
            .context("Failed to parse book id")
    }

    /// Calls GET /api/book/{book_id} endpoint
    /// None if the book does not exist
    pub async fn get_book(&self, book_id: BookId) -> anyhow::Result<Option<BookResponse>> {
        let response = self
            .client
            .get(format!("{}/api/book/{}", self.url, book_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else {
            read_json(response, "get book").await.map(Some)
        }
    }

    /// Calls POST /api/book/{book_id}/copies endpoint
    pub async fn add_copies(&self, book_id: BookId, count: i32) -> anyhow::Result<BookResponse> {
        let response = self
            .client
            .post(format!("{}/api/book/{}/copies", self.url, book_id))
            .json(&AddCopies { count })
            .send()
            .await?;
        read_json(response, "add copies").await
    }

    /// Calls GET /api/book/{book_id}/queue endpoint
    pub async fn queue(&self, book_id: BookId) -> anyhow::Result<Vec<ReservationResponse>> {
        let response = self
            .client
            .get(format!("{}/api/book/{}/queue", self.url, book_id))
            .send()
            .await?;
        read_json(response, "get queue").await
    }

    /// Calls POST /api/book/{book_id}/reservations endpoint
    /// None if the patron could not join the queue
    pub async fn create_reservation(
        &self,
        book_id: BookId,
        patron_id: PatronId,
        notes: &str,
    ) -> anyhow::Result<Option<ReservationResponse>> {
        let response = self
            .client
            .post(format!("{}/api/book/{}/reservations", self.url, book_id))
            .json(&PatronNote {
                patron_id,
                notes: notes.to_string(),
            })
            .send()
            .await?;
        read_json_unless_conflict(response, "create reservation").await
    }

    /// Calls POST /api/book/{book_id}/requests endpoint
    /// None if the patron already waits for the book
    pub async fn submit_request(
        &self,
        book_id: BookId,
        patron_id: PatronId,
        notes: &str,
    ) -> anyhow::Result<Option<RequestResponse>> {
        let response = self
            .client
            .post(format!("{}/api/book/{}/requests", self.url, book_id))
            .json(&PatronNote {
                patron_id,
                notes: notes.to_string(),
            })
            .send()
            .await?;
        read_json_unless_conflict(response, "submit request").await
    }

    /// Calls POST /api/book/{book_id}/issue endpoint
    /// None if no copy is on the shelf
    pub async fn issue_book(
        &self,
        book_id: BookId,
        patron_id: PatronId,
        due_at: Option<i64>,
    ) -> anyhow::Result<Option<LoanResponse>> {
        let response = self
            .client
            .post(format!("{}/api/book/{}/issue", self.url, book_id))
            .json(&IssueBook { patron_id, due_at })
            .send()
            .await?;
        read_json_unless_conflict(response, "issue book").await
    }

    /// Calls POST /api/book/{book_id}/availability endpoint
    pub async fn availability_increased(&self, book_id: BookId) -> anyhow::Result<DrainResponse> {
        let response = self
            .client
            .post(format!("{}/api/book/{}/availability", self.url, book_id))
            .send()
            .await?;
        read_json(response, "drain availability").await
    }

    /// Calls GET /api/requests/pending endpoint
    pub async fn pending_requests(&self) -> anyhow::Result<Vec<RequestResponse>> {
        let response = self
            .client
            .get(format!("{}/api/requests/pending", self.url))
            .send()
            .await?;
        read_json(response, "list pending requests").await
    }

    /// Calls POST /api/request/{request_id}/approve endpoint
    pub async fn approve_request(
        &self,
        request_id: RequestId,
    ) -> anyhow::Result<ReservationResponse> {
        let response = self
            .client
            .post(format!("{}/api/request/{}/approve", self.url, request_id))
            .send()
            .await?;
        read_json(response, "approve request").await
    }

    /// Calls POST /api/request/{request_id}/issue endpoint
    /// None if no copy is on the shelf
    pub async fn issue_request(
        &self,
        request_id: RequestId,
    ) -> anyhow::Result<Option<LoanResponse>> {
        let response = self
            .client
            .post(format!("{}/api/request/{}/issue", self.url, request_id))
            .send()
            .await?;
        read_json_unless_conflict(response, "issue request").await
    }

    /// Calls POST /api/request/{request_id}/reject endpoint
    pub async fn reject_request(&self, request_id: RequestId) -> anyhow::Result<RequestResponse> {
        let response = self
            .client
            .post(format!("{}/api/request/{}/reject", self.url, request_id))
            .send()
            .await?;
        read_json(response, "reject request").await
    }

    /// Calls POST /api/request/{request_id}/cancel endpoint
    /// Returns false if there was nothing the patron could cancel
    pub async fn cancel_request(
        &self,
        request_id: RequestId,
        patron_id: PatronId,
    ) -> anyhow::Result<bool> {
        let response = self
            .client
            .post(format!("{}/api/request/{}/cancel", self.url, request_id))
            .json(&PatronAction { patron_id })
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            read_json::<RequestResponse>(response, "cancel request")
                .await
                .map(|_| true)
        }
    }

    /// Calls POST /api/reservation/{reservation_id}/cancel endpoint
    /// Returns false if there was nothing the patron could cancel
    pub async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        patron_id: PatronId,
    ) -> anyhow::Result<bool> {
        let response = self
            .client
            .post(format!(
                "{}/api/reservation/{}/cancel",
                self.url, reservation_id
            ))
            .json(&PatronAction { patron_id })
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            read_json::<ReservationResponse>(response, "cancel reservation")
                .await
                .map(|_| true)
        }
    }

    /// Calls GET /api/patron/{patron_id}/reservations endpoint
    pub async fn patron_reservations(
        &self,
        patron_id: PatronId,
    ) -> anyhow::Result<Vec<ReservationResponse>> {
        let response = self
            .client
            .get(format!("{}/api/patron/{}/reservations", self.url, patron_id))
            .send()
            .await?;
        read_json(response, "list patron reservations").await
    }

    /// Calls GET /api/patron/{patron_id}/loans endpoint
    pub async fn patron_loans(&self, patron_id: PatronId) -> anyhow::Result<Vec<LoanResponse>> {
        let response = self
            .client
            .get(format!("{}/api/patron/{}/loans", self.url, patron_id))
            .send()
            .await?;
        read_json(response, "list patron loans").await
    }

    /// Calls POST /api/loan/{loan_id}/return endpoint
    pub async fn return_loan(
        &self,
        loan_id: LoanId,
        details: ReturnLoan,
    ) -> anyhow::Result<LoanClosureResponse> {
        let response = self
            .client
            .post(format!("{}/api/loan/{}/return", self.url, loan_id))
            .json(&details)
            .send()
            .await?;
        read_json(response, "return loan").await
    }

    /// Calls POST /api/fine/{fine_id}/payments endpoint
    pub async fn record_payment(
        &self,
        fine_id: FineId,
        details: PaymentDetails,
    ) -> anyhow::Result<PaymentResponse> {
        let response = self
            .client
            .post(format!("{}/api/fine/{}/payments", self.url, fine_id))
            .json(&details)
            .send()
            .await?;
        read_json(response, "record payment").await
    }

    /// Calls POST /api/sweep endpoint
    pub async fn sweep(&self) -> anyhow::Result<SweepResponse> {
        let response = self
            .client
            .post(format!("{}/api/sweep", self.url))
            .send()
            .await?;
        read_json(response, "sweep").await
    }
}
