use std::ops::Deref;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};

use crate::api::{
    Book, BookId, Fine, FineId, Loan, LoanId, NewBook, NewFine, NewLoan, NewPayment,
    NewReservation, NewReservationRequest, PatronId, Payment, Priority, RequestId, Reservation,
    ReservationId, ReservationRequest,
};
use crate::state::{Lifecycle, ReservationState};
use crate::store::{CirculationStore, StoreError, StoreTransaction};

pub struct PostgresCirculationStoreConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Number of connections, i.e. transactions that can be open at once
    pub pool_size: usize,
}

/// Fixed pool of connections.
///
/// A transaction keeps one connection for itself between `BEGIN` and
/// `COMMIT`/`ROLLBACK`. Transactions on different connections run
/// concurrently and serialize on row locks only. When every connection
/// is taken `begin` waits for one to come back.
pub struct PostgresCirculationStore {
    connection_str: String,
    connections: Vec<Arc<Mutex<Client>>>,
    /// One permit per connection, a holder is guaranteed a free connection
    permits: Arc<Semaphore>,
}

async fn connect(connection_str: &str) -> Result<Client, tokio_postgres::Error> {
    let (client, connection) = tokio_postgres::connect(connection_str, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Postgres connection error: {}", e);
        }
    });
    Ok(client)
}

const SCHEMA: &[(&str, &str)] = &[
    (
        "books",
        "
        CREATE TABLE IF NOT EXISTS books (
            id                  SERIAL PRIMARY KEY,
            title               TEXT NOT NULL,
            total_copies        INTEGER NOT NULL CHECK (total_copies >= 0),
            available_copies    INTEGER NOT NULL CHECK (available_copies >= 0),
            CHECK (available_copies <= total_copies)
            )
        ",
    ),
    (
        "reservation_requests",
        "
        CREATE TABLE IF NOT EXISTS reservation_requests (
            id                  SERIAL PRIMARY KEY,
            book_id             INTEGER NOT NULL REFERENCES books (id),
            patron_id           INTEGER NOT NULL,
            submitted_at        TIMESTAMPTZ NOT NULL,
            status              TEXT NOT NULL,
            notes               TEXT NOT NULL DEFAULT ''
            );
        CREATE UNIQUE INDEX IF NOT EXISTS reservation_requests_one_pending
            ON reservation_requests (book_id, patron_id) WHERE status = 'pending';
        ",
    ),
    (
        "reservations",
        "
        CREATE TABLE IF NOT EXISTS reservations (
            id                  SERIAL PRIMARY KEY,
            book_id             INTEGER NOT NULL REFERENCES books (id),
            patron_id           INTEGER NOT NULL,
            created_at          TIMESTAMPTZ NOT NULL,
            status              TEXT NOT NULL,
            priority            INTEGER NOT NULL CHECK (priority > 0),
            expires_at          TIMESTAMPTZ NOT NULL,
            fulfilled_at        TIMESTAMPTZ,
            notified_at         TIMESTAMPTZ,
            notes               TEXT NOT NULL DEFAULT ''
            );
        CREATE UNIQUE INDEX IF NOT EXISTS reservations_one_active
            ON reservations (book_id, patron_id) WHERE status = 'active';
        CREATE INDEX IF NOT EXISTS reservations_queue
            ON reservations (book_id, priority) WHERE status = 'active';
        ",
    ),
    (
        "loans",
        "
        CREATE TABLE IF NOT EXISTS loans (
            id                  SERIAL PRIMARY KEY,
            book_id             INTEGER NOT NULL REFERENCES books (id),
            patron_id           INTEGER NOT NULL,
            reservation_id      INTEGER REFERENCES reservations (id),
            issued_at           TIMESTAMPTZ NOT NULL,
            due_at              TIMESTAMPTZ NOT NULL,
            returned_at         TIMESTAMPTZ,
            status              TEXT NOT NULL,
            fine_amount         NUMERIC(10, 2) NOT NULL DEFAULT 0
            )
        ",
    ),
    (
        "fines",
        "
        CREATE TABLE IF NOT EXISTS fines (
            id                  SERIAL PRIMARY KEY,
            loan_id             INTEGER NOT NULL UNIQUE REFERENCES loans (id),
            patron_id           INTEGER NOT NULL,
            amount              NUMERIC(10, 2) NOT NULL,
            reason              TEXT NOT NULL,
            status              TEXT NOT NULL,
            created_at          TIMESTAMPTZ NOT NULL
            )
        ",
    ),
    (
        "payments",
        "
        CREATE TABLE IF NOT EXISTS payments (
            id                  SERIAL PRIMARY KEY,
            fine_id             INTEGER NOT NULL REFERENCES fines (id),
            patron_id           INTEGER NOT NULL,
            amount              NUMERIC(10, 2) NOT NULL,
            method              TEXT NOT NULL,
            receipt_number      TEXT NOT NULL,
            paid_at             TIMESTAMPTZ NOT NULL
            )
        ",
    ),
];

impl PostgresCirculationStore {
    pub async fn init(config: PostgresCirculationStoreConfig) -> anyhow::Result<Self> {
        let connection_str = format!(
            "postgresql://{}:{}@{}",
            config.username, config.password, config.hostname
        );
        let pool_size = config.pool_size.max(1);
        tracing::info!(
            pool_size,
            "Connecting to postgres at {}",
            config.hostname
        );

        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let client = connect(&connection_str)
                .await
                .context("Failed to start postgres")?;
            connections.push(Arc::new(Mutex::new(client)));
        }

        let client = connections[0].lock().await;
        for (table, ddl) in SCHEMA {
            client
                .batch_execute(ddl)
                .await
                .with_context(|| format!("Failed to setup {} table", table))?;
        }
        drop(client);

        Ok(Self {
            connection_str,
            permits: Arc::new(Semaphore::new(connections.len())),
            connections,
        })
    }

    async fn checkout(&self) -> Result<PooledClient, StoreError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::Other("Connection pool closed".to_string()))?;
        let mut client = self
            .connections
            .iter()
            .find_map(|connection| connection.clone().try_lock_owned().ok())
            .ok_or_else(|| StoreError::Other("No idle connection for permit".to_string()))?;
        if client.is_closed() {
            tracing::warn!("Postgres connection closed, reconnecting");
            *client = connect(&self.connection_str).await?;
        }
        Ok(PooledClient {
            client,
            _permit: permit,
        })
    }
}

#[async_trait::async_trait]
impl CirculationStore for PostgresCirculationStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let client = self.checkout().await?;
        client.batch_execute("BEGIN").await?;
        Ok(Box::new(PostgresTransaction {
            client: Some(client),
        }))
    }
}

/// Connection on loan to one transaction. The lock is released before
/// the permit, so a fresh permit always finds an idle connection.
struct PooledClient {
    client: OwnedMutexGuard<Client>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

struct PostgresTransaction {
    /// Taken on commit/rollback, a transaction without it is finished
    client: Option<PooledClient>,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Client, StoreError> {
        self.client.as_deref().ok_or(StoreError::TransactionClosed)
    }

    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>, StoreError> {
        let client = self.client()?;
        let stmt = client.prepare(sql).await?;
        Ok(client.query(&stmt, params).await?)
    }

    async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<u64, StoreError> {
        let client = self.client()?;
        let stmt = client.prepare(sql).await?;
        Ok(client.execute(&stmt, params).await?)
    }

    /// Runs an insert, reporting unique constraint violations separately
    async fn insert(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        constraint: String,
    ) -> Result<Row, StoreError> {
        let client = self.client()?;
        let stmt = client.prepare(sql).await?;
        match client.query(&stmt, params).await {
            Ok(rows) => rows
                .into_iter()
                .next()
                .ok_or_else(|| StoreError::Other("Id not returned".to_string())),
            Err(err)
                if err
                    .as_db_error()
                    // This is unique constraint validation error
                    .map(|db_err| db_err.code() == &SqlState::from_code("23505"))
                    .unwrap_or_default() =>
            {
                Err(StoreError::UniqueViolation(constraint))
            }
            Err(other_err) => Err(other_err.into()),
        }
    }

    async fn finish(mut self: Box<Self>, statement: &str) -> Result<(), StoreError> {
        let client = self.client.take().ok_or(StoreError::TransactionClosed)?;
        client.batch_execute(statement).await?;
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        // The connection travels with the rollback, so nobody reuses it
        // while the aborted transaction is still open
        if let Some(client) = self.client.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = client.batch_execute("ROLLBACK").await {
                            tracing::error!("Failed to roll back abandoned transaction: {}", e);
                        }
                    });
                }
                Err(_) => tracing::error!("Abandoned transaction dropped outside of runtime"),
            }
        }
    }
}

fn parse_state<S: Lifecycle>(value: &str) -> Result<S, StoreError> {
    S::parse(value).ok_or_else(|| {
        StoreError::Corrupted(format!("Unknown {} status '{}'", S::ENTITY, value))
    })
}

const BOOK_COLUMNS: &str = "id, title, total_copies, available_copies";

fn book_from_row(row: &Row) -> Result<Book, StoreError> {
    Ok(Book {
        book_id: row.try_get(0)?,
        title: row.try_get(1)?,
        total_copies: row.try_get(2)?,
        available_copies: row.try_get(3)?,
    })
}

const RESERVATION_COLUMNS: &str = "id, book_id, patron_id, created_at, status, priority, \
     expires_at, fulfilled_at, notified_at, notes";

fn reservation_from_row(row: &Row) -> Result<Reservation, StoreError> {
    let status: String = row.try_get(4)?;
    Ok(Reservation {
        reservation_id: row.try_get(0)?,
        book_id: row.try_get(1)?,
        patron_id: row.try_get(2)?,
        created_at: row.try_get(3)?,
        status: parse_state(&status)?,
        priority: row.try_get(5)?,
        expires_at: row.try_get(6)?,
        fulfilled_at: row.try_get(7)?,
        notified_at: row.try_get(8)?,
        notes: row.try_get(9)?,
    })
}

const REQUEST_COLUMNS: &str = "id, book_id, patron_id, submitted_at, status, notes";

fn request_from_row(row: &Row) -> Result<ReservationRequest, StoreError> {
    let status: String = row.try_get(4)?;
    Ok(ReservationRequest {
        request_id: row.try_get(0)?,
        book_id: row.try_get(1)?,
        patron_id: row.try_get(2)?,
        submitted_at: row.try_get(3)?,
        status: parse_state(&status)?,
        notes: row.try_get(5)?,
    })
}

const LOAN_COLUMNS: &str =
    "id, book_id, patron_id, reservation_id, issued_at, due_at, returned_at, status, fine_amount";

fn loan_from_row(row: &Row) -> Result<Loan, StoreError> {
    let status: String = row.try_get(7)?;
    Ok(Loan {
        loan_id: row.try_get(0)?,
        book_id: row.try_get(1)?,
        patron_id: row.try_get(2)?,
        reservation_id: row.try_get(3)?,
        issued_at: row.try_get(4)?,
        due_at: row.try_get(5)?,
        returned_at: row.try_get(6)?,
        status: parse_state(&status)?,
        fine_amount: row.try_get(8)?,
    })
}

const FINE_COLUMNS: &str = "id, loan_id, patron_id, amount, reason, status, created_at";

fn fine_from_row(row: &Row) -> Result<Fine, StoreError> {
    let status: String = row.try_get(5)?;
    Ok(Fine {
        fine_id: row.try_get(0)?,
        loan_id: row.try_get(1)?,
        patron_id: row.try_get(2)?,
        amount: row.try_get(3)?,
        reason: row.try_get(4)?,
        status: parse_state(&status)?,
        created_at: row.try_get(6)?,
    })
}

const PAYMENT_COLUMNS: &str = "id, fine_id, patron_id, amount, method, receipt_number, paid_at";

fn payment_from_row(row: &Row) -> Result<Payment, StoreError> {
    Ok(Payment {
        payment_id: row.try_get(0)?,
        fine_id: row.try_get(1)?,
        patron_id: row.try_get(2)?,
        amount: row.try_get(3)?,
        method: row.try_get(4)?,
        receipt_number: row.try_get(5)?,
        paid_at: row.try_get(6)?,
    })
}

fn first<T>(
    rows: Vec<Row>,
    map: impl Fn(&Row) -> Result<T, StoreError>,
) -> Result<Option<T>, StoreError> {
    rows.first().map(map).transpose()
}

fn all<T>(
    rows: Vec<Row>,
    map: impl Fn(&Row) -> Result<T, StoreError>,
) -> Result<Vec<T>, StoreError> {
    rows.iter().map(map).collect()
}

#[async_trait::async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn add_book(&mut self, book: NewBook) -> Result<Book, StoreError> {
        let rows = self
            .query(
                &format!(
                    "INSERT INTO books (title, total_copies, available_copies) \
                     VALUES ($1, $2, $2) RETURNING {}",
                    BOOK_COLUMNS
                ),
                &[&book.title, &book.total_copies],
            )
            .await?;
        first(rows, book_from_row)?.ok_or_else(|| StoreError::Other("Id not returned".to_string()))
    }

    async fn get_book(&mut self, book_id: BookId) -> Result<Option<Book>, StoreError> {
        let rows = self
            .query(
                &format!("SELECT {} FROM books WHERE id = $1", BOOK_COLUMNS),
                &[&book_id],
            )
            .await?;
        first(rows, book_from_row)
    }

    async fn lock_book(&mut self, book_id: BookId) -> Result<Option<Book>, StoreError> {
        let rows = self
            .query(
                &format!("SELECT {} FROM books WHERE id = $1 FOR UPDATE", BOOK_COLUMNS),
                &[&book_id],
            )
            .await?;
        first(rows, book_from_row)
    }

    async fn update_copies(
        &mut self,
        book_id: BookId,
        total_copies: i32,
        available_copies: i32,
    ) -> Result<(), StoreError> {
        let updated = self
            .execute(
                "UPDATE books SET total_copies = $2, available_copies = $3 WHERE id = $1",
                &[&book_id, &total_copies, &available_copies],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Other(format!("Book {} does not exist", book_id)));
        }
        Ok(())
    }

    async fn books_awaiting_fulfillment(&mut self) -> Result<Vec<BookId>, StoreError> {
        let rows = self
            .query(
                "SELECT DISTINCT b.id FROM books b \
                 JOIN reservations r ON r.book_id = b.id \
                 WHERE b.available_copies > 0 AND r.status = 'active' \
                 ORDER BY b.id",
                &[],
            )
            .await?;
        all(rows, |row| Ok(row.try_get(0)?))
    }

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> Result<Reservation, StoreError> {
        let status = ReservationState::Active.as_str();
        let row = self
            .insert(
                &format!(
                    "INSERT INTO reservations \
                     (book_id, patron_id, created_at, status, priority, expires_at, notes) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {}",
                    RESERVATION_COLUMNS
                ),
                &[
                    &reservation.book_id,
                    &reservation.patron_id,
                    &reservation.created_at,
                    &status,
                    &reservation.priority,
                    &reservation.expires_at,
                    &reservation.notes,
                ],
                format!(
                    "active reservation of patron {} for book {}",
                    reservation.patron_id, reservation.book_id
                ),
            )
            .await?;
        reservation_from_row(&row)
    }

    async fn get_reservation(
        &mut self,
        reservation_id: ReservationId,
    ) -> Result<Option<Reservation>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM reservations WHERE id = $1",
                    RESERVATION_COLUMNS
                ),
                &[&reservation_id],
            )
            .await?;
        first(rows, reservation_from_row)
    }

    async fn update_reservation(&mut self, reservation: &Reservation) -> Result<(), StoreError> {
        let status = reservation.status.as_str();
        let updated = self
            .execute(
                "UPDATE reservations SET status = $2, priority = $3, expires_at = $4, \
                 fulfilled_at = $5, notified_at = $6, notes = $7 WHERE id = $1",
                &[
                    &reservation.reservation_id,
                    &status,
                    &reservation.priority,
                    &reservation.expires_at,
                    &reservation.fulfilled_at,
                    &reservation.notified_at,
                    &reservation.notes,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Other(format!(
                "Reservation {} does not exist",
                reservation.reservation_id
            )));
        }
        Ok(())
    }

    async fn active_reservations(
        &mut self,
        book_id: BookId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM reservations WHERE book_id = $1 AND status = 'active' \
                     ORDER BY priority, id",
                    RESERVATION_COLUMNS
                ),
                &[&book_id],
            )
            .await?;
        all(rows, reservation_from_row)
    }

    async fn find_active_reservation(
        &mut self,
        book_id: BookId,
        patron_id: PatronId,
    ) -> Result<Option<Reservation>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM reservations \
                     WHERE book_id = $1 AND patron_id = $2 AND status = 'active'",
                    RESERVATION_COLUMNS
                ),
                &[&book_id, &patron_id],
            )
            .await?;
        first(rows, reservation_from_row)
    }

    async fn shift_priorities_after(
        &mut self,
        book_id: BookId,
        removed_priority: Priority,
    ) -> Result<u64, StoreError> {
        self.execute(
            "UPDATE reservations SET priority = priority - 1 \
             WHERE book_id = $1 AND status = 'active' AND priority > $2",
            &[&book_id, &removed_priority],
        )
        .await
    }

    async fn expired_reservation_ids(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, StoreError> {
        let rows = self
            .query(
                "SELECT id FROM reservations WHERE status = 'active' AND expires_at < $1 \
                 ORDER BY id",
                &[&now],
            )
            .await?;
        all(rows, |row| Ok(row.try_get(0)?))
    }

    async fn patron_reservations(
        &mut self,
        patron_id: PatronId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM reservations WHERE patron_id = $1 \
                     ORDER BY status <> 'active', priority, id",
                    RESERVATION_COLUMNS
                ),
                &[&patron_id],
            )
            .await?;
        all(rows, reservation_from_row)
    }

    async fn insert_request(
        &mut self,
        request: NewReservationRequest,
    ) -> Result<ReservationRequest, StoreError> {
        let row = self
            .insert(
                &format!(
                    "INSERT INTO reservation_requests (book_id, patron_id, submitted_at, status, notes) \
                     VALUES ($1, $2, $3, 'pending', $4) RETURNING {}",
                    REQUEST_COLUMNS
                ),
                &[
                    &request.book_id,
                    &request.patron_id,
                    &request.submitted_at,
                    &request.notes,
                ],
                format!(
                    "pending request of patron {} for book {}",
                    request.patron_id, request.book_id
                ),
            )
            .await?;
        request_from_row(&row)
    }

    async fn get_request(
        &mut self,
        request_id: RequestId,
    ) -> Result<Option<ReservationRequest>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM reservation_requests WHERE id = $1",
                    REQUEST_COLUMNS
                ),
                &[&request_id],
            )
            .await?;
        first(rows, request_from_row)
    }

    async fn update_request(&mut self, request: &ReservationRequest) -> Result<(), StoreError> {
        let status = request.status.as_str();
        let updated = self
            .execute(
                "UPDATE reservation_requests SET status = $2, notes = $3 WHERE id = $1",
                &[&request.request_id, &status, &request.notes],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Other(format!(
                "Request {} does not exist",
                request.request_id
            )));
        }
        Ok(())
    }

    async fn find_pending_request(
        &mut self,
        book_id: BookId,
        patron_id: PatronId,
    ) -> Result<Option<ReservationRequest>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM reservation_requests \
                     WHERE book_id = $1 AND patron_id = $2 AND status = 'pending'",
                    REQUEST_COLUMNS
                ),
                &[&book_id, &patron_id],
            )
            .await?;
        first(rows, request_from_row)
    }

    async fn pending_requests(&mut self) -> Result<Vec<ReservationRequest>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM reservation_requests WHERE status = 'pending' \
                     ORDER BY submitted_at, id",
                    REQUEST_COLUMNS
                ),
                &[],
            )
            .await?;
        all(rows, request_from_row)
    }

    async fn insert_loan(&mut self, loan: NewLoan) -> Result<Loan, StoreError> {
        let row = self
            .insert(
                &format!(
                    "INSERT INTO loans (book_id, patron_id, reservation_id, issued_at, due_at, status) \
                     VALUES ($1, $2, $3, $4, $5, 'issued') RETURNING {}",
                    LOAN_COLUMNS
                ),
                &[
                    &loan.book_id,
                    &loan.patron_id,
                    &loan.reservation_id,
                    &loan.issued_at,
                    &loan.due_at,
                ],
                format!("loan of book {} to patron {}", loan.book_id, loan.patron_id),
            )
            .await?;
        loan_from_row(&row)
    }

    async fn get_loan(&mut self, loan_id: LoanId) -> Result<Option<Loan>, StoreError> {
        let rows = self
            .query(
                &format!("SELECT {} FROM loans WHERE id = $1", LOAN_COLUMNS),
                &[&loan_id],
            )
            .await?;
        first(rows, loan_from_row)
    }

    async fn update_loan(&mut self, loan: &Loan) -> Result<(), StoreError> {
        let status = loan.status.as_str();
        let updated = self
            .execute(
                "UPDATE loans SET due_at = $2, returned_at = $3, status = $4, fine_amount = $5 \
                 WHERE id = $1",
                &[
                    &loan.loan_id,
                    &loan.due_at,
                    &loan.returned_at,
                    &status,
                    &loan.fine_amount,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Other(format!(
                "Loan {} does not exist",
                loan.loan_id
            )));
        }
        Ok(())
    }

    async fn loans_past_due(&mut self, now: DateTime<Utc>) -> Result<Vec<Loan>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM loans WHERE status <> 'returned' AND due_at < $1 ORDER BY id",
                    LOAN_COLUMNS
                ),
                &[&now],
            )
            .await?;
        all(rows, loan_from_row)
    }

    async fn patron_loans(&mut self, patron_id: PatronId) -> Result<Vec<Loan>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM loans WHERE patron_id = $1 ORDER BY issued_at DESC, id DESC",
                    LOAN_COLUMNS
                ),
                &[&patron_id],
            )
            .await?;
        all(rows, loan_from_row)
    }

    async fn insert_fine(&mut self, fine: NewFine) -> Result<Fine, StoreError> {
        let row = self
            .insert(
                &format!(
                    "INSERT INTO fines (loan_id, patron_id, amount, reason, status, created_at) \
                     VALUES ($1, $2, $3, $4, 'pending', $5) RETURNING {}",
                    FINE_COLUMNS
                ),
                &[
                    &fine.loan_id,
                    &fine.patron_id,
                    &fine.amount,
                    &fine.reason,
                    &fine.created_at,
                ],
                format!("fine for loan {}", fine.loan_id),
            )
            .await?;
        fine_from_row(&row)
    }

    async fn get_fine(&mut self, fine_id: FineId) -> Result<Option<Fine>, StoreError> {
        let rows = self
            .query(
                &format!("SELECT {} FROM fines WHERE id = $1", FINE_COLUMNS),
                &[&fine_id],
            )
            .await?;
        first(rows, fine_from_row)
    }

    async fn update_fine(&mut self, fine: &Fine) -> Result<(), StoreError> {
        let status = fine.status.as_str();
        let updated = self
            .execute(
                "UPDATE fines SET amount = $2, status = $3 WHERE id = $1",
                &[&fine.fine_id, &fine.amount, &status],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::Other(format!(
                "Fine {} does not exist",
                fine.fine_id
            )));
        }
        Ok(())
    }

    async fn fine_for_loan(&mut self, loan_id: LoanId) -> Result<Option<Fine>, StoreError> {
        let rows = self
            .query(
                &format!("SELECT {} FROM fines WHERE loan_id = $1", FINE_COLUMNS),
                &[&loan_id],
            )
            .await?;
        first(rows, fine_from_row)
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> Result<Payment, StoreError> {
        let row = self
            .insert(
                &format!(
                    "INSERT INTO payments (fine_id, patron_id, amount, method, receipt_number, paid_at) \
                     VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
                    PAYMENT_COLUMNS
                ),
                &[
                    &payment.fine_id,
                    &payment.patron_id,
                    &payment.amount,
                    &payment.method,
                    &payment.receipt_number,
                    &payment.paid_at,
                ],
                format!("payment {}", payment.receipt_number),
            )
            .await?;
        payment_from_row(&row)
    }

    async fn payments_for_fine(&mut self, fine_id: FineId) -> Result<Vec<Payment>, StoreError> {
        let rows = self
            .query(
                &format!(
                    "SELECT {} FROM payments WHERE fine_id = $1 ORDER BY id",
                    PAYMENT_COLUMNS
                ),
                &[&fine_id],
            )
            .await?;
        all(rows, payment_from_row)
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.client()?
            .batch_execute(&format!("SAVEPOINT {}", name))
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.client()?
            .batch_execute(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await?;
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.client()?
            .batch_execute(&format!("RELEASE SAVEPOINT {}", name))
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }
}
