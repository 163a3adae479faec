use chrono::{DateTime, Utc};

use crate::api::{Reservation, ReservationId};
use crate::error::CirculationError;
use crate::inventory_ledger::InventoryLedger;
use crate::notifications::messages;
use crate::reservation_queue::ReservationQueueManager;
use crate::state::ReservationState;
use crate::unit_of_work::UnitOfWork;

/// Retires reservations nobody collected before `expires_at`.
///
/// Candidates are listed first and every one is expired in its own unit,
/// re-checked under the book lock, so re-running a sweep is harmless.
#[derive(Debug, Clone, Copy)]
pub struct ExpirationSweeper {
    queue: ReservationQueueManager,
    ledger: InventoryLedger,
}

impl ExpirationSweeper {
    pub fn new(queue: ReservationQueueManager) -> Self {
        Self {
            queue,
            ledger: InventoryLedger,
        }
    }

    pub async fn candidates(
        &self,
        unit: &mut UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, CirculationError> {
        Ok(unit.store().expired_reservation_ids(now).await?)
    }

    /// Expires a single reservation, `None` when it is no longer due
    pub async fn expire_one(
        &self,
        unit: &mut UnitOfWork,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<Reservation>, CirculationError> {
        let Some(reservation) = unit.store().get_reservation(reservation_id).await? else {
            return Ok(None);
        };
        let book = self.ledger.lock(unit, reservation.book_id).await?;

        let Some(mut reservation) = unit.store().get_reservation(reservation_id).await? else {
            return Ok(None);
        };
        if reservation.status != ReservationState::Active || reservation.expires_at >= now {
            return Ok(None);
        }

        self.queue
            .leave_queue(unit, &mut reservation, ReservationState::Expired)
            .await?;
        unit.notify(
            reservation.patron_id,
            messages::reservation_expired(&book.title),
        );
        tracing::info!(
            reservation_id,
            book_id = book.book_id,
            patron_id = reservation.patron_id,
            "Reservation expired"
        );
        Ok(Some(reservation))
    }
}
