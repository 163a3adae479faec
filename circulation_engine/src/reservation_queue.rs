use chrono::{DateTime, Duration, Utc};
use itertools::Itertools;

use crate::api::{BookId, NewReservation, PatronId, Priority, Reservation, ReservationId};
use crate::error::CirculationError;
use crate::inventory_ledger::InventoryLedger;
use crate::notifications::messages;
use crate::state::{Lifecycle, ReservationState};
use crate::store::StoreError;
use crate::unit_of_work::UnitOfWork;

/// Maintains the per-book waiting lists.
///
/// Active priorities of a book always form `1..=N`. Every operation that
/// reads or reshapes a queue holds the book lock first, so two units can
/// never compute the same next priority.
#[derive(Debug, Clone, Copy)]
pub struct ReservationQueueManager {
    hold_period: Duration,
    ledger: InventoryLedger,
}

fn is_dense(queue: &[Reservation]) -> bool {
    queue
        .iter()
        .map(|reservation| reservation.priority)
        .sorted()
        .eq(1..=queue.len() as Priority)
}

impl ReservationQueueManager {
    pub fn new(hold_period: Duration) -> Self {
        Self {
            hold_period,
            ledger: InventoryLedger,
        }
    }

    pub async fn create(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        patron_id: PatronId,
        notes: String,
        now: DateTime<Utc>,
    ) -> Result<Reservation, CirculationError> {
        let book = self.ledger.lock(unit, book_id).await?;

        if unit
            .store()
            .find_active_reservation(book_id, patron_id)
            .await?
            .is_some()
        {
            return Err(CirculationError::DuplicateActiveReservation { book_id, patron_id });
        }

        let queue = unit.store().active_reservations(book_id).await?;
        if !is_dense(&queue) {
            tracing::warn!(book_id, "Queue priorities are not dense");
            return Err(CirculationError::QueueInconsistent(book_id));
        }
        let priority = queue.len() as Priority + 1;

        let reservation = match unit
            .store()
            .insert_reservation(NewReservation {
                book_id,
                patron_id,
                created_at: now,
                priority,
                expires_at: now + self.hold_period,
                notes,
            })
            .await
        {
            Err(StoreError::UniqueViolation(_)) => {
                return Err(CirculationError::DuplicateActiveReservation { book_id, patron_id })
            }
            other => other?,
        };

        tracing::info!(
            reservation_id = reservation.reservation_id,
            book_id,
            patron_id,
            priority,
            "Reservation created"
        );
        unit.notify(
            patron_id,
            messages::reservation_created(&book.title, priority),
        );
        Ok(reservation)
    }

    pub async fn cancel(
        &self,
        unit: &mut UnitOfWork,
        reservation_id: ReservationId,
        patron_id: PatronId,
    ) -> Result<Reservation, CirculationError> {
        let not_cancellable = || CirculationError::NotFoundOrNotCancellable(reservation_id);

        let book_id = unit
            .store()
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(not_cancellable)?
            .book_id;
        self.ledger.lock(unit, book_id).await?;

        // Read again under the lock, the reservation may have left the queue meanwhile
        let mut reservation = unit
            .store()
            .get_reservation(reservation_id)
            .await?
            .ok_or_else(not_cancellable)?;
        if reservation.status != ReservationState::Active || reservation.patron_id != patron_id {
            return Err(not_cancellable());
        }

        self.leave_queue(unit, &mut reservation, ReservationState::Cancelled)
            .await?;
        tracing::info!(reservation_id, book_id, patron_id, "Reservation cancelled");
        Ok(reservation)
    }

    /// Closes the gap left by `removed_priority`.
    /// The caller must hold the book lock.
    pub async fn renumber(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        removed_priority: Priority,
    ) -> Result<u64, CirculationError> {
        let shifted = unit
            .store()
            .shift_priorities_after(book_id, removed_priority)
            .await?;
        tracing::debug!(book_id, removed_priority, shifted, "Queue renumbered");
        Ok(shifted)
    }

    /// Moves an active reservation to a terminal state and renumbers its queue.
    /// The caller must hold the book lock.
    pub(crate) async fn leave_queue(
        &self,
        unit: &mut UnitOfWork,
        reservation: &mut Reservation,
        next: ReservationState,
    ) -> Result<(), CirculationError> {
        reservation.status = reservation.status.transition_to(next)?;
        unit.store().update_reservation(reservation).await?;
        self.renumber(unit, reservation.book_id, reservation.priority)
            .await?;
        Ok(())
    }

    pub async fn next_in_queue(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
    ) -> Result<Option<Reservation>, CirculationError> {
        Ok(unit
            .store()
            .active_reservations(book_id)
            .await?
            .into_iter()
            .next())
    }

    pub async fn queue(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
    ) -> Result<Vec<Reservation>, CirculationError> {
        self.ledger.book(unit, book_id).await?;
        Ok(unit.store().active_reservations(book_id).await?)
    }

    pub async fn patron_reservations(
        &self,
        unit: &mut UnitOfWork,
        patron_id: PatronId,
    ) -> Result<Vec<Reservation>, CirculationError> {
        Ok(unit.store().patron_reservations(patron_id).await?)
    }
}

#[cfg(test)]
mod reservation_queue_tests {
    use crate::api::Book;
    use crate::store::InMemoryCirculationStore;

    use super::*;

    async fn setup() -> (InMemoryCirculationStore, Book) {
        let store = InMemoryCirculationStore::new();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        let book = InventoryLedger
            .add_book(&mut unit, "Dune".to_string(), 1)
            .await
            .unwrap();
        unit.commit().await.unwrap();
        (store, book)
    }

    fn priorities(queue: &[Reservation]) -> Vec<(PatronId, Priority)> {
        queue.iter().map(|r| (r.patron_id, r.priority)).collect()
    }

    #[tokio::test]
    /// Checks numbering through creation and cancellation
    /// 1. Three patrons reserve - priorities 1, 2, 3 and expiry after hold period
    /// 2. Second patron cancels - queue is (1, 1), (3, 2)
    /// 3. New patron joins at the end with priority 3
    /// 4. Cancelled reservation keeps its last priority
    async fn test_create_and_cancel_keep_queue_dense() {
        let (store, book) = setup().await;
        let manager = ReservationQueueManager::new(Duration::days(7));
        let now = Utc::now();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();

        for patron_id in 1..=3 {
            let reservation = manager
                .create(&mut unit, book.book_id, patron_id, String::new(), now)
                .await
                .unwrap();
            assert_eq!(reservation.priority, patron_id);
            assert_eq!(reservation.expires_at, now + Duration::days(7));
        }
        let second = manager
            .patron_reservations(&mut unit, 2)
            .await
            .unwrap()
            .remove(0);

        let cancelled = manager
            .cancel(&mut unit, second.reservation_id, 2)
            .await
            .unwrap();
        assert_eq!(cancelled.status, ReservationState::Cancelled);
        assert_eq!(
            priorities(&manager.queue(&mut unit, book.book_id).await.unwrap()),
            vec![(1, 1), (3, 2)]
        );

        manager
            .create(&mut unit, book.book_id, 4, String::new(), now)
            .await
            .unwrap();
        assert_eq!(
            priorities(&manager.queue(&mut unit, book.book_id).await.unwrap()),
            vec![(1, 1), (3, 2), (4, 3)]
        );
        assert_eq!(
            manager
                .next_in_queue(&mut unit, book.book_id)
                .await
                .unwrap()
                .map(|r| r.patron_id),
            Some(1)
        );

        let history = manager.patron_reservations(&mut unit, 2).await.unwrap();
        assert_eq!(history[0].priority, 2);
        assert_eq!(history[0].status, ReservationState::Cancelled);
    }

    #[tokio::test]
    /// Checks rejected creations and cancellations
    /// 1. Patron reserves twice - duplicate is rejected
    /// 2. Other patron cannot cancel it
    /// 3. Owner cancels, second cancel is rejected
    /// 4. Unknown reservation cannot be cancelled
    async fn test_rejected_operations() {
        let (store, book) = setup().await;
        let manager = ReservationQueueManager::new(Duration::days(7));
        let now = Utc::now();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();

        let reservation = manager
            .create(&mut unit, book.book_id, 1, String::new(), now)
            .await
            .unwrap();
        assert!(matches!(
            manager
                .create(&mut unit, book.book_id, 1, String::new(), now)
                .await,
            Err(CirculationError::DuplicateActiveReservation { .. })
        ));
        assert!(matches!(
            manager.cancel(&mut unit, reservation.reservation_id, 2).await,
            Err(CirculationError::NotFoundOrNotCancellable(..))
        ));
        manager
            .cancel(&mut unit, reservation.reservation_id, 1)
            .await
            .unwrap();
        assert!(matches!(
            manager.cancel(&mut unit, reservation.reservation_id, 1).await,
            Err(CirculationError::NotFoundOrNotCancellable(..))
        ));
        assert!(matches!(
            manager.cancel(&mut unit, 999, 1).await,
            Err(CirculationError::NotFoundOrNotCancellable(999))
        ));
        assert!(matches!(
            manager
                .create(&mut unit, book.book_id + 1, 1, String::new(), now)
                .await,
            Err(CirculationError::BookNotFound(..))
        ));
    }

    #[tokio::test]
    /// Checks that a gap in the queue is reported instead of being extended
    async fn test_gap_in_queue_is_reported() {
        let (store, book) = setup().await;
        let manager = ReservationQueueManager::new(Duration::days(7));
        let now = Utc::now();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        unit.store()
            .insert_reservation(NewReservation {
                book_id: book.book_id,
                patron_id: 1,
                created_at: now,
                priority: 2,
                expires_at: now,
                notes: String::new(),
            })
            .await
            .unwrap();

        let result = manager
            .create(&mut unit, book.book_id, 2, String::new(), now)
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err, CirculationError::QueueInconsistent(..)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    /// Checks the confirmation sent on creation
    async fn test_creation_notifies_patron() {
        let (store, book) = setup().await;
        let manager = ReservationQueueManager::new(Duration::days(7));
        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        manager
            .create(&mut unit, book.book_id, 1, String::new(), Utc::now())
            .await
            .unwrap();
        manager
            .create(&mut unit, book.book_id, 2, String::new(), Utc::now())
            .await
            .unwrap();

        let notifications = unit.commit().await.unwrap();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[1].patron_id, 2);
        assert_eq!(
            notifications[1].message,
            "You have successfully reserved 'Dune'. You are #2 in the queue. \
             You will be notified when the book becomes available."
        );
    }
}
