use crate::api::{Book, BookId, NewBook};
use crate::error::CirculationError;
use crate::unit_of_work::UnitOfWork;

/// Owner of the copy counters of every book.
///
/// Each mutation locks the book row first and keeps
/// `0 <= available_copies <= total_copies`.
#[derive(Debug, Default, Clone, Copy)]
pub struct InventoryLedger;

impl InventoryLedger {
    pub async fn add_book(
        &self,
        unit: &mut UnitOfWork,
        title: String,
        total_copies: i32,
    ) -> Result<Book, CirculationError> {
        if total_copies < 0 {
            return Err(CirculationError::InvalidCopyCount(total_copies));
        }
        let book = unit
            .store()
            .add_book(NewBook {
                title,
                total_copies,
            })
            .await?;
        tracing::info!(book_id = book.book_id, total_copies, "Book added");
        Ok(book)
    }

    pub async fn book(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
    ) -> Result<Book, CirculationError> {
        unit.store()
            .get_book(book_id)
            .await?
            .ok_or(CirculationError::BookNotFound(book_id))
    }

    /// Takes the per-book lock held until the unit finishes
    pub async fn lock(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
    ) -> Result<Book, CirculationError> {
        unit.store()
            .lock_book(book_id)
            .await?
            .ok_or(CirculationError::BookNotFound(book_id))
    }

    pub async fn increment(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
    ) -> Result<Book, CirculationError> {
        let mut book = self.lock(unit, book_id).await?;
        if book.available_copies >= book.total_copies {
            return Err(CirculationError::CopiesExceedTotal(book_id));
        }
        book.available_copies += 1;
        unit.store()
            .update_copies(book_id, book.total_copies, book.available_copies)
            .await?;
        Ok(book)
    }

    pub async fn decrement(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
    ) -> Result<Book, CirculationError> {
        let mut book = self.lock(unit, book_id).await?;
        if book.available_copies <= 0 {
            return Err(CirculationError::InsufficientCopies(book_id));
        }
        book.available_copies -= 1;
        unit.store()
            .update_copies(book_id, book.total_copies, book.available_copies)
            .await?;
        Ok(book)
    }

    /// New copies arrive on the shelf, both counters grow
    pub async fn add_copies(
        &self,
        unit: &mut UnitOfWork,
        book_id: BookId,
        count: i32,
    ) -> Result<Book, CirculationError> {
        if count <= 0 {
            return Err(CirculationError::InvalidCopyCount(count));
        }
        let mut book = self.lock(unit, book_id).await?;
        book.total_copies = book
            .total_copies
            .checked_add(count)
            .ok_or(CirculationError::InvalidCopyCount(count))?;
        book.available_copies = book
            .available_copies
            .checked_add(count)
            .ok_or(CirculationError::InvalidCopyCount(count))?;
        unit.store()
            .update_copies(book_id, book.total_copies, book.available_copies)
            .await?;
        tracing::info!(book_id, count, "Copies added");
        Ok(book)
    }
}

#[cfg(test)]
mod inventory_ledger_tests {
    use crate::store::InMemoryCirculationStore;

    use super::*;

    #[tokio::test]
    /// Walks the counters through their bounds
    /// 1. Book with one copy: increment is rejected
    /// 2. Decrement to 0, second decrement is rejected
    /// 3. Add two copies - 3 total, 2 available
    /// 4. Invalid counts and unknown books are rejected
    async fn test_counters_stay_in_bounds() {
        let store = InMemoryCirculationStore::new();
        let ledger = InventoryLedger;
        let mut unit = UnitOfWork::begin(&store).await.unwrap();

        let book = ledger
            .add_book(&mut unit, "Dune".to_string(), 1)
            .await
            .unwrap();
        assert!(matches!(
            ledger.increment(&mut unit, book.book_id).await,
            Err(CirculationError::CopiesExceedTotal(..))
        ));

        let book = ledger.decrement(&mut unit, book.book_id).await.unwrap();
        assert_eq!(book.available_copies, 0);
        assert!(matches!(
            ledger.decrement(&mut unit, book.book_id).await,
            Err(CirculationError::InsufficientCopies(..))
        ));

        let book = ledger.add_copies(&mut unit, book.book_id, 2).await.unwrap();
        assert_eq!((book.total_copies, book.available_copies), (3, 2));
        assert_eq!(ledger.book(&mut unit, book.book_id).await.unwrap(), book);

        assert!(matches!(
            ledger.add_copies(&mut unit, book.book_id, 0).await,
            Err(CirculationError::InvalidCopyCount(0))
        ));
        assert!(matches!(
            ledger.add_book(&mut unit, "Broken".to_string(), -1).await,
            Err(CirculationError::InvalidCopyCount(-1))
        ));
        assert!(matches!(
            ledger.increment(&mut unit, book.book_id + 100).await,
            Err(CirculationError::BookNotFound(..))
        ));
    }

    #[tokio::test]
    /// Counters never wrap around
    /// 1. Book with one copy
    /// 2. Adding i32::MAX copies is rejected as an invalid count
    /// 3. Stored counters are unchanged
    async fn test_add_copies_rejects_overflowing_count() {
        let store = InMemoryCirculationStore::new();
        let ledger = InventoryLedger;
        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        let book = ledger
            .add_book(&mut unit, "Dune".to_string(), 1)
            .await
            .unwrap();

        assert!(matches!(
            ledger.add_copies(&mut unit, book.book_id, i32::MAX).await,
            Err(CirculationError::InvalidCopyCount(i32::MAX))
        ));
        assert_eq!(ledger.book(&mut unit, book.book_id).await.unwrap(), book);
    }
}
