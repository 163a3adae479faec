use crate::api::PatronId;
use crate::notifications::Notification;
use crate::store::{CirculationStore, StoreError, StoreTransaction};

/// One atomic unit of circulation work.
///
/// Wraps a store transaction together with the notifications raised while
/// it runs. Notifications leave the unit only through [`UnitOfWork::commit`],
/// so a rolled back unit never reaches a patron.
pub struct UnitOfWork {
    tx: Box<dyn StoreTransaction>,
    outbox: Vec<Notification>,
    /// Savepoint name with the outbox length at the time it was taken
    savepoints: Vec<(String, usize)>,
}

impl UnitOfWork {
    pub async fn begin(store: &dyn CirculationStore) -> Result<Self, StoreError> {
        Ok(Self {
            tx: store.begin().await?,
            outbox: vec![],
            savepoints: vec![],
        })
    }

    pub fn store(&mut self) -> &mut dyn StoreTransaction {
        self.tx.as_mut()
    }

    pub fn notify(&mut self, patron_id: PatronId, message: String) {
        self.outbox.push(Notification { patron_id, message });
    }

    pub fn pending_notifications(&self) -> &[Notification] {
        &self.outbox
    }

    pub async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.tx.savepoint(name).await?;
        self.savepoints.push((name.to_string(), self.outbox.len()));
        Ok(())
    }

    /// Undoes store writes and notifications raised after the savepoint
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.tx.rollback_to_savepoint(name).await?;
        if let Some(position) = self.savepoints.iter().rposition(|(saved, _)| saved == name) {
            self.outbox.truncate(self.savepoints[position].1);
            self.savepoints.truncate(position + 1);
        }
        Ok(())
    }

    pub async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.tx.release_savepoint(name).await?;
        if let Some(position) = self.savepoints.iter().rposition(|(saved, _)| saved == name) {
            self.savepoints.truncate(position);
        }
        Ok(())
    }

    /// Commits the transaction and hands back notifications ready for delivery
    pub async fn commit(self) -> Result<Vec<Notification>, StoreError> {
        self.tx.commit().await?;
        Ok(self.outbox)
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await
    }
}

#[cfg(test)]
mod unit_of_work_tests {
    use crate::api::NewBook;
    use crate::store::InMemoryCirculationStore;

    use super::*;

    #[tokio::test]
    /// Checks that notifications follow the store writes
    /// 1. Raises a notification, takes a savepoint, raises another one and adds a book
    /// 2. Rolls back to the savepoint - only the first notification is left
    /// 3. Commits - the first notification is returned for delivery
    async fn test_savepoint_discards_later_notifications() {
        let store = InMemoryCirculationStore::new();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();

        unit.notify(1, "kept".to_string());
        unit.savepoint("attempt").await.unwrap();
        unit.notify(2, "discarded".to_string());
        let book = unit
            .store()
            .add_book(NewBook {
                title: "Dune".to_string(),
                total_copies: 1,
            })
            .await
            .unwrap();
        unit.rollback_to_savepoint("attempt").await.unwrap();
        unit.release_savepoint("attempt").await.unwrap();

        assert_eq!(unit.store().get_book(book.book_id).await.unwrap(), None);
        let notifications = unit.commit().await.unwrap();
        assert_eq!(
            notifications,
            vec![Notification {
                patron_id: 1,
                message: "kept".to_string()
            }]
        );
    }

    #[tokio::test]
    /// Checks that a rolled back unit leaves no trace
    async fn test_rollback_discards_everything() {
        let store = InMemoryCirculationStore::new();
        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        let book = unit
            .store()
            .add_book(NewBook {
                title: "Dune".to_string(),
                total_copies: 1,
            })
            .await
            .unwrap();
        unit.notify(1, "never sent".to_string());
        unit.rollback().await.unwrap();

        let mut unit = UnitOfWork::begin(&store).await.unwrap();
        assert_eq!(unit.store().get_book(book.book_id).await.unwrap(), None);
        assert!(unit.pending_notifications().is_empty());
    }
}
