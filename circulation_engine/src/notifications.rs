use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::api::{PatronId, Priority};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub patron_id: PatronId,
    pub message: String,
}

/// Fire-and-forget delivery of patron messages.
///
/// Errors are only logged by the engine, a failed delivery never undoes
/// the operation that produced the message.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, patron_id: PatronId, message: &str) -> anyhow::Result<()>;
}

/// Writes every notification as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait::async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, patron_id: PatronId, message: &str) -> anyhow::Result<()> {
        tracing::info!(patron_id, text = message, "Patron notified");
        Ok(())
    }
}

/// Keeps delivered notifications in memory
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    sent: parking_lot::Mutex<Vec<Notification>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, patron_id: PatronId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|notification| notification.patron_id == patron_id)
            .map(|notification| notification.message.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(&self, patron_id: PatronId, message: &str) -> anyhow::Result<()> {
        self.sent.lock().push(Notification {
            patron_id,
            message: message.to_string(),
        });
        Ok(())
    }
}

/// Delivers committed notifications in order, logging failures
pub(crate) async fn dispatch(sink: &dyn NotificationSink, notifications: Vec<Notification>) {
    for notification in notifications {
        if let Err(e) = sink
            .notify(notification.patron_id, &notification.message)
            .await
        {
            tracing::warn!(
                patron_id = notification.patron_id,
                "Failed to deliver notification: {:#}",
                e
            );
        }
    }
}

pub(crate) mod messages {
    use super::*;

    fn format_date(date: DateTime<Utc>) -> String {
        date.format("%B %-d, %Y").to_string()
    }

    pub fn reservation_created(title: &str, priority: Priority) -> String {
        format!(
            "You have successfully reserved '{}'. You are #{} in the queue. \
             You will be notified when the book becomes available.",
            title, priority
        )
    }

    pub fn request_rejected(title: &str) -> String {
        format!(
            "Your reservation request for '{}' has been rejected. \
             Please contact the librarian for more information.",
            title
        )
    }

    pub fn auto_issued(title: &str, due_at: DateTime<Utc>) -> String {
        format!(
            "The book '{}' you reserved has been automatically issued to you. \
             Please return it by {}.",
            title,
            format_date(due_at)
        )
    }

    pub fn ready_for_collection(title: &str, collection_window_hours: i64) -> String {
        format!(
            "Good news! The book '{}' you reserved is now available. \
             Please visit the library within {} hours to collect it, \
             or your reservation will be cancelled.",
            title, collection_window_hours
        )
    }

    pub fn reservation_expired(title: &str) -> String {
        format!(
            "Your reservation for '{}' has expired. \
             You can create a new reservation if the book is still unavailable.",
            title
        )
    }

    pub fn request_issued(title: &str, due_at: DateTime<Utc>) -> String {
        format!(
            "Your request for '{}' has been approved. \
             Please collect the book from the library and return it by {}.",
            title,
            format_date(due_at)
        )
    }

    pub fn book_issued(title: &str, due_at: DateTime<Utc>) -> String {
        format!(
            "The book '{}' has been issued to you. Please return it by {}.",
            title,
            format_date(due_at)
        )
    }

    pub fn fine_charged(title: &str, amount: Decimal) -> String {
        format!(
            "You have been charged a fine of {:.2} for late return of '{}'. \
             Please settle the payment at the library.",
            amount, title
        )
    }

    pub fn book_returned(title: &str) -> String {
        format!("Your book '{}' has been returned successfully.", title)
    }

    pub fn payment_recorded(title: &str, amount: Decimal) -> String {
        format!(
            "Your payment of {:.2} for the fine related to '{}' has been recorded.",
            amount, title
        )
    }
}
