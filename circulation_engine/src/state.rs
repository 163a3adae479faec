use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{entity} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

/// Lifecycle of a persisted entity, checked at every mutation site.
///
/// Every state change goes through [`Lifecycle::transition_to`] so an
/// illegal move (e.g. re-activating an expired reservation) is rejected
/// before anything is written.
pub trait Lifecycle: Copy + Eq + std::fmt::Debug + 'static {
    const ENTITY: &'static str;
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    fn can_transition_to(&self, next: Self) -> bool;

    fn is_terminal(&self) -> bool {
        !Self::ALL.iter().any(|next| self.can_transition_to(*next))
    }

    fn transition_to(self, next: Self) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError {
                entity: Self::ENTITY,
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// Parses the column representation written by `as_str`
    fn parse(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|state| state.as_str() == value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Active,
    Fulfilled,
    Cancelled,
    Expired,
}

impl Lifecycle for ReservationState {
    const ENTITY: &'static str = "reservation";
    const ALL: &'static [Self] = &[
        Self::Active,
        Self::Fulfilled,
        Self::Cancelled,
        Self::Expired,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Fulfilled => "fulfilled",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Fulfilled)
                | (Self::Active, Self::Cancelled)
                | (Self::Active, Self::Expired)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl Lifecycle for RequestState {
    const ENTITY: &'static str = "reservation request";
    const ALL: &'static [Self] = &[
        Self::Pending,
        Self::Approved,
        Self::Rejected,
        Self::Cancelled,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoanState {
    Issued,
    Overdue,
    Returned,
}

impl Lifecycle for LoanState {
    const ENTITY: &'static str = "loan";
    const ALL: &'static [Self] = &[Self::Issued, Self::Overdue, Self::Returned];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Overdue => "overdue",
            Self::Returned => "returned",
        }
    }

    fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Issued, Self::Overdue)
                | (Self::Issued, Self::Returned)
                | (Self::Overdue, Self::Returned)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FineState {
    Pending,
    Paid,
}

impl Lifecycle for FineState {
    const ENTITY: &'static str = "fine";
    const ALL: &'static [Self] = &[Self::Pending, Self::Paid];

    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }

    fn can_transition_to(&self, next: Self) -> bool {
        matches!((self, next), (Self::Pending, Self::Paid))
    }
}
