pub mod api;
pub mod circulation;
pub mod config;
pub mod error;
pub mod expiration_sweeper;
pub mod fines;
pub mod fulfillment;
pub mod inventory_ledger;
pub mod loan_desk;
pub mod notifications;
pub mod request_workflow;
pub mod reservation_queue;
pub mod state;
pub mod store;
pub mod unit_of_work;

pub use circulation::Circulation;
pub use config::CirculationPolicy;
pub use error::{CirculationError, ErrorKind};
