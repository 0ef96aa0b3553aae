pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod saga;
pub mod store;
pub mod timers;

pub use error::BillingError;
pub use handlers::BillingService;
