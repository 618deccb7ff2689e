pub mod app;
pub mod availability;
pub mod booking;
pub mod engine;
pub mod lifecycle;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod reconcile;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod verification;
pub mod wal;
