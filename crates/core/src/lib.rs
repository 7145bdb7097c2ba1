pub mod config;
pub mod error;
pub mod event;
pub mod session;

pub use error::EventBusError;
