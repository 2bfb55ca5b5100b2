//! Outbound delivery queue
//!
//! - [`processor`]: claims due entries and drives delivery attempts
//! - [`transport`]: MX or relay delivery behind a mockable trait
//! - [`backoff`]: retry schedule
//! - [`bounce`]: non-delivery reports

pub mod backoff;
pub mod bounce;
pub mod processor;
pub mod transport;

pub use backoff::Backoff;
pub use bounce::BounceSender;
pub use processor::QueueProcessor;
pub use transport::{DeliveryTransport, MxTransport};
