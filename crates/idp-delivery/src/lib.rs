//! Delivery of signed messages to relying services
//!
//! - [`RetryingDelivery`]: failure capture and periodic redelivery
//! - [`SignedMessageRegenerator`]: fresh id, instant and signature per resend
//! - [`SignedExchangeSender`]: send, verify the signed reply, accept or reject
//! - [`HttpTransport`]: reqwest-backed transport with explicit timeouts
//!
//! One `RetryingDelivery` instance exists per concern (logout, cache
//! invalidation), each with its own regenerator and sender.

pub mod error;
pub mod http_transport;
pub mod regenerator;
pub mod retry;
pub mod sender;

pub use error::{DeliveryError, Result};
pub use http_transport::{HttpTransport, HttpTransportConfig};
pub use regenerator::{PayloadRegenerator, SignedMessageRegenerator};
pub use retry::{CycleReport, RetryPolicy, RetryingDelivery};
pub use sender::{Acceptance, DeliverySender, SignedExchangeSender};
