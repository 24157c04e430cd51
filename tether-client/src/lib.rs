//! TETHER Client - builds and runs the delivery layer.
//!
//! [`DeliveryContext`] is the composition root: one per application, built
//! from a [`TetherConfig`](tether_core::TetherConfig), started with
//! [`init`](DeliveryContext::init) and stopped with
//! [`shutdown`](DeliveryContext::shutdown).

pub mod context;
pub mod error;
pub mod telemetry;

pub use context::{DeliveryContext, DeliveryContextBuilder};
pub use error::{ClientError, ClientResult};
pub use telemetry::init_tracing;
