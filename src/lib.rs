//! CRF layer and CRF loss for candle.
//!
//! [`CRF::apply`] decodes emissions and returns a [`Prediction`] that remembers
//! the layer it came from. [`crf_loss`] and [`ConditionalRandomFieldLoss`]
//! find that layer again, ask it for the per-example negative log-likelihood
//! and average it.

pub mod crf;
pub mod error;
pub mod layer;
pub mod loss;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use crf::{CrfConfig, Reduction, CRF};
pub use error::LossError;
pub use layer::{Layer, Prediction, Provenance};
pub use loss::{crf_loss, ConditionalRandomFieldLoss, CrfLossFn, Loss, LossConfig};
pub use registry::SerializedLoss;
