//! Losses that delegate to the [`CRF`] layer which produced the predictions.
//!
//! Both forms look up the producing layer in the prediction's provenance,
//! check that it is a [`CRF`], ask it for the per-example negative
//! log-likelihood and return the mean as a scalar tensor.

use crate::crf::CRF;
use crate::error::{LossError, Result};
use crate::layer::Prediction;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const CRF_LOSS_CLASS_NAME: &str = "ConditionalRandomFieldLoss";
pub const CRF_LOSS_FN_NAME: &str = "crf_loss";

/// A loss that can be stored in the [registry](crate::registry).
pub trait Loss: Send + Sync {
    /// Instance name, settable through [`LossConfig`].
    fn name(&self) -> &str;

    /// Name the loss is registered under, without the package prefix.
    fn class_name(&self) -> &'static str;

    /// Scalar loss. `sample_weight` is accepted for call compatibility and
    /// does not change the result.
    fn call(
        &self,
        y_true: &Tensor,
        y_pred: &Prediction,
        sample_weight: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// `None` for stateless losses that are restored by name alone.
    fn get_config(&self) -> Option<LossConfig>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LossConfig {
    pub name: String,
}

// -----------------------------------------------------------------------------

fn producing_crf<'a>(y_pred: &'a Prediction, loss: &str) -> Result<&'a CRF> {
    let layer = y_pred
        .producing_layer()
        .ok_or_else(|| LossError::MissingProvenance {
            loss: loss.to_string(),
        })?;

    layer
        .as_any()
        .downcast_ref::<CRF>()
        .ok_or_else(|| LossError::NotCrf {
            loss: loss.to_string(),
        })
}

fn delegate(loss: &str, y_true: &Tensor, y_pred: &Prediction) -> Result<Tensor> {
    let crf = producing_crf(y_pred, loss)?;
    let loss_vector = crf.get_loss(y_true, y_pred)?;
    debug!(
        loss,
        layer = %crf.name,
        batch_size = loss_vector.elem_count(),
        "computing crf loss"
    );
    Ok(loss_vector.mean_all()?)
}

// -----------------------------------------------------------------------------

/// Mean CRF negative log-likelihood, as a configurable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalRandomFieldLoss {
    name: String,
}

impl Default for ConditionalRandomFieldLoss {
    fn default() -> Self {
        Self::new(CRF_LOSS_FN_NAME)
    }
}

impl ConditionalRandomFieldLoss {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn from_config(config: LossConfig) -> Self {
        Self::new(config.name)
    }

    pub fn call(
        &self,
        y_true: &Tensor,
        y_pred: &Prediction,
        _sample_weight: Option<&Tensor>,
    ) -> Result<Tensor> {
        delegate(CRF_LOSS_CLASS_NAME, y_true, y_pred)
    }
}

impl Loss for ConditionalRandomFieldLoss {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_name(&self) -> &'static str {
        CRF_LOSS_CLASS_NAME
    }

    fn call(
        &self,
        y_true: &Tensor,
        y_pred: &Prediction,
        sample_weight: Option<&Tensor>,
    ) -> Result<Tensor> {
        ConditionalRandomFieldLoss::call(self, y_true, y_pred, sample_weight)
    }

    fn get_config(&self) -> Option<LossConfig> {
        Some(LossConfig {
            name: self.name.clone(),
        })
    }
}

// -----------------------------------------------------------------------------

/// Mean CRF negative log-likelihood of `y_true` under the layer that
/// produced `y_pred`.
pub fn crf_loss(y_true: &Tensor, y_pred: &Prediction) -> Result<Tensor> {
    delegate(CRF_LOSS_FN_NAME, y_true, y_pred)
}

/// [`crf_loss`] as a [`Loss`] object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrfLossFn;

impl Loss for CrfLossFn {
    fn name(&self) -> &str {
        CRF_LOSS_FN_NAME
    }

    fn class_name(&self) -> &'static str {
        CRF_LOSS_FN_NAME
    }

    fn call(
        &self,
        y_true: &Tensor,
        y_pred: &Prediction,
        _sample_weight: Option<&Tensor>,
    ) -> Result<Tensor> {
        crf_loss(y_true, y_pred)
    }

    fn get_config(&self) -> Option<LossConfig> {
        None
    }
}
