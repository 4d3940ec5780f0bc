use candle_core::Tensor;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A layer whose outputs can be traced back to it.
pub trait Layer: Any + Send + Sync {
    /// Instance name, used in log events and error messages.
    fn name(&self) -> &str;

    /// Used by losses to check the concrete type of the producing layer.
    fn as_any(&self) -> &dyn Any;
}

// -----------------------------------------------------------------------------

/// Which layer produced a tensor, and what it was called with.
#[derive(Clone)]
pub struct Provenance {
    layer: Arc<dyn Layer>,
    inputs: Vec<Tensor>,
    mask: Option<Tensor>,
}

impl Provenance {
    pub fn new(layer: Arc<dyn Layer>, inputs: Vec<Tensor>, mask: Option<Tensor>) -> Self {
        Self {
            layer,
            inputs,
            mask,
        }
    }

    pub fn layer(&self) -> &Arc<dyn Layer> {
        &self.layer
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    pub fn mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }
}

impl fmt::Debug for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provenance")
            .field("layer", &self.layer.name())
            .field("inputs", &self.inputs.len())
            .field("masked", &self.mask.is_some())
            .finish()
    }
}

// -----------------------------------------------------------------------------

/// Output of a layer, optionally carrying its [`Provenance`].
#[derive(Debug, Clone)]
pub struct Prediction {
    values: Tensor,
    provenance: Option<Provenance>,
}

impl Prediction {
    /// A prediction with no producing layer attached.
    pub fn new(values: Tensor) -> Self {
        Self {
            values,
            provenance: None,
        }
    }

    pub fn with_provenance(values: Tensor, provenance: Provenance) -> Self {
        Self {
            values,
            provenance: Some(provenance),
        }
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn producing_layer(&self) -> Option<&dyn Layer> {
        self.provenance.as_ref().map(|p| p.layer.as_ref())
    }
}

impl From<Tensor> for Prediction {
    fn from(values: Tensor) -> Self {
        Self::new(values)
    }
}
