//! Name-based registry so losses can be stored in training configs and
//! restored later.
//!
//! Losses are registered as `"<package>><class_name>"`, e.g.
//! `Addons>ConditionalRandomFieldLoss`. Lookups also accept the bare class name.

use crate::error::{LossError, Result};
use crate::loss::{
    ConditionalRandomFieldLoss, CrfLossFn, Loss, LossConfig, CRF_LOSS_CLASS_NAME,
    CRF_LOSS_FN_NAME,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

pub const PACKAGE: &str = "Addons";

/// Registered names, in registration order.
pub const REGISTERED: [&str; 2] = [CRF_LOSS_CLASS_NAME, CRF_LOSS_FN_NAME];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedLoss {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<LossConfig>,
}

pub fn registered_name(class_name: &str) -> String {
    format!("{}>{}", PACKAGE, class_name)
}

fn strip_package(name: &str) -> &str {
    name.strip_prefix(PACKAGE)
        .and_then(|rest| rest.strip_prefix('>'))
        .unwrap_or(name)
}

pub fn serialize(loss: &dyn Loss) -> SerializedLoss {
    SerializedLoss {
        class_name: registered_name(loss.class_name()),
        config: loss.get_config(),
    }
}

pub fn deserialize(serialized: &SerializedLoss) -> Result<Box<dyn Loss>> {
    trace!(class_name = %serialized.class_name, "deserializing loss");
    match strip_package(&serialized.class_name) {
        CRF_LOSS_CLASS_NAME => {
            let loss = match &serialized.config {
                Some(config) => ConditionalRandomFieldLoss::from_config(config.clone()),
                None => ConditionalRandomFieldLoss::default(),
            };
            Ok(Box::new(loss))
        }
        CRF_LOSS_FN_NAME => Ok(Box::new(CrfLossFn)),
        _ => Err(LossError::UnknownLoss(serialized.class_name.clone())),
    }
}

/// Resolve a loss from a name or from a JSON-encoded [`SerializedLoss`].
pub fn get(identifier: &str) -> Result<Box<dyn Loss>> {
    let identifier = identifier.trim();
    if identifier.starts_with('{') {
        let serialized: SerializedLoss = serde_json::from_str(identifier)?;
        return deserialize(&serialized);
    }
    deserialize(&SerializedLoss {
        class_name: identifier.to_string(),
        config: None,
    })
}
