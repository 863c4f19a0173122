//! Generic graph node for the data-flow graph.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::param::{ParamMap, ParamValue};

/// A node in the generation graph.
///
/// All nodes share this single structure. The `type_id` field references an
/// operator registered in the `OperatorRegistry`, which determines the node's
/// ports, resolution contract and processing behavior.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GraphNode {
    pub id: Uuid,
    /// References an operator registered in the OperatorRegistry.
    /// Examples: "terrain.noise", "terrain.blur", "terrain.normalize"
    pub type_id: String,
    pub params: ParamMap,
}

impl GraphNode {
    pub fn new(type_id: &str, params: ParamMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            type_id: type_id.to_string(),
            params,
        }
    }

    pub fn new_with_id(id: Uuid, type_id: &str, params: ParamMap) -> Self {
        Self {
            id,
            type_id: type_id.to_string(),
            params,
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn param_scalar(&self, name: &str, default: f64) -> f64 {
        self.param(name).and_then(|p| p.as_scalar()).unwrap_or(default)
    }

    pub fn param_integer(&self, name: &str, default: i64) -> i64 {
        self.param(name)
            .and_then(|p| p.as_integer())
            .unwrap_or(default)
    }

    pub fn param_boolean(&self, name: &str, default: bool) -> bool {
        self.param(name)
            .and_then(|p| p.as_boolean())
            .unwrap_or(default)
    }
}
