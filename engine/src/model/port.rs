//! Ports and connections for the data-flow graph.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Data type carried by a port.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortDataType {
    /// A square grid of f32 height samples at the planned resolution
    Height,
    /// A square grid of f32 values in [0, 1]
    Mask,
    /// Floating point scalar (f64)
    Scalar,
    /// Integer value (i64)
    Integer,
    /// 2D vector
    Vec2,
    /// List/array of values
    List,
    /// Accepts any type (generic)
    Any,
}

/// Direction of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Definition of a port on an operator type.
///
/// Operators expose their ports as an explicit, compile-time enumerable
/// schema; the planner and scheduler never discover ports by introspection.
#[derive(Clone, Debug)]
pub struct PortDefinition {
    /// Internal name used for connections (e.g. "height", "source")
    pub name: String,
    /// Display name shown in tooling (e.g. "Height", "Source")
    pub display_name: String,
    /// Whether this is an input or output port
    pub direction: PortDirection,
    /// Data type of this port
    pub data_type: PortDataType,
    /// List cardinality: an input that accepts any number of connections,
    /// gathered in connection order
    pub list: bool,
}

impl PortDefinition {
    pub fn input(name: &str, display_name: &str, data_type: PortDataType) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            direction: PortDirection::Input,
            data_type,
            list: false,
        }
    }

    pub fn output(name: &str, display_name: &str, data_type: PortDataType) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            direction: PortDirection::Output,
            data_type,
            list: false,
        }
    }

    pub fn as_list(mut self) -> Self {
        self.list = true;
        self
    }
}

/// Identifies a specific port on a specific node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortId {
    pub node_id: Uuid,
    pub port_name: String,
}

impl PortId {
    pub fn new(node_id: Uuid, port_name: &str) -> Self {
        Self {
            node_id,
            port_name: port_name.to_string(),
        }
    }
}

/// A connection between two ports (an edge in the data-flow graph).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Connection {
    pub id: Uuid,
    /// Source port (output)
    pub from: PortId,
    /// Destination port (input)
    pub to: PortId,
}

impl Connection {
    pub fn new(from: PortId, to: PortId) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
        }
    }
}
