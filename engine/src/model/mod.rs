//! Graph model: nodes, ports, connections, parameters.
//!
//! This is the declarative side of the runtime. A [`Graph`] is built (or
//! loaded from JSON) once, validated, and then executed any number of times
//! by the scheduler against different resolutions, seeds and world origins.

pub mod graph;
pub mod node;
pub mod param;
pub mod port;

pub use graph::Graph;
pub use node::GraphNode;
pub use param::{ParamMap, ParamValue, Vec2};
pub use port::{Connection, PortDataType, PortDefinition, PortDirection, PortId};
