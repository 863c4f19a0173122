//! Builtin terrain operators.
//!
//! Together these exercise every runtime capability: pure synchronous
//! generation, shared lookup tables, custom input-resolution planning,
//! parallel task waits, derived sibling contexts and list gathering.

mod blur;
mod combine;
mod constant;
mod noise;
mod normalize;
mod warp;

use std::sync::Arc;

use crate::operator::OperatorRegistry;

pub use blur::Blur;
pub use combine::Combine;
pub use constant::Constant;
pub use noise::Noise;
pub use normalize::Normalize;
pub use warp::Warp;

pub fn register_all(registry: &OperatorRegistry) {
    registry.register(Arc::new(Constant));
    registry.register(Arc::new(Noise));
    registry.register(Arc::new(Normalize));
    registry.register(Arc::new(Blur));
    registry.register(Arc::new(Warp));
    registry.register(Arc::new(Combine));
}
