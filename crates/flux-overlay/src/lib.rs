//! Library side of the `flux-overlay` tool: topology and host mapping,
//! the subtree health walker, and error aggregation.

pub mod errors;
pub mod fsd;
pub mod health;
pub mod hosts;
pub mod idset;
pub mod topology;
