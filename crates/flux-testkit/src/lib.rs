//! In-process loopback broker.
//!
//! [`TestBroker`] owns the far end of a mem transport pair and answers the
//! broker-side services the core's clients speak to: the event service,
//! the overlay health/topology/disconnect services, and group joins.  Node
//! health is scripted through [`TestNet`], so tests can stage partial
//! failures without processes or sockets.

mod broker;
mod net;

pub use broker::*;
pub use net::*;
