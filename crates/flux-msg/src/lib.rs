//! Flux message envelope: the frame-list value type every peer agrees on.
//!
//! This crate is transport- and runtime-free.  It defines the [`Message`]
//! envelope with its byte-exact binary codec, the [`Match`] filters used to
//! pair responses and select handlers, and the credential model with the
//! shared authorization predicate.

mod cred;
mod error;
mod filter;
mod message;

pub use cred::*;
pub use error::*;
pub use filter::*;
pub use message::*;
