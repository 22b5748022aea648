//! Shared types for the Hub and Node appliances: the domain entities of the
//! relational schema, the wire types of the control-plane protocol between
//! the two appliances, and the error taxonomy every layer propagates.

pub mod entities;
pub mod error;
pub mod wire;

pub use entities::*;
pub use error::{Error, Result};
