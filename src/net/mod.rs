//! Request/response model and the network origin the engine fronts.

mod client;
mod types;

pub use client::{HttpNetwork, Network, NetworkError};
pub use types::{Destination, Request, Response};
