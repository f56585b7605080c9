//! HTTP values and the network boundary.

mod network;
mod types;

pub use network::{HttpNetwork, Network};
pub use types::{Destination, Headers, Request, Response, Served};

#[cfg(test)]
pub use network::FetchError;
#[cfg(test)]
pub use types::ResponseSource;
