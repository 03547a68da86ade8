//! Request/response types and the network client.

pub mod client;
pub mod types;

pub use client::{HttpNetwork, Network};
pub use types::{Destination, Headers, OutboundRequest, RequestIdentity, RequestMode, ResponseSnapshot};
