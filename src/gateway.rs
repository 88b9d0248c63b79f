mod client;

pub use client::{Gateway, GatewayBuilder, RequestHandle};
