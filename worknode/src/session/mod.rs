//! The persistent control-plane session: WebSocket client, outbound
//! queue, and inbound task dispatch.

mod client;
mod handler;

pub use client::{Outbound, SessionClient};
pub use handler::TaskHandler;
