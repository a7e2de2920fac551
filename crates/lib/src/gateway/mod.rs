//! Gateway: HTTP + WebSocket control plane for human agents.
//!
//! Single port serves HTTP and WebSocket. Protocol: the first frame must be `connect`;
//! after `hello` the agent exchanges event frames with the desk and the router.

mod hub;
mod protocol;
mod server;

pub use hub::{AgentHub, ControlPlane};
pub use protocol::{ClientEvent, ServerEvent, PROTOCOL_VERSION};
pub use server::{run_gateway, serve, GatewayComponents};
