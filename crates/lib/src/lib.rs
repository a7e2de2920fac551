//! Switchboard core library: conversation handoff and routing between a messaging
//! transport, an automated responder and live human agents.

pub mod address;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod delivery;
pub mod desk;
pub mod gateway;
pub mod handoff;
pub mod history;
pub mod init;
pub mod message;
pub mod registry;
pub mod responder;
pub mod router;
pub mod transport;
