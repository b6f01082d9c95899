//! Command delivery from the controller to the robot base.
//!
//! `controller --CommandChannel--> RelayServer/RelayBroker --> SerialBridge --> serial`
//!
//! Every hop speaks the same `V:<vy>,<vx>` line format defined in [`protocol`].

pub mod broker;
pub mod bridge;
pub mod channel;
mod error;
pub mod protocol;
pub mod server;
pub mod ws;

pub use broker::{ConnectionId, Dispatch, RelayBroker, Role, SharedBroker};
pub use bridge::{BridgeOptions, BridgeOutcome, HardwareLink, SerialBridge, SerialLink};
pub use channel::{ChannelOptions, ChannelState, CommandChannel, Connector, Transport, WsConnector};
pub use error::LinkError;
pub use protocol::ProtocolError;
pub use server::RelayServer;
