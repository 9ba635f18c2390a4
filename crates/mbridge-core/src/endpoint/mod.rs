//! # mbridge Endpoints
//!
//! Server endpoints expose plugin devices to controllers. An endpoint is bound
//! to the shared bridge, to one dynamic platform plugin, or to the single
//! device of an accessory platform plugin.
//!
//! The protocol stack itself sits behind [`ServerNode`] and
//! [`ServerNodeFactory`]; this module owns everything around it:
//!
//! - [`record`]: [`EndpointRecord`], the persisted identity (port, passcode,
//!   discriminator, fabrics) and the pairing codes derived from it.
//! - [`server`]: the node abstraction and [`LocalServerFactory`], an
//!   in-process node used when no network stack is attached.
//! - [`lifecycle`]: [`EndpointLifecycle`], which creates, starts and stops
//!   endpoints and mirrors commissioning events onto plugins and the bus.
pub mod error;
pub mod lifecycle;
pub mod record;
pub mod server;

pub use error::EndpointError;
pub use lifecycle::EndpointLifecycle;
pub use record::{
    CommissioningState, EndpointDefaults, EndpointOwner, EndpointRecord, EndpointSnapshot, FabricInfo, SessionInfo,
    bridge_endpoint_id, plugin_endpoint_id,
};
pub use server::{LocalServerFactory, LocalServerNode, ServerEvent, ServerNode, ServerNodeFactory, ServerNodeSpec};
