//! USB relay bridge
//!
//! Registers this host with a controller, advertises locally attached USB
//! devices, polls the controller for pending hardware commands per device,
//! executes them as control or bulk transfers and reports the results.
//!
//! The engine is [`ConnectionManager`]; it talks to the controller through
//! a [`RemoteGateway`] and learns about devices from a [`UsbPlatform`] plus
//! the platform event channel.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod service;
pub mod usb;

pub use config::BridgeConfig;
pub use connection::{
    Bridge, ConnectionManager, ConnectionSettings, ConnectionState, DeviceSummary,
};
pub use dispatcher::{CommandDispatcher, CycleOutcome, DispatchTarget};
pub use error::BridgeError;
pub use gateway::{
    BridgeCredentials, GatewayError, GatewayFactory, HttpGateway, HttpGatewayFactory,
    RemoteGateway,
};
pub use usb::{DeviceRegistry, DeviceStatus, TransferExecutor, UsbPlatform};
