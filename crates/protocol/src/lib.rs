//! Protocol library for usb-bridge
//!
//! This crate defines the JSON wire types exchanged between a USB bridge and
//! its controller: bridge and device registration, pending hardware
//! commands, and command responses. Binary payloads travel base64-encoded
//! inside JSON string fields.
//!
//! # Example
//!
//! ```
//! use protocol::{CommandResponse, decode_payload, encode_payload};
//!
//! let response = CommandResponse::success("cmd-1", Some(encode_payload(&[1, 2, 3])), 3);
//! let json = serde_json::to_string(&response).unwrap();
//! assert!(json.contains("\"bytes_transferred\":3"));
//!
//! let data = response.data.as_deref().map(decode_payload).transpose().unwrap();
//! assert_eq!(data, Some(vec![1, 2, 3]));
//! ```

pub mod error;
pub mod messages;
pub mod payload;

pub use error::{ProtocolError, Result};
pub use messages::{
    BatchItem, BridgeRegistration, CommandResponse, DeviceRegistration, Direction, PendingCommand,
    RegisteredBridge, RegisteredDevice, TransferKind,
};
pub use payload::{decode_payload, encode_payload};
