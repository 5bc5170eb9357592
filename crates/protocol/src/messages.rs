//! Controller API message definitions
//!
//! This module defines every JSON body exchanged with the controller:
//! - Bridge registration (request and response)
//! - Device registration (request and response)
//! - Pending hardware commands (controller -> bridge)
//! - Command responses (bridge -> controller)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bridge registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRegistration {
    /// Human-readable bridge name
    pub name: String,
    /// Static host information (model, OS, version, ...)
    pub device_info: HashMap<String, String>,
}

/// Bridge identity returned by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredBridge {
    /// Controller-assigned bridge identifier
    pub id: String,
    /// Credential used on every subsequent call
    pub api_key: String,
    pub name: String,
    #[serde(default)]
    pub device_info: HashMap<String, String>,
    #[serde(default)]
    pub registered_at: Option<String>,
    #[serde(default)]
    pub last_seen: Option<String>,
}

/// Device registration request
///
/// Mirrors the USB device descriptor fields the controller needs to show and
/// address a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub interface_count: u8,
}

/// Device record returned by the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredDevice {
    /// Remote identifier used to address commands to this device
    pub id: String,
    #[serde(default)]
    pub bridge_id: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    #[serde(default)]
    pub manufacturer: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    pub status: String,
    #[serde(default)]
    pub registered_at: Option<String>,
}

/// USB transfer type requested by the controller
///
/// Any unrecognized string decodes to [`TransferKind::Unknown`] so a single
/// malformed command never prevents the rest of a batch from decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum TransferKind {
    Control,
    Bulk,
    Unknown,
}

impl From<String> for TransferKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "control" => TransferKind::Control,
            "bulk" => TransferKind::Bulk,
            _ => TransferKind::Unknown,
        }
    }
}

/// Data stage direction
///
/// Only `"out"` selects [`Direction::Out`]; everything else reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Direction {
    /// Device to host
    #[default]
    In,
    /// Host to device
    Out,
}

impl From<String> for Direction {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("out") {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

/// Hardware command waiting to be executed by the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: String,
    /// Remote id of the target device
    pub device_id: String,
    pub transfer_type: TransferKind,
    /// bmRequestType (control only)
    #[serde(default)]
    pub request_type: Option<u8>,
    /// bRequest (control only)
    #[serde(default)]
    pub request: Option<u8>,
    /// wValue (control only)
    #[serde(default)]
    pub value: Option<u16>,
    /// wIndex (control only)
    #[serde(default)]
    pub index: Option<u16>,
    /// Buffer size for IN stages
    #[serde(default)]
    pub length: Option<u32>,
    /// Endpoint address including the direction bit (bulk only)
    #[serde(default)]
    pub endpoint: Option<u8>,
    #[serde(default)]
    pub direction: Option<Direction>,
    /// Base64 OUT payload
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl PendingCommand {
    /// Effective direction, reading when the controller left it out
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or_default()
    }
}

/// One element of a pending-command batch
///
/// Batches are decoded element by element, so an out-of-range field in one
/// command only marks that command malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchItem {
    Command(PendingCommand),
    /// Element that did not decode; `id` is kept when it was a string
    Malformed { id: Option<String>, error: String },
}

impl BatchItem {
    /// Decode one element of a batch body
    pub fn from_value(value: serde_json::Value) -> Self {
        let id = value
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        match serde_json::from_value::<PendingCommand>(value) {
            Ok(command) => BatchItem::Command(command),
            Err(e) => BatchItem::Malformed {
                id,
                error: e.to_string(),
            },
        }
    }
}

impl From<PendingCommand> for BatchItem {
    fn from(command: PendingCommand) -> Self {
        BatchItem::Command(command)
    }
}

/// Outcome of one command, submitted back to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub success: bool,
    /// Base64 data read from the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    /// Successful transfer of `bytes_transferred` bytes
    pub fn success(
        command_id: impl Into<String>,
        data: Option<String>,
        bytes_transferred: u32,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            success: true,
            data,
            bytes_transferred: Some(bytes_transferred),
            error: None,
        }
    }

    /// Failed command with a human-readable reason
    pub fn failure(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            success: false,
            data: None,
            bytes_transferred: None,
            error: Some(error.into()),
        }
    }
}
