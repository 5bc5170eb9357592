//! USB transfer execution
//!
//! Translates controller commands into control/bulk transfers on an open
//! [`UsbHandle`]. Every failure, including malformed payloads and unknown
//! transfer types, is folded into a failed [`CommandResponse`]; nothing
//! escapes the executor.

use common::{InterfaceInfo, UsbHandle};
use protocol::{
    CommandResponse, Direction, PendingCommand, ProtocolError, TransferKind, decode_payload,
    encode_payload,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Timeout for every USB transfer (5 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// IN buffer size for bulk reads without an explicit length
pub const DEFAULT_BULK_LENGTH: usize = 64;

/// Largest data stage a control transfer can carry (wLength is 16 bits)
pub const MAX_CONTROL_LENGTH: usize = u16::MAX as usize;

/// Largest buffer a bulk command may request or send (1 MiB)
pub const MAX_BULK_LENGTH: usize = 1024 * 1024;

/// Why a command could not be executed
///
/// The `Display` text is what the controller sees in `CommandResponse.error`.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Unknown transfer type")]
    UnknownTransferType,

    #[error("No endpoint specified")]
    NoEndpoint,

    #[error("Endpoint not found")]
    EndpointNotFound(u8),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] ProtocolError),

    #[error("Transfer length {length} exceeds {max} bytes")]
    TooLong { length: usize, max: usize },

    #[error("Control transfer failed: {0}")]
    Control(rusb::Error),

    #[error("Bulk transfer failed: {0}")]
    Bulk(rusb::Error),
}

/// Executes one command against one open handle
///
/// Holds no mutable state, so any number of dispatcher loops may share one.
#[derive(Debug, Clone, Copy)]
pub struct TransferExecutor {
    timeout: Duration,
}

impl Default for TransferExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TransferExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `command` and produce the response to submit
    pub fn execute(&self, command: &PendingCommand, handle: &dyn UsbHandle) -> CommandResponse {
        match self.try_execute(command, handle) {
            Ok(response) => response,
            Err(e) => {
                warn!("Command {} failed: {}", command.id, e);
                CommandResponse::failure(&command.id, e.to_string())
            }
        }
    }

    fn try_execute(
        &self,
        command: &PendingCommand,
        handle: &dyn UsbHandle,
    ) -> Result<CommandResponse, TransferError> {
        match command.transfer_type {
            TransferKind::Control => self.execute_control(command, handle),
            TransferKind::Bulk => self.execute_bulk(command, handle),
            TransferKind::Unknown => Err(TransferError::UnknownTransferType),
        }
    }

    /// Control transfer on endpoint 0
    ///
    /// Absent setup fields default to 0. Without an explicit direction, bit 7
    /// of `request_type` decides whether the payload is sent or a buffer of
    /// `length` bytes is read.
    fn execute_control(
        &self,
        command: &PendingCommand,
        handle: &dyn UsbHandle,
    ) -> Result<CommandResponse, TransferError> {
        let request_type = command.request_type.unwrap_or(0);
        let request = command.request.unwrap_or(0);
        let value = command.value.unwrap_or(0);
        let index = command.index.unwrap_or(0);

        let direction = command.direction.unwrap_or(if request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        });

        let mut buffer = build_buffer(command, direction, 0, MAX_CONTROL_LENGTH)?;

        debug!(
            "Control transfer {}: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}, len={}",
            command.id,
            request_type,
            request,
            value,
            index,
            buffer.len()
        );

        let n = handle
            .control_transfer(
                request_type,
                request,
                value,
                index,
                &mut buffer,
                self.timeout,
            )
            .map_err(TransferError::Control)?
            .min(buffer.len());

        debug!("Control transfer {} succeeded: {} bytes", command.id, n);
        let data = (n > 0).then(|| encode_payload(&buffer[..n]));
        Ok(CommandResponse::success(&command.id, data, n as u32))
    }

    /// Bulk transfer on the endpoint named by the command
    ///
    /// The owning interface is force-claimed before the transfer. Without an
    /// explicit direction, bit 7 of the endpoint address decides it, the same
    /// rule control transfers apply to `request_type`. Data is only returned
    /// for IN transfers.
    fn execute_bulk(
        &self,
        command: &PendingCommand,
        handle: &dyn UsbHandle,
    ) -> Result<CommandResponse, TransferError> {
        let endpoint = command.endpoint.ok_or(TransferError::NoEndpoint)?;

        let interface = resolve_endpoint(&handle.interfaces(), endpoint)
            .ok_or(TransferError::EndpointNotFound(endpoint))?;

        if let Err(e) = handle.claim_interface(interface, true) {
            warn!(
                "Failed to claim interface {} for endpoint {:#x}: {}",
                interface, endpoint, e
            );
        }

        let direction = command.direction.unwrap_or(if endpoint & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        });
        let mut buffer = build_buffer(command, direction, DEFAULT_BULK_LENGTH, MAX_BULK_LENGTH)?;

        debug!(
            "Bulk transfer {}: endpoint={:#x}, direction={:?}, len={}",
            command.id,
            endpoint,
            direction,
            buffer.len()
        );

        let n = handle
            .bulk_transfer(endpoint, &mut buffer, self.timeout)
            .map_err(TransferError::Bulk)?
            .min(buffer.len());

        debug!("Bulk transfer {} succeeded: {} bytes", command.id, n);
        let data = (direction == Direction::In && n > 0).then(|| encode_payload(&buffer[..n]));
        Ok(CommandResponse::success(&command.id, data, n as u32))
    }
}

/// Find the interface owning `endpoint`
pub fn resolve_endpoint(interfaces: &[InterfaceInfo], endpoint: u8) -> Option<u8> {
    interfaces
        .iter()
        .find(|iface| iface.endpoints.contains(&endpoint))
        .map(|iface| iface.number)
}

/// Decoded payload for OUT, a zeroed buffer of `length` bytes otherwise
///
/// Requested lengths are checked against `max_length` before allocating.
fn build_buffer(
    command: &PendingCommand,
    direction: Direction,
    default_length: usize,
    max_length: usize,
) -> Result<Vec<u8>, TransferError> {
    let too_long = |length: usize| TransferError::TooLong {
        length,
        max: max_length,
    };

    match (direction, command.data.as_deref()) {
        (Direction::Out, Some(data)) => {
            let payload = decode_payload(data)?;
            if payload.len() > max_length {
                return Err(too_long(payload.len()));
            }
            Ok(payload)
        }
        _ => {
            let length = command
                .length
                .map(|l| l as usize)
                .unwrap_or(default_length);
            if length > max_length {
                return Err(too_long(length));
            }
            Ok(vec![0u8; length])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{MockCall, MockUsbHandle, mock_read_pattern};

    fn command(transfer_type: TransferKind) -> PendingCommand {
        PendingCommand {
            id: "cmd-1".to_string(),
            device_id: "dev-1".to_string(),
            transfer_type,
            request_type: None,
            request: None,
            value: None,
            index: None,
            length: None,
            endpoint: None,
            direction: None,
            data: None,
            created_at: None,
        }
    }

    #[test]
    fn test_control_read_returns_first_bytes() {
        let handle = MockUsbHandle::new().with_control_result(Ok(4));
        let mut cmd = command(TransferKind::Control);
        cmd.request_type = Some(0x80);
        cmd.request = Some(0x06);
        cmd.value = Some(0);
        cmd.index = Some(0);
        cmd.length = Some(8);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(resp.success);
        assert_eq!(resp.bytes_transferred, Some(4));
        assert_eq!(resp.data, Some(encode_payload(&mock_read_pattern(4))));
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_control_defaults_and_timeout() {
        let handle = MockUsbHandle::new().with_control_result(Ok(4));
        let mut cmd = command(TransferKind::Control);
        cmd.length = Some(8);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(resp.success);
        assert_eq!(resp.bytes_transferred, Some(4));
        assert_eq!(resp.data, Some(encode_payload(&[0u8; 4])));
        assert_eq!(
            handle.calls(),
            vec![MockCall::Control {
                request_type: 0,
                request: 0,
                value: 0,
                index: 0,
                buffer: vec![0u8; 8],
                timeout: Duration::from_millis(5000),
            }]
        );
    }

    #[test]
    fn test_control_out_sends_payload() {
        let handle = MockUsbHandle::new();
        let mut cmd = command(TransferKind::Control);
        cmd.request_type = Some(0x21);
        cmd.request = Some(0x09);
        cmd.value = Some(0x0200);
        cmd.direction = Some(Direction::Out);
        cmd.data = Some(encode_payload(&[0xAA, 0xBB, 0xCC]));

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(resp.success);
        assert_eq!(resp.bytes_transferred, Some(3));
        match &handle.calls()[0] {
            MockCall::Control { buffer, value, .. } => {
                assert_eq!(buffer, &vec![0xAA, 0xBB, 0xCC]);
                assert_eq!(*value, 0x0200);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_control_zero_bytes_has_no_data() {
        let handle = MockUsbHandle::new().with_control_result(Ok(0));
        let mut cmd = command(TransferKind::Control);
        cmd.request_type = Some(0x00);
        cmd.request = Some(0x09);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(resp.success);
        assert_eq!(resp.bytes_transferred, Some(0));
        assert!(resp.data.is_none());
    }

    #[test]
    fn test_control_failure_maps_to_response() {
        let handle = MockUsbHandle::new().with_control_result(Err(rusb::Error::Pipe));
        let mut cmd = command(TransferKind::Control);
        cmd.request_type = Some(0x80);
        cmd.length = Some(18);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(!resp.success);
        assert!(resp.bytes_transferred.is_none());
        assert!(
            resp.error
                .as_deref()
                .unwrap()
                .starts_with("Control transfer failed")
        );
    }

    #[test]
    fn test_control_length_limit() {
        let handle = MockUsbHandle::new();
        let mut cmd = command(TransferKind::Control);
        cmd.request_type = Some(0x80);
        cmd.length = Some(70_000);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(!resp.success);
        assert_eq!(
            resp.error.as_deref(),
            Some("Transfer length 70000 exceeds 65535 bytes")
        );
        assert_eq!(handle.transfer_count(), 0);
    }

    #[test]
    fn test_huge_lengths_rejected_before_allocation() {
        let handle = MockUsbHandle::new().with_interface(0, &[0x81]);

        let mut control = command(TransferKind::Control);
        control.request_type = Some(0x80);
        control.length = Some(u32::MAX);
        let mut bulk = command(TransferKind::Bulk);
        bulk.endpoint = Some(0x81);
        bulk.length = Some(u32::MAX);

        for cmd in [control, bulk] {
            let resp = TransferExecutor::default().execute(&cmd, &handle);
            assert!(!resp.success);
            assert!(
                resp.error
                    .as_deref()
                    .unwrap()
                    .starts_with(&format!("Transfer length {}", u32::MAX))
            );
        }
        assert_eq!(handle.transfer_count(), 0);
    }

    #[test]
    fn test_bulk_length_limit() {
        let handle = MockUsbHandle::new()
            .with_interface(0, &[0x81])
            .with_bulk_result(Ok(16));
        let mut cmd = command(TransferKind::Bulk);
        cmd.endpoint = Some(0x81);

        cmd.length = Some(MAX_BULK_LENGTH as u32);
        assert!(TransferExecutor::default().execute(&cmd, &handle).success);

        cmd.length = Some(MAX_BULK_LENGTH as u32 + 1);
        assert!(!TransferExecutor::default().execute(&cmd, &handle).success);
        assert_eq!(handle.transfer_count(), 1);
    }

    #[test]
    fn test_oversized_out_payload_rejected() {
        let handle = MockUsbHandle::new();
        let mut cmd = command(TransferKind::Control);
        cmd.direction = Some(Direction::Out);
        cmd.data = Some(encode_payload(&vec![0u8; MAX_CONTROL_LENGTH + 1]));

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(!resp.success);
        assert_eq!(handle.transfer_count(), 0);
    }

    #[test]
    fn test_malformed_payload_is_failure() {
        let handle = MockUsbHandle::new();
        let mut cmd = command(TransferKind::Control);
        cmd.direction = Some(Direction::Out);
        cmd.data = Some("%%% not base64 %%%".to_string());

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(!resp.success);
        assert!(resp.error.as_deref().unwrap().starts_with("Invalid payload"));
        assert_eq!(handle.transfer_count(), 0);
    }

    #[test]
    fn test_unknown_transfer_type_untouched_handle() {
        let handle = MockUsbHandle::new().with_interface(0, &[0x81]);
        let resp = TransferExecutor::default().execute(&command(TransferKind::Unknown), &handle);

        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("Unknown transfer type"));
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_bulk_missing_endpoint() {
        let handle = MockUsbHandle::new().with_interface(0, &[0x81]);
        let resp = TransferExecutor::default().execute(&command(TransferKind::Bulk), &handle);

        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("No endpoint specified"));
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_bulk_endpoint_not_found() {
        let handle = MockUsbHandle::new()
            .with_interface(0, &[0x02])
            .with_interface(1, &[0x83, 0x04]);
        let mut cmd = command(TransferKind::Bulk);
        cmd.endpoint = Some(0x81);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("Endpoint not found"));
        assert_eq!(handle.transfer_count(), 0);
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_bulk_in_claims_owning_interface() {
        let handle = MockUsbHandle::new()
            .with_interface(0, &[0x02])
            .with_interface(1, &[0x81, 0x01])
            .with_bulk_result(Ok(10));
        let mut cmd = command(TransferKind::Bulk);
        cmd.endpoint = Some(0x81);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(resp.success);
        assert_eq!(resp.bytes_transferred, Some(10));
        assert_eq!(resp.data, Some(encode_payload(&mock_read_pattern(10))));

        let calls = handle.calls();
        assert_eq!(
            calls[0],
            MockCall::Claim {
                interface: 1,
                force: true
            }
        );
        match &calls[1] {
            MockCall::Bulk {
                endpoint, buffer, ..
            } => {
                assert_eq!(*endpoint, 0x81);
                assert_eq!(buffer.len(), DEFAULT_BULK_LENGTH);
            }
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_bulk_out_returns_no_data() {
        let handle = MockUsbHandle::new().with_interface(0, &[0x01, 0x81]);
        let mut cmd = command(TransferKind::Bulk);
        cmd.endpoint = Some(0x01);
        cmd.direction = Some(Direction::Out);
        cmd.data = Some(encode_payload(b"hello"));

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(resp.success);
        assert_eq!(resp.bytes_transferred, Some(5));
        assert!(resp.data.is_none());
    }

    #[test]
    fn test_bulk_direction_follows_endpoint_bit() {
        let handle = MockUsbHandle::new().with_interface(0, &[0x02, 0x81]);
        let mut write = command(TransferKind::Bulk);
        write.endpoint = Some(0x02);
        write.data = Some(encode_payload(b"abc"));

        let resp = TransferExecutor::default().execute(&write, &handle);

        assert!(resp.success);
        assert_eq!(resp.bytes_transferred, Some(3));
        assert!(resp.data.is_none());
        match &handle.calls()[1] {
            MockCall::Bulk {
                endpoint, buffer, ..
            } => {
                assert_eq!(*endpoint, 0x02);
                assert_eq!(buffer, &b"abc".to_vec());
            }
            other => panic!("unexpected call {:?}", other),
        }

        // An explicit direction still wins over the endpoint bit
        let mut read = command(TransferKind::Bulk);
        read.endpoint = Some(0x02);
        read.direction = Some(Direction::In);
        read.data = Some(encode_payload(b"abc"));
        read.length = Some(8);
        TransferExecutor::default().execute(&read, &handle);
        match handle.calls().last() {
            Some(MockCall::Bulk { buffer, .. }) => assert_eq!(buffer, &vec![0u8; 8]),
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_bulk_failure() {
        let handle = MockUsbHandle::new()
            .with_interface(0, &[0x81])
            .with_bulk_result(Err(rusb::Error::Timeout));
        let mut cmd = command(TransferKind::Bulk);
        cmd.endpoint = Some(0x81);
        cmd.length = Some(512);

        let resp = TransferExecutor::default().execute(&cmd, &handle);

        assert!(!resp.success);
        assert!(
            resp.error
                .as_deref()
                .unwrap()
                .starts_with("Bulk transfer failed")
        );
    }

    #[test]
    fn test_resolve_endpoint() {
        let interfaces = vec![
            InterfaceInfo {
                number: 0,
                endpoints: vec![0x81, 0x02],
            },
            InterfaceInfo {
                number: 2,
                endpoints: vec![0x83],
            },
        ];
        assert_eq!(resolve_endpoint(&interfaces, 0x02), Some(0));
        assert_eq!(resolve_endpoint(&interfaces, 0x83), Some(2));
        assert_eq!(resolve_endpoint(&interfaces, 0x84), None);
        assert_eq!(resolve_endpoint(&[], 0x81), None);
    }
}
