//! Systemd service integration
//!
//! Speaks the sd-notify datagram protocol directly: readiness, status text,
//! shutdown and watchdog keepalives. Every call is a no-op outside systemd.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Send one sd-notify message; `Ok(false)` when not running under systemd
fn send(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    Ok(true)
}

/// Notify systemd that the bridge is connected and running
pub fn notify_ready() -> Result<()> {
    if send("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Notify systemd that shutdown has begun
pub fn notify_stopping() -> Result<()> {
    if send("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if send(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

fn notify_watchdog() -> Result<()> {
    send("WATCHDOG=1").map(|_| ())
}

/// Watchdog timeout configured by systemd, if any
pub fn watchdog_timeout() -> Option<Duration> {
    env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|usec| *usec > 0)
        .map(Duration::from_micros)
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Send keepalives at half the watchdog timeout until `shutdown` fires
///
/// Returns `None` when the watchdog is not enabled.
pub fn spawn_watchdog(shutdown: CancellationToken) -> Option<JoinHandle<()>> {
    let Some(timeout) = watchdog_timeout() else {
        debug!("Systemd watchdog not enabled");
        return None;
    };
    let period = (timeout / 2).max(Duration::from_millis(500));
    info!(
        "Systemd watchdog enabled, keepalive every {:?} (timeout {:?})",
        period, timeout
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = notify_watchdog() {
                        error!("Failed to send watchdog keepalive: {:#}", e);
                    }
                }
            }
        }
    }))
}
