//! Bridge identity advertised at registration

use std::collections::HashMap;
use std::fs;
use tracing::debug;

const DMI_PRODUCT_NAME: &str = "/sys/devices/virtual/dmi/id/product_name";
const DMI_SYS_VENDOR: &str = "/sys/devices/virtual/dmi/id/sys_vendor";

/// Local hostname, or "unknown" when it cannot be read
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// "Linux Bridge - <hostname>"
pub fn default_bridge_name() -> String {
    format!("Linux Bridge - {}", hostname())
}

/// Static host description sent with bridge registration
///
/// Keys: `model`, `manufacturer`, `os`, `os_version`, `arch`, `bridge_version`.
pub fn device_info() -> HashMap<String, String> {
    let uname = nix::sys::utsname::uname().ok();
    let (os, os_version) = match &uname {
        Some(uts) => (
            uts.sysname().to_string_lossy().into_owned(),
            uts.release().to_string_lossy().into_owned(),
        ),
        None => (std::env::consts::OS.to_string(), "unknown".to_string()),
    };

    HashMap::from([
        ("model".to_string(), read_dmi(DMI_PRODUCT_NAME)),
        ("manufacturer".to_string(), read_dmi(DMI_SYS_VENDOR)),
        ("os".to_string(), os),
        ("os_version".to_string(), os_version),
        ("arch".to_string(), std::env::consts::ARCH.to_string()),
        (
            "bridge_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}

fn read_dmi(path: &str) -> String {
    match fs::read_to_string(path) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        Ok(_) => "unknown".to_string(),
        Err(e) => {
            debug!("Cannot read {}: {}", path, e);
            "unknown".to_string()
        }
    }
}
