// src/supervisor/command.rs - Stack command line and host probes
use serde::Serialize;
use std::path::Path;
use tokio::process::Command;

use crate::config::{DeviceSettings, NetworkSettings, StackOptions};

/// Device identity announced by the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_id: u32,
    pub vendor_id: u32,
    pub name: String,
}

impl From<&DeviceSettings> for DeviceIdentity {
    fn from(device: &DeviceSettings) -> Self {
        Self {
            device_id: device.id,
            vendor_id: device.vendor_id,
            name: device.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkParams {
    pub ip: Option<String>,
    pub port: u16,
    /// Used when the default route cannot be determined.
    pub interface: String,
}

impl From<&NetworkSettings> for NetworkParams {
    fn from(network: &NetworkSettings) -> Self {
        Self {
            ip: network.ip.clone(),
            port: network.port,
            interface: network.interface.clone(),
        }
    }
}

fn flag(enabled: bool) -> u8 {
    u8::from(enabled)
}

/// Arguments for one stack run, in the order the stack documents them.
pub fn command_args(
    identity: &DeviceIdentity,
    port: u16,
    interface: &str,
    options: &StackOptions,
) -> Vec<String> {
    vec![
        format!("-d{}", identity.device_id),
        format!("-v{}", identity.vendor_id),
        format!("-p{}", port),
        format!("-i{}", interface),
        format!("-e{}", flag(options.ethernet_enable)),
        format!("-t{}", options.apdu_timeout),
        format!("-D{}", options.debug_level),
        format!("-q{}", flag(options.initial_query)),
        format!("-h{}", flag(options.http_server)),
    ]
}

/// Interface name from `ip route show default` output.
pub fn parse_default_route(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "dev" {
                return tokens.next().map(str::to_string);
            }
        }
        None
    })
}

/// Interface carrying the default route, or `fallback`.
pub async fn resolve_interface(fallback: &str) -> String {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            match parse_default_route(&String::from_utf8_lossy(&output.stdout)) {
                Some(interface) => {
                    tracing::info!("Using default-route interface {}", interface);
                    interface
                }
                None => {
                    tracing::info!("No default route, using configured interface {}", fallback);
                    fallback.to_string()
                }
            }
        }
        Ok(output) => {
            tracing::debug!("ip route exited with {}", output.status);
            fallback.to_string()
        }
        Err(e) => {
            tracing::debug!("Cannot query default route: {}", e);
            fallback.to_string()
        }
    }
}

/// Substrings `file` prints for binaries built for `arch`.
pub fn arch_markers(arch: &str) -> &'static [&'static str] {
    match arch {
        "aarch64" => &["aarch64", "ARM"],
        "arm" => &["ARM"],
        "x86_64" => &["x86-64"],
        "x86" => &["80386"],
        "riscv64" => &["RISC-V"],
        _ => &[],
    }
}

/// Whether a `file` description matches `arch`; `None` when the host is unknown.
pub fn arch_matches(description: &str, arch: &str) -> Option<bool> {
    let markers = arch_markers(arch);
    if markers.is_empty() {
        return None;
    }
    Some(markers.iter().any(|m| description.contains(m)))
}

/// Log a warning when `artifact` looks built for another architecture.
pub async fn check_architecture(artifact: &Path) {
    let output = match Command::new("file").arg(artifact).output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!("Skipping architecture check: {}", e);
            return;
        }
    };
    let description = String::from_utf8_lossy(&output.stdout);
    let description = description.trim();
    tracing::debug!("Binary info: {}", description);

    if arch_matches(description, std::env::consts::ARCH) == Some(false) {
        tracing::warn!(
            "Binary may not match host architecture {}: {}",
            std::env::consts::ARCH,
            description
        );
    }
}
