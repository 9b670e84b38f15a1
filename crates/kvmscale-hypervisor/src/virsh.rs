//! virsh-backed hypervisor driver.
//!
//! Each operation maps to one `virsh --connect <uri> ...` invocation.
//! Output parsing is kept in free functions so it can be tested without
//! a libvirt daemon.

use std::ffi::OsStr;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{DomainState, Hypervisor, HypervisorError};

/// Drives a libvirt daemon through the `virsh` CLI.
pub struct VirshHypervisor {
    uri: String,
}

impl VirshHypervisor {
    /// Connect to the given libvirt URI (e.g. `qemu:///system`).
    ///
    /// Verifies the connection with `virsh version` so a missing or
    /// unreachable daemon is reported at startup rather than on the
    /// first scaling action.
    pub async fn connect(uri: &str) -> Result<Self, HypervisorError> {
        let hypervisor = Self {
            uri: uri.to_string(),
        };
        hypervisor
            .run("version", ["version"])
            .await
            .map_err(|e| HypervisorError::Connect {
                uri: uri.to_string(),
                detail: e.to_string(),
            })?;
        info!(%uri, "connected to hypervisor");
        Ok(hypervisor)
    }

    async fn run<I, S>(&self, op: &str, args: I) -> Result<String, HypervisorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new("virsh")
            .arg("--connect")
            .arg(&self.uri)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(HypervisorError::Command {
                op: op.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn define_domain(&self, name: &str, xml_path: &Path) -> Result<(), HypervisorError> {
        self.run("define", [OsStr::new("define"), xml_path.as_os_str()])
            .await?;
        debug!(domain = %name, path = %xml_path.display(), "defined domain");
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.run("start", ["start", name]).await?;
        debug!(domain = %name, "started domain");
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.run("destroy", ["destroy", name]).await?;
        debug!(domain = %name, "destroyed domain");
        Ok(())
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        self.run("undefine", ["undefine", name]).await?;
        debug!(domain = %name, "undefined domain");
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        let output = self.run("domstate", ["domstate", name]).await?;
        Ok(parse_domstate(&output))
    }

    async fn lease_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        let output = self
            .run("domifaddr", ["domifaddr", name, "--source", "lease"])
            .await?;
        Ok(parse_domifaddr(&output))
    }

    async fn close(&self) {
        // virsh holds no long-lived connection; nothing to release.
        info!(uri = %self.uri, "closed hypervisor connection");
    }
}

/// Map `virsh domstate` output to a [`DomainState`].
fn parse_domstate(output: &str) -> DomainState {
    match output.trim() {
        "running" => DomainState::Running,
        "in shutdown" => DomainState::Shutdown,
        "shut off" => DomainState::ShutOff,
        _ => DomainState::Other,
    }
}

/// Extract IP addresses from `virsh domifaddr` tabular output.
///
/// ```text
///  Name       MAC address          Protocol     Address
/// -------------------------------------------------------------
///  vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.50/24
/// ```
fn parse_domifaddr(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(2)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let address = columns.get(3)?;
            let address = address.split('/').next().unwrap_or(address);
            if address.is_empty() || address == "-" {
                None
            } else {
                Some(address.to_string())
            }
        })
        .collect()
}
