//! In-memory hypervisor double for tests.
//!
//! Keeps a table of fake domains and lets tests inject lease addresses
//! and start failures. Shared between the controller and instance
//! test suites.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::{DomainState, Hypervisor, HypervisorError};

#[derive(Debug, Default, Clone)]
struct MemoryDomain {
    running: bool,
    addresses: Vec<String>,
}

#[derive(Default)]
struct MemoryState {
    domains: HashMap<String, MemoryDomain>,
    fail_next_start: bool,
}

/// A hypervisor that exists only in process memory.
#[derive(Default)]
pub struct MemoryHypervisor {
    state: Mutex<MemoryState>,
}

impl MemoryHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start_domain` call fail.
    pub fn fail_next_start(&self) {
        self.state.lock().expect("memory hypervisor lock").fail_next_start = true;
    }

    /// Inject lease addresses for a domain.
    pub fn set_addresses(&self, name: &str, addresses: Vec<String>) {
        let mut state = self.state.lock().expect("memory hypervisor lock");
        if let Some(domain) = state.domains.get_mut(name) {
            domain.addresses = addresses;
        }
    }

    /// Names of all currently defined domains, sorted.
    pub fn defined_domains(&self) -> Vec<String> {
        let state = self.state.lock().expect("memory hypervisor lock");
        let mut names: Vec<String> = state.domains.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("memory hypervisor lock")
            .domains
            .contains_key(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("memory hypervisor lock")
            .domains
            .get(name)
            .map(|d| d.running)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Hypervisor for MemoryHypervisor {
    async fn define_domain(&self, name: &str, _xml_path: &Path) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().expect("memory hypervisor lock");
        if state.domains.contains_key(name) {
            return Err(HypervisorError::Command {
                op: "define".to_string(),
                detail: format!("domain {name} already defined"),
            });
        }
        state.domains.insert(name.to_string(), MemoryDomain::default());
        debug!(domain = %name, "defined fake domain");
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().expect("memory hypervisor lock");
        if state.fail_next_start {
            state.fail_next_start = false;
            return Err(HypervisorError::Command {
                op: "start".to_string(),
                detail: "injected start failure".to_string(),
            });
        }
        match state.domains.get_mut(name) {
            Some(domain) => {
                domain.running = true;
                Ok(())
            }
            None => Err(HypervisorError::DomainNotFound(name.to_string())),
        }
    }

    async fn destroy_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().expect("memory hypervisor lock");
        match state.domains.get_mut(name) {
            Some(domain) => {
                domain.running = false;
                Ok(())
            }
            None => Err(HypervisorError::DomainNotFound(name.to_string())),
        }
    }

    async fn undefine_domain(&self, name: &str) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().expect("memory hypervisor lock");
        match state.domains.remove(name) {
            Some(_) => Ok(()),
            None => Err(HypervisorError::DomainNotFound(name.to_string())),
        }
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState, HypervisorError> {
        let state = self.state.lock().expect("memory hypervisor lock");
        match state.domains.get(name) {
            Some(domain) if domain.running => Ok(DomainState::Running),
            Some(_) => Ok(DomainState::ShutOff),
            None => Err(HypervisorError::DomainNotFound(name.to_string())),
        }
    }

    async fn lease_addresses(&self, name: &str) -> Result<Vec<String>, HypervisorError> {
        let state = self.state.lock().expect("memory hypervisor lock");
        match state.domains.get(name) {
            Some(domain) => Ok(domain.addresses.clone()),
            None => Err(HypervisorError::DomainNotFound(name.to_string())),
        }
    }

    async fn close(&self) {
        debug!("closed memory hypervisor");
    }
}
