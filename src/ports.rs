//! Port assignment registry (`ports.json`).
//!
//! Serializes all port decisions through one writer so concurrent services
//! never race to the same port. Availability is probed with a loopback TCP
//! bind; `in_use` is recomputed on every read.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::constants::{PORT_RANGE_END, PORT_RANGE_START, RESERVED_PORTS};
use crate::{AdtError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAssignment {
    pub project: String,
    pub service: String,
    pub port: u16,
    #[serde(default)]
    pub in_use: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    range_start: u16,
    range_end: u16,
    reserved: Vec<u16>,
    assignments: HashMap<String, PortAssignment>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            range_start: PORT_RANGE_START,
            range_end: PORT_RANGE_END,
            reserved: RESERVED_PORTS.to_vec(),
            assignments: HashMap::new(),
        }
    }
}

pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub struct PortRegistry {
    path: PathBuf,
    registry: Mutex<RegistryFile>,
}

impl PortRegistry {
    pub fn open(home: &Path) -> Result<Self> {
        let path = home.join("ports.json");
        let registry = if path.exists() {
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok())
                .unwrap_or_default()
        } else {
            RegistryFile::default()
        };
        Ok(Self {
            path,
            registry: Mutex::new(registry),
        })
    }

    fn save(&self, registry: &RegistryFile) -> Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(registry)?)?;
        Ok(())
    }

    fn key(project: &str, service: &str) -> String {
        format!("{project}:{service}")
    }

    pub fn get_port(&self, project: &str, service: &str) -> Option<u16> {
        let registry = self.registry.lock().unwrap();
        registry
            .assignments
            .get(&Self::key(project, service))
            .map(|a| a.port)
    }

    /// Assign a port: reuse the existing assignment when still free (unless
    /// `force_new`), then try `preferred`, then scan the range for the first
    /// port that is neither reserved, assigned, nor bound.
    pub fn assign_port(
        &self,
        project: &str,
        service: &str,
        preferred: Option<u16>,
        force_new: bool,
    ) -> Result<u16> {
        let mut registry = self.registry.lock().unwrap();
        let key = Self::key(project, service);

        if !force_new {
            if let Some(existing) = registry.assignments.get(&key) {
                if is_port_available(existing.port) {
                    return Ok(existing.port);
                }
            }
        }

        if let Some(preferred) = preferred {
            if !registry.reserved.contains(&preferred)
                && !Self::assigned_elsewhere(&registry, &key, preferred)
                && is_port_available(preferred)
            {
                Self::store(&mut registry, &key, project, service, preferred);
                self.save(&registry)?;
                return Ok(preferred);
            }
        }

        let taken: Vec<u16> = registry
            .assignments
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(_, a)| a.port)
            .collect();
        let range = registry.range_start..registry.range_end;
        for port in range {
            if registry.reserved.contains(&port) || taken.contains(&port) {
                continue;
            }
            if is_port_available(port) {
                Self::store(&mut registry, &key, project, service, port);
                self.save(&registry)?;
                return Ok(port);
            }
        }

        Err(AdtError::Conflict("No available ports in range".into()))
    }

    fn assigned_elsewhere(registry: &RegistryFile, key: &str, port: u16) -> bool {
        registry
            .assignments
            .iter()
            .any(|(k, a)| k != key && a.port == port)
    }

    fn store(registry: &mut RegistryFile, key: &str, project: &str, service: &str, port: u16) {
        registry.assignments.insert(
            key.to_string(),
            PortAssignment {
                project: project.to_string(),
                service: service.to_string(),
                port,
                in_use: false,
            },
        );
    }

    /// Explicitly pin a port. Fails when the port is reserved or held by
    /// another assignment that is actually bound.
    pub fn set_port(&self, project: &str, service: &str, port: u16) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();
        let key = Self::key(project, service);

        if registry.reserved.contains(&port) {
            return Err(AdtError::Conflict(format!("Port {port} is reserved")));
        }
        if Self::assigned_elsewhere(&registry, &key, port) && !is_port_available(port) {
            return Err(AdtError::Conflict(format!(
                "Port {port} is held by another assignment"
            )));
        }

        Self::store(&mut registry, &key, project, service, port);
        self.save(&registry)?;
        Ok(())
    }

    /// Release an assignment. Returns true if one existed.
    pub fn release_port(&self, project: &str, service: &str) -> Result<bool> {
        let mut registry = self.registry.lock().unwrap();
        let existed = registry
            .assignments
            .remove(&Self::key(project, service))
            .is_some();
        if existed {
            self.save(&registry)?;
        }
        Ok(existed)
    }

    /// List assignments with a freshly probed `in_use` per row.
    pub fn list_assignments(&self, project: Option<&str>) -> Vec<PortAssignment> {
        let registry = self.registry.lock().unwrap();
        let mut assignments: Vec<PortAssignment> = registry
            .assignments
            .values()
            .filter(|a| project.map_or(true, |p| a.project == p))
            .cloned()
            .collect();
        drop(registry);

        for a in &mut assignments {
            a.in_use = !is_port_available(a.port);
        }
        assignments.sort_by(|a, b| (&a.project, &a.service).cmp(&(&b.project, &b.service)));
        assignments
    }

}
