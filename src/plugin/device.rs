use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

const WILDCARD: char = '*';

/// Declarative host device path with its container-side counterpart.
///
/// `path_template` may contain a single `*`. When it does, the container
/// template must end with `*`, and the segment matched on the host is
/// substituted there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTemplate {
    pub path_template: String,
    pub container_path_template: String,
    pub permission: String,
}

/// A host device file resolved from a [`DeviceTemplate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcreteDevice {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub permission: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One device slot advertised to the kubelet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedDevice {
    pub id: String,
    pub health: Health,
}

impl ExposedDevice {
    /// Slots `0..count`, all carrying the same health
    pub fn slots(count: usize, health: Health) -> Vec<Self> {
        (0..count)
            .map(|i| Self {
                id: i.to_string(),
                health,
            })
            .collect()
    }
}

impl DeviceTemplate {
    pub fn new(
        path_template: impl Into<String>,
        container_path_template: impl Into<String>,
        permission: impl Into<String>,
    ) -> Self {
        Self {
            path_template: path_template.into(),
            container_path_template: container_path_template.into(),
            permission: permission.into(),
        }
    }

    /// Check wildcard placement without touching the filesystem
    pub fn validate(&self) -> Result<()> {
        glob::Pattern::new(&self.path_template)?;

        let wildcards = self.path_template.matches(WILDCARD).count();

        if wildcards > 1 {
            return Err(PluginError::invalid_template(
                &self.path_template,
                "pathTemplate can contain only one '*'",
            ));
        }

        if wildcards == 1 {
            if !self.container_path_template.ends_with(WILDCARD) {
                return Err(PluginError::invalid_template(
                    &self.container_path_template,
                    "containerPathTemplate must end with '*' when pathTemplate contains '*'",
                ));
            }
            return Ok(());
        }

        if self.container_path_template.contains(WILDCARD) {
            return Err(PluginError::invalid_template(
                &self.container_path_template,
                "containerPathTemplate must not contain '*' when pathTemplate does not",
            ));
        }

        Ok(())
    }

    /// Resolve the template against the host filesystem.
    ///
    /// Directory matches are skipped. Results keep glob order, which is
    /// sorted and therefore stable while the host is unchanged.
    pub fn expand(&self) -> Result<Vec<ConcreteDevice>> {
        self.validate()?;

        let host_prefix = prefix_before_wildcard(&self.path_template);
        let container_prefix = prefix_before_wildcard(&self.container_path_template);

        let mut expanded = Vec::new();
        for entry in glob::glob(&self.path_template)? {
            let host_path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!(path = %e.path().display(), "Skipping unreadable glob match: {}", e);
                    continue;
                }
            };

            match std::fs::metadata(&host_path) {
                Ok(meta) if meta.is_dir() => {
                    trace!(path = %host_path.display(), "Skipping directory match");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(path = %host_path.display(), "Skipping match that cannot be stat'ed: {}", e);
                    continue;
                }
            }

            let container_path = substitute_prefix(&host_path, host_prefix, container_prefix);
            expanded.push(ConcreteDevice {
                host_path,
                container_path,
                permission: self.permission.clone(),
            });
        }

        debug!(
            template = %self.path_template,
            matches = expanded.len(),
            "Expanded device template"
        );
        Ok(expanded)
    }
}

/// Expand every template, concatenating results in template order
pub fn expand_all(templates: &[DeviceTemplate]) -> Result<Vec<ConcreteDevice>> {
    let mut devices = Vec::new();
    for template in templates {
        devices.extend(template.expand()?);
    }
    Ok(devices)
}

/// Unhealthy as soon as one device file is gone; an empty set is healthy.
pub fn probe(devices: &[ConcreteDevice]) -> Health {
    for device in devices {
        if let Err(e) = std::fs::metadata(&device.host_path) {
            if e.kind() == std::io::ErrorKind::NotFound {
                warn!(path = %device.host_path.display(), "Device path not found");
                return Health::Unhealthy;
            }
        }
    }
    Health::Healthy
}

fn prefix_before_wildcard(template: &str) -> &str {
    template.split(WILDCARD).next().unwrap_or(template)
}

fn substitute_prefix(host_path: &Path, host_prefix: &str, container_prefix: &str) -> PathBuf {
    let host = host_path.to_string_lossy();
    match host.strip_prefix(host_prefix) {
        Some(suffix) => PathBuf::from(format!("{container_prefix}{suffix}")),
        None => PathBuf::from(host.replacen(host_prefix, container_prefix, 1)),
    }
}
