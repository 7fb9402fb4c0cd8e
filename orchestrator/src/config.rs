// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deployment profiles: the operator-supplied desired state.
//!
//! A profile is loaded once per invocation and read-only thereafter.  Most
//! of its contents are opaque to the orchestrator: sections like
//! `[network]` and `[bootstrap]` are hashed and forwarded to provisioner
//! hooks without interpretation, so credentials and tool-specific settings
//! never need to be understood here.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::phases::PhaseId;

/// A named bundle of desired-state parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub name: String,
    /// Operator-managed version string; not interpreted.
    #[serde(default)]
    pub version: Option<String>,
    pub provisioner: ProvisionerConfig,
    #[serde(default)]
    pub nodes: NodesConfig,
    /// Forwarded to infrastructure, bootstrap, and platform hooks.
    #[serde(default)]
    pub network: serde_json::Value,
    /// Forwarded to image and infrastructure hooks.
    #[serde(default)]
    pub image: serde_json::Value,
    /// Forwarded to foundation hooks.
    #[serde(default)]
    pub foundation: serde_json::Value,
    /// Forwarded to bootstrap hooks.
    #[serde(default)]
    pub bootstrap: serde_json::Value,
    #[serde(default)]
    pub platform: PlatformConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionerConfig {
    /// Directory containing the hook executables.
    pub dir: Utf8PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodesConfig {
    #[serde(default)]
    pub control_count: usize,
    #[serde(default)]
    pub worker_count: usize,
    #[serde(default)]
    pub control_sizing: NodeSizing,
    #[serde(default)]
    pub worker_sizing: NodeSizing,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NodeSizing {
    #[serde(default)]
    pub vcpus: u32,
    #[serde(default)]
    pub memory_mib: u64,
    #[serde(default)]
    pub disk_gib: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PlatformConfig {
    /// Platform sub-resources, one per service name.
    #[serde(default)]
    pub services: Vec<String>,
    /// Free-form settings forwarded to every platform hook.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to read profile file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("failed to parse profile file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
    #[error("invalid profile {path}: {reason}")]
    Invalid { path: Utf8PathBuf, reason: String },
}

impl Profile {
    /// Loads and validates a profile from a TOML file.
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Profile, ProfileError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ProfileError::Io { error, path: path.to_owned() }
        })?;
        let profile: Profile =
            toml::from_str(&data).map_err(|error| ProfileError::Parse {
                error,
                path: path.to_owned(),
            })?;
        profile.validate().map_err(|reason| ProfileError::Invalid {
            path: path.to_owned(),
            reason,
        })?;
        Ok(profile)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("profile name must not be empty".to_string());
        }
        if self.provisioner.dir.as_str().is_empty() {
            return Err("provisioner.dir must not be empty".to_string());
        }
        if self.nodes.control_count == 0 {
            return Err(
                "nodes.control_count must be at least 1".to_string()
            );
        }
        let mut seen = std::collections::BTreeSet::new();
        for service in &self.platform.services {
            if service.is_empty() {
                return Err(
                    "platform.services entries must not be empty".to_string()
                );
            }
            if !seen.insert(service) {
                return Err(format!(
                    "platform.services lists {service:?} more than once"
                ));
            }
        }
        Ok(())
    }

    /// Expands this profile into the desired sub-resources of `phase`,
    /// each with the profile parameters relevant to it.
    ///
    /// The relevance mapping is what confines a profile edit to the phases
    /// it actually affects: changing node counts or sizing reshapes only
    /// infrastructure resources, leaving every other phase's digests
    /// untouched.
    pub fn resources_for(&self, phase: PhaseId) -> Vec<ResourceSpec> {
        match phase {
            PhaseId::Foundation => vec![ResourceSpec::new(
                phase,
                "environment",
                json!({ "foundation": self.foundation }),
            )],
            PhaseId::Image => vec![ResourceSpec::new(
                phase,
                "golden-image",
                json!({ "image": self.image }),
            )],
            PhaseId::Infrastructure => {
                let mut resources = Vec::new();
                for index in 1..=self.nodes.control_count {
                    resources.push(ResourceSpec::new(
                        phase,
                        format!("control-{index:02}"),
                        json!({
                            "role": "control",
                            "index": index,
                            "sizing": self.nodes.control_sizing,
                            "network": self.network,
                            "image": self.image,
                        }),
                    ));
                }
                for index in 1..=self.nodes.worker_count {
                    resources.push(ResourceSpec::new(
                        phase,
                        format!("worker-{index:02}"),
                        json!({
                            "role": "worker",
                            "index": index,
                            "sizing": self.nodes.worker_sizing,
                            "network": self.network,
                            "image": self.image,
                        }),
                    ));
                }
                resources
            }
            PhaseId::Bootstrap => vec![ResourceSpec::new(
                phase,
                "cluster",
                json!({
                    "bootstrap": self.bootstrap,
                    "network": self.network,
                }),
            )],
            PhaseId::Platform => self
                .platform
                .services
                .iter()
                .map(|service| {
                    ResourceSpec::new(
                        phase,
                        service.clone(),
                        json!({
                            "service": service,
                            "platform": self.platform.extra,
                            "network": self.network,
                        }),
                    )
                })
                .collect(),
        }
    }
}

/// One desired sub-resource of a phase.
#[derive(Clone, Debug)]
pub struct ResourceSpec {
    pub phase: PhaseId,
    pub key: String,
    /// The profile parameters relevant to this resource, forwarded to its
    /// hooks verbatim.
    pub params: serde_json::Value,
}

impl ResourceSpec {
    fn new<K: Into<String>>(
        phase: PhaseId,
        key: K,
        params: serde_json::Value,
    ) -> Self {
        Self { phase, key: key.into(), params }
    }

    pub fn digest(&self) -> ParamsDigest {
        ParamsDigest::of(&self.params)
    }
}

/// SHA-256 over the canonical JSON rendering of a resource's relevant
/// parameters, hex-encoded.
///
/// `serde_json` maps are ordered by key, so two parameter sets with the
/// same contents hash identically regardless of how the profile file
/// ordered them.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct ParamsDigest(String);

impl ParamsDigest {
    pub fn of(params: &serde_json::Value) -> Self {
        let canonical = serde_json::to_vec(params)
            .expect("JSON values always serialize");
        ParamsDigest(hex::encode(Sha256::digest(&canonical)))
    }
}

impl fmt::Display for ParamsDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
