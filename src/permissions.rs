// Permission Model
//
// Capability-based permission tracking: a process-wide default PermissionSet,
// per-script permanent overrides, and temporary grants with lazy expiry.
// Overrides replace whole field groups; an override never implicitly widens
// the default.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::SandboxResult;
use crate::types::*;

/// A capability override with an absolute expiry. Expiry is evaluated lazily
/// at every read, so a delayed sweep can never leave a stale grant visible.
#[derive(Debug, Clone)]
pub struct TemporaryGrant {
    pub delta: PermissionDelta,
    pub expires_at: Instant,
}

impl TemporaryGrant {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of `validate_required`
#[derive(Debug, Clone)]
pub struct RequirementCheck {
    pub is_valid: bool,
    pub missing_permissions: Vec<String>,
}

#[derive(Default)]
struct ScriptEntry {
    /// Permanent field-group overrides, keyed by field name
    permanent: HashMap<&'static str, PermissionDelta>,
    /// Active temporary grants, keyed by field name. A second grant on the
    /// same field replaces the first.
    grants: HashMap<&'static str, TemporaryGrant>,
}

/// Tracks granted capabilities per script. Explicitly constructed and passed
/// to the executor; there is no global instance.
pub struct PermissionManager {
    defaults: PermissionSet,
    scripts: Arc<RwLock<HashMap<ScriptId, ScriptEntry>>>,
}

impl PermissionManager {
    /// Create a manager with the built-in restrictive defaults
    pub fn new() -> Self {
        Self::with_defaults(PermissionSet::default())
    }

    /// Create a manager with caller-supplied process-wide defaults
    pub fn with_defaults(defaults: PermissionSet) -> Self {
        Self {
            defaults,
            scripts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Effective permissions for a script: defaults overlaid with permanent
    /// overrides and any still-valid temporary grants.
    pub async fn get_effective(&self, script_id: &str) -> PermissionSet {
        let now = Instant::now();
        let scripts = self.scripts.read().await;
        let mut effective = self.defaults.clone();
        if let Some(entry) = scripts.get(script_id) {
            for delta in entry.permanent.values() {
                delta.apply(&mut effective);
            }
            for grant in entry.grants.values() {
                if !grant.is_expired(now) {
                    grant.delta.apply(&mut effective);
                }
            }
        }
        effective
    }

    /// Replace the named field groups for a script. Untouched fields keep
    /// their prior values.
    pub async fn set_permanent(&self, script_id: &str, deltas: Vec<PermissionDelta>) {
        let mut scripts = self.scripts.write().await;
        let entry = scripts.entry(script_id.to_string()).or_default();
        for delta in deltas {
            entry.permanent.insert(delta.field_name(), delta);
        }
    }

    /// Install a temporary grant for one field group. Reverts automatically:
    /// reads recompute the effective set from base + unexpired grants, so no
    /// rollback step exists to fail partially.
    pub async fn grant_temporary(&self, script_id: &str, delta: PermissionDelta, duration: Duration) {
        let grant = TemporaryGrant {
            expires_at: Instant::now() + duration,
            delta,
        };
        let mut scripts = self.scripts.write().await;
        let entry = scripts.entry(script_id.to_string()).or_default();
        entry.grants.insert(grant.delta.field_name(), grant);
    }

    /// Best-effort removal of expired grant entries. Purely an allocation
    /// cleanup; correctness does not depend on it running.
    pub async fn sweep_expired(&self) {
        let now = Instant::now();
        let mut scripts = self.scripts.write().await;
        for entry in scripts.values_mut() {
            entry.grants.retain(|_, g| !g.is_expired(now));
        }
    }

    /// Check a single capability against the script's effective permissions
    pub async fn check(&self, script_id: &str, capability: &Capability) -> bool {
        let effective = self.get_effective(script_id).await;
        check_capability(&effective, capability)
    }

    /// Verify every capability in `required` against the effective set.
    /// Each missing capability produces one human-readable message.
    pub async fn validate_required(&self, script_id: &str, required: &PermissionSet) -> RequirementCheck {
        let effective = self.get_effective(script_id).await;
        let mut missing = Vec::new();

        for import in &required.allowed_imports {
            if !check_capability(&effective, &Capability::Import(import.clone())) {
                missing.push(format!("import of module '{}' is not allowed", import));
            }
        }
        for path in &required.file_system.read {
            if !check_capability(&effective, &Capability::FileRead(path.clone())) {
                missing.push(format!("read access to '{}' is not allowed", path.display()));
            }
        }
        for path in &required.file_system.write {
            if !check_capability(&effective, &Capability::FileWrite(path.clone())) {
                missing.push(format!("write access to '{}' is not allowed", path.display()));
            }
        }
        if required.file_system.delete && !effective.file_system.delete {
            missing.push("file deletion is not allowed".to_string());
        }
        for host in &required.network.allowed_hosts {
            if !check_capability(&effective, &Capability::Host(host.clone())) {
                missing.push(format!("network access to host '{}' is not allowed", host));
            }
        }
        for port in &required.network.allowed_ports {
            if !check_capability(&effective, &Capability::Port(*port)) {
                missing.push(format!("network access to port {} is not allowed", port));
            }
        }
        if required.network.allow_localhost && !effective.network.allow_localhost {
            missing.push("localhost network access is not allowed".to_string());
        }
        for call in &required.system_calls.allowed_calls {
            if !check_capability(&effective, &Capability::SystemCall(call.clone())) {
                missing.push(format!("system call '{}' is not allowed", call));
            }
        }
        if required.system_calls.allow_subprocesses && !effective.system_calls.allow_subprocesses {
            missing.push("subprocess creation is not allowed".to_string());
        }
        if required.allow_environment_access && !effective.allow_environment_access {
            missing.push("environment variable access is not allowed".to_string());
        }

        RequirementCheck {
            is_valid: missing.is_empty(),
            missing_permissions: missing,
        }
    }

    /// Load a manifest's permission section for a script, translating the
    /// legacy flat shape into the richer model on the way in.
    pub async fn load_manifest(&self, script_id: &str, manifest: &ManifestSecurity) -> SandboxResult<()> {
        let Some(permissions) = &manifest.permissions else {
            return Ok(());
        };
        let set = match permissions {
            ManifestPermissions::Modern(set) => set.clone(),
            ManifestPermissions::Legacy(legacy) => translate_legacy(legacy),
        };
        self.set_permanent(
            script_id,
            vec![
                PermissionDelta::AllowedImports(set.allowed_imports),
                PermissionDelta::FileSystem(set.file_system),
                PermissionDelta::Network(set.network),
                PermissionDelta::SystemCalls(set.system_calls),
                PermissionDelta::EnvironmentAccess(set.allow_environment_access),
            ],
        )
        .await;
        Ok(())
    }

    /// Serialize the effective permissions into the versioned profile handed
    /// to the sandboxed process at spawn time.
    pub async fn build_profile(&self, script_id: &str) -> SecurityProfile {
        profile_from_set(&self.get_effective(script_id).await)
    }
}

impl Default for PermissionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Current profile schema version
pub const PROFILE_VERSION: u32 = 1;

/// Build the wire-format profile from an effective permission set
pub fn profile_from_set(set: &PermissionSet) -> SecurityProfile {
    let sorted = |items: Vec<String>| -> Vec<String> {
        let mut v = items;
        v.sort();
        v
    };
    let path_strings = |paths: &std::collections::HashSet<PathBuf>| -> Vec<String> {
        let mut v: Vec<String> = paths.iter().map(|p| p.to_string_lossy().to_string()).collect();
        v.sort();
        v
    };
    let mut ports: Vec<u16> = set.network.allowed_ports.iter().copied().collect();
    ports.sort_unstable();

    SecurityProfile {
        version: PROFILE_VERSION,
        allowed_imports: sorted(set.allowed_imports.iter().cloned().collect()),
        filesystem: ProfileFilesystem {
            read_paths: path_strings(&set.file_system.read),
            write_paths: path_strings(&set.file_system.write),
            allow_delete: set.file_system.delete,
        },
        network: ProfileNetwork {
            allowed_hosts: sorted(set.network.allowed_hosts.iter().cloned().collect()),
            allowed_ports: ports,
            allow_localhost: set.network.allow_localhost,
        },
        system: ProfileSystem {
            allowed_calls: sorted(set.system_calls.allowed_calls.iter().cloned().collect()),
            allow_subprocesses: set.system_calls.allow_subprocesses,
        },
        environment: ProfileEnvironment {
            allow_access: set.allow_environment_access,
        },
    }
}

/// Reconstruct a PermissionSet from a deserialized profile. Used to verify
/// the profile round-trips across the process boundary.
pub fn set_from_profile(profile: &SecurityProfile) -> PermissionSet {
    PermissionSet {
        allowed_imports: profile.allowed_imports.iter().cloned().collect(),
        file_system: FileSystemPermissions {
            read: profile.filesystem.read_paths.iter().map(PathBuf::from).collect(),
            write: profile.filesystem.write_paths.iter().map(PathBuf::from).collect(),
            delete: profile.filesystem.allow_delete,
        },
        network: NetworkPermissions {
            allowed_hosts: profile.network.allowed_hosts.iter().cloned().collect(),
            allowed_ports: profile.network.allowed_ports.iter().copied().collect(),
            allow_localhost: profile.network.allow_localhost,
        },
        system_calls: SystemCallPermissions {
            allowed_calls: profile.system.allowed_calls.iter().cloned().collect(),
            allow_subprocesses: profile.system.allow_subprocesses,
        },
        allow_environment_access: profile.environment.allow_access,
    }
}

/// Translate the legacy flat permission shape into the richer model.
/// Subprocess and environment access are never granted by translation.
pub fn translate_legacy(legacy: &LegacyPermissions) -> PermissionSet {
    let network = if legacy.allow_network {
        NetworkPermissions {
            allowed_hosts: ["*".to_string()].into_iter().collect(),
            allowed_ports: [80u16, 443u16].into_iter().collect(),
            allow_localhost: false,
        }
    } else {
        NetworkPermissions::default()
    };

    let mut read: std::collections::HashSet<PathBuf> = legacy.read_paths.iter().cloned().collect();
    let write: std::collections::HashSet<PathBuf> = legacy.write_paths.iter().cloned().collect();
    if legacy.allow_filesystem && read.is_empty() && write.is_empty() {
        // Old boolean-only manifests meant "temp dir only"
        read.insert(std::env::temp_dir());
    }

    PermissionSet {
        allowed_imports: legacy.allowed_imports.iter().cloned().collect(),
        file_system: FileSystemPermissions {
            read,
            write,
            delete: false,
        },
        network,
        system_calls: SystemCallPermissions::default(),
        allow_environment_access: false,
    }
}

/// Fold scan findings into the partial PermissionSet an execution would
/// need. Only concrete, checkable requirements are collected: module names,
/// path literals and URL hosts. Findings whose matched text is a code
/// construct rather than a value (a raw socket call, say) stay advisory.
pub fn required_from_findings(findings: &[DangerousOperation]) -> PermissionSet {
    let mut required = PermissionSet::default();
    for finding in findings {
        match finding.suggested_capability.as_deref() {
            Some("allowed_imports") => {
                required.allowed_imports.insert(finding.matched_text.clone());
            }
            Some("file_system.read") => {
                required.file_system.read.insert(PathBuf::from(&finding.matched_text));
            }
            Some("file_system.write") => {
                required.file_system.write.insert(PathBuf::from(&finding.matched_text));
            }
            Some("network.allowed_hosts") if is_hostname(&finding.matched_text) => {
                required.network.allowed_hosts.insert(finding.matched_text.clone());
            }
            _ => {}
        }
    }
    required
}

fn is_hostname(text: &str) -> bool {
    !text.is_empty() && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Field-specific capability matching against an effective set
pub fn check_capability(effective: &PermissionSet, capability: &Capability) -> bool {
    match capability {
        Capability::Import(module) => {
            effective.allowed_imports.contains(module) || effective.allowed_imports.contains("*")
        }
        Capability::FileRead(path) => path_allowed(path, &effective.file_system.read),
        Capability::FileWrite(path) => path_allowed(path, &effective.file_system.write),
        Capability::FileDelete => effective.file_system.delete,
        Capability::Host(host) => host_allowed(host, &effective.network),
        // Port 0 acts as the port wildcard
        Capability::Port(port) => {
            effective.network.allowed_ports.contains(port) || effective.network.allowed_ports.contains(&0)
        }
        Capability::SystemCall(call) => {
            effective.system_calls.allowed_calls.contains(call)
                || effective.system_calls.allowed_calls.contains("*")
        }
        Capability::Subprocess => effective.system_calls.allow_subprocesses,
        Capability::EnvironmentAccess => effective.allow_environment_access,
    }
}

/// Prefix containment on lexically normalized absolute paths
fn path_allowed(path: &Path, allowed: &std::collections::HashSet<PathBuf>) -> bool {
    let normalized = normalize_path(path);
    allowed.iter().any(|root| normalized.starts_with(normalize_path(root)))
}

/// Exact or wildcard host match. `*` matches everything; `*.example.com`
/// matches subdomains of example.com. Localhost names go through the
/// dedicated boolean.
fn host_allowed(host: &str, network: &NetworkPermissions) -> bool {
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return network.allow_localhost;
    }
    network.allowed_hosts.iter().any(|allowed| {
        allowed == "*"
            || allowed == host
            || allowed
                .strip_prefix("*.")
                .is_some_and(|suffix| host == suffix || host.ends_with(&format!(".{}", suffix)))
    })
}

/// Lexical normalization: resolve `.`/`..` components without touching the
/// filesystem, so checks never follow symlinks or require the path to exist.
fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::temp_dir().join(path)
    };
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
