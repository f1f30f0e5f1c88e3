use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a single sandboxed execution
pub type RunId = Uuid;

/// Script identifier as assigned by the caller (manifest key)
pub type ScriptId = String;

/// Timestamp type
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Capabilities granted to a single script, overlaid on a process-wide
/// default. Every field group is replaced whole when overridden; an overlay
/// never widens the default implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    pub allowed_imports: HashSet<String>,
    pub file_system: FileSystemPermissions,
    pub network: NetworkPermissions,
    pub system_calls: SystemCallPermissions,
    pub allow_environment_access: bool,
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self {
            allowed_imports: HashSet::new(),
            file_system: FileSystemPermissions::default(),
            network: NetworkPermissions::default(),
            system_calls: SystemCallPermissions::default(),
            allow_environment_access: false,
        }
    }
}

/// Filesystem capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemPermissions {
    pub read: HashSet<PathBuf>,
    pub write: HashSet<PathBuf>,
    pub delete: bool,
}

/// Network capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPermissions {
    pub allowed_hosts: HashSet<String>,
    pub allowed_ports: HashSet<u16>,
    pub allow_localhost: bool,
}

/// System call capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCallPermissions {
    pub allowed_calls: HashSet<String>,
    pub allow_subprocesses: bool,
}

/// A partial update to a [`PermissionSet`]: one variant per field group.
/// Used both for permanent overrides and temporary grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionDelta {
    AllowedImports(HashSet<String>),
    FileSystem(FileSystemPermissions),
    Network(NetworkPermissions),
    SystemCalls(SystemCallPermissions),
    EnvironmentAccess(bool),
}

impl PermissionDelta {
    /// Stable name of the field group this delta replaces
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::AllowedImports(_) => "allowed_imports",
            Self::FileSystem(_) => "file_system",
            Self::Network(_) => "network",
            Self::SystemCalls(_) => "system_calls",
            Self::EnvironmentAccess(_) => "allow_environment_access",
        }
    }

    /// Replace the corresponding field group on `set`
    pub fn apply(&self, set: &mut PermissionSet) {
        match self {
            Self::AllowedImports(v) => set.allowed_imports = v.clone(),
            Self::FileSystem(v) => set.file_system = v.clone(),
            Self::Network(v) => set.network = v.clone(),
            Self::SystemCalls(v) => set.system_calls = v.clone(),
            Self::EnvironmentAccess(v) => set.allow_environment_access = *v,
        }
    }
}

/// A named, checkable allowance used by `PermissionManager::check`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Import(String),
    FileRead(PathBuf),
    FileWrite(PathBuf),
    FileDelete,
    Host(String),
    Port(u16),
    SystemCall(String),
    Subprocess,
    EnvironmentAccess,
}

/// Kinds of source constructs the scanner flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Subprocess,
    Network,
    FileRead,
    FileWrite,
    UnsafeImport,
    Eval,
    SystemCall,
}

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A security-relevant construct found by static scanning.
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DangerousOperation {
    pub kind: OperationKind,
    /// 1-based source line of the match
    pub line_number: usize,
    pub matched_text: String,
    pub severity: Severity,
    /// PermissionSet field that would permit this operation, if any
    pub suggested_capability: Option<String>,
}

/// A hard validation failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Outcome of a scan. `is_valid` is false iff `errors` is non-empty;
/// `dangerous_operations` may be non-empty even when valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub dangerous_operations: Vec<DangerousOperation>,
}

impl ValidationResult {
    pub fn new(errors: Vec<ValidationError>, dangerous_operations: Vec<DangerousOperation>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            dangerous_operations,
        }
    }
}

/// Per-script resource limits; each field independently overridable.
/// A global ceiling caps every field regardless of what a script requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<u32>,
    pub max_duration_secs: Option<u64>,
    pub max_file_size_bytes: Option<u64>,
    pub max_open_files: Option<u32>,
    pub max_threads: Option<u32>,
}

/// One CPU/memory sample of a monitored process
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub timestamp_ms: i64,
}

/// Resource kinds a violation can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Memory,
    Cpu,
    Duration,
}

impl ResourceKind {
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Memory => "MB",
            Self::Cpu => "%",
            Self::Duration => "s",
        }
    }
}

/// A recorded breach of a configured limit during monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceViolation {
    pub script_id: ScriptId,
    pub resource: ResourceKind,
    pub limit: f64,
    pub observed: f64,
    pub timestamp_ms: i64,
}

/// Aggregated usage statistics folded from a run's sample history
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub average_memory_mb: f64,
    pub average_cpu_percent: f64,
    pub peak_memory_mb: u64,
    pub peak_cpu_percent: f32,
    pub duration_secs: f64,
    pub violation_count: usize,
}

/// Streaming output callback, invoked once per line as it arrives
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A single execution request handed to the executor
#[derive(Clone)]
pub struct ExecutionRequest {
    pub script_id: ScriptId,
    /// Script source to execute
    pub source: String,
    /// Interpreter binary; resolved against PATH if not absolute
    pub interpreter: String,
    /// Extra interpreter arguments placed before the script path
    pub args: Vec<String>,
    pub timeout: Duration,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Prefer a pooled warm process when the invocation allows it
    pub reuse_process: bool,
    /// Serialized capability profile passed to the process as an argument
    pub profile: Option<SecurityProfile>,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
}

impl ExecutionRequest {
    pub fn new(script_id: impl Into<ScriptId>, source: impl Into<String>, interpreter: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            source: source.into(),
            interpreter: interpreter.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(60),
            env: HashMap::new(),
            cwd: None,
            reuse_process: false,
            profile: None,
            on_stdout: None,
            on_stderr: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_profile(mut self, profile: SecurityProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_reuse(mut self, reuse: bool) -> Self {
        self.reuse_process = reuse;
        self
    }
}

impl std::fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("script_id", &self.script_id)
            .field("interpreter", &self.interpreter)
            .field("timeout", &self.timeout)
            .field("reuse_process", &self.reuse_process)
            .finish_non_exhaustive()
    }
}

/// Structured result of one execution. `exit_code` is `None` exactly when
/// the engine terminated the process (timeout or forced kill).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: RunId,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub timed_out: bool,
    pub error: Option<String>,
    /// Whether a pooled warm process served this run
    pub pool_reused: bool,
    pub completed_at: Timestamp,
}

/// Lifecycle of a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Pending,
    Spawning,
    Running,
    Completed,
    TimedOut,
    Failed,
    Released,
}

/// Versioned capability schema handed to the sandboxed process as a JSON
/// argument at spawn time. Field names are the engine/process wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub version: u32,
    pub allowed_imports: Vec<String>,
    pub filesystem: ProfileFilesystem,
    pub network: ProfileNetwork,
    pub system: ProfileSystem,
    pub environment: ProfileEnvironment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFilesystem {
    pub read_paths: Vec<String>,
    pub write_paths: Vec<String>,
    pub allow_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileNetwork {
    pub allowed_hosts: Vec<String>,
    pub allowed_ports: Vec<u16>,
    pub allow_localhost: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSystem {
    pub allowed_calls: Vec<String>,
    pub allow_subprocesses: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEnvironment {
    pub allow_access: bool,
}

/// The manifest's security section as supplied by the caller. Accepts both
/// the legacy flat permission shape and the richer nested shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestSecurity {
    #[serde(default)]
    pub permissions: Option<ManifestPermissions>,
    #[serde(default)]
    pub resource_limits: Option<ManifestResourceLimits>,
    /// Declared sha256 of the script source, hex encoded. Recomputed and
    /// compared before execution when present.
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// Modern nested permissions or the legacy flat shape. Untagged: the modern
/// shape is tried first, so when a manifest carries fields of both, modern
/// wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestPermissions {
    Modern(PermissionSet),
    Legacy(LegacyPermissions),
}

/// Older flat permission shape still found in existing manifests
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyPermissions {
    #[serde(default)]
    pub allowed_imports: Vec<String>,
    #[serde(default)]
    pub read_paths: Vec<PathBuf>,
    #[serde(default)]
    pub write_paths: Vec<PathBuf>,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub allow_filesystem: bool,
}

/// Manifest resource limit request (`execution.resource_limits`)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ManifestResourceLimits {
    /// Requested memory limit in MB
    pub memory: Option<u64>,
    /// Requested CPU limit in percent
    pub cpu: Option<u32>,
    /// Requested wall-clock limit in seconds
    pub duration: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_replaces_only_its_field_group() {
        let mut set = PermissionSet::default();
        set.allowed_imports.insert("json".to_string());

        let delta = PermissionDelta::SystemCalls(SystemCallPermissions {
            allowed_calls: HashSet::new(),
            allow_subprocesses: true,
        });
        delta.apply(&mut set);

        assert!(set.system_calls.allow_subprocesses);
        assert!(set.allowed_imports.contains("json"));
        assert!(!set.allow_environment_access);
    }

    #[test]
    fn manifest_permissions_prefers_modern_shape() {
        let json = serde_json::json!({
            "allowed_imports": ["json"],
            "file_system": {"read": [], "write": [], "delete": false},
            "network": {"allowed_hosts": [], "allowed_ports": [], "allow_localhost": false},
            "system_calls": {"allowed_calls": [], "allow_subprocesses": false},
            "allow_environment_access": false
        });
        let parsed: ManifestPermissions = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, ManifestPermissions::Modern(_)));
    }

    #[test]
    fn manifest_permissions_accepts_legacy_shape() {
        let json = serde_json::json!({
            "read_paths": ["/tmp/data"],
            "allow_network": true
        });
        let parsed: ManifestPermissions = serde_json::from_value(json).unwrap();
        assert!(matches!(parsed, ManifestPermissions::Legacy(_)));
    }

    #[test]
    fn validation_result_validity_tracks_errors() {
        let ok = ValidationResult::new(vec![], vec![]);
        assert!(ok.is_valid);

        let bad = ValidationResult::new(
            vec![ValidationError {
                field: "imports".to_string(),
                message: "blocked".to_string(),
            }],
            vec![],
        );
        assert!(!bad.is_valid);
    }
}
