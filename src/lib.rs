// Scriptwarden
//
// Sandboxed execution engine for untrusted scripts: a capability permission
// model with temporary grants, static security scanning, resource limit
// monitoring, a warm process pool, and an executor with guaranteed
// process-tree termination.

pub mod engine;
pub mod error;
pub mod executor;
pub mod limits;
pub mod permissions;
pub mod platform;
pub mod pool;
pub mod scanner;
pub mod types;

// Re-export main types and traits
pub use engine::{EngineConfig, SandboxEngine};
pub use error::{SandboxError, SandboxResult};
pub use executor::{discover_interpreter, ExecutorConfig, ExecutorMetrics, SandboxExecutor, ScriptExecutor};
pub use limits::{LimitConfig, ResourceLimitManager};
pub use permissions::{PermissionManager, RequirementCheck, TemporaryGrant};
pub use pool::{PoolConfig, PoolHandle, ProcessPool, WarmSpec};
pub use scanner::{ScannerConfig, SecurityScanner, SystemCeilings};
pub use types::*;
