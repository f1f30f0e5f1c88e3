// Sandbox Engine
//
// Facade wiring the permission manager, scanner, limit manager, process
// pool and executor into one entry point. A run flows scan gate ->
// profile build -> execute with resource monitoring attached.

use std::sync::Arc;

use crate::error::{SandboxError, SandboxResult};
use crate::executor::{ExecutorConfig, ExecutorMetrics, SandboxExecutor, ScriptExecutor};
use crate::limits::{LimitConfig, ResourceLimitManager};
use crate::permissions::{self, PermissionManager};
use crate::pool::{PoolConfig, ProcessPool};
use crate::scanner::{ScannerConfig, SecurityScanner};
use crate::types::{
    ExecutionRequest, ExecutionResult, ManifestSecurity, PermissionSet, ResourceLimits, ValidationResult,
};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub scanner: ScannerConfig,
    pub limits: LimitConfig,
    pub pool: PoolConfig,
    pub executor: ExecutorConfig,
}

/// One engine instance serves many scripts. Cheap to share behind an `Arc`.
pub struct SandboxEngine {
    permissions: PermissionManager,
    scanner: SecurityScanner,
    limits: Arc<ResourceLimitManager>,
    pool: Arc<ProcessPool>,
    executor: Box<dyn ScriptExecutor>,
}

impl SandboxEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_defaults(config, PermissionSet::default())
    }

    /// Build an engine whose scripts start from `defaults` instead of the
    /// deny-all baseline.
    pub fn with_defaults(config: EngineConfig, defaults: PermissionSet) -> Self {
        let limits = Arc::new(ResourceLimitManager::new(config.limits));
        let pool = ProcessPool::new(config.pool);
        let executor = SandboxExecutor::new(config.executor, Arc::clone(&pool), Arc::clone(&limits));
        Self {
            permissions: PermissionManager::with_defaults(defaults),
            scanner: SecurityScanner::new(config.scanner),
            limits,
            pool,
            executor: Box::new(executor),
        }
    }

    pub fn permissions(&self) -> &PermissionManager {
        &self.permissions
    }

    pub fn limits(&self) -> &ResourceLimitManager {
        &self.limits
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        self.executor.metrics()
    }

    /// Load a script's manifest: permanent permission grants plus resource
    /// limit requests (clamped by the configured ceiling at lookup time).
    pub async fn register_script(&self, script_id: &str, manifest: &ManifestSecurity) -> SandboxResult<()> {
        self.permissions.load_manifest(script_id, manifest).await?;
        if let Some(requested) = &manifest.resource_limits {
            self.limits
                .set_limits(
                    script_id,
                    ResourceLimits {
                        max_memory_mb: requested.memory,
                        max_cpu_percent: requested.cpu,
                        max_duration_secs: requested.duration,
                        ..Default::default()
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Scan without executing, against the script's current effective
    /// permissions.
    pub async fn scan(&self, script_id: &str, source: &str, manifest: &ManifestSecurity) -> ValidationResult {
        let effective = self.permissions.get_effective(script_id).await;
        self.scanner.scan(source, manifest, &effective)
    }

    /// Scan, then execute. Both gates fail closed before any spawn: hard
    /// scan violations are fatal, and findings whose responsible capability
    /// is missing surface as a permission error that a grant can resolve.
    pub async fn run(
        &self,
        mut request: ExecutionRequest,
        manifest: &ManifestSecurity,
    ) -> SandboxResult<ExecutionResult> {
        let effective = self.permissions.get_effective(&request.script_id).await;
        let scan = self.scanner.scan(&request.source, manifest, &effective);
        if !scan.is_valid {
            log::warn!(
                "script {} blocked by scan: {} error(s)",
                request.script_id,
                scan.errors.len()
            );
            return Err(SandboxError::validation_failed(scan.errors));
        }

        let required = permissions::required_from_findings(&scan.dangerous_operations);
        let check = self.permissions.validate_required(&request.script_id, &required).await;
        if !check.is_valid {
            log::warn!(
                "script {} blocked on missing permissions: {}",
                request.script_id,
                check.missing_permissions.join("; ")
            );
            return Err(SandboxError::permission_denied(check.missing_permissions));
        }

        if request.profile.is_none() {
            request.profile = Some(self.permissions.build_profile(&request.script_id).await);
        }
        self.executor.execute(request).await
    }

    /// Kill every pooled process. Call before dropping the engine.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}
