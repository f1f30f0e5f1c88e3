// End-to-end engine tests. Hermetic: everything runs through /bin/sh so no
// interpreter beyond a POSIX shell is required.

#![cfg(unix)]

use std::time::Duration;

use scriptwarden::{
    Capability, EngineConfig, ExecutionRequest, FileSystemPermissions, ManifestSecurity,
    PermissionDelta, SandboxEngine, SandboxError,
};

fn sh_request(script_id: &str, source: &str) -> ExecutionRequest {
    ExecutionRequest::new(script_id, source, "/bin/sh")
}

#[tokio::test]
async fn engine_runs_a_simple_script() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest = ManifestSecurity::default();

    let result = engine
        .run(
            sh_request("hello", "sleep 0.1; echo hello from the sandbox")
                .with_timeout(Duration::from_secs(5)),
            &manifest,
        )
        .await
        .unwrap();

    assert_eq!(result.stdout.trim(), "hello from the sandbox");
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.timed_out);
    assert!(result.error.is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn scan_gate_blocks_dangerous_source_before_spawn() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest = ManifestSecurity::default();

    let source = "import subprocess\nsubprocess.run(['rm', '-rf', '/'])\n";
    let err = engine.run(sh_request("evil", source), &manifest).await.unwrap_err();
    assert!(matches!(err, SandboxError::ValidationFailed(_)));

    // Nothing ran, so the executor never counted an execution
    assert_eq!(engine.metrics().executions, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn content_hash_mismatch_is_fatal() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest = ManifestSecurity {
        content_hash: Some("deadbeef".repeat(8)),
        ..Default::default()
    };

    let err = engine
        .run(sh_request("tampered", "echo fine"), &manifest)
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::ValidationFailed(_)));

    engine.shutdown().await;
}

#[tokio::test]
async fn timeout_terminates_the_process_tree() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest = ManifestSecurity::default();

    // The subshell would keep the tree alive if only the parent were killed
    let request = sh_request("runaway", "(sleep 60) & sleep 60")
        .with_timeout(Duration::from_millis(300));
    let result = engine.run(request, &manifest).await.unwrap();

    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert!(result.duration >= Duration::from_millis(300));
    assert!(result.duration < Duration::from_secs(10));

    engine.shutdown().await;
}

#[tokio::test]
async fn manifest_resource_requests_are_clamped_by_the_ceiling() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest_json = serde_json::json!({
        "resource_limits": { "memory": 1_000_000, "cpu": 50, "duration": 30 }
    });
    let manifest: ManifestSecurity = serde_json::from_value(manifest_json).unwrap();

    engine.register_script("greedy", &manifest).await.unwrap();
    let limits = engine.limits().get_limits("greedy").await;

    // Memory request exceeds the 4096 MB ceiling; the others fit
    assert_eq!(limits.max_memory_mb, Some(4096));
    assert_eq!(limits.max_cpu_percent, Some(50));
    assert_eq!(limits.max_duration_secs, Some(30));

    engine.shutdown().await;
}

#[tokio::test]
async fn temporary_grant_widens_then_reverts() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let cap = Capability::Import("requests".to_string());
    assert!(!engine.permissions().check("trial", &cap).await);

    engine
        .permissions()
        .grant_temporary(
            "trial",
            PermissionDelta::AllowedImports(["requests".to_string()].into()),
            Duration::from_millis(80),
        )
        .await;
    assert!(engine.permissions().check("trial", &cap).await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!engine.permissions().check("trial", &cap).await);

    engine.shutdown().await;
}

#[tokio::test]
async fn ungranted_file_read_blocks_until_granted() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest = ManifestSecurity::default();

    // The source passes the scan but touches a path nobody granted
    let source = "echo ran # open(\"/etc/passwd\")";
    let err = engine
        .run(sh_request("reader", source), &manifest)
        .await
        .unwrap_err();
    let SandboxError::PermissionDenied(missing) = err else {
        panic!("expected a permission error, got {err:?}");
    };
    assert!(missing.iter().any(|m| m.contains("/etc/passwd")));
    assert_eq!(engine.metrics().executions, 0);

    // A grant for the path makes the same script runnable
    engine
        .permissions()
        .grant_temporary(
            "reader",
            PermissionDelta::FileSystem(FileSystemPermissions {
                read: ["/etc/passwd".into()].into(),
                ..Default::default()
            }),
            Duration::from_secs(5),
        )
        .await;
    let result = engine
        .run(
            sh_request("reader", source).with_timeout(Duration::from_secs(5)),
            &manifest,
        )
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "ran");
    assert_eq!(result.exit_code, Some(0));

    engine.shutdown().await;
}

#[tokio::test]
async fn scan_reports_findings_without_blocking_valid_scripts() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest = ManifestSecurity::default();

    let source = "import requests\nrequests.get('https://api.example.com/data')\n";
    let scan = engine.scan("netscript", source, &manifest).await;

    assert!(scan.is_valid);
    assert!(!scan.dangerous_operations.is_empty());

    engine.shutdown().await;
}

#[tokio::test]
async fn legacy_manifest_grants_are_honored_at_run_time() {
    let engine = SandboxEngine::new(EngineConfig::default());
    let manifest_json = serde_json::json!({
        "permissions": { "allowed_imports": ["json", "math"] }
    });
    let manifest: ManifestSecurity = serde_json::from_value(manifest_json).unwrap();
    engine.register_script("legacy", &manifest).await.unwrap();

    let scan = engine
        .scan("legacy", "import json\nprint(json.dumps({}))\n", &manifest)
        .await;
    assert!(scan.is_valid);
    // The import is granted, so it is not flagged as an ungranted operation
    assert!(scan
        .dangerous_operations
        .iter()
        .all(|op| !op.matched_text.contains("json")));

    engine.shutdown().await;
}
