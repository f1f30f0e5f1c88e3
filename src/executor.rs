// Sandboxed Executor
//
// Runs scripts in subprocesses with streamed output, a wall-clock timeout,
// and guaranteed process-tree termination. Two paths: a fresh spawn per run
// (script written to a scratch file), or a borrowed warm process from the
// pool fed over stdin with a per-run delimiter protocol.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sha2::Digest;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::{SandboxError, SandboxResult};
use crate::limits::ResourceLimitManager;
use crate::platform;
use crate::pool::{PoolHandle, ProcessPool, WarmSpec};
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionState, OutputCallback, RunId};

/// Ready-loop driver for warm Python processes. Prints a readiness line,
/// then serves runs: a `RUN <delimiter>` header, source lines, and a line
/// holding the delimiter alone. After each run it echoes the delimiter (with
/// the exit code) on stdout and the bare delimiter on stderr so the engine
/// knows both streams are drained.
pub const PY_WARM_DRIVER: &str = r#"
import json, sys, traceback

profile = json.loads(sys.argv[1]) if len(sys.argv) > 1 else {}
print("READY", flush=True)
while True:
    header = sys.stdin.readline()
    if not header:
        break
    header = header.strip()
    if not header.startswith("RUN "):
        continue
    delim = header[4:]
    lines = []
    while True:
        line = sys.stdin.readline()
        if not line or line.rstrip("\n") == delim:
            break
        lines.append(line)
    code = 0
    try:
        exec(compile("".join(lines), "<sandboxed>", "exec"), {"__profile__": profile})
    except SystemExit as e:
        code = int(e.code or 0)
    except BaseException:
        traceback.print_exc()
        code = 1
    sys.stdout.flush()
    sys.stderr.flush()
    print("%s %d" % (delim, code), flush=True)
    print(delim, file=sys.stderr, flush=True)
"#;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory for per-run script files; the system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
    /// Strip the inherited environment down to PATH and HOME before applying
    /// the request's variables
    pub isolate_environment: bool,
    /// Arguments that start the warm-process ready loop. The serialized
    /// profile is appended as one further argument when the request has one.
    pub warm_args: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            isolate_environment: true,
            warm_args: vec!["-u".to_string(), "-c".to_string(), PY_WARM_DRIVER.to_string()],
        }
    }
}

/// Cumulative executor counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorMetrics {
    pub executions: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

/// Seam between the engine and whatever actually runs scripts, so callers
/// can substitute their own runner (or a test double).
#[async_trait::async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Execute one request. Pre-flight problems surface as `Err`; once a
    /// process is involved, failures are data in the result's `error` field
    /// and the exit code. A `None` exit code always means the engine
    /// terminated the process.
    async fn execute(&self, request: ExecutionRequest) -> SandboxResult<ExecutionResult>;

    fn metrics(&self) -> ExecutorMetrics;
}

/// Runs sandboxed scripts. Cheap to share behind an `Arc`.
pub struct SandboxExecutor {
    config: ExecutorConfig,
    pool: Arc<ProcessPool>,
    limits: Arc<ResourceLimitManager>,
    executions: AtomicU64,
    failures: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SandboxExecutor {
    pub fn new(config: ExecutorConfig, pool: Arc<ProcessPool>, limits: Arc<ResourceLimitManager>) -> Self {
        Self {
            config,
            pool,
            limits,
            executions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ScriptExecutor for SandboxExecutor {
    async fn execute(&self, request: ExecutionRequest) -> SandboxResult<ExecutionResult> {
        if request.source.trim().is_empty() {
            return Err(SandboxError::invalid_request("script source is empty"));
        }
        let run_id = Uuid::new_v4();
        self.executions.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "run {} for script {} via {} (state: {:?})",
            run_id,
            request.script_id,
            request.interpreter,
            ExecutionState::Pending
        );

        // Pooled reuse only fits plain `interpreter script` invocations;
        // extra interpreter arguments force a fresh spawn.
        let result = if request.reuse_process && request.args.is_empty() {
            match self.run_pooled(run_id, &request).await {
                Ok(result) => result,
                Err(e) => {
                    log::warn!("pooled run {} unavailable, falling back to fresh spawn: {}", run_id, e);
                    self.run_fresh(run_id, &request).await?
                }
            }
        } else {
            self.run_fresh(run_id, &request).await?
        };

        self.total_duration_ms
            .fetch_add(result.duration.as_millis() as u64, Ordering::Relaxed);
        if result.timed_out || result.error.is_some() || result.exit_code != Some(0) {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        Ok(result)
    }

    fn metrics(&self) -> ExecutorMetrics {
        ExecutorMetrics {
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
        }
    }
}

impl SandboxExecutor {
    /// Fresh spawn: write the source to a scratch file, run the interpreter
    /// on it, race completion against the timeout.
    async fn run_fresh(&self, run_id: RunId, request: &ExecutionRequest) -> SandboxResult<ExecutionResult> {
        let started = Instant::now();
        let scratch_dir = self
            .config
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let script_path = scratch_dir.join(format!("sw_run_{}.script", run_id.simple()));
        tokio::fs::write(&script_path, &request.source).await?;

        let mut cmd = Command::new(&request.interpreter);
        cmd.args(&request.args).arg(&script_path);
        if let Some(profile) = &request.profile {
            cmd.arg(serde_json::to_string(profile)?);
        }
        if self.config.isolate_environment {
            cmd.env_clear();
            for key in ["PATH", "HOME"] {
                if let Ok(value) = std::env::var(key) {
                    cmd.env(key, value);
                }
            }
        }
        cmd.envs(&request.env);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::configure_detached(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&script_path).await;
                return Ok(failed_result(
                    run_id,
                    started.elapsed(),
                    format!("failed to spawn {}: {}", request.interpreter, e),
                ));
            }
        };
        let pid = child.id().unwrap_or(0);
        log::debug!("run {} spawned pid {} ({:?})", run_id, pid, ExecutionState::Running);
        self.limits.start_monitoring(&request.script_id, pid).await;

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| stream_lines(out, Arc::clone(&stdout_buf), request.on_stdout.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| stream_lines(err, Arc::clone(&stderr_buf), request.on_stderr.clone()));

        let (exit_code, timed_out, error) = tokio::select! {
            status = child.wait() => match status {
                // Signal deaths not caused by the engine map to -1 so a null
                // exit code stays reserved for engine termination
                Ok(status) => (status.code().or(Some(-1)), false, None),
                Err(e) => {
                    kill_tree_best_effort(run_id, pid);
                    (None, false, Some(format!("failed to await process: {}", e)))
                }
            },
            _ = sleep(request.timeout) => {
                log::warn!("run {} exceeded timeout of {:?}, killing pid {}", run_id, request.timeout, pid);
                kill_tree_best_effort(run_id, pid);
                let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
                (None, true, Some(format!("execution timed out after {:?}", request.timeout)))
            }
        };

        // Belt and braces: the group must be dead on every exit path
        kill_tree_best_effort(run_id, pid);
        self.limits.stop_monitoring(&request.script_id).await;

        if let (Some(out), Some(err)) = (stdout_task, stderr_task) {
            let _ = futures::future::join(out, err).await;
        }
        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            log::warn!("failed to remove scratch file {}: {}", script_path.display(), e);
        }

        let duration = started.elapsed();
        log::debug!(
            "run {} finished in {:?} ({:?})",
            run_id,
            duration,
            if timed_out { ExecutionState::TimedOut } else { ExecutionState::Completed }
        );
        Ok(ExecutionResult {
            run_id,
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
            exit_code,
            duration,
            timed_out,
            error,
            pool_reused: false,
            completed_at: chrono::Utc::now(),
        })
    }

    /// Pooled run: borrow a warm process matching the request's profile and
    /// drive one delimited exchange over its pipes.
    async fn run_pooled(&self, run_id: RunId, request: &ExecutionRequest) -> SandboxResult<ExecutionResult> {
        let started = Instant::now();
        let (profile_arg, profile_hash) = match &request.profile {
            Some(profile) => {
                let json = serde_json::to_string(profile)?;
                let hash = hex::encode(sha2::Sha256::digest(json.as_bytes()));
                (Some(json), hash)
            }
            None => (None, "none".to_string()),
        };
        let mut args = self.config.warm_args.clone();
        if let Some(json) = profile_arg {
            args.push(json);
        }
        let spec = WarmSpec {
            interpreter: request.interpreter.clone(),
            args,
            profile_hash,
        };

        let handle = self.pool.acquire(&spec).await?;
        log::debug!(
            "run {} using pooled pid {} (reused: {})",
            run_id,
            handle.pid,
            handle.reused
        );
        self.limits.start_monitoring(&request.script_id, handle.pid).await;

        let delimiter = format!("__sw_run_{}", run_id.simple());
        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));

        let exchange = self.pooled_exchange(&handle, request, &delimiter, &stdout_buf, &stderr_buf);
        let outcome = tokio::time::timeout(request.timeout, exchange).await;
        self.limits.stop_monitoring(&request.script_id).await;

        let (exit_code, timed_out, error, broken) = match outcome {
            Ok(Ok(code)) => (Some(code), false, None, false),
            Ok(Err(e)) => (None, false, Some(format!("pooled exchange failed: {}", e)), true),
            Err(_) => (
                None,
                true,
                Some(format!("execution timed out after {:?}", request.timeout)),
                true,
            ),
        };

        if broken {
            // A mid-run failure or timeout leaves the warm process in an
            // unknown state; it must never serve another script.
            self.pool.discard(&handle).await;
        } else {
            self.pool.release(&handle).await;
        }

        let duration = started.elapsed();
        log::debug!(
            "run {} finished pooled in {:?} ({:?})",
            run_id,
            duration,
            if timed_out { ExecutionState::TimedOut } else { ExecutionState::Released }
        );
        Ok(ExecutionResult {
            run_id,
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
            exit_code,
            duration,
            timed_out,
            error,
            pool_reused: handle.reused,
            completed_at: chrono::Utc::now(),
        })
    }

    /// One delimited request/response over a warm process's pipes. Returns
    /// the script's exit code.
    async fn pooled_exchange(
        &self,
        handle: &PoolHandle,
        request: &ExecutionRequest,
        delimiter: &str,
        stdout_buf: &Arc<Mutex<String>>,
        stderr_buf: &Arc<Mutex<String>>,
    ) -> SandboxResult<i32> {
        {
            let mut stdin = handle.stdin.lock().await;
            stdin.write_all(format!("RUN {}\n", delimiter).as_bytes()).await?;
            stdin.write_all(request.source.as_bytes()).await?;
            if !request.source.ends_with('\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.write_all(format!("{}\n", delimiter).as_bytes()).await?;
            stdin.flush().await?;
        }

        // Both streams are drained concurrently until each reports its
        // sentinel, so neither pipe can fill and stall the script. The
        // sentinel is matched anywhere in the line: a script whose final
        // write lacks a trailing newline leaves its partial output glued to
        // the sentinel, and that partial text still belongs to the script.
        let stdout_fut = async {
            let mut lines = handle.stdout.lock().await;
            loop {
                match lines.next_line().await? {
                    Some(line) => {
                        if let Some(idx) = line.find(delimiter) {
                            let partial = &line[..idx];
                            if !partial.is_empty() {
                                append_line(stdout_buf, &request.on_stdout, partial);
                            }
                            let rest = &line[idx + delimiter.len()..];
                            let code = rest.trim().parse::<i32>().unwrap_or(-1);
                            return Ok::<i32, SandboxError>(code);
                        }
                        append_line(stdout_buf, &request.on_stdout, &line);
                    }
                    None => {
                        return Err(SandboxError::pool_error("warm process closed stdout mid-run"));
                    }
                }
            }
        };
        let stderr_fut = async {
            let mut lines = handle.stderr.lock().await;
            loop {
                match lines.next_line().await? {
                    Some(line) => {
                        if let Some(idx) = line.find(delimiter) {
                            let partial = &line[..idx];
                            if !partial.is_empty() {
                                append_line(stderr_buf, &request.on_stderr, partial);
                            }
                            return Ok::<(), SandboxError>(());
                        }
                        append_line(stderr_buf, &request.on_stderr, &line);
                    }
                    None => {
                        return Err(SandboxError::pool_error("warm process closed stderr mid-run"));
                    }
                }
            }
        };

        let (code, drained) = futures::future::join(stdout_fut, stderr_fut).await;
        drained?;
        code
    }
}

/// Stream one pipe line by line into a shared buffer, invoking the
/// callback as each line arrives.
fn stream_lines<R>(
    reader: R,
    buffer: Arc<Mutex<String>>,
    callback: Option<OutputCallback>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            append_line(&buffer, &callback, &line);
        }
    })
}

fn append_line(buffer: &Arc<Mutex<String>>, callback: &Option<OutputCallback>, line: &str) {
    if let Some(cb) = callback {
        cb(line);
    }
    let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
    guard.push_str(line);
    guard.push('\n');
}

fn take_buffer(buffer: &Arc<Mutex<String>>) -> String {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(|e| e.into_inner()))
}

fn failed_result(run_id: RunId, duration: Duration, error: String) -> ExecutionResult {
    ExecutionResult {
        run_id,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: None,
        duration,
        timed_out: false,
        error: Some(error),
        pool_reused: false,
        completed_at: chrono::Utc::now(),
    }
}

fn kill_tree_best_effort(run_id: RunId, pid: u32) {
    if pid == 0 {
        return;
    }
    if let Err(e) = platform::terminate_tree(pid) {
        // Expected once the group is already gone
        log::debug!("run {}: terminate tree for pid {}: {}", run_id, pid, e);
    }
}

/// Find the first of `candidates` present on PATH, returning its absolute
/// path. Absolute candidates are checked directly.
pub fn discover_interpreter(candidates: &[&str]) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for candidate in candidates {
        let candidate_path = PathBuf::from(candidate);
        if candidate_path.is_absolute() {
            if is_executable(&candidate_path) {
                return Some(candidate_path);
            }
            continue;
        }
        for dir in std::env::split_paths(&path_var) {
            let full = dir.join(candidate);
            if is_executable(&full) {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(windows)]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::limits::LimitConfig;
    use crate::pool::PoolConfig;

    const SH_WARM_DRIVER: &str = r#"
echo READY
while read header; do
  d="${header#RUN }"
  body=""
  while IFS= read -r line; do
    [ "$line" = "$d" ] && break
    body="$body$line
"
  done
  printf '%s' "$body" | /bin/sh
  code=$?
  echo "$d $code"
  echo "$d" >&2
done
"#;

    fn sh_executor() -> SandboxExecutor {
        let config = ExecutorConfig {
            warm_args: vec!["-c".to_string(), SH_WARM_DRIVER.to_string()],
            ..Default::default()
        };
        SandboxExecutor::new(
            config,
            ProcessPool::new(PoolConfig::default()),
            Arc::new(ResourceLimitManager::new(LimitConfig::default())),
        )
    }

    fn sh_request(source: &str) -> ExecutionRequest {
        ExecutionRequest::new("test-script", source, "/bin/sh")
    }

    #[tokio::test]
    async fn fresh_run_captures_stdout_and_exit_code() {
        let executor = sh_executor();
        let result = executor.execute(sh_request("echo hello")).await.unwrap();
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
        assert!(!result.pool_reused);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn nonzero_exit_and_stderr_are_reported() {
        let executor = sh_executor();
        let result = executor
            .execute(sh_request("echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(result.stderr.trim(), "oops");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn timeout_kills_process_and_preserves_partial_output() {
        let executor = sh_executor();
        let request = sh_request("echo started; sleep 30")
            .with_timeout(Duration::from_millis(300));
        let result = executor.execute(request).await.unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(result.duration >= Duration::from_millis(300));
        assert_eq!(result.stdout.trim(), "started");
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn request_env_reaches_the_script() {
        let executor = sh_executor();
        let mut request = sh_request("echo \"$SANDBOX_GREETING\"");
        request.env.insert("SANDBOX_GREETING".to_string(), "hi there".to_string());
        let result = executor.execute(request).await.unwrap();
        assert_eq!(result.stdout.trim(), "hi there");
    }

    #[tokio::test]
    async fn stdout_callback_streams_lines() {
        let executor = sh_executor();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut request = sh_request("echo one; echo two");
        request.on_stdout = Some(Arc::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string());
        }));
        let result = executor.execute(request).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(*seen.lock().unwrap(), vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn pooled_runs_reuse_the_warm_process() {
        let executor = sh_executor();

        let first = executor
            .execute(sh_request("echo alpha").with_reuse(true))
            .await
            .unwrap();
        assert_eq!(first.stdout.trim(), "alpha");
        assert_eq!(first.exit_code, Some(0));
        assert!(!first.pool_reused);

        let second = executor
            .execute(sh_request("echo beta").with_reuse(true))
            .await
            .unwrap();
        assert_eq!(second.stdout.trim(), "beta");
        assert_eq!(second.exit_code, Some(0));
        assert!(second.pool_reused);
    }

    #[tokio::test]
    async fn pooled_partial_final_line_is_captured() {
        let executor = sh_executor();

        // No trailing newline, so the driver's sentinel lands on the same
        // line as the script's last write.
        let result = executor
            .execute(
                sh_request("printf partial")
                    .with_reuse(true)
                    .with_timeout(Duration::from_secs(2)),
            )
            .await
            .unwrap();
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "partial");
    }

    #[tokio::test]
    async fn pooled_timeout_discards_the_warm_process() {
        let executor = sh_executor();

        let result = executor
            .execute(
                sh_request("sleep 30")
                    .with_reuse(true)
                    .with_timeout(Duration::from_millis(300)),
            )
            .await
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);

        // The discarded process is gone, so the next pooled run warms anew
        let next = executor
            .execute(sh_request("echo fresh").with_reuse(true))
            .await
            .unwrap();
        assert!(!next.pool_reused);
        assert_eq!(next.stdout.trim(), "fresh");
    }

    #[tokio::test]
    async fn metrics_track_executions_and_failures() {
        let executor = sh_executor();
        executor.execute(sh_request("echo ok")).await.unwrap();
        executor.execute(sh_request("exit 2")).await.unwrap();
        let metrics = executor.metrics();
        assert_eq!(metrics.executions, 2);
        assert_eq!(metrics.failures, 1);
    }

    #[tokio::test]
    async fn empty_source_is_rejected_up_front() {
        let executor = sh_executor();
        let err = executor.execute(sh_request("   ")).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn scratch_dir_is_used_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecutorConfig {
            scratch_dir: Some(dir.path().to_path_buf()),
            warm_args: vec!["-c".to_string(), SH_WARM_DRIVER.to_string()],
            ..Default::default()
        };
        let executor = SandboxExecutor::new(
            config,
            ProcessPool::new(PoolConfig::default()),
            Arc::new(ResourceLimitManager::new(LimitConfig::default())),
        );

        let result = executor.execute(sh_request("pwd")).await.unwrap();
        assert_eq!(result.exit_code, Some(0));

        // The per-run script file is removed after the run
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn discover_interpreter_finds_sh() {
        let found = discover_interpreter(&["definitely-not-a-real-binary", "sh"]).unwrap();
        assert!(found.ends_with("sh"));
    }
}
