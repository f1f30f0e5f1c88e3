// Process Pool
//
// Warm, reusable interpreter processes keyed by interpreter path. Interpreter
// startup dominates short-script latency; reuse amortizes it. Pooled
// processes are not perfectly isolated between runs, so the executor owns
// each borrowed process's pipes for the duration of one execution and a
// pooled entry is only ever lent to scripts with the same profile hash it
// was warmed with.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{SandboxError, SandboxResult};
use crate::platform;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Entries per interpreter path before LRU eviction
    pub max_per_interpreter: usize,
    /// Idle entries older than this are reaped
    pub max_idle: Duration,
    pub reap_interval: Duration,
    /// How long to wait for a fresh warm process's readiness line
    pub ready_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_interpreter: 3,
            max_idle: Duration::from_secs(120),
            reap_interval: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// What to spawn when no idle entry is available
#[derive(Debug, Clone)]
pub struct WarmSpec {
    pub interpreter: String,
    /// Arguments starting the interpreter's ready-loop driver, including any
    /// serialized profile argument
    pub args: Vec<String>,
    /// Hash of the permission profile the process is warmed with
    pub profile_hash: String,
}

/// A borrowed pooled process. The pipes are exclusively the borrower's until
/// release or discard.
#[derive(Clone)]
pub struct PoolHandle {
    pub id: Uuid,
    pub interpreter: String,
    pub pid: u32,
    pub profile_hash: String,
    /// True when an existing warm process served this acquire
    pub reused: bool,
    pub stdin: Arc<Mutex<ChildStdin>>,
    pub stdout: Arc<Mutex<Lines<BufReader<ChildStdout>>>>,
    pub stderr: Arc<Mutex<Lines<BufReader<ChildStderr>>>>,
}

struct PooledProcess {
    id: Uuid,
    pid: u32,
    profile_hash: String,
    created_at: Instant,
    last_used_at: Instant,
    in_use: bool,
    usage_count: u64,
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
    stdout: Arc<Mutex<Lines<BufReader<ChildStdout>>>>,
    stderr: Arc<Mutex<Lines<BufReader<ChildStderr>>>>,
}

impl PooledProcess {
    fn handle(&self, interpreter: &str, reused: bool) -> PoolHandle {
        PoolHandle {
            id: self.id,
            interpreter: interpreter.to_string(),
            pid: self.pid,
            profile_hash: self.profile_hash.clone(),
            reused,
            stdin: Arc::clone(&self.stdin),
            stdout: Arc::clone(&self.stdout),
            stderr: Arc::clone(&self.stderr),
        }
    }
}

/// Pool of warm interpreter processes. The single mutex serializes
/// acquire/release/evict against concurrent callers, so no two callers can
/// be lent the same idle entry.
pub struct ProcessPool {
    config: PoolConfig,
    pools: Arc<Mutex<HashMap<String, Vec<PooledProcess>>>>,
    reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Kill an entry's process tree and reap its exit status so it never
/// lingers as a zombie.
fn kill_entry(entry: PooledProcess) {
    if let Err(e) = platform::terminate_tree(entry.pid) {
        log::warn!("failed to kill pooled process {}: {}", entry.pid, e);
    }
    let child = entry.child;
    tokio::spawn(async move {
        let _ = timeout(Duration::from_secs(2), async {
            child.lock().await.wait().await
        })
        .await;
    });
}

impl ProcessPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            pools: Arc::new(Mutex::new(HashMap::new())),
            reaper: std::sync::Mutex::new(None),
        });
        pool.start_reaper();
        pool
    }

    /// Return an idle matching entry or spawn a new warm process, blocking
    /// only until the new process prints its readiness line.
    pub async fn acquire(&self, spec: &WarmSpec) -> SandboxResult<PoolHandle> {
        {
            let mut pools = self.pools.lock().await;
            let entries = pools.entry(spec.interpreter.clone()).or_default();

            if let Some(entry) = entries
                .iter_mut()
                .find(|e| !e.in_use && e.profile_hash == spec.profile_hash)
            {
                entry.in_use = true;
                return Ok(entry.handle(&spec.interpreter, true));
            }

            // At capacity: forcibly evict the least-recently-used entry, in
            // use or not. Eviction never blocks beyond the kill call.
            if entries.len() >= self.config.max_per_interpreter {
                Self::evict_lru(entries);
            }
        }

        // The lock is dropped while the new process warms up, so a slow
        // interpreter start cannot stall release/discard or acquires for
        // other pools.
        let mut entry = self.spawn_warm(spec).await?;
        entry.in_use = true;
        let handle = entry.handle(&spec.interpreter, false);

        let mut pools = self.pools.lock().await;
        let entries = pools.entry(spec.interpreter.clone()).or_default();
        // Concurrent acquires may have refilled the slot we opened up
        if entries.len() >= self.config.max_per_interpreter {
            Self::evict_lru(entries);
        }
        entries.push(entry);
        Ok(handle)
    }

    fn evict_lru(entries: &mut Vec<PooledProcess>) {
        if let Some(lru_idx) = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_used_at)
            .map(|(i, _)| i)
        {
            let evicted = entries.remove(lru_idx);
            log::debug!(
                "evicting pooled process {} (pid {}, used {} times)",
                evicted.id,
                evicted.pid,
                evicted.usage_count
            );
            kill_entry(evicted);
        }
    }

    /// Mark a borrowed process idle again and stamp its last-used time
    pub async fn release(&self, handle: &PoolHandle) {
        let mut pools = self.pools.lock().await;
        if let Some(entries) = pools.get_mut(&handle.interpreter) {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == handle.id) {
                entry.in_use = false;
                entry.last_used_at = Instant::now();
                entry.usage_count += 1;
            }
        }
    }

    /// Kill and remove a borrowed process that is provably broken
    pub async fn discard(&self, handle: &PoolHandle) {
        let mut pools = self.pools.lock().await;
        if let Some(entries) = pools.get_mut(&handle.interpreter) {
            if let Some(idx) = entries.iter().position(|e| e.id == handle.id) {
                kill_entry(entries.remove(idx));
            }
        }
    }

    /// Kill every pooled process across all interpreter keys
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reaper.abort();
        }
        let mut pools = self.pools.lock().await;
        for (_, entries) in pools.drain() {
            for entry in entries {
                kill_entry(entry);
            }
        }
    }

    /// Idle entry count for an interpreter (observability and tests)
    pub async fn idle_count(&self, interpreter: &str) -> usize {
        self.pools
            .lock()
            .await
            .get(interpreter)
            .map(|v| v.iter().filter(|e| !e.in_use).count())
            .unwrap_or(0)
    }

    async fn spawn_warm(&self, spec: &WarmSpec) -> SandboxResult<PooledProcess> {
        let mut cmd = Command::new(&spec.interpreter);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        platform::configure_detached(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::pool_error(format!("failed to spawn warm {}: {}", spec.interpreter, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::pool_error("warm process has no pid"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::pool_error("failed to capture warm stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::pool_error("failed to capture warm stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::pool_error("failed to capture warm stderr"))?;

        let mut stdout_lines = BufReader::new(stdout).lines();

        // The first output line is the readiness signal
        let ready = timeout(self.config.ready_timeout, stdout_lines.next_line())
            .await
            .map_err(|_| {
                let _ = platform::terminate_tree(pid);
                SandboxError::pool_error(format!("warm {} did not signal readiness", spec.interpreter))
            })?
            .map_err(|e| SandboxError::pool_error(format!("warm readiness read failed: {}", e)))?;
        if ready.is_none() {
            let _ = platform::terminate_tree(pid);
            return Err(SandboxError::pool_error(format!(
                "warm {} exited before signalling readiness",
                spec.interpreter
            )));
        }

        let now = Instant::now();
        Ok(PooledProcess {
            id: Uuid::new_v4(),
            pid,
            profile_hash: spec.profile_hash.clone(),
            created_at: now,
            last_used_at: now,
            in_use: false,
            usage_count: 0,
            child: Arc::new(Mutex::new(child)),
            stdin: Arc::new(Mutex::new(stdin)),
            stdout: Arc::new(Mutex::new(stdout_lines)),
            stderr: Arc::new(Mutex::new(BufReader::new(stderr).lines())),
        })
    }

    fn start_reaper(self: &Arc<Self>) {
        let pools = Arc::clone(&self.pools);
        let max_idle = self.config.max_idle;
        let interval = self.config.reap_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut pools_guard = pools.lock().await;
                for (interpreter, entries) in pools_guard.iter_mut() {
                    let mut kept = Vec::with_capacity(entries.len());
                    for entry in entries.drain(..) {
                        // In-use entries are never reaped regardless of age
                        if entry.in_use || now.duration_since(entry.last_used_at) <= max_idle {
                            kept.push(entry);
                        } else {
                            log::debug!(
                                "reaping idle pooled {} process {} (alive {:?})",
                                interpreter,
                                entry.pid,
                                now.duration_since(entry.created_at)
                            );
                            kill_entry(entry);
                        }
                    }
                    *entries = kept;
                }
            }
        });
        *self.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }
}
