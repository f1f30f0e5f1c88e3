// Resource Limit Manager & Monitor
//
// Per-script limit configuration (overlay over defaults, capped by a global
// ceiling) plus a live monitor that samples a running process's CPU and
// memory on a fixed interval and reports violations as events. Sampling
// failures are logged and skipped; the loop never takes down the executor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::types::*;

/// Samples retained per monitored script (ring buffer)
const MAX_SAMPLES: usize = 300;

/// Manager configuration
#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Applied when a script has no override for a field
    pub defaults: ResourceLimits,
    /// Caps every field regardless of what a script requests
    pub ceiling: ResourceLimits,
    pub sample_interval: Duration,
    /// Terminate the monitored process tree on the first violation
    pub kill_on_violation: bool,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            defaults: ResourceLimits {
                max_memory_mb: Some(512),
                max_cpu_percent: Some(80),
                max_duration_secs: Some(60),
                max_file_size_bytes: Some(10 * 1024 * 1024),
                max_open_files: Some(64),
                max_threads: Some(8),
            },
            ceiling: ResourceLimits {
                max_memory_mb: Some(4096),
                max_cpu_percent: Some(100),
                max_duration_secs: Some(3600),
                max_file_size_bytes: Some(1024 * 1024 * 1024),
                max_open_files: Some(1024),
                max_threads: Some(64),
            },
            sample_interval: Duration::from_secs(1),
            kill_on_violation: false,
        }
    }
}

struct MonitorState {
    pid: u32,
    samples: VecDeque<ResourceSample>,
    violations: Vec<ResourceViolation>,
    started_at: Instant,
    /// Whether the most recent sample breached any limit
    exceeding: bool,
    task: Option<JoinHandle<()>>,
}

/// Tracks limits per script and monitors running processes against them
pub struct ResourceLimitManager {
    config: LimitConfig,
    overrides: Arc<RwLock<HashMap<ScriptId, ResourceLimits>>>,
    monitors: Arc<RwLock<HashMap<ScriptId, MonitorState>>>,
    system: Arc<RwLock<System>>,
    violation_tx: broadcast::Sender<ResourceViolation>,
}

impl ResourceLimitManager {
    pub fn new(config: LimitConfig) -> Self {
        let (violation_tx, _) = broadcast::channel(256);
        Self {
            config,
            overrides: Arc::new(RwLock::new(HashMap::new())),
            monitors: Arc::new(RwLock::new(HashMap::new())),
            system: Arc::new(RwLock::new(System::new())),
            violation_tx,
        }
    }

    /// Subscribe to violation events across all monitored scripts
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceViolation> {
        self.violation_tx.subscribe()
    }

    /// Record per-script limit overrides; unset fields keep the defaults
    pub async fn set_limits(&self, script_id: &str, limits: ResourceLimits) {
        self.overrides.write().await.insert(script_id.to_string(), limits);
    }

    /// Effective limits: overrides overlaid on defaults, every field clamped
    /// by the global ceiling.
    pub async fn get_limits(&self, script_id: &str) -> ResourceLimits {
        let overrides = self.overrides.read().await;
        let requested = overrides.get(script_id).copied().unwrap_or_default();
        let defaults = self.config.defaults;
        let ceiling = self.config.ceiling;

        ResourceLimits {
            max_memory_mb: clamp(requested.max_memory_mb, defaults.max_memory_mb, ceiling.max_memory_mb),
            max_cpu_percent: clamp(
                requested.max_cpu_percent,
                defaults.max_cpu_percent,
                ceiling.max_cpu_percent,
            ),
            max_duration_secs: clamp(
                requested.max_duration_secs,
                defaults.max_duration_secs,
                ceiling.max_duration_secs,
            ),
            max_file_size_bytes: clamp(
                requested.max_file_size_bytes,
                defaults.max_file_size_bytes,
                ceiling.max_file_size_bytes,
            ),
            max_open_files: clamp(requested.max_open_files, defaults.max_open_files, ceiling.max_open_files),
            max_threads: clamp(requested.max_threads, defaults.max_threads, ceiling.max_threads),
        }
    }

    /// Begin periodic sampling of `pid` for `script_id`. Replaces any
    /// previous monitor for the same script.
    pub async fn start_monitoring(&self, script_id: &str, pid: u32) {
        self.stop_monitoring(script_id).await;

        let limits = self.get_limits(script_id).await;
        let started_at = Instant::now();
        let script = script_id.to_string();
        let monitors = Arc::clone(&self.monitors);
        let system = Arc::clone(&self.system);
        let tx = self.violation_tx.clone();
        let interval = self.config.sample_interval;
        let kill_on_violation = self.config.kill_on_violation;

        // State must be registered before the first tick fires
        self.monitors.write().await.insert(
            script.clone(),
            MonitorState {
                pid,
                samples: VecDeque::new(),
                violations: Vec::new(),
                started_at,
                exceeding: false,
                task: None,
            },
        );

        let task = {
            let script = script.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;

                    let sample = {
                        let mut sys = system.write().await;
                        sample_process(&mut sys, pid)
                    };
                    let Some(sample) = sample else {
                        // Process gone or stats unreadable; degrade gracefully
                        log::debug!("skipping resource sample for {script}: pid {pid} not readable");
                        continue;
                    };

                    let elapsed = started_at.elapsed();
                    let breaches = check_sample(&limits, &sample, elapsed);

                    let mut monitors_guard = monitors.write().await;
                    let Some(state) = monitors_guard.get_mut(&script) else {
                        break;
                    };
                    if state.samples.len() == MAX_SAMPLES {
                        state.samples.pop_front();
                    }
                    state.samples.push_back(sample);
                    state.exceeding = !breaches.is_empty();

                    for (resource, limit, observed) in breaches {
                        let violation = ResourceViolation {
                            script_id: script.clone(),
                            resource,
                            limit,
                            observed,
                            timestamp_ms: sample.timestamp_ms,
                        };
                        state.violations.push(violation.clone());
                        let _ = tx.send(violation);
                        if kill_on_violation {
                            if let Err(e) = crate::platform::terminate_tree(pid) {
                                log::warn!("failed to kill {pid} on resource violation: {e}");
                            }
                        }
                    }
                }
            })
        };

        if let Some(state) = self.monitors.write().await.get_mut(&script) {
            state.task = Some(task);
        } else {
            // Entry was released while we were spawning; don't leak the task
            task.abort();
        }
    }

    /// Whether the most recent sample breached any limit
    pub async fn is_exceeding(&self, script_id: &str) -> bool {
        self.monitors
            .read()
            .await
            .get(script_id)
            .map(|s| s.exceeding)
            .unwrap_or(false)
    }

    /// Violations recorded so far for a monitored script
    pub async fn violations(&self, script_id: &str) -> Vec<ResourceViolation> {
        self.monitors
            .read()
            .await
            .get(script_id)
            .map(|s| s.violations.clone())
            .unwrap_or_default()
    }

    /// Stop sampling. History is retained until `release` is called.
    pub async fn stop_monitoring(&self, script_id: &str) {
        if let Some(state) = self.monitors.write().await.get_mut(script_id) {
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
    }

    /// Aggregate statistics folded from the sample history
    pub async fn get_stats(&self, script_id: &str) -> Option<ResourceStats> {
        let monitors = self.monitors.read().await;
        let state = monitors.get(script_id)?;
        let count = state.samples.len();
        if count == 0 {
            return Some(ResourceStats {
                duration_secs: state.started_at.elapsed().as_secs_f64(),
                violation_count: state.violations.len(),
                ..Default::default()
            });
        }

        let mut memory_sum = 0u64;
        let mut cpu_sum = 0f64;
        let mut peak_memory = 0u64;
        let mut peak_cpu = 0f32;
        for sample in &state.samples {
            memory_sum += sample.memory_mb;
            cpu_sum += sample.cpu_percent as f64;
            peak_memory = peak_memory.max(sample.memory_mb);
            peak_cpu = peak_cpu.max(sample.cpu_percent);
        }

        Some(ResourceStats {
            average_memory_mb: memory_sum as f64 / count as f64,
            average_cpu_percent: cpu_sum / count as f64,
            peak_memory_mb: peak_memory,
            peak_cpu_percent: peak_cpu,
            duration_secs: state.started_at.elapsed().as_secs_f64(),
            violation_count: state.violations.len(),
        })
    }

    /// Drop a script's monitor state entirely
    pub async fn release(&self, script_id: &str) {
        if let Some(mut state) = self.monitors.write().await.remove(script_id) {
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
    }

    /// Pid currently monitored for a script, if any
    pub async fn monitored_pid(&self, script_id: &str) -> Option<u32> {
        self.monitors.read().await.get(script_id).map(|s| s.pid)
    }
}

impl Default for ResourceLimitManager {
    fn default() -> Self {
        Self::new(LimitConfig::default())
    }
}

fn clamp<T: Ord + Copy>(requested: Option<T>, default: Option<T>, ceiling: Option<T>) -> Option<T> {
    let value = requested.or(default)?;
    Some(match ceiling {
        Some(cap) => value.min(cap),
        None => value,
    })
}

/// One CPU/memory sample for a pid. Returns `None` when the process has
/// exited or its stats are unreadable.
fn sample_process(system: &mut System, pid: u32) -> Option<ResourceSample> {
    let pid = Pid::from_u32(pid);
    system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_cpu().with_memory());
    let process = system.process(pid)?;
    Some(ResourceSample {
        cpu_percent: process.cpu_usage(),
        memory_mb: process.memory() / 1024 / 1024,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    })
}

/// Check one sample against the effective limits. Returns one breach tuple
/// per exceeded resource: (kind, limit, observed).
fn check_sample(
    limits: &ResourceLimits,
    sample: &ResourceSample,
    elapsed: Duration,
) -> Vec<(ResourceKind, f64, f64)> {
    let mut breaches = Vec::new();
    if let Some(max_memory) = limits.max_memory_mb {
        if sample.memory_mb > max_memory {
            breaches.push((ResourceKind::Memory, max_memory as f64, sample.memory_mb as f64));
        }
    }
    if let Some(max_cpu) = limits.max_cpu_percent {
        if sample.cpu_percent > max_cpu as f32 {
            breaches.push((ResourceKind::Cpu, max_cpu as f64, sample.cpu_percent as f64));
        }
    }
    if let Some(max_duration) = limits.max_duration_secs {
        if elapsed.as_secs_f64() > max_duration as f64 {
            breaches.push((ResourceKind::Duration, max_duration as f64, elapsed.as_secs_f64()));
        }
    }
    breaches
}
