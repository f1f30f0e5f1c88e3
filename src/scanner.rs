// Security Scanner
//
// Pattern-based static analysis of script source. The scan never executes or
// evaluates the scanned text, and it is best-effort by design: dynamic code
// paths can evade static patterns, so the scanner is a fast filter in front
// of the execution sandbox, not a proof system. No AST-level fallback exists.

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::permissions::check_capability;
use crate::types::*;

/// Fixed system ceilings that manifest resource requests are checked against
#[derive(Debug, Clone, Copy)]
pub struct SystemCeilings {
    pub max_memory_mb: u64,
    pub max_cpu_percent: u32,
    pub max_duration_secs: u64,
}

impl Default for SystemCeilings {
    fn default() -> Self {
        Self {
            max_memory_mb: 4096,
            max_cpu_percent: 100,
            max_duration_secs: 3600,
        }
    }
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Escalate imports that are not explicitly allowed from finding to error
    pub strict_imports: bool,
    /// Source files larger than this are rejected before scanning
    pub max_source_bytes: usize,
    /// Imports rejected outright regardless of granted capabilities
    pub blocked_imports: Vec<String>,
    pub ceilings: SystemCeilings,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            strict_imports: false,
            max_source_bytes: 1024 * 1024,
            blocked_imports: vec![
                "subprocess".to_string(),
                "ctypes".to_string(),
                "multiprocessing".to_string(),
            ],
            ceilings: SystemCeilings::default(),
        }
    }
}

/// One entry of the pattern table: kind, compiled matcher, severity and the
/// PermissionSet field that would permit the operation. New patterns are
/// data, not code.
struct ScanPattern {
    kind: OperationKind,
    regex: Regex,
    severity: Severity,
    suggested_capability: Option<&'static str>,
    /// Hard violations block execution regardless of granted capabilities
    blocking: bool,
}

/// Warnings-only heuristics: likely vulnerabilities that never block on
/// their own.
struct HeuristicPattern {
    kind: OperationKind,
    regex: Regex,
    severity: Severity,
}

pub struct SecurityScanner {
    config: ScannerConfig,
    patterns: Vec<ScanPattern>,
    heuristics: Vec<HeuristicPattern>,
    import_re: Regex,
    open_re: Regex,
    url_re: Regex,
}

impl SecurityScanner {
    pub fn new(config: ScannerConfig) -> Self {
        let patterns = vec![
            // Dynamic import constructs defeat the import allow-list
            ScanPattern {
                kind: OperationKind::UnsafeImport,
                regex: Regex::new(r"__import__\s*\(|importlib\.import_module\s*\(").unwrap(),
                severity: Severity::High,
                suggested_capability: None,
                blocking: true,
            },
            // eval-like constructs are never negotiable
            ScanPattern {
                kind: OperationKind::Eval,
                regex: Regex::new(r"\beval\s*\(|\bexec\s*\(|\bcompile\s*\(").unwrap(),
                severity: Severity::High,
                suggested_capability: None,
                blocking: true,
            },
            // Subprocess spawning and shell execution
            ScanPattern {
                kind: OperationKind::Subprocess,
                regex: Regex::new(r"subprocess\.\w+\s*\(|os\.popen\s*\(|os\.spawn\w*\s*\(|os\.fork\s*\(")
                    .unwrap(),
                severity: Severity::High,
                suggested_capability: None,
                blocking: true,
            },
            ScanPattern {
                kind: OperationKind::SystemCall,
                regex: Regex::new(r"os\.system\s*\(|os\.exec\w*\s*\(").unwrap(),
                severity: Severity::High,
                suggested_capability: None,
                blocking: true,
            },
            // Raw socket use maps onto network capabilities
            ScanPattern {
                kind: OperationKind::Network,
                regex: Regex::new(r"socket\.socket\s*\(|urllib\.request|requests\.\w+\s*\(").unwrap(),
                severity: Severity::Medium,
                suggested_capability: Some("network.allowed_hosts"),
                blocking: false,
            },
        ];

        let heuristics = vec![
            // String concatenation flowing into file/SQL/subprocess calls
            HeuristicPattern {
                kind: OperationKind::FileWrite,
                regex: Regex::new(r"open\s*\([^)]*\+[^)]*\)").unwrap(),
                severity: Severity::Medium,
            },
            HeuristicPattern {
                kind: OperationKind::SystemCall,
                regex: Regex::new(r#"execute\s*\([^)]*(?:%|\+|format\s*\()"#).unwrap(),
                severity: Severity::Medium,
            },
            // Insecure deserialization
            HeuristicPattern {
                kind: OperationKind::Eval,
                regex: Regex::new(r"pickle\.loads?\s*\(|marshal\.loads?\s*\(|yaml\.load\s*\(").unwrap(),
                severity: Severity::Medium,
            },
            // Weak randomness in security-sensitive assignments
            HeuristicPattern {
                kind: OperationKind::SystemCall,
                regex: Regex::new(r"(?i)(?:token|secret|password|key)\s*=\s*.*\brandom\.").unwrap(),
                severity: Severity::Low,
            },
            // Hardcoded-credential-shaped literals
            HeuristicPattern {
                kind: OperationKind::SystemCall,
                regex: Regex::new(r#"(?i)(?:password|secret|api_key|apikey|token)\s*=\s*["'][^"']{8,}["']"#)
                    .unwrap(),
                severity: Severity::Medium,
            },
        ];

        Self {
            config,
            patterns,
            heuristics,
            import_re: Regex::new(r"(?m)^\s*(?:import\s+([A-Za-z_][\w\.]*)|from\s+([A-Za-z_][\w\.]*)\s+import)")
                .unwrap(),
            open_re: Regex::new(r#"open\s*\(\s*["']([^"']+)["']\s*(?:,\s*["']([^"']+)["'])?"#).unwrap(),
            url_re: Regex::new(r"https?://([A-Za-z0-9\.\-]+)").unwrap(),
        }
    }

    /// Pre-flight a script. Hard violations produce errors (`is_valid =
    /// false`) and must block execution; soft findings land in
    /// `dangerous_operations` and drive the permission-request workflow.
    pub fn scan(
        &self,
        source: &str,
        manifest: &ManifestSecurity,
        effective: &PermissionSet,
    ) -> ValidationResult {
        let mut errors = Vec::new();
        let mut operations = Vec::new();

        // Size gate comes first so oversized input is never pattern-matched
        if source.len() > self.config.max_source_bytes {
            errors.push(ValidationError {
                field: "source".to_string(),
                message: format!(
                    "script is {} bytes, maximum allowed is {}",
                    source.len(),
                    self.config.max_source_bytes
                ),
            });
            return ValidationResult::new(errors, operations);
        }

        if let Some(declared) = &manifest.content_hash {
            let actual = hex::encode(Sha256::digest(source.as_bytes()));
            if !declared.eq_ignore_ascii_case(&actual) {
                errors.push(ValidationError {
                    field: "content_hash".to_string(),
                    message: "declared content hash does not match script source".to_string(),
                });
            }
        }

        self.scan_imports(source, effective, &mut errors, &mut operations);
        self.scan_patterns(source, &mut errors, &mut operations);
        self.scan_file_operations(source, effective, &mut operations);
        self.scan_urls(source, effective, &mut operations);
        self.scan_heuristics(source, &mut operations);
        self.check_resource_requests(manifest, &mut errors);

        ValidationResult::new(errors, operations)
    }

    fn scan_imports(
        &self,
        source: &str,
        effective: &PermissionSet,
        errors: &mut Vec<ValidationError>,
        operations: &mut Vec<DangerousOperation>,
    ) {
        for caps in self.import_re.captures_iter(source) {
            let group = caps.get(1).or_else(|| caps.get(2));
            let Some(module_match) = group else { continue };
            // Exact match on the module root: "os.path" counts as "os"
            let module = module_match.as_str().split('.').next().unwrap_or("").to_string();
            let line = line_of(source, module_match.start());

            if self.config.blocked_imports.iter().any(|b| b == &module) {
                errors.push(ValidationError {
                    field: "allowed_imports".to_string(),
                    message: format!("import of blocked module '{}' at line {}", module, line),
                });
                operations.push(DangerousOperation {
                    kind: OperationKind::UnsafeImport,
                    line_number: line,
                    matched_text: module.clone(),
                    severity: Severity::High,
                    suggested_capability: None,
                });
                continue;
            }

            if check_capability(effective, &Capability::Import(module.clone())) {
                continue;
            }

            if self.config.strict_imports {
                errors.push(ValidationError {
                    field: "allowed_imports".to_string(),
                    message: format!("import of module '{}' at line {} is not explicitly allowed", module, line),
                });
            }
            operations.push(DangerousOperation {
                kind: OperationKind::UnsafeImport,
                line_number: line,
                matched_text: module,
                severity: Severity::Medium,
                suggested_capability: Some("allowed_imports".to_string()),
            });
        }
    }

    fn scan_patterns(
        &self,
        source: &str,
        errors: &mut Vec<ValidationError>,
        operations: &mut Vec<DangerousOperation>,
    ) {
        for pattern in &self.patterns {
            for m in pattern.regex.find_iter(source) {
                let line = line_of(source, m.start());
                if pattern.blocking {
                    errors.push(ValidationError {
                        field: "source".to_string(),
                        message: format!(
                            "disallowed construct '{}' at line {}",
                            m.as_str().trim(),
                            line
                        ),
                    });
                }
                operations.push(DangerousOperation {
                    kind: pattern.kind,
                    line_number: line,
                    matched_text: m.as_str().trim().to_string(),
                    severity: pattern.severity,
                    suggested_capability: pattern.suggested_capability.map(str::to_string),
                });
            }
        }
    }

    fn scan_file_operations(
        &self,
        source: &str,
        effective: &PermissionSet,
        operations: &mut Vec<DangerousOperation>,
    ) {
        for caps in self.open_re.captures_iter(source) {
            let Some(path_match) = caps.get(1) else { continue };
            let path = std::path::PathBuf::from(path_match.as_str());
            let mode = caps.get(2).map(|m| m.as_str()).unwrap_or("r");
            let writing = mode.contains('w') || mode.contains('a') || mode.contains('+');
            let line = line_of(source, path_match.start());

            let (kind, capability, suggestion) = if writing {
                (
                    OperationKind::FileWrite,
                    Capability::FileWrite(path.clone()),
                    "file_system.write",
                )
            } else {
                (
                    OperationKind::FileRead,
                    Capability::FileRead(path.clone()),
                    "file_system.read",
                )
            };

            let granted = check_capability(effective, &capability);
            operations.push(DangerousOperation {
                kind,
                line_number: line,
                matched_text: path_match.as_str().to_string(),
                severity: if granted {
                    Severity::Low
                } else if writing {
                    Severity::High
                } else {
                    Severity::Medium
                },
                suggested_capability: if granted { None } else { Some(suggestion.to_string()) },
            });
        }
    }

    fn scan_urls(
        &self,
        source: &str,
        effective: &PermissionSet,
        operations: &mut Vec<DangerousOperation>,
    ) {
        for caps in self.url_re.captures_iter(source) {
            let Some(host_match) = caps.get(1) else { continue };
            let host = host_match.as_str().to_string();
            let granted = check_capability(effective, &Capability::Host(host.clone()));
            operations.push(DangerousOperation {
                kind: OperationKind::Network,
                line_number: line_of(source, host_match.start()),
                matched_text: host,
                severity: if granted { Severity::Low } else { Severity::Medium },
                suggested_capability: if granted {
                    None
                } else {
                    Some("network.allowed_hosts".to_string())
                },
            });
        }
    }

    fn scan_heuristics(&self, source: &str, operations: &mut Vec<DangerousOperation>) {
        for heuristic in &self.heuristics {
            for m in heuristic.regex.find_iter(source) {
                operations.push(DangerousOperation {
                    kind: heuristic.kind,
                    line_number: line_of(source, m.start()),
                    matched_text: m.as_str().trim().to_string(),
                    severity: heuristic.severity,
                    suggested_capability: None,
                });
            }
        }
    }

    /// Manifest resource requests are validated against the fixed system
    /// ceilings independently of source scanning.
    fn check_resource_requests(&self, manifest: &ManifestSecurity, errors: &mut Vec<ValidationError>) {
        let Some(limits) = &manifest.resource_limits else {
            return;
        };
        let ceilings = self.config.ceilings;
        if let Some(memory) = limits.memory {
            if memory > ceilings.max_memory_mb {
                errors.push(ValidationError {
                    field: "resource_limits.memory".to_string(),
                    message: format!(
                        "requested {} MB exceeds system ceiling of {} MB",
                        memory, ceilings.max_memory_mb
                    ),
                });
            }
        }
        if let Some(cpu) = limits.cpu {
            if cpu > ceilings.max_cpu_percent {
                errors.push(ValidationError {
                    field: "resource_limits.cpu".to_string(),
                    message: format!(
                        "requested {}% CPU exceeds system ceiling of {}%",
                        cpu, ceilings.max_cpu_percent
                    ),
                });
            }
        }
        if let Some(duration) = limits.duration {
            if duration > ceilings.max_duration_secs {
                errors.push(ValidationError {
                    field: "resource_limits.duration".to_string(),
                    message: format!(
                        "requested {}s exceeds system ceiling of {}s",
                        duration, ceilings.max_duration_secs
                    ),
                });
            }
        }
    }
}

impl Default for SecurityScanner {
    fn default() -> Self {
        Self::new(ScannerConfig::default())
    }
}

/// 1-based line number of a byte offset, by counting preceding newlines
fn line_of(source: &str, offset: usize) -> usize {
    source.as_bytes()[..offset].iter().filter(|&&b| b == b'\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn scan_source(source: &str) -> ValidationResult {
        let scanner = SecurityScanner::default();
        scanner.scan(source, &ManifestSecurity::default(), &PermissionSet::default())
    }

    #[test]
    fn blocked_import_is_hard_error_with_line_number() {
        let source = "x = 1\nimport subprocess\nprint(x)\n";
        let result = scan_source(source);

        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("subprocess"));
        assert!(result.errors[0].message.contains("line 2"));

        let finding = result
            .dangerous_operations
            .iter()
            .find(|op| op.kind == OperationKind::UnsafeImport)
            .unwrap();
        assert_eq!(finding.line_number, 2);
        assert_eq!(finding.severity, Severity::High);
    }

    #[test]
    fn eval_construct_always_blocks() {
        let result = scan_source("data = input()\nresult = eval(data)\n");
        assert!(!result.is_valid);
        let finding = result
            .dangerous_operations
            .iter()
            .find(|op| op.kind == OperationKind::Eval)
            .unwrap();
        assert_eq!(finding.line_number, 2);
    }

    #[test]
    fn os_system_blocks_even_with_subprocess_permission() {
        let mut effective = PermissionSet::default();
        effective.system_calls.allow_subprocesses = true;

        let scanner = SecurityScanner::default();
        let result = scanner.scan("os.system('rm -rf /')\n", &ManifestSecurity::default(), &effective);
        assert!(!result.is_valid);
    }

    #[test]
    fn dynamic_import_is_hard_error() {
        let result = scan_source("mod = __import__('os')\n");
        assert!(!result.is_valid);
    }

    #[test]
    fn granted_import_produces_no_finding() {
        let mut effective = PermissionSet::default();
        effective.allowed_imports.insert("json".to_string());

        let scanner = SecurityScanner::default();
        let result = scanner.scan(
            "import json\nprint(json.dumps({}))\n",
            &ManifestSecurity::default(),
            &effective,
        );
        assert!(result.is_valid);
        assert!(
            !result
                .dangerous_operations
                .iter()
                .any(|op| op.kind == OperationKind::UnsafeImport)
        );
    }

    #[test]
    fn ungranted_import_is_finding_not_error() {
        let result = scan_source("import json\n");
        assert!(result.is_valid);
        let finding = result
            .dangerous_operations
            .iter()
            .find(|op| op.matched_text == "json")
            .unwrap();
        assert_eq!(finding.suggested_capability.as_deref(), Some("allowed_imports"));
    }

    #[test]
    fn strict_mode_escalates_unallowed_import() {
        let scanner = SecurityScanner::new(ScannerConfig {
            strict_imports: true,
            ..Default::default()
        });
        let result = scanner.scan("import json\n", &ManifestSecurity::default(), &PermissionSet::default());
        assert!(!result.is_valid);
    }

    #[test]
    fn file_write_extracts_path_and_suggests_capability() {
        let result = scan_source("f = open(\"/tmp/out.txt\", \"w\")\n");
        assert!(result.is_valid);
        let finding = result
            .dangerous_operations
            .iter()
            .find(|op| op.kind == OperationKind::FileWrite)
            .unwrap();
        assert_eq!(finding.matched_text, "/tmp/out.txt");
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.suggested_capability.as_deref(), Some("file_system.write"));
    }

    #[test]
    fn granted_file_read_is_low_severity() {
        let mut effective = PermissionSet::default();
        effective.file_system.read.insert("/data".into());

        let scanner = SecurityScanner::default();
        let result = scanner.scan(
            "f = open(\"/data/input.csv\")\n",
            &ManifestSecurity::default(),
            &effective,
        );
        let finding = result
            .dangerous_operations
            .iter()
            .find(|op| op.kind == OperationKind::FileRead)
            .unwrap();
        assert_eq!(finding.severity, Severity::Low);
        assert!(finding.suggested_capability.is_none());
    }

    #[test]
    fn url_host_extraction() {
        let result = scan_source("u = \"https://api.example.com/v1/data\"\n");
        let finding = result
            .dangerous_operations
            .iter()
            .find(|op| op.kind == OperationKind::Network)
            .unwrap();
        assert_eq!(finding.matched_text, "api.example.com");
        assert_eq!(finding.suggested_capability.as_deref(), Some("network.allowed_hosts"));
    }

    #[test]
    fn heuristics_warn_but_never_block() {
        let source = "import_data = pickle.loads(blob)\npassword = \"hunter2hunter2\"\n";
        let result = scan_source(source);
        assert!(result.is_valid);
        assert!(result.dangerous_operations.len() >= 2);
    }

    #[test]
    fn oversized_source_rejected_before_scanning() {
        let scanner = SecurityScanner::new(ScannerConfig {
            max_source_bytes: 16,
            ..Default::default()
        });
        let result = scanner.scan(
            "print('this source is too large to scan')",
            &ManifestSecurity::default(),
            &PermissionSet::default(),
        );
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].field, "source");
        // Nothing else ran
        assert!(result.dangerous_operations.is_empty());
    }

    #[test]
    fn content_hash_mismatch_is_hard_error() {
        let manifest = ManifestSecurity {
            content_hash: Some("deadbeef".to_string()),
            ..Default::default()
        };
        let scanner = SecurityScanner::default();
        let result = scanner.scan("print(1)\n", &manifest, &PermissionSet::default());
        assert!(!result.is_valid);
        assert_eq!(result.errors[0].field, "content_hash");
    }

    #[test]
    fn content_hash_match_passes() {
        let source = "print(1)\n";
        let manifest = ManifestSecurity {
            content_hash: Some(hex::encode(Sha256::digest(source.as_bytes()))),
            ..Default::default()
        };
        let scanner = SecurityScanner::default();
        let result = scanner.scan(source, &manifest, &PermissionSet::default());
        assert!(result.is_valid);
    }

    #[test]
    fn resource_requests_checked_against_ceilings() {
        let manifest = ManifestSecurity {
            resource_limits: Some(ManifestResourceLimits {
                memory: Some(999_999),
                cpu: Some(250),
                duration: Some(60),
            }),
            ..Default::default()
        };
        let scanner = SecurityScanner::default();
        let result = scanner.scan("print(1)\n", &manifest, &PermissionSet::default());
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().any(|e| e.field == "resource_limits.memory"));
        assert!(result.errors.iter().any(|e| e.field == "resource_limits.cpu"));
    }
}
