//! Static hard-deny checks run before any container exists.
//!
//! Preflight looks only at the manifest and the normalized source text. A
//! match is final: there is no warn-and-continue mode and no grant can
//! override it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::PreflightViolation;
use crate::manifest::{ProviderKind, SkillEntry};

/// A named forbidden pattern.
#[derive(Debug, Clone)]
pub struct PreflightRule {
    pub name: String,
    pattern: Regex,
    /// Skipped for skills that declare network access.
    waived_by_network: bool,
}

impl PreflightRule {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            waived_by_network: false,
        })
    }

    fn is_match(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

static DEFAULT_RULES: LazyLock<Vec<PreflightRule>> = LazyLock::new(|| {
    let rule = |name: &str, pattern: &str, waived_by_network: bool| PreflightRule {
        name: name.to_string(),
        pattern: Regex::new(pattern).expect("builtin preflight pattern is valid"),
        waived_by_network,
    };
    vec![
        rule(
            "process-spawn",
            r"\bsubprocess\b|\bos\.(?:system|popen|fork|exec\w*|spawn\w*)\s*\(|\bchild_process\b|std::process::Command|\bpty\.spawn\b",
            false,
        ),
        rule(
            "dynamic-eval",
            r"\beval\s*\(|\bexec\s*\(|\b__import__\s*\(|\bimportlib\b|\bnew\s+Function\s*\(",
            false,
        ),
        rule(
            "native-syscall",
            r"\bctypes\b|\bcffi\b|\bsyscall\s*\(|\bptrace\b|\bprocess\.binding\b",
            false,
        ),
        rule(
            "privilege",
            r"\bset[ug]id\s*\(|\bchroot\s*\(|/proc/self/|docker\.sock",
            false,
        ),
        rule(
            "raw-socket",
            r#"^\s*import\s+socket\b|^\s*from\s+socket\s+import\b|\bsocket\.socket\s*\(|require\(\s*['"](?:net|dgram)['"]\s*\)|std::net::"#,
            true,
        ),
    ]
});

/// Host-side maxima a manifest may not exceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLimits {
    pub allow_network: bool,
    pub max_memory_mb: u32,
    pub max_cpu_millis: u32,
    pub max_wall_clock_ms: u64,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            allow_network: false,
            max_memory_mb: 1024,
            max_cpu_millis: 2000,
            max_wall_clock_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Preflight {
    rules: Vec<PreflightRule>,
    host: HostLimits,
}

impl Default for Preflight {
    fn default() -> Self {
        Self::new(HostLimits::default())
    }
}

impl Preflight {
    /// Default rule set under the given host maxima.
    pub fn new(host: HostLimits) -> Self {
        Self {
            rules: DEFAULT_RULES.clone(),
            host,
        }
    }

    /// Add a deployment-specific forbidden pattern.
    pub fn with_rule(mut self, rule: PreflightRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.name.as_str())
    }

    /// Deterministic: the first violation in (manifest, source order, line,
    /// rule order) is returned.
    pub fn check(&self, skill: &SkillEntry) -> Result<(), PreflightViolation> {
        let manifest = &skill.manifest;
        let isolation = &manifest.isolation;

        if manifest.declares(ProviderKind::Plugin) {
            let manifest_violation = |rule: &str, field: &str| PreflightViolation {
                rule: rule.to_string(),
                path: field.to_string(),
                line: 0,
            };
            if isolation.network && !self.host.allow_network {
                return Err(manifest_violation("network-not-allowed", "isolation.network"));
            }
            let limits = &isolation.limits;
            if limits.memory_mb > self.host.max_memory_mb {
                return Err(manifest_violation("limits-exceed-host", "isolation.limits.memory_mb"));
            }
            if limits.cpu_millis > self.host.max_cpu_millis {
                return Err(manifest_violation("limits-exceed-host", "isolation.limits.cpu_millis"));
            }
            if limits.wall_clock_ms > self.host.max_wall_clock_ms {
                return Err(manifest_violation(
                    "limits-exceed-host",
                    "isolation.limits.wall_clock_ms",
                ));
            }
        }

        for source in &skill.sources {
            let text = String::from_utf8_lossy(&source.content);
            for (idx, line) in text.lines().enumerate() {
                let hit = self
                    .rules
                    .iter()
                    .filter(|r| !(r.waived_by_network && isolation.network))
                    .find(|r| r.is_match(line));
                if let Some(rule) = hit {
                    return Err(PreflightViolation {
                        rule: rule.name.clone(),
                        path: source.path.clone(),
                        line: idx + 1,
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{RawManifest, SourceBlob};
    use skillgate_state::SecurityHash;

    fn skill(source: &str, network: bool) -> SkillEntry {
        let text = format!(
            r#"
            id = "probe"
            version = "1"
            providers = ["plugin:probe"]
            input_schema = "skillgate.any"
            output_schema = "skillgate.any"
            [isolation]
            network = {network}
            [plugin]
            image = "runner@sha256:{}"
            entrypoint = ["python3", "/skill/src/main.py"]
            "#,
            "a".repeat(64)
        );
        let manifest = RawManifest::parse(&text).unwrap().validate(vec![]).unwrap();
        SkillEntry {
            manifest,
            sources: vec![SourceBlob {
                path: "main.py".into(),
                content: source.as_bytes().to_vec(),
            }],
            security_hash: SecurityHash::from_bytes(b"probe"),
            dir: ".".into(),
        }
    }

    #[test]
    fn test_clean_source_passes() {
        let pf = Preflight::new(HostLimits {
            allow_network: true,
            ..HostLimits::default()
        });
        let src = "import json\nimport re\nprint(json.dumps({'n': len(re.compile('a').findall('aa'))}))\n";
        assert!(pf.check(&skill(src, false)).is_ok());
    }

    #[test]
    fn test_process_spawn_denied_with_line() {
        let src = "import json\nimport subprocess\n";
        let v = Preflight::default().check(&skill(src, false)).unwrap_err();
        assert_eq!(v.rule, "process-spawn");
        assert_eq!(v.path, "main.py");
        assert_eq!(v.line, 2);
    }

    #[test]
    fn test_raw_socket_waived_only_with_network() {
        let pf = Preflight::new(HostLimits {
            allow_network: true,
            ..HostLimits::default()
        });
        let src = "import socket\n";
        assert_eq!(pf.check(&skill(src, false)).unwrap_err().rule, "raw-socket");
        assert!(pf.check(&skill(src, true)).is_ok());
    }

    #[test]
    fn test_network_requires_host_permission() {
        let v = Preflight::default().check(&skill("print(1)\n", true)).unwrap_err();
        assert_eq!(v.rule, "network-not-allowed");
        assert_eq!(v.line, 0);
    }

    #[test]
    fn test_limits_above_host_maxima() {
        let mut s = skill("print(1)\n", false);
        s.manifest.isolation.limits.memory_mb = 4096;
        let v = Preflight::default().check(&s).unwrap_err();
        assert_eq!(v.rule, "limits-exceed-host");
    }

    #[test]
    fn test_extra_rule() {
        let pf = Preflight::default().with_rule(PreflightRule::new("no-pickle", r"\bpickle\b").unwrap());
        let v = pf.check(&skill("import pickle\n", false)).unwrap_err();
        assert_eq!(v.rule, "no-pickle");
    }
}
