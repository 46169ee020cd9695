use std::collections::BTreeSet;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;

use autopilot_core::api::{SafetyConfig, SafetyValidator, Validation, Violation};

/// Node modules that are refused regardless of configuration.
const JS_RESTRICTED: &[&str] = &["child_process", "cluster", "net", "dgram", "worker_threads"];
/// Ruby libraries that are refused regardless of configuration.
const RUBY_RESTRICTED: &[&str] = &["open3", "socket", "net/http", "pty"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Python,
    JavaScript,
    Ruby,
    Shell,
    Other,
}

impl Family {
    fn of(language: &str) -> Self {
        match language.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Family::Python,
            "javascript" | "js" | "node" | "typescript" | "ts" => Family::JavaScript,
            "ruby" | "rb" => Family::Ruby,
            "shell" | "bash" | "sh" | "zsh" => Family::Shell,
            _ => Family::Other,
        }
    }
}

/// Line-oriented screening of generated code before it reaches the sandbox.
///
/// Checks, in order: empty code, restricted imports, dangerous dynamic-evaluation calls,
/// destructive shell commands, then any extra `deny_patterns` from the config.
pub struct RuleSafetyValidator {
    restricted: BTreeSet<String>,
    deny: Vec<Regex>,
}

impl RuleSafetyValidator {
    pub fn new(cfg: &SafetyConfig) -> Result<Self> {
        let deny = cfg
            .deny_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid safety deny pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            restricted: cfg
                .restricted_modules
                .iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
            deny,
        })
    }

    fn is_restricted(&self, family: Family, module: &str) -> bool {
        let module = module.trim_start_matches("node:");
        let root = module.split(['.', '/']).next().unwrap_or(module);
        let builtin = match family {
            Family::JavaScript => JS_RESTRICTED.contains(&module),
            Family::Ruby => RUBY_RESTRICTED.contains(&module),
            _ => false,
        };
        builtin || self.restricted.contains(module) || self.restricted.contains(root)
    }

    fn check(&self, code: &str, language: &str) -> Vec<Violation> {
        if code.trim().is_empty() {
            return vec![Violation::new("empty_code", "code is empty")];
        }
        let family = Family::of(language);
        let mut out = Vec::new();

        for (idx, line) in code.lines().enumerate() {
            let lineno = idx + 1;
            let trimmed = line.trim_start();
            if is_comment(family, trimmed) {
                continue;
            }

            for module in imported_modules(family, trimmed) {
                if self.is_restricted(family, &module) {
                    out.push(
                        Violation::new(
                            "restricted_import",
                            format!("import of restricted module '{module}'"),
                        )
                        .at_line(lineno),
                    );
                }
            }

            if let Some(call) = dangerous_call(family, line) {
                out.push(
                    Violation::new("dangerous_call", format!("call to {call}()")).at_line(lineno),
                );
            }

            if family == Family::Shell {
                if let Some(what) = dangerous_command(line) {
                    out.push(
                        Violation::new("dangerous_command", format!("dangerous command: {what}"))
                            .at_line(lineno),
                    );
                }
            }

            for re in &self.deny {
                if re.is_match(line) {
                    out.push(
                        Violation::new("deny_pattern", format!("matches deny pattern {}", re.as_str()))
                            .at_line(lineno),
                    );
                }
            }
        }
        out
    }
}

#[async_trait]
impl SafetyValidator for RuleSafetyValidator {
    fn name(&self) -> &str {
        "rules"
    }

    async fn validate(&self, code: &str, language: &str) -> Validation {
        let violations = self.check(code, language);
        if !violations.is_empty() {
            tracing::info!(
                language,
                violations = violations.len(),
                first = %violations[0].message,
                "code rejected by safety rules"
            );
        }
        Validation::from_violations(violations)
    }
}

fn is_comment(family: Family, line: &str) -> bool {
    match family {
        // Also covers shebangs.
        Family::Python | Family::Ruby | Family::Shell => line.starts_with('#'),
        Family::JavaScript => line.starts_with("//"),
        Family::Other => false,
    }
}

fn imported_modules(family: Family, line: &str) -> Vec<String> {
    static PY_IMPORT: OnceLock<Regex> = OnceLock::new();
    static PY_FROM: OnceLock<Regex> = OnceLock::new();
    static JS_REQUIRE: OnceLock<Regex> = OnceLock::new();
    static JS_IMPORT: OnceLock<Regex> = OnceLock::new();
    static RB_REQUIRE: OnceLock<Regex> = OnceLock::new();

    match family {
        Family::Python => {
            let import = PY_IMPORT.get_or_init(|| {
                Regex::new(r"^import\s+(.+)$").expect("valid python import regex")
            });
            let from = PY_FROM.get_or_init(|| {
                Regex::new(r"^from\s+([\w.]+)\s+import\b").expect("valid python from regex")
            });
            if let Some(c) = from.captures(line) {
                return vec![c[1].to_string()];
            }
            if let Some(c) = import.captures(line) {
                return c[1]
                    .split(',')
                    .filter_map(|part| part.split_whitespace().next())
                    .map(str::to_string)
                    .collect();
            }
            Vec::new()
        }
        Family::JavaScript => {
            let require = JS_REQUIRE.get_or_init(|| {
                Regex::new(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid require regex")
            });
            let import = JS_IMPORT.get_or_init(|| {
                Regex::new(r#"^import\s+(?:.*?\s+from\s+)?['"]([^'"]+)['"]"#)
                    .expect("valid js import regex")
            });
            require
                .captures_iter(line)
                .chain(import.captures_iter(line))
                .map(|c| c[1].to_string())
                .collect()
        }
        Family::Ruby => {
            let require = RB_REQUIRE.get_or_init(|| {
                Regex::new(r#"^require(?:_relative)?\s*\(?\s*['"]([^'"]+)['"]"#)
                    .expect("valid ruby require regex")
            });
            require
                .captures(line)
                .map(|c| vec![c[1].to_string()])
                .unwrap_or_default()
        }
        Family::Shell | Family::Other => Vec::new(),
    }
}

fn dangerous_call(family: Family, line: &str) -> Option<String> {
    static PY_CALL: OnceLock<Regex> = OnceLock::new();
    static JS_CALL: OnceLock<Regex> = OnceLock::new();
    static RB_CALL: OnceLock<Regex> = OnceLock::new();

    // Bare calls only: `re.compile(` and `cursor.exec(` are method calls and fine.
    let re = match family {
        Family::Python => PY_CALL.get_or_init(|| {
            Regex::new(r"(?:^|[^\w.])(eval|exec|compile|__import__)\s*\(")
                .expect("valid python call regex")
        }),
        Family::JavaScript => JS_CALL.get_or_init(|| {
            Regex::new(r"(?:^|[^\w.])(eval|Function)\s*\(").expect("valid js call regex")
        }),
        Family::Ruby => RB_CALL.get_or_init(|| {
            Regex::new(r"(?:^|[^\w.])(eval|instance_eval|system|exec)\s*[\(\s]")
                .expect("valid ruby call regex")
        }),
        Family::Shell | Family::Other => return None,
    };
    re.captures(line).map(|c| c[1].to_string())
}

fn dangerous_command(line: &str) -> Option<&'static str> {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let rules = RULES.get_or_init(|| {
        [
            (r"\brm\s+(-[a-zA-Z]*r[a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*r|-r\s+-f|-f\s+-r|--recursive\s+--force|--force\s+--recursive)\b", "rm -rf"),
            (r"\bmkfs(\.\w+)?\b", "mkfs"),
            (r"\bdd\s+.*\bif=", "dd if="),
            (r"\b(shutdown|reboot|halt|poweroff)\b", "shutdown"),
            (r"(^|[;&|]\s*|\s)sudo\s", "sudo"),
            (r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:", "fork bomb"),
            (r">\s*/dev/(sd[a-z]|nvme\d|hd[a-z])", "raw disk write"),
        ]
        .into_iter()
        .map(|(p, name)| (Regex::new(p).expect("valid shell rule regex"), name))
        .collect()
    });
    rules
        .iter()
        .find(|(re, _)| re.is_match(line))
        .map(|(_, name)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn validator() -> RuleSafetyValidator {
        RuleSafetyValidator::new(&SafetyConfig::default()).unwrap()
    }

    fn rules(v: &Validation) -> Vec<&str> {
        v.violations.iter().map(|x| x.rule.as_str()).collect()
    }

    #[tokio::test]
    async fn plain_code_is_allowed() {
        let v = validator();
        let ok = v
            .validate("import json\nimport re\nprint(re.compile('a').match('a'))", "python")
            .await;
        assert!(ok.allowed, "{:?}", ok.violations);
        assert!(v.validate("echo hi > out.txt\ncat out.txt", "bash").await.allowed);
    }

    #[tokio::test]
    async fn empty_code_is_rejected() {
        let v = validator().validate("  \n\t", "python").await;
        assert!(!v.allowed);
        assert_eq!(rules(&v), vec!["empty_code"]);
    }

    #[tokio::test]
    async fn restricted_imports_per_language() {
        let v = validator();
        let py = v
            .validate("import json, subprocess\nfrom os.path import join", "python")
            .await;
        assert_eq!(rules(&py), vec!["restricted_import", "restricted_import"]);
        assert_eq!(py.violations[0].line, Some(1));
        assert_eq!(py.violations[1].line, Some(2));

        let js = v
            .validate("const cp = require('node:child_process');", "javascript")
            .await;
        assert_eq!(rules(&js), vec!["restricted_import"]);
        let esm = v.validate("import { connect } from 'net'", "js").await;
        assert!(!esm.allowed);

        let rb = v.validate("require 'open3'", "ruby").await;
        assert_eq!(rules(&rb), vec!["restricted_import"]);
    }

    #[tokio::test]
    async fn dynamic_evaluation_is_rejected_but_methods_are_not() {
        let v = validator();
        let bad = v.validate("x = eval(input())", "python").await;
        assert_eq!(rules(&bad), vec!["dangerous_call"]);
        assert!(!v.validate("__import__('os')", "python").await.allowed);
        assert!(v.validate("pattern.exec(text)", "javascript").await.allowed);
        assert!(!v.validate("new Function('return 1')()", "javascript").await.allowed);
        // Commented-out code is ignored.
        assert!(v.validate("# eval(x)\nprint(1)", "python").await.allowed);
    }

    #[tokio::test]
    async fn dangerous_shell_commands() {
        let v = validator();
        for code in [
            "rm -rf /",
            "rm -fr ~/data",
            "mkfs.ext4 /dev/sda1",
            "dd if=/dev/zero of=/dev/sda",
            "sudo apt-get install x",
            "shutdown -h now",
            ":(){ :|:& };:",
        ] {
            let res = v.validate(code, "shell").await;
            assert_eq!(rules(&res), vec!["dangerous_command"], "{code}");
        }
        assert!(v.validate("rm old.txt", "bash").await.allowed);
    }

    #[tokio::test]
    async fn extra_deny_patterns_apply() {
        let cfg = SafetyConfig {
            deny_patterns: vec![r"curl\s+http".into()],
            ..SafetyConfig::default()
        };
        let v = RuleSafetyValidator::new(&cfg).unwrap();
        let res = v.validate("curl http://example.com", "bash").await;
        assert_eq!(rules(&res), vec!["deny_pattern"]);

        let bad = SafetyConfig {
            deny_patterns: vec!["(".into()],
            ..SafetyConfig::default()
        };
        assert!(RuleSafetyValidator::new(&bad).is_err());
    }
}
