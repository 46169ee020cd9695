use std::sync::OnceLock;

use regex::Regex;

use crate::error::ErrorKind;
use crate::history::ErrorClass;

use super::capture::is_truncation_marker;

fn exception_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z_][\w.$]*(?:Error|Exception))\b(?::\s*(.*))?$")
            .expect("exception regex is valid")
    })
}

fn ruby_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r":in [^:]*:\s*(.*)\s+\(([A-Z]\w*(?:Error|Exception))\)$").expect("ruby regex is valid")
    })
}

/// Non-empty stderr lines from the last one up, without capture truncation markers.
fn lines_from_end(stderr: &str) -> impl Iterator<Item = &str> {
    stderr
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_truncation_marker(l))
}

/// Classify a non-successful exit from its stderr. Scans from the last line up, since
/// interpreters print the error type last.
pub fn classify_failure(exit_code: Option<i32>, stderr: &str) -> ErrorClass {
    for line in lines_from_end(stderr) {
        if let Some(cap) = ruby_re().captures(line) {
            return ErrorClass {
                kind: ErrorKind::Runtime,
                message: cap[1].to_string(),
                exception: Some(cap[2].to_string()),
            };
        }
        if let Some(cap) = exception_re().captures(line) {
            let full = &cap[1];
            let name = full.rsplit('.').next().unwrap_or(full).to_string();
            let message = cap
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| line.to_string());
            return ErrorClass {
                kind: ErrorKind::Runtime,
                message,
                exception: Some(name),
            };
        }
    }

    let message = lines_from_end(stderr)
        .next()
        .map(str::to_string)
        .unwrap_or_else(|| match exit_code {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_string(),
        });
    ErrorClass {
        kind: ErrorKind::NonZeroExit,
        message,
        exception: None,
    }
}
