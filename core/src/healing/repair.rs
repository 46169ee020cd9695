use crate::history::ExecutionRecord;
use crate::sandbox::LanguageRegistry;
use crate::util::tail_chars;

const STDERR_TAIL_CHARS: usize = 2_000;

/// Fence tags accepted for `language` when pulling code out of a reply.
pub fn fence_names(language: &str) -> Vec<String> {
    let registry = LanguageRegistry::default();
    match registry.resolve(language) {
        Ok(spec) => spec.names().map(str::to_string).collect(),
        Err(_) => vec![language.to_ascii_lowercase()],
    }
}

pub fn repair_prompt(goal: Option<&str>, code: &str, record: &ExecutionRecord) -> String {
    let mut out = String::new();
    if let Some(goal) = goal.filter(|g| !g.trim().is_empty()) {
        out.push_str(&format!("The following {} code should: {goal}\n\n", record.language));
    }
    out.push_str(&format!(
        "Attempt {} failed with {}.\n\n```{}\n{}\n```\n",
        record.attempt,
        record.failure_summary(),
        record.language,
        code.trim_end()
    ));
    let stderr = record.stderr.trim();
    if !stderr.is_empty() {
        out.push_str(&format!(
            "\nstderr:\n```\n{}\n```\n",
            tail_chars(stderr, STDERR_TAIL_CHARS)
        ));
    }
    out.push_str(&format!(
        "\nReturn the corrected program as a single ```{}``` block.",
        record.language
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_names_include_aliases() {
        let names = fence_names("python");
        assert!(names.contains(&"python".to_string()));
        assert!(names.contains(&"py".to_string()));
        assert_eq!(fence_names("cobol"), vec!["cobol".to_string()]);
    }
}
