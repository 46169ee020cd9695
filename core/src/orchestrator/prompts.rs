use crate::task::{Step, Task};
use crate::util::tail_chars;

const DEPENDENCY_OUTPUT_CHARS: usize = 1_500;

pub fn plan_prompt(description: &str, languages: &[String]) -> String {
    format!(
        "Break the following task into executable steps.\n\n\
         Task: {description}\n\n\
         Reply with JSON only:\n\
         {{\"steps\": [{{\"id\": 1, \"description\": \"...\", \"language\": \"python\", \
         \"dependencies\": []}}]}}\n\
         - `id` is unique; `dependencies` lists ids of steps that must finish first.\n\
         - `language` is one of: {}.\n\
         - Optionally include `code` when the step is trivial.\n\
         - Steps share one working directory; pass data between them through files.",
        languages.join(", ")
    )
}

/// Prompt for generating a step's code, with the outputs of its dependencies.
pub fn step_prompt(task: &Task, step: &Step, language: &str) -> String {
    let mut out = format!(
        "Overall task: {}\n\nWrite a complete {language} program for this step:\n{}\n",
        task.description, step.description
    );
    let deps: Vec<&Step> = step
        .dependencies
        .iter()
        .filter_map(|d| task.step(*d))
        .collect();
    if !deps.is_empty() {
        out.push_str("\nEarlier steps already ran in the same working directory:\n");
        for dep in deps {
            out.push_str(&format!("- step {}: {}\n", dep.key, dep.description));
            if let Some(output) = dep.artifacts.output.as_deref().filter(|o| !o.trim().is_empty()) {
                out.push_str(&format!(
                    "  output:\n{}\n",
                    tail_chars(output.trim_end(), DEPENDENCY_OUTPUT_CHARS)
                ));
            }
        }
    }
    out.push_str(&format!(
        "\nReply with a single ```{language}``` code block. If the step needs no code, \
         answer in plain text."
    ));
    out
}
