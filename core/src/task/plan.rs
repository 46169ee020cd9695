use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// A step id as written by the planner: models emit both `"id": 1` and `"id": "fetch"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    Index(u64),
    Key(String),
}

impl StepRef {
    pub fn as_key(&self) -> String {
        match self {
            StepRef::Index(n) => n.to_string(),
            StepRef::Key(s) => s.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    #[serde(default)]
    pub id: Option<StepRef>,
    pub description: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<StepRef>,
}

impl PlannedStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            language: None,
            code: None,
            dependencies: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(StepRef::Key(id.into()));
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(StepRef::Key(key.into()));
        self
    }
}

#[derive(Deserialize)]
struct PlanDoc {
    steps: Vec<PlannedStep>,
}

/// Parse a planner reply into steps. Accepts `{"steps": [...]}` or a bare array,
/// optionally wrapped in a fenced block or surrounded by prose.
pub fn parse_plan(text: &str) -> Result<Vec<PlannedStep>, PlanError> {
    let json = extract_json(text).ok_or_else(|| PlanError::Parse("no JSON found in reply".into()))?;

    let steps = if json.trim_start().starts_with('[') {
        serde_json::from_str::<Vec<PlannedStep>>(json)
    } else {
        serde_json::from_str::<PlanDoc>(json).map(|doc| doc.steps)
    }
    .map_err(|e| PlanError::Parse(e.to_string()))?;

    if steps.is_empty() {
        return Err(PlanError::Empty);
    }
    Ok(steps)
}

/// Locate the JSON payload in a model reply.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(inner) = fenced_json(text) {
        return Some(inner);
    }
    let open = text.find(['{', '['])?;
    let close_char = if text[open..].starts_with('{') { '}' } else { ']' };
    let close = text.rfind(close_char)?;
    (close > open).then(|| &text[open..=close])
}

fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```json")?;
    let body = &text[start + "```json".len()..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numeric_ids_inside_prose() {
        let reply = r#"Here is the plan:
{"steps": [
  {"id": 1, "description": "write file", "language": "python", "dependencies": []},
  {"id": 2, "description": "read file", "dependencies": [1]}
]}
Good luck."#;
        let steps = parse_plan(reply).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].dependencies, vec![StepRef::Index(1)]);
        assert_eq!(steps[0].language.as_deref(), Some("python"));
    }

    #[test]
    fn parses_fenced_bare_array() {
        let reply = "```json\n[{\"id\": \"a\", \"description\": \"only\"}]\n```";
        let steps = parse_plan(reply).unwrap();
        assert_eq!(steps[0].id, Some(StepRef::Key("a".into())));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert_eq!(parse_plan(r#"{"steps": []}"#), Err(PlanError::Empty));
        assert!(matches!(parse_plan("no plan here"), Err(PlanError::Parse(_))));
    }
}
