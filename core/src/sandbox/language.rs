use std::collections::HashMap;

use crate::config::LanguageConfig;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub name: String,
    pub aliases: Vec<String>,
    pub program: String,
    pub args: Vec<String>,
    /// Source file name written into the scratch directory.
    pub file_name: String,
    /// Fixed variables set on top of the allow-listed environment.
    pub env: Vec<(String, String)>,
}

impl LanguageSpec {
    fn new(name: &str, aliases: &[&str], program: &str, args: &[&str], file_name: &str) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            file_name: file_name.to_string(),
            env: Vec::new(),
        }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Names this language answers to, including its canonical name.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

impl From<&LanguageConfig> for LanguageSpec {
    fn from(c: &LanguageConfig) -> Self {
        let ext = c.extension.trim_start_matches('.');
        Self {
            name: c.name.to_ascii_lowercase(),
            aliases: c.aliases.iter().map(|a| a.to_ascii_lowercase()).collect(),
            program: c.program.clone(),
            args: c.args.clone(),
            file_name: format!("main.{ext}"),
            env: Vec::new(),
        }
    }
}

/// Name/alias -> interpreter mapping.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    specs: Vec<LanguageSpec>,
    index: HashMap<String, usize>,
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::from_specs(vec![
            LanguageSpec::new("python", &["py", "python3"], "python3", &["-u"], "main.py")
                .with_env("PYTHONUNBUFFERED", "1")
                .with_env("PYTHONDONTWRITEBYTECODE", "1"),
            LanguageSpec::new("javascript", &["js", "node"], "node", &[], "main.js"),
            LanguageSpec::new("shell", &["bash", "sh", "zsh"], "bash", &[], "main.sh"),
            LanguageSpec::new("ruby", &["rb"], "ruby", &[], "main.rb"),
            LanguageSpec::new("r", &["rscript"], "Rscript", &[], "main.r"),
            LanguageSpec::new("java", &[], "java", &[], "Main.java"),
        ])
    }
}

impl LanguageRegistry {
    pub fn from_specs(specs: Vec<LanguageSpec>) -> Self {
        let mut registry = Self {
            specs: Vec::new(),
            index: HashMap::new(),
        };
        for spec in specs {
            registry.insert(spec);
        }
        registry
    }

    /// Defaults plus configured entries; a configured name replaces the default one.
    pub fn with_overrides(overrides: &[LanguageConfig]) -> Self {
        let mut registry = Self::default();
        for c in overrides {
            registry.insert(LanguageSpec::from(c));
        }
        registry
    }

    pub fn insert(&mut self, spec: LanguageSpec) {
        let slot = match self.index.get(&spec.name) {
            Some(&i) => {
                self.specs[i] = spec;
                i
            }
            None => {
                self.specs.push(spec);
                self.specs.len() - 1
            }
        };
        let names: Vec<String> = self.specs[slot].names().map(str::to_string).collect();
        for name in names {
            self.index.insert(name, slot);
        }
    }

    pub fn resolve(&self, language: &str) -> Result<&LanguageSpec, EngineError> {
        let key = language.trim().to_ascii_lowercase();
        self.index
            .get(&key)
            .map(|&i| &self.specs[i])
            .ok_or_else(|| EngineError::UnsupportedLanguage(language.to_string()))
    }

    pub fn supports(&self, language: &str) -> bool {
        self.resolve(language).is_ok()
    }

    pub fn languages(&self) -> impl Iterator<Item = &LanguageSpec> {
        self.specs.iter()
    }
}
