//! Named prompt templates loaded from external files.
//!
//! Templates are plain text files (`<name>.txt`) with `{placeholder}`
//! variables. Placeholders are parsed once at load time; rendering
//! validates the variables passed against that set. `reload` swaps the
//! whole set atomically and keeps the previous set when the reload fails.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use carelink_common::{CarelinkError, Result};
use parking_lot::RwLock;
use regex::Regex;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    text: String,
    placeholders: HashSet<String>,
}

impl PromptTemplate {
    fn parse(text: String) -> Self {
        let placeholder_re = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
        let placeholders = placeholder_re
            .captures_iter(&text)
            .map(|c| c[1].to_string())
            .collect();
        Self { text, placeholders }
    }

    pub fn placeholders(&self) -> &HashSet<String> {
        &self.placeholders
    }
}

type TemplateSet = HashMap<String, PromptTemplate>;

/// Reload-safe registry of prompt templates.
pub struct PromptRegistry {
    dir: PathBuf,
    templates: RwLock<Arc<TemplateSet>>,
}

impl PromptRegistry {
    /// Load every `*.txt` file in `dir`; the file stem is the template name.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let templates = Self::read_dir(&dir)?;
        info!(dir = %dir.display(), count = templates.len(), "loaded prompt templates");
        Ok(Self {
            dir,
            templates: RwLock::new(Arc::new(templates)),
        })
    }

    fn read_dir(dir: &Path) -> Result<TemplateSet> {
        if !dir.is_dir() {
            return Err(CarelinkError::Config(format!(
                "prompts directory {} does not exist",
                dir.display()
            )));
        }

        let mut templates = TemplateSet::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?.trim().to_string();
            templates.insert(name.to_string(), PromptTemplate::parse(text));
        }
        Ok(templates)
    }

    /// Render `name`, substituting `vars`. Every variable passed must be a
    /// placeholder the template declares, and every declared placeholder
    /// must be supplied.
    pub fn render(&self, name: &str, vars: &HashMap<String, String>) -> Result<String> {
        let templates = self.templates.read().clone();
        let template = templates.get(name).ok_or_else(|| {
            CarelinkError::Config(format!("prompt template '{name}' not found"))
        })?;

        for key in vars.keys() {
            if !template.placeholders.contains(key) {
                return Err(CarelinkError::Config(format!(
                    "prompt template '{name}' has no placeholder '{{{key}}}'"
                )));
            }
        }
        for placeholder in &template.placeholders {
            if !vars.contains_key(placeholder) {
                return Err(CarelinkError::Config(format!(
                    "prompt template '{name}' missing value for '{{{placeholder}}}'"
                )));
            }
        }

        let mut rendered = template.text.clone();
        for (key, value) in vars {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        Ok(rendered)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Re-read the template directory. A failed reload leaves the current
    /// set untouched.
    pub fn reload(&self) -> Result<usize> {
        match Self::read_dir(&self.dir) {
            Ok(templates) => {
                let count = templates.len();
                *self.templates.write() = Arc::new(templates);
                info!(count, "reloaded prompt templates");
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "prompt reload failed, keeping previous set");
                Err(e)
            }
        }
    }
}
