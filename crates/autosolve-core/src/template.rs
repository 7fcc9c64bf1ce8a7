use std::collections::HashMap;
use std::path::Path;
use std::sync::{LazyLock, RwLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::{AutoSolveError, Result};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder pattern is valid"));

/// Substitute `{key}` placeholders in one pass over the skeleton.
///
/// Only placeholders present in the skeleton are considered, so substituted
/// values are never re-scanned and the result does not depend on map order.
/// Placeholders without a matching parameter are left as written.
pub fn render(skeleton: &str, parameters: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(skeleton, |caps: &Captures| match parameters.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveTemplate {
    #[serde(default)]
    pub id: u32,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub template_code: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl SolveTemplate {
    pub fn new(name: &str, category: &str, template_code: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            category: category.to_string(),
            description: String::new(),
            template_code: template_code.to_string(),
            is_active: true,
        }
    }

    pub fn render(&self, parameters: &HashMap<String, String>) -> String {
        render(&self.template_code, parameters)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TemplateFile {
    templates: Vec<SolveTemplate>,
}

/// Named, categorized solve skeletons. Insertion order decides which template
/// serves a category when several are active.
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: RwLock<Vec<SolveTemplate>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the built-in `web`, `crypto` and `pwn` skeletons.
    pub fn with_builtin() -> Self {
        let store = Self::new();
        for template in builtin_templates() {
            // Built-in names are distinct.
            let _ = store.add(template);
        }
        store
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: TemplateFile = serde_json::from_str(&text)?;
        tracing::debug!("Loaded {} templates from {:?}", file.templates.len(), path);
        Ok(Self {
            templates: RwLock::new(file.templates),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = TemplateFile {
            templates: self.read()?.clone(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Active templates, optionally restricted to one category.
    pub fn list(&self, category: Option<&str>) -> Result<Vec<SolveTemplate>> {
        Ok(self
            .read()?
            .iter()
            .filter(|t| t.is_active)
            .filter(|t| category.map_or(true, |c| t.category == c))
            .cloned()
            .collect())
    }

    pub fn get(&self, name: &str) -> Result<Option<SolveTemplate>> {
        Ok(self.read()?.iter().find(|t| t.name == name).cloned())
    }

    pub fn first_active(&self, category: &str) -> Result<SolveTemplate> {
        self.read()?
            .iter()
            .find(|t| t.is_active && t.category == category)
            .cloned()
            .ok_or_else(|| AutoSolveError::TemplateNotFound(category.to_string()))
    }

    /// Add a template, assigning the next numeric id.
    pub fn add(&self, mut template: SolveTemplate) -> Result<SolveTemplate> {
        let mut templates = self.write()?;
        if templates.iter().any(|t| t.name == template.name) {
            return Err(AutoSolveError::InvalidRequest(format!(
                "template '{}' already exists",
                template.name
            )));
        }
        template.id = templates.iter().map(|t| t.id).max().unwrap_or(0) + 1;
        templates.push(template.clone());
        Ok(template)
    }

    /// Replace the template called `name`, keeping its id.
    pub fn update(&self, name: &str, mut template: SolveTemplate) -> Result<()> {
        let mut templates = self.write()?;
        let slot = templates
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| AutoSolveError::TemplateNotFound(name.to_string()))?;
        template.id = slot.id;
        *slot = template;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut templates = self.write()?;
        let before = templates.len();
        templates.retain(|t| t.name != name);
        match templates.len() == before {
            true => Err(AutoSolveError::TemplateNotFound(name.to_string())),
            false => Ok(()),
        }
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_active(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_active(name, false)
    }

    fn set_active(&self, name: &str, active: bool) -> Result<()> {
        let mut templates = self.write()?;
        let template = templates
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| AutoSolveError::TemplateNotFound(name.to_string()))?;
        template.is_active = active;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<SolveTemplate>>> {
        self.templates
            .read()
            .map_err(|_| AutoSolveError::Store("template lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<SolveTemplate>>> {
        self.templates
            .write()
            .map_err(|_| AutoSolveError::Store("template lock poisoned".to_string()))
    }
}

// =============================================================================
// Built-in Skeletons
// =============================================================================

const WEB_TEMPLATE: &str = r#"import re
import requests


def solve_web_challenge():
    url = "{target_url}"
    response = requests.get(url, timeout=10)

    flags = re.findall(r"flag\{[^}]+\}", response.text)
    if flags:
        print(f"found flag: {flags[0]}")
        return flags[0]

    print("no flag found")
    return None


if __name__ == "__main__":
    solve_web_challenge()
"#;

const CRYPTO_TEMPLATE: &str = r#"import base64
import hashlib


def solve_crypto_challenge():
    data = "{encrypted_data}"

    try:
        decoded = base64.b64decode(data)
        print(f"base64 decoded: {decoded}")
    except Exception:
        pass

    md5_hash = hashlib.md5(data.encode()).hexdigest()
    print(f"md5: {md5_hash}")


if __name__ == "__main__":
    solve_crypto_challenge()
"#;

const PWN_TEMPLATE: &str = r#"from pwn import *


def solve_pwn_challenge():
    p = process("./{binary_name}")

    payload = b"A" * {offset} + p64(0xdeadbeef)
    p.sendline(payload)

    response = p.recvall()
    print(f"response: {response}")
    p.close()


if __name__ == "__main__":
    solve_pwn_challenge()
"#;

pub fn builtin_templates() -> Vec<SolveTemplate> {
    vec![
        SolveTemplate {
            description: "Fetch a page and grep it for a flag".to_string(),
            ..SolveTemplate::new("web-basic", "web", WEB_TEMPLATE)
        },
        SolveTemplate {
            description: "Try common decodings on the ciphertext".to_string(),
            ..SolveTemplate::new("crypto-basic", "crypto", CRYPTO_TEMPLATE)
        },
        SolveTemplate {
            description: "Overflow a local binary with pwntools".to_string(),
            ..SolveTemplate::new("pwn-basic", "pwn", PWN_TEMPLATE)
        },
    ]
}
