use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AutoSolveError, Language, LanguageProfile, LanguageRegistry, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoSolveConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub extractor: ExtractorConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl AutoSolveConfig {
    /// Read a JSON config file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Defaults or `path`, then `.env` and process environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(secs) = env_parse::<u64>("AUTOSOLVE_RUN_TIMEOUT_SECS")? {
            self.engine.run_timeout_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("AUTOSOLVE_COMPILE_TIMEOUT_SECS")? {
            self.engine.compile_timeout_secs = secs;
        }
        if let Some(n) = env_parse::<usize>("AUTOSOLVE_MAX_CONCURRENT")? {
            self.engine.max_concurrent = n;
        }
        if let Ok(root) = std::env::var("AUTOSOLVE_WORKSPACE_ROOT") {
            self.engine.workspace_root = Some(PathBuf::from(root));
        }
        if let Ok(host) = std::env::var("OLLAMA_HOST") {
            self.ollama.host = host;
        }
        if let Ok(model) = std::env::var("OLLAMA_MODEL") {
            self.ollama.model = model;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.run_timeout_secs == 0 {
            return Err(AutoSolveError::Config("run_timeout_secs must be > 0".into()));
        }
        if self.engine.compile_timeout_secs == 0 {
            return Err(AutoSolveError::Config(
                "compile_timeout_secs must be > 0".into(),
            ));
        }
        if self.engine.max_concurrent == 0 {
            return Err(AutoSolveError::Config("max_concurrent must be > 0".into()));
        }
        if self.extractor.patterns.is_empty() {
            return Err(AutoSolveError::Config(
                "extractor needs at least one token pattern".into(),
            ));
        }
        Ok(())
    }

    /// Registry restricted and overridden as configured.
    pub fn registry(&self) -> LanguageRegistry {
        let registry = LanguageRegistry::builtin().with_overrides(&self.engine.profiles);
        match &self.engine.languages {
            Some(languages) => registry.with_only(languages),
            None => registry,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AutoSolveError::Config(format!("{key}: cannot parse '{raw}'"))),
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub run_timeout_secs: u64,
    pub compile_timeout_secs: u64,
    pub kill_grace_ms: u64,
    pub max_concurrent: usize,
    pub max_output_bytes: usize,
    pub workspace_root: Option<PathBuf>,
    pub default_language: Language,
    /// Supported subset; `None` means every built-in language.
    pub languages: Option<Vec<Language>>,
    /// Replacements for built-in toolchain invocations.
    pub profiles: Vec<LanguageProfile>,
    pub clear_env: bool,
}

impl EngineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: 60,
            compile_timeout_secs: 30,
            kill_grace_ms: 500,
            max_concurrent: 4,
            max_output_bytes: 1024 * 1024,
            workspace_root: None,
            default_language: Language::Python,
            languages: None,
            profiles: Vec::new(),
            clear_env: true,
        }
    }
}

/// rlimits applied to the run step. `None` leaves the inherited limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_secs: Option<u64>,
    pub address_space_mb: Option<u64>,
    pub file_size_mb: Option<u64>,
    pub open_files: Option<u64>,
    pub disable_core_dumps: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_secs: None,
            address_space_mb: None,
            file_size_mb: Some(64),
            open_files: Some(256),
            disable_core_dumps: true,
        }
    }
}

fn default_patterns() -> Vec<String> {
    vec![
        r"flag\{[^}]+\}".to_string(),
        r"ctf\{[^}]+\}".to_string(),
        r"key\{[^}]+\}".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Tried in order, case-insensitively.
    pub patterns: Vec<String>,
    /// Extra patterns tried before `patterns` for a challenge category.
    pub category_patterns: HashMap<String, Vec<String>>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
            category_patterns: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
    pub temperature: Option<f32>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            temperature: Some(0.0),
        }
    }
}
