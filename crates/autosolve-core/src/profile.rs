use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{AutoSolveError, Language, Result};

/// A program plus argument template. `{source}`, `{binary}` and `{dir}` are
/// replaced with paths inside the attempt workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Substitute workspace paths into the program and its arguments.
    pub fn resolve(&self, source: &Path, binary: &Path, dir: &Path) -> (String, Vec<String>) {
        let fill = |s: &str| {
            s.replace("{source}", &source.to_string_lossy())
                .replace("{binary}", &binary.to_string_lossy())
                .replace("{dir}", &dir.to_string_lossy())
        };
        (fill(&self.program), self.args.iter().map(|a| fill(a)).collect())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language: Language,
    pub file_extension: String,
    #[serde(default)]
    pub compile: Option<CommandSpec>,
    pub run: CommandSpec,
}

impl LanguageProfile {
    pub fn builtin(language: Language) -> Self {
        let (compile, run) = match language {
            Language::Python => (None, CommandSpec::new("python3", &["{source}"])),
            Language::JavaScript => (None, CommandSpec::new("node", &["{source}"])),
            Language::Bash => (None, CommandSpec::new("bash", &["{source}"])),
            Language::Php => (None, CommandSpec::new("php", &["{source}"])),
            Language::Ruby => (None, CommandSpec::new("ruby", &["{source}"])),
            Language::Go => (
                Some(CommandSpec::new("go", &["build", "-o", "{binary}", "{source}"])),
                CommandSpec::new("{binary}", &[]),
            ),
            Language::Rust => (
                Some(CommandSpec::new(
                    "rustc",
                    &["--edition=2021", "{source}", "-o", "{binary}"],
                )),
                CommandSpec::new("{binary}", &[]),
            ),
            Language::C => (
                Some(CommandSpec::new("gcc", &["{source}", "-o", "{binary}"])),
                CommandSpec::new("{binary}", &[]),
            ),
            Language::Cpp => (
                Some(CommandSpec::new("g++", &["{source}", "-o", "{binary}"])),
                CommandSpec::new("{binary}", &[]),
            ),
        };

        Self {
            language,
            file_extension: language.file_extension().to_string(),
            compile,
            run,
        }
    }

    pub fn requires_compilation(&self) -> bool {
        self.compile.is_some()
    }

    /// The external program this profile cannot work without.
    pub fn toolchain_program(&self) -> &str {
        self.compile
            .as_ref()
            .map(|c| c.program.as_str())
            .unwrap_or(self.run.program.as_str())
    }
}

/// Read-only table of supported languages, built once and shared by reference.
#[derive(Clone, Debug)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    pub fn builtin() -> Self {
        Self::from_profiles(Language::all().iter().map(|l| LanguageProfile::builtin(*l)))
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = LanguageProfile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(|p| (p.language, p)).collect(),
        }
    }

    /// Keep only the given languages.
    pub fn with_only(mut self, languages: &[Language]) -> Self {
        self.profiles.retain(|l, _| languages.contains(l));
        self
    }

    /// Replace built-in profiles with configured ones.
    pub fn with_overrides(mut self, overrides: &[LanguageProfile]) -> Self {
        for profile in overrides {
            self.profiles.insert(profile.language, profile.clone());
        }
        self
    }

    pub fn lookup(&self, language_id: &str) -> Result<&LanguageProfile> {
        let language: Language = language_id.parse()?;
        self.profiles
            .get(&language)
            .ok_or_else(|| AutoSolveError::UnsupportedLanguage(language_id.to_string()))
    }

    pub fn profile(&self, language: Language) -> Result<&LanguageProfile> {
        self.profiles
            .get(&language)
            .ok_or_else(|| AutoSolveError::UnsupportedLanguage(language.id().to_string()))
    }

    pub fn contains(&self, language: Language) -> bool {
        self.profiles.contains_key(&language)
    }

    /// Supported languages in declaration order.
    pub fn languages(&self) -> Vec<Language> {
        Language::all()
            .iter()
            .copied()
            .filter(|l| self.profiles.contains_key(l))
            .collect()
    }

    /// Each supported language paired with whether its toolchain is on `PATH`.
    pub fn available(&self) -> Vec<(Language, bool)> {
        self.languages()
            .into_iter()
            .filter_map(|l| self.profiles.get(&l))
            .map(|p| (p.language, which::which(p.toolchain_program()).is_ok()))
            .collect()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
