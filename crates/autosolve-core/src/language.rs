use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::AutoSolveError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    JavaScript,
    Bash,
    Php,
    Ruby,
    Go,
    Rust,
    C,
    Cpp,
}

impl Language {
    /// Stable identifier used in requests, records and config files.
    pub fn id(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Bash => "bash",
            Language::Php => "php",
            Language::Ruby => "ruby",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
            Language::Bash => "Bash",
            Language::Php => "PHP",
            Language::Ruby => "Ruby",
            Language::Go => "Go",
            Language::Rust => "Rust",
            Language::C => "C",
            Language::Cpp => "C++",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::Bash => "sh",
            Language::Php => "php",
            Language::Ruby => "rb",
            Language::Go => "go",
            Language::Rust => "rs",
            Language::C => "c",
            Language::Cpp => "cpp",
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(
            self,
            Language::Go | Language::Rust | Language::C | Language::Cpp
        )
    }

    pub fn all() -> &'static [Language] {
        &[
            Language::Python,
            Language::JavaScript,
            Language::Bash,
            Language::Php,
            Language::Ruby,
            Language::Go,
            Language::Rust,
            Language::C,
            Language::Cpp,
        ]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Language {
    type Err = AutoSolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let language = match normalized.as_str() {
            "python" | "python3" | "py" => Language::Python,
            "javascript" | "js" | "node" | "nodejs" => Language::JavaScript,
            "bash" | "sh" | "shell" => Language::Bash,
            "php" => Language::Php,
            "ruby" | "rb" => Language::Ruby,
            "go" | "golang" => Language::Go,
            "rust" | "rs" => Language::Rust,
            "c" => Language::C,
            "cpp" | "c++" | "cxx" => Language::Cpp,
            _ => return Err(AutoSolveError::UnsupportedLanguage(s.to_string())),
        };
        Ok(language)
    }
}
