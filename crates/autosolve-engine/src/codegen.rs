use std::sync::LazyLock;

use async_trait::async_trait;
use autosolve_core::{Language, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What a generator is told about the challenge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChallengeContext {
    pub challenge_id: Option<String>,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedCode {
    pub source: String,
    /// Language named by the response, when it named one we know.
    pub language: Option<Language>,
}

/// Produces solve source for a challenge. Failures surface to the caller as
/// `CodeGeneration` errors before anything is staged.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(&self, context: &ChallengeContext) -> Result<GeneratedCode>;

    fn name(&self) -> &str;
}

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+#-]*)[ \t]*\r?\n(.*?)\r?\n?```").expect("fence pattern is valid")
});

static INLINE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").expect("inline fence pattern is valid"));

/// Pull runnable source out of a model response.
///
/// Tries fenced blocks first (python, py, any tag, bare), then everything
/// from the first `import`/`from` line, then the trimmed response. Returns
/// `None` only when nothing but whitespace is left.
pub fn extract_code_block(response: &str) -> Option<(String, Option<Language>)> {
    let fenced = ["python", "py"]
        .iter()
        .find_map(|tag| {
            FENCE
                .captures_iter(response)
                .find(|c| c[1].eq_ignore_ascii_case(tag))
        })
        .or_else(|| FENCE.captures_iter(response).next());

    if let Some(caps) = fenced {
        let language = caps[1].parse::<Language>().ok();
        return non_empty(caps[2].trim()).map(|code| (code, language));
    }

    if let Some(caps) = INLINE_FENCE.captures(response) {
        return non_empty(caps[1].trim()).map(|code| (code, None));
    }

    let from_import: Vec<&str> = response
        .lines()
        .skip_while(|line| {
            let line = line.trim_start();
            !(line.starts_with("import ") || line.starts_with("from "))
        })
        .collect();
    if !from_import.is_empty() {
        return non_empty(from_import.join("\n").trim()).map(|code| (code, Some(Language::Python)));
    }

    non_empty(response.trim()).map(|code| (code, None))
}

fn non_empty(code: &str) -> Option<String> {
    match code.is_empty() {
        true => None,
        false => Some(code.to_string()),
    }
}
