use std::collections::HashMap;

use autosolve_core::{AutoSolveError, ExtractorConfig, Result};
use regex::{Regex, RegexBuilder};

use crate::detector::LanguageDetector;

/// Finds the success token in captured program output.
#[derive(Debug, Clone)]
pub struct TokenExtractor {
    patterns: Vec<Regex>,
    category_patterns: HashMap<String, Vec<Regex>>,
    detector: LanguageDetector,
}

impl TokenExtractor {
    pub fn new(config: &ExtractorConfig, detector: LanguageDetector) -> Result<Self> {
        let patterns = compile_all(&config.patterns)?;
        let category_patterns = config
            .category_patterns
            .iter()
            .map(|(category, list)| Ok((category.clone(), compile_all(list)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(Self {
            patterns,
            category_patterns,
            detector,
        })
    }

    /// First match of the first matching pattern, scanning the whole text.
    pub fn extract(&self, stdout: &str) -> Option<String> {
        first_match(&self.patterns, stdout)
    }

    /// Like [`extract`](Self::extract), trying the category's own patterns first.
    pub fn extract_for(&self, category: &str, stdout: &str) -> Option<String> {
        self.category_patterns
            .get(category)
            .and_then(|patterns| first_match(patterns, stdout))
            .or_else(|| self.extract(stdout))
    }

    /// Display label for a piece of source, via the language detector.
    pub fn language_label(&self, source: &str) -> &'static str {
        self.detector.detect(source).label()
    }
}

impl Default for TokenExtractor {
    fn default() -> Self {
        Self::new(&ExtractorConfig::default(), LanguageDetector::default())
            .expect("built-in token patterns are valid")
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .dot_matches_new_line(true)
                .build()
                .map_err(|e| AutoSolveError::Config(format!("bad token pattern '{p}': {e}")))
        })
        .collect()
}

fn first_match(patterns: &[Regex], text: &str) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| re.find(text))
        .map(|m| m.as_str().to_string())
}
