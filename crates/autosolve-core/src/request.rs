use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SolveMethod;

/// One call into the engine.
///
/// With `source` set the code runs verbatim. Otherwise `method` picks between
/// the configured code generator and the category template; with no method
/// the generator is preferred and the template is the fallback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolveRequest {
    #[serde(default)]
    pub challenge_id: Option<String>,
    #[serde(default)]
    pub challenge_text: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub method: Option<SolveMethod>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub language_hint: Option<String>,
    #[serde(default)]
    pub parameters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub stdin: Option<Vec<u8>>,
    #[serde(default, with = "duration_secs")]
    pub timeout: Option<Duration>,
}

impl SolveRequest {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..Default::default()
        }
    }

    /// Run `source` as-is.
    pub fn custom(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            method: Some(SolveMethod::Custom),
            ..Default::default()
        }
    }

    pub fn language(mut self, hint: impl Into<String>) -> Self {
        self.language_hint = Some(hint.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn challenge(mut self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.challenge_id = Some(id.into());
        self.challenge_text = text.into();
        self
    }

    pub fn method(mut self, method: SolveMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Explicit stdin, else the legacy `input` parameter.
    pub fn effective_stdin(&self) -> Option<Vec<u8>> {
        self.stdin.clone().or_else(|| {
            self.parameters
                .as_ref()
                .and_then(|p| p.get("input"))
                .map(|s| s.as_bytes().to_vec())
        })
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
