use async_trait::async_trait;
use autosolve_core::{AutoSolveError, OllamaConfig, Result};
use serde::{Deserialize, Serialize};

use crate::codegen::{extract_code_block, ChallengeContext, CodeGenerator, GeneratedCode};

#[derive(Debug, Clone)]
pub struct OllamaClient {
    host: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub message: ResponseMessage,
    #[serde(default)]
    pub eval_count: Option<u64>,
    #[serde(default)]
    pub eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
}

impl OllamaClient {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn chat(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        temperature: Option<f32>,
    ) -> Result<ChatResponse> {
        let url = format!("{}/api/chat", self.host);

        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
            options: temperature.map(|t| ChatOptions {
                temperature: Some(t),
            }),
        };

        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AutoSolveError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AutoSolveError::CodeGeneration(format!(
                "Chat failed: {} - {}",
                status, body
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| AutoSolveError::Http(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| {
            AutoSolveError::CodeGeneration(format!(
                "Failed to parse response: {} - Body: {}",
                e,
                truncate(&body, 500)
            ))
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

const SYSTEM_PROMPT: &str = "You are an experienced CTF player. \
Reply with one complete, self-contained program that solves the challenge \
and prints the flag to stdout. Put the program in a single fenced code block \
tagged with its language. Prefer Python 3 using only the standard library.";

/// Asks a local Ollama model for solve code.
#[derive(Debug, Clone)]
pub struct OllamaCodeGenerator {
    client: OllamaClient,
    model: String,
    temperature: Option<f32>,
}

impl OllamaCodeGenerator {
    pub fn new(config: &OllamaConfig) -> Self {
        Self {
            client: OllamaClient::new(&config.host),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

pub fn build_prompt(context: &ChallengeContext) -> String {
    let category = match context.category.trim() {
        "" => "misc",
        c => c,
    };
    format!(
        "Challenge category: {category}\n\n\
         Challenge description:\n{}\n\n\
         Write the solver. It must run unattended, must not read from the \
         terminal, and must print the recovered flag.",
        context.description.trim()
    )
}

#[async_trait]
impl CodeGenerator for OllamaCodeGenerator {
    async fn generate(&self, context: &ChallengeContext) -> Result<GeneratedCode> {
        tracing::info!(
            "Generating solve code with {} for category '{}'",
            self.model,
            context.category
        );

        let prompt = build_prompt(context);
        let response = self
            .client
            .chat(&self.model, SYSTEM_PROMPT, &prompt, self.temperature)
            .await?;

        if let (Some(tokens), Some(ns)) = (response.eval_count, response.eval_duration) {
            tracing::debug!("Model produced {} tokens in {} ms", tokens, ns / 1_000_000);
        }

        let (source, language) = extract_code_block(&response.message.content)
            .ok_or_else(|| AutoSolveError::CodeGeneration("model returned no code".into()))?;

        Ok(GeneratedCode { source, language })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_description_and_category() {
        let prompt = build_prompt(&ChallengeContext {
            challenge_id: Some("c1".into()),
            description: "  decode Zm9v  ".into(),
            category: "crypto".into(),
        });
        assert!(prompt.contains("category: crypto"));
        assert!(prompt.contains("decode Zm9v\n"));
    }

    #[test]
    fn test_prompt_defaults_category() {
        let prompt = build_prompt(&ChallengeContext::default());
        assert!(prompt.contains("category: misc"));
    }

    #[test]
    fn test_chat_request_omits_empty_options() {
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![],
            stream: false,
            options: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("options").is_none());
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_host_trailing_slash() {
        assert_eq!(OllamaClient::new("http://h:1/").host(), "http://h:1");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_error() {
        let generator = OllamaCodeGenerator::new(&OllamaConfig {
            host: "http://127.0.0.1:9".into(),
            model: "none".into(),
            temperature: None,
        });
        assert!(generator.generate(&ChallengeContext::default()).await.is_err());
    }
}
