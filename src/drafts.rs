//! Follow-up draft generation
//!
//! Drafts come from an OpenAI-compatible chat completion endpoint. The model
//! is asked for a `SUBJECT:` line followed by a `BODY:` block; anything else is
//! treated as a generator failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::DraftConfig;
use crate::models::followup_job::Tone;

#[derive(Debug, Clone)]
pub struct DraftRequest {
    pub subject: String,
    pub body: String,
    pub tone: Tone,
    pub recipient_name: Option<String>,
    /// Free-form writing style notes for the sender
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum DraftError {
    #[error("draft request failed: {0}")]
    Http(String),
    #[error("draft endpoint returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("could not parse draft: {0}")]
    Parse(String),
}

#[async_trait]
pub trait DraftGenerator: Send + Sync {
    async fn generate(&self, request: &DraftRequest) -> Result<Draft, DraftError>;
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Draft generator backed by an OpenAI-compatible `/chat/completions` API.
pub struct OpenAiDraftGenerator {
    http: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiDraftGenerator {
    /// `None` when drafting is not configured.
    pub fn from_config(config: &DraftConfig) -> Result<Option<Self>, reqwest::Error> {
        let Some(api_key) = config.api_key.clone().filter(|key| !key.is_empty()) else {
            return Ok(None);
        };

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Some(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        }))
    }
}

fn system_prompt(request: &DraftRequest) -> String {
    let mut prompt = format!(
        "You are an expert email assistant helping write follow-up emails.\n\
         Your task is to generate a {} follow-up email based on the context provided.\n\n\
         Guidelines:\n\
         - Keep the follow-up concise (2-3 short paragraphs max)\n\
         - Reference the original email naturally\n\
         - Be respectful of the recipient's time\n\
         - Include a clear call-to-action\n\
         - Don't be pushy or aggressive\n",
        request.tone.description()
    );
    if let Some(voice) = request.voice.as_deref().filter(|v| !v.trim().is_empty()) {
        prompt.push_str(&format!("\nWrite in the sender's voice: {}\n", voice.trim()));
    }
    prompt
}

fn user_prompt(request: &DraftRequest) -> String {
    let recipient = request
        .recipient_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .map(|name| format!(" to {}", name.trim()))
        .unwrap_or_default();

    format!(
        "Write a follow-up email{} for this original email:\n\n\
         Subject: {}\n\
         Body: {}\n\n\
         Return ONLY the follow-up email in this exact format:\n\
         SUBJECT: [follow-up subject line]\n\
         BODY: [follow-up email body]\n",
        recipient, request.subject, request.body
    )
}

/// Extracts the subject line and the multi-line body from a model reply.
pub fn parse_draft(content: &str) -> Result<Draft, DraftError> {
    let mut subject = String::new();
    let mut body_lines: Vec<&str> = Vec::new();
    let mut in_body = false;

    for line in content.trim().lines() {
        if let Some(rest) = line.strip_prefix("SUBJECT:") {
            subject = rest.trim().to_string();
            in_body = false;
        } else if let Some(rest) = line.strip_prefix("BODY:") {
            body_lines.clear();
            body_lines.push(rest.trim());
            in_body = true;
        } else if in_body {
            body_lines.push(line);
        }
    }

    let body = body_lines.join("\n").trim().to_string();
    if subject.is_empty() || body.is_empty() {
        return Err(DraftError::Parse(
            "response is missing a SUBJECT or BODY section".to_string(),
        ));
    }

    Ok(Draft { subject, body })
}

#[async_trait]
impl DraftGenerator for OpenAiDraftGenerator {
    async fn generate(&self, request: &DraftRequest) -> Result<Draft, DraftError> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt(request) },
                { "role": "user", "content": user_prompt(request) },
            ],
            "temperature": 0.7,
            "max_tokens": 500,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DraftError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DraftError::Upstream {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| DraftError::Parse(e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| DraftError::Parse("completion has no content".to_string()))?;

        parse_draft(&content)
    }
}
