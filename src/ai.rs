//! OpenAI-compatible embedding and chat clients, plus the distillation
//! prompts. Everything here is optional at runtime: without `STRATA_LLM_URL`
//! the engine falls back to the offline embedder and extractive distiller.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StrataError;
use crate::index::Embedder;
use crate::store::Page;
use crate::util::{build_qa_pair, truncate_chars};

fn ai_err(msg: impl Into<String>) -> StrataError {
    StrataError::AiBackend(msg.into())
}

const AI_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AiConfig {
    pub llm_url: String,
    pub llm_key: String,
    pub llm_model: String,
    pub embed_url: String,
    pub embed_key: String,
    pub embed_model: String,
    pub client: reqwest::Client,
}

impl AiConfig {
    /// Returns `None` if `STRATA_LLM_URL` is not set.
    pub fn from_env() -> Option<Self> {
        let llm_url = std::env::var("STRATA_LLM_URL").ok()?;
        let llm_key = std::env::var("STRATA_LLM_KEY").unwrap_or_default();
        let llm_model =
            std::env::var("STRATA_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let embed_url = std::env::var("STRATA_EMBED_URL").unwrap_or_else(|_| {
            if llm_url.contains("/chat/completions") {
                llm_url.replace("/chat/completions", "/embeddings")
            } else {
                format!("{}/embeddings", llm_url.trim_end_matches('/'))
            }
        });
        let embed_key = std::env::var("STRATA_EMBED_KEY").unwrap_or_else(|_| llm_key.clone());
        let embed_model = std::env::var("STRATA_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".into());

        let client = reqwest::Client::builder()
            .timeout(AI_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Some(Self { llm_url, llm_key, llm_model, embed_url, embed_key, embed_model, client })
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Send a chat completion request, return the response text.
pub async fn llm_chat(cfg: &AiConfig, system: &str, user: &str) -> Result<String, StrataError> {
    let req = ChatRequest {
        model: cfg.llm_model.clone(),
        messages: vec![
            ChatMessage { role: "system".into(), content: system.into() },
            ChatMessage { role: "user".into(), content: user.into() },
        ],
        temperature: 0.1,
    };

    let mut builder = cfg.client.post(&cfg.llm_url).json(&req);
    if !cfg.llm_key.is_empty() {
        builder = builder.header("Authorization", format!("Bearer {}", cfg.llm_key));
    }

    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("LLM request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(ai_err(format!("LLM returned {status}: {body}")));
    }

    let chat: ChatResponse = resp
        .json()
        .await
        .map_err(|e| ai_err(format!("LLM response parse failed: {e}")))?;
    let content = chat
        .choices
        .first()
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    Ok(content)
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

/// Generate embeddings for one or more texts.
pub async fn get_embeddings(
    cfg: &AiConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, StrataError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let req = EmbedRequest { model: cfg.embed_model.clone(), input: texts.to_vec() };
    let mut builder = cfg.client.post(&cfg.embed_url).json(&req);
    if !cfg.embed_key.is_empty() {
        builder = builder.header("Authorization", format!("Bearer {}", cfg.embed_key));
    }

    let resp = builder
        .send()
        .await
        .map_err(|e| ai_err(format!("embedding request failed: {e}")))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(ai_err(format!("embedding API returned {status}: {body}")));
    }

    let embed_resp: EmbedResponse = resp
        .json()
        .await
        .map_err(|e| ai_err(format!("embedding response parse failed: {e}")))?;

    let embeddings: Vec<Vec<f32>> = embed_resp.data.into_iter().map(|d| d.embedding).collect();
    if embeddings.len() != texts.len() {
        return Err(ai_err(format!(
            "embedding count mismatch: sent {} texts, got {} embeddings",
            texts.len(),
            embeddings.len()
        )));
    }
    Ok(embeddings)
}

#[async_trait]
impl Embedder for AiConfig {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, StrataError> {
        let mut embeddings = get_embeddings(self, &[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| ai_err("embedding API returned no vector"))
    }
}

const SEGMENT_OVERVIEW_SYSTEM: &str = "You summarize conversation excerpts for a \
memory system. Given question/answer pairs from one user's conversations, write \
a single short paragraph describing what the conversation was about: the topics, \
the user's interests and any facts they shared. Write in the third person, in \
the same language as the input. Output only the summary, no preamble.";

const KNOWLEDGE_EXTRACTION_SYSTEM: &str = "You distill durable knowledge about a \
user from conversation excerpts. Given question/answer pairs, write one concise \
statement capturing what should be remembered about this user long-term: stable \
preferences, facts about their life, recurring interests. Ignore transient \
details. Write in the same language as the input. Output only the statement, no \
preamble.";

fn pages_to_transcript(pages: &[Page]) -> String {
    pages
        .iter()
        .map(|p| build_qa_pair(&p.user_input, &p.agent_output))
        .collect()
}

/// Turns clustered pages into summary text: a segment overview when a cluster
/// forms, a knowledge statement when a segment is promoted.
#[async_trait]
pub trait Distiller: Send + Sync {
    async fn segment_overview(&self, pages: &[Page]) -> Result<String, StrataError>;
    async fn knowledge_extraction(&self, pages: &[Page]) -> Result<String, StrataError>;
}

pub struct LlmDistiller {
    cfg: AiConfig,
}

impl LlmDistiller {
    pub fn new(cfg: AiConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl Distiller for LlmDistiller {
    async fn segment_overview(&self, pages: &[Page]) -> Result<String, StrataError> {
        let transcript = pages_to_transcript(pages);
        debug!(pages = pages.len(), "distilling segment overview");
        llm_chat(&self.cfg, SEGMENT_OVERVIEW_SYSTEM, &transcript).await
    }

    async fn knowledge_extraction(&self, pages: &[Page]) -> Result<String, StrataError> {
        let transcript = pages_to_transcript(pages);
        debug!(pages = pages.len(), "distilling knowledge");
        llm_chat(&self.cfg, KNOWLEDGE_EXTRACTION_SYSTEM, &transcript).await
    }
}

/// Offline fallback: the raw transcript, truncated. Deterministic, which the
/// redundancy check depends on in tests.
pub struct ExtractiveDistiller {
    max_chars: usize,
}

impl ExtractiveDistiller {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl Default for ExtractiveDistiller {
    fn default() -> Self {
        Self::new(600)
    }
}

#[async_trait]
impl Distiller for ExtractiveDistiller {
    async fn segment_overview(&self, pages: &[Page]) -> Result<String, StrataError> {
        Ok(truncate_chars(pages_to_transcript(pages).trim(), self.max_chars))
    }

    async fn knowledge_extraction(&self, pages: &[Page]) -> Result<String, StrataError> {
        Ok(truncate_chars(pages_to_transcript(pages).trim(), self.max_chars))
    }
}
