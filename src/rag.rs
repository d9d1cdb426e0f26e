//! Query-to-answer pipeline: search, assemble context, hand the
//! conversation to a completion backend.
//!
//! Every failure below this point (embedding, search, lookup) is recovered
//! into the returned [`RagContext`], so callers only ever inspect
//! `success` / `status` / `error`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::Config;
use crate::context::{build_context, ContextOptions, NO_PASSAGES};
use crate::models::{RagContext, SearchFilters};
use crate::search::VectorSearchEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Text generation capability. Consumes role/content messages, the first
/// of which carries the retrieved context.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;
}

/// Put the context ahead of the conversation as a system message.
pub fn compose_messages(context: &RagContext, history: &[ChatMessage]) -> Vec<ChatMessage> {
    let system = if context.success && !context.text.is_empty() {
        context.text.clone()
    } else {
        format!(
            "You are a medical reference assistant. {} Say that the offline knowledge base \
             has nothing on this topic rather than guessing.",
            NO_PASSAGES
        )
    };

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(system));
    messages.extend(history.iter().cloned());
    messages
}

#[derive(Debug, Clone, PartialEq)]
pub struct RagSettings {
    pub limit: usize,
    pub threshold: f32,
    pub max_context_length: usize,
    pub options: ContextOptions,
}

impl RagSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limit: config.retrieval.max_results,
            threshold: config.retrieval.similarity_threshold,
            max_context_length: config.context.max_context_length,
            options: ContextOptions::from_config(config),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub text: String,
    pub context: RagContext,
}

pub struct RagPipeline {
    engine: Arc<VectorSearchEngine>,
    settings: RagSettings,
}

impl RagPipeline {
    pub fn new(engine: Arc<VectorSearchEngine>, settings: RagSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> &RagSettings {
        &self.settings
    }

    /// Search and assemble the context for `query`.
    pub async fn retrieve(&self, query: &str, filters: &SearchFilters) -> RagContext {
        let results = match self
            .engine
            .search(query, self.settings.limit, self.settings.threshold, filters)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, "retrieval failed");
                return RagContext::failed(e.to_string());
            }
        };

        build_context(
            self.engine.store().as_ref(),
            query,
            &results,
            self.settings.max_context_length,
            &self.settings.options,
        )
        .await
    }

    /// Retrieve context for `query`, then ask `backend` to answer it in
    /// the flow of `history`.
    pub async fn answer(
        &self,
        backend: &dyn CompletionBackend,
        query: &str,
        history: &[ChatMessage],
    ) -> anyhow::Result<RagAnswer> {
        let context = self.retrieve(query, &SearchFilters::default()).await;

        let mut conversation = history.to_vec();
        conversation.push(ChatMessage::user(query));
        let messages = compose_messages(&context, &conversation);

        let text = backend.complete(&messages).await?;
        Ok(RagAnswer { text, context })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContextStatus;

    fn answered(text: &str) -> RagContext {
        RagContext {
            text: text.to_string(),
            sources: Vec::new(),
            success: true,
            error: None,
            status: ContextStatus::Answered,
            truncated: false,
        }
    }

    #[test]
    fn context_goes_first_as_system_message() {
        let history = vec![
            ChatMessage::user("What is HbA1c?"),
            ChatMessage::assistant("A marker of average glucose."),
            ChatMessage::user("What is a normal value?"),
        ];
        let messages = compose_messages(&answered("[1] Below 5.7%."), &history);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], ChatMessage::system("[1] Below 5.7%."));
        assert_eq!(&messages[1..], &history[..]);
    }

    #[test]
    fn failed_context_still_gets_a_system_message() {
        let messages = compose_messages(&RagContext::failed("search failed"), &[ChatMessage::user("q")]);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains(NO_PASSAGES));
        assert_eq!(messages[1], ChatMessage::user("q"));
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
