//! Retrieval-augmented question answering over one patient's index.

use std::sync::Arc;

use serde::Serialize;

use crate::IndexResult;
use crate::chat::{ChatMessage, ChatModel};
use crate::embeddings::EmbeddingProvider;
use crate::error::IndexError;
use crate::store::{QueryFilter, ScoredChunk, VectorStore};

/// Default number of chunks retrieved per question.
pub const DEFAULT_TOP_K: usize = 5;

/// Default number of prior question/answer exchanges sent to the model.
pub const DEFAULT_HISTORY_EXCHANGES: usize = 5;

/// A generated answer and the chunks it was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    /// The context block given to the model.
    pub context: String,
    pub sources: Vec<ScoredChunk>,
}

/// Answers questions about one patient from that patient's indexed chunks.
///
/// Each question is embedded, the closest chunks of the patient are
/// retrieved from the store, and the chat model answers from that context
/// only. Prior exchanges are passed in by the caller, trimmed to
/// `history_exchanges`.
pub struct RetrievalQa {
    embeddings: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    chat: Arc<dyn ChatModel>,
    top_k: usize,
    history_exchanges: usize,
}

impl RetrievalQa {
    /// Creates a QA chain with [`DEFAULT_TOP_K`] and [`DEFAULT_HISTORY_EXCHANGES`].
    #[must_use]
    pub fn new(
        embeddings: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        chat: Arc<dyn ChatModel>,
    ) -> Self {
        Self {
            embeddings,
            store,
            chat,
            top_k: DEFAULT_TOP_K,
            history_exchanges: DEFAULT_HISTORY_EXCHANGES,
        }
    }

    /// Number of chunks retrieved per question, at least 1.
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Number of prior exchanges sent with each question. 0 sends none.
    #[must_use]
    pub fn with_history_exchanges(mut self, exchanges: usize) -> Self {
        self.history_exchanges = exchanges;
        self
    }

    /// Returns the `n` chunks of `patient_id` most relevant to `question`.
    ///
    /// # Errors
    /// Fails on an empty question or an embedding/store failure.
    pub async fn retrieve(
        &self,
        question: &str,
        patient_id: &str,
        n: usize,
    ) -> IndexResult<Vec<ScoredChunk>> {
        if question.trim().is_empty() {
            return Err(IndexError::invalid_input("question is empty"));
        }
        let embedding = self.embeddings.embed_one(question).await?;
        let hits = self
            .store
            .query(&embedding, n, &QueryFilter::patient(patient_id))
            .await?;
        tracing::debug!(patient_id, hits = hits.len(), "Retrieved context");
        Ok(hits)
    }

    /// Answers `question` about `patient_id`, continuing `history`.
    ///
    /// Only the most recent exchanges of `history` are sent.
    ///
    /// # Errors
    /// Fails on an empty question or any embedding, store or chat failure.
    pub async fn ask(
        &self,
        question: &str,
        patient_id: &str,
        history: &[ChatMessage],
    ) -> IndexResult<Answer> {
        let sources = self.retrieve(question, patient_id, self.top_k).await?;
        if sources.is_empty() {
            tracing::warn!(patient_id, "No indexed records for patient");
        }
        let context = build_context(&sources);

        let recent = recent_history(history, self.history_exchanges);
        let mut messages = Vec::with_capacity(recent.len() + 2);
        messages.push(ChatMessage::system(system_prompt(&context)));
        messages.extend_from_slice(recent);
        messages.push(ChatMessage::user(question));

        let answer = self.chat.complete(&messages).await?;
        tracing::info!(
            patient_id,
            sources = sources.len(),
            model = self.chat.model(),
            "Answered question"
        );
        Ok(Answer {
            answer,
            context,
            sources,
        })
    }
}

/// Renders chunks as `[{resource_type}]\n{text}\n`, separated by blank lines.
#[must_use]
pub fn build_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("[{}]\n{}\n", c.metadata.resource_type, c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System instructions wrapping the retrieved context.
#[must_use]
pub fn system_prompt(context: &str) -> String {
    format!(
        "You are a helpful medical assistant analyzing patient health records.\n\n\
         Use the following patient information to answer questions accurately:\n\n\
         {context}\n\n\
         Guidelines:\n\
         - Answer based only on the provided patient data.\n\
         - If the answer is not in the data, respond with \"I don't know based on the provided information.\"\n\
         - Keep answers concise and relevant.\n\
         - Use medical terminology appropriately but explain when needed.\n\
         - Cite which type of record you're referencing (e.g., \"According to the patient's conditions...\")."
    )
}

/// The tail of `history` holding at most `exchanges` user/assistant pairs.
fn recent_history(history: &[ChatMessage], exchanges: usize) -> &[ChatMessage] {
    let keep = exchanges.saturating_mul(2).min(history.len());
    &history[history.len() - keep..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use epicrag_fhir::ChunkMetadata;

    fn hit(kind: &str, text: &str) -> ScoredChunk {
        ScoredChunk {
            id: "x".to_string(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                patient_id: "P1".to_string(),
                resource_type: kind.to_string(),
                resource_id: "x".to_string(),
                date: None,
            },
            score: 0.9,
        }
    }

    #[test]
    fn test_build_context() {
        let context = build_context(&[
            hit("Condition", "Condition: Asthma"),
            hit("Observation", "Observation: Weight"),
        ]);
        assert_eq!(
            context,
            "[Condition]\nCondition: Asthma\n\n\n[Observation]\nObservation: Weight\n"
        );
        assert_eq!(build_context(&[]), "");
    }

    #[test]
    fn test_recent_history() {
        let history: Vec<ChatMessage> = (0..14)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("q{i}"))
                } else {
                    ChatMessage::assistant(format!("a{i}"))
                }
            })
            .collect();

        let recent = recent_history(&history, 5);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "q4");
        assert_eq!(recent_history(&history[..3], 5).len(), 3);
        assert!(recent_history(&history, 0).is_empty());
    }

    #[test]
    fn test_system_prompt_embeds_context() {
        let prompt = system_prompt("[Condition]\nCondition: Asthma\n");
        assert!(prompt.contains("Condition: Asthma"));
        assert!(prompt.starts_with("You are a helpful medical assistant"));
    }
}
