use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use epicrag_auth::RetryPolicy;
use epicrag_fhir::PatientRecord;
use epicrag_index::{
    ChatMessage, ChatModel, EmbeddingProvider, IndexError, IndexResult, Indexer, JsonVectorStore,
    OpenAiChat, OpenAiClient, OpenAiEmbeddings, QueryFilter, RetrievalQa, VectorStore,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const VOCABULARY: [&str; 4] = ["asthma", "weight", "lisinopril", "patient"];

/// Embeds text as keyword counts over a tiny vocabulary.
struct KeywordEmbeddings;

#[async_trait]
impl EmbeddingProvider for KeywordEmbeddings {
    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let lower = t.to_lowercase();
                let mut v: Vec<f32> = VOCABULARY
                    .iter()
                    .map(|w| lower.matches(w).count() as f32)
                    .collect();
                v.push(0.01);
                v
            })
            .collect())
    }

    fn model(&self) -> &str {
        "keywords"
    }
}

/// Produces vectors of a different dimension than [`KeywordEmbeddings`].
struct WideEmbeddings;

#[async_trait]
impl EmbeddingProvider for WideEmbeddings {
    async fn embed(&self, texts: &[String]) -> IndexResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0; 8]).collect())
    }

    fn model(&self) -> &str {
        "wide"
    }
}

/// Echoes the number of messages it received.
struct EchoChat;

#[async_trait]
impl ChatModel for EchoChat {
    async fn complete(&self, messages: &[ChatMessage]) -> IndexResult<String> {
        Ok(format!("{} messages", messages.len()))
    }

    fn model(&self) -> &str {
        "echo"
    }
}

fn record(patient_id: &str) -> PatientRecord {
    PatientRecord {
        patient_id: patient_id.to_string(),
        patient: json!({"resourceType": "Patient", "id": patient_id, "name": [{"text": "Test Patient"}]}),
        conditions: vec![json!({
            "resourceType": "Condition",
            "id": "c1",
            "code": {"text": "Asthma"},
            "clinicalStatus": {"text": "Active"}
        })],
        medications: vec![json!({
            "resourceType": "MedicationRequest",
            "id": "m1",
            "status": "active",
            "medicationCodeableConcept": {"text": "Lisinopril 10 MG"}
        })],
        observations: vec![json!({
            "resourceType": "Observation",
            "id": "o1",
            "code": {"text": "Body weight"},
            "valueQuantity": {"value": 80, "unit": "kg"}
        })],
    }
}

fn openai(server: &MockServer) -> OpenAiClient {
    let retry = RetryPolicy::new()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(10));
    OpenAiClient::new(&format!("{}/v1", server.uri()), "sk-test", retry).unwrap()
}

#[tokio::test]
async fn index_persists_and_reindex_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store/vector_store.json");

    let store = Arc::new(JsonVectorStore::open(&path, "patient_records").await.unwrap());
    let indexer = Indexer::new(Arc::new(KeywordEmbeddings), store.clone());

    let report = indexer.index_patient(&record("P1")).await.unwrap();
    assert_eq!(report.indexed, 4);
    assert_eq!(report.replaced, 0);
    assert_eq!(report.by_type.get("Condition"), Some(&1));

    indexer.index_patient(&record("P2")).await.unwrap();
    let report = indexer.index_patient(&record("P1")).await.unwrap();
    assert_eq!(report.replaced, 4);
    assert_eq!(store.count().await.unwrap(), 8);

    let reopened = JsonVectorStore::open(&path, "patient_records").await.unwrap();
    let stats = reopened.stats().await.unwrap();
    assert_eq!(stats.total_documents, 8);
    assert_eq!(stats.patients, 2);
    assert_eq!(stats.collection_name, "patient_records");
}

#[tokio::test]
async fn failed_reindex_keeps_previous_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vector_store.json");
    let store = Arc::new(JsonVectorStore::open(&path, "patient_records").await.unwrap());

    let indexer = Indexer::new(Arc::new(KeywordEmbeddings), store.clone());
    indexer.index_patient(&record("P1")).await.unwrap();
    indexer.index_patient(&record("P2")).await.unwrap();

    let err = Indexer::new(Arc::new(WideEmbeddings), store.clone())
        .index_patient(&record("P1"))
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::DimensionMismatch { expected: 5, actual: 8 }));
    assert_eq!(store.count().await.unwrap(), 8);

    let reopened = JsonVectorStore::open(&path, "patient_records").await.unwrap();
    assert_eq!(reopened.stats().await.unwrap().total_documents, 8);
    let hits = reopened
        .query(&[1.0, 0.0, 0.0, 0.0, 0.01], 5, &QueryFilter::patient("P1"))
        .await
        .unwrap();
    assert_eq!(hits.len(), 4);
}

#[tokio::test]
async fn store_rejects_other_collection() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vector_store.json");
    let store = JsonVectorStore::open(&path, "patient_records").await.unwrap();
    let indexer = Indexer::new(Arc::new(KeywordEmbeddings), Arc::new(store));
    indexer.index_patient(&record("P1")).await.unwrap();

    let err = JsonVectorStore::open(&path, "other").await.err().unwrap();
    assert!(matches!(err, IndexError::Store { .. }));
}

#[tokio::test]
async fn retrieval_is_scoped_to_patient() {
    let store: Arc<dyn VectorStore> = Arc::new(JsonVectorStore::in_memory("patient_records"));
    let embeddings = Arc::new(KeywordEmbeddings);
    let indexer = Indexer::new(embeddings.clone(), store.clone());
    indexer.index_patient(&record("P1")).await.unwrap();
    indexer.index_patient(&record("P2")).await.unwrap();

    let qa = RetrievalQa::new(embeddings, store, Arc::new(EchoChat));
    let hits = qa.retrieve("Is there asthma?", "P2", 2).await.unwrap();

    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.metadata.patient_id == "P2"));
    assert_eq!(hits[0].id, "P2_condition_c1");
    assert!(hits[0].score >= hits[1].score);
}

#[tokio::test]
async fn ask_sends_context_history_and_question() {
    let store: Arc<dyn VectorStore> = Arc::new(JsonVectorStore::in_memory("patient_records"));
    let embeddings = Arc::new(KeywordEmbeddings);
    Indexer::new(embeddings.clone(), store.clone())
        .index_patient(&record("P1"))
        .await
        .unwrap();

    let history: Vec<ChatMessage> = (0..8)
        .flat_map(|i| [ChatMessage::user(format!("q{i}")), ChatMessage::assistant(format!("a{i}"))])
        .collect();
    let qa = RetrievalQa::new(embeddings, store, Arc::new(EchoChat)).with_top_k(2);
    let answer = qa.ask("What is the weight?", "P1", &history).await.unwrap();

    // system + 5 exchanges + question
    assert_eq!(answer.answer, "12 messages");
    assert_eq!(answer.sources.len(), 2);
    assert!(answer.context.starts_with("[Observation]\nObservation: Body weight"));
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let store: Arc<dyn VectorStore> = Arc::new(JsonVectorStore::in_memory("patient_records"));
    let qa = RetrievalQa::new(Arc::new(KeywordEmbeddings), store, Arc::new(EchoChat));
    let err = qa.ask("   ", "P1", &[]).await.unwrap_err();
    assert!(matches!(err, IndexError::InvalidInput { .. }));
}

#[tokio::test]
async fn openai_embeddings_are_batched_and_ordered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "text-embedding-3-small", "input": ["a", "b"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "object": "list",
            "data": [
                {"object": "embedding", "index": 1, "embedding": [0.0, 1.0]},
                {"object": "embedding", "index": 0, "embedding": [1.0, 0.0]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(body_partial_json(json!({"input": ["c"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.5, 0.5]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let embeddings = OpenAiEmbeddings::new(openai(&server)).with_batch_size(2);
    let texts: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    let vectors = embeddings.embed(&texts).await.unwrap();

    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]]);
}

#[tokio::test]
async fn openai_overload_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [1.0]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let embeddings = OpenAiEmbeddings::new(openai(&server));
    assert_eq!(embeddings.embed_one("hello").await.unwrap(), vec![1.0]);
}

#[tokio::test]
async fn openai_chat_request_and_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o-mini", "max_tokens": 500})))
        .and(body_string_contains("\"role\":\"system\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "The patient has asthma."},
                "finish_reason": "stop"
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let chat = OpenAiChat::new(openai(&server));
    let reply = chat
        .complete(&[ChatMessage::system("ctx"), ChatMessage::user("Asthma?")])
        .await
        .unwrap();
    assert_eq!(reply, "The patient has asthma.");

    let bad_key = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
        .expect(1)
        .mount(&bad_key)
        .await;
    let err = OpenAiChat::new(openai(&bad_key))
        .complete(&[ChatMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Api { status: 401, .. }));
}

#[tokio::test]
async fn openai_outage_surfaces_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let err = OpenAiChat::new(openai(&server))
        .complete(&[ChatMessage::user("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Unavailable { attempts: 3, .. }));
    assert!(err.is_retryable());
}
