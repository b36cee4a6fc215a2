use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use epicrag_auth::{AssertionSigner, AuthClient, TokenCache};
use epicrag_fhir::{FhirFetcher, ResourceNormalizer};
use epicrag_index::{
    Indexer, JsonVectorStore, OpenAiChat, OpenAiClient, OpenAiEmbeddings, RetrievalQa,
};

use epicrag_cli::config::AppConfig;

pub fn token_cache(cfg: &AppConfig) -> Result<Arc<TokenCache>> {
    let credentials = cfg.credentials().map_err(|e| anyhow!(e))?;
    let signer = AssertionSigner::new(Arc::new(credentials))
        .with_lifetime_secs(cfg.epic.assertion_lifetime_secs);
    let client =
        AuthClient::new(signer, cfg.retry_policy()).context("failed to create token client")?;
    Ok(Arc::new(TokenCache::with_margin(
        client,
        Duration::from_secs(cfg.epic.token_margin_secs),
    )))
}

pub fn fetcher(cfg: &AppConfig, tokens: Arc<TokenCache>) -> Result<FhirFetcher> {
    FhirFetcher::new(&cfg.epic.base_url, tokens, cfg.fetcher_config())
        .context("failed to create FHIR client")
}

pub async fn store(cfg: &AppConfig) -> Result<Arc<JsonVectorStore>> {
    let store = JsonVectorStore::open(&cfg.store.path, &cfg.store.collection)
        .await
        .with_context(|| format!("failed to open vector store {}", cfg.store.path.display()))?;
    Ok(Arc::new(store))
}

fn openai(cfg: &AppConfig) -> Result<OpenAiClient> {
    let api_key = cfg.openai_api_key().map_err(|e| anyhow!(e))?;
    OpenAiClient::new(&cfg.openai.base_url, api_key, cfg.retry_policy())
        .context("failed to create OpenAI client")
}

pub fn embeddings(cfg: &AppConfig) -> Result<Arc<OpenAiEmbeddings>> {
    Ok(Arc::new(
        OpenAiEmbeddings::new(openai(cfg)?)
            .with_model(&cfg.openai.embedding_model)
            .with_batch_size(cfg.openai.batch_size),
    ))
}

pub async fn indexer(cfg: &AppConfig) -> Result<Indexer> {
    let normalizer = ResourceNormalizer::new().with_max_observations(cfg.fetch.max_observations);
    Ok(Indexer::new(embeddings(cfg)?, store(cfg).await?).with_normalizer(normalizer))
}

pub async fn retrieval_qa(cfg: &AppConfig) -> Result<RetrievalQa> {
    let chat = OpenAiChat::new(openai(cfg)?)
        .with_model(&cfg.openai.chat_model)
        .with_temperature(cfg.openai.temperature)
        .with_max_tokens(cfg.openai.max_tokens);
    Ok(
        RetrievalQa::new(embeddings(cfg)?, store(cfg).await?, Arc::new(chat))
            .with_top_k(cfg.openai.top_k)
            .with_history_exchanges(cfg.openai.history_exchanges),
    )
}
