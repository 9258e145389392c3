//! Search index adapter.
//!
//! Thin JSON-over-HTTP client for the message index. The relational row
//! is authoritative; every caller treats failures here as best-effort
//! and logs them for out-of-band reindexing.

use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use reqwest::StatusCode;
use serde_json::json;
use tracing::{info, warn};

use crate::model::{search_doc_id, MessageDocument};

/// Name of the message index.
const INDEX_NAME: &str = "messages";
/// Outbound HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the search index.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("search index returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Client for the full-text message index.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    client: reqwest::Client,
    base_url: String,
}

impl SearchIndex {
    /// Build a client without probing the server. Used by [`connect`]
    /// and by tests pointing at a mock server.
    ///
    /// [`connect`]: SearchIndex::connect
    pub fn new(base_url: impl Into<String>) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Connect and verify reachability; retried 10 times, 2 s apart.
    ///
    /// The caller treats failure as a degraded start, not a fatal one.
    pub async fn connect(base_url: &str) -> Result<Self, SearchError> {
        let index = Self::new(base_url)?;

        (|| async { index.client.get(&index.base_url).send().await?.error_for_status() })
            .retry(
                ConstantBuilder::default()
                    .with_delay(Duration::from_secs(2))
                    .with_max_times(9),
            )
            .notify(|err: &reqwest::Error, _| {
                warn!(error = %err, "failed to reach search index, retrying in 2s");
            })
            .await?;

        info!(url = %index.base_url, "connected to search index");
        Ok(index)
    }

    /// Create the message index if it does not exist yet.
    pub async fn ensure_index(&self) -> Result<(), SearchError> {
        let url = format!("{}/{}", self.base_url, INDEX_NAME);

        let head = self.client.head(&url).send().await?;
        if head.status().is_success() {
            return Ok(());
        }
        if head.status() != StatusCode::NOT_FOUND {
            return Err(SearchError::Api {
                status: head.status(),
                body: String::new(),
            });
        }

        let response = self.client.put(&url).json(&index_mapping()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Api { status, body });
        }

        info!(index = INDEX_NAME, "created search index");
        Ok(())
    }

    /// Upsert a message document by its composite id.
    pub async fn index_message(&self, doc: &MessageDocument) -> Result<(), SearchError> {
        let url = format!(
            "{}/{}/_doc/{}?refresh=true",
            self.base_url,
            INDEX_NAME,
            doc.doc_id()
        );

        let response = self.client.put(&url).json(doc).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Api { status, body });
        }
        Ok(())
    }

    /// Partially update a document's body.
    pub async fn update_message(
        &self,
        token: &str,
        chat_number: i64,
        number: i64,
        body: &str,
    ) -> Result<(), SearchError> {
        let url = format!(
            "{}/{}/_update/{}?refresh=true",
            self.base_url,
            INDEX_NAME,
            search_doc_id(token, chat_number, number)
        );

        let response = self
            .client
            .post(&url)
            .json(&json!({ "doc": { "body": body } }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SearchError::Api { status, body: text });
        }
        Ok(())
    }
}

/// Index mapping: keyword identity fields, integer numerics, and an
/// edge-ngram analyzed body for prefix matching, with exact and keyword
/// subfields for phrase and term queries.
fn index_mapping() -> serde_json::Value {
    json!({
        "settings": {
            "analysis": {
                "filter": {
                    "body_edge_ngram": {
                        "type": "edge_ngram",
                        "min_gram": 3,
                        "max_gram": 20
                    }
                },
                "analyzer": {
                    "body_prefix": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "body_edge_ngram"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "id": { "type": "integer" },
                "token": { "type": "keyword" },
                "chat_number": { "type": "integer" },
                "number": { "type": "integer" },
                "body": {
                    "type": "text",
                    "analyzer": "body_prefix",
                    "search_analyzer": "standard",
                    "fields": {
                        "exact": { "type": "text", "analyzer": "standard" },
                        "keyword": { "type": "keyword", "ignore_above": 256 }
                    }
                },
                "sender_id": { "type": "integer" },
                "sender_name": { "type": "keyword" },
                "created_at": { "type": "date" }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_doc() -> MessageDocument {
        MessageDocument {
            id: 42,
            token: "abc".into(),
            chat_number: 1,
            number: 1,
            body: "hello".into(),
            sender_id: 7,
            sender_name: Some("alice".into()),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn ensure_index_skips_create_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        // No PUT expectation mounted; an unexpected PUT would 404 and fail.

        let index = SearchIndex::new(server.uri()).unwrap();
        index.ensure_index().await.unwrap();
    }

    #[tokio::test]
    async fn ensure_index_creates_with_mapping_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/messages"))
            .and(body_json(index_mapping()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let index = SearchIndex::new(server.uri()).unwrap();
        index.ensure_index().await.unwrap();
    }

    #[tokio::test]
    async fn index_message_upserts_by_composite_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/messages/_doc/abc:1:1"))
            .and(query_param("refresh", "true"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let index = SearchIndex::new(server.uri()).unwrap();
        index.index_message(&test_doc()).await.unwrap();
    }

    #[tokio::test]
    async fn update_message_sends_partial_doc() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages/_update/abc:1:2"))
            .and(query_param("refresh", "true"))
            .and(body_json(json!({ "doc": { "body": "edited" } })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let index = SearchIndex::new(server.uri()).unwrap();
        index.update_message("abc", 1, 2, "edited").await.unwrap();
    }

    #[tokio::test]
    async fn api_errors_surface_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/messages/_doc/abc:1:1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let index = SearchIndex::new(server.uri()).unwrap();
        let err = index.index_message(&test_doc()).await.unwrap_err();
        match err {
            SearchError::Api { status, body } => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
