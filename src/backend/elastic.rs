//! Elasticsearch backend over plain HTTP.
//!
//! Uses the same endpoints the evaluation store actually exposes:
//! `_cluster/health` for the availability gate, index create/delete with
//! explicit mappings, `_bulk` + `_refresh` for ingestion, and a
//! `query_string` search filtered by run tag. Security is assumed off; this
//! talks to a disposable single-node cluster, never a production one.

use super::{
    BackendError, Document, FieldPlan, FieldType, IngestReport, SearchBackend, CASE_ID_FIELD,
    RUN_TAG_FIELD,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on documents per evaluation run. Matches the search window
/// below: queries are scoped to one run tag, so staying under this at
/// ingestion guarantees a single search request returns the complete match
/// set rather than a silently truncated one.
pub const MAX_DOCS_PER_RUN: usize = 10_000;

pub struct ElasticBackend {
    client: Client,
    base_url: String,
    index: String,
}

impl ElasticBackend {
    pub fn new(base_url: &str, index: &str) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// Read the current mapping back as a field plan, if the index exists.
    async fn existing_plan(&self) -> Result<Option<FieldPlan>, BackendError> {
        let resp = self
            .client
            .get(self.url(&format!("{}/_mapping", self.index)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = resp.json().await?;
        let props = body
            .get(&self.index)
            .and_then(|i| i.pointer("/mappings/properties"))
            .and_then(Value::as_object);

        let mut plan = FieldPlan::default();
        if let Some(props) = props {
            for (name, spec) in props {
                let ty = match spec.get("type").and_then(Value::as_str) {
                    Some("wildcard") => FieldType::Pattern,
                    Some("date") => FieldType::Date,
                    _ => FieldType::Keyword,
                };
                plan.fields.insert(name.clone(), ty);
            }
        }
        Ok(Some(plan))
    }

    async fn create_index(&self, plan: &FieldPlan) -> Result<(), BackendError> {
        let properties: serde_json::Map<String, Value> = plan
            .fields
            .iter()
            .map(|(name, ty)| {
                let es_type = match ty {
                    FieldType::Keyword => "keyword",
                    FieldType::Pattern => "wildcard",
                    FieldType::Date => "date",
                };
                (name.clone(), json!({ "type": es_type }))
            })
            .collect();

        let resp = self
            .client
            .put(self.url(&self.index))
            .json(&json!({ "mappings": { "properties": properties } }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Protocol(format!(
                "index create failed: {}",
                resp.text().await.unwrap_or_default()
            )));
        }
        info!(index = %self.index, fields = plan.fields.len(), "Created evaluation index");
        Ok(())
    }
}

#[async_trait]
impl SearchBackend for ElasticBackend {
    async fn health_check(&self, timeout: Duration) -> bool {
        let resp = self
            .client
            .get(self.url("_cluster/health"))
            .timeout(timeout)
            .send()
            .await;
        match resp {
            Ok(resp) if resp.status().is_success() => {
                let healthy = match resp.json::<Value>().await {
                    Ok(body) => matches!(
                        body.get("status").and_then(Value::as_str),
                        Some("green") | Some("yellow")
                    ),
                    Err(_) => false,
                };
                debug!(healthy, "Cluster health probe");
                healthy
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "Cluster health probe rejected");
                false
            }
            Err(e) => {
                debug!(error = %e, "Cluster health probe failed");
                false
            }
        }
    }

    async fn provision(&self, plan: &FieldPlan) -> Result<(), BackendError> {
        match self.existing_plan().await? {
            Some(existing) if plan.compatible_with(&existing) => {
                debug!(index = %self.index, "Existing schema compatible, reusing");
                Ok(())
            }
            Some(_) => {
                // Disposable store: drop and recreate on mismatch.
                warn!(index = %self.index, "Existing schema incompatible, recreating");
                self.client
                    .delete(self.url(&self.index))
                    .send()
                    .await?
                    .error_for_status()
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                self.create_index(plan).await
            }
            None => self.create_index(plan).await,
        }
    }

    async fn ingest(&self, docs: &[Document], run_tag: &str) -> Result<IngestReport, BackendError> {
        if docs.is_empty() {
            return Ok(IngestReport::default());
        }
        if docs.len() > MAX_DOCS_PER_RUN {
            return Err(BackendError::Protocol(format!(
                "batch has {} test documents, exceeding the per-run limit of {}",
                docs.len(),
                MAX_DOCS_PER_RUN
            )));
        }

        let mut body = String::new();
        for doc in docs {
            // _id is run-scoped so reruns of the same batch never collide.
            let action = json!({ "index": { "_id": format!("{run_tag}:{}", doc.case_id) } });
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&Value::Object(doc.body.clone()).to_string());
            body.push('\n');
        }

        let resp = self
            .client
            .post(self.url(&format!("{}/_bulk", self.index)))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "bulk ingest rejected: {}",
                resp.status()
            )));
        }

        let mut report = IngestReport::default();
        let bulk: Value = resp.json().await?;
        if let Some(items) = bulk.get("items").and_then(Value::as_array) {
            for (item, doc) in items.iter().zip(docs) {
                if let Some(err) = item.pointer("/index/error") {
                    report.failed.push((doc.case_id.clone(), err.to_string()));
                }
            }
        }

        // Refresh barrier: queries issued after this observe the new docs.
        self.client
            .post(self.url(&format!("{}/_refresh", self.index)))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        debug!(
            docs = docs.len(),
            failed = report.failed.len(),
            "Ingested test payloads"
        );
        Ok(report)
    }

    async fn search(&self, query: &str, run_tag: &str) -> Result<HashSet<String>, BackendError> {
        let mut tag_filter = serde_json::Map::new();
        tag_filter.insert(RUN_TAG_FIELD.to_string(), json!(run_tag));
        let body = json!({
            "size": MAX_DOCS_PER_RUN,
            "query": {
                "bool": {
                    "must": { "query_string": { "query": query, "default_operator": "AND" } },
                    "filter": { "term": tag_filter }
                }
            }
        });

        let resp = self
            .client
            .post(self.url(&format!("{}/_search", self.index)))
            .json(&body)
            .send()
            .await?;

        if resp.status() == StatusCode::BAD_REQUEST {
            let detail: Value = resp.json().await.unwrap_or_default();
            let reason = detail
                .pointer("/error/root_cause/0/reason")
                .and_then(Value::as_str)
                .unwrap_or("query rejected by backend")
                .to_string();
            return Err(BackendError::MalformedQuery(reason));
        }
        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "search failed: {}",
                resp.status()
            )));
        }

        let body: Value = resp.json().await?;
        let mut matched = HashSet::new();
        if let Some(hits) = body.pointer("/hits/hits").and_then(Value::as_array) {
            for hit in hits {
                if let Some(case_id) = hit
                    .pointer(&format!("/_source/{}", CASE_ID_FIELD))
                    .and_then(Value::as_str)
                {
                    matched.insert(case_id.to_string());
                }
            }
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_batch_is_rejected_before_any_request() {
        // Unroutable address: the limit check must trip before any I/O.
        let backend = ElasticBackend::new("http://127.0.0.1:1", "eval").unwrap();
        let docs: Vec<Document> = (0..=MAX_DOCS_PER_RUN)
            .map(|i| Document {
                case_id: format!("case_{i}"),
                body: serde_json::Map::new(),
            })
            .collect();

        let err = backend.ingest(&docs, "tag").await.unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
        assert!(err.to_string().contains("per-run limit"));
    }
}
