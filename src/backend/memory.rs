//! In-process search backend.
//!
//! Evaluates the parsed query AST against ingested documents, honoring the
//! provisioned field types: a wildcard pattern against a field provisioned
//! as exact-match (keyword) is taken literally and will not glob, which is
//! exactly the systematic-false-negative failure a mis-provisioned live
//! index produces. Used by tests and by `--offline` runs where no cluster
//! is reachable.

use super::{
    BackendError, Document, FieldPlan, FieldType, IngestReport, SearchBackend, RUN_TAG_FIELD,
};
use crate::query::{self, QueryAst};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    plan: Option<FieldPlan>,
    /// (run_tag, case_id, flattened body)
    docs: Vec<(String, String, Vec<(String, String)>)>,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    unavailable: AtomicBool,
    /// Field types forced at provisioning time, shadowing the requested
    /// plan. Lets tests reproduce a backend whose mappings disagree with
    /// what the harness asked for.
    overrides: HashMap<String, FieldType>,
    fail_ingest: HashSet<String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend: health checks fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Force `field` to be provisioned with `ty` regardless of the plan.
    pub fn with_field_override(mut self, field: &str, ty: FieldType) -> Self {
        self.overrides.insert(field.to_string(), ty);
        self
    }

    /// Reject ingestion of the named case id.
    pub fn with_ingest_failure(mut self, case_id: &str) -> Self {
        self.fail_ingest.insert(case_id.to_string());
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plan-aware term evaluation. Wildcards only glob on pattern-capable
    /// fields; on keyword fields the `*` is just a character that never
    /// appears in real values.
    fn eval(ast: &QueryAst, flat: &[(String, String)], plan: &FieldPlan) -> bool {
        match ast {
            QueryAst::And(items) => items.iter().all(|i| Self::eval(i, flat, plan)),
            QueryAst::Or(items) => items.iter().any(|i| Self::eval(i, flat, plan)),
            QueryAst::Not(inner) => !Self::eval(inner, flat, plan),
            QueryAst::Term { field, pattern } => flat.iter().any(|(name, value)| {
                let field_ok = match field {
                    Some(f) => name.eq_ignore_ascii_case(f),
                    None => true,
                };
                if !field_ok {
                    return false;
                }
                let pattern_capable = match field {
                    Some(f) => !matches!(plan.fields.get(f), Some(FieldType::Keyword)),
                    None => true,
                };
                if pattern_capable {
                    query::glob_match(pattern, value)
                } else {
                    pattern.eq_ignore_ascii_case(value)
                }
            }),
        }
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn health_check(&self, _timeout: Duration) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    async fn provision(&self, plan: &FieldPlan) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend down".into()));
        }
        let mut effective = plan.clone();
        for (field, ty) in &self.overrides {
            effective.fields.insert(field.clone(), *ty);
        }

        let mut state = self.lock();
        match &state.plan {
            // Idempotent: a compatible schema is left untouched.
            Some(existing) if effective.compatible_with(existing) => {}
            // Incompatible schema is dropped and recreated, losing its docs.
            Some(_) => {
                state.docs.clear();
                state.plan = Some(effective);
            }
            None => state.plan = Some(effective),
        }
        Ok(())
    }

    async fn ingest(&self, docs: &[Document], run_tag: &str) -> Result<IngestReport, BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend down".into()));
        }
        let mut state = self.lock();
        if state.plan.is_none() {
            return Err(BackendError::Protocol("index not provisioned".into()));
        }

        let mut report = IngestReport::default();
        for doc in docs {
            if self.fail_ingest.contains(&doc.case_id) {
                report
                    .failed
                    .push((doc.case_id.clone(), "simulated ingest failure".into()));
                continue;
            }
            state
                .docs
                .push((run_tag.to_string(), doc.case_id.clone(), query::flatten(&doc.body)));
        }
        Ok(report)
    }

    async fn search(&self, query_str: &str, run_tag: &str) -> Result<HashSet<String>, BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("memory backend down".into()));
        }
        let ast =
            query::parse(query_str).map_err(|e| BackendError::MalformedQuery(e.to_string()))?;

        let state = self.lock();
        let plan = state
            .plan
            .as_ref()
            .ok_or_else(|| BackendError::Protocol("index not provisioned".into()))?;

        Ok(state
            .docs
            .iter()
            .filter(|(tag, _, _)| tag == run_tag)
            .filter(|(_, _, flat)| Self::eval(&ast, flat, plan))
            .map(|(_, case_id, _)| case_id.clone())
            .collect())
    }
}
