//! Retrieval collaborator: ranked reference documents for generation.
//!
//! `KeywordRetriever` scores documents by the fraction of query terms they
//! contain. Results go through `RetrievedContext::ranked`, so every context
//! handed to a generator is ordered by descending score and cut at top-k.

use crate::core::types::{RetrievedContext, RetrievedDocument};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;

const SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("retrieval failed: {0}")]
pub struct RetrievalError(pub String);

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        threshold: f64,
    ) -> Result<RetrievedContext, RetrievalError>;
}

/// A reference document available to the retriever.
#[derive(Debug, Clone)]
pub struct ReferenceDocument {
    pub id: String,
    pub text: String,
}

/// In-memory term-overlap retriever.
pub struct KeywordRetriever {
    documents: Vec<(ReferenceDocument, BTreeSet<String>)>,
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 2)
        .map(|t| t.to_ascii_lowercase())
        .collect()
}

impl KeywordRetriever {
    pub fn new(documents: Vec<ReferenceDocument>) -> Self {
        let documents = documents
            .into_iter()
            .map(|d| {
                let t = terms(&d.text);
                (d, t)
            })
            .collect();
        Self { documents }
    }

    /// Load every regular file in `dir` (non-recursive); the file name is the id.
    pub fn from_dir(dir: &Path) -> Result<Self, String> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| format!("cannot read corpus dir {}: {}", dir.display(), e))?;
        let mut docs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| format!("corpus dir entry: {}", e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
            let id = entry.file_name().to_string_lossy().to_string();
            docs.push(ReferenceDocument { id, text });
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Self::new(docs))
    }

    /// Built-in reference notes covering the generated resource families.
    pub fn builtin() -> Self {
        let doc = |id: &str, text: &str| ReferenceDocument {
            id: id.to_string(),
            text: text.to_string(),
        };
        Self::new(vec![
            doc(
                "aws-web-tier",
                "aws compute terraform web tier: autoscaling group behind an application \
                 load balancer, security group allows 80 and 443 from the internet only on \
                 the load balancer, instances accept traffic from the balancer",
            ),
            doc(
                "aws-s3-secure-bucket",
                "aws storage terraform s3 bucket: versioning, server side encryption \
                 aes256, public access block, required tags",
            ),
            doc(
                "aws-rds-baseline",
                "aws database terraform rds postgres: storage encrypted, backup retention \
                 seven days, not publicly accessible, password from variable",
            ),
            doc(
                "k8s-hardened-deployment",
                "k8s kubernetes compute deployment: run as non root, no privilege \
                 escalation, resource requests and limits, pinned image tag, service \
                 and health checks",
            ),
            doc(
                "ansible-host-baseline",
                "ansible on-prem compute database pipeline playbook: become, package \
                 updates, firewall, service enabled",
            ),
        ])
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        threshold: f64,
    ) -> Result<RetrievedContext, RetrievalError> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(RetrievedContext::empty());
        }
        let scored = self
            .documents
            .iter()
            .map(|(doc, doc_terms)| {
                let hits = query_terms.intersection(doc_terms).count();
                RetrievedDocument {
                    id: doc.id.clone(),
                    score: hits as f64 / query_terms.len() as f64,
                    snippet: doc.text.chars().take(SNIPPET_CHARS).collect(),
                }
            })
            .collect();
        Ok(RetrievedContext::ranked(scored, top_k, threshold))
    }
}
