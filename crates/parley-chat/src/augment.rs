//! External context for a turn: retrieved passages and web results.
//!
//! Augmentation never fails a turn. Errors are logged and the prompt is built
//! without the missing context.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use parley_core::types::OperationMode;
use parley_retrieval::{RetrievalContext, RetrievedPassage};

use crate::error::ChatError;

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebResult {
    pub link: String,
    pub snippet: String,
}

/// Web search provider.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<WebResult>, ChatError>;
}

/// Provider used when no search backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledWebSearch;

#[async_trait]
impl WebSearch for DisabledWebSearch {
    async fn search(&self, _query: &str) -> Result<Vec<WebResult>, ChatError> {
        Err(ChatError::Augmentation("web search is not configured".to_string()))
    }
}

/// Context gathered before generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Augmentation {
    pub passages: Vec<RetrievedPassage>,
    /// Rendered web results; `Some("")` when a search ran and found nothing.
    pub web_results: Option<String>,
}

pub struct Augmentor {
    retrieval: Arc<RetrievalContext>,
    web: Arc<dyn WebSearch>,
}

impl Augmentor {
    pub fn new(retrieval: Arc<RetrievalContext>, web: Arc<dyn WebSearch>) -> Self {
        Self { retrieval, web }
    }

    pub fn retrieval(&self) -> &Arc<RetrievalContext> {
        &self.retrieval
    }

    /// Gather context for `input`. Web search only runs when enabled and the
    /// mode allows it.
    pub async fn gather(&self, input: &str, mode: OperationMode, web_search: bool) -> Augmentation {
        let passages = match self.retrieval.query(input, self.retrieval.top_k()).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!(error = %e, "Retrieval failed, continuing without passages");
                Vec::new()
            }
        };

        let web_results = if web_search && mode.allows_web_search() {
            match self.web.search(input).await {
                Ok(results) => Some(render_web_results(&results)),
                Err(e) => {
                    warn!(error = %e, "Web search failed, continuing without results");
                    None
                }
            }
        } else {
            None
        };

        debug!(
            passages = passages.len(),
            web = web_results.is_some(),
            "Augmentation gathered"
        );
        Augmentation {
            passages,
            web_results,
        }
    }
}

fn render_web_results(results: &[WebResult]) -> String {
    results
        .iter()
        .map(|r| format!("{}\n{}", r.link, r.snippet))
        .collect::<Vec<_>>()
        .join("\n\n")
}
