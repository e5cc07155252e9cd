//! Planning manifest: the tool subset offered to the model.

use planweave_core::{types::ToolDescriptor, Result};

use crate::runtime::RunnerInner;

/// Build the manifest from the catalog, optionally reranked against the
/// objective (keeping `rerank.top_n` of the first `rerank.candidate_k`).
pub async fn build_manifest(
    rt: &RunnerInner,
    objective: &str,
) -> Result<Vec<ToolDescriptor>> {
    let tools = rt.catalog.available_tools_detailed().await?;

    let cfg = &rt.config.rerank;
    if !cfg.enable {
        return Ok(tools);
    }
    let Some(reranker) = rt.reranker.as_ref() else {
        return Ok(tools);
    };

    let candidates: Vec<ToolDescriptor> = tools.into_iter().take(cfg.candidate_k.max(1)).collect();
    let reranked = reranker
        .rerank(objective, candidates, cfg.top_n.max(1))
        .await?;

    tracing::debug!(kept = reranked.len(), "Manifest reranked");
    Ok(reranked)
}

/// Intersect the manifest with the judge whitelist. An intersection that
/// would empty the manifest falls back to the full manifest.
pub fn apply_whitelist(
    manifest: Vec<ToolDescriptor>,
    whitelist: Option<&[String]>,
) -> Vec<ToolDescriptor> {
    let Some(whitelist) = whitelist.filter(|w| !w.is_empty()) else {
        return manifest;
    };

    let filtered: Vec<ToolDescriptor> = manifest
        .iter()
        .filter(|t| whitelist.contains(&t.ai_name))
        .cloned()
        .collect();

    if filtered.is_empty() {
        tracing::debug!("Judge whitelist empties the manifest; keeping all tools");
        manifest
    } else {
        filtered
    }
}

/// Render the bulleted tool listing embedded in the planner prompt.
pub fn render_bullets(tools: &[ToolDescriptor]) -> String {
    tools
        .iter()
        .map(|t| {
            let params: Vec<String> = t.input_schema["properties"]
                .as_object()
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default();
            if params.is_empty() {
                format!("- {}: {}", t.ai_name, t.description)
            } else {
                format!(
                    "- {}: {} (args: {})",
                    t.ai_name,
                    t.description,
                    params.join(", ")
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Score-ordered plan-memory snippets for the prompt, best first.
pub async fn memory_snippets(rt: &RunnerInner, objective: &str) -> Vec<String> {
    let cfg = &rt.config.memory;
    if !cfg.enable {
        return Vec::new();
    }
    let Some(memory) = rt.memory.as_ref() else {
        return Vec::new();
    };

    match memory.search(objective, 3).await {
        Ok(hits) => hits
            .into_iter()
            .filter(|h| h.score >= cfg.min_score)
            .map(|h| format!("Past plan for \"{}\":\n{}", h.objective, h.snippet))
            .collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Plan-memory search failed");
            Vec::new()
        }
    }
}
