//! In-memory plan memory.
//!
//! Remembers the plan produced for each objective and surfaces the most
//! relevant ones as prompt snippets for later runs. Scoring is lexical
//! token overlap; a vector backend can replace this behind the same
//! trait.

use async_trait::async_trait;
use dashmap::DashMap;

use planweave_core::{
    traits::{PlanMemory, PlanMemoryHit},
    types::{now_ms, Plan},
    Result,
};

struct MemoryEntry {
    objective: String,
    snippet: String,
    updated_at_ms: i64,
}

/// Default plan memory keyed on the normalized objective.
#[derive(Default)]
pub struct InMemoryPlanMemory {
    entries: DashMap<String, MemoryEntry>,
}

impl InMemoryPlanMemory {
    /// Create an empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remembered objectives.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the memory is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn normalize(objective: &str) -> String {
        objective.trim().to_lowercase()
    }

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Jaccard overlap between two token sets.
    fn score(a: &str, b: &str) -> f64 {
        let ta: std::collections::HashSet<_> = Self::tokens(a).into_iter().collect();
        let tb: std::collections::HashSet<_> = Self::tokens(b).into_iter().collect();
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }
        let inter = ta.intersection(&tb).count() as f64;
        let union = ta.union(&tb).count() as f64;
        inter / union
    }

    fn render_snippet(plan: &Plan) -> String {
        plan.steps
            .iter()
            .map(|s| {
                let intent = if s.next_step.is_empty() {
                    s.ai_name.clone()
                } else {
                    format!("{} ({})", s.ai_name, s.next_step)
                };
                format!("{}. {}", s.display_index.max(1), intent)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl PlanMemory for InMemoryPlanMemory {
    async fn search(&self, objective: &str, limit: usize) -> Result<Vec<PlanMemoryHit>> {
        let mut hits: Vec<(i64, PlanMemoryHit)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let score = Self::score(objective, &entry.objective);
                if score > 0.0 {
                    Some((
                        entry.updated_at_ms,
                        PlanMemoryHit {
                            objective: entry.objective.clone(),
                            snippet: entry.snippet.clone(),
                            score,
                        },
                    ))
                } else {
                    None
                }
            })
            .collect();

        // Best score first; newer entries win ties.
        hits.sort_by(|(ta, a), (tb, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(tb.cmp(ta))
        });
        hits.truncate(limit);
        Ok(hits.into_iter().map(|(_, hit)| hit).collect())
    }

    async fn upsert(&self, objective: &str, plan: &Plan) -> Result<()> {
        let key = Self::normalize(objective);
        self.entries.insert(
            key,
            MemoryEntry {
                objective: objective.to_string(),
                snippet: Self::render_snippet(plan),
                updated_at_ms: now_ms(),
            },
        );
        Ok(())
    }
}
