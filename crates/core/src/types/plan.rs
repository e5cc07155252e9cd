use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::tool::ToolDescriptor;

// =============================================================================
// Plan & Step Types
// =============================================================================

/// One unit of tool invocation in a plan.
///
/// Step identity is `step_id` (stable across plan patches); `display_index`
/// is the 1-based human-facing number and is recomputed after any
/// structural change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Opaque identifier, unique within the run. Blank ids are synthesized.
    #[serde(default)]
    pub step_id: String,

    /// 1-based human-facing position.
    #[serde(default)]
    pub display_index: usize,

    /// Catalog identifier of the tool to invoke.
    pub ai_name: String,

    /// Short human rationale lines (may be empty).
    #[serde(default)]
    pub reason: Vec<String>,

    /// Free-text description of intent.
    #[serde(default)]
    pub next_step: String,

    /// Best-effort argument proposal; final args come from ArgGen.
    #[serde(default)]
    pub draft_args: Map<String, Value>,

    /// Ids of earlier steps this step depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on_step_ids: Vec<String>,

    /// Treated as already finished; never dispatched.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skip: bool,
}

impl Step {
    /// Create a step for the given tool with a fresh id.
    pub fn new(ai_name: impl Into<String>) -> Self {
        Self {
            step_id: new_step_id(),
            display_index: 0,
            ai_name: ai_name.into(),
            reason: Vec::new(),
            next_step: String::new(),
            draft_args: Map::new(),
            depends_on_step_ids: Vec::new(),
            skip: false,
        }
    }

    /// Set the draft arguments.
    pub fn with_draft_args(mut self, args: Map<String, Value>) -> Self {
        self.draft_args = args;
        self
    }

    /// Add a dependency on another step id.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on_step_ids.push(step_id.into());
        self
    }
}

/// Generate a fresh opaque step id.
pub fn new_step_id() -> String {
    format!("step-{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// A validated plan: the manifest offered to the model plus the ordered
/// step list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Subset of catalog tools that was offered to the model.
    #[serde(default)]
    pub manifest: Vec<ToolDescriptor>,

    /// Ordered steps. Indices are an internal convenience; identity is
    /// `step_id`.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Plan {
    /// Create a plan from a manifest and steps.
    pub fn new(manifest: Vec<ToolDescriptor>, steps: Vec<Step>) -> Self {
        Self { manifest, steps }
    }

    /// Whether the plan contains no runnable steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Look up a step index by id.
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    /// The set of `ai_name`s present in the manifest.
    pub fn manifest_names(&self) -> HashSet<String> {
        self.manifest.iter().map(|t| t.ai_name.clone()).collect()
    }

    /// Synthesize ids for steps with blank ids and dedupe collisions.
    pub fn assign_step_ids(&mut self) {
        let mut seen: HashSet<String> = HashSet::new();
        for step in &mut self.steps {
            if step.step_id.trim().is_empty() || seen.contains(&step.step_id) {
                step.step_id = new_step_id();
            }
            seen.insert(step.step_id.clone());
        }
    }

    /// Recompute `display_index` as position + 1.
    pub fn renumber(&mut self) {
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.display_index = i + 1;
        }
    }

    /// Validate dependency references: every entry must name an existing,
    /// distinct, *earlier* step. Returns one message per violation.
    pub fn dependency_errors(&self) -> Vec<String> {
        let positions: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();

        let mut errors = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on_step_ids {
                match positions.get(dep.as_str()) {
                    None => errors.push(format!(
                        "step {} depends on unknown step id {:?}",
                        step.step_id, dep
                    )),
                    Some(&j) if j == i => errors.push(format!(
                        "step {} depends on itself",
                        step.step_id
                    )),
                    Some(&j) if j > i => errors.push(format!(
                        "step {} depends on later step {}",
                        step.step_id, self.steps[j].step_id
                    )),
                    Some(_) => {}
                }
            }
        }
        errors
    }

    /// Drop dependency references that are self, unknown, or point at a
    /// later step. The surviving graph is acyclic by construction.
    pub fn sanitize_dependencies(&mut self) {
        let positions: HashMap<String, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.clone(), i))
            .collect();

        for (i, step) in self.steps.iter_mut().enumerate() {
            let mut kept = Vec::new();
            let mut seen = HashSet::new();
            for dep in step.depends_on_step_ids.drain(..) {
                if let Some(&j) = positions.get(&dep) {
                    if j < i && seen.insert(dep.clone()) {
                        kept.push(dep);
                    }
                }
            }
            step.depends_on_step_ids = kept;
        }
    }

    /// Remove all dependency references (the never-deadlock fallback).
    pub fn strip_dependencies(&mut self) {
        for step in &mut self.steps {
            step.depends_on_step_ids.clear();
        }
    }

    /// Whether the dependency graph contains a cycle (Kahn's algorithm).
    pub fn has_cycle(&self) -> bool {
        let positions: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();

        let n = self.steps.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on_step_ids {
                if let Some(&j) = positions.get(dep.as_str()) {
                    if j != i {
                        in_degree[i] += 1;
                        dependents[j].push(i);
                    }
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0usize;
        while let Some(u) = queue.pop_front() {
            visited += 1;
            for &v in &dependents[u] {
                in_degree[v] -= 1;
                if in_degree[v] == 0 {
                    queue.push_back(v);
                }
            }
        }
        visited != n
    }
}
