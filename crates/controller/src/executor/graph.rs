//! Dependency graph and group bookkeeping for the executor.

use std::collections::{HashMap, VecDeque};

use planweave_core::types::Plan;

/// Index-level dependency structure derived from a plan snapshot.
///
/// Self and unknown references are filtered out. Groups are the connected
/// components of the undirected union of `deps` and `rev_deps`, numbered
/// by their smallest member index; steps with no edges form singleton
/// groups.
#[derive(Debug, Clone)]
pub struct DepGraph {
    /// `deps[i]` = indices step `i` depends on.
    pub deps: Vec<Vec<usize>>,
    /// `rev_deps[i]` = indices that depend on step `i`.
    pub rev_deps: Vec<Vec<usize>>,
    /// Group id per step.
    pub group_of: Vec<usize>,
    /// Member indices per group, ascending.
    pub groups: Vec<Vec<usize>>,
}

impl DepGraph {
    /// Build the graph from the current plan snapshot.
    pub fn build(plan: &Plan) -> Self {
        let n = plan.steps.len();
        let positions: HashMap<&str, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut rev_deps: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, step) in plan.steps.iter().enumerate() {
            for dep_id in &step.depends_on_step_ids {
                match positions.get(dep_id.as_str()) {
                    Some(&j) if j != i && !deps[i].contains(&j) => {
                        deps[i].push(j);
                        rev_deps[j].push(i);
                    }
                    _ => {}
                }
            }
        }
        for list in deps.iter_mut().chain(rev_deps.iter_mut()) {
            list.sort_unstable();
        }

        // Connected components over the undirected union.
        let mut group_of = vec![usize::MAX; n];
        let mut components: Vec<Vec<usize>> = Vec::new();
        for start in 0..n {
            if group_of[start] != usize::MAX {
                continue;
            }
            let id = components.len();
            let mut members = Vec::new();
            let mut queue = VecDeque::from([start]);
            group_of[start] = id;
            while let Some(u) = queue.pop_front() {
                members.push(u);
                for &v in deps[u].iter().chain(rev_deps[u].iter()) {
                    if group_of[v] == usize::MAX {
                        group_of[v] = id;
                        queue.push_back(v);
                    }
                }
            }
            members.sort_unstable();
            components.push(members);
        }

        Self {
            deps,
            rev_deps,
            group_of,
            groups: components,
        }
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Whether the plan had no steps.
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Whether a step has no dependency edges at all.
    pub fn is_isolated(&self, index: usize) -> bool {
        self.deps[index].is_empty() && self.rev_deps[index].is_empty()
    }

    /// Kahn topological order of a group's members, stable by index.
    ///
    /// Steps stuck on an (undetected) cycle are appended in index order so
    /// callers never lose events.
    pub fn topo_order(&self, members: &[usize]) -> Vec<usize> {
        let member_set: std::collections::HashSet<usize> = members.iter().copied().collect();
        let mut in_degree: HashMap<usize, usize> = members
            .iter()
            .map(|&i| {
                (
                    i,
                    self.deps[i].iter().filter(|d| member_set.contains(d)).count(),
                )
            })
            .collect();

        let mut ready: Vec<usize> = members
            .iter()
            .copied()
            .filter(|i| in_degree[i] == 0)
            .collect();
        ready.sort_unstable();

        let mut order = Vec::with_capacity(members.len());
        while !ready.is_empty() {
            let next = ready.remove(0);
            order.push(next);
            for &dependent in &self.rev_deps[next] {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        let pos = ready.partition_point(|&r| r < dependent);
                        ready.insert(pos, dependent);
                    }
                }
            }
        }

        if order.len() < members.len() {
            for &i in members {
                if !order.contains(&i) {
                    order.push(i);
                }
            }
        }
        order
    }

    /// Transitive closure of "depends on any index in `seeds`", including
    /// the seeds, ascending.
    pub fn downstream_closure(&self, seeds: &[usize]) -> Vec<usize> {
        let mut in_closure = vec![false; self.len()];
        let mut queue: VecDeque<usize> = seeds
            .iter()
            .copied()
            .filter(|&i| i < self.len())
            .collect();
        for &i in queue.iter() {
            in_closure[i] = true;
        }
        while let Some(u) = queue.pop_front() {
            for &v in &self.rev_deps[u] {
                if !in_closure[v] {
                    in_closure[v] = true;
                    queue.push_back(v);
                }
            }
        }
        (0..self.len()).filter(|&i| in_closure[i]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planweave_core::types::Step;

    fn plan(steps: &[(&str, &[&str])]) -> Plan {
        Plan::new(
            vec![],
            steps
                .iter()
                .map(|(id, deps)| {
                    let mut s = Step::new("echo");
                    s.step_id = id.to_string();
                    s.depends_on_step_ids = deps.iter().map(|d| d.to_string()).collect();
                    s
                })
                .collect(),
        )
    }

    #[test]
    fn test_build_filters_self_and_unknown() {
        let graph = DepGraph::build(&plan(&[("a", &[]), ("b", &["a", "b", "ghost"])]));
        assert_eq!(graph.deps[1], vec![0]);
        assert_eq!(graph.rev_deps[0], vec![1]);
    }

    #[test]
    fn test_groups_are_connected_components() {
        // a <- b, c isolated, d <- e
        let graph = DepGraph::build(&plan(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &[]),
            ("d", &[]),
            ("e", &["d"]),
        ]));

        assert_eq!(graph.groups.len(), 3);
        assert_eq!(graph.groups[0], vec![0, 1]);
        assert_eq!(graph.groups[1], vec![2]);
        assert_eq!(graph.groups[2], vec![3, 4]);
        assert!(graph.is_isolated(2));
        assert!(!graph.is_isolated(4));
        assert_eq!(graph.group_of[4], 2);
    }

    #[test]
    fn test_topo_order_stable_by_index() {
        // b and c both depend on a; d depends on both.
        let graph = DepGraph::build(&plan(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]));
        assert_eq!(graph.topo_order(&[0, 1, 2, 3]), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_downstream_closure() {
        // chain a <- b <- c, plus isolated d
        let graph = DepGraph::build(&plan(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["b"]),
            ("d", &[]),
        ]));

        assert_eq!(graph.downstream_closure(&[1]), vec![1, 2]);
        assert_eq!(graph.downstream_closure(&[0]), vec![0, 1, 2]);
        assert_eq!(graph.downstream_closure(&[3]), vec![3]);
    }
}
