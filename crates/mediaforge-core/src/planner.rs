//! Dependency planner.
//!
//! Partitions a workflow's stages into sequential phases of concurrently
//! runnable stages via Kahn layering. Planning is deterministic: the same
//! workflow always yields the same phase list, with in-phase ordering by
//! priority (highest first) and then lexicographic stage name.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StageDef;

/// Planner error types.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("workflow has no stages")]
    Empty,

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("dependency cycle between stages: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },
}

/// The ordered phase list produced for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub workflow: String,
    /// Phases in execution order; stages within a phase may run concurrently
    /// and are listed in dispatch order (priority, then name).
    pub phases: Vec<Vec<String>>,
    /// Union of required resources per phase, used for early feasibility
    /// checks against the arbiter.
    pub phase_resources: Vec<BTreeSet<String>>,
    /// Optimistic parallel bound: sum over phases of the max estimate.
    pub estimated_total_secs: f64,
}

impl ExecutionPlan {
    pub fn total_stages(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    /// Phase index a stage belongs to.
    pub fn stage_phase(&self, stage_name: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.iter().any(|name| name == stage_name))
    }
}

/// Build the execution plan for a workflow.
pub fn plan(workflow: &str, stages: &[StageDef]) -> Result<ExecutionPlan, PlanError> {
    if stages.is_empty() {
        return Err(PlanError::Empty);
    }

    let mut by_name: BTreeMap<&str, &StageDef> = BTreeMap::new();
    for stage in stages {
        if by_name.insert(stage.name.as_str(), stage).is_some() {
            return Err(PlanError::DuplicateStage(stage.name.clone()));
        }
    }

    // Dangling dependencies are detected before layering.
    for stage in stages {
        for dep in &stage.dependencies {
            if !by_name.contains_key(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn layering over a BTreeMap keeps iteration deterministic.
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = by_name
        .iter()
        .map(|(name, stage)| {
            (
                *name,
                stage.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    let mut phases: Vec<Vec<String>> = Vec::new();
    let mut placed: BTreeSet<&str> = BTreeSet::new();

    while !remaining.is_empty() {
        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|dep| placed.contains(dep)))
            .map(|(name, _)| *name)
            .collect();

        if ready.is_empty() {
            let leftover: Vec<&str> = remaining.keys().copied().collect();
            return Err(PlanError::Cycle {
                members: smallest_cycle(&by_name, &leftover),
            });
        }

        ready.sort_by(|a, b| {
            let pa = by_name[a].priority;
            let pb = by_name[b].priority;
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });

        for &name in &ready {
            remaining.remove(name);
            placed.insert(name);
        }
        phases.push(ready.into_iter().map(str::to_string).collect());
    }

    let phase_resources = phases
        .iter()
        .map(|phase| {
            phase
                .iter()
                .flat_map(|name| by_name[name.as_str()].required_resources.iter().cloned())
                .collect()
        })
        .collect();

    let estimated_total_secs = phases
        .iter()
        .map(|phase| {
            phase
                .iter()
                .map(|name| by_name[name.as_str()].estimated_duration_secs)
                .fold(0.0_f64, f64::max)
        })
        .sum();

    Ok(ExecutionPlan {
        workflow: workflow.to_string(),
        phases,
        phase_resources,
        estimated_total_secs,
    })
}

/// Transitive dependency closure per stage, for input-map construction.
pub fn transitive_dependencies(stages: &[StageDef]) -> BTreeMap<String, BTreeSet<String>> {
    let direct: BTreeMap<&str, &StageDef> =
        stages.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut closure: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for stage in stages {
        let mut seen = BTreeSet::new();
        let mut queue: Vec<&str> = stage.dependencies.iter().map(String::as_str).collect();
        while let Some(dep) = queue.pop() {
            if seen.insert(dep.to_string()) {
                if let Some(def) = direct.get(dep) {
                    queue.extend(def.dependencies.iter().map(String::as_str));
                }
            }
        }
        closure.insert(stage.name.clone(), seen);
    }
    closure
}

/// Transitive dependents per stage, for failure-policy skipping.
pub fn transitive_dependents(stages: &[StageDef]) -> BTreeMap<String, BTreeSet<String>> {
    let deps = transitive_dependencies(stages);
    let mut dependents: BTreeMap<String, BTreeSet<String>> = stages
        .iter()
        .map(|s| (s.name.clone(), BTreeSet::new()))
        .collect();
    for (stage, upstream) in &deps {
        for dep in upstream {
            if let Some(set) = dependents.get_mut(dep) {
                set.insert(stage.clone());
            }
        }
    }
    dependents
}

/// Find the smallest strongly-connected component among the unplaced stages
/// (Tarjan), names sorted for a stable error message.
fn smallest_cycle(by_name: &BTreeMap<&str, &StageDef>, leftover: &[&str]) -> Vec<String> {
    struct Tarjan<'a> {
        graph: &'a HashMap<&'a str, Vec<&'a str>>,
        index: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        on_stack: BTreeSet<&'a str>,
        stack: Vec<&'a str>,
        counter: usize,
        components: Vec<Vec<&'a str>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, node: &'a str) {
            self.index.insert(node, self.counter);
            self.lowlink.insert(node, self.counter);
            self.counter += 1;
            self.stack.push(node);
            self.on_stack.insert(node);

            for &next in self.graph.get(node).into_iter().flatten() {
                if !self.index.contains_key(next) {
                    self.visit(next);
                    let low = self.lowlink[next].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.index[next].min(self.lowlink[node]);
                    self.lowlink.insert(node, low);
                }
            }

            if self.lowlink[node] == self.index[node] {
                let mut component = Vec::new();
                while let Some(top) = self.stack.pop() {
                    self.on_stack.remove(top);
                    component.push(top);
                    if top == node {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let members: BTreeSet<&str> = leftover.iter().copied().collect();
    let graph: HashMap<&str, Vec<&str>> = leftover
        .iter()
        .map(|&name| {
            let edges = by_name[name]
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|dep| members.contains(dep))
                .collect();
            (name, edges)
        })
        .collect();

    let mut tarjan = Tarjan {
        graph: &graph,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: BTreeSet::new(),
        stack: Vec::new(),
        counter: 0,
        components: Vec::new(),
    };
    for &node in leftover {
        if !tarjan.index.contains_key(node) {
            tarjan.visit(node);
        }
    }

    let mut cyclic: Vec<Vec<&str>> = tarjan
        .components
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || graph[component[0]].contains(&component[0])
        })
        .collect();
    cyclic.sort_by_key(Vec::len);

    let mut names: Vec<String> = cyclic
        .first()
        .map(|component| component.iter().map(|s| s.to_string()).collect())
        .unwrap_or_else(|| leftover.iter().map(|s| s.to_string()).collect());
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StagePriority;

    fn stage(name: &str, deps: &[&str]) -> StageDef {
        StageDef::new(name).with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_linear_chain_yields_one_stage_per_phase() {
        let stages = vec![
            stage("a", &[]),
            stage("b", &["a"]),
            stage("c", &["b"]),
        ];
        let plan = plan("linear", &stages).expect("plan");
        assert_eq!(
            plan.phases,
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_fan_out_fan_in_phases() {
        let stages = vec![
            stage("root", &[]),
            stage("left", &["root"]),
            stage("right", &["root"]),
            stage("join", &["left", "right"]),
        ];
        let plan = plan("diamond", &stages).expect("plan");
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[0], vec!["root".to_string()]);
        assert_eq!(plan.phases[1], vec!["left".to_string(), "right".to_string()]);
        assert_eq!(plan.phases[2], vec!["join".to_string()]);
    }

    #[test]
    fn test_in_phase_ordering_by_priority_then_name() {
        let stages = vec![
            stage("zeta", &[]),
            stage("alpha", &[]),
            StageDef::new("omega").with_priority(StagePriority::High),
        ];
        let plan = plan("priorities", &stages).expect("plan");
        assert_eq!(
            plan.phases[0],
            vec!["omega".to_string(), "alpha".to_string(), "zeta".to_string()]
        );
    }

    #[test]
    fn test_planning_is_deterministic() {
        let stages = vec![
            stage("c", &[]),
            stage("a", &[]),
            stage("b", &["a", "c"]),
        ];
        let first = plan("repeat", &stages).expect("plan");
        let second = plan("repeat", &stages).expect("plan");
        assert_eq!(first.phases, second.phases);
    }

    #[test]
    fn test_unknown_dependency_detected_before_layering() {
        let stages = vec![stage("a", &["ghost"])];
        match plan("dangling", &stages) {
            Err(PlanError::UnknownDependency { stage, dependency }) => {
                assert_eq!(stage, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_cycle_names_smallest_component() {
        let stages = vec![
            stage("a", &["b"]),
            stage("b", &["a"]),
            stage("c", &["d"]),
            stage("d", &["e"]),
            stage("e", &["c"]),
        ];
        match plan("cyclic", &stages) {
            Err(PlanError::Cycle { members }) => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let stages = vec![stage("a", &[]), stage("a", &[])];
        assert!(matches!(
            plan("dupes", &stages),
            Err(PlanError::DuplicateStage(name)) if name == "a"
        ));
    }

    #[test]
    fn test_estimate_sums_phase_maxima() {
        let stages = vec![
            StageDef::new("root").with_estimated_duration(10.0),
            StageDef::new("left")
                .with_dependencies(vec!["root".to_string()])
                .with_estimated_duration(30.0),
            StageDef::new("right")
                .with_dependencies(vec!["root".to_string()])
                .with_estimated_duration(20.0),
        ];
        let plan = plan("estimates", &stages).expect("plan");
        assert_eq!(plan.estimated_total_secs, 40.0);
    }

    #[test]
    fn test_phase_resources_are_unions() {
        let stages = vec![
            StageDef::new("left").with_resources(["llm_api", "storage"]),
            StageDef::new("right").with_resources(["tts_api", "storage"]),
        ];
        let plan = plan("resources", &stages).expect("plan");
        let expected: BTreeSet<String> = ["llm_api", "storage", "tts_api"]
            .into_iter()
            .map(str::to_string)
            .collect();
        assert_eq!(plan.phase_resources[0], expected);
    }

    #[test]
    fn test_transitive_closures() {
        let stages = vec![
            stage("a", &[]),
            stage("b", &["a"]),
            stage("c", &["b"]),
        ];
        let deps = transitive_dependencies(&stages);
        assert!(deps["c"].contains("a"));
        assert!(deps["c"].contains("b"));
        let dependents = transitive_dependents(&stages);
        assert!(dependents["a"].contains("c"));
        assert!(dependents["b"].contains("c"));
        assert!(dependents["c"].is_empty());
    }
}
