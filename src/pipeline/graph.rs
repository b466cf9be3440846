//! ST-033: Pipeline graph — register, link, order.
//!
//! Each phase consumes the previous phase's record and returns a new one:
//! 1. [`register`] maps every artifact to its producer, a whole stage at a time,
//!    and rejects inputs nobody upstream produces.
//! 2. [`Registered::link`] resolves `DependsOn`, rewrites stage variables to
//!    namespaces and compiles deferred configuration.
//! 3. [`Linked::order`] assigns run orders by depth-first search, failing on
//!    any same-stage cycle.

use super::action::{ActionDecl, DependencyName, StageDecl};
use super::namespace::{rewrite_stage_variables, Namespaces, StageVariable};
use crate::core::error::{ExpandError, Result};
use crate::core::fragment::FragmentCompiler;
use crate::core::types::*;
use indexmap::IndexSet;
use serde_json::Value;
use std::collections::HashMap;

/// Position of an action: stage index, then declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId {
    pub stage: usize,
    pub index: usize,
}

// ============================================================================
// Phase 1: register
// ============================================================================

/// Stages with every artifact mapped to its producer.
#[derive(Debug)]
pub struct Registered {
    stages: Vec<StageDecl>,
    producers: HashMap<String, ActionId>,
}

pub fn register(stages: Vec<StageDecl>) -> Result<Registered> {
    let mut producers: HashMap<String, ActionId> = HashMap::new();
    for (s, stage) in stages.iter().enumerate() {
        for (i, action) in stage.actions.iter().enumerate() {
            for artifact in &action.outputs {
                if let Some(previous) = producers.insert(artifact.clone(), ActionId { stage: s, index: i }) {
                    return Err(ExpandError::malformed(
                        format!("stage '{}' action '{}'", stage.name, action.name),
                        format!(
                            "artifact '{}' is already produced by {}",
                            artifact,
                            label(&stages, previous)
                        ),
                    ));
                }
            }
        }
        for action in &stage.actions {
            for artifact in &action.inputs {
                if !producers.contains_key(artifact) {
                    return Err(ExpandError::malformed(
                        format!("stage '{}' action '{}'", stage.name, action.name),
                        format!("input artifact '{}' is not produced in this or an earlier stage", artifact),
                    ));
                }
            }
        }
    }
    Ok(Registered { stages, producers })
}

fn label(stages: &[StageDecl], id: ActionId) -> String {
    format!("{}:{}", stages[id.stage].name, stages[id.stage].actions[id.index].name)
}

// ============================================================================
// Phase 2: link
// ============================================================================

/// Stages with same-stage dependency edges and issued namespaces.
#[derive(Debug)]
pub struct Linked {
    stages: Vec<StageDecl>,
    /// action → same-stage actions it must run after
    edges: HashMap<ActionId, IndexSet<ActionId>>,
    namespaces: Namespaces,
}

impl Registered {
    pub fn link(self, compiler: &mut FragmentCompiler) -> Result<Linked> {
        let Registered { mut stages, producers } = self;

        let mut index: HashMap<(String, String), ActionId> = HashMap::new();
        let mut namespaces = Namespaces::new();
        for (s, stage) in stages.iter().enumerate() {
            for (i, action) in stage.actions.iter().enumerate() {
                let id = ActionId { stage: s, index: i };
                index.insert((stage.name.clone(), action.name.clone()), id);
                if let Some(ref namespace) = action.namespace {
                    namespaces.declare(id, namespace, &format!("stage '{}' action '{}'", stage.name, action.name))?;
                }
            }
        }
        let labels: HashMap<ActionId, (String, String)> =
            index.iter().map(|((s, a), id)| (*id, (s.clone(), a.clone()))).collect();

        let mut edges: HashMap<ActionId, IndexSet<ActionId>> = HashMap::new();
        for (s, stage) in stages.iter_mut().enumerate() {
            let stage_name = stage.name.clone();
            for (i, action) in stage.actions.iter_mut().enumerate() {
                let id = ActionId { stage: s, index: i };
                let context = format!("stage '{}' action '{}'", stage_name, action.name);
                let deps = edges.entry(id).or_default();

                for artifact in &action.inputs {
                    if let Some(&producer) = producers.get(artifact) {
                        if producer.stage == s {
                            deps.insert(producer);
                        }
                    }
                }

                for dep in &action.depends_on {
                    let target = lookup(&index, &stage_name, dep, &context)?;
                    check_upstream(target, s, &dep.to_string(), &context)?;
                    if target.stage == s {
                        deps.insert(target);
                    }
                }

                let mut resolve = |variable: &StageVariable<'_>| -> Result<String> {
                    let dep = DependencyName {
                        stage: Some(variable.stage.to_string()),
                        action: variable.action.to_string(),
                    };
                    let target = lookup(&index, &stage_name, &dep, &context)?;
                    check_upstream(target, s, &dep.to_string(), &context)?;
                    if target.stage == s {
                        deps.insert(target);
                    }
                    let (ref target_stage, ref target_action) = labels[&target];
                    Ok(namespaces.ensure(target, target_stage, target_action))
                };
                action.configuration = rewrite_mapping(std::mem::take(&mut action.configuration), &mut resolve)?;
                if let Some(overrides) = action.parameter_overrides.take() {
                    let overrides = rewrite_node(overrides, &mut resolve)?;
                    action
                        .configuration
                        .insert("ParameterOverrides".into(), compile_overrides(overrides, compiler));
                }
            }
        }

        Ok(Linked {
            stages,
            edges,
            namespaces,
        })
    }
}

fn lookup(
    index: &HashMap<(String, String), ActionId>,
    current_stage: &str,
    dep: &DependencyName,
    context: &str,
) -> Result<ActionId> {
    let stage = dep.stage.as_deref().unwrap_or(current_stage);
    index
        .get(&(stage.to_string(), dep.action.clone()))
        .copied()
        .ok_or_else(|| ExpandError::unknown(dep.to_string(), format!("{} names no such action", context)))
}

fn check_upstream(target: ActionId, stage: usize, text: &str, context: &str) -> Result<()> {
    if target.stage > stage {
        return Err(ExpandError::malformed(
            context,
            format!("'{}' is in a later stage", text),
        ));
    }
    Ok(())
}

fn rewrite_mapping<F>(map: Mapping, resolve: &mut F) -> Result<Mapping>
where
    F: FnMut(&StageVariable<'_>) -> Result<String>,
{
    map.into_iter()
        .map(|(k, v)| Ok((k, rewrite_node(v, resolve)?)))
        .collect()
}

/// Rewrite stage variables in every string leaf.
fn rewrite_node<F>(node: Node, resolve: &mut F) -> Result<Node>
where
    F: FnMut(&StageVariable<'_>) -> Result<String>,
{
    Ok(match node {
        Value::String(s) if s.contains("#{") => Value::String(rewrite_stage_variables(&s, &mut *resolve)?),
        Value::Object(map) => Value::Object(rewrite_mapping(map, resolve)?),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| rewrite_node(item, resolve))
                .collect::<Result<Vec<_>>>()?,
        ),
        other => other,
    })
}

/// A mapping of overrides becomes one JSON string; anything else is kept.
fn compile_overrides(overrides: Node, compiler: &mut FragmentCompiler) -> Node {
    match overrides {
        Value::Object(_) => compiler.compile(&overrides).into_node(),
        other => other,
    }
}

// ============================================================================
// Phase 3: order
// ============================================================================

/// A final action with its computed run order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedAction {
    pub decl: ActionDecl,
    pub run_order: u64,
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderedStage {
    pub name: String,
    pub condition: Option<String>,
    pub extra: Mapping,
    /// Sorted by run order, then declaration order
    pub actions: Vec<OrderedAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ordered {
    pub stages: Vec<OrderedStage>,
}

impl Linked {
    pub fn order(self) -> Result<Ordered> {
        let Linked {
            stages,
            edges,
            namespaces,
        } = self;

        let mut ordered = Vec::with_capacity(stages.len());
        for (s, stage) in stages.into_iter().enumerate() {
            let mut orders: HashMap<ActionId, u64> = HashMap::new();
            for i in 0..stage.actions.len() {
                let mut stack = Vec::new();
                visit(ActionId { stage: s, index: i }, &stage, &edges, &mut orders, &mut stack)?;
            }

            let mut actions: Vec<(usize, OrderedAction)> = stage
                .actions
                .into_iter()
                .enumerate()
                .map(|(i, decl)| {
                    let id = ActionId { stage: s, index: i };
                    let run_order = orders.get(&id).copied().unwrap_or(1);
                    let namespace = namespaces.get(id).map(str::to_string);
                    (
                        i,
                        OrderedAction {
                            decl,
                            run_order,
                            namespace,
                        },
                    )
                })
                .collect();
            actions.sort_by_key(|(i, a)| (a.run_order, *i));

            ordered.push(OrderedStage {
                name: stage.name,
                condition: stage.condition,
                extra: stage.extra,
                actions: actions.into_iter().map(|(_, a)| a).collect(),
            });
        }
        Ok(Ordered { stages: ordered })
    }
}

/// Depth-first run-order computation. `stack` holds the current path.
fn visit(
    id: ActionId,
    stage: &StageDecl,
    edges: &HashMap<ActionId, IndexSet<ActionId>>,
    orders: &mut HashMap<ActionId, u64>,
    stack: &mut Vec<ActionId>,
) -> Result<u64> {
    if let Some(&order) = orders.get(&id) {
        return Ok(order);
    }
    if let Some(pos) = stack.iter().position(|&on_stack| on_stack == id) {
        let mut chain: Vec<String> = stack[pos..]
            .iter()
            .map(|a| stage.actions[a.index].name.clone())
            .collect();
        chain.push(stage.actions[id.index].name.clone());
        return Err(ExpandError::CircularDependency {
            stage: stage.name.clone(),
            chain,
        });
    }

    stack.push(id);
    let mut deepest = 0;
    if let Some(deps) = edges.get(&id) {
        for &dep in deps {
            deepest = deepest.max(visit(dep, stage, edges, orders, stack)?);
        }
    }
    stack.pop();

    let floor = stage.actions[id.index].run_order.unwrap_or(1);
    let order = (deepest + 1).max(floor);
    orders.insert(id, order);
    Ok(order)
}

/// Run all three phases.
pub fn build(stages: Vec<StageDecl>, compiler: &mut FragmentCompiler) -> Result<Ordered> {
    register(stages)?.link(compiler)?.order()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::action::parse_stages;
    use proptest::prelude::*;
    use std::collections::HashSet;

    /// Every same-stage action `id` transitively waits on.
    fn upstream(ordered: &Ordered, stage: usize, name: &str) -> HashSet<String> {
        let Some(stage) = ordered.stages.get(stage) else {
            return HashSet::new();
        };
        let by_name: HashMap<&str, &OrderedAction> = stage.actions.iter().map(|a| (a.decl.name.as_str(), a)).collect();
        let producers: HashMap<&str, &str> = stage
            .actions
            .iter()
            .flat_map(|a| a.decl.outputs.iter().map(move |o| (o.as_str(), a.decl.name.as_str())))
            .collect();

        let mut seen = HashSet::new();
        let mut pending = vec![name];
        while let Some(current) = pending.pop() {
            let Some(action) = by_name.get(current) else { continue };
            let direct = action
                .decl
                .inputs
                .iter()
                .filter_map(|i| producers.get(i.as_str()).copied())
                .chain(
                    action
                        .decl
                        .depends_on
                        .iter()
                        .filter(|d| d.stage.as_deref().is_none_or(|s| s == stage.name))
                        .map(|d| d.action.as_str()),
                );
            for dep in direct {
                if seen.insert(dep.to_string()) {
                    pending.push(dep);
                }
            }
        }
        seen
    }


    fn stages(yaml: &str) -> Vec<StageDecl> {
        let node: Node = serde_yaml_ng::from_str(yaml).unwrap();
        let Value::Array(items) = node else { panic!("stages must be a list") };
        parse_stages(items, &mut FragmentCompiler::new(), "test").unwrap()
    }

    fn run(yaml: &str) -> Result<Ordered> {
        build(stages(yaml), &mut FragmentCompiler::new())
    }

    fn orders(ordered: &Ordered, stage: usize) -> Vec<(String, u64)> {
        ordered.stages[stage]
            .actions
            .iter()
            .map(|a| (a.decl.name.clone(), a.run_order))
            .collect()
    }

    const PIPELINE: &str = r#"
- Name: Source
  Actions:
    Fetch:
      Type: S3Source
      Bucket: src
      Key: app.zip
      OutputArtifacts: [Src]
- Name: Build
  Actions:
    Package:
      Type: Build
      Project: pkg
      InputArtifacts: [Built]
      OutputArtifacts: [Bundle]
    Compile:
      Type: Build
      Project: compile
      InputArtifacts: [Src]
      OutputArtifacts: [Built]
    Lint:
      Type: Build
      Project: lint
      InputArtifacts: [Src]
"#;

    #[test]
    fn test_st033_run_order_from_artifacts() {
        let ordered = run(PIPELINE).unwrap();
        assert_eq!(orders(&ordered, 0), vec![("Fetch".to_string(), 1)]);
        assert_eq!(
            orders(&ordered, 1),
            vec![
                ("Compile".to_string(), 1),
                ("Lint".to_string(), 1),
                ("Package".to_string(), 2)
            ]
        );
    }

    #[test]
    fn test_st033_explicit_depends_on() {
        let ordered = run(r#"
- Name: Deploy
  Actions:
    Migrate:
      Type: Build
      Project: migrate
      DependsOn: [Approve]
    Approve:
      ActionTypeId: {Category: Approval, Owner: AWS, Provider: Manual, Version: "1"}
    Smoke:
      Type: Build
      Project: smoke
      DependsOn: [Migrate]
"#)
        .unwrap();
        assert_eq!(
            orders(&ordered, 0),
            vec![
                ("Approve".to_string(), 1),
                ("Migrate".to_string(), 2),
                ("Smoke".to_string(), 3)
            ]
        );
    }

    #[test]
    fn test_st033_run_order_floor() {
        let ordered = run(r#"
- Name: S
  Actions:
    A: {Type: Build, Project: a, RunOrder: 5}
    B: {Type: Build, Project: b, DependsOn: [A]}
"#)
        .unwrap();
        assert_eq!(orders(&ordered, 0), vec![("A".to_string(), 5), ("B".to_string(), 6)]);
    }

    #[test]
    fn test_st033_cycle_via_artifacts() {
        let err = run(r#"
- Name: Build
  Actions:
    A: {Type: Build, Project: a, InputArtifacts: [FromB], OutputArtifacts: [FromA]}
    B: {Type: Build, Project: b, InputArtifacts: [FromA], OutputArtifacts: [FromB]}
"#)
        .unwrap_err();
        match err {
            ExpandError::CircularDependency { stage, chain } => {
                assert_eq!(stage, "Build");
                assert_eq!(chain, vec!["A", "B", "A"]);
            }
            other => panic!("expected a cycle, got {}", other),
        }
    }

    #[test]
    fn test_st033_cycle_via_depends_on() {
        let err = run(r#"
- Name: S
  Actions:
    A: {Type: Build, Project: a, DependsOn: [C]}
    B: {Type: Build, Project: b, DependsOn: [A]}
    C: {Type: Build, Project: c, DependsOn: [B]}
"#)
        .unwrap_err();
        assert!(matches!(err, ExpandError::CircularDependency { .. }));
        assert!(err.to_string().contains("A -> C -> B -> A"));
    }

    #[test]
    fn test_st033_self_dependency_is_cycle() {
        let err = run(r#"
- Name: S
  Actions:
    A: {Type: Build, Project: a, DependsOn: [A]}
"#)
        .unwrap_err();
        assert!(matches!(err, ExpandError::CircularDependency { .. }));
    }

    #[test]
    fn test_st033_forward_artifact_rejected() {
        let err = run(r#"
- Name: Build
  Actions:
    Compile: {Type: Build, Project: c, InputArtifacts: [Src]}
- Name: Source
  Actions:
    Fetch: {Type: S3Source, Bucket: b, Key: k, OutputArtifacts: [Src]}
"#)
        .unwrap_err();
        assert!(err.to_string().contains("input artifact 'Src'"));
    }

    #[test]
    fn test_st033_duplicate_producer_rejected() {
        let err = run(r#"
- Name: S
  Actions:
    A: {Type: Build, Project: a, OutputArtifacts: [Out]}
    B: {Type: Build, Project: b, OutputArtifacts: [Out]}
"#)
        .unwrap_err();
        assert!(err.to_string().contains("already produced by S:A"));
    }

    #[test]
    fn test_st033_unknown_and_later_dependencies() {
        let unknown = run(r#"
- Name: S
  Actions:
    A: {Type: Build, Project: a, DependsOn: [Ghost]}
"#)
        .unwrap_err();
        assert!(matches!(unknown, ExpandError::UnknownReference { .. }));

        let later = run(r#"
- Name: S
  Actions:
    A: {Type: Build, Project: a, DependsOn: ["T:B"]}
- Name: T
  Actions:
    B: {Type: Build, Project: b}
"#)
        .unwrap_err();
        assert!(later.to_string().contains("later stage"));
    }

    #[test]
    fn test_st033_stage_variables_namespaced() {
        let ordered = run(r##"
- Name: Build
  Actions:
    Compile:
      Type: Build
      Project: compile
    Deploy:
      Type: CloudFormation
      StackName: app
      ParameterOverrides:
        Version: "#{Build:Compile.Version}"
        Bucket: {Ref: Artifacts}
"##)
        .unwrap();
        let actions = &ordered.stages[0].actions;
        assert_eq!(actions[0].decl.name, "Compile");
        assert_eq!(actions[0].namespace.as_deref(), Some("build-compile"));
        assert_eq!(actions[1].run_order, 2);
        assert_eq!(actions[1].namespace, None);
        assert_eq!(
            actions[1].decl.configuration["ParameterOverrides"],
            serde_json::json!({"Fn::Sub": r##"{"Version":"#{build-compile.Version}","Bucket":"${Artifacts}"}"##})
        );
    }

    #[test]
    fn test_st033_explicit_namespace_reused() {
        let ordered = run(r##"
- Name: Source
  Actions:
    Fetch: {Type: EcrSource, Repository: app, Namespace: SourceVars}
- Name: Deploy
  Actions:
    Stack:
      Type: CloudFormation
      StackName: app
      ParameterOverrides: {Digest: "#{Source:Fetch.ImageDigest}"}
"##)
        .unwrap();
        assert_eq!(ordered.stages[0].actions[0].namespace.as_deref(), Some("SourceVars"));
        assert_eq!(
            ordered.stages[1].actions[0].decl.configuration["ParameterOverrides"],
            serde_json::json!(r##"{"Digest":"#{SourceVars.ImageDigest}"}"##)
        );
    }

    #[test]
    fn test_st033_upstream_closure() {
        let ordered = run(PIPELINE).unwrap();
        let up = upstream(&ordered, 1, "Package");
        assert_eq!(up, HashSet::from(["Compile".to_string()]));
        assert!(upstream(&ordered, 1, "Lint").is_empty());
    }

    proptest! {
        /// Action `i` may depend on any `j < i`, so the graph is always acyclic.
        #[test]
        fn prop_st033_run_order_monotonic(
            deps in proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..4), 1..10)
        ) {
            let mut actions = Mapping::new();
            for (i, picks) in deps.iter().enumerate() {
                let names: Vec<Value> = if i == 0 {
                    Vec::new()
                } else {
                    picks.iter().map(|p| Value::String(format!("A{}", p.index(i)))).collect()
                };
                actions.insert(
                    format!("A{}", i),
                    serde_json::json!({"Type": "Build", "Project": "p", "DependsOn": names}),
                );
            }
            let stage = serde_json::json!({"Name": "S", "Actions": actions});
            let parsed = parse_stages(vec![stage], &mut FragmentCompiler::new(), "prop").unwrap();
            let ordered = build(parsed, &mut FragmentCompiler::new()).unwrap();
            let by_name: HashMap<String, u64> = ordered.stages[0]
                .actions
                .iter()
                .map(|a| (a.decl.name.clone(), a.run_order))
                .collect();
            for action in &ordered.stages[0].actions {
                for dep in upstream(&ordered, 0, &action.decl.name) {
                    prop_assert!(action.run_order > by_name[&dep]);
                }
            }
            let sorted: Vec<u64> = ordered.stages[0].actions.iter().map(|a| a.run_order).collect();
            prop_assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
