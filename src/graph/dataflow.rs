//! Data-flow resolution.
//!
//! For every task input, walk the declared links back to the ultimate
//! producing task and property, crossing DAG scope boundaries through input
//! connectors. Each resolved source also records `parallel_depths`: the
//! lineage indices, producer → consumer order, at which the fetched value
//! must be indexed by the current color's position within its group. A depth
//! is recorded wherever the walk crosses a task whose `parallel_by` names
//! the property being followed; depths beyond the current lineage at fetch
//! time mean the split has not happened yet and the whole collection is
//! wanted.

use crate::error::{Error, Result};
use crate::graph::{BuiltWorkflow, ScopeNode, TaskNode};
use crate::store::models::TaskKind;

/// One resolved task input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub destination_task_id: String,
    pub destination_property: String,
    pub source_task_id: String,
    pub source_property: String,
    pub parallel_depths: Vec<usize>,
}

struct Frame<'a> {
    scope: &'a ScopeNode,
    /// MethodList task owning the scope's Dag method
    owner: &'a TaskNode,
    /// Number of parallel splits enclosing this scope; also the lineage
    /// index contributed by the owner's own split when it has one
    depth: usize,
}

/// Resolve every task input of the built workflow.
pub fn resolve(built: &BuiltWorkflow) -> Result<Vec<ResolvedSource>> {
    let mut out = Vec::new();

    // The root task consumes the top-level inputs from the input holder.
    for (source_property, destination_property) in &built.root_link.entries {
        out.push(ResolvedSource {
            destination_task_id: built.root.id.clone(),
            destination_property: destination_property.clone(),
            source_task_id: built.input_holder.id.clone(),
            source_property: source_property.clone(),
            parallel_depths: Vec::new(),
        });
    }

    let mut frames = vec![Frame {
        scope: built.root_scope(),
        owner: &built.root,
        depth: 0,
    }];
    visit(built, &mut frames, &mut out)?;
    Ok(out)
}

fn visit<'a>(
    built: &'a BuiltWorkflow,
    frames: &mut Vec<Frame<'a>>,
    out: &mut Vec<ResolvedSource>,
) -> Result<()> {
    let scope = frames.last().expect("at least the root frame").scope;
    let depth = frames.last().expect("at least the root frame").depth;

    for task in &scope.tasks {
        if task.kind == TaskKind::InputConnector {
            continue;
        }

        for (source_name, source_property, destination_property) in
            scope.inbound_entries(&task.name)
        {
            let (source_task_id, source_property, mut depths) =
                resolve_entry(built, frames, frames.len() - 1, source_name, source_property)?;

            if task.parallel_by.as_deref() == Some(destination_property) {
                depths.push(depth + 1);
            }

            out.push(ResolvedSource {
                destination_task_id: task.id.clone(),
                destination_property: destination_property.to_string(),
                source_task_id,
                source_property,
                parallel_depths: depths,
            });
        }

        for method in &task.methods {
            if let Some(inner) = &method.scope {
                let inner_depth = depth + usize::from(task.parallel_by.is_some());
                frames.push(Frame {
                    scope: inner,
                    owner: task,
                    depth: inner_depth,
                });
                visit(built, frames, out)?;
                frames.pop();
            }
        }
    }

    Ok(())
}

/// Follow one (source task, source property) reference at `level` outward to
/// its ultimate producer. Returns the producer task id, producer property
/// and the split depths collected along the way, ascending.
fn resolve_entry(
    built: &BuiltWorkflow,
    frames: &[Frame<'_>],
    level: usize,
    source_name: &str,
    property: &str,
) -> Result<(String, String, Vec<usize>)> {
    let frame = &frames[level];
    let source = frame.scope.task(source_name).ok_or_else(|| {
        Error::Internal(format!("link references unbuilt task '{}'", source_name))
    })?;

    if source.kind != TaskKind::InputConnector {
        // Any non-connector task is an opaque producer of its outputs.
        return Ok((source.id.clone(), property.to_string(), Vec::new()));
    }

    // The input connector passes through the owning task's input of the same
    // name; continue the walk one scope out.
    let owner = frame.owner;

    if level == 0 {
        // Root scope: the owner is the synthetic root, fed by the input
        // holder.
        let feeds = built
            .root_link
            .entries
            .iter()
            .any(|(_, destination)| destination == property);
        if !feeds {
            return Err(Error::Validation(format!(
                "no data source for workflow input '{}'",
                property
            )));
        }
        return Ok((
            built.input_holder.id.clone(),
            property.to_string(),
            Vec::new(),
        ));
    }

    let outer = &frames[level - 1];
    let entry = outer
        .scope
        .inbound_entries(&owner.name)
        .into_iter()
        .find(|(_, _, destination_property)| *destination_property == property);

    let (outer_source, outer_property, _) = entry.ok_or_else(|| {
        Error::Validation(format!(
            "no data source for property '{}' of task '{}'",
            property, owner.name
        ))
    })?;

    let (source_task_id, source_property, mut depths) =
        resolve_entry(built, frames, level - 1, outer_source, outer_property)?;

    if owner.parallel_by.as_deref() == Some(property) {
        depths.push(frame.depth);
    }

    Ok((source_task_id, source_property, depths))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_document;
    use crate::graph::build;

    fn source_for<'a>(
        sources: &'a [ResolvedSource],
        task_id: &str,
        property: &str,
    ) -> &'a ResolvedSource {
        sources
            .iter()
            .find(|s| s.destination_task_id == task_id && s.destination_property == property)
            .unwrap_or_else(|| panic!("no source for ({}, {})", task_id, property))
    }

    #[test]
    fn test_sibling_chain_resolves_without_depths() {
        let built = build(
            &parse_document(
                r#"
                {
                    "tasks": {
                        "a": {"methods": [{"name": "m", "service": "block"}]},
                        "b": {"methods": [{"name": "m", "service": "block"}]}
                    },
                    "links": [
                        {"source": "input connector", "destination": "a",
                         "dataFlow": {"seed": "seed"}},
                        {"source": "a", "destination": "b",
                         "dataFlow": {"out": "in"}}
                    ],
                    "inputs": {"seed": 1}
                }
                "#,
            )
            .unwrap(),
        )
        .unwrap();

        let sources = resolve(&built).unwrap();
        let scope = built.root_scope();
        let a = scope.task("a").unwrap();
        let b = scope.task("b").unwrap();

        let b_in = source_for(&sources, &b.id, "in");
        assert_eq!(b_in.source_task_id, a.id);
        assert_eq!(b_in.source_property, "out");
        assert!(b_in.parallel_depths.is_empty());

        // "seed" resolves through the input connector to the input holder.
        let a_seed = source_for(&sources, &a.id, "seed");
        assert_eq!(a_seed.source_task_id, built.input_holder.id);
        assert!(a_seed.parallel_depths.is_empty());
    }

    #[test]
    fn test_parallel_consumer_records_its_own_split_depth() {
        let built = build(
            &parse_document(
                r#"
                {
                    "tasks": {
                        "split": {
                            "methods": [{"name": "m", "service": "block"}],
                            "parallelBy": "items"
                        }
                    },
                    "links": [
                        {"source": "input connector", "destination": "split",
                         "dataFlow": {"items": "items", "mode": "mode"}}
                    ],
                    "inputs": {"items": [1, 2, 3], "mode": "fast"}
                }
                "#,
            )
            .unwrap(),
        )
        .unwrap();

        let sources = resolve(&built).unwrap();
        let split = built.root_scope().task("split").unwrap();

        // The split property is indexed at lineage depth 1; the other input
        // stays scalar.
        assert_eq!(
            source_for(&sources, &split.id, "items").parallel_depths,
            vec![1]
        );
        assert!(source_for(&sources, &split.id, "mode")
            .parallel_depths
            .is_empty());
    }

    #[test]
    fn test_nested_scope_inherits_owner_split_for_the_split_property() {
        let built = build(
            &parse_document(
                r#"
                {
                    "tasks": {
                        "fan": {
                            "parallelBy": "lane",
                            "methods": [{
                                "name": "per-lane",
                                "service": "workflow",
                                "parameters": {
                                    "tasks": {
                                        "work": {"methods": [{"name": "m", "service": "block"}]}
                                    },
                                    "links": [
                                        {"source": "input connector", "destination": "work",
                                         "dataFlow": {"lane": "lane", "ref": "ref"}}
                                    ]
                                }
                            }]
                        }
                    },
                    "links": [
                        {"source": "input connector", "destination": "fan",
                         "dataFlow": {"lanes": "lane", "ref": "ref"}}
                    ],
                    "inputs": {"lanes": ["L1", "L2"], "ref": "hg38"}
                }
                "#,
            )
            .unwrap(),
        )
        .unwrap();

        let sources = resolve(&built).unwrap();
        let fan = built.root_scope().task("fan").unwrap();
        let inner = fan.methods[0].scope.as_ref().unwrap();
        let work = inner.task("work").unwrap();

        // Inside the fan-out, the split property is the per-instance
        // element: one indexing step at the owner's split depth.
        let lane = source_for(&sources, &work.id, "lane");
        assert_eq!(lane.source_task_id, built.input_holder.id);
        assert_eq!(lane.source_property, "lanes");
        assert_eq!(lane.parallel_depths, vec![1]);

        // A non-split property crossing the same boundary stays scalar.
        assert!(source_for(&sources, &work.id, "ref")
            .parallel_depths
            .is_empty());
    }

    #[test]
    fn test_chained_splits_accumulate_depths_in_order() {
        let built = build(
            &parse_document(
                r#"
                {
                    "tasks": {
                        "outer": {
                            "parallelBy": "batch",
                            "methods": [{
                                "name": "per-batch",
                                "service": "workflow",
                                "parameters": {
                                    "tasks": {
                                        "inner": {
                                            "parallelBy": "batch",
                                            "methods": [{"name": "m", "service": "block"}]
                                        }
                                    },
                                    "links": [
                                        {"source": "input connector", "destination": "inner",
                                         "dataFlow": {"batch": "batch"}}
                                    ]
                                }
                            }]
                        }
                    },
                    "links": [
                        {"source": "input connector", "destination": "outer",
                         "dataFlow": {"batches": "batch"}}
                    ],
                    "inputs": {"batches": [[1, 2], [3]]}
                }
                "#,
            )
            .unwrap(),
        )
        .unwrap();

        let sources = resolve(&built).unwrap();
        let outer = built.root_scope().task("outer").unwrap();
        let inner_scope = outer.methods[0].scope.as_ref().unwrap();
        let inner = inner_scope.task("inner").unwrap();

        // outer split at depth 1, inner split at depth 2.
        assert_eq!(
            source_for(&sources, &inner.id, "batch").parallel_depths,
            vec![1, 2]
        );
    }

    #[test]
    fn test_unwired_nested_input_is_an_error() {
        let built = build(
            &parse_document(
                r#"
                {
                    "tasks": {
                        "outer": {
                            "methods": [{
                                "name": "flow",
                                "service": "workflow",
                                "parameters": {
                                    "tasks": {
                                        "inner": {"methods": [{"name": "m", "service": "block"}]}
                                    },
                                    "links": [
                                        {"source": "input connector", "destination": "inner",
                                         "dataFlow": {"ghost": "ghost"}}
                                    ]
                                }
                            }]
                        }
                    },
                    "links": [],
                    "inputs": {}
                }
                "#,
            )
            .unwrap(),
        )
        .unwrap();

        assert!(matches!(resolve(&built), Err(Error::Validation(_))));
    }
}
