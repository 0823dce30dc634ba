//! Structural validation of a submission document.
//!
//! All checks run before anything is persisted; a failing document leaves no
//! state behind. Nested workflow methods are validated recursively with the
//! same rules as the root scope.

use std::collections::BTreeSet;

use super::{DagSpec, Document, MethodSpec, INPUT_CONNECTOR, OUTPUT_CONNECTOR};
use crate::error::{Error, Result};
use crate::graph::topsort::topological_order;

/// Validate a submission document.
///
/// Checks, per DAG scope: duplicate (source, destination) link pairs,
/// reserved task names, unknown link endpoints, single-producer data flow,
/// acyclicity, and well-formed method parameters. At the root, every
/// property consumed from the input connector must be present in `inputs`.
pub fn validate_document(document: &Document) -> Result<()> {
    let root = document.as_dag();
    validate_scope(&root, "root")?;

    let mut missing = BTreeSet::new();
    for link in &root.links {
        if link.source != INPUT_CONNECTOR {
            continue;
        }
        for source_property in link.data_flow.keys() {
            if !document.inputs.contains_key(source_property) {
                missing.insert(source_property.clone());
            }
        }
    }
    if !missing.is_empty() {
        return Err(Error::MissingInputs {
            missing: missing.into_iter().collect(),
        });
    }

    Ok(())
}

fn validate_scope(dag: &DagSpec, scope: &str) -> Result<()> {
    if dag.tasks.is_empty() {
        return Err(Error::Validation(format!(
            "DAG '{}' declares no tasks",
            scope
        )));
    }

    for name in dag.tasks.keys() {
        if name == INPUT_CONNECTOR || name == OUTPUT_CONNECTOR {
            return Err(Error::IllegalTaskName {
                dag: scope.to_string(),
                name: name.clone(),
            });
        }
    }

    let mut seen_pairs = BTreeSet::new();
    let mut seen_targets = BTreeSet::new();
    for link in &dag.links {
        if !seen_pairs.insert((link.source.clone(), link.destination.clone())) {
            return Err(Error::DuplicateLink {
                link_source: link.source.clone(),
                destination: link.destination.clone(),
            });
        }

        for endpoint in [&link.source, &link.destination] {
            let is_connector = endpoint == INPUT_CONNECTOR || endpoint == OUTPUT_CONNECTOR;
            if !is_connector && !dag.tasks.contains_key(endpoint) {
                return Err(Error::Validation(format!(
                    "link references unknown task '{}' in DAG '{}'",
                    endpoint, scope
                )));
            }
        }

        for targets in link.data_flow.values() {
            for destination_property in targets.names() {
                if !seen_targets.insert((link.destination.clone(), destination_property.to_string()))
                {
                    return Err(Error::DuplicateDataFlow {
                        task: link.destination.clone(),
                        property: destination_property.to_string(),
                    });
                }
            }
        }
    }

    check_acyclic(dag, scope)?;

    for (task_name, task) in &dag.tasks {
        if task.methods.is_empty() {
            return Err(Error::Validation(format!(
                "task '{}' in DAG '{}' declares no methods",
                task_name, scope
            )));
        }

        let mut method_names = BTreeSet::new();
        for method in &task.methods {
            if !method_names.insert(method.name.as_str()) {
                return Err(Error::Validation(format!(
                    "task '{}' in DAG '{}' has duplicate method name '{}'",
                    task_name, scope, method.name
                )));
            }
            validate_method(method, task_name, scope)?;
        }
    }

    Ok(())
}

fn validate_method(method: &MethodSpec, task_name: &str, scope: &str) -> Result<()> {
    match method.service.as_str() {
        "job" | "block" => Ok(()),
        "converge" => method.converge_input_names().map(|_| ()),
        "workflow" => {
            let nested = method.nested_dag()?;
            validate_scope(&nested, &method.name)
        }
        other => Err(Error::Validation(format!(
            "method '{}' of task '{}' in DAG '{}' names unknown service '{}'",
            method.name, task_name, scope, other
        ))),
    }
}

fn check_acyclic(dag: &DagSpec, scope: &str) -> Result<()> {
    let mut nodes: Vec<String> = dag.tasks.keys().cloned().collect();
    nodes.push(INPUT_CONNECTOR.to_string());
    nodes.push(OUTPUT_CONNECTOR.to_string());

    let edges: Vec<(String, String)> = dag
        .links
        .iter()
        .map(|link| (link.source.clone(), link.destination.clone()))
        .collect();

    topological_order(&nodes, &edges, INPUT_CONNECTOR).map_err(|_| Error::DagCycle {
        dag: scope.to_string(),
    })?;
    Ok(())
}
