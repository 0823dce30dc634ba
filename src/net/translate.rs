//! Net translation.
//!
//! Walks a built workflow graph and emits the compiled plan. Each task and
//! method variant contributes its own transition fragment through a shared
//! contract: attach at an input place, return a success place and an
//! optional failure place. Place names are structural paths derived from
//! task and method names, so rebuilding the same document yields an
//! identical structure.

use crate::config::Config;
use crate::graph::{BuiltWorkflow, MethodNode, TaskNode};
use crate::store::models::{MethodKind, TaskKind};

use super::{Action, ActionKind, Plan, ResponsePlaces, Transition};

/// Translate a built workflow into its compiled plan.
///
/// The initial marking is a single token at the root task's input place, so
/// the root scope activates exactly like a nested one: the entry transition
/// seeds the failure-limit token and the input connector announces the root
/// DAG as running.
pub fn translate(config: &Config, built: &BuiltWorkflow) -> Plan {
    let mut translator = Translator {
        base_url: config.callback_base_url(),
        plan: Plan {
            initial_marking: Vec::new(),
            transitions: Vec::new(),
        },
    };

    let root_input = "root.input".to_string();
    translator.attach_task(&built.root, "root", &root_input);
    translator.plan.initial_marking = vec![root_input];
    translator.plan
}

struct Translator {
    base_url: String,
    plan: Plan,
}

impl Translator {
    fn transition(&mut self, inputs: Vec<String>, outputs: Vec<String>, action: Option<Action>) {
        self.plan.transitions.push(Transition {
            inputs,
            outputs,
            action,
        });
    }

    fn notify(&self, url: String, response_places: ResponsePlaces) -> Action {
        Action {
            kind: ActionKind::Notify,
            url: Some(url),
            response_places: Some(response_places),
            requested_data: None,
        }
    }

    fn bare(&self, kind: ActionKind) -> Action {
        Action {
            kind,
            url: None,
            response_places: None,
            requested_data: None,
        }
    }

    fn task_url(&self, task_id: &str, callback_type: &str) -> String {
        format!(
            "{}/v1/callbacks/tasks/{}?callback_type={}",
            self.base_url, task_id, callback_type
        )
    }

    fn method_url(&self, method_id: &str, callback_type: &str) -> String {
        format!(
            "{}/v1/callbacks/methods/{}?callback_type={}",
            self.base_url, method_id, callback_type
        )
    }

    /// Attach a MethodList task: chain its methods so method i's failure
    /// feeds method i+1's input, with the split/join fragments wrapped
    /// around the chain when the task is parallel.
    fn attach_task(
        &mut self,
        task: &TaskNode,
        path: &str,
        input: &str,
    ) -> (String, Option<String>) {
        let success = format!("{}.success", path);
        let failure = format!("{}.failure", path);

        let (entry, chain_success, chain_failure) = if let Some(parallel_by) = &task.parallel_by {
            // Query the collection size, materialize the color group, then
            // split one token per color.
            let size_ok = format!("{}.size.ok", path);
            self.transition(
                vec![input.to_string()],
                vec![format!("{}.size.wait", path)],
                Some(Action {
                    kind: ActionKind::Notify,
                    url: Some(self.task_url(&task.id, "get_split_size")),
                    response_places: Some(ResponsePlaces {
                        done: Some(size_ok.clone()),
                        failure: Some(failure.clone()),
                        ..Default::default()
                    }),
                    requested_data: Some(vec![parallel_by.clone()]),
                }),
            );
            let grouped = format!("{}.group.created", path);
            self.transition(
                vec![size_ok],
                vec![grouped.clone()],
                Some(self.bare(ActionKind::CreateColorGroup)),
            );
            let split = format!("{}.split", path);
            self.transition(
                vec![grouped],
                vec![split.clone()],
                Some(self.bare(ActionKind::Split)),
            );
            (
                split,
                format!("{}.methods.success", path),
                format!("{}.methods.failure", path),
            )
        } else {
            (input.to_string(), success.clone(), failure.clone())
        };

        let mut current = entry;
        for method in &task.methods {
            let method_path = format!("{}.{}", path, method.name);
            let (method_success, method_failure) =
                self.attach_method(&task.id, method, &method_path, &current);
            self.transition(vec![method_success], vec![chain_success.clone()], None);
            current = method_failure;
        }
        // The last method's failure trips the whole task.
        self.transition(vec![current], vec![chain_failure.clone()], None);

        if task.parallel_by.is_some() {
            // Barrier on every color, then materialize array results at the
            // parent color; a per-color failure is re-colored to the parent
            // before tripping the task.
            let joined = format!("{}.joined", path);
            self.transition(
                vec![chain_success],
                vec![joined.clone()],
                Some(self.bare(ActionKind::Join)),
            );
            self.transition(
                vec![joined],
                vec![format!("{}.array.wait", path)],
                Some(self.notify(
                    self.task_url(&task.id, "create_array_result"),
                    ResponsePlaces {
                        success: Some(success.clone()),
                        failure: Some(failure.clone()),
                        ..Default::default()
                    },
                )),
            );
            self.transition(
                vec![chain_failure],
                vec![failure.clone()],
                Some(self.bare(ActionKind::ConvertToParentColor)),
            );
        }

        (success, Some(failure))
    }

    fn attach_method(
        &mut self,
        _task_id: &str,
        method: &MethodNode,
        path: &str,
        input: &str,
    ) -> (String, String) {
        match method.kind {
            MethodKind::Job | MethodKind::Block | MethodKind::Converge => {
                // Single notify-and-wait: fire the execute callback and
                // block until a success or failure response token arrives.
                let success = format!("{}.success", path);
                let failure = format!("{}.failure", path);
                self.transition(
                    vec![input.to_string()],
                    vec![format!("{}.wait", path)],
                    Some(self.notify(
                        self.method_url(&method.id, "execute"),
                        ResponsePlaces {
                            success: Some(success.clone()),
                            failure: Some(failure.clone()),
                            ..Default::default()
                        },
                    )),
                );
                (success, failure)
            }
            MethodKind::Dag => self.attach_dag(method, path, input),
        }
    }

    /// Attach a Dag method: recursively attach the child tasks, AND-join
    /// each child's input from its upstream dependencies, collect failures
    /// behind a single failure-limit token, and fire the done notification
    /// once every real child plus the output connector succeed.
    fn attach_dag(&mut self, method: &MethodNode, path: &str, input: &str) -> (String, String) {
        let scope = method.scope.as_ref().expect("dag method has a scope");
        let success = format!("{}.success", path);
        let failure = format!("{}.failure", path);
        let limit = format!("{}.limit", path);
        let failing = format!("{}.failing", path);

        let input_connector = &scope.tasks[0];
        debug_assert_eq!(input_connector.kind, TaskKind::InputConnector);
        let ic_path = format!("{}.{}", path, input_connector.name);
        let ic_input = format!("{}.input", ic_path);
        let ic_success = format!("{}.success", ic_path);

        // Entry: start the input connector and seed this activation's
        // single-failure budget.
        self.transition(
            vec![input.to_string()],
            vec![ic_input.clone(), limit.clone()],
            None,
        );

        // Input connector: announce the DAG as running, then pass through.
        self.transition(
            vec![ic_input],
            vec![format!("{}.wait", ic_path)],
            Some(self.notify(
                self.method_url(&method.id, "running"),
                ResponsePlaces {
                    done: Some(ic_success.clone()),
                    ..Default::default()
                },
            )),
        );

        // Fan the start token out to every edge leaving the input connector
        // and to every child with no upstream dependency.
        let mut start_outputs: Vec<String> = Vec::new();
        for link in &scope.links {
            if link.source == input_connector.name {
                start_outputs.push(edge_place(path, &link.source, &link.destination));
            }
        }
        for child in &scope.tasks[1..] {
            if scope.has_upstream(&child.name) {
                continue;
            }
            start_outputs.push(edge_place(path, &input_connector.name, &child.name));
        }
        self.transition(vec![ic_success], start_outputs, None);

        let mut done_inputs: Vec<String> = Vec::new();
        for child in &scope.tasks[1..] {
            let child_path = format!("{}.{}", path, child.name);
            let child_input = format!("{}.input", child_path);

            // AND-join of the upstream dependency edges.
            let mut joined_inputs: Vec<String> = scope
                .links
                .iter()
                .filter(|link| link.destination == child.name)
                .map(|link| edge_place(path, &link.source, &link.destination))
                .collect();
            if joined_inputs.is_empty() {
                joined_inputs.push(edge_place(path, &input_connector.name, &child.name));
            }
            joined_inputs.sort();
            self.transition(joined_inputs, vec![child_input.clone()], None);

            match child.kind {
                TaskKind::OutputConnector => {
                    // Copy outputs to the parent scope, color-lineage aware.
                    let oc_success = format!("{}.success", child_path);
                    let oc_failure = format!("{}.failure", child_path);
                    self.transition(
                        vec![child_input],
                        vec![format!("{}.wait", child_path)],
                        Some(self.notify(
                            self.task_url(&child.id, "copy_outputs"),
                            ResponsePlaces {
                                success: Some(oc_success.clone()),
                                failure: Some(oc_failure.clone()),
                                ..Default::default()
                            },
                        )),
                    );
                    self.transition(
                        vec![oc_failure, limit.clone()],
                        vec![failing.clone()],
                        None,
                    );
                    done_inputs.push(oc_success);
                }
                _ => {
                    let (child_success, child_failure) =
                        self.attach_task(child, &child_path, &child_input);

                    if let Some(child_failure) = child_failure {
                        // First failure wins: the limit place holds one
                        // token, later failures find none and stall.
                        self.transition(
                            vec![child_failure, limit.clone()],
                            vec![failing.clone()],
                            None,
                        );
                    }

                    // Duplicate the success token: one per outgoing edge
                    // plus this child's done marker.
                    let mut fan_outputs: Vec<String> = scope
                        .links
                        .iter()
                        .filter(|link| link.source == child.name)
                        .map(|link| edge_place(path, &link.source, &link.destination))
                        .collect();
                    let done_marker = format!("{}.done", child_path);
                    fan_outputs.push(done_marker.clone());
                    self.transition(vec![child_success], fan_outputs, None);
                    done_inputs.push(done_marker);
                }
            }
        }

        self.transition(
            vec![failing],
            vec![format!("{}.failed.wait", path)],
            Some(self.notify(
                self.method_url(&method.id, "failed"),
                ResponsePlaces {
                    done: Some(failure.clone()),
                    ..Default::default()
                },
            )),
        );

        done_inputs.sort();
        self.transition(
            done_inputs,
            vec![format!("{}.done.wait", path)],
            Some(self.notify(
                self.method_url(&method.id, "done"),
                ResponsePlaces {
                    done: Some(success.clone()),
                    ..Default::default()
                },
            )),
        );

        (success, failure)
    }
}

fn edge_place(dag_path: &str, source: &str, destination: &str) -> String {
    format!("{}.edge.{}:{}", dag_path, source, destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_document;
    use crate::graph::build;

    fn plan_for(json: &str) -> Plan {
        let document = parse_document(json).unwrap();
        let built = build(&document).unwrap();
        translate(&Config::default(), &built)
    }

    const TWO_METHOD_DOC: &str = r#"
    {
        "name": "retry",
        "tasks": {
            "work": {"methods": [
                {"name": "fast", "service": "job", "serviceUrl": "http://jobs/v1"},
                {"name": "careful", "service": "job", "serviceUrl": "http://jobs/v1"}
            ]}
        },
        "links": [
            {"source": "input connector", "destination": "work",
             "dataFlow": {"seed": "seed"}},
            {"source": "work", "destination": "output connector",
             "dataFlow": {"out": "out"}}
        ],
        "inputs": {"seed": 1}
    }
    "#;

    #[test]
    fn test_initial_marking_is_root_input() {
        let plan = plan_for(TWO_METHOD_DOC);
        assert_eq!(plan.initial_marking, vec!["root.input".to_string()]);
    }

    #[test]
    fn test_method_failure_feeds_next_method_input() {
        let plan = plan_for(TWO_METHOD_DOC);

        // The second method's execute transition must take the first
        // method's failure place as its input.
        let careful = plan
            .transitions
            .iter()
            .find(|t| {
                t.action
                    .as_ref()
                    .and_then(|a| a.url.as_deref())
                    .is_some_and(|u| u.contains("callback_type=execute"))
                    && t.inputs == vec!["root.retry.work.fast.failure".to_string()]
            })
            .expect("fallback method chained to first failure");
        assert_eq!(careful.outputs, vec!["root.retry.work.careful.wait".to_string()]);

        // The last method's failure trips the task failure place.
        assert!(plan.transitions.iter().any(|t| {
            t.inputs == vec!["root.retry.work.careful.failure".to_string()]
                && t.outputs == vec!["root.retry.work.failure".to_string()]
        }));
    }

    #[test]
    fn test_child_failure_gated_by_limit_token() {
        let plan = plan_for(TWO_METHOD_DOC);
        let collect = plan
            .transitions
            .iter()
            .find(|t| t.inputs.contains(&"root.retry.limit".to_string()))
            .expect("failure collection gated by the limit place");
        assert!(collect.inputs.contains(&"root.retry.work.failure".to_string()));
        assert_eq!(collect.outputs, vec!["root.retry.failing".to_string()]);

        // The limit token is seeded by the DAG entry transition.
        assert!(plan.transitions.iter().any(|t| {
            t.inputs == vec!["root.input".to_string()]
                && t.outputs.contains(&"root.retry.limit".to_string())
        }));
    }

    #[test]
    fn test_done_waits_for_children_and_output_connector() {
        let plan = plan_for(TWO_METHOD_DOC);
        let done = plan
            .notifications_containing("callback_type=done")
            .into_iter()
            .next()
            .expect("done notification");
        assert!(done.inputs.contains(&"root.retry.work.done".to_string()));
        assert!(done
            .inputs
            .contains(&"root.retry.output connector.success".to_string()));
    }

    #[test]
    fn test_parallel_task_carries_split_and_join_fragments() {
        let plan = plan_for(
            r#"
            {
                "name": "fanout",
                "tasks": {
                    "split": {
                        "parallelBy": "items",
                        "methods": [{"name": "m", "service": "block"}]
                    }
                },
                "links": [
                    {"source": "input connector", "destination": "split",
                     "dataFlow": {"items": "items"}}
                ],
                "inputs": {"items": [1, 2]}
            }
            "#,
        );

        let kinds: Vec<ActionKind> = plan
            .transitions
            .iter()
            .filter_map(|t| t.action.as_ref().map(|a| a.kind))
            .collect();
        for expected in [
            ActionKind::CreateColorGroup,
            ActionKind::Split,
            ActionKind::Join,
            ActionKind::ConvertToParentColor,
        ] {
            assert!(kinds.contains(&expected), "missing {:?}", expected);
        }

        let size_query = plan
            .notifications_containing("callback_type=get_split_size")
            .into_iter()
            .next()
            .expect("split size query");
        assert_eq!(
            size_query.action.as_ref().unwrap().requested_data,
            Some(vec!["items".to_string()])
        );

        assert!(!plan
            .notifications_containing("callback_type=create_array_result")
            .is_empty());
    }

    #[test]
    fn test_structure_is_deterministic_across_rebuilds() {
        let first = plan_for(TWO_METHOD_DOC).structure();
        let second = plan_for(TWO_METHOD_DOC).structure();
        assert_eq!(first, second);
    }

    #[test]
    fn test_and_join_over_multiple_upstream_edges() {
        let plan = plan_for(
            r#"
            {
                "name": "diamond",
                "tasks": {
                    "left": {"methods": [{"name": "m", "service": "block"}]},
                    "right": {"methods": [{"name": "m", "service": "block"}]},
                    "merge": {"methods": [{"name": "m", "service": "block"}]}
                },
                "links": [
                    {"source": "input connector", "destination": "left"},
                    {"source": "input connector", "destination": "right"},
                    {"source": "left", "destination": "merge"},
                    {"source": "right", "destination": "merge"}
                ],
                "inputs": {}
            }
            "#,
        );

        let join = plan
            .transitions
            .iter()
            .find(|t| t.outputs == vec!["root.diamond.merge.input".to_string()])
            .expect("merge AND-join");
        assert_eq!(
            join.inputs,
            vec![
                "root.diamond.edge.left:merge".to_string(),
                "root.diamond.edge.right:merge".to_string(),
            ]
        );
    }
}
