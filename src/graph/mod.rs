//! Workflow graph construction.
//!
//! The builder turns a validated submission document into the in-memory
//! Task/Method/Link tree that the data-flow resolver, the net translator and
//! the store all consume. A synthetic root MethodList task wraps the whole
//! submission as a single Dag method, so the top-level graph is structurally
//! identical to a nested one; a synthetic InputHolder task is linked to the
//! root to seed the top-level input values as a zero-color execution's
//! outputs.

pub mod dataflow;
pub mod topsort;

use serde_json::Value;
use uuid::Uuid;

use crate::document::{
    validate_document, DagSpec, Document, MethodSpec, TaskSpec, WebhookSpec, INPUT_CONNECTOR,
    OUTPUT_CONNECTOR,
};
use crate::error::{Error, Result};
use crate::store::models::{MethodKind, TaskKind};
use topsort::topological_order;

/// Sentinel topological index of the root, connectors and the input holder.
pub const UNORDERED_INDEX: i64 = -1;

/// A built task node.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub name: String,
    pub kind: TaskKind,
    pub topological_index: i64,
    pub parallel_by: Option<String>,
    pub methods: Vec<MethodNode>,
    /// (status name, url) pairs
    pub webhooks: Vec<(String, String)>,
}

impl TaskNode {
    fn synthetic(name: &str, kind: TaskKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
            topological_index: UNORDERED_INDEX,
            parallel_by: None,
            methods: Vec::new(),
            webhooks: Vec::new(),
        }
    }

    pub fn is_connector(&self) -> bool {
        matches!(
            self.kind,
            TaskKind::InputConnector | TaskKind::OutputConnector
        )
    }
}

/// A built method node.
#[derive(Debug, Clone)]
pub struct MethodNode {
    pub id: String,
    pub name: String,
    pub index: i64,
    pub kind: MethodKind,
    pub parameters: Value,
    pub service_url: Option<String>,
    /// Child scope of a Dag method
    pub scope: Option<ScopeNode>,
    pub webhooks: Vec<(String, String)>,
}

/// One DAG scope: its tasks (connectors included) in topological order, and
/// the declared edges between them.
#[derive(Debug, Clone)]
pub struct ScopeNode {
    pub tasks: Vec<TaskNode>,
    pub links: Vec<LinkEdge>,
}

impl ScopeNode {
    pub fn task(&self, name: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Whether any link targets the named task.
    pub fn has_upstream(&self, task_name: &str) -> bool {
        self.links.iter().any(|link| link.destination == task_name)
    }

    /// Inbound (source task name, source property, destination property)
    /// triples of one task.
    pub fn inbound_entries(&self, task_name: &str) -> Vec<(&str, &str, &str)> {
        let mut entries = Vec::new();
        for link in &self.links {
            if link.destination != task_name {
                continue;
            }
            for (source_property, destination_property) in &link.entries {
                entries.push((
                    link.source.as_str(),
                    source_property.as_str(),
                    destination_property.as_str(),
                ));
            }
        }
        entries
    }
}

/// One edge of a scope, with its property mappings.
#[derive(Debug, Clone)]
pub struct LinkEdge {
    pub source: String,
    pub destination: String,
    /// (source property, destination property) pairs
    pub entries: Vec<(String, String)>,
}

/// The fully built workflow graph.
#[derive(Debug, Clone)]
pub struct BuiltWorkflow {
    pub id: String,
    pub name: String,
    /// Synthetic root MethodList wrapping the submission as one Dag method
    pub root: TaskNode,
    /// Synthetic task whose zero-color execution carries the inputs
    pub input_holder: TaskNode,
    /// input holder → root, one entry per top-level input name
    pub root_link: LinkEdge,
    pub inputs: serde_json::Map<String, Value>,
    /// Workflow-level webhooks
    pub webhooks: Vec<(String, String)>,
}

impl BuiltWorkflow {
    /// The root Dag method's scope.
    pub fn root_scope(&self) -> &ScopeNode {
        self.root.methods[0]
            .scope
            .as_ref()
            .expect("root method is always a Dag")
    }
}

/// Validate a document and build its graph.
pub fn build(document: &Document) -> Result<BuiltWorkflow> {
    validate_document(document)?;

    let name = document
        .name
        .clone()
        .unwrap_or_else(|| format!("workflow-{}", &Uuid::new_v4().to_string()[..8]));

    let scope = build_scope(&document.as_dag())?;

    let mut root = TaskNode::synthetic(&name, TaskKind::MethodList);
    root.webhooks = flatten_webhooks(&document.webhooks);
    root.methods.push(MethodNode {
        id: Uuid::new_v4().to_string(),
        name: name.clone(),
        index: 0,
        kind: MethodKind::Dag,
        parameters: Value::Null,
        service_url: None,
        scope: Some(scope),
        webhooks: Vec::new(),
    });

    let input_holder = TaskNode::synthetic("input holder", TaskKind::InputHolder);
    let root_link = LinkEdge {
        source: input_holder.name.clone(),
        destination: root.name.clone(),
        entries: document
            .inputs
            .keys()
            .map(|k| (k.clone(), k.clone()))
            .collect(),
    };

    Ok(BuiltWorkflow {
        id: Uuid::new_v4().to_string(),
        name,
        root,
        input_holder,
        root_link,
        inputs: document.inputs.clone(),
        webhooks: flatten_webhooks(&document.webhooks),
    })
}

fn build_scope(dag: &DagSpec) -> Result<ScopeNode> {
    let mut node_names: Vec<String> = dag.tasks.keys().cloned().collect();
    node_names.push(INPUT_CONNECTOR.to_string());
    node_names.push(OUTPUT_CONNECTOR.to_string());

    let edges: Vec<(String, String)> = dag
        .links
        .iter()
        .map(|link| (link.source.clone(), link.destination.clone()))
        .collect();

    // Validation already proved acyclicity; scope names are gone here, so a
    // failure would be an internal inconsistency.
    let order = topological_order(&node_names, &edges, INPUT_CONNECTOR)
        .map_err(|_| Error::Internal("cycle slipped past validation".to_string()))?;

    let mut tasks = Vec::with_capacity(order.len());
    let mut next_index: i64 = 0;
    for task_name in &order {
        match task_name.as_str() {
            INPUT_CONNECTOR => {
                tasks.push(TaskNode::synthetic(INPUT_CONNECTOR, TaskKind::InputConnector))
            }
            OUTPUT_CONNECTOR => {
                tasks.push(TaskNode::synthetic(OUTPUT_CONNECTOR, TaskKind::OutputConnector))
            }
            user => {
                let spec = &dag.tasks[user];
                tasks.push(build_task(user, spec, next_index)?);
                next_index += 1;
            }
        }
    }

    let links = dag
        .links
        .iter()
        .map(|link| LinkEdge {
            source: link.source.clone(),
            destination: link.destination.clone(),
            entries: link
                .data_flow
                .iter()
                .flat_map(|(source_property, targets)| {
                    targets
                        .names()
                        .map(|destination_property| {
                            (source_property.clone(), destination_property.to_string())
                        })
                        .collect::<Vec<_>>()
                })
                .collect(),
        })
        .collect();

    Ok(ScopeNode { tasks, links })
}

fn build_task(name: &str, spec: &TaskSpec, topological_index: i64) -> Result<TaskNode> {
    let methods = spec
        .methods
        .iter()
        .enumerate()
        .map(|(index, method)| build_method(method, index as i64))
        .collect::<Result<Vec<_>>>()?;

    Ok(TaskNode {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        kind: TaskKind::MethodList,
        topological_index,
        parallel_by: spec.parallel_by.clone(),
        methods,
        webhooks: flatten_webhooks(&spec.webhooks),
    })
}

fn build_method(spec: &MethodSpec, index: i64) -> Result<MethodNode> {
    let (kind, scope) = match spec.service.as_str() {
        "job" => (MethodKind::Job, None),
        "block" => (MethodKind::Block, None),
        "converge" => (MethodKind::Converge, None),
        "workflow" => {
            let nested = spec.nested_dag()?;
            (MethodKind::Dag, Some(build_scope(&nested)?))
        }
        other => {
            return Err(Error::Validation(format!(
                "method '{}' names unknown service '{}'",
                spec.name, other
            )))
        }
    };

    Ok(MethodNode {
        id: Uuid::new_v4().to_string(),
        name: spec.name.clone(),
        index,
        kind,
        parameters: spec.parameters.clone(),
        service_url: spec.service_url.clone(),
        scope,
        webhooks: flatten_webhooks(&spec.webhooks),
    })
}

fn flatten_webhooks(spec: &WebhookSpec) -> Vec<(String, String)> {
    let mut hooks = Vec::new();
    for (status_name, urls) in spec {
        for url in urls.urls() {
            hooks.push((status_name.clone(), url.to_string()));
        }
    }
    hooks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_document;

    fn pipeline_doc() -> Document {
        parse_document(
            r#"
            {
                "name": "pipeline",
                "tasks": {
                    "transform": {"methods": [{"name": "run", "service": "block"}]},
                    "fetch": {"methods": [
                        {"name": "primary", "service": "job",
                         "serviceUrl": "http://jobs/v1"},
                        {"name": "fallback", "service": "block"}
                    ]}
                },
                "links": [
                    {"source": "input connector", "destination": "fetch",
                     "dataFlow": {"url": "url"}},
                    {"source": "fetch", "destination": "transform",
                     "dataFlow": {"body": "body"}},
                    {"source": "transform", "destination": "output connector",
                     "dataFlow": {"report": "report"}}
                ],
                "inputs": {"url": "http://example.com"}
            }
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_root_wraps_document_as_dag_method() {
        let built = build(&pipeline_doc()).unwrap();

        assert_eq!(built.root.kind, TaskKind::MethodList);
        assert_eq!(built.root.topological_index, UNORDERED_INDEX);
        assert_eq!(built.root.methods.len(), 1);
        assert_eq!(built.root.methods[0].kind, MethodKind::Dag);

        let scope = built.root_scope();
        assert_eq!(scope.tasks.len(), 4); // two user tasks + connectors
        assert_eq!(scope.tasks[0].kind, TaskKind::InputConnector);
    }

    #[test]
    fn test_topological_indices_follow_scope_order() {
        let built = build(&pipeline_doc()).unwrap();
        let scope = built.root_scope();

        let fetch = scope.task("fetch").unwrap();
        let transform = scope.task("transform").unwrap();
        assert_eq!(fetch.topological_index, 0);
        assert_eq!(transform.topological_index, 1);

        for connector in [INPUT_CONNECTOR, OUTPUT_CONNECTOR] {
            assert_eq!(
                scope.task(connector).unwrap().topological_index,
                UNORDERED_INDEX
            );
        }
    }

    #[test]
    fn test_methods_keep_declared_order() {
        let built = build(&pipeline_doc()).unwrap();
        let fetch = built.root_scope().task("fetch").unwrap();
        assert_eq!(fetch.methods.len(), 2);
        assert_eq!(fetch.methods[0].name, "primary");
        assert_eq!(fetch.methods[0].index, 0);
        assert_eq!(fetch.methods[0].kind, MethodKind::Job);
        assert_eq!(fetch.methods[1].index, 1);
        assert_eq!(fetch.methods[1].kind, MethodKind::Block);
    }

    #[test]
    fn test_input_holder_linked_per_input() {
        let built = build(&pipeline_doc()).unwrap();
        assert_eq!(built.input_holder.kind, TaskKind::InputHolder);
        assert_eq!(built.root_link.source, "input holder");
        assert_eq!(built.root_link.destination, "pipeline");
        assert_eq!(
            built.root_link.entries,
            vec![("url".to_string(), "url".to_string())]
        );
    }

    #[test]
    fn test_nested_workflow_method_builds_its_own_scope() {
        let doc = parse_document(
            r#"
            {
                "tasks": {
                    "outer": {
                        "methods": [{
                            "name": "inner-flow",
                            "service": "workflow",
                            "parameters": {
                                "tasks": {
                                    "inner": {"methods": [{"name": "m", "service": "block"}]}
                                },
                                "links": [
                                    {"source": "input connector", "destination": "inner"},
                                    {"source": "inner", "destination": "output connector"}
                                ]
                            }
                        }]
                    }
                },
                "inputs": {}
            }
            "#,
        )
        .unwrap();

        let built = build(&doc).unwrap();
        let outer = built.root_scope().task("outer").unwrap();
        let nested = outer.methods[0].scope.as_ref().unwrap();
        assert!(nested.task("inner").is_some());
        assert_eq!(nested.task("inner").unwrap().topological_index, 0);
    }

    #[test]
    fn test_invalid_document_is_rejected_before_building() {
        let doc = parse_document(
            r#"
            {
                "tasks": {
                    "a": {"methods": [{"name": "m", "service": "block"}]}
                },
                "links": [
                    {"source": "input connector", "destination": "a",
                     "dataFlow": {"seed": "seed"}}
                ],
                "inputs": {}
            }
            "#,
        )
        .unwrap();
        assert!(matches!(
            build(&doc),
            Err(Error::MissingInputs { .. })
        ));
    }

    #[test]
    fn test_generated_name_when_omitted() {
        let doc = parse_document(
            r#"{"tasks": {"a": {"methods": [{"name": "m", "service": "block"}]}},
                "inputs": {}}"#,
        )
        .unwrap();
        let built = build(&doc).unwrap();
        assert!(built.name.starts_with("workflow-"));
    }
}
