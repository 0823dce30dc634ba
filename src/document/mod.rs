//! Workflow submission document.
//!
//! These are the wire types a client POSTs to create a workflow: a map of
//! named tasks (each offering one or more alternative methods), typed
//! data-flow links between them, and the top-level input values. Nested
//! sub-workflows appear as methods with `service: "workflow"` whose
//! parameters hold another task/link map, recursively.

mod validate;

pub use validate::validate_document;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Reserved name of the synthetic entry node of every DAG scope.
pub const INPUT_CONNECTOR: &str = "input connector";

/// Reserved name of the synthetic exit node of every DAG scope.
pub const OUTPUT_CONNECTOR: &str = "output connector";

/// A complete workflow submission.
///
/// # Example
///
/// ```json
/// {
///   "name": "sample-alignment",
///   "tasks": {
///     "align": {
///       "methods": [
///         {"name": "bwa", "service": "job", "serviceUrl": "http://jobs/v1",
///          "parameters": {"commandLine": ["bwa", "mem"]}}
///       ],
///       "parallelBy": "lanes"
///     }
///   },
///   "links": [
///     {"source": "input connector", "destination": "align",
///      "dataFlow": {"lanes": "lanes"}},
///     {"source": "align", "destination": "output connector",
///      "dataFlow": {"bam": "bams"}}
///   ],
///   "inputs": {"lanes": ["L1", "L2"]}
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Workflow name; generated when omitted
    #[serde(default)]
    pub name: Option<String>,

    /// Named tasks of the root DAG
    pub tasks: BTreeMap<String, TaskSpec>,

    /// Data-flow edges of the root DAG
    #[serde(default)]
    pub links: Vec<LinkSpec>,

    /// Top-level input values
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,

    /// Workflow-level webhooks (status name -> url or urls)
    #[serde(default)]
    pub webhooks: WebhookSpec,
}

/// One named task: an ordered list of alternative methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Methods tried in order until one succeeds
    pub methods: Vec<MethodSpec>,

    /// Input property to split into data-parallel instances
    #[serde(default, rename = "parallelBy")]
    pub parallel_by: Option<String>,

    /// Task-level webhooks
    #[serde(default)]
    pub webhooks: WebhookSpec,
}

/// One executable method of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    /// Method name, unique within its task
    pub name: String,

    /// Execution service tag: "job", "workflow", "block", or "converge"
    pub service: String,

    /// Service-specific parameters (nested tasks/links for "workflow",
    /// input_names/output_name for "converge", job payload for "job")
    #[serde(default)]
    pub parameters: Value,

    /// Job service endpoint; falls back to the configured default
    #[serde(default, rename = "serviceUrl")]
    pub service_url: Option<String>,

    /// Method-level webhooks
    #[serde(default)]
    pub webhooks: WebhookSpec,
}

/// A directed edge between two sibling tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Source task name (or "input connector")
    pub source: String,

    /// Destination task name (or "output connector")
    pub destination: String,

    /// Property mapping: source property -> destination property name(s).
    /// An empty map makes this a pure ordering edge.
    #[serde(default, rename = "dataFlow")]
    pub data_flow: BTreeMap<String, DataFlowTargets>,
}

/// Destination property name(s) fed by one source property.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataFlowTargets {
    One(String),
    Many(Vec<String>),
}

impl DataFlowTargets {
    /// Iterate destination property names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            DataFlowTargets::One(name) => std::slice::from_ref(name),
            DataFlowTargets::Many(names) => names,
        };
        slice.iter().map(|s| s.as_str())
    }
}

/// Webhook subscriptions: status name -> url or list of urls.
pub type WebhookSpec = BTreeMap<String, UrlList>;

/// One URL or several.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl UrlList {
    /// Iterate subscribed URLs.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            UrlList::One(url) => std::slice::from_ref(url),
            UrlList::Many(urls) => urls,
        };
        slice.iter().map(|s| s.as_str())
    }
}

/// The task/link body of one DAG scope.
///
/// The root `Document` and the `parameters` of a nested "workflow" method
/// both deserialize into this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSpec {
    pub tasks: BTreeMap<String, TaskSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl Document {
    /// View the root task/link map as a DAG scope.
    pub fn as_dag(&self) -> DagSpec {
        DagSpec {
            tasks: self.tasks.clone(),
            links: self.links.clone(),
        }
    }
}

impl MethodSpec {
    /// Parse the nested DAG of a "workflow" method.
    pub fn nested_dag(&self) -> Result<DagSpec> {
        serde_json::from_value(self.parameters.clone()).map_err(|e| {
            Error::Validation(format!(
                "method '{}' has invalid nested workflow parameters: {}",
                self.name, e
            ))
        })
    }

    /// Ordered input names of a "converge" method.
    pub fn converge_input_names(&self) -> Result<Vec<String>> {
        let names = self
            .parameters
            .get("input_names")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "converge method '{}' requires an input_names list",
                    self.name
                ))
            })?;
        names
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    Error::Validation(format!(
                        "converge method '{}' has a non-string input name",
                        self.name
                    ))
                })
            })
            .collect()
    }

    /// Output name of a "converge" method (defaults to "result").
    pub fn converge_output_name(&self) -> String {
        self.parameters
            .get("output_name")
            .and_then(Value::as_str)
            .unwrap_or("result")
            .to_string()
    }
}

/// Parse a submission document from a JSON string.
pub fn parse_document(json: &str) -> Result<Document> {
    if json.trim().is_empty() {
        return Err(Error::Validation("empty workflow document".to_string()));
    }
    let document: Document = serde_json::from_str(json)?;
    Ok(document)
}

/// Parse a submission document from a file (JSON, or YAML by extension).
pub fn parse_document_file(path: &Path) -> Result<Document> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&content)?),
        _ => parse_document(&content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_document() {
        let json = r#"
        {
            "name": "two-step",
            "tasks": {
                "fetch": {"methods": [{"name": "run", "service": "job",
                                       "serviceUrl": "http://jobs/v1"}]},
                "store": {"methods": [{"name": "run", "service": "job",
                                       "serviceUrl": "http://jobs/v1"}]}
            },
            "links": [
                {"source": "input connector", "destination": "fetch",
                 "dataFlow": {"url": "url"}},
                {"source": "fetch", "destination": "store",
                 "dataFlow": {"payload": ["body", "archive"]}},
                {"source": "store", "destination": "output connector",
                 "dataFlow": {"receipt": "receipt"}}
            ],
            "inputs": {"url": "http://example.com"}
        }
        "#;

        let doc = parse_document(json).unwrap();
        assert_eq!(doc.name.as_deref(), Some("two-step"));
        assert_eq!(doc.tasks.len(), 2);
        assert_eq!(doc.links.len(), 3);

        let fan_out: Vec<&str> = doc.links[1].data_flow["payload"].names().collect();
        assert_eq!(fan_out, vec!["body", "archive"]);
    }

    #[test]
    fn test_parse_nested_workflow_method() {
        let json = r#"
        {
            "tasks": {
                "outer": {
                    "methods": [{
                        "name": "inner-flow",
                        "service": "workflow",
                        "parameters": {
                            "tasks": {
                                "inner": {"methods": [{"name": "run", "service": "block"}]}
                            },
                            "links": [
                                {"source": "input connector", "destination": "inner"},
                                {"source": "inner", "destination": "output connector"}
                            ]
                        }
                    }]
                }
            },
            "links": [],
            "inputs": {}
        }
        "#;

        let doc = parse_document(json).unwrap();
        let method = &doc.tasks["outer"].methods[0];
        let nested = method.nested_dag().unwrap();
        assert!(nested.tasks.contains_key("inner"));
        assert_eq!(nested.links.len(), 2);
    }

    #[test]
    fn test_parse_converge_parameters() {
        let json = r#"
        {
            "tasks": {
                "gather": {
                    "methods": [{
                        "name": "gather",
                        "service": "converge",
                        "parameters": {"input_names": ["b", "a"], "output_name": "all"}
                    }]
                }
            },
            "inputs": {}
        }
        "#;

        let doc = parse_document(json).unwrap();
        let method = &doc.tasks["gather"].methods[0];
        assert_eq!(method.converge_input_names().unwrap(), vec!["b", "a"]);
        assert_eq!(method.converge_output_name(), "all");
    }

    #[test]
    fn test_parse_empty_document() {
        let result = parse_document("  ");
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_webhooks() {
        let json = r#"
        {
            "tasks": {
                "t": {
                    "methods": [{"name": "m", "service": "block"}],
                    "webhooks": {"succeeded": "http://hook/one",
                                 "ended": ["http://hook/two", "http://hook/three"]}
                }
            },
            "inputs": {}
        }
        "#;

        let doc = parse_document(json).unwrap();
        let hooks = &doc.tasks["t"].webhooks;
        let succeeded: Vec<&str> = hooks["succeeded"].urls().collect();
        let ended: Vec<&str> = hooks["ended"].urls().collect();
        assert_eq!(succeeded, vec!["http://hook/one"]);
        assert_eq!(ended.len(), 2);
    }
}
