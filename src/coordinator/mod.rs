//! Execution coordination.
//!
//! The running net drives this module through callbacks: every notify
//! transition POSTs here, state changes happen inside one store transaction,
//! and answers travel back to the substrate as response-link notifications
//! flushed by the outbox after commit. Job submission is the one exception:
//! the HTTP call to the job service happens between two transactions, the
//! first recording the scheduled execution and the second storing the job
//! URL (or driving the errored path).

mod persist;

pub use persist::persist_workflow;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::clients::{JobClient, JobSubmission};
use crate::color::{fetch_value, gather_inputs, Lineage};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::models::{
    ColorGroup, Execution, Method, MethodKind, OwnerKind, Status, Task, TaskKind, TaskResult,
};
use crate::store::{Store, Tx};

/// Body of a callback POSTed by the net-execution substrate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackBody {
    /// Color of the token that fired the transition; 0 for the root
    #[serde(default)]
    pub color: i64,

    /// Group of the token, absent outside any fan-out
    #[serde(default)]
    pub group: Option<GroupInfo>,

    #[serde(default)]
    pub response_links: ResponseLinks,

    /// Anything else the substrate attached (requested data, job fields)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Color-group context of a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub begin: i64,
    #[serde(default)]
    pub color_lineage: Vec<i64>,
    #[serde(default)]
    pub begin_lineage: Vec<i64>,
}

/// Substrate URLs a callback answer is POSTed to. `continue` acknowledges
/// a side-effecting notification; `success`/`failure` carry an outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, rename = "continue", skip_serializing_if = "Option::is_none")]
    pub proceed: Option<String>,
}

impl ResponseLinks {
    fn is_empty(&self) -> bool {
        self.success.is_none() && self.failure.is_none() && self.proceed.is_none()
    }
}

impl CallbackBody {
    /// Color lineage of the token: enclosing scope colors plus its own.
    pub fn lineage(&self) -> Lineage {
        match &self.group {
            Some(group) => {
                let mut colors = group.color_lineage.clone();
                colors.push(self.color);
                let mut begins = group.begin_lineage.clone();
                begins.push(group.begin);
                Lineage::new(colors, begins)
            }
            None => Lineage::new(vec![self.color], vec![self.color]),
        }
    }
}

const TASK_CALLBACKS: &[&str] = &["get_split_size", "create_array_result", "copy_outputs"];
const JOB_CALLBACKS: &[&str] = &["execute", "running", "succeeded", "failed", "errored"];
const DAG_CALLBACKS: &[&str] = &["running", "done", "failed"];
const EXECUTE_ONLY: &[&str] = &["execute"];

/// Drives workflow state in response to substrate and job-service callbacks.
#[derive(Clone)]
pub struct Coordinator {
    store: Store,
    config: Config,
    jobs: Arc<dyn JobClient>,
}

impl Coordinator {
    pub fn new(store: Store, config: Config, jobs: Arc<dyn JobClient>) -> Self {
        Self {
            store,
            config,
            jobs,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Dispatch a task callback by type.
    pub async fn handle_task_callback(
        &self,
        task_id: &str,
        callback_type: &str,
        body: CallbackBody,
    ) -> Result<()> {
        match callback_type {
            "get_split_size" => self.get_split_size(task_id, body).await,
            "create_array_result" => self.create_array_result(task_id, body).await,
            "copy_outputs" => self.copy_outputs(task_id, body).await,
            other => Err(Error::InvalidCallback {
                entity: "task",
                name: other.to_string(),
                allowed: TASK_CALLBACKS.to_vec(),
            }),
        }
    }

    /// Dispatch a method callback by the method's kind and the type.
    pub async fn handle_method_callback(
        &self,
        method_id: &str,
        callback_type: &str,
        execution_id: Option<&str>,
        body: CallbackBody,
    ) -> Result<()> {
        let method = self.store.read(|tx| tx.get_method(method_id)).await?;
        match (method.kind, callback_type) {
            (MethodKind::Job, "execute") => self.execute_job(method, body).await,
            (MethodKind::Job, "running" | "succeeded" | "failed" | "errored") => {
                let execution_id = execution_id.ok_or_else(|| {
                    Error::Validation("job status callbacks require execution_id".to_string())
                })?;
                self.job_status(method, callback_type, execution_id, body)
                    .await
            }
            (MethodKind::Job, other) => Err(invalid_method_callback("job", other, JOB_CALLBACKS)),
            (MethodKind::Block, "execute") => self.execute_block(method, body).await,
            (MethodKind::Block, other) => {
                Err(invalid_method_callback("block", other, EXECUTE_ONLY))
            }
            (MethodKind::Converge, "execute") => self.execute_converge(method, body).await,
            (MethodKind::Converge, other) => {
                Err(invalid_method_callback("converge", other, EXECUTE_ONLY))
            }
            (MethodKind::Dag, "running") => self.dag_running(method, body).await,
            (MethodKind::Dag, "done") => self.dag_done(method, body).await,
            (MethodKind::Dag, "failed") => self.dag_failed(method, body).await,
            (MethodKind::Dag, other) => Err(invalid_method_callback("dag", other, DAG_CALLBACKS)),
        }
    }

    // ------------------------------------------------------------------
    // Task callbacks
    // ------------------------------------------------------------------

    /// Answer the split-size query of a parallel task: resolve the
    /// collection, allocate one color per element and record the group.
    async fn get_split_size(&self, task_id: &str, body: CallbackBody) -> Result<()> {
        let task_id = task_id.to_string();
        self.store
            .with_tx(|tx| {
                let task = tx.get_task(&task_id)?;
                let Some(parallel_by) = task.parallel_by.clone() else {
                    return Err(Error::InvalidCallback {
                        entity: "task",
                        name: "get_split_size".to_string(),
                        allowed: vec![],
                    });
                };
                let workflow = tx.get_workflow(&task.workflow_id)?;
                let lineage = body.lineage();
                let execution =
                    ensure_execution(tx, &workflow.id, OwnerKind::Task, &task.id, &body, &lineage)?;

                if workflow.canceled || task.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                }
                record_status(tx, &execution, Status::Running)?;

                let Some(source) = tx.input_source(&task.id, &parallel_by)? else {
                    record_status(tx, &execution, Status::Errored)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                };
                let value = match fetch_value(tx, &source, &lineage) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(task = %task.name, error = %e, "split-size input unresolvable");
                        record_status(tx, &execution, Status::Errored)?;
                        return respond(
                            tx,
                            &workflow.id,
                            &body.response_links.failure,
                            color_payload(&body),
                        );
                    }
                };
                let Value::Array(items) = value else {
                    warn!(task = %task.name, property = %parallel_by, "parallelBy value is not a collection");
                    record_status(tx, &execution, Status::Errored)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                };

                let size = items.len() as i64;
                let begin = tx.allocate_colors(&workflow.id, size)?;
                let parent_group = tx.group_containing(&workflow.id, body.color)?;
                let index = lineage
                    .position_at(lineage.colors.len().saturating_sub(1))
                    .unwrap_or(0);
                let group = ColorGroup {
                    id: Uuid::new_v4().to_string(),
                    workflow_id: workflow.id.clone(),
                    task_id: task.id.clone(),
                    index,
                    begin,
                    end: begin + size,
                    parent_color: Some(body.color),
                    parent_color_group_id: parent_group.map(|g| g.id),
                };
                tx.insert_color_group(&group)?;

                respond(
                    tx,
                    &workflow.id,
                    &body.response_links.proceed,
                    json!({
                        "color": body.color,
                        "color_group": {
                            "begin": group.begin,
                            "end": group.end,
                            "index": group.index,
                            "parent_color": body.color,
                        },
                    }),
                )
            })
            .await
    }

    /// Collapse per-color results back into arrays at the parent color
    /// once the join barrier has fired.
    async fn create_array_result(&self, task_id: &str, body: CallbackBody) -> Result<()> {
        let task_id = task_id.to_string();
        self.store
            .with_tx(|tx| {
                let task = tx.get_task(&task_id)?;
                let workflow = tx.get_workflow(&task.workflow_id)?;
                let lineage = body.lineage();
                let execution =
                    ensure_execution(tx, &workflow.id, OwnerKind::Task, &task.id, &body, &lineage)?;

                if workflow.canceled || task.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                }

                let Some(group) = tx.find_color_group(&task.id, Some(body.color))? else {
                    record_status(tx, &execution, Status::Errored)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                };

                let mut outputs = Map::new();
                for name in tx.result_names_in_range(&task.id, group.begin, group.end)? {
                    let rows = tx.results_in_range(&task.id, &name, group.begin, group.end)?;
                    if rows.len() as i64 != group.size() {
                        warn!(
                            task = %task.name,
                            name = %name,
                            have = rows.len(),
                            want = group.size(),
                            "incomplete per-color results at array collection"
                        );
                        record_status(tx, &execution, Status::Errored)?;
                        return respond(
                            tx,
                            &workflow.id,
                            &body.response_links.failure,
                            color_payload(&body),
                        );
                    }
                    let array = Value::Array(rows.into_iter().map(|r| r.data).collect());
                    write_result(tx, &workflow.id, &task.id, &name, &execution, array.clone())?;
                    outputs.insert(name, array);
                }

                tx.set_execution_outputs(&execution.id, &Value::Object(outputs))?;
                record_status(tx, &execution, Status::Succeeded)?;
                respond(tx, &workflow.id, &body.response_links.success, color_payload(&body))
            })
            .await
    }

    /// Resolve the output connector's inputs and publish them as results of
    /// the task owning the scope.
    async fn copy_outputs(&self, task_id: &str, body: CallbackBody) -> Result<()> {
        let task_id = task_id.to_string();
        self.store
            .with_tx(|tx| {
                let task = tx.get_task(&task_id)?;
                if task.kind != TaskKind::OutputConnector {
                    return Err(Error::InvalidCallback {
                        entity: "task",
                        name: "copy_outputs".to_string(),
                        allowed: vec![],
                    });
                }
                let workflow = tx.get_workflow(&task.workflow_id)?;
                let lineage = body.lineage();
                let execution =
                    ensure_execution(tx, &workflow.id, OwnerKind::Task, &task.id, &body, &lineage)?;

                if workflow.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                }

                let method_id = task.parent_method_id.clone().ok_or_else(|| {
                    Error::Internal("output connector outside any scope".to_string())
                })?;
                let method = tx.get_method(&method_id)?;
                let owner_task = tx.get_task(&method.task_id)?;

                let outputs = match gather_inputs(tx, &task.id, &lineage) {
                    Ok(outputs) => outputs,
                    Err(e) => {
                        warn!(scope = %owner_task.name, error = %e, "scope outputs unresolvable");
                        record_status(tx, &execution, Status::Errored)?;
                        return respond(
                            tx,
                            &workflow.id,
                            &body.response_links.failure,
                            color_payload(&body),
                        );
                    }
                };

                for (name, value) in &outputs {
                    write_result(tx, &workflow.id, &owner_task.id, name, &execution, value.clone())?;
                }
                tx.set_execution_outputs(&execution.id, &Value::Object(outputs))?;
                record_status(tx, &execution, Status::Succeeded)?;
                respond(tx, &workflow.id, &body.response_links.success, color_payload(&body))
            })
            .await
    }

    // ------------------------------------------------------------------
    // Method callbacks: job
    // ------------------------------------------------------------------

    /// Execute a job method. Two phases: record the scheduled execution and
    /// commit, submit over HTTP, then store the assigned job URL (or drive
    /// the errored path) in a second transaction.
    async fn execute_job(&self, method: Method, body: CallbackBody) -> Result<()> {
        let base_url = self.config.callback_base_url();
        let default_service = self.config.services.job_url.clone();

        enum Step {
            Submit {
                execution_id: String,
                service_url: String,
                submission: JobSubmission,
            },
            Finished,
        }

        let method_for_tx = method.clone();
        let body_for_tx = body.clone();
        let step = self
            .store
            .with_tx(move |tx| {
                let method = method_for_tx;
                let body = body_for_tx;
                let task = tx.get_task(&method.task_id)?;
                let workflow = tx.get_workflow(&method.workflow_id)?;
                let lineage = body.lineage();
                let execution = ensure_execution(
                    tx,
                    &workflow.id,
                    OwnerKind::Method,
                    &method.id,
                    &body,
                    &lineage,
                )?;
                ensure_task_running(tx, &workflow.id, &task, &body, &lineage)?;

                if workflow.canceled || task.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    propagate_method_terminal(tx, &method, body.color, Status::Canceled)?;
                    respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body))?;
                    return Ok(Step::Finished);
                }

                // Redelivered execute: the job is already on its way.
                if execution.job_url.is_some() || execution.status != Status::New {
                    return Ok(Step::Finished);
                }

                let inputs = match gather_inputs(tx, &task.id, &lineage) {
                    Ok(inputs) => inputs,
                    Err(e) => {
                        warn!(task = %task.name, method = %method.name, error = %e,
                              "job inputs unresolvable");
                        record_status(tx, &execution, Status::Errored)?;
                        propagate_method_terminal(tx, &method, body.color, Status::Errored)?;
                        respond(
                            tx,
                            &workflow.id,
                            &body.response_links.failure,
                            color_payload(&body),
                        )?;
                        return Ok(Step::Finished);
                    }
                };
                tx.set_execution_data(&execution.id, &Value::Object(inputs.clone()))?;
                record_status(tx, &execution, Status::Scheduled)?;

                let service_url = method
                    .service_url
                    .clone()
                    .unwrap_or_else(|| default_service.clone());
                let submission = JobSubmission {
                    service: "job".to_string(),
                    parameters: method.parameters.clone(),
                    inputs: Value::Object(inputs),
                    status_callback_url: format!(
                        "{}/v1/callbacks/methods/{}?execution_id={}",
                        base_url, method.id, execution.id
                    ),
                };
                Ok(Step::Submit {
                    execution_id: execution.id,
                    service_url,
                    submission,
                })
            })
            .await?;

        let Step::Submit {
            execution_id,
            service_url,
            submission,
        } = step
        else {
            return Ok(());
        };

        match self.jobs.submit(&service_url, &submission).await {
            Ok(job_url) => {
                self.store
                    .with_tx(|tx| tx.set_execution_job_url(&execution_id, &job_url))
                    .await
            }
            Err(e) => {
                warn!(method = %method.name, error = %e, "job submission failed");
                self.store
                    .with_tx(|tx| {
                        let execution = tx.get_execution(&execution_id)?;
                        record_status(tx, &execution, Status::Errored)?;
                        propagate_method_terminal(tx, &method, execution.color, Status::Errored)?;
                        let links = stored_links(&execution);
                        respond(
                            tx,
                            &execution.workflow_id,
                            &links.failure,
                            json!({"color": execution.color}),
                        )
                    })
                    .await
            }
        }
    }

    /// Apply a status report from the job service to the method execution
    /// named by `execution_id`.
    async fn job_status(
        &self,
        method: Method,
        callback_type: &str,
        execution_id: &str,
        body: CallbackBody,
    ) -> Result<()> {
        let callback_type = callback_type.to_string();
        let execution_id = execution_id.to_string();
        self.store
            .with_tx(move |tx| {
                let execution = tx.get_execution(&execution_id)?;
                if execution.owner_id != method.id {
                    return Err(Error::Validation(format!(
                        "execution {} does not belong to method '{}'",
                        execution_id, method.name
                    )));
                }
                if let Some(reported) = body.extra.get("job_url").and_then(Value::as_str) {
                    if let Some(stored) = &execution.job_url {
                        if stored != reported {
                            return Err(Error::JobUrlMismatch {
                                execution_id: execution_id.clone(),
                                reported: reported.to_string(),
                            });
                        }
                    }
                }

                let links = stored_links(&execution);
                let payload = json!({"color": execution.color});
                match callback_type.as_str() {
                    "running" => {
                        if record_status(tx, &execution, Status::Running)? {
                            let task = tx.get_task(&method.task_id)?;
                            if let Some(task_execution) =
                                tx.find_execution(OwnerKind::Task, &task.id, execution.color)?
                            {
                                record_status(tx, &task_execution, Status::Running)?;
                            }
                        }
                        Ok(())
                    }
                    "succeeded" => {
                        let outputs = body
                            .extra
                            .get("outputs")
                            .and_then(Value::as_object)
                            .cloned()
                            .unwrap_or_default();
                        let required = tx.required_outputs(&method.task_id)?;
                        let missing: Vec<String> = required
                            .into_iter()
                            .filter(|name| !outputs.contains_key(name))
                            .collect();
                        if !missing.is_empty() {
                            warn!(
                                method = %method.name,
                                missing = ?missing,
                                "job succeeded without required outputs"
                            );
                            record_status(tx, &execution, Status::Errored)?;
                            propagate_method_terminal(tx, &method, execution.color, Status::Errored)?;
                            return respond(tx, &execution.workflow_id, &links.failure, payload);
                        }
                        for (name, value) in &outputs {
                            write_result(
                                tx,
                                &execution.workflow_id,
                                &method.task_id,
                                name,
                                &execution,
                                value.clone(),
                            )?;
                        }
                        tx.set_execution_outputs(&execution.id, &Value::Object(outputs))?;
                        record_status(tx, &execution, Status::Succeeded)?;
                        propagate_method_terminal(tx, &method, execution.color, Status::Succeeded)?;
                        respond(tx, &execution.workflow_id, &links.success, payload)
                    }
                    "failed" => {
                        record_status(tx, &execution, Status::Failed)?;
                        propagate_method_terminal(tx, &method, execution.color, Status::Failed)?;
                        respond(tx, &execution.workflow_id, &links.failure, payload)
                    }
                    "errored" => {
                        record_status(tx, &execution, Status::Errored)?;
                        propagate_method_terminal(tx, &method, execution.color, Status::Errored)?;
                        respond(tx, &execution.workflow_id, &links.failure, payload)
                    }
                    _ => unreachable!("dispatch covers all job status callbacks"),
                }
            })
            .await
    }

    // ------------------------------------------------------------------
    // Method callbacks: block and converge
    // ------------------------------------------------------------------

    /// A block completes immediately with a fixed trivial result.
    async fn execute_block(&self, method: Method, body: CallbackBody) -> Result<()> {
        self.store
            .with_tx(move |tx| {
                let task = tx.get_task(&method.task_id)?;
                let workflow = tx.get_workflow(&method.workflow_id)?;
                let lineage = body.lineage();
                let execution = ensure_execution(
                    tx,
                    &workflow.id,
                    OwnerKind::Method,
                    &method.id,
                    &body,
                    &lineage,
                )?;
                ensure_task_running(tx, &workflow.id, &task, &body, &lineage)?;

                if workflow.canceled || task.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    propagate_method_terminal(tx, &method, body.color, Status::Canceled)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                }

                let outputs = json!({"result": true});
                write_result(tx, &workflow.id, &task.id, "result", &execution, json!(true))?;
                tx.set_execution_outputs(&execution.id, &outputs)?;
                record_status(tx, &execution, Status::Running)?;
                record_status(tx, &execution, Status::Succeeded)?;
                propagate_method_terminal(tx, &method, body.color, Status::Succeeded)?;
                respond(tx, &workflow.id, &body.response_links.success, color_payload(&body))
            })
            .await
    }

    /// A converge collects its declared inputs, in order, into one array
    /// output.
    async fn execute_converge(&self, method: Method, body: CallbackBody) -> Result<()> {
        self.store
            .with_tx(move |tx| {
                let task = tx.get_task(&method.task_id)?;
                let workflow = tx.get_workflow(&method.workflow_id)?;
                let lineage = body.lineage();
                let execution = ensure_execution(
                    tx,
                    &workflow.id,
                    OwnerKind::Method,
                    &method.id,
                    &body,
                    &lineage,
                )?;
                ensure_task_running(tx, &workflow.id, &task, &body, &lineage)?;

                if workflow.canceled || task.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    propagate_method_terminal(tx, &method, body.color, Status::Canceled)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                }
                record_status(tx, &execution, Status::Running)?;

                let input_names = converge_input_names(&method.parameters);
                let output_name = converge_output_name(&method.parameters);
                let mut collected = Vec::with_capacity(input_names.len());
                for name in &input_names {
                    let Some(source) = tx.input_source(&task.id, name)? else {
                        warn!(task = %task.name, input = %name, "converge input not wired");
                        record_status(tx, &execution, Status::Errored)?;
                        propagate_method_terminal(tx, &method, body.color, Status::Errored)?;
                        return respond(
                            tx,
                            &workflow.id,
                            &body.response_links.failure,
                            color_payload(&body),
                        );
                    };
                    match fetch_value(tx, &source, &lineage) {
                        Ok(value) => collected.push(value),
                        Err(e) => {
                            warn!(task = %task.name, input = %name, error = %e,
                                  "converge input unresolvable");
                            record_status(tx, &execution, Status::Errored)?;
                            propagate_method_terminal(tx, &method, body.color, Status::Errored)?;
                            return respond(
                                tx,
                                &workflow.id,
                                &body.response_links.failure,
                                color_payload(&body),
                            );
                        }
                    }
                }

                let array = Value::Array(collected);
                write_result(tx, &workflow.id, &task.id, &output_name, &execution, array.clone())?;
                let mut outputs = Map::new();
                outputs.insert(output_name, array);
                tx.set_execution_outputs(&execution.id, &Value::Object(outputs))?;
                record_status(tx, &execution, Status::Succeeded)?;
                propagate_method_terminal(tx, &method, body.color, Status::Succeeded)?;
                respond(tx, &workflow.id, &body.response_links.success, color_payload(&body))
            })
            .await
    }

    // ------------------------------------------------------------------
    // Method callbacks: dag
    // ------------------------------------------------------------------

    async fn dag_running(&self, method: Method, body: CallbackBody) -> Result<()> {
        self.store
            .with_tx(move |tx| {
                let task = tx.get_task(&method.task_id)?;
                let workflow = tx.get_workflow(&method.workflow_id)?;
                let lineage = body.lineage();
                let execution = ensure_execution(
                    tx,
                    &workflow.id,
                    OwnerKind::Method,
                    &method.id,
                    &body,
                    &lineage,
                )?;
                if workflow.canceled || task.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                }
                ensure_task_running(tx, &workflow.id, &task, &body, &lineage)?;
                record_status(tx, &execution, Status::Running)?;

                if is_root_task(&task) {
                    if let Some(wf_execution) =
                        tx.find_execution(OwnerKind::Workflow, &workflow.id, 0)?
                    {
                        record_status(tx, &wf_execution, Status::Running)?;
                    }
                }
                respond(tx, &workflow.id, &body.response_links.proceed, color_payload(&body))
            })
            .await
    }

    /// Every child and the output connector succeeded: the scope's results,
    /// already published under the owning task by copy_outputs, become the
    /// method's outputs.
    async fn dag_done(&self, method: Method, body: CallbackBody) -> Result<()> {
        self.store
            .with_tx(move |tx| {
                let task = tx.get_task(&method.task_id)?;
                let workflow = tx.get_workflow(&method.workflow_id)?;
                let lineage = body.lineage();
                let execution = ensure_execution(
                    tx,
                    &workflow.id,
                    OwnerKind::Method,
                    &method.id,
                    &body,
                    &lineage,
                )?;

                if workflow.canceled || task.canceled {
                    record_status(tx, &execution, Status::Canceled)?;
                    propagate_method_terminal(tx, &method, body.color, Status::Canceled)?;
                    if is_root_task(&task) {
                        if let Some(wf_execution) =
                            tx.find_execution(OwnerKind::Workflow, &workflow.id, 0)?
                        {
                            record_status(tx, &wf_execution, Status::Canceled)?;
                        }
                    }
                    return respond(tx, &workflow.id, &body.response_links.failure, color_payload(&body));
                }

                let mut outputs = Map::new();
                for result in tx.results_for_task_at_color(&task.id, body.color)? {
                    outputs.insert(result.name, result.data);
                }
                tx.set_execution_outputs(&execution.id, &Value::Object(outputs))?;
                record_status(tx, &execution, Status::Succeeded)?;
                propagate_method_terminal(tx, &method, body.color, Status::Succeeded)?;

                if is_root_task(&task) {
                    if let Some(wf_execution) =
                        tx.find_execution(OwnerKind::Workflow, &workflow.id, 0)?
                    {
                        record_status(tx, &wf_execution, Status::Succeeded)?;
                    }
                }
                respond(tx, &workflow.id, &body.response_links.proceed, color_payload(&body))
            })
            .await
    }

    async fn dag_failed(&self, method: Method, body: CallbackBody) -> Result<()> {
        self.store
            .with_tx(move |tx| {
                let task = tx.get_task(&method.task_id)?;
                let workflow = tx.get_workflow(&method.workflow_id)?;
                let lineage = body.lineage();
                let execution = ensure_execution(
                    tx,
                    &workflow.id,
                    OwnerKind::Method,
                    &method.id,
                    &body,
                    &lineage,
                )?;
                let status = if workflow.canceled {
                    Status::Canceled
                } else {
                    Status::Failed
                };
                record_status(tx, &execution, status)?;
                propagate_method_terminal(tx, &method, body.color, status)?;

                if is_root_task(&task) {
                    if let Some(wf_execution) =
                        tx.find_execution(OwnerKind::Workflow, &workflow.id, 0)?
                    {
                        record_status(tx, &wf_execution, status)?;
                    }
                }
                respond(tx, &workflow.id, &body.response_links.proceed, color_payload(&body))
            })
            .await
    }

    // ------------------------------------------------------------------
    // API-driven operations
    // ------------------------------------------------------------------

    /// Cancel a workflow: flag it and its tasks, pre-empt its status
    /// records, then ask the job services to stop in-flight jobs.
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let workflow_id = workflow_id.to_string();
        let running = self
            .store
            .with_tx(|tx| {
                let workflow = tx.get_workflow(&workflow_id)?;
                if workflow.canceled {
                    return Ok(Vec::new());
                }
                tx.cancel_workflow(&workflow_id)?;
                if let Some(wf_execution) =
                    tx.find_execution(OwnerKind::Workflow, &workflow_id, 0)?
                {
                    record_status(tx, &wf_execution, Status::Canceled)?;
                }
                let running = tx.running_job_executions(&workflow_id)?;
                for execution in &running {
                    record_status(tx, execution, Status::Canceled)?;
                }
                Ok(running)
            })
            .await?;

        for execution in running {
            if let Some(job_url) = &execution.job_url {
                if let Err(e) = self.jobs.cancel(job_url).await {
                    warn!(job_url = %job_url, error = %e, "job cancel request failed");
                }
            }
        }
        Ok(())
    }

    /// Apply a client PATCH to an execution. Only `status`, `data` and
    /// `outputs` may change; outputs are write-once.
    pub async fn update_execution(
        &self,
        execution_id: &str,
        patch: Map<String, Value>,
    ) -> Result<Execution> {
        let execution_id = execution_id.to_string();
        self.store
            .with_tx(move |tx| {
                let execution = tx.get_execution(&execution_id)?;
                for key in patch.keys() {
                    if !matches!(key.as_str(), "status" | "data" | "outputs") {
                        return Err(Error::ImmutableUpdate(key.clone()));
                    }
                }
                if let Some(data) = patch.get("data") {
                    tx.set_execution_data(&execution.id, data)?;
                }
                if let Some(outputs) = patch.get("outputs") {
                    if !execution.outputs_unset() {
                        return Err(Error::OutputsAlreadySet(execution.id.clone()));
                    }
                    tx.set_execution_outputs(&execution.id, outputs)?;
                }
                if let Some(status) = patch.get("status") {
                    let status: Status = status
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| Error::Validation("unknown status value".to_string()))?;
                    record_status(tx, &execution, status)?;
                }
                tx.get_execution(&execution_id)
            })
            .await
    }
}

// ----------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------

fn invalid_method_callback(kind: &'static str, name: &str, allowed: &[&'static str]) -> Error {
    let entity = match kind {
        "job" => "job method",
        "block" => "block method",
        "converge" => "converge method",
        _ => "dag method",
    };
    Error::InvalidCallback {
        entity,
        name: name.to_string(),
        allowed: allowed.to_vec(),
    }
}

fn is_root_task(task: &Task) -> bool {
    task.parent_method_id.is_none() && task.kind == TaskKind::MethodList
}

fn color_payload(body: &CallbackBody) -> Value {
    json!({"color": body.color})
}

fn stored_links(execution: &Execution) -> ResponseLinks {
    serde_json::from_value(execution.response_links.clone()).unwrap_or_default()
}

/// Find or create the execution record of (owner, color); callback bodies
/// carrying response links refresh the stored ones.
fn ensure_execution(
    tx: &Tx<'_>,
    workflow_id: &str,
    owner_kind: OwnerKind,
    owner_id: &str,
    body: &CallbackBody,
    lineage: &Lineage,
) -> Result<Execution> {
    if let Some(mut found) = tx.find_execution(owner_kind, owner_id, body.color)? {
        if !body.response_links.is_empty() {
            let links = serde_json::to_value(&body.response_links)?;
            tx.set_execution_response_links(&found.id, &links)?;
            found.response_links = links;
        }
        return Ok(found);
    }

    let parent_color = lineage
        .colors
        .len()
        .checked_sub(2)
        .and_then(|i| lineage.colors.get(i))
        .copied();
    let execution = Execution {
        id: Uuid::new_v4().to_string(),
        workflow_id: workflow_id.to_string(),
        owner_kind,
        owner_id: owner_id.to_string(),
        color: body.color,
        parent_color,
        colors: lineage.colors.clone(),
        begins: lineage.begins.clone(),
        status: Status::New,
        data: Value::Object(Default::default()),
        outputs: None,
        job_url: None,
        response_links: serde_json::to_value(&body.response_links)?,
        created_at: Utc::now(),
    };
    tx.insert_execution(&execution)?;
    Ok(execution)
}

/// Make sure a task-level status record exists at this color and is at
/// least running.
fn ensure_task_running(
    tx: &Tx<'_>,
    workflow_id: &str,
    task: &Task,
    body: &CallbackBody,
    lineage: &Lineage,
) -> Result<()> {
    let bare = CallbackBody {
        color: body.color,
        group: body.group.clone(),
        response_links: ResponseLinks::default(),
        extra: Map::new(),
    };
    let execution = ensure_execution(tx, workflow_id, OwnerKind::Task, &task.id, &bare, lineage)?;
    record_status(tx, &execution, Status::Running)?;
    Ok(())
}

/// Advance a status and enqueue matching webhook notifications. Returns
/// false when the transition is not allowed (duplicate or backwards).
fn record_status(tx: &Tx<'_>, execution: &Execution, status: Status) -> Result<bool> {
    let advanced = tx.advance_status(&execution.id, status)?;
    if advanced {
        for hook in tx.webhooks_matching(execution.owner_kind, &execution.owner_id, status)? {
            tx.enqueue_notification(
                Some(&execution.workflow_id),
                &hook.url,
                &json!({
                    "workflow_id": execution.workflow_id,
                    "owner_kind": execution.owner_kind.to_string(),
                    "owner_id": execution.owner_id,
                    "execution_id": execution.id,
                    "color": execution.color,
                    "status": status.to_string(),
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )?;
        }
    }
    Ok(advanced)
}

/// When a method reaches a terminal status, move its task's status record
/// along: success always concludes the task, while failure only does once
/// the last-listed method has been exhausted.
fn propagate_method_terminal(
    tx: &Tx<'_>,
    method: &Method,
    color: i64,
    status: Status,
) -> Result<()> {
    let conclude = match status {
        Status::Succeeded | Status::Canceled => true,
        Status::Failed | Status::Errored => {
            let methods = tx.methods_for_task(&method.task_id)?;
            methods.last().map(|m| m.index) == Some(method.index)
        }
        _ => return Ok(()),
    };
    if !conclude {
        return Ok(());
    }
    if let Some(task_execution) = tx.find_execution(OwnerKind::Task, &method.task_id, color)? {
        record_status(tx, &task_execution, status)?;
    }
    Ok(())
}

fn write_result(
    tx: &Tx<'_>,
    workflow_id: &str,
    task_id: &str,
    name: &str,
    execution: &Execution,
    data: Value,
) -> Result<()> {
    tx.upsert_result(&TaskResult {
        id: Uuid::new_v4().to_string(),
        workflow_id: workflow_id.to_string(),
        task_id: task_id.to_string(),
        name: name.to_string(),
        color: execution.color,
        parent_color: execution.parent_color,
        data,
    })
}

fn respond(tx: &Tx<'_>, workflow_id: &str, link: &Option<String>, payload: Value) -> Result<()> {
    if let Some(url) = link {
        tx.enqueue_notification(Some(workflow_id), url, &payload)?;
    }
    Ok(())
}

fn converge_input_names(parameters: &Value) -> Vec<String> {
    parameters
        .get("input_names")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn converge_output_name(parameters: &Value) -> String {
    parameters
        .get("output_name")
        .and_then(Value::as_str)
        .unwrap_or("result")
        .to_string()
}
