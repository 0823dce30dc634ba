//! Persisting a built workflow.
//!
//! Flattens the built graph into entity rows inside the caller's
//! transaction: tasks, methods, links, data-flow entries, the resolved
//! input sources, webhooks, and the two seed executions (the input holder
//! carrying the top-level inputs at color 0, and the workflow's own status
//! record).

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::graph::{dataflow, BuiltWorkflow, MethodNode, ScopeNode, TaskNode};
use crate::net::Plan;
use crate::store::models::{
    DataFlowEntry, Execution, InputSource, Link, Method, OwnerKind, Status, Task, TaskResult,
    Webhook, Workflow,
};
use crate::store::Tx;

/// Persist a built workflow and its compiled plan. The workflow name must
/// be unused.
pub fn persist_workflow(tx: &Tx<'_>, built: &BuiltWorkflow, plan: &Plan) -> Result<Workflow> {
    if tx.find_workflow_by_name(&built.name)?.is_some() {
        return Err(Error::DuplicateWorkflowName(built.name.clone()));
    }

    let workflow = Workflow {
        id: built.id.clone(),
        name: built.name.clone(),
        net_key: None,
        plan: serde_json::to_value(plan)?,
        next_color: 1,
        canceled: false,
        created_at: Utc::now(),
    };
    tx.insert_workflow(&workflow)?;

    persist_task(tx, &workflow.id, &built.input_holder, None)?;
    persist_task(tx, &workflow.id, &built.root, None)?;

    // The seed link from the input holder to the root task.
    let root_link = Link {
        id: Uuid::new_v4().to_string(),
        workflow_id: workflow.id.clone(),
        source_task_id: built.input_holder.id.clone(),
        destination_task_id: built.root.id.clone(),
    };
    tx.insert_link(&root_link)?;
    for (source_property, destination_property) in &built.root_link.entries {
        tx.insert_data_flow_entry(
            &workflow.id,
            &DataFlowEntry {
                id: Uuid::new_v4().to_string(),
                link_id: root_link.id.clone(),
                source_property: source_property.clone(),
                destination_property: destination_property.clone(),
            },
        )?;
    }

    for (status_name, url) in &built.webhooks {
        tx.insert_webhook(&Webhook {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            owner_kind: OwnerKind::Workflow,
            owner_id: workflow.id.clone(),
            status_name: status_name.clone(),
            url: url.clone(),
        })?;
    }

    for resolved in dataflow::resolve(built)? {
        tx.insert_input_source(&InputSource {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            destination_task_id: resolved.destination_task_id,
            destination_property: resolved.destination_property,
            source_task_id: resolved.source_task_id,
            source_property: resolved.source_property,
            parallel_depths: resolved.parallel_depths,
        })?;
    }

    seed_inputs(tx, &workflow, built)?;

    // The workflow's own status record at color 0.
    tx.insert_execution(&Execution {
        id: Uuid::new_v4().to_string(),
        workflow_id: workflow.id.clone(),
        owner_kind: OwnerKind::Workflow,
        owner_id: workflow.id.clone(),
        color: 0,
        parent_color: None,
        colors: vec![0],
        begins: vec![0],
        status: Status::New,
        data: Value::Object(Default::default()),
        outputs: None,
        job_url: None,
        response_links: Value::Object(Default::default()),
        created_at: Utc::now(),
    })?;

    Ok(workflow)
}

fn persist_task(
    tx: &Tx<'_>,
    workflow_id: &str,
    node: &TaskNode,
    parent_method_id: Option<&str>,
) -> Result<()> {
    tx.insert_task(&Task {
        id: node.id.clone(),
        workflow_id: workflow_id.to_string(),
        parent_method_id: parent_method_id.map(str::to_string),
        name: node.name.clone(),
        kind: node.kind,
        topological_index: node.topological_index,
        parallel_by: node.parallel_by.clone(),
        canceled: false,
    })?;

    for (status_name, url) in &node.webhooks {
        tx.insert_webhook(&Webhook {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            owner_kind: OwnerKind::Task,
            owner_id: node.id.clone(),
            status_name: status_name.clone(),
            url: url.clone(),
        })?;
    }

    for method in &node.methods {
        persist_method(tx, workflow_id, node, method)?;
    }
    Ok(())
}

fn persist_method(
    tx: &Tx<'_>,
    workflow_id: &str,
    task: &TaskNode,
    method: &MethodNode,
) -> Result<()> {
    tx.insert_method(&Method {
        id: method.id.clone(),
        workflow_id: workflow_id.to_string(),
        task_id: task.id.clone(),
        name: method.name.clone(),
        index: method.index,
        kind: method.kind,
        parameters: method.parameters.clone(),
        service_url: method.service_url.clone(),
    })?;

    for (status_name, url) in &method.webhooks {
        tx.insert_webhook(&Webhook {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            owner_kind: OwnerKind::Method,
            owner_id: method.id.clone(),
            status_name: status_name.clone(),
            url: url.clone(),
        })?;
    }

    if let Some(scope) = &method.scope {
        persist_scope(tx, workflow_id, &method.id, scope)?;
    }
    Ok(())
}

fn persist_scope(
    tx: &Tx<'_>,
    workflow_id: &str,
    parent_method_id: &str,
    scope: &ScopeNode,
) -> Result<()> {
    for child in &scope.tasks {
        persist_task(tx, workflow_id, child, Some(parent_method_id))?;
    }

    for edge in &scope.links {
        let source = scope
            .task(&edge.source)
            .ok_or_else(|| Error::Internal(format!("link references unbuilt task '{}'", edge.source)))?;
        let destination = scope.task(&edge.destination).ok_or_else(|| {
            Error::Internal(format!("link references unbuilt task '{}'", edge.destination))
        })?;

        let link = Link {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            source_task_id: source.id.clone(),
            destination_task_id: destination.id.clone(),
        };
        tx.insert_link(&link)?;
        for (source_property, destination_property) in &edge.entries {
            tx.insert_data_flow_entry(
                workflow_id,
                &DataFlowEntry {
                    id: Uuid::new_v4().to_string(),
                    link_id: link.id.clone(),
                    source_property: source_property.clone(),
                    destination_property: destination_property.clone(),
                },
            )?;
        }
    }
    Ok(())
}

/// The input holder's color-0 execution carries the submitted inputs, with
/// one result row per input so data-flow resolution finds them like any
/// other produced value.
fn seed_inputs(tx: &Tx<'_>, workflow: &Workflow, built: &BuiltWorkflow) -> Result<()> {
    let inputs = Value::Object(built.inputs.clone());
    tx.insert_execution(&Execution {
        id: Uuid::new_v4().to_string(),
        workflow_id: workflow.id.clone(),
        owner_kind: OwnerKind::Task,
        owner_id: built.input_holder.id.clone(),
        color: 0,
        parent_color: None,
        colors: vec![0],
        begins: vec![0],
        status: Status::Succeeded,
        data: Value::Object(Default::default()),
        outputs: Some(inputs),
        job_url: None,
        response_links: Value::Object(Default::default()),
        created_at: Utc::now(),
    })?;

    for (name, value) in &built.inputs {
        tx.upsert_result(&TaskResult {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            task_id: built.input_holder.id.clone(),
            name: name.clone(),
            color: 0,
            parent_color: None,
            data: value.clone(),
        })?;
    }
    Ok(())
}
