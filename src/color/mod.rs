//! Color-aware value resolution.
//!
//! Every token in the running net carries a color naming its data-parallel
//! instance, plus the lineage of colors of each enclosing parallel scope.
//! Results are stored per color; a consumer looks its inputs up by walking
//! the lineage from its own color outward, then slices collection values
//! by its position within each splitting group on the way back in.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::store::models::InputSource;
use crate::store::Tx;

/// Color lineage of one execution: the colors of each enclosing parallel
/// scope (root color 0 first, own color last) and the group begin of each,
/// aligned by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lineage {
    pub colors: Vec<i64>,
    pub begins: Vec<i64>,
}

impl Lineage {
    pub fn root() -> Self {
        Self {
            colors: vec![0],
            begins: vec![0],
        }
    }

    pub fn new(colors: Vec<i64>, begins: Vec<i64>) -> Self {
        Self { colors, begins }
    }

    /// Own color, the deepest entry.
    pub fn color(&self) -> i64 {
        *self.colors.last().unwrap_or(&0)
    }

    /// Position of the instance within its group at lineage index `depth`,
    /// or None when the lineage does not reach that depth.
    pub fn position_at(&self, depth: usize) -> Option<i64> {
        let color = self.colors.get(depth)?;
        let begin = self.begins.get(depth)?;
        Some(color - begin)
    }
}

/// Fetch the value of one resolved input for an instance at `lineage`.
///
/// The producer may have written its result at any enclosing scope's color,
/// so the lookup walks the lineage deepest first and takes the first hit.
/// The raw value is then indexed once per parallel depth the flow crosses;
/// a depth beyond the lineage is skipped, which is what lets the split-size
/// query on the splitting task itself read the whole collection.
pub fn fetch_value(tx: &Tx<'_>, source: &InputSource, lineage: &Lineage) -> Result<Value> {
    let mut found = None;
    for &color in lineage.colors.iter().rev() {
        if let Some(result) = tx.get_result(&source.source_task_id, &source.source_property, color)?
        {
            found = Some(result.data);
            break;
        }
    }
    let mut value = found.ok_or_else(|| {
        Error::Internal(format!(
            "no result named '{}' found along color lineage {:?}",
            source.source_property, lineage.colors
        ))
    })?;

    for &depth in &source.parallel_depths {
        let Some(position) = lineage.position_at(depth) else {
            continue;
        };
        let Value::Array(mut items) = value else {
            return Err(Error::Internal(format!(
                "value for '{}' is split at depth {} but is not an array",
                source.destination_property, depth
            )));
        };
        if position < 0 || position as usize >= items.len() {
            return Err(Error::Internal(format!(
                "position {} out of bounds for '{}' ({} items)",
                position,
                source.destination_property,
                items.len()
            )));
        }
        value = items.swap_remove(position as usize);
    }
    Ok(value)
}

/// Resolve every declared input of a task for the instance at `lineage`.
pub fn gather_inputs(tx: &Tx<'_>, task_id: &str, lineage: &Lineage) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for source in tx.input_sources_for(task_id)? {
        let value = fetch_value(tx, &source, lineage)?;
        inputs.insert(source.destination_property.clone(), value);
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{TaskResult, Workflow};
    use crate::store::Store;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn seed_workflow(tx: &Tx<'_>) -> String {
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: "lineage-test".into(),
            net_key: None,
            plan: json!({}),
            next_color: 1,
            canceled: false,
            created_at: Utc::now(),
        };
        tx.insert_workflow(&workflow).unwrap();
        workflow.id
    }

    fn put_result(tx: &Tx<'_>, workflow_id: &str, task_id: &str, name: &str, color: i64, data: Value) {
        tx.upsert_result(&TaskResult {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
            name: name.to_string(),
            color,
            parent_color: None,
            data,
        })
        .unwrap();
    }

    fn source(task_id: &str, property: &str, depths: Vec<usize>) -> InputSource {
        InputSource {
            id: Uuid::new_v4().to_string(),
            workflow_id: "w".into(),
            destination_task_id: "consumer".into(),
            destination_property: "in".into(),
            source_task_id: task_id.into(),
            source_property: property.into(),
            parallel_depths: depths,
        }
    }

    #[tokio::test]
    async fn test_deepest_color_wins() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let wf = seed_workflow(tx);
                put_result(tx, &wf, "producer", "out", 0, json!("root"));
                put_result(tx, &wf, "producer", "out", 3, json!("inner"));

                let lineage = Lineage::new(vec![0, 3], vec![0, 1]);
                let value = fetch_value(tx, &source("producer", "out", vec![]), &lineage)?;
                assert_eq!(value, json!("inner"));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_outer_scope_color() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let wf = seed_workflow(tx);
                put_result(tx, &wf, "producer", "out", 0, json!([10, 20, 30]));

                // Instance 2 of a split at depth 1 gets element 2.
                let lineage = Lineage::new(vec![0, 3], vec![0, 1]);
                let value = fetch_value(tx, &source("producer", "out", vec![1]), &lineage)?;
                assert_eq!(value, json!(30));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_depth_beyond_lineage_keeps_whole_collection() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let wf = seed_workflow(tx);
                put_result(tx, &wf, "producer", "out", 0, json!([1, 2]));

                // The split-size query runs before the split, so the
                // lineage is still one level short of the declared depth.
                let lineage = Lineage::root();
                let value = fetch_value(tx, &source("producer", "out", vec![1]), &lineage)?;
                assert_eq!(value, json!([1, 2]));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_nested_splits_index_twice() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let wf = seed_workflow(tx);
                put_result(tx, &wf, "producer", "out", 0, json!([["a", "b"], ["c", "d"]]));

                // Outer instance 1, inner instance 0 selects "c".
                let lineage = Lineage::new(vec![0, 2, 5], vec![0, 1, 5]);
                let value = fetch_value(tx, &source("producer", "out", vec![1, 2]), &lineage)?;
                assert_eq!(value, json!("c"));
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_result_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                seed_workflow(tx);
                let err = fetch_value(tx, &source("producer", "out", vec![]), &Lineage::root());
                assert!(err.is_err());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_position_out_of_bounds_is_an_error() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                let wf = seed_workflow(tx);
                put_result(tx, &wf, "producer", "out", 0, json!([1]));

                let lineage = Lineage::new(vec![0, 4], vec![0, 1]);
                let err = fetch_value(tx, &source("producer", "out", vec![1]), &lineage);
                assert!(err.is_err());
                Ok(())
            })
            .await
            .unwrap();
    }
}
