//! Compiled place/transition plan.
//!
//! The wire types handed to the net-execution substrate. A transition fires
//! when all its input places hold a token, consuming them and depositing
//! tokens in its output places; a transition's action, if any, tells the
//! substrate what side effect to perform when it fires.

pub mod translate;

pub use translate::translate;

use serde::{Deserialize, Serialize};

/// The compiled executable plan for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Places holding a token before the first firing
    pub initial_marking: Vec<String>,
    pub transitions: Vec<Transition>,
}

/// One firing rule of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

/// Side effect performed by the substrate when a transition fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_places: Option<ResponsePlaces>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_data: Option<Vec<String>>,
}

/// Action variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// POST to `url` and wait for a token on one of the response places
    Notify,
    /// Materialize the color group announced by the preceding size query
    CreateColorGroup,
    /// Duplicate the token once per color in the current group
    Split,
    /// Barrier: wait for every color of the group, emit one parent token
    Join,
    /// Re-color a token to the enclosing scope's color as it passes
    ConvertToParentColor,
}

/// Places the substrate deposits response tokens into after a notify.
///
/// `success`/`failure` carry the outcome of the notified operation; `done`
/// acknowledges a side-effecting notification (the substrate exposes it to
/// the coordinator as the `continue` response link).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePlaces {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<String>,
}

impl Plan {
    /// The plan with callback URLs cleared.
    ///
    /// Place and transition structure is deterministic across rebuilds of
    /// the same document; URLs embed freshly generated entity ids and are
    /// excluded from structural comparison.
    pub fn structure(&self) -> Plan {
        let mut plan = self.clone();
        for transition in &mut plan.transitions {
            if let Some(action) = &mut transition.action {
                action.url = None;
            }
        }
        plan
    }

    /// Transitions whose action notifies the given URL fragment.
    pub fn notifications_containing(&self, fragment: &str) -> Vec<&Transition> {
        self.transitions
            .iter()
            .filter(|t| {
                t.action
                    .as_ref()
                    .and_then(|a| a.url.as_deref())
                    .is_some_and(|url| url.contains(fragment))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_wire_names() {
        let kinds = [
            (ActionKind::Notify, "\"notify\""),
            (ActionKind::CreateColorGroup, "\"create-color-group\""),
            (ActionKind::Split, "\"split\""),
            (ActionKind::Join, "\"join\""),
            (ActionKind::ConvertToParentColor, "\"convert-to-parent-color\""),
        ];
        for (kind, expected) in kinds {
            assert_eq!(serde_json::to_string(&kind).unwrap(), expected);
        }
    }

    #[test]
    fn test_plan_serializes_camel_case() {
        let plan = Plan {
            initial_marking: vec!["root.input".into()],
            transitions: vec![Transition {
                inputs: vec!["a".into()],
                outputs: vec!["b".into()],
                action: None,
            }],
        };
        let json = serde_json::to_value(&plan).unwrap();
        assert!(json.get("initialMarking").is_some());
        assert!(json["transitions"][0].get("action").is_none());
    }

    #[test]
    fn test_structure_strips_urls_only() {
        let plan = Plan {
            initial_marking: vec!["p".into()],
            transitions: vec![Transition {
                inputs: vec!["p".into()],
                outputs: vec!["q".into()],
                action: Some(Action {
                    kind: ActionKind::Notify,
                    url: Some("http://petrel/v1/callbacks/tasks/abc".into()),
                    response_places: Some(ResponsePlaces {
                        success: Some("q".into()),
                        ..Default::default()
                    }),
                    requested_data: None,
                }),
            }],
        };
        let stripped = plan.structure();
        assert!(stripped.transitions[0].action.as_ref().unwrap().url.is_none());
        assert_eq!(
            stripped.transitions[0]
                .action
                .as_ref()
                .unwrap()
                .response_places,
            plan.transitions[0].action.as_ref().unwrap().response_places
        );
    }
}
