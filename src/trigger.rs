use crate::session::SessionStatus;
use crate::shared::ids::SessionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel an agent may use in a trigger id list to mean "the children this
/// spawn_and_sleep is about to create".
pub const CHILDREN_SENTINEL: &str = "__CHILDREN__";

/// Declarative wake condition stored with a sleeping session. Instants are
/// unix seconds; the RFC3339 / relative wire forms are resolved at insertion
/// by [`resolve_trigger_value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    AllComplete(Vec<SessionId>),
    AnyComplete(Vec<SessionId>),
    TimeoutAt(i64),
    Any(Vec<Trigger>),
}

impl Trigger {
    /// Whether the trigger fires against the given status snapshot.
    ///
    /// `all_complete` is satisfied by any terminal state: a failed child must
    /// unblock its parent rather than hang it. `any_complete` demands a
    /// strict `complete`.
    pub fn evaluate<F>(&self, lookup: &F, now: i64) -> bool
    where
        F: Fn(&SessionId) -> Option<SessionStatus>,
    {
        match self {
            Trigger::AllComplete(ids) => ids
                .iter()
                .all(|id| lookup(id).is_some_and(|status| status.is_terminal())),
            Trigger::AnyComplete(ids) => ids
                .iter()
                .any(|id| lookup(id) == Some(SessionStatus::Complete)),
            Trigger::TimeoutAt(at) => now >= *at,
            Trigger::Any(triggers) => triggers.iter().any(|t| t.evaluate(lookup, now)),
        }
    }

    /// Every session id the trigger names, in declaration order.
    pub fn referenced_ids(&self) -> Vec<&SessionId> {
        match self {
            Trigger::AllComplete(ids) | Trigger::AnyComplete(ids) => ids.iter().collect(),
            Trigger::TimeoutAt(_) => Vec::new(),
            Trigger::Any(triggers) => triggers.iter().flat_map(Trigger::referenced_ids).collect(),
        }
    }

    /// The ids still holding this trigger back, for blocker-chain queries.
    pub fn unsatisfied_ids<F>(&self, lookup: &F, now: i64) -> Vec<SessionId>
    where
        F: Fn(&SessionId) -> Option<SessionStatus>,
    {
        match self {
            Trigger::AllComplete(ids) => ids
                .iter()
                .filter(|id| !lookup(id).is_some_and(|status| status.is_terminal()))
                .cloned()
                .collect(),
            Trigger::AnyComplete(ids) => {
                if ids
                    .iter()
                    .any(|id| lookup(id) == Some(SessionStatus::Complete))
                {
                    Vec::new()
                } else {
                    ids.iter()
                        .filter(|id| !lookup(id).is_some_and(|status| status.is_terminal()))
                        .cloned()
                        .collect()
                }
            }
            Trigger::TimeoutAt(_) => Vec::new(),
            Trigger::Any(triggers) => {
                if triggers.iter().any(|t| t.evaluate(lookup, now)) {
                    Vec::new()
                } else {
                    triggers
                        .iter()
                        .flat_map(|t| t.unsatisfied_ids(lookup, now))
                        .collect()
                }
            }
        }
    }

    /// Compact one-line rendering for tree views.
    pub fn summary(&self) -> String {
        match self {
            Trigger::AllComplete(ids) => format!("all_complete({})", ids.len()),
            Trigger::AnyComplete(ids) => format!("any_complete({})", ids.len()),
            Trigger::TimeoutAt(at) => {
                format!("timeout@{}", crate::shared::time::format_rfc3339(*at))
            }
            Trigger::Any(triggers) => {
                let parts: Vec<String> = triggers.iter().map(Trigger::summary).collect();
                format!("any[{}]", parts.join(", "))
            }
        }
    }
}

fn parse_id_list(value: &Value, children: &[SessionId]) -> Result<Vec<SessionId>, String> {
    // The sentinel may stand in for the whole list or appear among ids.
    if let Some(raw) = value.as_str() {
        if raw == CHILDREN_SENTINEL {
            return Ok(children.to_vec());
        }
        return Err(format!("expected an id list or \"{CHILDREN_SENTINEL}\", got `{raw}`"));
    }
    let Some(items) = value.as_array() else {
        return Err(format!("expected an id list or \"{CHILDREN_SENTINEL}\""));
    };
    let mut ids = Vec::new();
    for item in items {
        let Some(raw) = item.as_str() else {
            return Err("trigger id list entries must be strings".to_string());
        };
        if raw == CHILDREN_SENTINEL {
            ids.extend(children.iter().cloned());
        } else {
            ids.push(SessionId::parse(raw)?);
        }
    }
    Ok(ids)
}

/// Resolve the wire form of a trigger into a stored [`Trigger`]:
/// `timeout_seconds` becomes an absolute instant, `__CHILDREN__` is replaced
/// by `children`. Rejects empty triggers.
pub fn resolve_trigger_value(
    value: &Value,
    now: i64,
    children: &[SessionId],
) -> Result<Trigger, String> {
    let Some(object) = value.as_object() else {
        return Err("trigger must be a JSON object".to_string());
    };
    if object.len() != 1 {
        return Err("trigger must have exactly one key".to_string());
    }
    let Some((key, inner)) = object.iter().next() else {
        return Err("trigger must have exactly one key".to_string());
    };

    let trigger = match key.as_str() {
        "all_complete" => {
            let ids = parse_id_list(inner, children)?;
            if ids.is_empty() {
                return Err("all_complete requires at least one session id".to_string());
            }
            Trigger::AllComplete(ids)
        }
        "any_complete" => {
            let ids = parse_id_list(inner, children)?;
            if ids.is_empty() {
                return Err("any_complete requires at least one session id".to_string());
            }
            Trigger::AnyComplete(ids)
        }
        "timeout_at" => {
            let Some(raw) = inner.as_str() else {
                return Err("timeout_at must be an RFC3339 string".to_string());
            };
            Trigger::TimeoutAt(crate::shared::time::parse_rfc3339(raw)?)
        }
        "timeout_seconds" => {
            let Some(secs) = inner.as_u64() else {
                return Err("timeout_seconds must be a non-negative number".to_string());
            };
            Trigger::TimeoutAt(now + secs as i64)
        }
        "any" => {
            let Some(items) = inner.as_array() else {
                return Err("any must be a list of triggers".to_string());
            };
            if items.is_empty() {
                return Err("any requires at least one sub-trigger".to_string());
            }
            let mut triggers = Vec::new();
            for item in items {
                triggers.push(resolve_trigger_value(item, now, children)?);
            }
            Trigger::Any(triggers)
        }
        other => return Err(format!("unknown trigger kind `{other}`")),
    };
    Ok(trigger)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).expect("session id")
    }

    fn lookup_from(
        pairs: Vec<(&'static str, SessionStatus)>,
    ) -> impl Fn(&SessionId) -> Option<SessionStatus> {
        move |wanted: &SessionId| {
            pairs
                .iter()
                .find(|(raw, _)| *raw == wanted.as_str())
                .map(|(_, status)| *status)
        }
    }

    #[test]
    fn all_complete_requires_every_id_terminal() {
        let trigger = Trigger::AllComplete(vec![id("a"), id("b")]);

        let half = lookup_from(vec![
            ("a", SessionStatus::Complete),
            ("b", SessionStatus::Active),
        ]);
        assert!(!trigger.evaluate(&half, 0));

        let done = lookup_from(vec![
            ("a", SessionStatus::Complete),
            ("b", SessionStatus::Complete),
        ]);
        assert!(trigger.evaluate(&done, 0));
    }

    #[test]
    fn all_complete_accepts_failed_children() {
        let trigger = Trigger::AllComplete(vec![id("a"), id("b")]);
        let lookup = lookup_from(vec![
            ("a", SessionStatus::Failed),
            ("b", SessionStatus::Complete),
        ]);
        assert!(trigger.evaluate(&lookup, 0));
    }

    #[test]
    fn any_complete_ignores_failed_children() {
        let trigger = Trigger::AnyComplete(vec![id("a"), id("b")]);
        let only_failed = lookup_from(vec![
            ("a", SessionStatus::Failed),
            ("b", SessionStatus::Active),
        ]);
        assert!(!trigger.evaluate(&only_failed, 0));

        let one_done = lookup_from(vec![
            ("a", SessionStatus::Failed),
            ("b", SessionStatus::Complete),
        ]);
        assert!(trigger.evaluate(&one_done, 0));
    }

    #[test]
    fn missing_ids_never_satisfy() {
        let trigger = Trigger::AllComplete(vec![id("ghost")]);
        let empty = lookup_from(vec![]);
        assert!(!trigger.evaluate(&empty, 0));
    }

    #[test]
    fn timeout_fires_at_or_after_the_instant() {
        let trigger = Trigger::TimeoutAt(100);
        let lookup = lookup_from(vec![]);
        assert!(!trigger.evaluate(&lookup, 99));
        assert!(trigger.evaluate(&lookup, 100));
        assert!(trigger.evaluate(&lookup, 101));
    }

    #[test]
    fn any_fires_when_one_branch_fires() {
        let trigger = Trigger::Any(vec![
            Trigger::AllComplete(vec![id("a")]),
            Trigger::TimeoutAt(50),
        ]);
        let lookup = lookup_from(vec![("a", SessionStatus::Active)]);
        assert!(!trigger.evaluate(&lookup, 10));
        assert!(trigger.evaluate(&lookup, 50));
    }

    #[test]
    fn evaluate_is_deterministic() {
        let trigger = Trigger::Any(vec![
            Trigger::AnyComplete(vec![id("a"), id("b")]),
            Trigger::TimeoutAt(500),
        ]);
        let lookup = lookup_from(vec![
            ("a", SessionStatus::Sleeping),
            ("b", SessionStatus::Complete),
        ]);
        let first = trigger.evaluate(&lookup, 42);
        for _ in 0..10 {
            assert_eq!(trigger.evaluate(&lookup, 42), first);
        }
    }

    #[test]
    fn resolve_substitutes_children_sentinel() {
        let children = vec![id("c1"), id("c2")];
        let trigger = resolve_trigger_value(&json!({"all_complete": "__CHILDREN__"}), 0, &children)
            .expect("resolve");
        assert_eq!(trigger, Trigger::AllComplete(children.clone()));

        let mixed = resolve_trigger_value(
            &json!({"any_complete": ["known", "__CHILDREN__"]}),
            0,
            &children,
        )
        .expect("resolve");
        assert_eq!(
            mixed,
            Trigger::AnyComplete(vec![id("known"), id("c1"), id("c2")])
        );
    }

    #[test]
    fn resolve_timeout_seconds_to_absolute_instant() {
        let trigger =
            resolve_trigger_value(&json!({"timeout_seconds": 30}), 1000, &[]).expect("resolve");
        assert_eq!(trigger, Trigger::TimeoutAt(1030));

        // zero is valid: fires on the next evaluator pass
        let zero =
            resolve_trigger_value(&json!({"timeout_seconds": 0}), 1000, &[]).expect("resolve");
        assert_eq!(zero, Trigger::TimeoutAt(1000));
    }

    #[test]
    fn resolve_timeout_at_rfc3339() {
        let trigger = resolve_trigger_value(
            &json!({"timeout_at": "2024-01-01T00:00:00Z"}),
            0,
            &[],
        )
        .expect("resolve");
        assert_eq!(trigger, Trigger::TimeoutAt(1_704_067_200));
    }

    #[test]
    fn resolve_nested_any() {
        let children = vec![id("c1")];
        let trigger = resolve_trigger_value(
            &json!({"any": [
                {"all_complete": "__CHILDREN__"},
                {"timeout_seconds": 60}
            ]}),
            100,
            &children,
        )
        .expect("resolve");
        assert_eq!(
            trigger,
            Trigger::Any(vec![
                Trigger::AllComplete(vec![id("c1")]),
                Trigger::TimeoutAt(160),
            ])
        );
    }

    #[test]
    fn resolve_rejects_empty_and_malformed_triggers() {
        assert!(resolve_trigger_value(&json!({"all_complete": []}), 0, &[]).is_err());
        assert!(resolve_trigger_value(&json!({"all_complete": "__CHILDREN__"}), 0, &[]).is_err());
        assert!(resolve_trigger_value(&json!({"any": []}), 0, &[]).is_err());
        assert!(resolve_trigger_value(&json!({}), 0, &[]).is_err());
        assert!(resolve_trigger_value(&json!({"sometime": true}), 0, &[]).is_err());
        assert!(resolve_trigger_value(&json!({"timeout_at": "noon"}), 0, &[]).is_err());
        assert!(resolve_trigger_value(&json!({"timeout_seconds": -4}), 0, &[]).is_err());
        assert!(resolve_trigger_value(&json!("all"), 0, &[]).is_err());
        assert!(
            resolve_trigger_value(&json!({"all_complete": ["a"], "any": []}), 0, &[]).is_err()
        );
    }

    #[test]
    fn unsatisfied_ids_report_remaining_blockers() {
        let trigger = Trigger::AllComplete(vec![id("a"), id("b"), id("c")]);
        let lookup = lookup_from(vec![
            ("a", SessionStatus::Complete),
            ("b", SessionStatus::Sleeping),
            ("c", SessionStatus::Failed),
        ]);
        assert_eq!(trigger.unsatisfied_ids(&lookup, 0), vec![id("b")]);

        let any = Trigger::AnyComplete(vec![id("a"), id("b")]);
        let none_done = lookup_from(vec![
            ("a", SessionStatus::Failed),
            ("b", SessionStatus::Sleeping),
        ]);
        assert_eq!(any.unsatisfied_ids(&none_done, 0), vec![id("b")]);
    }

    #[test]
    fn stored_json_round_trip() {
        let trigger = Trigger::Any(vec![
            Trigger::AllComplete(vec![id("x")]),
            Trigger::TimeoutAt(77),
        ]);
        let raw = serde_json::to_string(&trigger).expect("serialize");
        let back: Trigger = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, trigger);
    }
}
