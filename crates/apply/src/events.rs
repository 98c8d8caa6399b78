//! Which status changes deserve a user-visible event.

use serde_json::Value as Json;
use trellis_core::conditions::{Condition, ConditionStatus};
use trellis_kubehub::EventKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

fn conditions(status: &Json) -> Vec<Condition> {
    status.get("conditions").cloned().and_then(|c| serde_json::from_value(c).ok()).unwrap_or_default()
}

fn phase(status: &Json) -> Option<&str> {
    status.get("phase").and_then(Json::as_str)
}

/// One event per changed phase and per changed condition. A condition seen for the first time
/// in the False state stays quiet.
pub fn status_events(old: &Json, new: &Json) -> Vec<StatusEvent> {
    let mut out = Vec::new();
    if let Some(p) = phase(new) {
        if phase(old) != Some(p) {
            let kind = if matches!(p, "Failed" | "Abnormal") { EventKind::Warning } else { EventKind::Normal };
            out.push(StatusEvent { kind, reason: format!("Phase{p}"), message: format!("phase changed to {p}") });
        }
    }
    let before = conditions(old);
    for c in conditions(new) {
        let changed = match before.iter().find(|b| b.type_ == c.type_) {
            Some(b) => b.status != c.status || b.reason != c.reason || b.message != c.message,
            None => c.status != ConditionStatus::False,
        };
        if changed {
            let kind = if c.status == ConditionStatus::False { EventKind::Warning } else { EventKind::Normal };
            let message = if c.message.is_empty() { format!("{} is {}", c.type_, c.status.as_str()) } else { c.message.clone() };
            out.push(StatusEvent { kind, reason: c.reason.clone(), message });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::conditions::{apply_failed, apply_succeeded, provisioning_started, set_condition};

    fn status(phase: &str, conds: Vec<Condition>) -> Json {
        json!({"phase": phase, "conditions": conds})
    }

    #[test]
    fn unchanged_status_emits_nothing() {
        let s = status("Running", vec![provisioning_started(Some(1))]);
        assert!(status_events(&s, &s).is_empty());
    }

    #[test]
    fn phase_change_and_new_true_condition_emit_one_each() {
        let old = json!({});
        let new = status("Creating", vec![provisioning_started(Some(1))]);
        let ev = status_events(&old, &new);
        assert_eq!(ev.len(), 2);
        assert_eq!(ev[0].reason, "PhaseCreating");
        assert_eq!(ev[1].reason, "PreCheckSucceed");
    }

    #[test]
    fn first_false_condition_is_quiet_but_a_flip_is_not() {
        let old = json!({});
        let failed = json!({"conditions": [apply_failed(Some(1), "boom")]});
        assert!(status_events(&old, &failed).is_empty());

        let mut conds = vec![apply_failed(Some(1), "boom")];
        set_condition(&mut conds, apply_succeeded(Some(1)));
        let ok = json!({"conditions": conds});
        let ev = status_events(&failed, &ok);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind, EventKind::Normal);

        let ev = status_events(&ok, &failed);
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].kind, EventKind::Warning);
    }

    #[test]
    fn failure_phase_is_a_warning() {
        let ev = status_events(&status("Running", vec![]), &status("Abnormal", vec![]));
        assert_eq!(ev, vec![StatusEvent { kind: EventKind::Warning, reason: "PhaseAbnormal".into(), message: "phase changed to Abnormal".into() }]);
    }
}
