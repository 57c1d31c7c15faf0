//! Typed tag keys shared with the orchestrator.
//!
//! Steps and runs carry string tags. A step tag overrides the run tag with
//! the same key; an absent or blank value falls through to the default.

use crate::{BridgeError, Result};
use std::collections::BTreeMap;
use stepq_core::{Priority, QueueLabel};

pub type TagMap = BTreeMap<String, String>;

/// Integer priority for the dispatched task.
pub const PRIORITY_TAG: &str = "stepq/priority";
/// Queue label the task is routed to.
pub const QUEUE_TAG: &str = "stepq/queue";
/// Task id written back on the run for job and resume dispatches.
pub const TASK_ID_TAG: &str = "stepq/task_id";

/// Run tag recording the task id dispatched for one step.
pub fn step_task_id_tag(step_key: &str) -> String {
    format!("{TASK_ID_TAG}/{step_key}")
}

/// Step tag first, then run tag. Blank values count as absent.
pub fn lookup<'a>(key: &str, step: &'a TagMap, run: &'a TagMap) -> Option<&'a str> {
    [step, run]
        .into_iter()
        .filter_map(|tags| tags.get(key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

pub fn resolve_priority(step: &TagMap, run: &TagMap, default: Priority) -> Result<Priority> {
    match lookup(PRIORITY_TAG, step, run) {
        Some(raw) => raw.parse().map_err(|_| BridgeError::InvalidTag {
            key: PRIORITY_TAG.to_string(),
            value: raw.to_string(),
            reason: "expected an integer".to_string(),
        }),
        None => Ok(default),
    }
}

pub fn resolve_queue(step: &TagMap, run: &TagMap, default: &str) -> QueueLabel {
    lookup(QUEUE_TAG, step, run).unwrap_or(default).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_step_overrides_run() {
        let step = tags(&[(PRIORITY_TAG, "9"), (QUEUE_TAG, "gpu")]);
        let run = tags(&[(PRIORITY_TAG, "1"), (QUEUE_TAG, "cpu")]);
        assert_eq!(
            resolve_priority(&step, &run, Priority::DEFAULT).unwrap(),
            Priority::new(9)
        );
        assert_eq!(resolve_queue(&step, &run, "dagster"), "gpu");
    }

    #[test]
    fn test_falls_back_to_run_then_default() {
        let run = tags(&[(QUEUE_TAG, "cpu")]);
        assert_eq!(resolve_queue(&TagMap::new(), &run, "dagster"), "cpu");
        assert_eq!(
            resolve_priority(&TagMap::new(), &run, Priority::DEFAULT).unwrap(),
            Priority::DEFAULT
        );
        assert_eq!(resolve_queue(&TagMap::new(), &TagMap::new(), "dagster"), "dagster");
    }

    #[test]
    fn test_blank_step_tag_falls_through() {
        let step = tags(&[(QUEUE_TAG, "  ")]);
        let run = tags(&[(QUEUE_TAG, "cpu")]);
        assert_eq!(resolve_queue(&step, &run, "dagster"), "cpu");
    }

    #[test]
    fn test_invalid_priority_tag() {
        let step = tags(&[(PRIORITY_TAG, "high")]);
        let err = resolve_priority(&step, &TagMap::new(), Priority::DEFAULT).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTag { ref value, .. } if value == "high"));
        assert_eq!(err.kind(), stepq_core::FailureKind::MalformedMessage);
    }

    #[test]
    fn test_step_task_id_tag() {
        assert_eq!(step_task_id_tag("compute.a"), "stepq/task_id/compute.a");
    }

    proptest! {
        #[test]
        fn prop_priority_resolution_order(
            step in proptest::option::of(-100i32..100),
            run in proptest::option::of(-100i32..100),
            default in -100i32..100,
        ) {
            let mut step_tags = TagMap::new();
            let mut run_tags = TagMap::new();
            if let Some(p) = step {
                step_tags.insert(PRIORITY_TAG.to_string(), format!(" {p} "));
            }
            if let Some(p) = run {
                run_tags.insert(PRIORITY_TAG.to_string(), p.to_string());
            }
            let resolved = resolve_priority(&step_tags, &run_tags, Priority::new(default)).unwrap();
            let expected = step.or(run).unwrap_or(default);
            prop_assert_eq!(resolved.value(), expected);
        }
    }
}
