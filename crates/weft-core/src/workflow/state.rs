//! Cumulative watch state.
//!
//! Watch events carry partial views of a run. Subscribers of the aggregated
//! channel fold them into one cumulative state with [`WatchState::apply`].

use serde_json::{Map, Value, json};

/// Recursively merge `source` into `target`.
///
/// Objects merge key by key. Arrays and scalars in `source` replace the
/// target value wholesale. Null in `source` never overwrites anything.
pub fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                if value.is_null() {
                    continue;
                }
                match target.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => {
            if !source.is_null() {
                *target = source.clone();
            }
        }
    }
}

/// The state delivered to `watch` subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchState {
    value: Value,
}

impl Default for WatchState {
    fn default() -> Self {
        Self {
            value: Value::Object(Map::new()),
        }
    }
}

impl WatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one watch payload into the cumulative state.
    ///
    /// `currentStep` is replaced when present and dropped once the run is no
    /// longer running; `workflowState` is deep-merged.
    pub fn apply(&mut self, payload: &Value) {
        if !self.value.is_object() {
            self.value = Value::Object(Map::new());
        }
        let Value::Object(state) = &mut self.value else {
            return;
        };

        match payload.get("currentStep") {
            Some(current) if !current.is_null() => {
                state.insert("currentStep".to_string(), current.clone());
            }
            _ => {
                let running = payload
                    .pointer("/workflowState/status")
                    .and_then(Value::as_str)
                    == Some("running");
                if !running {
                    state.remove("currentStep");
                }
            }
        }

        if let Some(workflow_state) = payload.get("workflowState") {
            let target = state
                .entry("workflowState".to_string())
                .or_insert_with(|| json!({}));
            deep_merge(target, workflow_state);
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn to_value(&self) -> Value {
        self.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_recurses_into_objects() {
        let mut target = json!({"steps": {"a": {"status": "running", "payload": 1}}});
        deep_merge(
            &mut target,
            &json!({"steps": {"a": {"status": "success", "output": 2}, "b": {"status": "running"}}}),
        );
        assert_eq!(
            target,
            json!({"steps": {
                "a": {"status": "success", "payload": 1, "output": 2},
                "b": {"status": "running"}
            }})
        );
    }

    #[test]
    fn merge_replaces_arrays_and_skips_nulls() {
        let mut target = json!({"items": [1, 2, 3], "result": "keep"});
        deep_merge(&mut target, &json!({"items": [9], "result": null}));
        assert_eq!(target, json!({"items": [9], "result": "keep"}));
    }

    #[test]
    fn apply_tracks_current_step_until_run_settles() {
        let mut state = WatchState::new();
        state.apply(&json!({
            "currentStep": {"id": "a", "status": "running"},
            "workflowState": {"status": "running", "steps": {"a": {"status": "running"}}}
        }));
        assert_eq!(state.value()["currentStep"]["id"], "a");

        state.apply(&json!({
            "workflowState": {"status": "success", "steps": {"a": {"status": "success"}}, "result": 5}
        }));
        assert!(state.value().get("currentStep").is_none());
        assert_eq!(state.value()["workflowState"]["status"], "success");
        assert_eq!(state.value()["workflowState"]["steps"]["a"]["status"], "success");
        assert_eq!(state.value()["workflowState"]["result"], 5);
    }
}
