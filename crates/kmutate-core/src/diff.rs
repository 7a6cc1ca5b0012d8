//! Diff engine producing minimal JSON patches between two resource snapshots
//!
//! Key properties:
//! - Applying `compute_patch(before, after)` to `before` yields `after`
//! - Equal inputs produce an empty patch, which callers treat as "no write needed"
//! - Output order is deterministic (object keys are visited sorted)
//! - Selected subtrees (e.g. `/status`) can be excluded from comparison

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::patch::{Patch, PatchOperation, join_pointer};

/// Structural diff between two snapshots
#[derive(Debug, Clone, Default)]
pub struct DiffEngine {
    /// JSON pointers whose subtrees are never compared
    ignored: Vec<String>,
}

impl DiffEngine {
    /// Create a diff engine that compares every field
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude a subtree from comparison
    pub fn ignoring(mut self, pointer: impl Into<String>) -> Self {
        self.ignored.push(pointer.into());
        self
    }

    pub fn ignored_paths(&self) -> &[String] {
        &self.ignored
    }

    /// Normalize both snapshots to JSON and diff them
    ///
    /// Fails with [`CoreError::Serialization`](crate::CoreError::Serialization)
    /// if either side cannot be represented as JSON.
    pub fn compute_patch<B, A>(&self, before: &B, after: &A) -> Result<Patch>
    where
        B: Serialize + ?Sized,
        A: Serialize + ?Sized,
    {
        let before = serde_json::to_value(before)?;
        let after = serde_json::to_value(after)?;
        Ok(self.diff_values(&before, &after))
    }

    /// Diff two already-normalized documents
    pub fn diff_values(&self, before: &JsonValue, after: &JsonValue) -> Patch {
        let mut patch = Patch::new();
        self.diff_at("", before, after, &mut patch);
        patch
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignored.iter().any(|ignored| {
            path == ignored
                || path
                    .strip_prefix(ignored.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    fn emit(&self, patch: &mut Patch, op: PatchOperation) {
        if !self.is_ignored(op.path()) {
            patch.push(op);
        }
    }

    fn diff_at(&self, path: &str, before: &JsonValue, after: &JsonValue, patch: &mut Patch) {
        if self.is_ignored(path) {
            return;
        }

        match (before, after) {
            (JsonValue::Object(old), JsonValue::Object(new)) => {
                let mut existing: Vec<(&String, &JsonValue)> = old.iter().collect();
                existing.sort_by(|a, b| a.0.cmp(b.0));
                for (key, old_value) in existing {
                    let child = join_pointer(path, key);
                    match new.get(key) {
                        Some(new_value) => self.diff_at(&child, old_value, new_value, patch),
                        None => self.emit(patch, PatchOperation::remove(child)),
                    }
                }

                let mut added: Vec<(&String, &JsonValue)> =
                    new.iter().filter(|(key, _)| !old.contains_key(*key)).collect();
                added.sort_by(|a, b| a.0.cmp(b.0));
                for (key, value) in added {
                    self.emit(patch, PatchOperation::add(join_pointer(path, key), value.clone()));
                }
            }
            (JsonValue::Array(old), JsonValue::Array(new)) => {
                let common = old.len().min(new.len());

                for index in 0..common {
                    let child = join_pointer(path, &index.to_string());
                    self.diff_at(&child, &old[index], &new[index], patch);
                }

                for (index, value) in new.iter().enumerate().skip(common) {
                    let child = join_pointer(path, &index.to_string());
                    self.emit(patch, PatchOperation::add(child, value.clone()));
                }

                // Highest index first so earlier removals don't shift later ones
                for index in (common..old.len()).rev() {
                    let child = join_pointer(path, &index.to_string());
                    self.emit(patch, PatchOperation::remove(child));
                }
            }
            _ if before == after => {}
            _ => self.emit(patch, PatchOperation::replace(path, after.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use serde_json::json;
    use std::collections::HashMap;

    fn deployment(replicas: u32, image: &str) -> JsonValue {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "resourceVersion": "41",
                "labels": {"app.kubernetes.io/name": "web"}
            },
            "spec": {
                "replicas": replicas,
                "template": {
                    "spec": {
                        "containers": [{"name": "web", "image": image}]
                    }
                }
            },
            "status": {"readyReplicas": 1}
        })
    }

    #[test]
    fn test_equal_documents_give_empty_patch() {
        let engine = DiffEngine::new();
        let doc = deployment(3, "nginx:1.27");
        assert!(engine.diff_values(&doc, &doc).is_empty());
        assert!(engine.diff_values(&json!(null), &json!(null)).is_empty());
        assert!(engine.diff_values(&json!([]), &json!([])).is_empty());
    }

    #[test]
    fn test_scalar_change_is_replace() {
        let engine = DiffEngine::new();
        let patch = engine.diff_values(&deployment(1, "nginx:1.27"), &deployment(3, "nginx:1.27"));

        assert_eq!(
            patch.into_operations(),
            vec![PatchOperation::replace("/spec/replicas", json!(3))]
        );
    }

    #[test]
    fn test_nested_array_element_change() {
        let engine = DiffEngine::new();
        let patch = engine.diff_values(&deployment(1, "nginx:1.26"), &deployment(1, "nginx:1.27"));

        insta::assert_snapshot!(
            serde_json::to_string(&patch).unwrap(),
            @r#"[{"op":"replace","path":"/spec/template/spec/containers/0/image","value":"nginx:1.27"}]"#
        );
    }

    #[test]
    fn test_added_and_removed_members() {
        let engine = DiffEngine::new();
        let before = json!({"metadata": {"labels": {"a": "1", "b": "2"}}});
        let after = json!({"metadata": {"labels": {"b": "2", "c": "3"}, "annotations": {"x": "y"}}});

        let patch = engine.diff_values(&before, &after);
        assert_eq!(
            patch.into_operations(),
            vec![
                PatchOperation::remove("/metadata/labels/a"),
                PatchOperation::add("/metadata/labels/c", json!("3")),
                PatchOperation::add("/metadata/annotations", json!({"x": "y"})),
            ]
        );
    }

    #[test]
    fn test_array_shrink_removes_from_the_end() {
        let engine = DiffEngine::new();
        let before = json!({"args": ["a", "b", "c", "d"]});
        let after = json!({"args": ["a", "x"]});

        let patch = engine.diff_values(&before, &after);
        assert_eq!(
            patch.operations(),
            &[
                PatchOperation::replace("/args/1", json!("x")),
                PatchOperation::remove("/args/3"),
                PatchOperation::remove("/args/2"),
            ]
        );
        assert_eq!(patch.apply(&before).unwrap(), after);
    }

    #[test]
    fn test_array_growth_appends() {
        let engine = DiffEngine::new();
        let before = json!({"ports": [80]});
        let after = json!({"ports": [80, 443, 8443]});

        let patch = engine.diff_values(&before, &after);
        assert_eq!(
            patch.operations(),
            &[
                PatchOperation::add("/ports/1", json!(443)),
                PatchOperation::add("/ports/2", json!(8443)),
            ]
        );
    }

    #[test]
    fn test_type_change_replaces_whole_value() {
        let engine = DiffEngine::new();
        let patch = engine.diff_values(&json!({"v": {"a": 1}}), &json!({"v": [1]}));
        assert_eq!(patch.operations(), &[PatchOperation::replace("/v", json!([1]))]);

        let root = engine.diff_values(&json!({"a": 1}), &json!("scalar"));
        assert_eq!(root.operations(), &[PatchOperation::replace("", json!("scalar"))]);
    }

    #[test]
    fn test_null_is_distinct_from_absent() {
        let engine = DiffEngine::new();
        let patch = engine.diff_values(&json!({}), &json!({"field": null}));
        assert_eq!(patch.operations(), &[PatchOperation::add("/field", json!(null))]);
    }

    #[test]
    fn test_keys_with_slashes_are_escaped() {
        let engine = DiffEngine::new();
        let before = json!({"metadata": {"annotations": {}}});
        let after = json!({"metadata": {"annotations": {"example.com/owner~team": "a"}}});

        let patch = engine.diff_values(&before, &after);
        assert_eq!(
            patch.operations()[0].path(),
            "/metadata/annotations/example.com~1owner~0team"
        );
        assert_eq!(patch.apply(&before).unwrap(), after);
    }

    #[test]
    fn test_ignored_subtrees() {
        let engine = DiffEngine::new().ignoring("/status");
        let before = deployment(1, "nginx:1.27");
        let mut after = before.clone();
        after["status"]["readyReplicas"] = json!(5);
        after["status"]["conditions"] = json!([]);

        assert!(engine.diff_values(&before, &after).is_empty());

        // Prefix match is per segment, not per character
        let mut other = before.clone();
        other["statusMessage"] = json!("hi");
        assert_eq!(engine.diff_values(&before, &other).len(), 1);
    }

    #[test]
    fn test_round_trip_reproduces_after() {
        let engine = DiffEngine::new();
        let pairs = [
            (json!({}), json!({"a": {"b": [1, 2, {"c": null}]}})),
            (json!({"a": [1, 2, 3]}), json!({"a": []})),
            (json!({"a": [[1], [2, 3]]}), json!({"a": [[1, 4], [3]]})),
            (json!([1, {"x": 1}]), json!([{"x": 2}, 1, 2])),
            (json!({"k": true}), json!({"k": false, "l": 1.5})),
            (json!("string"), json!({"now": "object"})),
            (deployment(1, "nginx:1.26"), deployment(7, "nginx:1.27")),
        ];

        for (before, after) in pairs {
            let patch = engine.diff_values(&before, &after);
            assert_eq!(
                patch.apply(&before).unwrap(),
                after,
                "patch {:?} does not reproduce target",
                patch
            );
            assert!(engine.diff_values(&after, &after).is_empty());
        }
    }

    #[test]
    fn test_compute_patch_from_structs() {
        #[derive(Serialize)]
        struct Config {
            name: String,
            replicas: u32,
        }

        let engine = DiffEngine::new();
        let patch = engine
            .compute_patch(
                &Config { name: "a".into(), replicas: 1 },
                &Config { name: "a".into(), replicas: 2 },
            )
            .unwrap();
        assert_eq!(patch.operations(), &[PatchOperation::replace("/replicas", json!(2))]);
    }

    #[test]
    fn test_unserializable_snapshot_fails() {
        let mut weird: HashMap<(u8, u8), u8> = HashMap::new();
        weird.insert((1, 2), 3);

        let result = DiffEngine::new().compute_patch(&weird, &weird);
        assert!(matches!(result, Err(CoreError::Serialization(_))));
    }
}
