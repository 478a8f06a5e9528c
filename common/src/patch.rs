use json_patch::PatchOperation;
use kube::core::GroupVersionKind;
use serde_json::{Map, Value};

/// A patch ready to send to the api-server, or nothing when the live object
/// already carries the expected state.
#[derive(Clone, Debug, PartialEq)]
pub enum ComputedPatch {
    /// RFC-6902 patch, for kinds without a strategic-merge schema
    Json(json_patch::Patch),
    /// Strategic-merge delta document
    Strategic(Value),
}

/// Kinds served from built-in API groups have a strategic-merge schema on
/// the server side. Custom resources and CRDs themselves do not and must be
/// patched with a filtered RFC-6902 diff.
fn needs_json_patch(gvk: &GroupVersionKind) -> bool {
    if gvk.kind == "CustomResourceDefinition" {
        return true;
    }
    let g = gvk.group.as_str();
    !(g.is_empty()
        || g.ends_with(".k8s.io")
        || matches!(g, "apps" | "batch" | "autoscaling" | "policy" | "extensions"))
}

/// Compute the patch that moves `existing` toward `expected`.
///
/// The diff is one-way: fields present on the live object but absent from
/// the expected state are never removed, so server-populated defaults and
/// status survive. Returns `None` when nothing is left to change.
pub fn compute_patch(
    existing: &Value,
    expected: &Value,
    gvk: &GroupVersionKind,
) -> Option<ComputedPatch> {
    if needs_json_patch(gvk) {
        filtered_json_patch(existing, expected).map(ComputedPatch::Json)
    } else {
        strategic_delta(expected, existing).map(ComputedPatch::Strategic)
    }
}

fn filtered_json_patch(existing: &Value, expected: &Value) -> Option<json_patch::Patch> {
    let ops: Vec<PatchOperation> = json_patch::diff(existing, expected)
        .0
        .into_iter()
        .filter(|op| match op {
            PatchOperation::Remove(_) => false,
            PatchOperation::Add(add) => !add.value.is_null(),
            _ => true,
        })
        .collect();
    if ops.is_empty() {
        None
    } else {
        Some(json_patch::Patch(ops))
    }
}

/// Keep the fields of `expected` whose values differ from `existing`,
/// recursing into nested objects. Scalars and arrays are taken whole.
fn strategic_delta(expected: &Value, existing: &Value) -> Option<Value> {
    let (exp, cur) = match (expected.as_object(), existing.as_object()) {
        (Some(e), Some(c)) => (e, c),
        _ => {
            return if expected == existing {
                None
            } else {
                Some(expected.clone())
            }
        }
    };
    let mut delta = Map::new();
    for (key, value) in exp {
        match cur.get(key) {
            None => {
                delta.insert(key.clone(), value.clone());
            }
            Some(current) => {
                if let Some(inner) = strategic_delta(value, current) {
                    delta.insert(key.clone(), inner);
                }
            }
        }
    }
    if delta.is_empty() {
        None
    } else {
        Some(Value::Object(delta))
    }
}
