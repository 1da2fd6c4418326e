//! The merged output of a conversion run.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Everything the renderer fan-out produced for one document.
///
/// Serialises as a flat object:
///
/// ```json
/// {
///   "page_structure": {"0": ["/page/0/Text/1"]},
///   "page_renders": [...],
///   "chunks": {...},
///   "images": {...},
///   "metadata": {...}
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderResult {
    /// Page id → visible top-level block ids, `[]` for hidden pages.
    pub page_structure: BTreeMap<usize, Vec<String>>,

    /// Output key → renderer payload.
    #[serde(flatten)]
    pub outputs: BTreeMap<String, Value>,

    /// Image name → base64 PNG, or output key → that map when namespaced.
    pub images: Map<String, Value>,

    /// Renderer metadata, flat or namespaced per output key.
    pub metadata: Map<String, Value>,

    /// Output key → error message for renderers that failed under the
    /// partial policy.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

impl RenderResult {
    /// Top-level keys as they appear in the serialised form.
    pub fn keys(&self) -> Vec<String> {
        let mut keys = vec!["page_structure".to_string()];
        keys.extend(self.outputs.keys().cloned());
        keys.push("images".into());
        keys.push("metadata".into());
        if !self.errors.is_empty() {
            keys.push("errors".into());
        }
        keys.sort();
        keys
    }

    pub fn output(&self, key: &str) -> Option<&Value> {
        self.outputs.get(key)
    }

    /// The unified markdown, when the markdown renderer ran.
    pub fn markdown(&self) -> Option<&str> {
        self.outputs.get("markdown").and_then(Value::as_str)
    }
}
