use crate::ids;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRecord {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub captured: bool,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Path of the evidence metadata, relative to the case root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SourceRecord {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            title: String::new(),
            captured: false,
            kind: None,
            evidence: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn number(&self) -> Option<u64> {
        ids::parse_source_id(&self.id).ok()
    }
}

/// On-disk shape of `sources.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceLayout {
    /// `{"sources": [...]}`
    #[default]
    List,
    /// `{"S001": {...}, "S002": {...}}`
    Keyed,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceCatalog {
    pub layout: SourceLayout,
    pub sources: Vec<SourceRecord>,
    /// Top-level keys next to `sources` in the list layout.
    pub extra: Map<String, Value>,
}

impl SourceCatalog {
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut root) = value else {
            return Err("sources file root must be a JSON object".to_string());
        };

        if let Some(list) = root.remove("sources") {
            let Value::Array(items) = list else {
                return Err("'sources' must be an array".to_string());
            };
            let sources = items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    serde_json::from_value::<SourceRecord>(item)
                        .map_err(|err| format!("invalid source at index {index}: {err}"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self {
                layout: SourceLayout::List,
                sources,
                extra: root,
            });
        }

        if root.is_empty() {
            return Ok(Self::default());
        }

        let mut sources = Vec::with_capacity(root.len());
        for (key, item) in root {
            if !ids::is_source_id(&key) {
                return Err(format!(
                    "unrecognized key '{key}': expected {{\"sources\": [...]}} \
                     or a map keyed by source id"
                ));
            }
            let Value::Object(mut fields) = item else {
                return Err(format!("source '{key}' must be an object"));
            };
            match fields.get("id").and_then(Value::as_str) {
                Some(id) if id != key => {
                    return Err(format!("source '{key}' carries mismatched id '{id}'"));
                }
                Some(_) => {}
                None => {
                    fields.insert("id".to_string(), Value::String(key.clone()));
                }
            }
            let record = serde_json::from_value::<SourceRecord>(Value::Object(fields))
                .map_err(|err| format!("invalid source '{key}': {err}"))?;
            sources.push(record);
        }
        sources.sort_by_key(|record| record.number());

        Ok(Self {
            layout: SourceLayout::Keyed,
            sources,
            extra: Map::new(),
        })
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self.layout {
            SourceLayout::List => {
                let mut root = self.extra.clone();
                root.insert("sources".to_string(), serde_json::to_value(&self.sources)?);
                Ok(Value::Object(root))
            }
            SourceLayout::Keyed => {
                let mut root = Map::new();
                for record in &self.sources {
                    root.insert(record.id.clone(), serde_json::to_value(record)?);
                }
                Ok(Value::Object(root))
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&SourceRecord> {
        self.sources.iter().find(|record| record.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SourceRecord> {
        self.sources.iter_mut().find(|record| record.id == id)
    }

    pub fn highest_number(&self) -> Option<u64> {
        self.sources.iter().filter_map(SourceRecord::number).max()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_list_layout_and_keeps_sidecar_keys() {
        let catalog = SourceCatalog::from_value(json!({
            "version": 2,
            "sources": [
                {"id": "S001", "url": "https://a.example", "title": "A", "captured": true},
                {"id": "S002", "url": "https://b.example", "type": "pdf"}
            ]
        }))
        .expect("parse");
        assert_eq!(catalog.layout, SourceLayout::List);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("S002").and_then(|s| s.kind.as_deref()), Some("pdf"));
        let value = catalog.to_value().expect("serialize");
        assert_eq!(value["version"], 2);
        assert_eq!(value["sources"][0]["id"], "S001");
    }

    #[test]
    fn reads_keyed_layout_and_writes_it_back_keyed() {
        let catalog = SourceCatalog::from_value(json!({
            "S010": {"url": "https://late.example"},
            "S002": {"id": "S002", "url": "https://early.example"}
        }))
        .expect("parse");
        assert_eq!(catalog.layout, SourceLayout::Keyed);
        assert_eq!(catalog.sources[0].id, "S002");
        assert_eq!(catalog.highest_number(), Some(10));
        let value = catalog.to_value().expect("serialize");
        assert_eq!(value["S010"]["id"], "S010");
    }

    #[test]
    fn rejects_unknown_shapes() {
        assert!(SourceCatalog::from_value(json!([])).is_err());
        assert!(SourceCatalog::from_value(json!({"sources": {"S001": {}}})).is_err());
        assert!(SourceCatalog::from_value(json!({"items": []})).is_err());
        assert!(SourceCatalog::from_value(json!({"S001": {"id": "S002", "url": "x"}})).is_err());
    }

    #[test]
    fn empty_object_is_an_empty_list() {
        let catalog = SourceCatalog::from_value(json!({})).expect("parse");
        assert!(catalog.is_empty());
        assert_eq!(catalog.layout, SourceLayout::List);
    }
}
