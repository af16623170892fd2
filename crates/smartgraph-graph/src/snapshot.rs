use crate::cell::CellMessage;
use serde::{Deserialize, Serialize};
use smartgraph_core::Value;

/// Serializable subset of [`Value`]: everything except nested graphs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TryFrom<&Value> for ScalarValue {
    type Error = ();

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        Ok(match value {
            Value::Null => ScalarValue::Null,
            Value::Bool(b) => ScalarValue::Bool(*b),
            Value::Int(i) => ScalarValue::Int(*i),
            Value::Float(f) => ScalarValue::Float(*f),
            Value::Text(s) => ScalarValue::Text(s.clone()),
            Value::Child(_) => return Err(()),
        })
    }
}

impl From<ScalarValue> for Value {
    fn from(v: ScalarValue) -> Self {
        match v {
            ScalarValue::Null => Value::Null,
            ScalarValue::Bool(b) => Value::Bool(b),
            ScalarValue::Int(i) => Value::Int(i),
            ScalarValue::Float(f) => Value::Float(f),
            ScalarValue::Text(s) => Value::Text(s),
        }
    }
}

/// Pure-data form of a cell: `(name, value, rule messages, read-only)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub name: String,
    pub value: ScalarValue,
    #[serde(default)]
    pub rule_messages: Vec<CellMessage>,
    #[serde(default)]
    pub is_read_only: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::RuleId;

    #[test]
    fn json_shape_is_stable() {
        let snap = CellSnapshot {
            name: "Age".into(),
            value: ScalarValue::Int(42),
            rule_messages: vec![CellMessage::new(RuleId(1), "too old")],
            is_read_only: false,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["value"]["type"], "int");
        assert_eq!(json["value"]["value"], 42);
        assert_eq!(json["rule_messages"][0]["message"], "too old");

        let back: CellSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snap);
    }

    #[test]
    fn missing_optional_fields_default() {
        let snap: CellSnapshot =
            serde_json::from_str(r#"{"name":"N","value":{"type":"null"}}"#).unwrap();
        assert!(snap.rule_messages.is_empty());
        assert!(!snap.is_read_only);
    }
}
