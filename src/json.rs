//! JSON rendering of decoded object graphs.
//!
//! Python values that JSON cannot express natively are wrapped in
//! single-key marker objects: `@t` tuple, `@b` bytes (base64), `@bi`
//! big integer (decimal string), `@d` dict with non-string keys,
//! `@set` / `@fset` sets, `@cls` class reference, `@arr` numpy array.
//! Typed records carry `@cls` plus `@args`, `@s` (named fields) and
//! `@state` (opaque state). A reference back into the current path
//! renders as `@cycle` with the node handle.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Map, Value as Json};

use crate::npy::NdArray;
use crate::types::{Node, ObjectId, Unpickled, Value};

/// Render a decoded graph as JSON for inspection.
pub fn to_json(result: &Unpickled) -> Json {
    let mut walker = Walker {
        result,
        on_path: vec![false; result.graph.len()],
    };
    walker.value(&result.root)
}

struct Walker<'a> {
    result: &'a Unpickled,
    /// Nodes on the current walk path; a repeat is a cycle edge
    on_path: Vec<bool>,
}

impl<'a> Walker<'a> {
    fn value(&mut self, val: &Value) -> Json {
        match val {
            Value::None => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => json!(*i),
            // Stored as a string to avoid precision loss
            Value::BigInt(bi) => json!({"@bi": bi.to_string()}),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(b) => json!({"@b": BASE64.encode(b)}),
            Value::Class(class) => {
                json!({"@cls": [&class.key.module, &class.key.name]})
            }
            Value::Ref(id) => {
                if self.on_path[id.index()] {
                    return json!({"@cycle": id.index()});
                }
                self.on_path[id.index()] = true;
                let rendered = self.node(*id);
                self.on_path[id.index()] = false;
                rendered
            }
        }
    }

    fn node(&mut self, id: ObjectId) -> Json {
        match self.result.graph.node(id) {
            Node::List(items) => {
                Json::Array(items.iter().map(|v| self.value(v)).collect())
            }
            Node::Tuple(items) => {
                let arr: Vec<Json> = items.iter().map(|v| self.value(v)).collect();
                json!({"@t": arr})
            }
            Node::Dict(pairs) => self.dict(pairs),
            Node::Set(items) => {
                let arr: Vec<Json> = items.iter().map(|v| self.value(v)).collect();
                json!({"@set": arr})
            }
            Node::FrozenSet(items) => {
                let arr: Vec<Json> = items.iter().map(|v| self.value(v)).collect();
                json!({"@fset": arr})
            }
            Node::Object(obj) => {
                let mut map = Map::new();
                map.insert(
                    "@cls".to_string(),
                    json!([&obj.key.module, &obj.key.name]),
                );
                if !obj.args.is_empty() {
                    let args: Vec<Json> = obj.args.iter().map(|v| self.value(v)).collect();
                    map.insert("@args".to_string(), Json::Array(args));
                }
                if !obj.fields.is_empty() {
                    let mut fields = Map::new();
                    for (name, value) in &obj.fields {
                        let rendered = self.value(value);
                        fields.insert(name.clone(), rendered);
                    }
                    map.insert("@s".to_string(), Json::Object(fields));
                }
                if let Some(state) = &obj.state {
                    let rendered = self.value(state);
                    map.insert("@state".to_string(), rendered);
                }
                Json::Object(map)
            }
            Node::Array(array) => array_json(array),
        }
    }

    fn dict(&mut self, pairs: &[(Value, Value)]) -> Json {
        let all_string_keys = pairs.iter().all(|(k, _)| matches!(k, Value::String(_)));
        if all_string_keys {
            let mut map = Map::new();
            for (k, v) in pairs {
                if let Value::String(key) = k {
                    let rendered = self.value(v);
                    map.insert(key.clone(), rendered);
                }
            }
            Json::Object(map)
        } else {
            // Non-string keys: array-of-pairs representation
            let arr: Vec<Json> = pairs
                .iter()
                .map(|(k, v)| json!([self.value(k), self.value(v)]))
                .collect();
            json!({"@d": arr})
        }
    }
}

fn array_json(array: &NdArray) -> Json {
    json!({
        "@arr": {
            "dtype": array.dtype.descr,
            "shape": array.shape,
            "order": if array.fortran_order { "F" } else { "C" },
            "data": BASE64.encode(&array.data),
        }
    })
}
