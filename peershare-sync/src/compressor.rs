//! Lossy compressor for canvas-shaped states.
//!
//! A canvas state is an object with a `blocks` array, optionally
//! `connections` and `viewport`:
//!
//! ```text
//! {
//!   "blocks":      [{"id", "position": {x, y}, "size": {width, height},
//!                    "scale", "rotation", "locked", "hidden", ...}],
//!   "connections": [{"from", "to", "fromPort", "toPort", "style", "label", ...}],
//!   "viewport":    {"x", "y", "zoom"}
//! }
//! ```
//!
//! Compression rounds geometry to integers, `scale`/`zoom` to two decimals,
//! strips default-valued fields, deduplicates blocks by id (first wins) and
//! connections by endpoint tuple, and drops connections whose endpoints are
//! missing. Everything else passes through untouched.

use std::collections::HashSet;

use serde_json::{Map, Value};

const BLOCK_DEFAULTS: [(&str, DefaultValue); 4] = [
    ("scale", DefaultValue::Number(1.0)),
    ("rotation", DefaultValue::Number(0.0)),
    ("locked", DefaultValue::Bool(false)),
    ("hidden", DefaultValue::Bool(false)),
];

const CONNECTION_DEFAULTS: [(&str, DefaultValue); 2] = [
    ("style", DefaultValue::Str("solid")),
    ("label", DefaultValue::Str("")),
];

const VIEWPORT_DEFAULTS: [(&str, DefaultValue); 1] = [("zoom", DefaultValue::Number(1.0))];

#[derive(Debug, Clone, Copy)]
enum DefaultValue {
    Number(f64),
    Bool(bool),
    Str(&'static str),
}

impl DefaultValue {
    fn matches(self, value: &Value) -> bool {
        match self {
            DefaultValue::Number(n) => value.as_f64() == Some(n),
            DefaultValue::Bool(b) => value.as_bool() == Some(b),
            DefaultValue::Str(s) => value.as_str() == Some(s),
        }
    }

    fn to_value(self) -> Value {
        match self {
            DefaultValue::Number(n) if n.fract() == 0.0 => Value::from(n as i64),
            DefaultValue::Number(n) => Value::from(n),
            DefaultValue::Bool(b) => Value::Bool(b),
            DefaultValue::Str(s) => Value::from(s),
        }
    }
}

/// Whether `state` has the canvas shape the compressor understands.
pub fn is_canvas_state(state: &Value) -> bool {
    state.get("blocks").is_some_and(Value::is_array)
}

/// Compress a canvas state. Non-canvas states are returned as-is.
pub fn compress(state: &Value) -> Value {
    let Some(root) = state.as_object().filter(|_| is_canvas_state(state)) else {
        return state.clone();
    };

    let mut out = root.clone();
    let mut block_ids = HashSet::new();

    if let Some(Value::Array(blocks)) = root.get("blocks") {
        let mut kept = Vec::with_capacity(blocks.len());
        for block in blocks {
            if let Some(id) = block.get("id") {
                if !block_ids.insert(id.to_string()) {
                    continue;
                }
            }
            kept.push(compress_block(block));
        }
        out.insert("blocks".into(), Value::Array(kept));
    }

    if let Some(Value::Array(connections)) = root.get("connections") {
        let mut seen = HashSet::new();
        let kept: Vec<Value> = connections
            .iter()
            .filter(|conn| {
                let endpoint = |key: &str| {
                    conn.get(key)
                        .is_some_and(|id| block_ids.contains(&id.to_string()))
                };
                endpoint("from") && endpoint("to")
            })
            .filter(|conn| seen.insert(connection_key(conn)))
            .map(|conn| {
                let mut conn = conn.clone();
                if let Value::Object(map) = &mut conn {
                    strip_defaults(map, &CONNECTION_DEFAULTS);
                }
                conn
            })
            .collect();
        out.insert("connections".into(), Value::Array(kept));
    }

    if let Some(Value::Object(viewport)) = root.get("viewport") {
        let mut viewport = viewport.clone();
        round_fields(&mut viewport, &["x", "y"], 0);
        round_fields(&mut viewport, &["zoom"], 2);
        strip_defaults(&mut viewport, &VIEWPORT_DEFAULTS);
        out.insert("viewport".into(), Value::Object(viewport));
    }

    Value::Object(out)
}

/// Reinstate the defaults [`compress`] stripped.
pub fn decompress(state: &Value) -> Value {
    let mut out = state.clone();
    if !is_canvas_state(&out) {
        return out;
    }

    if let Some(Value::Array(blocks)) = out.get_mut("blocks") {
        for block in blocks.iter_mut() {
            if let Value::Object(map) = block {
                fill_defaults(map, &BLOCK_DEFAULTS);
            }
        }
    }
    if let Some(Value::Array(connections)) = out.get_mut("connections") {
        for conn in connections.iter_mut() {
            if let Value::Object(map) = conn {
                fill_defaults(map, &CONNECTION_DEFAULTS);
            }
        }
    }
    if let Some(Value::Object(viewport)) = out.get_mut("viewport") {
        fill_defaults(viewport, &VIEWPORT_DEFAULTS);
    }
    out
}

fn compress_block(block: &Value) -> Value {
    let Value::Object(map) = block else {
        return block.clone();
    };
    let mut map = map.clone();

    round_fields(&mut map, &["x", "y", "width", "height"], 0);
    if let Some(Value::Object(position)) = map.get_mut("position") {
        round_fields(position, &["x", "y"], 0);
    }
    if let Some(Value::Object(size)) = map.get_mut("size") {
        round_fields(size, &["width", "height"], 0);
    }
    round_fields(&mut map, &["scale"], 2);
    strip_defaults(&mut map, &BLOCK_DEFAULTS);

    Value::Object(map)
}

fn connection_key(conn: &Value) -> String {
    ["from", "to", "fromPort", "toPort"]
        .iter()
        .map(|key| conn.get(*key).map(Value::to_string).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|")
}

fn round_fields(map: &mut Map<String, Value>, keys: &[&str], decimals: i32) {
    for key in keys {
        if let Some(value) = map.get_mut(*key) {
            if let Some(rounded) = value.as_f64().and_then(|n| round_number(n, decimals)) {
                *value = rounded;
            }
        }
    }
}

fn round_number(n: f64, decimals: i32) -> Option<Value> {
    let factor = 10f64.powi(decimals);
    let rounded = (n * factor).round() / factor;
    if rounded.fract() == 0.0 && rounded.abs() < i64::MAX as f64 {
        Some(Value::from(rounded as i64))
    } else {
        serde_json::Number::from_f64(rounded).map(Value::Number)
    }
}

fn strip_defaults(map: &mut Map<String, Value>, defaults: &[(&str, DefaultValue)]) {
    for (key, default) in defaults {
        if map.get(*key).is_some_and(|v| default.matches(v)) {
            map.remove(*key);
        }
    }
}

fn fill_defaults(map: &mut Map<String, Value>, defaults: &[(&str, DefaultValue)]) {
    for (key, default) in defaults {
        if !map.contains_key(*key) {
            map.insert((*key).to_string(), default.to_value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn sample_canvas() -> Value {
        json!({
            "blocks": [
                {"id": "a", "position": {"x": 10.4, "y": 20.6}, "size": {"width": 100.2, "height": 50.0},
                 "scale": 1.0, "rotation": 0, "locked": false, "hidden": false, "text": "hi"},
                {"id": "b", "position": {"x": 1, "y": 2}, "scale": 1.256, "rotation": 90, "locked": true},
                {"id": "a", "position": {"x": 999, "y": 999}},
            ],
            "connections": [
                {"from": "a", "to": "b", "fromPort": "out", "toPort": "in", "style": "solid", "label": ""},
                {"from": "a", "to": "b", "fromPort": "out", "toPort": "in", "style": "dashed"},
                {"from": "a", "to": "ghost"},
            ],
            "viewport": {"x": 0.4, "y": -3.7, "zoom": 1.0},
            "title": "board",
        })
    }

    #[test]
    fn test_compress_canvas() {
        let compressed = compress(&sample_canvas());

        let blocks = compressed["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], json!({
            "id": "a", "position": {"x": 10, "y": 21}, "size": {"width": 100, "height": 50}, "text": "hi"
        }));
        assert_eq!(blocks[1]["scale"], json!(1.26));
        assert_eq!(blocks[1]["rotation"], json!(90));
        assert_eq!(blocks[1]["locked"], json!(true));

        let connections = compressed["connections"].as_array().unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0], json!({"from": "a", "to": "b", "fromPort": "out", "toPort": "in"}));

        assert_eq!(compressed["viewport"], json!({"x": 0, "y": -4}));
        assert_eq!(compressed["title"], "board");
    }

    #[test]
    fn test_decompress_restores_defaults() {
        let restored = decompress(&compress(&sample_canvas()));

        let first = &restored["blocks"][0];
        assert_eq!(first["scale"], json!(1));
        assert_eq!(first["rotation"], json!(0));
        assert_eq!(first["locked"], json!(false));
        assert_eq!(first["hidden"], json!(false));
        assert_eq!(restored["connections"][0]["style"], "solid");
        assert_eq!(restored["connections"][0]["label"], "");
        assert_eq!(restored["viewport"]["zoom"], json!(1));
    }

    #[test]
    fn test_non_canvas_passthrough() {
        let state = json!({"text": "hello", "scale": 1.0});
        assert_eq!(compress(&state), state);
        assert_eq!(decompress(&state), state);
        assert_eq!(compress(&json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_missing_viewport_not_created() {
        let restored = decompress(&compress(&json!({"blocks": []})));
        assert!(restored.get("viewport").is_none());
        assert!(restored.get("connections").is_none());
    }

    fn arb_block(id: usize) -> impl Strategy<Value = Value> {
        (
            -5000.0f64..5000.0,
            -5000.0f64..5000.0,
            0.5f64..3.0,
            prop_oneof![Just(0i64), Just(90), Just(180)],
            any::<bool>(),
        )
            .prop_map(move |(x, y, scale, rotation, locked)| {
                json!({
                    "id": format!("b{id}"),
                    "position": {"x": x, "y": y},
                    "scale": scale,
                    "rotation": rotation,
                    "locked": locked,
                    "hidden": false,
                })
            })
    }

    fn arb_canvas() -> impl Strategy<Value = Value> {
        (1usize..6)
            .prop_flat_map(|n| {
                let blocks: Vec<_> = (0..n).map(arb_block).collect();
                (blocks, Just(n), 0.25f64..4.0)
            })
            .prop_map(|(blocks, n, zoom)| {
                let connections: Vec<Value> = (1..n)
                    .map(|i| json!({"from": format!("b{}", i - 1), "to": format!("b{i}"), "style": "solid"}))
                    .collect();
                json!({"blocks": blocks, "connections": connections, "viewport": {"x": 0, "y": 0, "zoom": zoom}})
            })
    }

    fn close(a: &Value, b: &Value, tolerance: f64) -> bool {
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= tolerance,
            _ => a == b,
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip_is_field_equivalent(canvas in arb_canvas()) {
            let restored = decompress(&compress(&canvas));
            let original = canvas["blocks"].as_array().unwrap();
            let blocks = restored["blocks"].as_array().unwrap();
            prop_assert_eq!(original.len(), blocks.len());

            for (before, after) in original.iter().zip(blocks) {
                prop_assert_eq!(&before["id"], &after["id"]);
                prop_assert!(close(&before["position"]["x"], &after["position"]["x"], 0.5));
                prop_assert!(close(&before["position"]["y"], &after["position"]["y"], 0.5));
                prop_assert!(close(&before["scale"], &after["scale"], 0.005 + 1e-9));
                prop_assert!(close(&before["rotation"], &after["rotation"], 0.0));
                prop_assert_eq!(&before["locked"], &after["locked"]);
                prop_assert_eq!(&before["hidden"], &after["hidden"]);
            }

            prop_assert_eq!(
                canvas["connections"].as_array().unwrap().len(),
                restored["connections"].as_array().unwrap().len()
            );
            prop_assert!(close(&canvas["viewport"]["zoom"], &restored["viewport"]["zoom"], 0.005 + 1e-9));
        }
    }
}
