//! Function-call response schema
//!
//! The chat can constrain replies to a small function-call JSON shape. The
//! schema is sent as the request's `json_schema` and the server turns it into
//! a sampling grammar. Property order matters to the generated grammar, so
//! `properties` maps are reordered with [`apply_prop_order`] before sending.

use serde_json::{json, Map, Value};

/// Property order used for the function-call schema
pub const FUNCTION_CALL_PROP_ORDER: [(&str, usize); 2] = [("function", 0), ("arguments", 1)];

/// Build the function-call schema with its property order applied
///
/// Two shapes are accepted: `create_event` with title, date and time
/// arguments, and `image_search` with a query.
///
/// # Examples
///
/// ```
/// use llamachat::grammar::demo_function_call_schema;
///
/// let schema = demo_function_call_schema();
/// let first = &schema["oneOf"][0]["properties"];
/// let keys: Vec<&String> = first.as_object().unwrap().keys().collect();
/// assert_eq!(keys, ["function", "arguments"]);
/// assert_eq!(first["function"]["const"], "create_event");
/// ```
pub fn demo_function_call_schema() -> Value {
    let mut schema = json!({
        "oneOf": [
            function_shape("create_event", &["title", "date", "time"]),
            function_shape("image_search", &["query"]),
        ]
    });
    apply_prop_order(&mut schema, &FUNCTION_CALL_PROP_ORDER);
    schema
}

fn function_shape(name: &str, arguments: &[&str]) -> Value {
    let mut argument_props = Map::new();
    for arg in arguments {
        argument_props.insert((*arg).to_string(), json!({ "type": "string" }));
    }
    json!({
        "type": "object",
        "properties": {
            "arguments": {
                "type": "object",
                "properties": argument_props,
            },
            "function": { "const": name },
        }
    })
}

/// Reorder every `properties` map in `schema`
///
/// Keys named in `order` come first, by rank. Other keys follow in their
/// existing order. Nested schemas are reordered too.
pub fn apply_prop_order(schema: &mut Value, order: &[(&str, usize)]) {
    match schema {
        Value::Object(map) => {
            if let Some(Value::Object(props)) = map.get_mut("properties") {
                let mut entries: Vec<(usize, usize, String, Value)> =
                    std::mem::take(props)
                        .into_iter()
                        .enumerate()
                        .map(|(position, (key, value))| {
                            let rank = rank_of(&key, order);
                            (rank, position, key, value)
                        })
                        .collect();
                entries.sort_by_key(|(rank, position, _, _)| (*rank, *position));
                *props = entries
                    .into_iter()
                    .map(|(_, _, key, value)| (key, value))
                    .collect();
            }
            for value in map.values_mut() {
                apply_prop_order(value, order);
            }
        }
        Value::Array(items) => {
            for item in items {
                apply_prop_order(item, order);
            }
        }
        _ => {}
    }
}

fn rank_of(key: &str, order: &[(&str, usize)]) -> usize {
    order
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, rank)| *rank)
        .unwrap_or(usize::MAX)
}
