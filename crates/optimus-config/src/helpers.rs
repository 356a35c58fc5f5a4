//! Helper functions for extracting values from KDL nodes.

use kdl::{KdlNode, KdlValue};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_integer_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    // Repeated attributes like depends-on="a" depends-on="b"
    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    // Block syntax: `depends-on "a" "b"` as a child node
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

/// Find a child node by name.
pub(crate) fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?
        .nodes()
        .iter()
        .find(|c| c.name().value() == name)
}

/// Read a setting given either as a property (`name="x"`) or as a child (`name "x"`).
pub(crate) fn get_string_setting(node: &KdlNode, name: &str) -> Option<String> {
    get_string_prop(node, name).or_else(|| child(node, name).and_then(get_first_string_arg))
}

/// Read a flag given either as a property (`name=#true`), a child with a value
/// (`name #true`), or a bare child (`name`).
pub(crate) fn get_flag_setting(node: &KdlNode, name: &str) -> Option<bool> {
    get_bool_prop(node, name).or_else(|| {
        child(node, name).map(|c| get_first_arg(c).and_then(|v| v.as_bool()).unwrap_or(true))
    })
}

pub(crate) fn kdl_value_to_json(value: &KdlValue) -> serde_json::Value {
    if let Some(s) = value.as_string() {
        serde_json::Value::String(s.to_string())
    } else if let Some(i) = value.as_integer() {
        i64::try_from(i)
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::String(i.to_string()))
    } else if let Some(f) = value.as_float() {
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    } else if let Some(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else {
        serde_json::Value::Null
    }
}

/// Convert a node's children into a JSON object.
///
/// `key "v"` becomes a scalar, `key "a" "b"` an array, properties and nested
/// children become an object. Names listed in `skip` are left out.
pub(crate) fn children_to_json(node: &KdlNode, skip: &[&str]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    if let Some(children) = node.children() {
        for c in children.nodes() {
            let key = c.name().value();
            if skip.contains(&key) {
                continue;
            }
            map.insert(key.to_string(), node_to_json(c));
        }
    }
    serde_json::Value::Object(map)
}

fn node_to_json(node: &KdlNode) -> serde_json::Value {
    let args: Vec<serde_json::Value> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| kdl_value_to_json(e.value()))
        .collect();
    let props: Vec<(String, serde_json::Value)> = node
        .entries()
        .iter()
        .filter_map(|e| {
            e.name()
                .map(|n| (n.value().to_string(), kdl_value_to_json(e.value())))
        })
        .collect();
    let has_children = node.children().is_some_and(|c| !c.nodes().is_empty());

    if props.is_empty() && !has_children {
        return match args.len() {
            0 => serde_json::Value::Bool(true),
            1 => args.into_iter().next().unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::Array(args),
        };
    }

    let mut object = match children_to_json(node, &[]) {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    for (k, v) in props {
        object.insert(k, v);
    }
    match args.len() {
        0 => {}
        1 => {
            object.insert(
                "value".to_string(),
                args.into_iter().next().unwrap_or(serde_json::Value::Null),
            );
        }
        _ => {
            object.insert("value".to_string(), serde_json::Value::Array(args));
        }
    }
    serde_json::Value::Object(object)
}
