//! Dotted-path navigation over a JSON document, for `JGET`/`JSET`/`JDEL`
//! (spec §6.3 "JSON field access"). Segments are object keys, or bare
//! integers for array indices (`fields.0.name`).
//!
//! Grounded on `scan_writer.rs`'s terse single-purpose-helper style — this
//! is one small recursive tool, not a general JSON-path engine.

use serde_json::Value as Json;

fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Read the value at `path`, or `None` if any segment doesn't resolve.
pub fn get<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = root;
    for seg in segments(path) {
        cur = if let Ok(idx) = seg.parse::<usize>() {
            cur.as_array()?.get(idx)?
        } else {
            cur.as_object()?.get(seg)?
        };
    }
    Some(cur)
}

/// Write `value` at `path`, creating intermediate objects/arrays as needed.
pub fn set(root: &mut Json, path: &str, value: Json) {
    set_rec(root, &segments(path), value);
}

fn set_rec(cur: &mut Json, segs: &[&str], value: Json) {
    let Some((head, rest)) = segs.split_first() else {
        *cur = value;
        return;
    };
    if let Ok(idx) = head.parse::<usize>() {
        if !cur.is_array() {
            *cur = Json::Array(Vec::new());
        }
        let arr = cur.as_array_mut().unwrap();
        while arr.len() <= idx {
            arr.push(Json::Null);
        }
        set_rec(&mut arr[idx], rest, value);
    } else {
        if !cur.is_object() {
            *cur = Json::Object(serde_json::Map::new());
        }
        let obj = cur.as_object_mut().unwrap();
        let entry = obj.entry((*head).to_string()).or_insert(Json::Null);
        set_rec(entry, rest, value);
    }
}

/// Remove the value at `path`. Returns whether anything was removed.
pub fn del(root: &mut Json, path: &str) -> bool {
    let segs = segments(path);
    let Some((last, init)) = segs.split_last() else {
        return false;
    };
    let mut cur = root;
    for seg in init {
        cur = if let Ok(idx) = seg.parse::<usize>() {
            match cur.as_array_mut().and_then(|a| a.get_mut(idx)) {
                Some(c) => c,
                None => return false,
            }
        } else {
            match cur.as_object_mut().and_then(|o| o.get_mut(*seg)) {
                Some(c) => c,
                None => return false,
            }
        };
    }
    if let Ok(idx) = last.parse::<usize>() {
        match cur.as_array_mut() {
            Some(arr) if idx < arr.len() => {
                arr.remove(idx);
                true
            }
            _ => false,
        }
    } else {
        cur.as_object_mut().is_some_and(|obj| obj.remove(*last).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_reads_nested_field() {
        let doc = json!({"a": {"b": 3}});
        assert_eq!(get(&doc, "a.b"), Some(&json!(3)));
    }

    #[test]
    fn set_creates_missing_parents() {
        let mut doc = json!({});
        set(&mut doc, "a.b.c", json!(5));
        assert_eq!(doc, json!({"a": {"b": {"c": 5}}}));
    }

    #[test]
    fn set_extends_arrays() {
        let mut doc = json!({"items": []});
        set(&mut doc, "items.2", json!("x"));
        assert_eq!(doc, json!({"items": [null, null, "x"]}));
    }

    #[test]
    fn del_removes_object_key() {
        let mut doc = json!({"a": {"b": 1, "c": 2}});
        assert!(del(&mut doc, "a.b"));
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }

    #[test]
    fn del_missing_path_returns_false() {
        let mut doc = json!({"a": 1});
        assert!(!del(&mut doc, "x.y"));
    }
}
