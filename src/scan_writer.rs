//! Query projection: turns a raw object iteration into the shaped output
//! `SCAN`/`WITHIN`/`INTERSECTS`/`NEARBY`/`SEARCH` (and fence activation)
//! return (spec §4.6).
//!
//! Grounded on the teacher's terse single-purpose helper style
//! (`geometry/rdp.rs`, `geometry/geohash.rs`) — this module is one focused
//! pass over already-filtered objects, not a new subsystem.

use crate::command::ScanArgs;
use crate::error::CommandResult;
use crate::geometry::geohash;
use crate::hook::{OutputMode, WhereClause, WhereInClause};
use crate::object::{FieldValue, Object};
use serde_json::{Map, Value as Json, json};

/// One row of shaped output.
#[derive(Debug, Clone)]
pub struct Row {
    pub id: String,
    pub value: Json,
    pub distance_meters: Option<f64>,
}

/// Whether `obj` satisfies every `WHERE`/`WHEREIN` clause in `args`.
pub fn passes_filters(args: &ScanArgs, obj: &Object) -> bool {
    passes_where_clauses(&args.wheres, &args.whereins, obj)
}

/// The shared `WHERE`/`WHEREIN` evaluator, also used by `geofence_engine`
/// to apply a hook's scan filters to fence candidates.
pub fn passes_where_clauses(wheres: &[WhereClause], whereins: &[WhereInClause], obj: &Object) -> bool {
    for w in wheres {
        let v = obj.fields.get(&w.field).map(|f| f.as_f64()).unwrap_or(0.0);
        if v < w.min || v > w.max {
            return false;
        }
    }
    for w in whereins {
        let v = obj.fields.get(&w.field).map(|f| f.as_f64()).unwrap_or(0.0);
        if !w.values.iter().any(|candidate| (*candidate - v).abs() < f64::EPSILON) {
            return false;
        }
    }
    true
}

/// Shape one object per `output`/`nofields`, optionally attaching a
/// precomputed distance (`NEARBY`).
pub fn shape(output: OutputMode, nofields: bool, obj: &Object, distance_meters: Option<f64>) -> Row {
    let value = match output {
        OutputMode::Ids => json!(obj.id),
        OutputMode::Count => Json::Null,
        OutputMode::Object => object_value(obj, nofields),
        OutputMode::Point => point_value(obj, nofields),
        OutputMode::Bounds => bounds_value(obj, nofields),
        OutputMode::Hash(precision) => hash_value(obj, precision, nofields),
    };
    Row {
        id: obj.id.clone(),
        value,
        distance_meters,
    }
}

fn fields_value(obj: &Object) -> Option<Json> {
    if obj.fields.is_empty() {
        return None;
    }
    let mut map = Map::new();
    for (name, value) in obj.fields.0.iter() {
        map.insert(name.clone(), field_json(value));
    }
    Some(Json::Object(map))
}

fn field_json(value: &FieldValue) -> Json {
    match value {
        FieldValue::Num(n) => json!(n),
        FieldValue::Str(s) => json!(s),
        FieldValue::Bool(b) => json!(b),
        FieldValue::Null => Json::Null,
    }
}

fn object_value(obj: &Object, nofields: bool) -> Json {
    let mut out = json!({ "id": obj.id });
    match &obj.value {
        crate::object::Value::Geom(g) => {
            out["object"] = serde_json::to_value(g).unwrap_or(Json::Null);
        }
        crate::object::Value::Str(s) => out["object"] = json!(s),
    }
    if !nofields && let Some(fields) = fields_value(obj) {
        out["fields"] = fields;
    }
    out
}

fn point_value(obj: &Object, nofields: bool) -> Json {
    let mut out = json!({ "id": obj.id });
    if let Some(geom) = obj.value.as_geometry() {
        let (lat, lon) = geom.center();
        out["point"] = json!({ "lat": lat, "lon": lon });
    }
    if !nofields && let Some(fields) = fields_value(obj) {
        out["fields"] = fields;
    }
    out
}

fn bounds_value(obj: &Object, nofields: bool) -> Json {
    let mut out = json!({ "id": obj.id });
    if let Some(geom) = obj.value.as_geometry() {
        let rect = geom.rect();
        out["bounds"] = json!({
            "sw": { "lat": rect.min_lat, "lon": rect.min_lon },
            "ne": { "lat": rect.max_lat, "lon": rect.max_lon },
        });
    }
    if !nofields && let Some(fields) = fields_value(obj) {
        out["fields"] = fields;
    }
    out
}

fn hash_value(obj: &Object, precision: u8, nofields: bool) -> Json {
    let mut out = json!({ "id": obj.id });
    if let Some(geom) = obj.value.as_geometry() {
        let (lat, lon) = geom.center();
        out["hash"] = json!(geohash::encode(lat, lon, precision as usize));
    }
    if !nofields && let Some(fields) = fields_value(obj) {
        out["fields"] = fields;
    }
    out
}

/// Run a bounded scan: apply filters, shape, enforce `cursor`/`limit`, and
/// collect rows — the common tail shared by every read command's
/// implementation in `dispatcher.rs`.
pub fn collect(
    args: &ScanArgs,
    mut source: impl FnMut(&mut dyn FnMut(&Object, Option<f64>) -> bool) -> CommandResult<()>,
) -> CommandResult<Vec<Row>> {
    let mut rows = Vec::new();
    let limit = args.limit;
    source(&mut |obj, dist| {
        if let Some(pattern) = &args.matches
            && !crate::command::glob_to_regex(pattern).is_match(&obj.id)
        {
            return true;
        }
        if !passes_filters(args, obj) {
            return true;
        }
        rows.push(shape(args.output, args.nofields, obj, dist));
        !matches!(limit, Some(n) if rows.len() >= n)
    })?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ScanArgs;
    use crate::geometry::Geometry;
    use crate::hook::{WhereClause, WhereInClause};
    use crate::object::Value;

    fn args() -> ScanArgs {
        ScanArgs {
            key: "fleet".into(),
            cursor: 0,
            limit: None,
            matches: None,
            reverse: false,
            wheres: vec![],
            whereins: vec![],
            nofields: false,
            output: OutputMode::Ids,
        }
    }

    #[test]
    fn where_clause_filters_by_range() {
        let mut a = args();
        a.wheres.push(WhereClause {
            field: "speed".into(),
            min: 10.0,
            max: 20.0,
        });
        let mut obj = Object::new("t1", Value::Geom(Geometry::point(0.0, 0.0)));
        obj.fields.set("speed", FieldValue::Num(5.0));
        assert!(!passes_filters(&a, &obj));
        obj.fields.set("speed", FieldValue::Num(15.0));
        assert!(passes_filters(&a, &obj));
    }

    #[test]
    fn wherein_filters_by_membership() {
        let mut a = args();
        a.whereins.push(WhereInClause {
            field: "status".into(),
            values: vec![1.0, 2.0],
        });
        let mut obj = Object::new("t1", Value::Geom(Geometry::point(0.0, 0.0)));
        obj.fields.set("status", FieldValue::Num(3.0));
        assert!(!passes_filters(&a, &obj));
        obj.fields.set("status", FieldValue::Num(2.0));
        assert!(passes_filters(&a, &obj));
    }

    #[test]
    fn ids_output_is_the_bare_id() {
        let obj = Object::new("t1", Value::Geom(Geometry::point(1.0, 2.0)));
        let row = shape(OutputMode::Ids, false, &obj, None);
        assert_eq!(row.value, json!("t1"));
    }
}
