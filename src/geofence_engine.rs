//! Geofence classification and dispatch (spec §4.3).
//!
//! Grounded on the teacher's `geofence.rs` layered-circle fence model,
//! generalized to the spec's full within/intersects/nearby/roam predicate
//! set, and on `geofence_repo.rs` for how fence-to-object relationships are
//! tracked without raw pointers (tuple-keyed maps, same as `hook_registry`).

use crate::collection::{Collection, Deadline};
use crate::geometry::Geometry;
use crate::hook::{Detect, Hook, RoamSpec};
use crate::hook_registry::HookRegistry;
use crate::object::Object;
use crate::scan_writer::passes_where_clauses;
use serde_json::json;
use std::collections::BTreeMap;

/// One geofence message ready for delivery (spec §4.3 "message assembly").
#[derive(Debug, Clone)]
pub struct FenceEvent {
    pub hook_name: String,
    pub detect: Detect,
    pub key: String,
    pub id: String,
    pub object: serde_json::Value,
}

/// Whether `obj`'s geometry satisfies `hook`'s fence predicate, after the
/// hook's own `WHERE`/`WHEREIN` scan filters (spec §4.3.2 "apply scan
/// filters to classify").
fn matches_fence(hook: &Hook, geom: &Geometry, obj: &Object) -> bool {
    if !passes_where_clauses(&hook.fence.wheres, &hook.fence.whereins, obj) {
        return false;
    }
    use crate::hook::FenceKind;
    match hook.fence.kind {
        FenceKind::Within => geom.within(&hook.fence.geometry),
        FenceKind::Intersects => geom.intersects(&hook.fence.geometry),
        FenceKind::Nearby => geom.distance_meters(&hook.fence.geometry) <= circle_radius(&hook.fence.geometry),
    }
}

fn circle_radius(geom: &Geometry) -> f64 {
    match geom {
        Geometry::Circle { meters, .. } => *meters,
        _ => 0.0,
    }
}

/// Whether the segment from `prev` to `next` crosses the fence boundary,
/// approximated as "matched one endpoint but not the other" when the fence
/// kind can't express a true line/polygon boundary crossing for non-point
/// geometry (a documented simplification: full segment-vs-fence-boundary
/// intersection is out of scope without a richer `geo` dependency).
fn crosses(hook: &Hook, prev: &Geometry, next: &Geometry, obj: &Object) -> bool {
    if !passes_where_clauses(&hook.fence.wheres, &hook.fence.whereins, obj) {
        return false;
    }
    if let (Geometry::Point { lat: la1, lon: lo1, .. }, Geometry::Point { lat: la2, lon: lo2, .. }) =
        (prev, next)
    {
        let segment = Geometry::LineString(vec![(*la1, *lo1), (*la2, *lo2)]);
        return segment.intersects(&hook.fence.geometry);
    }
    matches_fence(hook, prev, obj) != matches_fence(hook, next, obj)
}

/// Collapse a detect code a hook doesn't subscribe to into its "inside the
/// fence / outside the fence" counterpart (spec §4.3.2 "if detect isn't in
/// the hook's set, collapse enter->inside, exit->outside").
fn collapse(d: Detect) -> Option<Detect> {
    match d {
        Detect::Enter => Some(Detect::Inside),
        Detect::Exit => Some(Detect::Outside),
        _ => None,
    }
}

/// Fences whose bounding rect could plausibly be affected by this object's
/// move, i.e. the candidate set before per-hook predicate evaluation (spec
/// §4.3.1 "candidate selection").
fn candidate_hooks<'a>(
    registry: &'a HookRegistry,
    key: &str,
    prev: Option<&Geometry>,
    next: Option<&Geometry>,
) -> Vec<&'a Hook> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    let mut push = |h: &'a Hook| {
        if h.key == key && seen.insert(h.name.clone()) {
            out.push(h);
        }
    };
    if let Some(g) = next {
        for h in registry.intersecting(&g.rect()) {
            push(h);
        }
    }
    if let Some(g) = prev {
        for h in registry.intersecting(&g.rect()) {
            push(h);
        }
    }
    // outside-aware hooks must be considered even when the object never
    // enters their bounding rect at all (spec §4.3.1)
    for h in registry.outside_aware_for_key(key) {
        push(h);
    }
    let next_rect = next.map(|g| g.rect()).unwrap_or(crate::geometry::Rect::ZERO);
    for h in registry.cross_aware_intersecting(&next_rect) {
        push(h);
    }
    // roam hooks have no geometry of their own to intersect against — they
    // track neighbors of the moving object itself, so every roam hook on
    // this key is always a candidate.
    for name in registry.matching("*") {
        if let Some(h) = registry.get(&name)
            && h.key == key
            && h.fence.roam.is_some()
        {
            push(h);
        }
    }
    out
}

/// Evaluate every candidate hook against an object's old/new position and
/// return the events to dispatch, already in the spec's stable sort order
/// (exit < outside < enter < inside < cross < roam, then hook name).
///
/// `is_fset` matches spec §4.3.2's `fset` special case: `enter` is rewritten
/// to `inside` and cross detection is skipped, since `FSET` never implies
/// the object actually moved.
pub fn evaluate_move(
    registry: &mut HookRegistry,
    collection: &Collection,
    key: &str,
    obj: &Object,
    prev_geom: Option<&Geometry>,
    is_fset: bool,
) -> Vec<FenceEvent> {
    let next_geom = obj.value.as_geometry();
    let candidates: Vec<String> = candidate_hooks(registry, key, prev_geom, next_geom)
        .into_iter()
        .map(|h| h.name.clone())
        .collect();

    let mut events = Vec::new();
    for name in candidates {
        let hook = match registry.get(&name) {
            Some(h) => h.clone(),
            None => continue,
        };
        if let Some(pattern) = &hook.fence.glob
            && !crate::command::glob_to_regex(pattern).is_match(&obj.id)
        {
            continue;
        }
        let Some(next) = next_geom else { continue };

        if let Some(roam) = hook.fence.roam.clone() {
            events.extend(evaluate_roam(&hook, &roam, registry, collection, key, obj, prev_geom, next));
            continue;
        }

        let match1 = prev_geom.is_some_and(|g| matches_fence(&hook, g, obj));
        let match2 = matches_fence(&hook, next, obj);

        let mut base_detect = match (match1, match2) {
            (false, true) => Some(Detect::Enter),
            (true, false) => Some(Detect::Exit),
            (true, true) => Some(Detect::Inside),
            // (false, false): no inside/outside transition to report; a
            // standalone `cross` fires below if the segment crossed the
            // fence boundary, otherwise there is nothing to emit at all.
            (false, false) => None,
        };
        if is_fset && base_detect == Some(Detect::Enter) {
            base_detect = Some(Detect::Inside);
        }

        let mut fired: Vec<Detect> = Vec::new();
        if let Some(raw) = base_detect {
            let resolved = if hook.fence.detects(raw) {
                Some(raw)
            } else {
                collapse(raw).filter(|c| hook.fence.detects(*c))
            };
            if let Some(d) = resolved {
                fired.push(d);
            }
        }

        let cross_fires = !is_fset
            && hook.fence.detects(Detect::Cross)
            && prev_geom.is_some_and(|prev| crosses(&hook, prev, next, obj));
        if cross_fires {
            fired.push(Detect::Cross);
        }

        // "For enter/exit/cross, additionally emit the corresponding
        // inside/outside message if detect set requests" (spec §4.3.4).
        let mut secondary = Vec::new();
        for d in &fired {
            let candidate = match d {
                Detect::Enter | Detect::Cross if match2 => Some(Detect::Inside),
                Detect::Exit | Detect::Cross if !match2 => Some(Detect::Outside),
                _ => None,
            };
            if let Some(c) = candidate
                && hook.fence.detects(c)
                && !fired.contains(&c)
                && !secondary.contains(&c)
            {
                secondary.push(c);
            }
        }
        fired.extend(secondary);

        for d in fired {
            let force_new = matches!(d, Detect::Enter | Detect::Cross);
            registry.renew_group(&hook.name, key, &obj.id, force_new);
            events.push(FenceEvent {
                hook_name: hook.name.clone(),
                detect: d,
                key: key.to_string(),
                id: obj.id.clone(),
                object: assemble_object(&hook, obj),
            });
        }
    }

    sort_events(&mut events);
    events
}

/// Roam branch of `evaluate_move` (spec §4.3.2 "roam-configured" / §8
/// testable property 6): classify every other object within `radius` of
/// the moving object's old and new positions into dwelling/nearby/faraway.
fn evaluate_roam(
    hook: &Hook,
    roam: &RoamSpec,
    registry: &mut HookRegistry,
    collection: &Collection,
    key: &str,
    obj: &Object,
    prev_geom: Option<&Geometry>,
    next: &Geometry,
) -> Vec<FenceEvent> {
    if !passes_where_clauses(&hook.fence.wheres, &hook.fence.whereins, obj) {
        return Vec::new();
    }
    let id_re = roam.id_pattern.as_deref().map(crate::command::glob_to_regex);
    let neighbor_ok = |id: &str| id != obj.id && id_re.as_ref().is_none_or(|re| re.is_match(id));

    let mut old_near: BTreeMap<String, f64> = BTreeMap::new();
    if let Some(prev) = prev_geom {
        let _ = collection.nearby(prev, Deadline::NONE, |cand, dist| {
            if dist > roam.radius_meters {
                return false;
            }
            if neighbor_ok(&cand.id) {
                old_near.insert(cand.id.clone(), dist);
            }
            true
        });
    }

    let mut new_near: BTreeMap<String, f64> = BTreeMap::new();
    let _ = collection.nearby(next, Deadline::NONE, |cand, dist| {
        if dist > roam.radius_meters {
            return false;
        }
        if neighbor_ok(&cand.id) {
            new_near.insert(cand.id.clone(), dist);
        }
        true
    });

    let mut nearby_pairs = Vec::new();
    let mut dwell_pairs = Vec::new();
    for (id, dist) in &new_near {
        if old_near.contains_key(id) {
            if !roam.nodwell {
                dwell_pairs.push((id.clone(), *dist));
            }
        } else {
            nearby_pairs.push((id.clone(), *dist));
        }
    }

    let mut faraway_pairs = Vec::new();
    for (id, _) in &old_near {
        if new_near.contains_key(id) {
            continue;
        }
        // distance is recomputed relative to O+, the object's new position
        // (spec §4.3.2 "faraway ... distance recomputed relative to O+").
        let dist = collection
            .get(id)
            .and_then(|o| o.value.as_geometry())
            .map(|g| next.distance_meters(g))
            .unwrap_or(f64::MAX);
        faraway_pairs.push((id.clone(), dist));
    }

    let by_distance_then_id = |a: &(String, f64), b: &(String, f64)| {
        a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
    };
    nearby_pairs.sort_by(by_distance_then_id);
    dwell_pairs.sort_by(by_distance_then_id);
    faraway_pairs.sort_by(by_distance_then_id);

    let mut events = Vec::new();
    for (status, pairs) in [("nearby", nearby_pairs), ("dwell", dwell_pairs), ("faraway", faraway_pairs)] {
        for (neighbor_id, dist) in pairs {
            registry.renew_group(&hook.name, key, &obj.id, false);
            events.push(FenceEvent {
                hook_name: hook.name.clone(),
                detect: Detect::Roam,
                key: key.to_string(),
                id: obj.id.clone(),
                object: assemble_roam_sub(hook, obj, status, &neighbor_id, dist),
            });
        }
    }
    events
}

fn sort_events(events: &mut [FenceEvent]) {
    events.sort_by(|a, b| {
        a.detect
            .sort_rank()
            .cmp(&b.detect.sort_rank())
            .then_with(|| a.hook_name.cmp(&b.hook_name))
    });
}

/// Build the object payload for a fence message, honoring `nofields`
/// (spec §4.3 "message assembly fields").
fn assemble_object(hook: &Hook, obj: &Object) -> serde_json::Value {
    let mut out = json!({ "id": obj.id });
    match &obj.value {
        crate::object::Value::Geom(g) => {
            out["object"] = serde_json::to_value(g).unwrap_or(serde_json::Value::Null);
        }
        crate::object::Value::Str(s) => {
            out["object"] = json!(s);
        }
    }
    if !hook.nofields && !obj.fields.is_empty() {
        let mut fields = serde_json::Map::new();
        for (name, value) in obj.fields.0.iter() {
            fields.insert(name.clone(), json!(value.to_string()));
        }
        out["fields"] = serde_json::Value::Object(fields);
    }
    out
}

/// Build the payload for one roam sub-event: the moving object plus the
/// neighbor's id/status/distance (spec §4.3.4 "roam ... nearby/faraway
/// sub-objects", distance in meters rounded to the nearest millimeter).
fn assemble_roam_sub(hook: &Hook, obj: &Object, status: &str, neighbor_id: &str, distance_meters: f64) -> serde_json::Value {
    let mut out = assemble_object(hook, obj);
    out["nearby"] = json!({
        "id": neighbor_id,
        "status": status,
        "meters": (distance_meters * 1000.0).round() / 1000.0,
    });
    out
}

/// Called when an object is deleted outright: fires `exit`/`outside` for
/// every hook it was previously inside, then clears its groups.
pub fn evaluate_delete(registry: &mut HookRegistry, key: &str, prev: &Object) -> Vec<FenceEvent> {
    let mut events = Vec::new();
    if let Some(prev_geom) = prev.value.as_geometry() {
        let candidates: Vec<String> = registry
            .intersecting(&prev_geom.rect())
            .map(|h| h.name.clone())
            .collect();
        for name in candidates {
            let Some(hook) = registry.get(&name).cloned() else { continue };
            if hook.key != key || !matches_fence(&hook, prev_geom, prev) {
                continue;
            }
            if hook.fence.detects(Detect::Exit) {
                events.push(FenceEvent {
                    hook_name: hook.name.clone(),
                    detect: Detect::Exit,
                    key: key.to_string(),
                    id: prev.id.clone(),
                    object: assemble_object(&hook, prev),
                });
            }
        }
    }
    registry.clear_groups_for_object(key, &prev.id);
    sort_events(&mut events);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::Collection;
    use crate::hook::{Delivery, Fence, FenceKind, OutputMode};
    use crate::object::Value;

    fn within_hook(name: &str, key: &str) -> Hook {
        Hook {
            name: name.to_string(),
            key: key.to_string(),
            delivery: Delivery::Channel("ch".to_string()),
            fence: Fence {
                kind: FenceKind::Within,
                geometry: Geometry::Rect {
                    min_lat: 0.0,
                    min_lon: 0.0,
                    max_lat: 10.0,
                    max_lon: 10.0,
                },
                roam: None,
                detect: vec![Detect::Enter, Detect::Exit, Detect::Inside, Detect::Outside],
                commands: None,
                glob: None,
                wheres: vec![],
                whereins: vec![],
            },
            meta: vec![],
            output: OutputMode::Object,
            nofields: false,
            expires_at: 0,
            cursor: 0,
        }
    }

    #[test]
    fn fires_enter_when_moving_inside() {
        let mut reg = HookRegistry::new();
        reg.insert(within_hook("inzone", "fleet"));
        let collection = Collection::new();
        let prev = Geometry::point(50.0, 50.0);
        let obj = Object::new("t1", Value::Geom(Geometry::point(5.0, 5.0)));
        let events = evaluate_move(&mut reg, &collection, "fleet", &obj, Some(&prev), false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detect, Detect::Enter);
    }

    #[test]
    fn fires_exit_when_leaving() {
        let mut reg = HookRegistry::new();
        reg.insert(within_hook("inzone", "fleet"));
        let collection = Collection::new();
        let prev = Geometry::point(5.0, 5.0);
        let obj = Object::new("t1", Value::Geom(Geometry::point(50.0, 50.0)));
        let events = evaluate_move(&mut reg, &collection, "fleet", &obj, Some(&prev), false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detect, Detect::Exit);
    }

    #[test]
    fn fset_rewrites_enter_to_inside_and_skips_cross() {
        let mut reg = HookRegistry::new();
        let mut hook = within_hook("inzone", "fleet");
        hook.fence.detect.push(Detect::Cross);
        reg.insert(hook);
        let collection = Collection::new();
        let prev = Geometry::point(50.0, 50.0);
        let obj = Object::new("t1", Value::Geom(Geometry::point(5.0, 5.0)));
        let events = evaluate_move(&mut reg, &collection, "fleet", &obj, Some(&prev), true);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detect, Detect::Inside);
    }

    #[test]
    fn collapses_enter_to_inside_when_enter_not_in_detect_set() {
        let mut reg = HookRegistry::new();
        let mut hook = within_hook("inzone", "fleet");
        hook.fence.detect = vec![Detect::Inside, Detect::Outside];
        reg.insert(hook);
        let collection = Collection::new();
        let prev = Geometry::point(50.0, 50.0);
        let obj = Object::new("t1", Value::Geom(Geometry::point(5.0, 5.0)));
        let events = evaluate_move(&mut reg, &collection, "fleet", &obj, Some(&prev), false);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detect, Detect::Inside);
    }

    #[test]
    fn enter_also_emits_inside_when_hook_detects_both() {
        let mut reg = HookRegistry::new();
        reg.insert(within_hook("inzone", "fleet"));
        let collection = Collection::new();
        let prev = Geometry::point(50.0, 50.0);
        let obj = Object::new("t1", Value::Geom(Geometry::point(5.0, 5.0)));
        let events = evaluate_move(&mut reg, &collection, "fleet", &obj, Some(&prev), false);
        let detects: Vec<Detect> = events.iter().map(|e| e.detect).collect();
        assert!(detects.contains(&Detect::Enter));
        assert!(detects.contains(&Detect::Inside));
    }

    #[test]
    fn where_clause_suppresses_fence_match() {
        let mut reg = HookRegistry::new();
        let mut hook = within_hook("inzone", "fleet");
        hook.fence.wheres.push(crate::hook::WhereClause { field: "speed".into(), min: 10.0, max: 20.0 });
        reg.insert(hook);
        let collection = Collection::new();
        let prev = Geometry::point(50.0, 50.0);
        let obj = Object::new("t1", Value::Geom(Geometry::point(5.0, 5.0)));
        let events = evaluate_move(&mut reg, &collection, "fleet", &obj, Some(&prev), false);
        assert!(events.is_empty());
    }

    #[test]
    fn roam_fence_reports_faraway_when_neighbor_drops_out_of_radius() {
        let mut reg = HookRegistry::new();
        let mut hook = within_hook("roamer", "fleet");
        hook.fence.roam = Some(RoamSpec { radius_meters: 2000.0, id_pattern: None, nodwell: true });
        reg.insert(hook);

        let mut collection = Collection::new();
        collection.set(Object::new("neighbor", Value::Geom(Geometry::point(0.01, 0.0))));

        let prev = Geometry::point(0.0, 0.0);
        let obj = Object::new("mover", Value::Geom(Geometry::point(1.0, 1.0)));
        let events = evaluate_move(&mut reg, &collection, "fleet", &obj, Some(&prev), false);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detect, Detect::Roam);
        assert_eq!(events[0].object["nearby"]["status"], "faraway");
        assert_eq!(events[0].object["nearby"]["id"], "neighbor");
    }

    #[test]
    fn delete_fires_exit_and_clears_group() {
        let mut reg = HookRegistry::new();
        reg.insert(within_hook("inzone", "fleet"));
        let prev = Object::new("t1", Value::Geom(Geometry::point(5.0, 5.0)));
        reg.renew_group("inzone", "fleet", "t1", true);
        let events = evaluate_delete(&mut reg, "fleet", &prev);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].detect, Detect::Exit);
        assert!(reg.group_for("inzone", "fleet", "t1").is_none());
    }
}
