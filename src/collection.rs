//! Per-collection id map, spatial index, and TTL set (spec §4.1).
//!
//! Every operation here is synchronous and expects the caller to already
//! hold the server's write (for mutation) or read (for scans) lock — the
//! store itself does no locking, matching the "state: none beyond the three
//! indexes" note in the spec.

use crate::error::{CommandError, CommandResult};
use crate::geometry::{Geometry, Rect};
use crate::object::{Object, Value};
use rstar::{AABB, RTree, RTreeObject};
use std::collections::{BTreeMap, BTreeSet};

/// A deadline polled between scan iterations; exceeding it raises a timeout
/// (spec §4.1, §5 "Cancellation").
#[derive(Debug, Clone, Copy)]
pub struct Deadline(pub Option<std::time::Instant>);

impl Deadline {
    pub const NONE: Deadline = Deadline(None);

    pub fn expired(&self) -> bool {
        matches!(self.0, Some(t) if std::time::Instant::now() >= t)
    }

    pub fn check(&self) -> CommandResult<()> {
        if self.expired() {
            Err(CommandError::Timeout)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
struct IndexedEnvelope {
    id: String,
    rect: Rect,
}

impl RTreeObject for IndexedEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.rect.min_lon, self.rect.min_lat],
            [self.rect.max_lon, self.rect.max_lat],
        )
    }
}

/// Named container of objects: id map, spatial index, TTL set.
pub struct Collection {
    ids: BTreeMap<String, Object>,
    tree: RTree<IndexedEnvelope>,
    expires: BTreeSet<(i64, String)>,
}

impl Default for Collection {
    fn default() -> Self {
        Self::new()
    }
}

impl Collection {
    pub fn new() -> Self {
        Collection {
            ids: BTreeMap::new(),
            tree: RTree::new(),
            expires: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn get(&self, id: &str) -> Option<&Object> {
        self.ids.get(id)
    }

    /// Insert or replace an object, returning the previous value if any.
    /// Maintains the id map / R-tree / expires set invariant together.
    pub fn set(&mut self, object: Object) -> Option<Object> {
        let old = self.remove_indexes_only(&object.id);
        if let Some(geom) = object.value.as_geometry() {
            self.tree.insert(IndexedEnvelope {
                id: object.id.clone(),
                rect: geom.rect(),
            });
        }
        if object.has_expiration() {
            self.expires.insert((object.expires_at, object.id.clone()));
        }
        self.ids.insert(object.id.clone(), object);
        old
    }

    /// Remove an object entirely (id map + spatial + expires).
    pub fn delete(&mut self, id: &str) -> Option<Object> {
        self.remove_indexes_only(id)
    }

    fn remove_indexes_only(&mut self, id: &str) -> Option<Object> {
        let old = self.ids.remove(id)?;
        if let Some(geom) = old.value.as_geometry() {
            let rect = geom.rect();
            self.tree.remove(&IndexedEnvelope {
                id: id.to_string(),
                rect,
            });
        }
        if old.has_expiration() {
            self.expires.remove(&(old.expires_at, id.to_string()));
        }
        Some(old)
    }

    /// Axis-aligned rectangle enclosing every indexed geometry; zero rect
    /// when the collection holds no geometries.
    pub fn bounds(&self) -> Rect {
        self.tree
            .iter()
            .map(|e| e.rect)
            .reduce(|a, b| a.union(&b))
            .unwrap_or(Rect::ZERO)
    }

    /// Ascending id order, honoring a start cursor (exclusive on `reverse`
    /// continuation semantics handled by the caller via `cursor`).
    pub fn scan(
        &self,
        reverse: bool,
        cursor: usize,
        deadline: Deadline,
        mut iter: impl FnMut(&Object) -> bool,
    ) -> CommandResult<()> {
        let mut skipped = 0usize;
        let values: Box<dyn Iterator<Item = &Object>> = if reverse {
            Box::new(self.ids.values().rev())
        } else {
            Box::new(self.ids.values())
        };
        for obj in values {
            deadline.check()?;
            if skipped < cursor {
                skipped += 1;
                continue;
            }
            if !iter(obj) {
                break;
            }
        }
        Ok(())
    }

    /// Half-open `[lo, hi)` id range scan, used for glob prefix scans so the
    /// caller doesn't have to walk the whole key space.
    pub fn scan_range(
        &self,
        lo: &str,
        hi: &str,
        reverse: bool,
        deadline: Deadline,
        mut iter: impl FnMut(&Object) -> bool,
    ) -> CommandResult<()> {
        let range: Box<dyn Iterator<Item = &Object>> = if reverse {
            Box::new(self.ids.range(lo.to_string()..hi.to_string()).rev().map(|(_, o)| o))
        } else {
            Box::new(self.ids.range(lo.to_string()..hi.to_string()).map(|(_, o)| o))
        };
        for obj in range {
            deadline.check()?;
            if !iter(obj) {
                break;
            }
        }
        Ok(())
    }

    pub fn scan_greater_or_equal(
        &self,
        id: &str,
        mut iter: impl FnMut(&Object) -> bool,
    ) -> CommandResult<()> {
        for (_, obj) in self.ids.range(id.to_string()..) {
            if !iter(obj) {
                break;
            }
        }
        Ok(())
    }

    /// `sparse` (0..=8): recursive quadrant pruning, up to 4^sparse results.
    fn sparse_filter(&self, rect: &Rect, sparse: u8, candidates: Vec<&IndexedEnvelope>) -> Vec<String> {
        if sparse == 0 {
            return candidates.into_iter().map(|e| e.id.clone()).collect();
        }
        let mut out = Vec::new();
        let mut stack = vec![(*rect, candidates, sparse)];
        while let Some((r, items, depth)) = stack.pop() {
            if items.is_empty() {
                continue;
            }
            if depth == 0 {
                if let Some(first) = items.first() {
                    out.push(first.id.clone());
                }
                continue;
            }
            let mid_lat = (r.min_lat + r.max_lat) / 2.0;
            let mid_lon = (r.min_lon + r.max_lon) / 2.0;
            let quads = [
                Rect {
                    min_lat: r.min_lat,
                    min_lon: r.min_lon,
                    max_lat: mid_lat,
                    max_lon: mid_lon,
                },
                Rect {
                    min_lat: r.min_lat,
                    min_lon: mid_lon,
                    max_lat: mid_lat,
                    max_lon: r.max_lon,
                },
                Rect {
                    min_lat: mid_lat,
                    min_lon: r.min_lon,
                    max_lat: r.max_lat,
                    max_lon: mid_lon,
                },
                Rect {
                    min_lat: mid_lat,
                    min_lon: mid_lon,
                    max_lat: r.max_lat,
                    max_lon: r.max_lon,
                },
            ];
            for q in quads {
                let in_quad: Vec<&IndexedEnvelope> = items
                    .iter()
                    .filter(|e| q.intersects(&e.rect))
                    .copied()
                    .collect();
                if !in_quad.is_empty() {
                    stack.push((q, in_quad, depth - 1));
                }
            }
        }
        out
    }

    /// `INTERSECTS`: objects whose geometry intersects `geom`.
    pub fn intersects(
        &self,
        geom: &Geometry,
        sparse: u8,
        deadline: Deadline,
        mut iter: impl FnMut(&Object) -> bool,
    ) -> CommandResult<()> {
        let envelope = Self::aabb(&geom.rect());
        let candidates: Vec<&IndexedEnvelope> = self.tree.locate_in_envelope_intersecting(&envelope).collect();
        let ids = self.sparse_filter(&geom.rect(), sparse, candidates);
        for id in ids {
            deadline.check()?;
            if let Some(obj) = self.ids.get(&id)
                && let Some(g) = obj.value.as_geometry()
                && g.intersects(geom)
                && !iter(obj)
            {
                break;
            }
        }
        Ok(())
    }

    /// `WITHIN`: objects entirely inside `geom`.
    pub fn within(
        &self,
        geom: &Geometry,
        sparse: u8,
        deadline: Deadline,
        mut iter: impl FnMut(&Object) -> bool,
    ) -> CommandResult<()> {
        let envelope = Self::aabb(&geom.rect());
        let candidates: Vec<&IndexedEnvelope> = self.tree.locate_in_envelope_intersecting(&envelope).collect();
        let ids = self.sparse_filter(&geom.rect(), sparse, candidates);
        for id in ids {
            deadline.check()?;
            if let Some(obj) = self.ids.get(&id)
                && let Some(g) = obj.value.as_geometry()
                && g.within(geom)
                && !iter(obj)
            {
                break;
            }
        }
        Ok(())
    }

    /// Ascending-distance-from-origin iteration; `iter` returning false
    /// stops the scan early.
    pub fn nearby(
        &self,
        origin: &Geometry,
        deadline: Deadline,
        mut iter: impl FnMut(&Object, f64) -> bool,
    ) -> CommandResult<()> {
        let mut ordered: Vec<(f64, &IndexedEnvelope)> = self
            .tree
            .iter()
            .map(|e| (origin.distance_meters(&Geometry::point(e.rect.center().0, e.rect.center().1)), e))
            .collect();
        ordered.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then_with(|| a.1.id.cmp(&b.1.id)));
        for (dist, envelope) in ordered {
            deadline.check()?;
            if let Some(obj) = self.ids.get(&envelope.id)
                && !iter(obj, dist)
            {
                break;
            }
        }
        Ok(())
    }

    pub fn scan_expires(&self, mut iter: impl FnMut(&str, i64) -> bool) {
        for (expires_at, id) in &self.expires {
            if !iter(id, *expires_at) {
                break;
            }
        }
    }

    fn aabb(rect: &Rect) -> AABB<[f64; 2]> {
        AABB::from_corners([rect.min_lon, rect.min_lat], [rect.max_lon, rect.max_lat])
    }

    #[cfg(test)]
    pub(crate) fn ids_in_order(&self) -> Vec<String> {
        self.ids.keys().cloned().collect()
    }
}

pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point_object(id: &str, lat: f64, lon: f64) -> Object {
        Object::new(id, Value::Geom(Geometry::point(lat, lon)))
    }

    #[test]
    fn set_then_delete_returns_to_empty() {
        let mut col = Collection::new();
        col.set(point_object("t1", 33.5, -112.1));
        assert_eq!(col.count(), 1);
        col.delete("t1");
        assert_eq!(col.count(), 0);
        assert!(col.is_empty());
    }

    #[test]
    fn nearby_orders_ascending() {
        let mut col = Collection::new();
        col.set(point_object("far", 10.0, 10.0));
        col.set(point_object("near", 0.01, 0.01));
        let origin = Geometry::point(0.0, 0.0);
        let mut order = Vec::new();
        col.nearby(&origin, Deadline::NONE, |obj, _dist| {
            order.push(obj.id.clone());
            true
        })
        .unwrap();
        assert_eq!(order, vec!["near".to_string(), "far".to_string()]);
    }

    #[test]
    fn within_rect_filters_correctly() {
        let mut col = Collection::new();
        col.set(point_object("inside", 1.0, 1.0));
        col.set(point_object("outside", 50.0, 50.0));
        let bounds = Geometry::Rect {
            min_lat: 0.0,
            min_lon: 0.0,
            max_lat: 2.0,
            max_lon: 2.0,
        };
        let mut found = Vec::new();
        col.within(&bounds, 0, Deadline::NONE, |obj| {
            found.push(obj.id.clone());
            true
        })
        .unwrap();
        assert_eq!(found, vec!["inside".to_string()]);
    }
}
