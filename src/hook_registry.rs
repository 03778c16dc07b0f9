//! Hook registry: name index plus the auxiliary indexes spec §3 requires,
//! and the group table (spec §3 "Group").
//!
//! Grounded on `geofence_repo.rs`'s hook-to-object indexing approach,
//! generalized from a single altitude-layered fence shape to the tuple-keyed
//! "no raw pointers" model the spec's Design Notes (§9) call for.

use crate::geometry::Rect;
use crate::hook::Hook;
use rstar::{AABB, RTree, RTreeObject};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct HookEnvelope {
    name: String,
    rect: Rect,
}

impl RTreeObject for HookEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.rect.min_lon, self.rect.min_lat],
            [self.rect.max_lon, self.rect.max_lat],
        )
    }
}

/// Opaque dwell-episode identity. Renewed on `enter` or `cross`.
pub type GroupId = uuid::Uuid;

#[derive(Default)]
pub struct HookRegistry {
    by_name: BTreeMap<String, Hook>,
    tree: RTree<HookEnvelope>,
    outside_aware: BTreeSet<String>,
    cross_tree: RTree<HookEnvelope>,
    expires: BTreeSet<(i64, String)>,
    /// (hookName, collectionKey, objectId) -> groupId
    groups_by_hook: BTreeMap<(String, String, String), GroupId>,
    /// (collectionKey, objectId, hookName) -> groupId, mirrors the above so
    /// either side of the relationship can be disconnected in one pass.
    groups_by_object: BTreeMap<(String, String, String), GroupId>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Hook> {
        self.by_name.get(name)
    }

    pub fn insert(&mut self, hook: Hook) {
        self.remove(&hook.name);
        let rect = hook.fence.geometry.rect();
        self.tree.insert(HookEnvelope {
            name: hook.name.clone(),
            rect,
        });
        if hook.is_outside_aware() {
            self.outside_aware.insert(hook.name.clone());
        }
        if hook.is_cross_aware() {
            self.cross_tree.insert(HookEnvelope {
                name: hook.name.clone(),
                rect,
            });
        }
        if hook.has_expiration() {
            self.expires.insert((hook.expires_at, hook.name.clone()));
        }
        self.by_name.insert(hook.name.clone(), hook);
    }

    /// Remove a hook and its groups; returns the removed hook if present.
    pub fn remove(&mut self, name: &str) -> Option<Hook> {
        let hook = self.by_name.remove(name)?;
        let rect = hook.fence.geometry.rect();
        self.tree.remove(&HookEnvelope {
            name: name.to_string(),
            rect,
        });
        self.outside_aware.remove(name);
        self.cross_tree.remove(&HookEnvelope {
            name: name.to_string(),
            rect,
        });
        if hook.has_expiration() {
            self.expires.remove(&(hook.expires_at, name.to_string()));
        }
        self.clear_groups_for_hook(name);
        Some(hook)
    }

    /// Names matching a glob pattern, in name order.
    pub fn matching(&self, pattern: &str) -> Vec<String> {
        let re = crate::command::glob_to_regex(pattern);
        self.by_name
            .keys()
            .filter(|n| re.is_match(n))
            .cloned()
            .collect()
    }

    pub fn outside_aware_for_key<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Hook> + 'a {
        self.outside_aware
            .iter()
            .filter_map(|n| self.by_name.get(n))
            .filter(move |h| h.key == key)
    }

    pub fn cross_aware_intersecting(&self, rect: &Rect) -> impl Iterator<Item = &Hook> + '_ {
        let envelope = AABB::from_corners([rect.min_lon, rect.min_lat], [rect.max_lon, rect.max_lat]);
        self.cross_tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|e| self.by_name.get(&e.name))
    }

    pub fn intersecting(&self, rect: &Rect) -> impl Iterator<Item = &Hook> + '_ {
        let envelope = AABB::from_corners([rect.min_lon, rect.min_lat], [rect.max_lon, rect.max_lat]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|e| self.by_name.get(&e.name))
    }

    pub fn scan_expires(&self, mut iter: impl FnMut(&str, i64) -> bool) {
        for (expires_at, name) in &self.expires {
            if !iter(name, *expires_at) {
                break;
            }
        }
    }

    // --- Groups ---

    pub fn group_for(&self, hook: &str, key: &str, id: &str) -> Option<GroupId> {
        self.groups_by_hook
            .get(&(hook.to_string(), key.to_string(), id.to_string()))
            .copied()
    }

    /// `enter`: always creates a fresh group. `cross`: deletes any existing
    /// group then creates a fresh one. Otherwise reuse-or-create.
    pub fn renew_group(&mut self, hook: &str, key: &str, id: &str, force_new: bool) -> GroupId {
        let hk = (hook.to_string(), key.to_string(), id.to_string());
        let ok = (key.to_string(), id.to_string(), hook.to_string());
        if force_new {
            self.groups_by_hook.remove(&hk);
            self.groups_by_object.remove(&ok);
        }
        if let Some(existing) = self.groups_by_hook.get(&hk) {
            return *existing;
        }
        let id_val = uuid::Uuid::new_v4();
        self.groups_by_hook.insert(hk, id_val);
        self.groups_by_object.insert(ok, id_val);
        id_val
    }

    /// Clear every group referencing `(key, id)` — called on object delete.
    pub fn clear_groups_for_object(&mut self, key: &str, id: &str) {
        let prefix = (key.to_string(), id.to_string());
        let to_remove: Vec<_> = self
            .groups_by_object
            .range((prefix.0.clone(), prefix.1.clone(), String::new())..)
            .take_while(|((k, i, _), _)| *k == prefix.0 && *i == prefix.1)
            .map(|(tuple, _)| tuple.clone())
            .collect();
        for (k, i, h) in to_remove {
            self.groups_by_object.remove(&(k.clone(), i.clone(), h.clone()));
            self.groups_by_hook.remove(&(h, k, i));
        }
    }

    fn clear_groups_for_hook(&mut self, hook: &str) {
        let to_remove: Vec<_> = self
            .groups_by_hook
            .range((hook.to_string(), String::new(), String::new())..)
            .take_while(|((h, _, _), _)| h == hook)
            .map(|(tuple, _)| tuple.clone())
            .collect();
        for (h, k, i) in to_remove {
            self.groups_by_hook.remove(&(h.clone(), k.clone(), i.clone()));
            self.groups_by_object.remove(&(k, i, h));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::hook::{Delivery, Detect, Fence, FenceKind, OutputMode};

    fn sample_hook(name: &str, key: &str) -> Hook {
        Hook {
            name: name.to_string(),
            key: key.to_string(),
            delivery: Delivery::Channel("ch".to_string()),
            fence: Fence {
                kind: FenceKind::Nearby,
                geometry: Geometry::point(0.0, 0.0),
                roam: None,
                detect: vec![Detect::Enter, Detect::Exit],
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
    fn group_renewed_on_enter_and_cleared_on_cross() {
        let mut reg = HookRegistry::new();
        reg.insert(sample_hook("warn", "fleet"));
        let g1 = reg.renew_group("warn", "fleet", "t1", true);
        let g2 = reg.group_for("warn", "fleet", "t1").unwrap();
        assert_eq!(g1, g2);
        let g3 = reg.renew_group("warn", "fleet", "t1", true);
        assert_ne!(g1, g3);
    }

    #[test]
    fn removing_hook_clears_its_groups() {
        let mut reg = HookRegistry::new();
        reg.insert(sample_hook("warn", "fleet"));
        reg.renew_group("warn", "fleet", "t1", true);
        reg.remove("warn");
        assert!(reg.group_for("warn", "fleet", "t1").is_none());
    }
}
