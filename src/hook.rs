//! Hook (fence subscription) model — spec §3 "Hook".
//!
//! Grounded on the teacher's `geofence.rs` layered-fence model, generalized
//! from a fixed altitude-layered circle to the spec's full fence-command
//! vocabulary (within/intersects/nearby over any geometry).

use crate::geometry::Geometry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Detect {
    Inside,
    Outside,
    Enter,
    Exit,
    Cross,
    Roam,
}

impl Detect {
    /// Stable dispatch order: exit < outside < enter < inside (spec §4.3.5);
    /// cross/roam sort after the rest since the spec only orders the four
    /// named ones explicitly.
    pub fn sort_rank(self) -> u8 {
        match self {
            Detect::Exit => 0,
            Detect::Outside => 1,
            Detect::Enter => 2,
            Detect::Inside => 3,
            Detect::Cross => 4,
            Detect::Roam => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Detect::Inside => "inside",
            Detect::Outside => "outside",
            Detect::Enter => "enter",
            Detect::Exit => "exit",
            Detect::Cross => "cross",
            Detect::Roam => "roam",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    Object,
    Point,
    Hash(u8),
    Bounds,
    Ids,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    Within,
    Intersects,
    Nearby,
}

/// A WHERE clause: `field` within `[min, max]`, half-open per the open/closed
/// flags.
#[derive(Debug, Clone)]
pub struct WhereClause {
    pub field: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub struct WhereInClause {
    pub field: String,
    pub values: Vec<f64>,
}

/// Roaming fence parameters (spec §4.3.1).
#[derive(Debug, Clone)]
pub struct RoamSpec {
    pub radius_meters: f64,
    pub id_pattern: Option<String>,
    pub nodwell: bool,
}

/// The fence predicate a hook subscribes to. `Roam` hooks ignore `kind` and
/// operate purely off `roam`.
#[derive(Debug, Clone)]
pub struct Fence {
    pub kind: FenceKind,
    pub geometry: Geometry,
    pub roam: Option<RoamSpec>,
    pub detect: Vec<Detect>,
    pub commands: Option<Vec<String>>,
    pub glob: Option<String>,
    pub wheres: Vec<WhereClause>,
    pub whereins: Vec<WhereInClause>,
}

impl Fence {
    pub fn detects(&self, d: Detect) -> bool {
        self.detect.contains(&d)
    }
}

/// Delivery target: webhook endpoints in round-robin order, or a pub/sub
/// channel.
#[derive(Debug, Clone)]
pub enum Delivery {
    Webhooks(Vec<String>),
    Channel(String),
}

#[derive(Debug, Clone)]
pub struct Hook {
    pub name: String,
    pub key: String,
    pub delivery: Delivery,
    pub fence: Fence,
    pub meta: Vec<(String, String)>,
    pub output: OutputMode,
    pub nofields: bool,
    pub expires_at: i64,
    /// Delivery cursor into the outbox: highest seq this hook's worker has
    /// confirmed delivered.
    pub cursor: u64,
}

impl Hook {
    pub fn is_outside_aware(&self) -> bool {
        self.fence.detects(Detect::Outside)
    }

    pub fn is_cross_aware(&self) -> bool {
        self.fence.detects(Detect::Cross)
    }

    pub fn is_channel(&self) -> bool {
        matches!(self.delivery, Delivery::Channel(_))
    }

    pub fn has_expiration(&self) -> bool {
        self.expires_at != 0
    }
}
