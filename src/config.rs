//! Process-wide configuration, loadable from JSON.
//!
//! Grounded on spec.md §6's configuration table. No CLI parses this in
//! the crate (out of scope per spec.md §1); the teacher's use of
//! `serde_json` for structured artifacts (e.g. `hdlc_framer.rs`'s test
//! fixtures) is the precedent for shipping `serde`/`serde_json` as the
//! ambient config-loading stack rather than a hand-rolled parser.

use serde::{Deserialize, Serialize};

/// Which `Navigator` implementation a vehicle process should run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NavigatorConfig {
    /// `RandomWalkNavigator`.
    RandomWalk,
    /// `WaypointNavigator` over a fixed polyline.
    Waypoints {
        /// Polyline vertices, `(x, y)` pairs.
        points: Vec<(f64, f64)>,
    },
    /// External CSV-dataset playback (spec.md §1's `LocationSource`,
    /// out of scope for this crate — carried here only so a full config
    /// document round-trips).
    Csv {
        /// Path to the CSV dataset.
        path: String,
    },
}

/// RSU grid shape and coverage radius, mirroring `Topology::new`'s
/// constructor arguments.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Grid column count.
    pub cols: i32,
    /// Grid row count.
    pub rows: i32,
    /// Per-RSU coverage radius.
    pub rsu_range: f64,
}

/// Full process configuration, as spec.md §6 enumerates it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Link-layer interface the raw `Engine` binds to.
    pub interface_name: String,
    /// This vehicle's `SystemId`.
    pub sys_id: u32,
    /// Whether this process also runs an `RSUEngine`.
    pub is_rsu: bool,
    /// RSU grid shape.
    pub topology: TopologyConfig,
    /// Position source and its speed, units/second.
    pub navigator: NavigatorConfig,
    /// Navigator speed, units/second (ignored by `Csv`).
    pub navigator_speed: f64,
    /// `SyncEngine` announce period, milliseconds.
    pub announce_period_ms: u64,
    /// `SyncEngine` leader (sync broadcast) period, milliseconds.
    pub leader_period_ms: u64,
    /// `RSUEngine` epoch modulus (`RENEW_MAC_INTERVAL`).
    pub mac_renew_interval: u32,
    /// `RSUEngine` key-broadcast period, milliseconds.
    pub key_period_ms: u64,
    /// Buffers per NIC pool.
    pub buffer_pool_size: usize,
}

impl Config {
    /// Parse a `Config` from a JSON document.
    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Serialize to a pretty-printed JSON document.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
