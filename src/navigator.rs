//! Position sources feeding `Protocol`'s outbound `coord_x`/`coord_y`.
//!
//! Grounded on `original_source/include/navigator.hh`'s `NavigatorCommon`/
//! `NavigatorRandomWalk`/`NavigatorDirected`. CSV dataset playback is an
//! external collaborator per spec.md §1 (appears only as a `LocationSource`
//! trait here); this module ships the two self-contained sources
//! (random walk, waypoint following) the original defines inline.

use std::time::Instant;

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::topology::Coordinate;

/// Something that can report the current vehicle position on demand.
/// Implementations are free to be stateful (integrating a velocity) or
/// simply replay recorded data (the out-of-scope CSV/`LocationSource`
/// collaborator).
pub trait Navigator: Send {
    /// Current ground-plane position.
    fn location(&mut self) -> Coordinate;
}

/// External collaborator hook for dataset-driven position playback
/// (spec.md §1's `LocationSource`). Not implemented in this crate.
pub trait LocationSource: Send {
    /// Next recorded position, or `None` once the dataset is exhausted.
    fn next_location(&mut self) -> Option<Coordinate>;
}

/// A smoothly turning random walk: acceleration is a damped random
/// process, velocity integrates acceleration, position integrates
/// velocity. Matches `NavigatorRandomWalk`'s angular random-walk model.
pub struct RandomWalkNavigator {
    rng: rand::rngs::ThreadRng,
    dist: Normal<f64>,
    speed: f64,
    x: f64,
    y: f64,
    angle: f64,
    angular_vel: f64,
    last_tick: Instant,
}

const ANG_ACCEL_SCALE: f64 = 0.75;
const ANG_DAMPING: f64 = 0.5;

impl RandomWalkNavigator {
    /// Start at the origin, walking at `speed` units/second.
    #[must_use]
    pub fn new(speed: f64) -> Self {
        Self {
            rng: rand::rng(),
            dist: Normal::new(0.0, 1.0).expect("fixed normal distribution parameters are valid"),
            speed,
            x: 0.0,
            y: 0.0,
            angle: 0.0,
            angular_vel: 0.0,
            last_tick: Instant::now(),
        }
    }
}

impl Navigator for RandomWalkNavigator {
    fn location(&mut self) -> Coordinate {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let ang_accel = ANG_ACCEL_SCALE * self.dist.sample(&mut self.rng);
        self.angular_vel = self.angular_vel * (1.0 - ANG_DAMPING * dt) + ang_accel * dt;
        self.angle += self.angular_vel * dt;

        self.x += self.speed * self.angle.cos() * dt;
        self.y += self.speed * self.angle.sin() * dt;

        Coordinate::new(self.x, self.y)
    }
}

/// Follows a fixed polyline at constant speed, looping back to the first
/// point after the last. Matches `NavigatorDirected`.
pub struct WaypointNavigator {
    points: Vec<Coordinate>,
    speed: f64,
    x: f64,
    y: f64,
    cur: usize,
    next: usize,
    seg_len_remaining: f64,
    unit_x: f64,
    unit_y: f64,
    last_tick: Instant,
}

impl WaypointNavigator {
    /// Follow `points` in order, looping, at `speed` units/second.
    #[must_use]
    pub fn new(points: Vec<Coordinate>, speed: f64) -> Self {
        let (x, y) = points.first().map_or((0.0, 0.0), |p| (p.x, p.y));
        let mut nav = Self {
            points,
            speed,
            x,
            y,
            cur: 0,
            next: 1,
            seg_len_remaining: 0.0,
            unit_x: 0.0,
            unit_y: 0.0,
            last_tick: Instant::now(),
        };
        if nav.points.len() > 1 {
            nav.calc_segment();
        }
        nav
    }

    fn calc_segment(&mut self) {
        let a = self.points[self.cur];
        let b = self.points[self.next % self.points.len()];
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        self.seg_len_remaining = dx.hypot(dy);
        if self.seg_len_remaining > 0.0 {
            self.unit_x = dx / self.seg_len_remaining;
            self.unit_y = dy / self.seg_len_remaining;
        } else {
            self.unit_x = 0.0;
            self.unit_y = 0.0;
        }
    }
}

impl Navigator for WaypointNavigator {
    fn location(&mut self) -> Coordinate {
        if self.points.len() < 2 || self.speed <= 0.0 {
            return Coordinate::new(self.x, self.y);
        }

        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;

        let mut dist_walked = self.speed * dt;
        while dist_walked > 0.0 {
            if dist_walked < self.seg_len_remaining {
                self.x += self.unit_x * dist_walked;
                self.y += self.unit_y * dist_walked;
                self.seg_len_remaining -= dist_walked;
                break;
            }
            dist_walked -= self.seg_len_remaining;

            let arrived = self.points[self.next % self.points.len()];
            self.x = arrived.x;
            self.y = arrived.y;

            self.cur = self.next % self.points.len();
            self.next = (self.next + 1) % self.points.len();
            self.calc_segment();
        }

        Coordinate::new(self.x, self.y)
    }
}

/// A navigator that never moves, for tests that need a deterministic
/// position.
pub struct StationaryNavigator(pub Coordinate);

impl Navigator for StationaryNavigator {
    fn location(&mut self) -> Coordinate {
        self.0
    }
}
