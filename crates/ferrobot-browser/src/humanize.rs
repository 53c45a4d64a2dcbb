//! Human-like input timing: Bézier cursor paths and jittered delays.

use std::time::Duration;

use rand::Rng;

/// A single cursor waypoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// A mouse path step: where to move and how long to dwell there.
#[derive(Clone, Copy, Debug)]
pub struct PathStep {
    pub point: Point,
    pub dwell: Duration,
}

/// Cubic Bézier evaluated at `t` in [0, 1].
fn cubic_bezier(p0: Point, p1: Point, p2: Point, p3: Point, t: f64) -> Point {
    let u = 1.0 - t;
    let b0 = u * u * u;
    let b1 = 3.0 * u * u * t;
    let b2 = 3.0 * u * t * t;
    let b3 = t * t * t;
    Point {
        x: b0 * p0.x + b1 * p1.x + b2 * p2.x + b3 * p3.x,
        y: b0 * p0.y + b1 * p1.y + b2 * p2.y + b3 * p3.y,
    }
}

/// Build a cursor path from `start` to `end` along a cubic Bézier curve
/// with two random control points, 8–18 steps, 5–25 ms per step.
pub fn mouse_path(start: Point, end: Point) -> Vec<PathStep> {
    let mut rng = rand::thread_rng();

    let spread_x = (end.x - start.x).abs().max(100.0);
    let spread_y = (end.y - start.y).abs().max(100.0);

    let c1 = Point {
        x: start.x + rng.gen_range(-0.5..0.5) * spread_x,
        y: start.y + rng.gen_range(-0.5..0.5) * spread_y,
    };
    let c2 = Point {
        x: end.x + rng.gen_range(-0.5..0.5) * spread_x,
        y: end.y + rng.gen_range(-0.5..0.5) * spread_y,
    };

    let steps = rng.gen_range(8..=18);
    (1..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            PathStep {
                point: cubic_bezier(start, c1, c2, end, t),
                dwell: Duration::from_millis(rng.gen_range(5..=25)),
            }
        })
        .collect()
}

/// Random pause between actions (50–200 ms).
pub fn action_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(50..=200))
}

/// Random per-character typing delay (50–150 ms).
pub fn typing_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(50..=150))
}
