use brazo_geom::Point;

/// The `count` evenly spaced points on the segment from `start` to `end`,
/// not including `start` but ending exactly at `end`.
pub fn interpolate(start: Point, end: Point, count: u32) -> impl Iterator<Item = Point> {
    (1..=count).map(move |i| {
        if i == count {
            end
        } else {
            start.lerp(end, i as f64 / count as f64)
        }
    })
}
