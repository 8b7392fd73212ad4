//! Polygonal region of interest and person counting

use crate::types::Rect;
use serde::{Deserialize, Serialize};

/// Convex polygon in frame pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionOfInterest {
    points: Vec<(f32, f32)>,
}

impl Default for RegionOfInterest {
    fn default() -> Self {
        Self::new(vec![
            (350.0, 50.0),
            (500.0, 80.0),
            (550.0, 250.0),
            (400.0, 300.0),
        ])
    }
}

impl RegionOfInterest {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[(f32, f32)] {
        &self.points
    }

    /// At least a triangle with non-zero area
    pub fn is_valid(&self) -> bool {
        self.points.len() >= 3 && signed_area(&self.points).abs() > f32::EPSILON
    }

    pub fn area(&self) -> f32 {
        signed_area(&self.points).abs()
    }

    /// Area of the intersection between `rect` and the region
    pub fn overlap_area(&self, rect: &Rect) -> f32 {
        if !self.is_valid() || rect.area() <= 0.0 {
            return 0.0;
        }

        let mut clipped = vec![
            (rect.x, rect.y),
            (rect.right(), rect.y),
            (rect.right(), rect.bottom()),
            (rect.x, rect.bottom()),
        ];

        // Sutherland-Hodgman against each edge of the (convex) region
        let orientation = signed_area(&self.points).signum();
        let n = self.points.len();
        for i in 0..n {
            if clipped.is_empty() {
                break;
            }
            let a = self.points[i];
            let b = self.points[(i + 1) % n];
            let inside = |p: (f32, f32)| cross(a, b, p) * orientation >= 0.0;

            let input = std::mem::take(&mut clipped);
            for j in 0..input.len() {
                let current = input[j];
                let previous = input[(j + input.len() - 1) % input.len()];
                match (inside(previous), inside(current)) {
                    (true, true) => clipped.push(current),
                    (true, false) => clipped.push(intersect(previous, current, a, b)),
                    (false, true) => {
                        clipped.push(intersect(previous, current, a, b));
                        clipped.push(current);
                    }
                    (false, false) => {}
                }
            }
        }

        if clipped.len() < 3 {
            0.0
        } else {
            signed_area(&clipped).abs()
        }
    }

    pub fn overlaps(&self, rect: &Rect) -> bool {
        self.overlap_area(rect) > 0.0
    }

    /// Number of boxes that overlap the region
    pub fn count_overlapping<'a, I>(&self, boxes: I) -> usize
    where
        I: IntoIterator<Item = &'a Rect>,
    {
        boxes.into_iter().filter(|rect| self.overlaps(rect)).count()
    }
}

fn signed_area(points: &[(f32, f32)]) -> f32 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let twice: f32 = (0..n)
        .map(|i| {
            let (x1, y1) = points[i];
            let (x2, y2) = points[(i + 1) % n];
            x1 * y2 - x2 * y1
        })
        .sum();
    twice / 2.0
}

fn cross(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> f32 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

/// Intersection of segment `p`-`q` with the infinite line through `a`-`b`
fn intersect(p: (f32, f32), q: (f32, f32), a: (f32, f32), b: (f32, f32)) -> (f32, f32) {
    let dp = cross(a, b, p);
    let dq = cross(a, b, q);
    let denom = dp - dq;
    if denom.abs() <= f32::EPSILON {
        return q;
    }
    let t = dp / denom;
    (p.0 + t * (q.0 - p.0), p.1 + t * (q.1 - p.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> RegionOfInterest {
        RegionOfInterest::new(vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)])
    }

    #[test]
    fn test_overlap_area_of_partial_box() {
        let region = square();
        let area = region.overlap_area(&Rect::new(5.0, 5.0, 10.0, 10.0));
        assert!((area - 25.0).abs() < 1e-3);
    }

    #[test]
    fn test_orientation_does_not_matter() {
        let mut points = square().points().to_vec();
        points.reverse();
        let region = RegionOfInterest::new(points);
        let area = region.overlap_area(&Rect::new(2.0, 2.0, 4.0, 4.0));
        assert!((area - 16.0).abs() < 1e-3);
    }

    #[test]
    fn test_default_region_counting() {
        let region = RegionOfInterest::default();
        assert!(region.is_valid());
        let boxes = [
            Rect::new(420.0, 120.0, 40.0, 80.0), // inside
            Rect::new(320.0, 30.0, 40.0, 40.0),  // touches the top-left corner area
            Rect::new(0.0, 0.0, 50.0, 50.0),     // far away
            Rect::new(600.0, 300.0, 20.0, 20.0), // far away
        ];
        assert_eq!(region.count_overlapping(boxes.iter()), 2);
    }

    #[test]
    fn test_degenerate_region_never_overlaps() {
        let region = RegionOfInterest::new(vec![(0.0, 0.0), (5.0, 5.0)]);
        assert!(!region.is_valid());
        assert!(!region.overlaps(&Rect::new(0.0, 0.0, 10.0, 10.0)));
    }
}
