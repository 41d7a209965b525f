//! Triangle visibility against the clip volume and backface culling.
//!
//! Positions are homogeneous clip coordinates. The visible square is
//! `-w <= x <= w`, `-w <= y <= w`; depth is not tested.

use crate::gbi::GeometryMode;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Outcode: u8 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const BOTTOM = 1 << 2;
        const TOP = 1 << 3;
        const BEHIND = 1 << 4;
    }
}

pub fn outcode(p: &[f32; 4]) -> Outcode {
    let [x, y, _, w] = *p;
    let mut code = Outcode::empty();
    if x < -w {
        code |= Outcode::LEFT;
    }
    if x > w {
        code |= Outcode::RIGHT;
    }
    if y < -w {
        code |= Outcode::BOTTOM;
    }
    if y > w {
        code |= Outcode::TOP;
    }
    if w <= 0.0 {
        code |= Outcode::BEHIND;
    }
    code
}

/// All of `points` lie outside one clip plane.
pub fn trivially_rejected(points: &[[f32; 4]]) -> bool {
    let mut shared = Outcode::all();
    for p in points {
        shared &= outcode(p);
    }
    !shared.is_empty()
}

fn ndc(p: &[f32; 4]) -> [f32; 2] {
    [p[0] / p[3], p[1] / p[3]]
}

/// Liang-Barsky: does the segment `a -> b` touch the square `[-1, 1]^2`?
fn segment_hits_square(a: [f32; 2], b: [f32; 2]) -> bool {
    let d = [b[0] - a[0], b[1] - a[1]];
    let mut t0 = 0.0f32;
    let mut t1 = 1.0f32;
    for (p, q) in [
        (-d[0], a[0] + 1.0),
        (d[0], 1.0 - a[0]),
        (-d[1], a[1] + 1.0),
        (d[1], 1.0 - a[1]),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return false;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            t0 = t0.max(r);
        } else {
            t1 = t1.min(r);
        }
        if t0 > t1 {
            return false;
        }
    }
    true
}

/// Twice the signed area in NDC, positive for counter-clockwise winding as
/// seen on screen.
fn signed_area(a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> f32 {
    (b[0] - a[0]) * (c[1] - a[1]) - (c[0] - a[0]) * (b[1] - a[1])
}

fn contains_origin(a: [f32; 2], b: [f32; 2], c: [f32; 2]) -> bool {
    let o = [0.0, 0.0];
    let d0 = signed_area(a, b, o);
    let d1 = signed_area(b, c, o);
    let d2 = signed_area(c, a, o);
    let neg = d0 < 0.0 || d1 < 0.0 || d2 < 0.0;
    let pos = d0 > 0.0 || d1 > 0.0 || d2 > 0.0;
    !(neg && pos)
}

/// Whether any part of the triangle can land in the viewport.
///
/// Triangles with a vertex behind the eye are kept unless every vertex is
/// outside the same plane; projecting them would flip coordinates.
pub fn triangle_visible(v: [&[f32; 4]; 3]) -> bool {
    let codes = v.map(outcode);
    if !(codes[0] & codes[1] & codes[2]).is_empty() {
        return false;
    }
    if codes.iter().any(|c| c.contains(Outcode::BEHIND)) {
        return true;
    }
    if codes.iter().any(|c| c.is_empty()) {
        return true;
    }
    let [a, b, c] = v.map(ndc);
    if segment_hits_square(a, b) || segment_hits_square(b, c) || segment_hits_square(c, a) {
        return true;
    }
    // The triangle can still cover the whole viewport.
    contains_origin(a, b, c)
}

/// Backface test per the geometry mode. Only meaningful when every vertex
/// is in front of the eye; otherwise the triangle is kept.
pub fn culled(v: [&[f32; 4]; 3], mode: GeometryMode) -> bool {
    let cull = mode & (GeometryMode::CULL_FRONT | GeometryMode::CULL_BACK);
    if cull.is_empty() || v.iter().any(|p| p[3] <= 0.0) {
        return false;
    }
    let [a, b, c] = v.map(ndc);
    let area = signed_area(a, b, c);
    if area == 0.0 {
        return true;
    }
    if area > 0.0 {
        cull.contains(GeometryMode::CULL_FRONT)
    } else {
        cull.contains(GeometryMode::CULL_BACK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(x: f32, y: f32) -> [f32; 4] {
        [x, y, 0.0, 1.0]
    }

    fn visible(a: [f32; 4], b: [f32; 4], c: [f32; 4]) -> bool {
        triangle_visible([&a, &b, &c])
    }

    #[test]
    fn any_vertex_inside_is_visible() {
        assert!(visible(p(0.0, 0.0), p(5.0, 0.0), p(0.0, 5.0)));
        // On the boundary counts as inside.
        assert!(visible(p(1.0, 1.0), p(3.0, 1.0), p(3.0, 3.0)));
    }

    #[test]
    fn shared_outcode_is_rejected() {
        assert!(!visible(p(2.0, 0.0), p(3.0, 0.5), p(2.5, -0.5)));
        assert!(!visible(p(-2.0, 5.0), p(2.0, 5.0), p(0.0, 3.0)));
    }

    #[test]
    fn edge_crossing_the_viewport_is_visible() {
        // All vertices outside on different sides, one edge crosses.
        assert!(visible(p(-2.0, 0.0), p(2.0, 0.0), p(0.0, 3.0)));
    }

    #[test]
    fn triangle_covering_the_viewport_is_visible() {
        assert!(visible(p(-10.0, -10.0), p(10.0, -10.0), p(0.0, 10.0)));
    }

    #[test]
    fn triangle_passing_a_corner_is_not() {
        // No shared outcode, but the hypotenuse misses the top-right corner.
        assert!(!visible(p(0.5, 3.0), p(3.0, 0.5), p(3.0, 3.0)));
    }

    #[test]
    fn behind_the_eye_is_kept_unless_rejected() {
        let behind = [0.0, 0.0, 0.0, -1.0];
        assert!(visible(behind, p(5.0, 0.0), p(0.0, -5.0)));
        // Everything left of the volume, including the w < 0 vertex.
        let behind_left = [-2.0, 0.0, 0.0, -1.0];
        assert!(!visible(behind_left, p(-3.0, 0.0), p(-4.0, 1.0)));
    }

    #[test]
    fn culling_follows_winding() {
        let (a, b, c) = (p(0.0, 0.0), p(0.5, 0.0), p(0.0, 0.5));
        let ccw = [&a, &b, &c];
        let cw = [&a, &c, &b];
        assert!(!culled(ccw, GeometryMode::CULL_BACK));
        assert!(culled(cw, GeometryMode::CULL_BACK));
        assert!(culled(ccw, GeometryMode::CULL_FRONT));
        assert!(!culled(cw, GeometryMode::empty()));
        let degenerate = [&a, &a, &b];
        assert!(culled(degenerate, GeometryMode::CULL_BACK));
    }
}
