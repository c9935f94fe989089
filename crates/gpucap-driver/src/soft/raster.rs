//! Triangle coverage for the software backend.

use gpucap_ipc::Triangle;

/// Sub-pixel position of sample `index` out of `count` samples.
pub(crate) fn sample_offset(index: u32, count: u32) -> (f32, f32) {
    if count <= 1 {
        return (0.5, 0.5);
    }
    let n = count as f32;
    let x = (index as f32 + 0.5) / n;
    let y = (((index * 3) % count) as f32 + 0.5) / n;
    (x, y)
}

fn edge(a: [f32; 2], b: [f32; 2], p: (f32, f32)) -> f32 {
    (b[0] - a[0]) * (p.1 - a[1]) - (b[1] - a[1]) * (p.0 - a[0])
}

/// Returns true when point `p` lies inside or on the triangle, whatever its
/// winding. Degenerate triangles cover nothing.
pub(crate) fn covers(tri: &Triangle, p: (f32, f32)) -> bool {
    let [v0, v1, v2] = tri.vertices;
    let area = edge(v0, v1, (v2[0], v2[1]));
    if area == 0.0 {
        return false;
    }
    let w0 = edge(v1, v2, p);
    let w1 = edge(v2, v0, p);
    let w2 = edge(v0, v1, p);
    if area > 0.0 {
        w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0
    } else {
        w0 <= 0.0 && w1 <= 0.0 && w2 <= 0.0
    }
}

/// Pixel rectangle `[x0, x1) x [y0, y1)` that can contain covered samples,
/// clipped to a `width` x `height` target.
pub(crate) fn bounds(tri: &Triangle, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let xs = tri.vertices.map(|v| v[0]);
    let ys = tri.vertices.map(|v| v[1]);
    let min = |v: [f32; 3]| v.iter().copied().fold(f32::INFINITY, f32::min);
    let max = |v: [f32; 3]| v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let clip = |v: f32, hi: u32| (v.max(0.0) as u32).min(hi);
    (
        clip(min(xs).floor(), width),
        clip(max(xs).ceil(), width),
        clip(min(ys).floor(), height),
        clip(max(ys).ceil(), height),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(vertices: [[f32; 2]; 3]) -> Triangle {
        Triangle {
            vertices,
            depth: 0.0,
            color: [1.0; 4],
        }
    }

    #[test]
    fn test_both_windings_cover() {
        let cw = tri([[0.0, 0.0], [4.0, 0.0], [0.0, 4.0]]);
        let ccw = tri([[0.0, 0.0], [0.0, 4.0], [4.0, 0.0]]);
        assert!(covers(&cw, (0.5, 0.5)));
        assert!(covers(&ccw, (0.5, 0.5)));
        assert!(!covers(&cw, (3.5, 3.5)));
    }

    #[test]
    fn test_degenerate_covers_nothing() {
        let line = tri([[0.0, 0.0], [2.0, 2.0], [4.0, 4.0]]);
        assert!(!covers(&line, (1.0, 1.0)));
    }

    #[test]
    fn test_bounds_are_clipped() {
        let t = tri([[-3.0, 1.2], [10.0, 1.0], [2.0, 30.0]]);
        assert_eq!(bounds(&t, 8, 8), (0, 8, 1, 8));
    }

    #[test]
    fn test_sample_offsets_inside_pixel() {
        for count in [1, 2, 4, 8] {
            for i in 0..count {
                let (x, y) = sample_offset(i, count);
                assert!(x > 0.0 && x < 1.0 && y > 0.0 && y < 1.0);
            }
        }
    }
}
