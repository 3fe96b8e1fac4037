//! Boundary scanning: index map → closed outlines per palette layer.
//!
//! Every 2×2 pixel junction of a layer gets a 4-bit code describing which
//! of its pixels belong to the layer. A small automaton walks those codes
//! around each region boundary, erasing them as it goes, and emits the
//! visited pixel corners. Walks that run off the grid or never close are
//! dropped, as are inner (hole) boundaries and very short loops.
//!
//! Points are pixel-corner coordinates: pixel `(x, y)` covers
//! `[x, x + 1] × [y, y + 1]`. The emitted outline runs through the
//! midpoints ("internodes") of consecutive corners, so two regions that
//! share a boundary produce exactly the same internode coordinates.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::{IndexMap, Path, Point};

/// Initial walking direction per start code.
const DIRECTION_LOOKUP: [u8; 16] = [0, 0, 3, 0, 1, 0, 3, 0, 0, 3, 3, 1, 0, 3, 0, 0];

/// Start codes that begin an inner (hole) boundary.
const HOLE_LOOKUP: [bool; 16] = [
    false, false, false, false, false, false, false, true, false, false, false, true, false, true,
    true, false,
];

/// `(code, direction)` → `[code written back, new direction, dx, dy]`.
/// A negative direction marks an impossible move.
const COMBINED_LOOKUP: [[[i8; 4]; 4]; 16] = [
    [[-1, -1, -1, -1], [-1, -1, -1, -1], [-1, -1, -1, -1], [-1, -1, -1, -1]],
    [[0, 1, 0, -1], [-1, -1, -1, -1], [-1, -1, -1, -1], [0, 2, -1, 0]],
    [[-1, -1, -1, -1], [-1, -1, -1, -1], [0, 1, 0, -1], [0, 0, 1, 0]],
    [[0, 0, 1, 0], [-1, -1, -1, -1], [0, 2, -1, 0], [-1, -1, -1, -1]],
    [[-1, -1, -1, -1], [0, 0, 1, 0], [0, 3, 0, 1], [-1, -1, -1, -1]],
    [[13, 3, 0, 1], [13, 2, -1, 0], [7, 1, 0, -1], [7, 0, 1, 0]],
    [[-1, -1, -1, -1], [0, 1, 0, -1], [-1, -1, -1, -1], [0, 3, 0, 1]],
    [[0, 3, 0, 1], [0, 2, -1, 0], [-1, -1, -1, -1], [-1, -1, -1, -1]],
    [[0, 3, 0, 1], [0, 2, -1, 0], [-1, -1, -1, -1], [-1, -1, -1, -1]],
    [[-1, -1, -1, -1], [0, 1, 0, -1], [-1, -1, -1, -1], [0, 3, 0, 1]],
    [[11, 1, 0, -1], [14, 0, 1, 0], [14, 3, 0, 1], [11, 2, -1, 0]],
    [[-1, -1, -1, -1], [0, 0, 1, 0], [0, 3, 0, 1], [-1, -1, -1, -1]],
    [[0, 0, 1, 0], [-1, -1, -1, -1], [0, 2, -1, 0], [-1, -1, -1, -1]],
    [[-1, -1, -1, -1], [-1, -1, -1, -1], [0, 1, 0, -1], [0, 0, 1, 0]],
    [[0, 1, 0, -1], [-1, -1, -1, -1], [-1, -1, -1, -1], [0, 2, -1, 0]],
    [[-1, -1, -1, -1], [-1, -1, -1, -1], [-1, -1, -1, -1], [-1, -1, -1, -1]],
];

/// Heading from one internode to the next, on screen (y down). Curve
/// fitting reads it to find the corners of an outline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
    North,
    NorthEast,
    /// The two points coincide.
    Center,
}

impl Direction {
    /// Heading from `from` to `to`.
    #[must_use]
    pub fn between(from: Point, to: Point) -> Self {
        use std::cmp::Ordering::{Equal, Greater, Less};
        let horizontal = from.x.partial_cmp(&to.x).unwrap_or(Equal);
        let vertical = from.y.partial_cmp(&to.y).unwrap_or(Equal);
        match (horizontal, vertical) {
            (Less, Less) => Self::SouthEast,
            (Less, Greater) => Self::NorthEast,
            (Less, Equal) => Self::East,
            (Greater, Less) => Self::SouthWest,
            (Greater, Greater) => Self::NorthWest,
            (Greater, Equal) => Self::West,
            (Equal, Less) => Self::South,
            (Equal, Greater) => Self::North,
            (Equal, Equal) => Self::Center,
        }
    }
}

/// Edge-code grid for the cells holding `value`, same shape as the
/// padded index map.
fn edge_codes(index_map: &IndexMap, value: i32) -> Vec<u8> {
    let pw = index_map.padded_width();
    let ph = index_map.padded_height();
    let mut grid = vec![0_u8; pw * ph];
    for j in 1..ph - 1 {
        for i in 1..pw - 1 {
            if index_map.cell(i, j) != value {
                continue;
            }
            let same = |dx: isize, dy: isize| {
                let (Some(x), Some(y)) = (i.checked_add_signed(dx), j.checked_add_signed(dy)) else {
                    return 0;
                };
                u8::from(index_map.cell(x, y) == value)
            };
            let (n1, n2, n3) = (same(-1, -1), same(0, -1), same(1, -1));
            let (n4, n5) = (same(-1, 0), same(1, 0));
            let (n6, n7, n8) = (same(-1, 1), same(0, 1), same(1, 1));

            if j + 1 < ph && i + 1 < pw {
                grid[(j + 1) * pw + i + 1] = 1 + 2 * n5 + 4 * n8 + 8 * n7;
            }
            if n4 == 0 && j + 1 < ph {
                grid[(j + 1) * pw + i] = 2 + 4 * n7 + 8 * n6;
            }
            if n2 == 0 && i + 1 < pw {
                grid[j * pw + i + 1] = 2 * n3 + 4 * n5 + 8;
            }
            if n1 == 0 {
                grid[j * pw + i] = 2 * n2 + 4 + 8 * n4;
            }
        }
    }
    grid
}

/// Walk every boundary in `grid`, consuming it. Returns the closed outer
/// boundaries with at least `omit` corners, as corner coordinates.
fn walk_boundaries(grid: &mut [u8], pw: usize, ph: usize, omit: usize) -> Vec<Vec<(i32, i32)>> {
    let mut out = Vec::new();
    let max_iterations = pw * ph;
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    let (w, h) = (pw as i32, ph as i32);

    for j in 0..ph {
        for i in 0..pw {
            let start_code = grid[j * pw + i];
            if start_code == 0 || start_code == 15 {
                continue;
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let (mut x, mut y) = (i as i32, j as i32);
            let start = (x - 1, y - 1);
            let mut direction = usize::from(DIRECTION_LOOKUP[usize::from(start_code)]);
            let hole = HOLE_LOOKUP[usize::from(start_code)];

            let mut corners = Vec::new();
            let mut iterations = 0;
            let mut closed = false;
            while iterations < max_iterations {
                #[allow(clippy::cast_sign_loss)]
                let cell = y as usize * pw + x as usize;
                corners.push((x - 1, y - 1));
                let row = COMBINED_LOOKUP[usize::from(grid[cell] & 15)][direction];
                let Ok(next_direction) = usize::try_from(row[1]) else {
                    break;
                };
                #[allow(clippy::cast_sign_loss)]
                let written = row[0] as u8;
                grid[cell] = written;
                direction = next_direction;
                x += i32::from(row[2]);
                y += i32::from(row[3]);
                if x < 0 || x >= w || y < 0 || y >= h {
                    break;
                }
                if (x - 1, y - 1) == start {
                    closed = true;
                    break;
                }
                iterations += 1;
            }

            if closed && iterations < max_iterations && !hole && corners.len() >= omit {
                out.push(corners);
            }
        }
    }
    out
}

/// Cyclic midpoints of consecutive corners.
#[must_use]
pub fn internodes(corners: &[(i32, i32)]) -> Vec<Point> {
    let n = corners.len();
    if n < 2 {
        return Vec::new();
    }
    (0..n)
        .map(|i| {
            let (a, b) = (corners[i], corners[(i + 1) % n]);
            Point::new(f64::from(a.0 + b.0) / 2.0, f64::from(a.1 + b.1) / 2.0)
        })
        .collect()
}

/// Scan one palette layer into closed outlines.
#[must_use]
pub fn scan_layer(index_map: &IndexMap, value: i32, omit: usize) -> Vec<Vec<Point>> {
    let mut grid = edge_codes(index_map, value);
    walk_boundaries(
        &mut grid,
        index_map.padded_width(),
        index_map.padded_height(),
        omit,
    )
    .iter()
    .map(|corners| internodes(corners))
    .collect()
}

/// Scan every palette layer in parallel. Layer `k` holds the outlines of
/// the regions with index `k`, as closed straight-segment paths.
#[must_use = "returns the scanned layers"]
pub fn scan_layers(index_map: &IndexMap, palette_len: usize, omit: usize) -> Vec<Vec<Path>> {
    (0..palette_len)
        .into_par_iter()
        .map(|k| {
            let Ok(value) = i32::try_from(k) else {
                return Vec::new();
            };
            scan_layer(index_map, value, omit)
                .into_iter()
                .map(|points| Path::from_points(&points, true))
                .collect()
        })
        .collect()
}
