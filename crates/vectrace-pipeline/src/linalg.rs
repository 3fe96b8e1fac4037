//! 3×3 linear solves for the least-squares fits (circle refinement,
//! plane regression, boundary luma gradients).

/// Solve `m · x = b` by Gauss–Jordan elimination with partial pivoting.
///
/// Returns `None` when a pivot is negligible relative to the largest
/// entry of `m`.
#[must_use]
pub fn solve3x3(m: [[f64; 3]; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let mut a = [[0.0; 4]; 3];
    for i in 0..3 {
        a[i][..3].copy_from_slice(&m[i]);
        a[i][3] = b[i];
    }

    let mut scale = m
        .iter()
        .flatten()
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if scale < 1e-100 {
        scale = 1.0;
    }
    let threshold = 1e-10 * scale;

    for i in 0..3 {
        let mut pivot = i;
        let mut max_abs = a[i][i].abs();
        for (k, row) in a.iter().enumerate().skip(i + 1) {
            if row[i].abs() > max_abs {
                max_abs = row[i].abs();
                pivot = k;
            }
        }
        if max_abs < threshold {
            return None;
        }
        a.swap(i, pivot);

        let diag = a[i][i];
        for v in &mut a[i][i..] {
            *v /= diag;
        }
        let pivot_row = a[i];
        for (k, row) in a.iter_mut().enumerate() {
            if k != i {
                let f = row[i];
                for j in i..4 {
                    row[j] -= f * pivot_row[j];
                }
            }
        }
    }

    Some([a[0][3], a[1][3], a[2][3]])
}

/// [`solve3x3`] after scaling each row by its largest magnitude, for
/// normal equations whose rows differ by orders of magnitude.
#[must_use]
pub fn solve3x3_normalized(m: [[f64; 3]; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    let mut mn = m;
    let mut bn = b;
    for i in 0..3 {
        let row_max = m[i].iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if row_max > 1e-100 {
            for v in &mut mn[i] {
                *v /= row_max;
            }
            bn[i] /= row_max;
        }
    }
    solve3x3(mn, bn)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn solves_simple_system() {
        // x + y + z = 6, 2y + 5z = -4, 2x + 5y - z = 27
        let x = solve3x3(
            [[1.0, 1.0, 1.0], [0.0, 2.0, 5.0], [2.0, 5.0, -1.0]],
            [6.0, -4.0, 27.0],
        )
        .unwrap();
        assert!((x[0] - 5.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
        assert!((x[2] + 2.0).abs() < 1e-9);
    }

    #[test]
    fn needs_pivoting() {
        let x = solve3x3(
            [[0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 2.0]],
            [3.0, 4.0, 10.0],
        )
        .unwrap();
        assert!((x[0] - 4.0).abs() < 1e-12);
        assert!((x[1] - 3.0).abs() < 1e-12);
        assert!((x[2] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let m = [[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [1.0, 0.0, 1.0]];
        assert!(solve3x3(m, [1.0, 2.0, 3.0]).is_none());
        assert!(solve3x3([[0.0; 3]; 3], [0.0; 3]).is_none());
    }

    #[test]
    fn normalized_handles_badly_scaled_rows() {
        let m = [[1e9, 0.0, 0.0], [0.0, 1e-3, 0.0], [0.0, 0.0, 1.0]];
        let x = solve3x3_normalized(m, [2e9, 3e-3, 4.0]).unwrap();
        assert!((x[0] - 2.0).abs() < 1e-9);
        assert!((x[1] - 3.0).abs() < 1e-9);
        assert!((x[2] - 4.0).abs() < 1e-9);
    }
}
