//! Planar homography estimation.
//!
//! A homography is fitted with the normalised direct linear transform (DLT)
//! inside a consensus-sampling (RANSAC) loop, so a few badly clicked
//! calibration points do not bend the result. The sampler is seeded, which
//! makes estimation reproducible run to run.

use crate::config::HomographyConfig;
use crate::error::PipelineError;
use log::debug;
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Minimum number of correspondences that determine a homography.
pub const MIN_CORRESPONDENCES: usize = 4;

const EPSILON: f64 = 1e-12;
/// Twice the triangle area below which three sample points count as collinear.
const COLLINEAR_TOLERANCE: f64 = 1e-6;

/// A 3×3 projective transform, normalised so that `h[2][2] == 1` when possible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    matrix: Matrix3<f64>,
}

impl Homography {
    pub fn identity() -> Self {
        Self {
            matrix: Matrix3::identity(),
        }
    }

    /// Wraps a matrix, rejecting non-finite or singular ones.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Result<Self, PipelineError> {
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::Computation(
                "homography has non-finite entries".to_string(),
            ));
        }
        if matrix.determinant().abs() < EPSILON {
            return Err(PipelineError::Computation(
                "homography is singular".to_string(),
            ));
        }
        let scale = matrix[(2, 2)];
        let matrix = if scale.abs() > EPSILON {
            matrix / scale
        } else {
            matrix
        };
        Ok(Self { matrix })
    }

    /// Pure translation by `(dx, dy)`.
    pub fn translation(dx: f64, dy: f64) -> Self {
        Self {
            matrix: Matrix3::new(1.0, 0.0, dx, 0.0, 1.0, dy, 0.0, 0.0, 1.0),
        }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// Applies `self` first, then `next`.
    pub fn then(&self, next: &Homography) -> Homography {
        Homography {
            matrix: next.matrix * self.matrix,
        }
    }

    pub fn inverse(&self) -> Result<Homography, PipelineError> {
        let inverse = self.matrix.try_inverse().ok_or_else(|| {
            PipelineError::Computation("homography is not invertible".to_string())
        })?;
        Homography::from_matrix(inverse)
    }

    /// Maps a point; `None` if it lands on the line at infinity.
    #[inline]
    pub fn project(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let p = self.matrix * Vector3::new(x, y, 1.0);
        if p.z.abs() < EPSILON {
            None
        } else {
            Some((p.x / p.z, p.y / p.z))
        }
    }

    /// Squared distance between the projection of `src` and `dst`.
    #[inline]
    pub fn transfer_error_sq(&self, src: &Point2<f64>, dst: &Point2<f64>) -> f64 {
        match self.project(src.x, src.y) {
            Some((x, y)) => (x - dst.x).powi(2) + (y - dst.y).powi(2),
            None => f64::INFINITY,
        }
    }

    /// Least-squares fit through all correspondences (no outlier rejection).
    pub fn fit(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<Self, PipelineError> {
        check_correspondences(src, dst)?;
        let matrix = dlt(src, dst).ok_or_else(|| {
            PipelineError::Computation("correspondences are degenerate".to_string())
        })?;
        Homography::from_matrix(matrix)
    }
}

fn check_correspondences(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<(), PipelineError> {
    if src.len() != dst.len() {
        return Err(PipelineError::Computation(format!(
            "point sets differ in size ({} vs {})",
            src.len(),
            dst.len()
        )));
    }
    if src.len() < MIN_CORRESPONDENCES {
        return Err(PipelineError::Computation(format!(
            "need at least {} correspondences, got {}",
            MIN_CORRESPONDENCES,
            src.len()
        )));
    }
    Ok(())
}

/// Similarity transform moving the centroid to the origin with mean distance √2.
fn normalization(points: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0))
}

/// Normalised DLT. Returns `None` for degenerate input.
fn dlt(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Matrix3<f64>> {
    let t_src = normalization(src)?;
    let t_dst = normalization(dst)?;

    // Padded to at least 9 rows so the SVD yields a full right basis.
    let rows = (2 * src.len()).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (s, d)) in src.iter().zip(dst).enumerate() {
        let p = t_src * Vector3::new(s.x, s.y, 1.0);
        let q = t_dst * Vector3::new(d.x, d.y, 1.0);
        let (x, y) = (p.x, p.y);
        let (u, v) = (q.x, q.y);
        let r = 2 * i;
        let row_u = [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u];
        let row_v = [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v];
        for j in 0..9 {
            a[(r, j)] = row_u[j];
            a[(r + 1, j)] = row_v[j];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (null_row, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = |j: usize| v_t[(null_row, j)];
    let normalized = Matrix3::new(h(0), h(1), h(2), h(3), h(4), h(5), h(6), h(7), h(8));

    let matrix = t_dst.try_inverse()? * normalized * t_src;
    if matrix.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(matrix)
}

/// Returns true if any three of the points are (nearly) collinear.
fn has_collinear_triple(points: &[Point2<f64>]) -> bool {
    let n = points.len();
    for i in 0..n {
        for j in i + 1..n {
            for k in j + 1..n {
                let ab = points[j] - points[i];
                let ac = points[k] - points[i];
                if (ab.x * ac.y - ab.y * ac.x).abs() < COLLINEAR_TOLERANCE {
                    return true;
                }
            }
        }
    }
    false
}

/// Adaptive iteration bound for the given outlier ratio.
fn update_iterations(confidence: f64, outlier_ratio: f64, current: usize) -> usize {
    let num = (1.0 - confidence).max(f64::MIN_POSITIVE).ln();
    let denom = 1.0 - (1.0 - outlier_ratio).powi(MIN_CORRESPONDENCES as i32);
    if denom < f64::MIN_POSITIVE {
        return 0;
    }
    let denom = denom.ln();
    if denom >= 0.0 || -num >= current as f64 * -denom {
        current
    } else {
        (num / denom).round() as usize
    }
}

/// Result of a robust fit.
#[derive(Debug, Clone)]
pub struct Estimate {
    pub homography: Homography,
    /// Inlier flag per correspondence
    pub inliers: Vec<bool>,
    /// Sampling iterations actually run
    pub iterations: usize,
}

impl Estimate {
    pub fn inlier_count(&self) -> usize {
        self.inliers.iter().filter(|&&b| b).count()
    }
}

/// Consensus-sampling homography estimator.
#[derive(Debug, Clone)]
pub struct RansacEstimator {
    threshold: f64,
    max_iterations: usize,
    confidence: f64,
    seed: u64,
}

impl RansacEstimator {
    /// Takes its settings from `config`.
    pub fn new(config: &HomographyConfig) -> Self {
        Self {
            threshold: config.inlier_threshold,
            max_iterations: config.max_iterations,
            confidence: config.confidence,
            seed: config.seed,
        }
    }

    fn inliers(&self, h: &Homography, src: &[Point2<f64>], dst: &[Point2<f64>]) -> Vec<bool> {
        let limit = self.threshold * self.threshold;
        src.iter()
            .zip(dst)
            .map(|(s, d)| h.transfer_error_sq(s, d) <= limit)
            .collect()
    }

    /// Estimates the homography mapping `src` onto `dst`.
    pub fn estimate(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
    ) -> Result<Estimate, PipelineError> {
        check_correspondences(src, dst)?;
        let n = src.len();
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut best: Option<(Homography, Vec<bool>, usize)> = None;
        let mut budget = self.max_iterations;
        let mut iterations = 0;
        let mut sample_src = [Point2::origin(); MIN_CORRESPONDENCES];
        let mut sample_dst = [Point2::origin(); MIN_CORRESPONDENCES];

        while iterations < budget {
            iterations += 1;
            let picks = rand::seq::index::sample(&mut rng, n, MIN_CORRESPONDENCES);
            for (slot, idx) in picks.iter().enumerate() {
                sample_src[slot] = src[idx];
                sample_dst[slot] = dst[idx];
            }
            if has_collinear_triple(&sample_src) || has_collinear_triple(&sample_dst) {
                continue;
            }
            let Some(model) = dlt(&sample_src, &sample_dst)
                .and_then(|m| Homography::from_matrix(m).ok())
            else {
                continue;
            };
            let mask = self.inliers(&model, src, dst);
            let count = mask.iter().filter(|&&b| b).count();
            if best.as_ref().map_or(true, |(_, _, c)| count > *c) {
                let outlier_ratio = (n - count) as f64 / n as f64;
                budget = update_iterations(self.confidence, outlier_ratio, budget).max(iterations);
                best = Some((model, mask, count));
            }
        }

        let Some((model, mask, count)) = best else {
            return Err(PipelineError::Computation(
                "no non-degenerate sample found".to_string(),
            ));
        };
        if count < MIN_CORRESPONDENCES {
            return Err(PipelineError::Computation(format!(
                "only {} inliers within {} px",
                count, self.threshold
            )));
        }

        // Refit on the consensus set; keep it only if it does not lose support.
        let (inlier_src, inlier_dst): (Vec<_>, Vec<_>) = src
            .iter()
            .zip(dst)
            .zip(&mask)
            .filter(|&(_, &keep)| keep)
            .map(|((s, d), _)| (*s, *d))
            .unzip();
        let (homography, inliers) = match Homography::fit(&inlier_src, &inlier_dst) {
            Ok(refit) => {
                let refit_mask = self.inliers(&refit, src, dst);
                if refit_mask.iter().filter(|&&b| b).count() >= count {
                    (refit, refit_mask)
                } else {
                    (model, mask)
                }
            }
            Err(_) => (model, mask),
        };

        debug!(
            "Homography: {}/{} inliers after {} iterations",
            inliers.iter().filter(|&&b| b).count(),
            n,
            iterations
        );
        Ok(Estimate {
            homography,
            inliers,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> Homography {
        Homography::from_matrix(Matrix3::new(
            1.05, 0.02, 280.0, -0.01, 0.98, 12.0, 1e-5, -2e-5, 1.0,
        ))
        .unwrap()
    }

    fn grid() -> Vec<Point2<f64>> {
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                points.push(Point2::new(40.0 + 150.0 * i as f64, 30.0 + 120.0 * j as f64));
            }
        }
        points
    }

    fn project_all(h: &Homography, points: &[Point2<f64>]) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|p| {
                let (x, y) = h.project(p.x, p.y).unwrap();
                Point2::new(x, y)
            })
            .collect()
    }

    fn assert_close(a: &Homography, b: &Homography, tol: f64) {
        for (x, y) in [(0.0, 0.0), (640.0, 360.0), (1279.0, 719.0)] {
            let (ax, ay) = a.project(x, y).unwrap();
            let (bx, by) = b.project(x, y).unwrap();
            assert!((ax - bx).abs() < tol && (ay - by).abs() < tol);
        }
    }

    #[test]
    fn test_exact_fit_recovers_matrix() {
        let src = grid();
        let dst = project_all(&reference(), &src);
        let fitted = Homography::fit(&src, &dst).unwrap();
        assert_close(&fitted, &reference(), 1e-6);
    }

    #[test]
    fn test_ransac_ignores_outliers() {
        let src = grid();
        let mut dst = project_all(&reference(), &src);
        dst[3].x += 40.0;
        dst[11].y -= 25.0;
        dst[20] = Point2::new(5.0, 5.0);

        let estimator = RansacEstimator::new(&HomographyConfig::default());
        let estimate = estimator.estimate(&src, &dst).unwrap();

        assert_eq!(estimate.inlier_count(), src.len() - 3);
        assert!(!estimate.inliers[3] && !estimate.inliers[11] && !estimate.inliers[20]);
        assert_close(&estimate.homography, &reference(), 1e-6);
    }

    #[test]
    fn test_estimation_is_deterministic() {
        let src = grid();
        let mut dst = project_all(&reference(), &src);
        dst[7].x += 30.0;
        let estimator = RansacEstimator::new(&HomographyConfig::default());
        let a = estimator.estimate(&src, &dst).unwrap();
        let b = estimator.estimate(&src, &dst).unwrap();
        assert_eq!(a.homography, b.homography);
        assert_eq!(a.iterations, b.iterations);
    }

    #[test]
    fn test_too_few_points_fails() {
        let src = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 0.0), Point2::new(0.0, 1.0)];
        let estimator = RansacEstimator::new(&HomographyConfig::default());
        let result = estimator.estimate(&src, &src);
        assert!(matches!(result, Err(PipelineError::Computation(_))));
    }

    #[test]
    fn test_collinear_points_fail() {
        let src: Vec<_> = (0..8).map(|i| Point2::new(i as f64, 2.0 * i as f64)).collect();
        let estimator = RansacEstimator::new(&HomographyConfig::default());
        assert!(estimator.estimate(&src, &src).is_err());
    }

    #[test]
    fn test_translation_composition() {
        let shifted = reference().then(&Homography::translation(-280.0, 0.0));
        let (x0, y0) = reference().project(100.0, 50.0).unwrap();
        let (x1, y1) = shifted.project(100.0, 50.0).unwrap();
        assert!((x1 - (x0 - 280.0)).abs() < 1e-9);
        assert!((y1 - y0).abs() < 1e-9);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let h = reference();
        let inv = h.inverse().unwrap();
        let (x, y) = h.project(321.0, 123.0).unwrap();
        let (bx, by) = inv.project(x, y).unwrap();
        assert!((bx - 321.0).abs() < 1e-6 && (by - 123.0).abs() < 1e-6);
    }

    #[test]
    fn test_singular_matrix_rejected() {
        assert!(Homography::from_matrix(Matrix3::zeros()).is_err());
    }

    #[test]
    fn test_update_iterations_shrinks_with_inliers() {
        assert_eq!(update_iterations(0.995, 0.0, 10_000), 0);
        let some_outliers = update_iterations(0.995, 0.3, 10_000);
        assert!(some_outliers > 0 && some_outliers < 10_000);
        assert_eq!(update_iterations(0.995, 0.99, 10_000), 10_000);
    }
}
