//! Matrix utilities for layer transforms
//!
//! `Matrix` is a 2D affine transform (the upper 3x3 of a WebGL `mat4` with the
//! z row dropped). It is a value type: every operation returns a new matrix
//! and nothing mutates its input.
//!
//! ## Composition order
//!
//! - `translate`, `rotate_z` and `scale` right-multiply: the new step is
//!   applied in the matrix's current local frame ("transform then move").
//! - `then_translate`, `then_rotate_about` and `then_scale_about`
//!   left-multiply: the step is applied in world/canvas space after the
//!   existing transform. Interactive gestures use these, since pointer deltas
//!   are measured on the canvas.

use crate::error::{Result, TegakiError};
use kurbo::{Affine, Point, Vec2};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Smallest scale magnitude a matrix may carry while still being invertible
pub const MIN_SCALE: f64 = 1e-3;

/// Determinants below this are treated as singular
const SINGULAR_EPSILON: f64 = 1e-12;

/// 2D affine transform
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matrix(Affine);

impl Default for Matrix {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Matrix {
    /// The neutral transform
    pub const IDENTITY: Matrix = Matrix(Affine::IDENTITY);

    pub fn identity() -> Self {
        Self::IDENTITY
    }

    /// Build from kurbo coefficients `[a, b, c, d, e, f]`
    pub fn from_coeffs(coeffs: [f64; 6]) -> Self {
        Matrix(Affine::new(coeffs))
    }

    /// Pure translation
    pub fn from_translation(dx: f64, dy: f64) -> Self {
        Matrix(Affine::translate((dx, dy)))
    }

    pub fn coeffs(&self) -> [f64; 6] {
        self.0.as_coeffs()
    }

    pub fn as_affine(&self) -> Affine {
        self.0
    }

    /// Compose with a translation in the local frame
    pub fn translate(&self, dx: f64, dy: f64) -> Self {
        Matrix(self.0 * Affine::translate((dx, dy)))
    }

    /// Compose with a rotation (radians) in the local frame
    pub fn rotate_z(&self, angle: f64) -> Self {
        Matrix(self.0 * Affine::rotate(angle))
    }

    /// Compose with a non-uniform scale in the local frame
    ///
    /// Negative factors flip. Factors smaller in magnitude than [`MIN_SCALE`]
    /// are clamped so the result stays invertible.
    pub fn scale(&self, sx: f64, sy: f64) -> Self {
        self.scale_clamped(sx, sy, MIN_SCALE)
    }

    /// Same as [`Matrix::scale`] with an explicit minimum magnitude
    pub fn scale_clamped(&self, sx: f64, sy: f64, min: f64) -> Self {
        let sx = clamp_scale(sx, min);
        let sy = clamp_scale(sy, min);
        Matrix(self.0 * Affine::scale_non_uniform(sx, sy))
    }

    /// Apply a translation in world space after this transform
    pub fn then_translate(&self, dx: f64, dy: f64) -> Self {
        Matrix(Affine::translate((dx, dy)) * self.0)
    }

    /// Apply a rotation about a world-space pivot after this transform
    pub fn then_rotate_about(&self, angle: f64, pivot: Point) -> Self {
        Matrix(about(pivot, Affine::rotate(angle)) * self.0)
    }

    /// Apply a scale about a world-space pivot after this transform
    pub fn then_scale_about(&self, sx: f64, sy: f64, pivot: Point, min: f64) -> Self {
        let sx = clamp_scale(sx, min);
        let sy = clamp_scale(sy, min);
        Matrix(about(pivot, Affine::scale_non_uniform(sx, sy)) * self.0)
    }

    /// `self * other`: `other` is applied first
    pub fn compose(&self, other: &Matrix) -> Self {
        Matrix(self.0 * other.0)
    }

    pub fn determinant(&self) -> f64 {
        self.0.determinant()
    }

    pub fn is_invertible(&self) -> bool {
        let det = self.determinant();
        det.is_finite() && det.abs() > SINGULAR_EPSILON
    }

    /// Inverse transform, or [`TegakiError::SingularMatrix`]
    pub fn invert(&self) -> Result<Self> {
        if !self.is_invertible() || !self.is_finite() {
            return Err(TegakiError::SingularMatrix);
        }
        Ok(Matrix(self.0.inverse()))
    }

    /// Transform a point (implicit z = 0, w = 1)
    pub fn apply_to_point(&self, point: Point) -> Point {
        self.0 * point
    }

    /// Transform a direction (ignores translation)
    pub fn apply_to_vector(&self, v: Vec2) -> Vec2 {
        let [a, b, c, d, _, _] = self.0.as_coeffs();
        Vec2::new(a * v.x + c * v.y, b * v.x + d * v.y)
    }

    pub fn translation(&self) -> Vec2 {
        let [_, _, _, _, e, f] = self.0.as_coeffs();
        Vec2::new(e, f)
    }

    /// Copy with the translation snapped to whole pixels
    pub fn round_translation(&self) -> Self {
        let [a, b, c, d, e, f] = self.0.as_coeffs();
        Matrix(Affine::new([a, b, c, d, e.round(), f.round()]))
    }

    /// Geometric mean of the axis scales, used to scale stroke widths
    pub fn mean_scale(&self) -> f64 {
        self.determinant().abs().sqrt()
    }

    /// True when the transform mirrors its input
    pub fn is_flipped(&self) -> bool {
        self.determinant() < 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.as_coeffs().iter().all(|v| v.is_finite())
    }

    pub fn is_identity(&self) -> bool {
        self.approx_eq(&Self::IDENTITY, 1e-9)
    }

    pub fn approx_eq(&self, other: &Matrix, epsilon: f64) -> bool {
        self.0
            .as_coeffs()
            .iter()
            .zip(other.0.as_coeffs().iter())
            .all(|(a, b)| (a - b).abs() <= epsilon)
    }

    /// Row-major 3x3 array, the persisted form
    pub fn to_array(&self) -> [f64; 9] {
        let [a, b, c, d, e, f] = self.0.as_coeffs();
        [a, c, e, b, d, f, 0.0, 0.0, 1.0]
    }

    /// Column-major 4x4 array, as uploaded to WebGL
    pub fn to_mat4(&self) -> [f64; 16] {
        let [a, b, c, d, e, f] = self.0.as_coeffs();
        [
            a, b, 0.0, 0.0, //
            c, d, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            e, f, 0.0, 1.0,
        ]
    }

    /// Parse a persisted matrix
    ///
    /// Accepts a row-major 3x3 (9 values) or a column-major 4x4 (16 values).
    /// Anything else, non-finite values, projective or z terms, or a singular
    /// result is rejected with [`TegakiError::MalformedPersistedState`].
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(TegakiError::MalformedPersistedState(format!(
                "matrix contains non-finite value {bad}"
            )));
        }

        let matrix = match values.len() {
            9 => {
                let bottom = [values[6], values[7], values[8]];
                if bottom[0].abs() > 1e-9 || bottom[1].abs() > 1e-9 || (bottom[2] - 1.0).abs() > 1e-9 {
                    return Err(TegakiError::MalformedPersistedState(
                        "3x3 matrix is not affine".to_string(),
                    ));
                }
                Matrix::from_coeffs([values[0], values[3], values[1], values[4], values[2], values[5]])
            }
            16 => {
                // Column-major: z must neither feed nor read x/y, and w stays 1
                let z_coupled = [2, 6, 8, 9, 14].iter().any(|&i| values[i].abs() > 1e-9);
                let projective = [3, 7, 11].iter().any(|&i| values[i].abs() > 1e-9) || (values[15] - 1.0).abs() > 1e-9;
                if z_coupled || projective {
                    return Err(TegakiError::MalformedPersistedState(
                        "4x4 matrix is not a 2D affine transform".to_string(),
                    ));
                }
                Matrix::from_coeffs([values[0], values[1], values[4], values[5], values[12], values[13]])
            }
            n => {
                return Err(TegakiError::MalformedPersistedState(format!(
                    "matrix has {n} elements, expected 9 or 16"
                )))
            }
        };

        if !matrix.is_invertible() {
            return Err(TegakiError::MalformedPersistedState(
                "matrix is singular".to_string(),
            ));
        }
        Ok(matrix)
    }
}

impl Mul for Matrix {
    type Output = Matrix;

    fn mul(self, rhs: Matrix) -> Matrix {
        self.compose(&rhs)
    }
}

impl From<Affine> for Matrix {
    fn from(affine: Affine) -> Self {
        Matrix(affine)
    }
}

/// Clamp a scale factor away from zero, keeping its sign
pub fn clamp_scale(value: f64, min: f64) -> f64 {
    let min = min.abs().max(f64::MIN_POSITIVE);
    if !value.is_finite() {
        return 1.0;
    }
    if value.abs() < min {
        if value < 0.0 {
            -min
        } else {
            min
        }
    } else {
        value
    }
}

fn about(pivot: Point, step: Affine) -> Affine {
    Affine::translate(pivot.to_vec2()) * step * Affine::translate(-pivot.to_vec2())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn assert_point_eq(a: Point, b: Point) {
        assert!((a.x - b.x).abs() < 1e-9 && (a.y - b.y).abs() < 1e-9, "{a:?} != {b:?}");
    }

    #[test]
    fn test_identity_leaves_points_alone() {
        let m = Matrix::identity();
        assert_point_eq(m.apply_to_point(Point::new(3.0, 4.0)), Point::new(3.0, 4.0));
        assert!(m.is_identity());
    }

    #[test]
    fn test_translate_is_local_frame() {
        // Scale first, then a local translate moves by the scaled amount
        let m = Matrix::identity().scale(2.0, 2.0).translate(5.0, 0.0);
        assert_point_eq(m.apply_to_point(Point::ZERO), Point::new(10.0, 0.0));

        // World translate is not affected by the scale
        let w = Matrix::identity().scale(2.0, 2.0).then_translate(5.0, 0.0);
        assert_point_eq(w.apply_to_point(Point::ZERO), Point::new(5.0, 0.0));
    }

    #[test]
    fn test_rotate_z() {
        let m = Matrix::identity().rotate_z(FRAC_PI_2);
        assert_point_eq(m.apply_to_point(Point::new(1.0, 0.0)), Point::new(0.0, 1.0));
    }

    #[test]
    fn test_operations_do_not_mutate_input() {
        let m = Matrix::from_translation(1.0, 2.0);
        let _ = m.translate(10.0, 10.0);
        let _ = m.rotate_z(1.0);
        let _ = m.scale(3.0, 3.0);
        assert_eq!(m.translation(), Vec2::new(1.0, 2.0));
    }

    #[test]
    fn test_scale_clamps_zero() {
        let m = Matrix::identity().scale(0.0, 1.0);
        assert!(m.is_invertible());
        assert_eq!(m.coeffs()[0], MIN_SCALE);

        let flipped = Matrix::identity().scale(-0.0000001, 1.0);
        assert_eq!(flipped.coeffs()[0], -MIN_SCALE);
    }

    #[test]
    fn test_negative_scale_flips() {
        let m = Matrix::identity().scale(-1.0, 1.0);
        assert!(m.is_flipped());
        assert_point_eq(m.apply_to_point(Point::new(2.0, 3.0)), Point::new(-2.0, 3.0));
    }

    #[test]
    fn test_invert_round_trip() {
        let m = Matrix::from_translation(12.0, -7.0)
            .rotate_z(0.3)
            .scale(1.5, -0.75);
        let inv = m.invert().unwrap();
        let p = Point::new(17.25, 3.5);
        assert_point_eq(inv.apply_to_point(m.apply_to_point(p)), p);
    }

    #[test]
    fn test_invert_singular_fails() {
        let singular = Matrix::from_coeffs([1.0, 2.0, 2.0, 4.0, 0.0, 0.0]);
        assert_eq!(singular.invert(), Err(TegakiError::SingularMatrix));
    }

    #[test]
    fn test_scale_about_pivot_keeps_pivot() {
        let pivot = Point::new(100.0, 50.0);
        let m = Matrix::from_translation(10.0, 0.0).then_scale_about(-1.0, 1.0, pivot, MIN_SCALE);
        // A point sitting on the pivot stays put
        let local = Point::new(90.0, 50.0);
        assert_point_eq(m.apply_to_point(local), pivot);
    }

    #[test]
    fn test_round_translation() {
        let m = Matrix::from_translation(54.6, 5.4).round_translation();
        assert_eq!(m.translation(), Vec2::new(55.0, 5.0));
    }

    #[test]
    fn test_array_forms_round_trip() {
        let m = Matrix::from_translation(3.0, 4.0).rotate_z(0.5).scale(2.0, 0.5);
        let from9 = Matrix::from_slice(&m.to_array()).unwrap();
        let from16 = Matrix::from_slice(&m.to_mat4()).unwrap();
        assert!(from9.approx_eq(&m, 1e-12));
        assert!(from16.approx_eq(&m, 1e-12));
    }

    #[test]
    fn test_from_slice_rejects_bad_input() {
        assert!(Matrix::from_slice(&[1.0, 0.0, 0.0, 1.0, 0.0]).is_err());
        let mut nan = Matrix::identity().to_array();
        nan[2] = f64::NAN;
        assert!(Matrix::from_slice(&nan).is_err());
        let zero = [0.0; 9];
        assert!(Matrix::from_slice(&zero).is_err());
    }

    #[test]
    fn test_from_slice_rejects_non_affine_mat4() {
        let m = Matrix::from_translation(3.0, 4.0);
        // Perspective
        let mut perspective = m.to_mat4();
        perspective[3] = 0.01;
        assert!(Matrix::from_slice(&perspective).is_err());
        let mut w = m.to_mat4();
        w[15] = 2.0;
        assert!(Matrix::from_slice(&w).is_err());
        // z feeding x
        let mut z_to_x = m.to_mat4();
        z_to_x[8] = 0.5;
        assert!(Matrix::from_slice(&z_to_x).is_err());
        // Translation in z
        let mut z_shift = m.to_mat4();
        z_shift[14] = 1.0;
        assert!(Matrix::from_slice(&z_shift).is_err());

        assert!(Matrix::from_slice(&m.to_mat4()).is_ok());
    }
}
