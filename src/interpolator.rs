use std::f64::consts::PI;

use ndarray::ArrayView3;

use crate::enums::InterpolationKernel;

/// Samples up to this many voxels outside the grid are extrapolated from the
/// nearest edge; beyond it the fill value is returned.
pub(crate) const PADDING_VOXELS: f64 = 1.0;

/// Half-width of the windowed sinc kernel.
const SINC_RADIUS: isize = 3;
const SINC_TAPS: usize = 2 * (SINC_RADIUS as usize + 1);

/// Coordinates closer than this to a voxel centre sample it directly.
const ON_GRID_EPSILON: f64 = 1e-9;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Sample `frame` at continuous voxel position `pos` with the requested
    /// kernel. Positions outside the padded field of view return `0.0`.
    pub(crate) fn sample(
        frame: &ArrayView3<f32>,
        pos: [f64; 3],
        kernel: InterpolationKernel,
    ) -> f32 {
        let (nx, ny, nz) = frame.dim();
        if frame.is_empty()
            || !Self::within_padding(pos[0], nx)
            || !Self::within_padding(pos[1], ny)
            || !Self::within_padding(pos[2], nz)
        {
            return 0.0;
        }

        match kernel {
            InterpolationKernel::Nearest => Self::nearest(frame, pos),
            InterpolationKernel::Trilinear => Self::trilinear(frame, pos),
            InterpolationKernel::Sinc => Self::sinc(frame, pos),
        }
    }

    #[inline]
    fn within_padding(coord: f64, n: usize) -> bool {
        coord >= -PADDING_VOXELS && coord <= (n as f64 - 1.0) + PADDING_VOXELS
    }

    #[inline]
    fn clamp_index(i: isize, n: usize) -> usize {
        i.clamp(0, n as isize - 1) as usize
    }

    fn nearest(frame: &ArrayView3<f32>, pos: [f64; 3]) -> f32 {
        let (nx, ny, nz) = frame.dim();
        let x = Self::clamp_index(pos[0].round() as isize, nx);
        let y = Self::clamp_index(pos[1].round() as isize, ny);
        let z = Self::clamp_index(pos[2].round() as isize, nz);
        frame[[x, y, z]]
    }

    /// Lower index, upper index and fractional offset along one axis, with
    /// the coordinate clamped onto the grid. An empty axis brackets index 0.
    #[inline]
    fn bracket(coord: f64, n: usize) -> (usize, usize, f64) {
        let last = n.saturating_sub(1);
        let c = coord.clamp(0.0, last as f64);
        let i0 = c.floor() as usize;
        let i1 = (i0 + 1).min(last);
        (i0, i1, c - i0 as f64)
    }

    /// Trilinear interpolation with edge clamping. Used directly for
    /// displacement-field lookups, where extrapolation must never fall back
    /// to zero.
    #[inline]
    pub(crate) fn trilinear(frame: &ArrayView3<f32>, pos: [f64; 3]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let (nx, ny, nz) = frame.dim();
        let (x0, x1, dx) = Self::bracket(pos[0], nx);
        let (y0, y1, dy) = Self::bracket(pos[1], ny);
        let (z0, z1, dz) = Self::bracket(pos[2], nz);

        let lerp = |a: f32, b: f32, t: f64| -> f64 { (a as f64).mul_add(1.0 - t, b as f64 * t) };

        let c00 = lerp(frame[[x0, y0, z0]], frame[[x1, y0, z0]], dx);
        let c10 = lerp(frame[[x0, y1, z0]], frame[[x1, y1, z0]], dx);
        let c01 = lerp(frame[[x0, y0, z1]], frame[[x1, y0, z1]], dx);
        let c11 = lerp(frame[[x0, y1, z1]], frame[[x1, y1, z1]], dx);

        let c0 = c00.mul_add(1.0 - dy, c10 * dy);
        let c1 = c01.mul_add(1.0 - dy, c11 * dy);

        c0.mul_add(1.0 - dz, c1 * dz) as f32
    }

    /// Hann-windowed sinc weight for offset `x` (in voxels).
    #[inline]
    fn sinc_weight(x: f64) -> f64 {
        let width = (SINC_RADIUS + 1) as f64;
        if x.abs() >= width {
            return 0.0;
        }
        let window = 0.5 * (1.0 + (PI * x / width).cos());
        let px = PI * x;
        (px.sin() / px) * window
    }

    /// First tap index and normalised weights along one axis.
    fn sinc_taps(coord: f64, n: usize) -> (isize, [f64; SINC_TAPS]) {
        let mut weights = [0.0; SINC_TAPS];
        let nearest = coord.round();
        if (coord - nearest).abs() < ON_GRID_EPSILON {
            let centre = Self::clamp_index(nearest as isize, n) as isize;
            weights[SINC_RADIUS as usize] = 1.0;
            return (centre - SINC_RADIUS, weights);
        }

        let base = coord.floor() as isize;
        let first = base - SINC_RADIUS;
        let mut total = 0.0;
        for (k, w) in weights.iter_mut().enumerate() {
            let offset = coord - (first + k as isize) as f64;
            *w = Self::sinc_weight(offset);
            total += *w;
        }
        if total.abs() > f64::EPSILON {
            weights.iter_mut().for_each(|w| *w /= total);
        }
        (first, weights)
    }

    fn sinc(frame: &ArrayView3<f32>, pos: [f64; 3]) -> f32 {
        let (nx, ny, nz) = frame.dim();
        let (fx, wx) = Self::sinc_taps(pos[0], nx);
        let (fy, wy) = Self::sinc_taps(pos[1], ny);
        let (fz, wz) = Self::sinc_taps(pos[2], nz);

        let mut value = 0.0;
        for (k, &w_z) in wz.iter().enumerate() {
            if w_z == 0.0 {
                continue;
            }
            let z = Self::clamp_index(fz + k as isize, nz);
            for (j, &w_y) in wy.iter().enumerate() {
                if w_y == 0.0 {
                    continue;
                }
                let y = Self::clamp_index(fy + j as isize, ny);
                let mut row = 0.0;
                for (i, &w_x) in wx.iter().enumerate() {
                    if w_x == 0.0 {
                        continue;
                    }
                    let x = Self::clamp_index(fx + i as isize, nx);
                    row += w_x * frame[[x, y, z]] as f64;
                }
                value += w_z * w_y * row;
            }
        }
        value as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp() -> Array3<f32> {
        Array3::from_shape_fn((6, 5, 4), |(x, y, z)| (x + 10 * y + 100 * z) as f32)
    }

    #[test]
    fn every_kernel_is_exact_on_grid_points() {
        let data = ramp();
        let view = data.view();
        for kernel in [
            InterpolationKernel::Nearest,
            InterpolationKernel::Trilinear,
            InterpolationKernel::Sinc,
        ] {
            assert_eq!(Interpolator::sample(&view, [2.0, 3.0, 1.0], kernel), data[[2, 3, 1]]);
        }
    }

    #[test]
    fn trilinear_is_exact_for_linear_data() {
        let data = ramp();
        let value =
            Interpolator::sample(&data.view(), [1.5, 2.25, 0.5], InterpolationKernel::Trilinear);
        assert!((value - (1.5 + 22.5 + 50.0)).abs() < 1e-4);
    }

    #[test]
    fn padding_extends_edges_then_fills() {
        let data = ramp();
        let view = data.view();
        let kernel = InterpolationKernel::Trilinear;
        assert_eq!(Interpolator::sample(&view, [-0.5, 1.0, 0.0], kernel), 10.0);
        assert_eq!(Interpolator::sample(&view, [5.8, 1.0, 0.0], kernel), 15.0);
        assert_eq!(Interpolator::sample(&view, [-1.5, 1.0, 0.0], kernel), 0.0);
        assert_eq!(Interpolator::sample(&view, [0.0, 0.0, 4.5], kernel), 0.0);
    }

    #[test]
    fn empty_frames_sample_zero() {
        let data = Array3::<f32>::zeros((0, 4, 4));
        let view = data.view();
        assert_eq!(Interpolator::trilinear(&view, [0.0, 1.0, 1.0]), 0.0);
        for kernel in [
            InterpolationKernel::Nearest,
            InterpolationKernel::Trilinear,
            InterpolationKernel::Sinc,
        ] {
            assert_eq!(Interpolator::sample(&view, [-0.5, 1.0, 1.0], kernel), 0.0);
        }
    }

    #[test]
    fn sinc_preserves_constant_images() {
        let data = Array3::from_elem((8, 8, 8), 3.5f32);
        let value = Interpolator::sample(&data.view(), [3.3, 4.7, 0.2], InterpolationKernel::Sinc);
        assert!((value - 3.5).abs() < 1e-5);
    }
}
