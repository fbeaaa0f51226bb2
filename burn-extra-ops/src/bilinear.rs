//! # Bilinear Sampling
//!
//! Samples a single feature plane at a fractional `(y, x)` location. Grid
//! neighbours that fall outside `[0, H-1] x [0, W-1]` contribute zero, so a
//! location more than one unit outside the plane samples exactly `0.0`.
//!
//! [`BilinearSample`] additionally keeps the four corner indices and weights
//! together with the positional derivatives, which is everything the
//! deformable convolution backward pass needs to scatter gradients.

/// One of the four grid neighbours of a bilinear sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Corner {
    /// Flat `y * width + x` index into the plane, `None` when out of bounds.
    pub index: Option<usize>,
    /// Interpolation weight of the neighbour.
    pub weight: f64,
}

/// A bilinear sample together with the data needed to differentiate it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilinearSample {
    /// Interpolated value.
    pub value: f64,
    /// Neighbours in `(y0, x0), (y0, x1), (y1, x0), (y1, x1)` order.
    pub corners: [Corner; 4],
    /// `d value / d y`.
    pub grad_y: f64,
    /// `d value / d x`.
    pub grad_x: f64,
}

const OUTSIDE: Corner = Corner {
    index: None,
    weight: 0.0,
};

impl BilinearSample {
    /// Samples `plane` (row-major, `height x width`) at `(y, x)`.
    pub fn at(plane: &[f64], height: usize, width: usize, y: f64, x: f64) -> Self {
        if !in_support(height, width, y, x) {
            return Self {
                value: 0.0,
                corners: [OUTSIDE; 4],
                grad_y: 0.0,
                grad_x: 0.0,
            };
        }

        let y_low = y.floor();
        let x_low = x.floor();
        let ly = y - y_low;
        let lx = x - x_low;
        let hy = 1.0 - ly;
        let hx = 1.0 - lx;

        // In support, so both floors lie in [-1, H-1] and [-1, W-1].
        let y_low = y_low as isize;
        let x_low = x_low as isize;
        let index = |row: isize, col: isize| -> Option<usize> {
            (row >= 0 && col >= 0 && (row as usize) < height && (col as usize) < width)
                .then(|| row as usize * width + col as usize)
        };

        let indices = [
            index(y_low, x_low),
            index(y_low, x_low + 1),
            index(y_low + 1, x_low),
            index(y_low + 1, x_low + 1),
        ];
        let weights = [hy * hx, hy * lx, ly * hx, ly * lx];
        let v = indices.map(|i| i.map_or(0.0, |i| plane[i]));

        let value = weights[0] * v[0] + weights[1] * v[1] + weights[2] * v[2] + weights[3] * v[3];
        let grad_y = hx * (v[2] - v[0]) + lx * (v[3] - v[1]);
        let grad_x = hy * (v[1] - v[0]) + ly * (v[3] - v[2]);

        let mut corners = [OUTSIDE; 4];
        for (corner, (index, weight)) in corners.iter_mut().zip(indices.into_iter().zip(weights)) {
            *corner = Corner { index, weight };
        }

        Self {
            value,
            corners,
            grad_y,
            grad_x,
        }
    }

    /// Accumulates `grad * weight` into every in-bounds corner of `plane_grad`.
    pub fn scatter(&self, grad: f64, plane_grad: &mut [f64]) {
        for corner in &self.corners {
            if let Some(index) = corner.index {
                plane_grad[index] += grad * corner.weight;
            }
        }
    }
}

/// Samples `plane` at `(y, x)` without keeping gradient data.
pub fn bilinear_sample(plane: &[f64], height: usize, width: usize, y: f64, x: f64) -> f64 {
    if !in_support(height, width, y, x) {
        return 0.0;
    }
    BilinearSample::at(plane, height, width, y, x).value
}

/// Whether any neighbour of `(y, x)` can lie inside the plane. Also rejects NaN.
fn in_support(height: usize, width: usize, y: f64, x: f64) -> bool {
    y > -1.0 && y < height as f64 && x > -1.0 && x < width as f64
}

/// Read-only view over a flat NCHW buffer addressing planes by batch and channel.
#[derive(Debug, Clone, Copy)]
pub struct FeatureMapView<'a> {
    data: &'a [f64],
    dims: [usize; 4],
}

impl<'a> FeatureMapView<'a> {
    /// Wraps `data`, returning `None` when its length disagrees with `dims`.
    pub fn new(data: &'a [f64], dims: [usize; 4]) -> Option<Self> {
        (data.len() == dims.iter().product::<usize>()).then_some(Self { data, dims })
    }

    /// `[batch, channels, height, width]`.
    pub const fn dims(&self) -> [usize; 4] {
        self.dims
    }

    /// The `height x width` plane of `(batch, channel)`.
    pub fn plane(&self, batch: usize, channel: usize) -> Option<&'a [f64]> {
        let [batch_size, channels, height, width] = self.dims;
        if batch >= batch_size || channel >= channels {
            return None;
        }
        let plane_size = height * width;
        let start = (batch * channels + channel) * plane_size;
        self.data.get(start..start + plane_size)
    }

    /// Bilinear sample of `(batch, channel)` at `(y, x)`.
    pub fn sample(&self, batch: usize, channel: usize, y: f64, x: f64) -> Option<f64> {
        let [_, _, height, width] = self.dims;
        self.plane(batch, channel)
            .map(|plane| bilinear_sample(plane, height, width, y, x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 3x4 plane with distinct values.
    const PLANE: [f64; 12] = [
        1.0, 2.0, 3.0, 4.0, //
        5.0, 6.0, 7.0, 8.0, //
        9.0, 10.0, 11.0, 12.0,
    ];

    #[test]
    fn test_integer_locations_match_pixels_exactly() {
        for row in 0..3 {
            for col in 0..4 {
                let value = bilinear_sample(&PLANE, 3, 4, row as f64, col as f64);
                assert_eq!(value, PLANE[row * 4 + col]);
            }
        }
    }

    #[test]
    fn test_far_outside_samples_zero() {
        for (y, x) in [(-1.5, 1.0), (1.0, -1.0), (3.0, 0.0), (0.5, 4.0), (-7.0, 12.0)] {
            assert_eq!(bilinear_sample(&PLANE, 3, 4, y, x), 0.0, "({y}, {x})");
            let sample = BilinearSample::at(&PLANE, 3, 4, y, x);
            assert!(sample.corners.iter().all(|c| c.index.is_none()));
        }
        assert_eq!(bilinear_sample(&PLANE, 3, 4, f64::NAN, 0.0), 0.0);
    }

    #[test]
    fn test_interior_sample_interpolates_four_neighbours() {
        let value = bilinear_sample(&PLANE, 3, 4, 0.5, 1.5);
        assert!((value - (2.0 + 3.0 + 6.0 + 7.0) / 4.0).abs() < 1e-12);

        let value = bilinear_sample(&PLANE, 3, 4, 1.25, 2.0);
        assert!((value - (0.75 * 7.0 + 0.25 * 11.0)).abs() < 1e-12);
    }

    #[test]
    fn test_border_sample_zero_pads_missing_neighbours() {
        // Half a unit above row 0: the upper neighbours are padding.
        let value = bilinear_sample(&PLANE, 3, 4, -0.5, 0.0);
        assert!((value - 0.5).abs() < 1e-12);

        let sample = BilinearSample::at(&PLANE, 3, 4, -0.5, 0.0);
        assert_eq!(sample.corners[0].index, None);
        assert_eq!(sample.corners[2].index, Some(0));
    }

    #[test]
    fn test_positional_gradients_match_finite_differences() {
        let eps = 1e-6;
        for (y, x) in [(0.3, 1.7), (1.6, 2.2), (-0.4, 0.3), (2.4, 3.6)] {
            let sample = BilinearSample::at(&PLANE, 3, 4, y, x);
            let dy = (bilinear_sample(&PLANE, 3, 4, y + eps, x)
                - bilinear_sample(&PLANE, 3, 4, y - eps, x))
                / (2.0 * eps);
            let dx = (bilinear_sample(&PLANE, 3, 4, y, x + eps)
                - bilinear_sample(&PLANE, 3, 4, y, x - eps))
                / (2.0 * eps);
            assert!((sample.grad_y - dy).abs() < 1e-6, "dy at ({y}, {x})");
            assert!((sample.grad_x - dx).abs() < 1e-6, "dx at ({y}, {x})");
        }
    }

    #[test]
    fn test_scatter_is_adjoint_of_sampling() {
        let sample = BilinearSample::at(&PLANE, 3, 4, 1.3, 0.6);
        let mut plane_grad = [0.0; 12];
        sample.scatter(1.0, &mut plane_grad);

        let reconstructed: f64 = plane_grad.iter().zip(PLANE).map(|(g, v)| g * v).sum();
        assert!((reconstructed - sample.value).abs() < 1e-12);
    }

    #[test]
    fn test_feature_map_view_addresses_batch_and_channel() {
        let data: Vec<f64> = (0..2 * 3 * 2 * 2).map(f64::from).collect();
        let view = FeatureMapView::new(&data, [2, 3, 2, 2]).unwrap();

        assert_eq!(view.sample(1, 2, 1.0, 1.0), Some(23.0));
        assert_eq!(view.sample(0, 1, 0.0, 0.5), Some(4.5));
        assert_eq!(view.sample(2, 0, 0.0, 0.0), None);
        assert!(FeatureMapView::new(&data, [1, 3, 2, 2]).is_none());
    }
}
