use crate::{
    floating_type_mod::{FT, PI},
    V2,
};

/// Ratio between kernel support radius and smoothing length for every kernel in this file.
pub const SUPPORT_RADIUS_BY_SMOOTHING_LENGTH: FT = 2.;

/// Pairs closer than this (relative to h) have no usable direction.
pub const MIN_PAIR_DISTANCE_BY_SMOOTHING_LENGTH: FT = 1.0e-5;

/**
 * Cubic spline on q in [0, 1] where q = r / (2h).
 */
pub fn cubic_kernel_unnormalized(q: FT) -> FT {
    if q < 0.5 {
        return 6. * (q * q * q - q * q) + 1.;
    } else if q < 1. {
        let v = 1. - q;
        return 2. * (v * v * v);
    } else {
        return 0.;
    }
}

/**
 * r is the distance to the center.
 * h is the smoothing length, the support radius is 2h.
 *
 * Written in q = r/h this is `sigma * (1 - 1.5q^2 + 0.75q^3)` for q < 1 and
 * `sigma * 0.25 * (2 - q)^3` for 1 <= q < 2 with `sigma = 10 / (7 PI h^2)`.
 */
pub fn cubic_kernel_2d(r: FT, h: FT) -> FT {
    let norm_factor = 10. / (7. * PI * (h * h));
    return norm_factor * cubic_kernel_unnormalized(r / (2. * h));
}

/**
 * Spiky kernel `W = 10 / (PI H^5) * (H - r)^3` with support radius H.
 */
pub fn spiky_kernel_2d(r: FT, support_radius: FT) -> FT {
    if r >= support_radius {
        return 0.;
    }
    let v = support_radius - r;
    10. / (PI * support_radius.powi(5)) * v * v * v
}

/**
 * Gradient of the spiky kernel with respect to x_i where diff = x_i - x_j.
 * Points from j towards i scaled by a negative factor, i.e. it points towards j.
 */
pub fn spiky_kernel_2d_grad(diff: V2, support_radius: FT) -> V2 {
    let r = diff.norm();
    if r >= support_radius || r <= MIN_PAIR_DISTANCE_BY_SMOOTHING_LENGTH * support_radius {
        return V2::zeros();
    }
    let v = support_radius - r;
    let magnitude = -30. / (PI * support_radius.powi(5)) * v * v;
    diff * (magnitude / r)
}

/**
 * Laplacian of the viscosity kernel (Mueller 2003), 2D normalization.
 * Non-negative inside the support.
 */
pub fn viscosity_kernel_2d_laplacian(r: FT, support_radius: FT) -> FT {
    if r >= support_radius {
        return 0.;
    }
    40. / (PI * support_radius.powi(5)) * (support_radius - r)
}

/// One scale of the two-scale cohesion force.
#[derive(Debug, Clone, Copy)]
pub struct CohesionProfile {
    pub strength: FT,
    pub range: FT,
    pub falloff: FT,
}

impl CohesionProfile {
    /// Magnitude of the attraction at distance r, zero outside `[min_distance, range)`.
    pub fn magnitude(&self, r: FT, min_distance: FT) -> FT {
        if r < min_distance || r >= self.range {
            return 0.;
        }
        self.strength * (-r / self.falloff).exp()
    }

    /// d(magnitude)/dr, used as the spring stiffness of the implicit cohesion coupling.
    pub fn stiffness(&self, r: FT, min_distance: FT) -> FT {
        self.magnitude(r, min_distance) / self.falloff
    }
}

#[test]
fn cubic_kernel_2d_integration_test() {
    use crate::vec2f;

    let h = 5.;
    let support_radius = 2.0 * h;
    let grid_size = 200;
    let square_len = 2. * support_radius / grid_size as FT;
    let square_area = square_len * square_len;

    let mut integral = 0.;

    for y in 0..grid_size {
        for x in 0..grid_size {
            let integration_point = vec2f(
                (x as FT + 0.5) * square_len - support_radius,
                (y as FT + 0.5) * square_len - support_radius,
            );
            integral += cubic_kernel_2d(integration_point.norm(), h) * square_area;
        }
    }

    println!("Integration of 2D cubic kernel with h={:.2}: {}", h, integral);
    crate::assert_ft_approx_eq(integral, 1.0, 0.001, || format!("cubic kernel integral"));
}

#[test]
fn cubic_kernel_2d_matches_closed_form_in_q() {
    let h: FT = 0.05;
    let sigma = 10. / (7. * PI * h * h);
    for &q in &[0., 0.25, 0.5, 0.99, 1.0, 1.5, 1.99, 2.0, 2.5] {
        let expected = if q < 1. {
            sigma * (1. - 1.5 * q * q + 0.75 * q * q * q)
        } else if q < 2. {
            sigma * 0.25 * (2. - q) * (2. - q) * (2. - q)
        } else {
            0.
        };
        crate::assert_ft_approx_eq(cubic_kernel_2d(q * h, h), expected, expected.abs() * 1e-4 + 1e-3, || {
            format!("cubic kernel at q={}", q)
        });
    }
}

#[test]
fn spiky_gradient_matches_finite_differences() {
    use crate::vec2f;

    let support_radius: FT = 1.;
    let eps: FT = 1e-3;
    for &(x, y) in &[(0.3, 0.1), (-0.5, 0.2), (0.1, -0.7), (0.6, 0.6)] {
        let p = vec2f(x, y);
        let grad = spiky_kernel_2d_grad(p, support_radius);
        let dx = (spiky_kernel_2d((p + vec2f(eps, 0.)).norm(), support_radius)
            - spiky_kernel_2d((p - vec2f(eps, 0.)).norm(), support_radius))
            / (2. * eps);
        let dy = (spiky_kernel_2d((p + vec2f(0., eps)).norm(), support_radius)
            - spiky_kernel_2d((p - vec2f(0., eps)).norm(), support_radius))
            / (2. * eps);
        crate::assert_ft_approx_eq(grad.x, dx, 0.01 * dx.abs().max(1.), || format!("spiky d/dx at {:?}", p));
        crate::assert_ft_approx_eq(grad.y, dy, 0.01 * dy.abs().max(1.), || format!("spiky d/dy at {:?}", p));
    }
}

#[test]
fn spiky_gradient_vanishes_for_coincident_particles() {
    assert_eq!(spiky_kernel_2d_grad(V2::zeros(), 0.1), V2::zeros());
}

#[test]
fn viscosity_laplacian_is_non_negative_and_compact() {
    let support_radius = 0.1;
    for i in 0..=20 {
        let r = i as FT * 0.01;
        let l = viscosity_kernel_2d_laplacian(r, support_radius);
        assert!(l >= 0.);
        if r >= support_radius {
            assert_eq!(l, 0.);
        }
    }
}

#[test]
fn cohesion_profile_respects_cutoffs() {
    let profile = CohesionProfile {
        strength: 2.,
        range: 1.,
        falloff: 0.5,
    };
    assert_eq!(profile.magnitude(0.01, 0.05), 0.);
    assert_eq!(profile.magnitude(1.0, 0.05), 0.);
    assert!(profile.magnitude(0.5, 0.05) > profile.magnitude(0.9, 0.05));
    crate::assert_ft_approx_eq(profile.stiffness(0.5, 0.05), profile.magnitude(0.5, 0.05) * 2., 1e-5, || {
        format!("cohesion stiffness")
    });
}
