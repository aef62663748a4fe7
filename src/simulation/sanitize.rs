//! Sanitize-or-default.
//!
//! Every stage of the pipeline repairs non-finite values through these functions instead of
//! asserting. Only the offending entry is replaced, the step always continues.

use crate::{concurrency::par_count_mut1, V2};

#[inline]
pub fn is_finite_vector(v: &V2) -> bool {
    v.x.is_finite() && v.y.is_finite()
}

/// Replaces every vector with a non-finite component by `default`, returns the number of replaced entries.
pub fn sanitize_vectors(values: &mut [V2], default: V2) -> usize {
    par_count_mut1(values, |_, value| {
        if is_finite_vector(value) {
            false
        } else {
            *value = default;
            true
        }
    })
}

#[test]
fn sanitize_vectors_only_touches_broken_entries() {
    use crate::{floating_type_mod::FT, vec2f};

    let mut v = vec![vec2f(1., 2.), vec2f(FT::NAN, 0.), vec2f(0., FT::INFINITY), vec2f(-3., 4.)];
    let repaired = sanitize_vectors(&mut v, V2::zeros());
    assert_eq!(repaired, 2);
    assert_eq!(v, vec![vec2f(1., 2.), V2::zeros(), V2::zeros(), vec2f(-3., 4.)]);
}
