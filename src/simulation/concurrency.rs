//! Per-particle loop helpers.
//!
//! Every closure only writes the element it is handed, so the sequential and the `rayon`
//! variant produce identical results. The default build is sequential.

pub use internal::*;

#[cfg(not(feature = "parallel"))]
mod internal {
    pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
        arr1.iter_mut().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    /// Runs `f` on every element and counts how often it returned `true`.
    pub fn par_count_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) -> bool + Send + Sync>(
        arr1: &mut [T1],
        f: F,
    ) -> usize {
        arr1.iter_mut()
            .enumerate()
            .map(|(idx, v1)| f(idx, v1) as usize)
            .sum()
    }
}

#[cfg(feature = "parallel")]
mod internal {
    use rayon::prelude::*;

    pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
        arr1.into_par_iter().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    pub fn par_count_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) -> bool + Send + Sync>(
        arr1: &mut [T1],
        f: F,
    ) -> usize {
        arr1.into_par_iter()
            .enumerate()
            .map(|(idx, v1)| f(idx, v1) as usize)
            .sum()
    }
}

#[test]
fn par_count_counts_true_results() {
    let mut values = vec![1, -2, 3, -4, 5];
    let negatives = par_count_mut1(&mut values, |_, v| {
        if *v < 0 {
            *v = 0;
            true
        } else {
            false
        }
    });
    assert_eq!(negatives, 2);
    assert_eq!(values, vec![1, 0, 3, 0, 5]);
}
