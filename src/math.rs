use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(x, y)| x * y).sum()
}

/// y += a * x
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    izip!(x, y).for_each(|(x, y)| {
        *y += a * x;
    });
}

/// out = a ⊙ b
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn multiply(a: &[f64], b: &[f64], out: &mut [f64]) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(out.len() == n);
    izip!(a, b, out).for_each(|(a, b, out)| {
        *out = a * b;
    });
}

/// out = a - b
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn sub_out(a: &[f64], b: &[f64], out: &mut [f64]) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(out.len() == n);
    izip!(a, b, out).for_each(|(a, b, out)| {
        *out = a - b;
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn scale(x: &mut [f64], a: f64) {
    x.iter_mut().for_each(|x| *x *= a);
}

pub(crate) fn all_finite(x: &[f64]) -> bool {
    x.iter().all(|v| v.is_finite())
}
