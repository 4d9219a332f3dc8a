//! Warmup must recover the scale of the target distribution in the metric.

use hmc_rs::test_logps::{Ar1NormalLogp, DiagNormalLogp};
use hmc_rs::{Integrator, Kernel, Metric, Sampler, SamplerArgs};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const N_ADAPTS: u64 = 5000;

#[test]
fn diag_metric_recovers_marginal_variances() {
    let mut rng = StdRng::seed_from_u64(1234);
    let dim = 5;
    let sigma2: Box<[f64]> = (0..dim)
        .map(|_| {
            let z: f64 = rng.sample(StandardNormal);
            1. + z.abs()
        })
        .collect();

    let args = SamplerArgs {
        n_adapts: N_ADAPTS,
        ..SamplerArgs::default()
    };
    let mut sampler = Sampler::new(
        DiagNormalLogp::new(sigma2.clone()),
        Metric::diag(vec![1.; dim].into()).unwrap(),
        Kernel::default_nuts(),
        Integrator::leapfrog(0.1).unwrap(),
        args,
        &vec![0.; dim],
        rng,
    )
    .unwrap();

    for _ in 0..N_ADAPTS {
        sampler.draw().unwrap();
    }

    match sampler.metric() {
        Metric::Diag { inv, .. } => {
            for (estimate, truth) in inv.iter().zip(sigma2.iter()) {
                assert!(
                    (estimate - truth).abs() < 0.2 * truth,
                    "estimated {estimate}, expected {truth}"
                );
            }
        }
        other => panic!("unexpected metric {other:?}"),
    }
}

#[test]
fn dense_metric_recovers_covariance() {
    let rng = StdRng::seed_from_u64(4321);
    let dim = 4;
    let rho = 0.7;
    let target = Ar1NormalLogp::new(dim, rho);
    let expected: Vec<f64> = (0..dim)
        .flat_map(|i| (0..dim).map(move |j| (i, j)))
        .map(|(i, j)| Ar1NormalLogp::new(dim, rho).covariance(i, j))
        .collect();

    let args = SamplerArgs {
        n_adapts: N_ADAPTS,
        ..SamplerArgs::default()
    };
    let mut sampler = Sampler::new(
        target,
        Metric::dense(DMatrix::identity(dim, dim)).unwrap(),
        Kernel::default_nuts(),
        Integrator::leapfrog(0.1).unwrap(),
        args,
        &vec![0.; dim],
        rng,
    )
    .unwrap();

    for _ in 0..N_ADAPTS {
        sampler.draw().unwrap();
    }

    match sampler.metric() {
        Metric::Dense { inv, .. } => {
            for i in 0..dim {
                for j in 0..dim {
                    let truth = expected[i * dim + j];
                    let estimate = inv[(i, j)];
                    assert!(
                        (estimate - truth).abs() < 0.25 * truth.abs(),
                        "cov[{i},{j}]: estimated {estimate}, expected {truth}"
                    );
                }
            }
        }
        other => panic!("unexpected metric {other:?}"),
    }
}

#[test]
fn step_size_settles_after_warmup() {
    let rng = StdRng::seed_from_u64(7);
    let dim = 5;
    let args = SamplerArgs {
        n_adapts: 1000,
        ..SamplerArgs::default()
    };
    let mut sampler = Sampler::new(
        DiagNormalLogp::new(vec![1.; dim].into()),
        Metric::diag(vec![1.; dim].into()).unwrap(),
        Kernel::default_nuts(),
        Integrator::leapfrog(0.1).unwrap(),
        args,
        &vec![0.; dim],
        rng,
    )
    .unwrap();

    for _ in 0..1000 {
        sampler.draw().unwrap();
    }
    let committed = sampler.step_size();
    assert!(committed > 1e-3 && committed < 10., "{committed}");

    // Post-warmup draws no longer move the committed step size.
    for _ in 0..10 {
        sampler.draw().unwrap();
    }
    assert_eq!(sampler.step_size(), committed);
}
