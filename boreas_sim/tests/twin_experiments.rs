// boreas_sim/tests/twin_experiments.rs
//
// End-to-end properties of the full forecast/analysis cycle on
// linear-Gaussian problems, where the exact Kalman filter provides the
// ground truth to converge to.

use boreas_core::chronology::Chronology;
use boreas_core::localize::StateGrid;
use boreas_core::methods::{EnKfConfig, KalmanFilter, Method};
use boreas_core::models::{GaussianRv, LinearDynamics, LinearObservation};
use boreas_core::types::RunStatus;
use boreas_sim::batch::{run_batch, seed_sweep};
use boreas_sim::diagnostics::{ChannelSink, NullSink, Phase};
use boreas_sim::runner::{CancelToken, RunOptions, TwinExperiment};
use boreas_sim::scenario::Scenario;

use nalgebra::{DMatrix, DVector};

fn random_walk_hmm(q_var: f64, r_var: f64, chronology: Chronology) -> boreas_core::hmm::Hmm {
    let model_noise = if q_var > 0.0 {
        Some(GaussianRv::centered(1, q_var).unwrap())
    } else {
        None
    };
    boreas_core::hmm::Hmm::new(
        chronology,
        Box::new(LinearDynamics::identity(1)),
        Box::new(LinearObservation::identity(1)),
        GaussianRv::centered(1, 1.0).unwrap(),
        model_noise,
        GaussianRv::centered(1, r_var).unwrap(),
        Some(StateGrid::line(1)),
    )
    .unwrap()
}

/// Replays the exact Kalman filter over the experiment's observations.
fn exact_kalman_means(experiment: &TwinExperiment, q_var: f64, r_var: f64) -> Vec<f64> {
    let chronology = &experiment.hmm().chronology;
    let mut kf = KalmanFilter::new(DVector::zeros(1), DMatrix::from_element(1, 1, 1.0));
    let m = DMatrix::identity(1, 1);
    let q = DMatrix::from_element(1, 1, q_var);
    let r = DMatrix::from_element(1, 1, r_var);
    let h = DMatrix::identity(1, 1);

    let mut means = Vec::new();
    for tick in chronology.steps() {
        kf.forecast(&m, if q_var > 0.0 { Some(&q) } else { None });
        if let Some(ko) = tick.obs {
            kf.analyse(&h, &r, experiment.observations().at(ko));
            means.push(kf.mean()[0]);
        }
    }
    means
}

/// Spec property: for the linear-Gaussian random walk (`Q = 0.1`, `R = 1`),
/// the EnKF analysis mean with N = 1000 stays within 0.05 of the exact
/// Kalman mean after 20 cycles, for both the stochastic and the
/// deterministic update.
#[test]
fn enkf_mean_converges_to_exact_kalman_mean() {
    let chronology = Chronology::new(1.0, 1, 20).unwrap();
    let hmm = random_walk_hmm(0.1, 1.0, chronology);

    // The stochastic filter needs the large ensemble to tame its sampling
    // noise; the deterministic square root converges much faster, so a
    // smaller N keeps its (N x N) transform affordable.
    for (config, n_members) in [(EnKfConfig::pert_obs(), 1000), (EnKfConfig::sqrt(), 400)] {
        let experiment = TwinExperiment::new(
            hmm.clone(),
            Method::EnKf(config),
            RunOptions::new(1234, n_members),
        )
        .unwrap();
        let kalman_means = exact_kalman_means(&experiment, 0.1, 1.0);

        // The analysis means stream out through the diagnostics channel.
        let (sink, rx) = ChannelSink::new(1024);
        let record = experiment.run(&sink, &CancelToken::new());
        assert_eq!(record.status, RunStatus::Completed);

        let analysis_means: Vec<f64> = rx
            .try_iter()
            .filter(|snap| snap.phase == Phase::Analysis)
            .map(|snap| snap.ensemble_mean[0])
            .collect();
        assert_eq!(analysis_means.len(), 20);

        let final_diff = (analysis_means[19] - kalman_means[19]).abs();
        assert!(
            final_diff < 0.05,
            "{:?}: |EnKF mean - KF mean| = {final_diff} after 20 cycles",
            config.variant
        );
    }
}

/// Spec scenario: dt = 0.05, 200 steps, an observation every 4 steps,
/// identity model with Q = 0, R = 1, N = 50. Pooled over many independent
/// experiments, the analysis RMS error over the last 25 observation times
/// must sit within 15% of the exact Kalman filter's error standard
/// deviation for the same cycle.
#[test]
fn end_to_end_error_matches_kalman_steady_state() {
    let chronology = Chronology::new(0.05, 4, 200).unwrap();
    let hmm = random_walk_hmm(0.0, 1.0, chronology);
    let method = Method::EnKf(EnKfConfig::sqrt());

    let seeds: Vec<u64> = (0..128).collect();
    let entries = seed_sweep(&hmm, &method, RunOptions::new(0, 50), &seeds).unwrap();
    let records = run_batch(&entries, &CancelToken::new());

    // Pool squared analysis errors over the last 25 observation times.
    let mut total = 0.0;
    let mut count = 0usize;
    for (_, record) in &records {
        assert_eq!(record.status, RunStatus::Completed);
        for ko in 25..50 {
            let e = record.stats.rmse_a.get(ko);
            assert!(e.is_finite());
            total += e * e;
            count += 1;
        }
    }
    let empirical_rms = (total / count as f64).sqrt();

    // Exact filter: with Q = 0 the analysis variance after k observations
    // of unit noise is 1 / (1 + k); average it over the scored window.
    let theoretical: f64 = (26..=50).map(|k| 1.0 / (1.0 + k as f64)).sum::<f64>() / 25.0;
    let theoretical_rms = theoretical.sqrt();

    let ratio = empirical_rms / theoretical_rms;
    assert!(
        (0.85..=1.15).contains(&ratio),
        "pooled analysis rms {empirical_rms} vs kalman {theoretical_rms} (ratio {ratio})"
    );
}

/// Spec property: identical spec + configuration + seed reproduce the
/// truth, the observations and every statistic bit-for-bit.
#[test]
fn runs_are_bitwise_reproducible() {
    let chronology = Chronology::new(0.1, 2, 40).unwrap();
    let hmm = random_walk_hmm(0.05, 0.5, chronology);
    let method = Method::EnKf(EnKfConfig::pert_obs());

    let a = TwinExperiment::new(hmm.clone(), method.clone(), RunOptions::new(99, 20)).unwrap();
    let b = TwinExperiment::new(hmm.clone(), method.clone(), RunOptions::new(99, 20)).unwrap();

    assert_eq!(a.truth(), b.truth());
    assert_eq!(a.observations(), b.observations());

    let record_a = a.run(&NullSink, &CancelToken::new());
    let record_b = b.run(&NullSink, &CancelToken::new());
    assert_eq!(record_a.stats.rmse_f, record_b.stats.rmse_f);
    assert_eq!(record_a.stats.rmse_a, record_b.stats.rmse_a);
    assert_eq!(record_a.stats.rmse_u, record_b.stats.rmse_u);
    assert_eq!(record_a.stats.obs_loglik, record_b.stats.obs_loglik);

    // A different instance id must decorrelate the filter stream while the
    // truth stays the seed's.
    let c = TwinExperiment::new(
        hmm,
        method,
        RunOptions::new(99, 20).with_instance(1),
    )
    .unwrap();
    assert_eq!(a.truth(), c.truth());
    let record_c = c.run(&NullSink, &CancelToken::new());
    assert_ne!(record_a.stats.rmse_a, record_c.stats.rmse_a);
}

/// The shipped scenario files load, build and complete.
#[test]
fn shipped_scenarios_run_to_completion() {
    for name in [
        "etkf_random_walk.toml",
        "letkf_ring.toml",
        "pf_random_walk.toml",
    ] {
        let path = std::path::Path::new("../scenarios").join(name);
        let scenario = Scenario::from_file(&path).unwrap_or_else(|e| panic!("{name}: {e}"));
        let experiment = scenario.build().unwrap_or_else(|e| panic!("{name}: {e}"));
        let record = experiment.run(&NullSink, &CancelToken::new());
        assert_eq!(record.status, RunStatus::Completed, "{name}");
        // The filter should beat the raw observation error by the end.
        let late_rmse = record.stats.rmse_a.mean_over_last(0.25);
        assert!(late_rmse.is_finite(), "{name}: no usable analysis rmse");
    }
}

/// The whole method family survives a nontrivial cycled experiment and
/// produces usable statistics.
#[test]
fn every_method_completes_a_cycled_run() {
    use boreas_core::methods::{
        EnKfNConfig, EsMdaConfig, IEnKsConfig, LetkfConfig, NetfConfig, PfConfig, RhfConfig,
    };
    use boreas_core::localize::Taper;

    let chronology = Chronology::new(0.1, 2, 60).unwrap();
    let hmm = random_walk_hmm(0.05, 0.5, chronology);

    let methods = vec![
        Method::EnKf(EnKfConfig::pert_obs()),
        Method::EnKf(EnKfConfig::sqrt()),
        Method::EnKf(EnKfConfig {
            variant: boreas_core::methods::EnKfVariant::DEnKf,
            infl: 1.0,
            rotate: false,
        }),
        Method::EnKfN(EnKfNConfig::default()),
        Method::Letkf(LetkfConfig {
            radius: 2.0,
            taper: Taper::GaspariCohn,
            infl: 1.0,
            rotate: false,
        }),
        Method::IEnKs(IEnKsConfig::default()),
        Method::EsMda(EsMdaConfig::default()),
        Method::ParticleFilter(PfConfig {
            jitter: 0.2,
            ..PfConfig::default()
        }),
        Method::Netf(NetfConfig::default()),
        Method::Rhf(RhfConfig::default()),
    ];

    for method in methods {
        let name = method.name();
        let experiment =
            TwinExperiment::new(hmm.clone(), method, RunOptions::new(17, 30)).unwrap();
        let record = experiment.run(&NullSink, &CancelToken::new());
        assert_eq!(record.status, RunStatus::Completed, "{name}");
        let rmse = record.stats.rmse_a.mean_over_last(0.5);
        assert!(rmse.is_finite(), "{name}: rmse not finite");
        // Sanity: assimilation keeps the error of the same order as the
        // observation noise, far below divergence.
        assert!(rmse < 3.0, "{name}: rmse {rmse} unreasonably large");
    }
}
