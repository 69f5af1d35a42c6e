// boreas_sim/src/batch.rs
//
// Batches of independent experiments: different seeds, different methods,
// different scenarios. Instances share nothing mutable (each owns its HMM,
// truth, ensemble and stats), so the batch is embarrassingly parallel and
// one diverging run can never take its siblings down.

use rayon::prelude::*;
use tracing::info;

use boreas_core::errors::ConfigError;
use boreas_core::hmm::Hmm;
use boreas_core::methods::Method;

use crate::diagnostics::NullSink;
use crate::runner::{CancelToken, RunOptions, RunRecord, TwinExperiment};

/// One labelled experiment of a batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub label: String,
    pub experiment: TwinExperiment,
}

/// Runs every entry, in parallel, returning one record per entry in the
/// input order. Divergence or cancellation of one entry is reported in its
/// record; the others are unaffected.
pub fn run_batch(entries: &[BatchEntry], cancel: &CancelToken) -> Vec<(String, RunRecord)> {
    info!(count = entries.len(), "running batch");
    entries
        .par_iter()
        .map(|entry| {
            let record = entry.experiment.run(&NullSink, cancel);
            (entry.label.clone(), record)
        })
        .collect()
}

/// Same HMM and truth seed, one entry per method: the classic benchmark
/// table. Instance ids keep the filter streams distinct per entry.
pub fn method_comparison(
    hmm: &Hmm,
    methods: &[(String, Method)],
    options: RunOptions,
) -> Result<Vec<BatchEntry>, ConfigError> {
    methods
        .iter()
        .enumerate()
        .map(|(i, (label, method))| {
            let entry_options = options.with_instance(i as u64);
            Ok(BatchEntry {
                label: label.clone(),
                experiment: TwinExperiment::new(hmm.clone(), method.clone(), entry_options)?,
            })
        })
        .collect()
}

/// Same HMM and method, one entry per seed: sampling-error statistics.
pub fn seed_sweep(
    hmm: &Hmm,
    method: &Method,
    options: RunOptions,
    seeds: &[u64],
) -> Result<Vec<BatchEntry>, ConfigError> {
    seeds
        .iter()
        .map(|&seed| {
            let mut entry_options = options;
            entry_options.seed = seed;
            Ok(BatchEntry {
                label: format!("seed-{seed}"),
                experiment: TwinExperiment::new(hmm.clone(), method.clone(), entry_options)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use boreas_core::chronology::Chronology;
    use boreas_core::localize::StateGrid;
    use boreas_core::methods::EnKfConfig;
    use boreas_core::models::{GaussianRv, LinearDynamics, LinearObservation};
    use boreas_core::types::RunStatus;

    fn small_hmm() -> Hmm {
        Hmm::new(
            Chronology::new(0.1, 2, 10).unwrap(),
            Box::new(LinearDynamics::identity(1)),
            Box::new(LinearObservation::identity(1)),
            GaussianRv::centered(1, 1.0).unwrap(),
            Some(GaussianRv::centered(1, 0.05).unwrap()),
            GaussianRv::centered(1, 0.5).unwrap(),
            Some(StateGrid::line(1)),
        )
        .unwrap()
    }

    #[test]
    fn seed_sweep_runs_all_entries() {
        let hmm = small_hmm();
        let method = Method::EnKf(EnKfConfig::sqrt());
        let entries =
            seed_sweep(&hmm, &method, RunOptions::new(0, 10), &[1, 2, 3, 4]).unwrap();
        let records = run_batch(&entries, &CancelToken::new());
        assert_eq!(records.len(), 4);
        for (label, record) in &records {
            assert!(label.starts_with("seed-"));
            assert_eq!(record.status, RunStatus::Completed);
        }
    }

    #[test]
    fn truth_is_shared_across_method_comparison() {
        let hmm = small_hmm();
        let methods = vec![
            ("etkf".to_string(), Method::EnKf(EnKfConfig::sqrt())),
            ("enkf".to_string(), Method::EnKf(EnKfConfig::pert_obs())),
        ];
        let entries = method_comparison(&hmm, &methods, RunOptions::new(5, 10)).unwrap();
        assert_eq!(
            entries[0].experiment.truth(),
            entries[1].experiment.truth()
        );
        assert_eq!(
            entries[0].experiment.observations(),
            entries[1].experiment.observations()
        );
    }

    #[test]
    fn one_diverging_entry_does_not_poison_the_batch() {
        let healthy = small_hmm();
        let explosive = Hmm::new(
            Chronology::new(0.1, 2, 10).unwrap(),
            Box::new(LinearDynamics::scaling(1, 100.0)),
            Box::new(LinearObservation::identity(1)),
            GaussianRv::centered(1, 1.0).unwrap(),
            None,
            GaussianRv::centered(1, 0.5).unwrap(),
            None,
        )
        .unwrap();

        let method = Method::EnKf(EnKfConfig::sqrt());
        let mut options = RunOptions::new(3, 8);
        options.divergence_bound = 1e6;
        let entries = vec![
            BatchEntry {
                label: "healthy".to_string(),
                experiment: TwinExperiment::new(healthy, method.clone(), options).unwrap(),
            },
            BatchEntry {
                label: "explosive".to_string(),
                experiment: TwinExperiment::new(explosive, method, options).unwrap(),
            },
        ];
        let records = run_batch(&entries, &CancelToken::new());
        assert_eq!(records[0].1.status, RunStatus::Completed);
        assert!(matches!(records[1].1.status, RunStatus::Diverged { .. }));
    }
}
