/*!
# Run orchestration

[`Experiment::run`] drives one sampling run through a fixed sequence of stages:

```text
Configuring -> DataReady -> ModelReady -> (CheckpointReconciled)? -> (ScheduleComputed)?
            -> Sampling -> SamplesCollected -> Evaluated
```

Every configuration problem, including an indivisible schedule, is reported while still
`Configuring`, before the run directory is created. The metrics and sample sinks are opened
right before the runner is built and closed right after it returns, whatever it returned.
`HMC` runs skip `ScheduleComputed`; they have no cyclic schedule.
*/

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use burn::tensor::backend::AutodiffBackend;
use rand::prelude::*;
use tracing::{info, warn};

use crate::artifacts::ArtifactDir;
use crate::checkpoint::{load_samples, reconcile, ReconcileWarning, Reconciled};
use crate::config::RunConfig;
use crate::data::{DataId, DataLoader, DataSource, Dataset, DatasetProvider, LoaderPlan, SyntheticData};
use crate::error::RunError;
use crate::evaluate::{evaluate_model, EvalSummary};
use crate::model::{get_model, ModelSpec, PosteriorModel};
use crate::params::ParamStore;
use crate::runner::{
    CyclicHyper, CyclicRunner, CyclicVariant, KernelSpec, Mcmc, Runner, RunnerSpec, SamplingRunner,
};
use crate::schedule::Schedule;
use crate::sinks::{self, CsvMetrics, SampleSaver};

pub const CONFIG_ARTIFACT: &str = "config.yaml";
pub const METRICS_ARTIFACT: &str = "metrics.csv";
pub const SAMPLES_ARTIFACT: &str = "samples.jsonl";
pub const RESULT_ARTIFACT: &str = "result.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Configuring,
    DataReady,
    ModelReady,
    CheckpointReconciled,
    ScheduleComputed,
    Sampling,
    SamplesCollected,
    Evaluated,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub artifact_dir: PathBuf,
    pub evaluation: EvalSummary,
    /// Mismatches found while resuming from a checkpoint.
    pub warnings: Vec<ReconcileWarning>,
    /// Stages the run went through, in order.
    pub stages: Vec<RunStage>,
}

/// Runner choice with everything it needs that can be derived from the config alone.
#[derive(Debug, Clone, Copy)]
enum Plan {
    Cyclic(CyclicVariant, Schedule),
    Kernel(KernelSpec),
}

/// A single sampling run.
pub struct Experiment<'p, B: AutodiffBackend> {
    config: RunConfig,
    provider: &'p dyn DatasetProvider,
    device: B::Device,
    stages: Vec<RunStage>,
}

impl<'p, B: AutodiffBackend> Experiment<'p, B> {
    pub fn new(config: RunConfig, provider: &'p dyn DatasetProvider, device: B::Device) -> Self {
        Self {
            config,
            provider,
            device,
            stages: Vec::new(),
        }
    }

    fn enter(&mut self, stage: RunStage) {
        info!(%stage, "run stage");
        self.stages.push(stage);
    }

    /// Runs to completion and returns the evaluation of the collected samples.
    pub fn run(mut self) -> Result<RunReport, RunError> {
        self.enter(RunStage::Configuring);
        let config = self.config.clone();
        config.validate()?;
        let data_id = config.data_id()?;
        let plan = match RunnerSpec::select(config.inference) {
            RunnerSpec::Cyclic(variant) => Plan::Cyclic(
                variant,
                Schedule::compute(
                    config.n_samples,
                    config.skip,
                    config.cycles,
                    config.warmup,
                    config.burnin,
                )?,
            ),
            RunnerSpec::Kernel(spec) => Plan::Kernel(spec),
        };

        B::seed(config.seed);
        let run_id = config
            .run_id
            .clone()
            .unwrap_or_else(|| format!("{:032x}", rand::random::<u128>()));
        let artifacts = ArtifactDir::create(&config.log_dir, &run_id)?;
        artifacts.write_text(CONFIG_ARTIFACT, &config.to_yaml()?)?;
        info!(run_id = %run_id, dir = %artifacts.path().display(), inference = %config.inference, "starting run");

        let dataset = self.load_dataset(&data_id, &artifacts)?;
        info!(
            dataset = %dataset.name,
            train = dataset.train.len(),
            test = dataset.test.len(),
            "dataset loaded"
        );
        self.enter(RunStage::DataReady);

        let mut rng = SmallRng::seed_from_u64(config.seed);
        let spec = ModelSpec::from_config(&config, &dataset);
        let mut model = get_model::<B>(config.model, spec, &self.device, &mut rng)?;
        let mut warnings = Vec::new();
        match &config.load_samples {
            None => {
                model.initialize(config.init_method, &mut rng)?;
                self.enter(RunStage::ModelReady);
            }
            Some(path) => {
                self.enter(RunStage::ModelReady);
                let loaded = load_samples(path, -1)?;
                let Reconciled { store, warnings: found } = reconcile(&model.state_dict()?, loaded);
                for warning in &found {
                    warn!(%warning, "checkpoint mismatch");
                }
                model.load_state_dict(&store)?;
                warnings = found;
                info!(path = %path.display(), "resumed from checkpoint");
                self.enter(RunStage::CheckpointReconciled);
            }
        }

        if let Plan::Cyclic(_, schedule) = &plan {
            info!(
                sample_epochs = schedule.sample_epochs,
                epochs_per_cycle = schedule.epochs_per_cycle,
                cycles = schedule.cycles,
                "schedule"
            );
            self.enter(RunStage::ScheduleComputed);
        }

        let loaders = LoaderPlan::resolve(
            config.batch_size,
            dataset.train.len(),
            dataset.test.len(),
            dataset.train.as_tensor_dataset().is_some(),
        )?;

        self.enter(RunStage::Sampling);
        let samples = sinks::scoped(
            || CsvMetrics::create(&artifacts.sneaky_artifact(METRICS_ARTIFACT)),
            || SampleSaver::open(&artifacts.sneaky_artifact(SAMPLES_ARTIFACT), config.save_samples),
            |metrics, sample_sink| -> Result<Vec<ParamStore>, RunError> {
                let train = DataLoader::new(
                    Arc::clone(&dataset.train),
                    loaders.train_batch_size,
                    true,
                    loaders.num_workers,
                    config.seed,
                )?;
                let mut runner = match plan {
                    Plan::Cyclic(variant, schedule) => {
                        let test = DataLoader::new(
                            Arc::clone(&dataset.test),
                            loaders.test_batch_size,
                            false,
                            loaders.num_workers,
                            config.seed,
                        )?;
                        Runner::Cyclic(CyclicRunner::new(
                            &mut model,
                            train,
                            test,
                            schedule,
                            cyclic_hyper(&config),
                            variant,
                            metrics,
                            sample_sink,
                        ))
                    }
                    Plan::Kernel(spec) => Runner::Kernel(Mcmc::new(
                        &mut model,
                        spec,
                        &train,
                        config.warmup,
                        config.n_samples,
                        config.seed,
                    )?),
                };
                runner.run(config.progressbar)?;
                Ok(runner.get_samples().to_vec())
            },
        )?;
        model.eval();
        info!(samples = samples.len(), "sampling finished");
        self.enter(RunStage::SamplesCollected);

        let test = DataLoader::new(
            Arc::clone(&dataset.test),
            loaders.eval_batch_size,
            false,
            loaders.num_workers,
            config.seed,
        )?;
        let evaluation = evaluate_model(&model, &test, &samples)?;
        artifacts.write_json(RESULT_ARTIFACT, &evaluation)?;
        info!(
            lp_ensemble = evaluation.lp_ensemble,
            lp_mean = evaluation.lp_mean,
            "evaluation finished"
        );
        self.enter(RunStage::Evaluated);

        Ok(RunReport {
            run_id,
            artifact_dir: artifacts.path().to_path_buf(),
            evaluation,
            warnings,
            stages: self.stages,
        })
    }

    /// Looks the dataset up, relabeling it with a prior draw for synthetic identifiers.
    fn load_dataset(&self, id: &DataId, artifacts: &ArtifactDir) -> Result<Dataset, RunError> {
        let base = self.provider.dataset(id.base())?;
        base.check()?;
        match id {
            DataId::Named(_) => Ok(base),
            DataId::Synthetic { prior, .. } => {
                let spec = ModelSpec::from_config(&self.config, &base);
                let synthetic = SyntheticData::generate::<B>(
                    &base,
                    *prior,
                    self.config.model,
                    spec,
                    &self.device,
                    self.config.seed,
                )?;
                synthetic.persist(artifacts)?;
                info!(dataset = %synthetic.dataset.name, "generated synthetic labels");
                Ok(synthetic.dataset)
            }
        }
    }
}

fn cyclic_hyper(config: &RunConfig) -> CyclicHyper {
    CyclicHyper {
        lr: config.lr,
        skip: config.skip,
        metrics_skip: config.metrics_skip,
        sampling_decay: config.sampling_decay,
        temperature: config.temperature,
        momentum: config.momentum,
        precond_update: config.precond_update,
        reject_samples: config.reject_samples,
        seed: config.seed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ToyDatasets;
    use crate::error::ConfigError;
    use burn::backend::{ndarray::NdArrayDevice, Autodiff, NdArray};

    type B = Autodiff<NdArray>;

    fn config(dir: &std::path::Path) -> RunConfig {
        RunConfig {
            width: 4,
            depth: 2,
            n_samples: 2,
            warmup: 1,
            burnin: 0,
            skip: 1,
            cycles: 1,
            metrics_skip: 1,
            lr: 1e-3,
            progressbar: false,
            run_id: Some("unit".to_string()),
            log_dir: dir.to_path_buf(),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ToyDatasets::new(16, 6, 0);
        let report = Experiment::<B>::new(config(dir.path()), &provider, NdArrayDevice::Cpu)
            .run()
            .unwrap();
        assert_eq!(
            report.stages,
            vec![
                RunStage::Configuring,
                RunStage::DataReady,
                RunStage::ModelReady,
                RunStage::ScheduleComputed,
                RunStage::Sampling,
                RunStage::SamplesCollected,
                RunStage::Evaluated,
            ]
        );
        assert_eq!(report.evaluation.n_samples, 2);
        assert_eq!(report.run_id, "unit");
        for name in [CONFIG_ARTIFACT, METRICS_ARTIFACT, SAMPLES_ARTIFACT, RESULT_ARTIFACT] {
            assert!(report.artifact_dir.join(name).is_file(), "{name} missing");
        }
    }

    #[test]
    fn test_config_error_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ToyDatasets::new(16, 6, 0);
        let mut bad = config(dir.path());
        bad.temperature = -1.0;
        let err = Experiment::<B>::new(bad, &provider, NdArrayDevice::Cpu)
            .run()
            .unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::NegativeTemperature(_))));
        assert!(!dir.path().join("unit").exists());
    }

    #[test]
    fn test_unknown_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ToyDatasets::new(16, 6, 0);
        let mut cfg = config(dir.path());
        cfg.data = "mnist".to_string();
        let err = Experiment::<B>::new(cfg, &provider, NdArrayDevice::Cpu)
            .run()
            .unwrap_err();
        assert!(matches!(err, RunError::Data(_)), "{err:?}");
    }

    #[test]
    fn test_random_run_ids_are_hex() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ToyDatasets::new(16, 6, 0);
        let mut cfg = config(dir.path());
        cfg.run_id = None;
        cfg.save_samples = false;
        let report = Experiment::<B>::new(cfg, &provider, NdArrayDevice::Cpu)
            .run()
            .unwrap();
        assert_eq!(report.run_id.len(), 32);
        assert!(report.run_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!report.artifact_dir.join(SAMPLES_ARTIFACT).exists());
    }
}
