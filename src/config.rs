//! Human-facing run configuration.
//!
//! A [`RunConfig`] is read from YAML (with `key=value` overrides on top), validated once with
//! [`RunConfig::validate`], and never mutated afterwards. Every enumerated option is parsed into
//! a closed enum, so an unknown inference mode or init scheme is rejected while the config is
//! being read rather than somewhere inside the run.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::data::DataId;
use crate::error::ConfigError;
use crate::prior::PriorFamily;

/// Inference algorithm requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InferenceMode {
    /// Stochastic-gradient Langevin dynamics.
    Sgld,
    /// Library HMC kernel over the full dataset, without a cyclic schedule.
    Hmc,
    /// Symplectic (Verlet) Langevin integrator.
    VerletSgld,
    /// Stochastic-gradient HMC with momentum.
    OurHmc,
    /// Momentum integrator with a Metropolis-Hastings correction.
    HmcReject,
    /// Verlet integrator with a Metropolis-Hastings correction.
    VerletSgldReject,
}

impl InferenceMode {
    pub const ALL: [InferenceMode; 6] = [
        InferenceMode::Sgld,
        InferenceMode::Hmc,
        InferenceMode::VerletSgld,
        InferenceMode::OurHmc,
        InferenceMode::HmcReject,
        InferenceMode::VerletSgldReject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceMode::Sgld => "SGLD",
            InferenceMode::Hmc => "HMC",
            InferenceMode::VerletSgld => "VerletSGLD",
            InferenceMode::OurHmc => "OurHMC",
            InferenceMode::HmcReject => "HMCReject",
            InferenceMode::VerletSgldReject => "VerletSGLDReject",
        }
    }
}

impl FromStr for InferenceMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InferenceMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownInference(s.to_string()))
    }
}

/// Parameter initialization scheme applied when no checkpoint is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InitMethod {
    He,
    HeUniform,
    HeZeroBias,
    /// Keep the prior draw the model was constructed with.
    Prior,
}

impl InitMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitMethod::He => "he",
            InitMethod::HeUniform => "he_uniform",
            InitMethod::HeZeroBias => "he_zerobias",
            InitMethod::Prior => "prior",
        }
    }
}

impl FromStr for InitMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "he" => Ok(InitMethod::He),
            "he_uniform" => Ok(InitMethod::HeUniform),
            "he_zerobias" => Ok(InitMethod::HeZeroBias),
            "prior" => Ok(InitMethod::Prior),
            other => Err(ConfigError::UnknownInitMethod(other.to_string())),
        }
    }
}

/// Step-size decay applied within each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SamplingDecay {
    /// `lr * (1 + cos(pi * t / T)) / 2`, restarted every cycle.
    Cosine,
    /// Constant step size.
    Flat,
}

impl SamplingDecay {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingDecay::Cosine => "cosine",
            SamplingDecay::Flat => "flat",
        }
    }

    /// Step size at `progress` in `[0, 1)` through the current cycle.
    pub fn step_size(&self, lr: f64, progress: f64) -> f64 {
        match self {
            SamplingDecay::Cosine => lr * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0,
            SamplingDecay::Flat => lr,
        }
    }
}

impl FromStr for SamplingDecay {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(SamplingDecay::Cosine),
            "flat" => Ok(SamplingDecay::Flat),
            other => Err(ConfigError::UnknownDecay(other.to_string())),
        }
    }
}

/// Network architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelKind {
    DenseNet,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::DenseNet => "densenet",
        }
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "densenet" => Ok(ModelKind::DenseNet),
            other => Err(ConfigError::UnknownModel(other.to_string())),
        }
    }
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = ConfigError;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }

            impl From<$ty> for String {
                fn from(value: $ty) -> Self {
                    value.as_str().to_string()
                }
            }

            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

string_conversions!(InferenceMode, InitMethod, SamplingDecay, ModelKind);

/// Parses the enumerated options up front so an unknown name keeps its own error variant
/// instead of being flattened into a serde message.
fn check_enum_fields(mapping: &serde_yaml::Mapping) -> Result<(), ConfigError> {
    let field = |key: &str| mapping.get(key).and_then(serde_yaml::Value::as_str);
    if let Some(name) = field("inference") {
        name.parse::<InferenceMode>()?;
    }
    if let Some(name) = field("init_method") {
        name.parse::<InitMethod>()?;
    }
    if let Some(name) = field("sampling_decay") {
        name.parse::<SamplingDecay>()?;
    }
    if let Some(name) = field("model") {
        name.parse::<ModelKind>()?;
    }
    for key in ["weight_prior", "bias_prior"] {
        if let Some(name) = field(key) {
            name.parse::<PriorFamily>()?;
        }
    }
    Ok(())
}

/// All options of a single sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Dataset identifier, either `<name>` or `synthetic.<name>.<prior>`.
    pub data: String,
    pub inference: InferenceMode,
    pub model: ModelKind,
    /// Hidden layer width.
    pub width: usize,
    /// Number of linear layers.
    pub depth: usize,
    pub weight_prior: PriorFamily,
    pub bias_prior: PriorFamily,
    pub weight_loc: f64,
    pub weight_scale: f64,
    pub bias_loc: f64,
    pub bias_scale: f64,
    /// Observation noise of the Gaussian likelihood (regression only).
    pub noise_std: f64,
    /// Number of posterior samples to collect.
    pub n_samples: usize,
    /// Epochs per cycle run at temperature zero.
    pub warmup: usize,
    /// Epochs per cycle run at the sampling temperature but not collected.
    pub burnin: usize,
    /// Keep one sample every `skip` sampling epochs.
    pub skip: usize,
    /// Record metrics every `metrics_skip` steps.
    pub metrics_skip: usize,
    pub cycles: usize,
    pub temperature: f64,
    pub sampling_decay: SamplingDecay,
    pub momentum: f64,
    /// Refresh the preconditioner every this many epochs; `None` disables preconditioning.
    pub precond_update: Option<usize>,
    pub lr: f64,
    pub init_method: InitMethod,
    /// Samples file to resume from (the last snapshot is used).
    pub load_samples: Option<PathBuf>,
    /// Training batch size; the full training set when unset.
    pub batch_size: Option<usize>,
    pub reject_samples: bool,
    pub save_samples: bool,
    pub progressbar: bool,
    pub seed: u64,
    pub run_id: Option<String>,
    pub log_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data: "toy_regression".to_string(),
            inference: InferenceMode::Sgld,
            model: ModelKind::DenseNet,
            width: 50,
            depth: 3,
            weight_prior: PriorFamily::Gaussian,
            bias_prior: PriorFamily::Gaussian,
            weight_loc: 0.0,
            weight_scale: std::f64::consts::SQRT_2,
            bias_loc: 0.0,
            bias_scale: 1.0,
            noise_std: 1.0,
            n_samples: 1000,
            warmup: 2000,
            burnin: 2000,
            skip: 5,
            metrics_skip: 10,
            cycles: 5,
            temperature: 1.0,
            sampling_decay: SamplingDecay::Cosine,
            momentum: 0.9,
            precond_update: Some(1),
            lr: 5e-4,
            init_method: InitMethod::He,
            load_samples: None,
            batch_size: None,
            reject_samples: false,
            save_samples: true,
            progressbar: true,
            seed: 0,
            run_id: None,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl RunConfig {
    /// Reads a config from YAML text, then applies `key=value` overrides.
    ///
    /// Override values are parsed as YAML scalars, so `--set batch_size=32` yields a number and
    /// `--set load_samples=null` clears an option.
    pub fn from_yaml(text: Option<&str>, overrides: &[String]) -> Result<Self, ConfigError> {
        let mut value = match text {
            Some(text) if !text.trim().is_empty() => serde_yaml::from_str::<serde_yaml::Value>(text)
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
            _ => serde_yaml::Value::Mapping(Default::default()),
        };
        let mapping = value
            .as_mapping_mut()
            .ok_or_else(|| ConfigError::Parse("top level must be a mapping".to_string()))?;
        for item in overrides {
            let (key, raw) = item
                .split_once('=')
                .ok_or_else(|| ConfigError::Override(item.clone()))?;
            let parsed: serde_yaml::Value =
                serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
            mapping.insert(serde_yaml::Value::String(key.trim().to_string()), parsed);
        }
        check_enum_fields(mapping)?;
        serde_yaml::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks every invariant that does not depend on the dataset.
    ///
    /// The `n_samples * skip % cycles` condition is not checked here: the HMC kernel mode has no
    /// cyclic schedule, so that check lives in [`crate::schedule::Schedule::compute`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("width", self.width)?;
        positive("depth", self.depth)?;
        positive("n_samples", self.n_samples)?;
        positive("cycles", self.cycles)?;
        positive("skip", self.skip)?;
        positive("metrics_skip", self.metrics_skip)?;
        if let Some(batch_size) = self.batch_size {
            positive("batch_size", batch_size)?;
        }
        if let Some(precond_update) = self.precond_update {
            positive("precond_update", precond_update)?;
        }
        // Written so that NaN fails too.
        if !(self.temperature >= 0.0) {
            return Err(ConfigError::NegativeTemperature(self.temperature));
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(ConfigError::NonPositive {
                field: "lr",
                value: self.lr.to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::OutOfRange {
                field: "momentum",
                reason: format!("{} is not in [0, 1)", self.momentum),
            });
        }
        for (field, scale) in [
            ("weight_scale", self.weight_scale),
            ("bias_scale", self.bias_scale),
            ("noise_std", self.noise_std),
        ] {
            if !(scale > 0.0 && scale.is_finite()) {
                return Err(ConfigError::NonPositive {
                    field,
                    value: scale.to_string(),
                });
            }
        }
        self.data_id()?;
        Ok(())
    }

    pub fn data_id(&self) -> Result<DataId, ConfigError> {
        self.data.parse()
    }
}

fn positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NonPositive {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        RunConfig::default()
            .validate()
            .expect("default config should validate");
    }

    #[test]
    fn test_inference_mode_names_round_trip() {
        for mode in InferenceMode::ALL {
            assert_eq!(mode.as_str().parse::<InferenceMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_unknown_inference_mode_is_config_error() {
        let err = "NUTS".parse::<InferenceMode>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInference(ref m) if m == "NUTS"));

        let err = RunConfig::from_yaml(Some("inference: NUTS\n"), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInference(ref m) if m == "NUTS"), "got {err:?}");
    }

    #[test]
    fn test_unknown_names_in_yaml_keep_their_variant() {
        let err = RunConfig::from_yaml(None, &["init_method=xavier".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInitMethod(ref m) if m == "xavier"));
        let err = RunConfig::from_yaml(Some("sampling_decay: linear\n"), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDecay(_)), "got {err:?}");
        let err = RunConfig::from_yaml(Some("bias_prior: cauchy\n"), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPrior(ref m) if m == "cauchy"));
        let err = RunConfig::from_yaml(Some("model: resnet\n"), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownModel(_)), "got {err:?}");
    }

    #[test]
    fn test_unknown_init_method_is_config_error() {
        let err = "xavier".parse::<InitMethod>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownInitMethod(_)));
    }

    #[test]
    fn test_yaml_with_overrides() {
        let yaml = "inference: VerletSGLD\nwidth: 8\nbatch_size: 16\n";
        let overrides = vec![
            "width=4".to_string(),
            "batch_size=null".to_string(),
            "init_method=he_zerobias".to_string(),
        ];
        let config = RunConfig::from_yaml(Some(yaml), &overrides).unwrap();
        assert_eq!(config.inference, InferenceMode::VerletSgld);
        assert_eq!(config.width, 4);
        assert_eq!(config.batch_size, None);
        assert_eq!(config.init_method, InitMethod::HeZeroBias);
        // Untouched fields keep their defaults.
        assert_eq!(config.skip, 5);
    }

    #[test]
    fn test_malformed_override() {
        let err = RunConfig::from_yaml(None, &["width".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::Override(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(RunConfig::from_yaml(Some("widht: 3\n"), &[]).is_err());
    }

    #[test]
    fn test_yaml_snapshot_reloads() {
        let mut config = RunConfig::default();
        config.inference = InferenceMode::HmcReject;
        config.batch_size = Some(32);
        let text = config.to_yaml().unwrap();
        assert_eq!(RunConfig::from_yaml(Some(&text), &[]).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<(fn(&mut RunConfig), &str)> = vec![
            (|c| c.width = 0, "width"),
            (|c| c.n_samples = 0, "n_samples"),
            (|c| c.cycles = 0, "cycles"),
            (|c| c.skip = 0, "skip"),
            (|c| c.batch_size = Some(0), "batch_size"),
        ];
        for (mutate, field) in cases {
            let mut config = RunConfig::default();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::NonPositive { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected NonPositive({field}), got {other:?}"),
            }
        }

        let mut config = RunConfig::default();
        config.temperature = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NegativeTemperature(_))
        ));
        config.temperature = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.momentum = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { .. })
        ));

        let mut config = RunConfig::default();
        config.data = "synthetic.toy_regression".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::DataId(_))));
    }

    #[test]
    fn test_zero_temperature_is_valid() {
        let mut config = RunConfig::default();
        config.temperature = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cosine_decay_endpoints() {
        let decay = SamplingDecay::Cosine;
        approx::assert_abs_diff_eq!(decay.step_size(0.1, 0.0), 0.1, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(decay.step_size(0.1, 0.5), 0.05, epsilon = 1e-12);
        assert!(decay.step_size(0.1, 0.999) < 1e-5);
        assert_eq!(SamplingDecay::Flat.step_size(0.1, 0.7), 0.1);
    }
}
