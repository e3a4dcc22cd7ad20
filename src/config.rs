//! Configuration document & validation
//!
//! All run-time knobs as a serde document (JSON on disk). Validation happens
//! before any domain bring-up: a relaxation time at or below 1/2, a kernel
//! wired to the wrong lattice, or an unavailable wall treatment are all
//! setup errors that abort before the time loop starts.

use serde::{Deserialize, Serialize};

use crate::boundaries::{IoletDescriptor, IoletKind, TimeSeries, ValueSource};
use crate::domain::SetupError;
use crate::streamers::{IoletPolicy, StreamerPolicies, WallPolicy};
use crate::LbmParameters;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("kernel {kernel} requires the {lattice} lattice")]
    KernelLatticeMismatch { kernel: &'static str, lattice: &'static str },
    #[error("convergence tolerance must be positive (got {0})")]
    BadTolerance(f64),
    #[error("steps per cycle must be positive")]
    ZeroStepsPerCycle,
    #[error("iolet {index}: {source}")]
    IoletSource { index: usize, source: crate::boundaries::TimeSeriesError },
    #[error("iolet {index}: cannot read time series {path}: {message}")]
    IoletFile { index: usize, path: String, message: String },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Velocity-set selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatticeKind {
    D3Q15,
    D3Q19,
    D3Q27,
}

/// Collision-operator selection, with rheology baked into the variant name
/// for the non-Newtonian family.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelKind {
    Lbgk,
    Mrt,
    Trt,
    EntropicAnsumali,
    EntropicChik,
    LbgkCarreauYasuda,
    LbgkCasson,
    LbgkTruncatedPowerLaw,
    GuoForcingLbgk,
}

/// Wall-link treatment selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WallBoundary {
    SimpleBounceBack,
    Bfl,
    GuoZhengShi,
    JunkYang,
}

/// Iolet-link treatment selection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoletBoundary {
    NashZerothOrderPressure,
    LaddIolet,
    Outflow,
    OutflowBounceBack,
}

/// Value source for one iolet, in lattice units (the external unit
/// converter has already been applied).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    Cosine { mean: f64, amplitude: f64, phase: f64, period: f64 },
    TimeSeries { path: String },
}

/// One iolet declaration: position/normal in lattice coordinates,
/// imposed quantity, value source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IoletConfig {
    pub pressure: bool,
    pub normal: [f64; 3],
    pub position: [f64; 3],
    pub source: SourceConfig,
}

impl IoletConfig {
    fn to_descriptor(&self, index: usize) -> Result<IoletDescriptor, ConfigError> {
        let source = match &self.source {
            SourceConfig::Cosine { mean, amplitude, phase, period } => ValueSource::Cosine {
                mean: *mean,
                amplitude: *amplitude,
                phase: *phase,
                period: *period,
            },
            SourceConfig::TimeSeries { path } => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ConfigError::IoletFile {
                        index,
                        path: path.clone(),
                        message: e.to_string(),
                    }
                })?;
                let series = TimeSeries::parse(&text)
                    .map_err(|source| ConfigError::IoletSource { index, source })?;
                ValueSource::TimeSeries(series)
            }
        };
        Ok(IoletDescriptor {
            kind: if self.pressure { IoletKind::Pressure } else { IoletKind::Velocity },
            normal: self.normal,
            position: self.position,
            source,
        })
    }
}

/// The full configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub lattice: LatticeKind,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    pub tau: f64,
    #[serde(default)]
    pub force: [f64; 3],
    #[serde(default = "default_voxel_size")]
    pub voxel_size: f64,
    #[serde(default = "default_time_step")]
    pub time_step: f64,
    #[serde(default = "default_fluid_density")]
    pub fluid_density: f64,
    pub kernel: KernelKind,
    pub wall_boundary: WallBoundary,
    pub iolet_boundary: IoletBoundary,
    #[serde(default)]
    pub check_convergence: bool,
    #[serde(default = "default_tolerance")]
    pub convergence_tolerance: f64,
    #[serde(default)]
    pub reset_on_instability: bool,
    pub steps_per_cycle: u64,
    pub max_steps: u64,
    #[serde(default)]
    pub inlets: Vec<IoletConfig>,
    #[serde(default)]
    pub outlets: Vec<IoletConfig>,
}

fn default_block_size() -> usize {
    8
}
fn default_voxel_size() -> f64 {
    1.0
}
fn default_time_step() -> f64 {
    1.0
}
fn default_fluid_density() -> f64 {
    crate::DEFAULT_FLUID_DENSITY
}
fn default_tolerance() -> f64 {
    1e-9
}

impl SimulationConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject anything the core cannot run with, before bring-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tau <= 0.5 {
            return Err(SetupError::BadRelaxationTime(self.tau).into());
        }
        if self.wall_boundary == WallBoundary::JunkYang {
            // The scheme is specified only by reference to an implicit
            // per-site solver; refusing beats wrong physics.
            return Err(SetupError::UnsupportedWallTreatment("JunkYang").into());
        }
        if self.kernel == KernelKind::Mrt && self.lattice != LatticeKind::D3Q15 {
            return Err(ConfigError::KernelLatticeMismatch {
                kernel: "Mrt",
                lattice: "D3Q15",
            });
        }
        if self.check_convergence && self.convergence_tolerance <= 0.0 {
            return Err(ConfigError::BadTolerance(self.convergence_tolerance));
        }
        if self.steps_per_cycle == 0 {
            return Err(ConfigError::ZeroStepsPerCycle);
        }
        Ok(())
    }

    /// Lattice-unit parameter bundle for the kernels.
    pub fn lbm_parameters(&self) -> LbmParameters {
        LbmParameters {
            tau: self.tau,
            force: self.force,
            voxel_size: self.voxel_size,
            time_step: self.time_step,
            fluid_density: self.fluid_density,
        }
    }

    /// The configured streamer policy pair. Call after `validate`.
    pub fn streamer_policies(&self) -> Result<StreamerPolicies, ConfigError> {
        let wall = match self.wall_boundary {
            WallBoundary::SimpleBounceBack => WallPolicy::SimpleBounceBack,
            WallBoundary::Bfl => WallPolicy::Bfl,
            WallBoundary::GuoZhengShi => WallPolicy::GuoZhengShi,
            WallBoundary::JunkYang => {
                return Err(SetupError::UnsupportedWallTreatment("JunkYang").into())
            }
        };
        let iolet = match self.iolet_boundary {
            IoletBoundary::NashZerothOrderPressure => IoletPolicy::NashZerothOrderPressure,
            IoletBoundary::LaddIolet => IoletPolicy::Ladd,
            IoletBoundary::Outflow => IoletPolicy::Outflow,
            IoletBoundary::OutflowBounceBack => IoletPolicy::OutflowBounceBack,
        };
        Ok(StreamerPolicies { wall, iolet })
    }

    /// Materialise the iolet descriptors (reads any time-series files).
    pub fn iolet_descriptors(
        &self,
    ) -> Result<(Vec<IoletDescriptor>, Vec<IoletDescriptor>), ConfigError> {
        let inlets = self
            .inlets
            .iter()
            .enumerate()
            .map(|(i, c)| c.to_descriptor(i))
            .collect::<Result<Vec<_>, _>>()?;
        let outlets = self
            .outlets
            .iter()
            .enumerate()
            .map(|(i, c)| c.to_descriptor(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((inlets, outlets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> SimulationConfig {
        SimulationConfig {
            lattice: LatticeKind::D3Q15,
            block_size: 8,
            tau: 1.0,
            force: [0.0; 3],
            voxel_size: 1.0,
            time_step: 1.0,
            fluid_density: crate::DEFAULT_FLUID_DENSITY,
            kernel: KernelKind::Lbgk,
            wall_boundary: WallBoundary::SimpleBounceBack,
            iolet_boundary: IoletBoundary::NashZerothOrderPressure,
            check_convergence: false,
            convergence_tolerance: 1e-9,
            reset_on_instability: true,
            steps_per_cycle: 1000,
            max_steps: 1000,
            inlets: Vec::new(),
            outlets: Vec::new(),
        }
    }

    #[test]
    fn validation_guards_tau_and_unsupported_knobs() {
        let mut config = base_config();
        assert!(config.validate().is_ok());

        config.tau = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Setup(SetupError::BadRelaxationTime(_)))
        ));

        let mut config = base_config();
        config.wall_boundary = WallBoundary::JunkYang;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Setup(SetupError::UnsupportedWallTreatment(_)))
        ));

        let mut config = base_config();
        config.kernel = KernelKind::Mrt;
        config.lattice = LatticeKind::D3Q19;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::KernelLatticeMismatch { .. })
        ));
    }

    #[test]
    fn json_round_trip_with_defaults() {
        let text = r#"{
            "lattice": "D3Q15",
            "tau": 0.8,
            "kernel": "Lbgk",
            "wall_boundary": "Bfl",
            "iolet_boundary": "Outflow",
            "steps_per_cycle": 500,
            "max_steps": 2000,
            "inlets": [{
                "pressure": true,
                "normal": [0.0, 0.0, 1.0],
                "position": [2.0, 2.0, 0.0],
                "source": {"type": "Cosine", "mean": 1.001, "amplitude": 0.0005,
                           "phase": 0.0, "period": 1.0}
            }]
        }"#;
        let config = SimulationConfig::from_json(text).unwrap();
        assert_eq!(config.block_size, 8);
        assert_eq!(config.inlets.len(), 1);
        let policies = config.streamer_policies().unwrap();
        assert_eq!(policies.wall, crate::streamers::WallPolicy::Bfl);
        let (inlets, outlets) = config.iolet_descriptors().unwrap();
        assert_eq!(inlets.len(), 1);
        assert!(outlets.is_empty());
    }
}
