//! Crate root: public surface, core aliases, and engine-wide conventions
//!
//! `hemoflow` is the time-stepping core of a lattice-Boltzmann blood-flow
//! engine: the spatial data model of the fluid domain, the discrete
//! velocity sets and their moment algebra, the pluggable collision
//! kernels, link-wise streaming with wall and iolet treatments, the
//! inter-partition halo exchange, and the phased per-iteration
//! orchestration that ties them together. Geometry loading, domain
//! decomposition, visualisation, steering and unit conversion are external
//! collaborators; this crate accepts a fully populated domain and values
//! already converted to lattice units.
//!
//! ## Conventions (applied uniformly)
//!
//! - **Momentum, not velocity.** Hydrodynamic bundles store `j = rho u`;
//!   every consumer divides by the density at the point of use.
//! - **Positive omega.** `omega = 1/tau > 0` and collisions are written
//!   `f* = f + omega (f_eq - f)`. `tau` must exceed 1/2; configuration
//!   validation enforces it before the time loop starts.
//! - **Distribution layout.** Element `(site s, direction d)` of either
//!   buffer sits at `s * Q + d`; slot `N * Q` is the sentinel
//!   no-propagation slot and the region above it is the shared tail
//!   exchanged with neighbouring ranks.
//! - **Explicit communicators.** Every component that talks to a peer
//!   takes a transport handle; there is no process-wide topology
//!   singleton.
//!
//! Failure modes are precise errors (`thiserror` per module): setup errors
//! abort before the loop, communication errors abort the run, and
//! numerical instability is a routinely handled state, not an exception.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Discrete velocity sets, moments, equilibria, stress reductions.
pub mod lattice;
/// Per-site classification and per-link metadata.
pub mod site;
/// Blocks, distribution buffers, neighbour table, range partition.
pub mod domain;
/// Transport seam, in-process rank fabric, Net request aggregator.
pub mod comm;
/// Halo exchange of boundary-crossing distributions.
pub mod exchange;
/// Collision operators (LBGK, MRT, TRT, entropic, non-Newtonian, forced).
pub mod kernels;
/// Link-wise propagation with wall/iolet policies and the post-step pass.
pub mod streamers;
/// Iolet descriptors, value sources, controller/subscriber distribution.
pub mod boundaries;
/// Distributed stability and convergence monitoring.
pub mod stability;
/// Actor protocol and the phased step manager.
pub mod scheduler;
/// Write-through caches of macroscopic properties.
pub mod cache;
/// Configuration document and validation.
pub mod config;
/// Happy-path assembly: demo geometries, one-shot runs, snapshots.
pub mod api;
/// Timers, run reports, failure records.
pub mod report;

// ============================================================================
// Engine-wide parameters
// ============================================================================

/// Default physical fluid (blood) density in kg/m^3, used by the
/// rheology-model unit conversions.
pub const DEFAULT_FLUID_DENSITY: f64 = 1000.0;

/// The once-per-run lattice parameters every kernel and streamer reads.
/// Set from viscosity and voxel size by the external unit converter; all
/// fields are in lattice units except the physical conversion factors the
/// non-Newtonian kernels need.
#[derive(Clone, Debug)]
pub struct LbmParameters {
    /// Relaxation time; always `> 1/2`.
    pub tau: f64,
    /// Uniform body force density (Guo-forcing kernel).
    pub force: [f64; 3],
    /// Physical voxel size in metres.
    pub voxel_size: f64,
    /// Physical timestep in seconds.
    pub time_step: f64,
    /// Physical fluid density in kg/m^3.
    pub fluid_density: f64,
}

impl LbmParameters {
    /// Parameters with unit physical conversions and no body force.
    pub fn from_tau(tau: f64) -> Self {
        debug_assert!(tau > 0.5, "relaxation time must exceed 1/2");
        LbmParameters {
            tau,
            force: [0.0; 3],
            voxel_size: 1.0,
            time_step: 1.0,
            fluid_density: DEFAULT_FLUID_DENSITY,
        }
    }

    /// `omega = 1/tau`.
    #[inline]
    pub fn omega(&self) -> f64 {
        1.0 / self.tau
    }

    /// Kinematic viscosity in lattice units, `(tau - 1/2) / 3`.
    #[inline]
    pub fn lattice_viscosity(&self) -> f64 {
        (self.tau - 0.5) / 3.0
    }

    /// Prefactor `(1 - 1/(2 tau)) / sqrt(2)` for the stress reductions.
    #[inline]
    pub fn stress_parameter(&self) -> f64 {
        (1.0 - 1.0 / (2.0 * self.tau)) / (2.0f64).sqrt()
    }
}

// ============================================================================
// Root re-exports (canonical definitions live in their modules)
// ============================================================================

pub use crate::comm::{Net, RankFabric, Transport};
pub use crate::config::SimulationConfig;
pub use crate::domain::{DomainBuilder, FluidDomain, SetupError};
pub use crate::scheduler::{Actor, RunSummary, RunTermination, StepManager};
pub use crate::site::{IoletId, LinkKind, SiteType};
pub use crate::stability::Stability;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_derivations() {
        let params = LbmParameters::from_tau(1.0);
        assert!((params.omega() - 1.0).abs() < 1e-15);
        assert!((params.lattice_viscosity() - 1.0 / 6.0).abs() < 1e-15);
        assert!((params.stress_parameter() - 0.5 / (2.0f64).sqrt()).abs() < 1e-15);
    }
}
