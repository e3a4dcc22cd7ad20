//! Collision operators
//!
//! A kernel fills a [`HydroVars`] bundle from a site's current
//! distributions (`calc_pre_collision`) and then produces post-collision
//! distributions (`collide`). Every kernel preserves density and momentum
//! on a bulk site exactly (the Guo-forcing variant adds exactly the body
//! force to the momentum); the tests at the bottom pin this down for each
//! operator.
//!
//! Kernels must never be invoked with `tau <= 0.5`; configuration
//! validation rejects such parameters before the time loop starts, and the
//! stability monitor catches the divergence if a non-Newtonian model drives
//! a local relaxation time towards the limit.

#![allow(clippy::needless_range_loop)]

use crate::lattice::{self, Lattice, CS2, MAX_Q};
use crate::LbmParameters;

/// Hydrodynamic-variables bundle passed between the pre-collision and
/// collision stages, and read afterwards by streamers and the property
/// cache. `momentum` stores `rho * u`.
#[derive(Clone, Debug)]
pub struct HydroVars {
    pub density: f64,
    pub momentum: [f64; 3],
    /// The site's distributions at the start of the step.
    pub f: [f64; MAX_Q],
    pub f_eq: [f64; MAX_Q],
    pub f_neq: [f64; MAX_Q],
    /// Post-collision distributions, written by `collide`.
    pub f_post: [f64; MAX_Q],
    /// Relaxation time in effect at this site (rheology models vary it).
    pub tau: f64,
}

impl HydroVars {
    pub fn new() -> Self {
        HydroVars {
            density: 0.0,
            momentum: [0.0; 3],
            f: [0.0; MAX_Q],
            f_eq: [0.0; MAX_Q],
            f_neq: [0.0; MAX_Q],
            f_post: [0.0; MAX_Q],
            tau: 0.0,
        }
    }

    /// Load the site's current distributions.
    #[inline]
    pub fn load(&mut self, f_old: &[f64]) {
        self.f[..f_old.len()].copy_from_slice(f_old);
    }

    /// Velocity `u = j / rho`.
    #[inline]
    pub fn velocity(&self) -> [f64; 3] {
        [
            self.momentum[0] / self.density,
            self.momentum[1] / self.density,
            self.momentum[2] / self.density,
        ]
    }
}

impl Default for HydroVars {
    fn default() -> Self {
        Self::new()
    }
}

/// A collision operator over lattice `L`.
pub trait Kernel<L: Lattice>: Send {
    /// Fill `hv` with density, momentum, equilibrium and non-equilibrium
    /// parts from `hv.f`. `site` is the local site id (rheology models key
    /// per-site state off it).
    fn calc_pre_collision(&mut self, params: &LbmParameters, site: usize, hv: &mut HydroVars);

    /// Produce `hv.f_post` from the filled bundle.
    fn collide(&mut self, params: &LbmParameters, hv: &mut HydroVars);

    /// Equilibrium at externally imposed `(density, momentum)`, by this
    /// kernel's own definition (ghost-site construction in iolet
    /// treatments).
    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]);
}

#[inline]
fn fill_std_moments<L: Lattice>(hv: &mut HydroVars) {
    let (density, momentum) = lattice::density_and_momentum::<L>(&hv.f[..L::Q]);
    hv.density = density;
    hv.momentum = momentum;
    lattice::equilibrium::<L>(density, momentum, &mut hv.f_eq[..L::Q]);
    for d in 0..L::Q {
        hv.f_neq[d] = hv.f[d] - hv.f_eq[d];
    }
}

// ============================================================================
// LBGK
// ============================================================================

/// Single-relaxation-time BGK: `f* = f + omega (f_eq - f)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lbgk;

impl<L: Lattice> Kernel<L> for Lbgk {
    fn calc_pre_collision(&mut self, params: &LbmParameters, _site: usize, hv: &mut HydroVars) {
        fill_std_moments::<L>(hv);
        hv.tau = params.tau;
    }

    fn collide(&mut self, params: &LbmParameters, hv: &mut HydroVars) {
        let omega = params.omega();
        for d in 0..L::Q {
            hv.f_post[d] = hv.f[d] - omega * hv.f_neq[d];
        }
    }

    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
        lattice::equilibrium::<L>(density, momentum, f_eq);
    }
}

// ============================================================================
// TRT
// ============================================================================

/// Two-relaxation-time kernel. The even rate is `1/tau`; the odd rate is
/// fixed by the magic parameter `Lambda = 1/4`, which puts the mid-link
/// bounce-back wall exactly half-way along the cut.
#[derive(Clone, Copy, Debug, Default)]
pub struct Trt;

impl Trt {
    #[inline]
    fn tau_odd(tau: f64) -> f64 {
        0.25 / (tau - 0.5) + 0.5
    }
}

impl<L: Lattice> Kernel<L> for Trt {
    fn calc_pre_collision(&mut self, params: &LbmParameters, _site: usize, hv: &mut HydroVars) {
        fill_std_moments::<L>(hv);
        hv.tau = params.tau;
    }

    fn collide(&mut self, params: &LbmParameters, hv: &mut HydroVars) {
        let omega_even = 1.0 / params.tau;
        let omega_odd = 1.0 / Self::tau_odd(params.tau);
        for d in 0..L::Q {
            let i = L::INVERSE[d];
            let neq_even = 0.5 * (hv.f_neq[d] + hv.f_neq[i]);
            let neq_odd = 0.5 * (hv.f_neq[d] - hv.f_neq[i]);
            hv.f_post[d] = hv.f[d] - omega_even * neq_even - omega_odd * neq_odd;
        }
    }

    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
        lattice::equilibrium::<L>(density, momentum, f_eq);
    }
}

// ============================================================================
// MRT (D'Humieres moment basis, D3Q15)
// ============================================================================

/// Number of non-conserved moments in the reduced D3Q15 basis.
pub const MRT_KINETIC_MOMENTS: usize = 11;

/// Reduced moment basis after D'Humieres for the D3Q15 velocity ordering
/// used here: rows e, epsilon, q_x, q_y, q_z, 3p_xx, p_ww, p_xy, p_yz,
/// p_zx, m_xyz. Conserved moments (density, momentum) are excluded; they
/// relax nowhere.
#[rustfmt::skip]
pub const MRT_D3Q15_BASIS: [[f64; 15]; MRT_KINETIC_MOMENTS] = [
    [-2.0, -1.0, -1.0, -1.0, -1.0, -1.0, -1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
    [16.0, -4.0, -4.0, -4.0, -4.0, -4.0, -4.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
    [0.0, -4.0, 4.0, 0.0, 0.0, 0.0, 0.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0],
    [0.0, 0.0, 0.0, -4.0, 4.0, 0.0, 0.0, 1.0, -1.0, 1.0, -1.0, -1.0, 1.0, -1.0, 1.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, -4.0, 4.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0, 1.0],
    [0.0, 2.0, 2.0, -1.0, -1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 1.0, 1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0, 1.0, 1.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, -1.0, -1.0],
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, -1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0],
];

/// Diagonal of `B B^T` for [`MRT_D3Q15_BASIS`] (the rows are mutually
/// orthogonal).
pub const MRT_D3Q15_BASIS_NORM: [f64; MRT_KINETIC_MOMENTS] =
    [18.0, 360.0, 40.0, 40.0, 40.0, 12.0, 4.0, 8.0, 8.0, 8.0, 8.0];

/// Multiple-relaxation-time kernel on the reduced D3Q15 basis. The five
/// stress moments relax at `1/tau` (they set the viscosity); the remaining
/// kinetic rates take the standard ghost-moment values.
#[derive(Clone, Debug)]
pub struct MrtD3Q15 {
    rates: [f64; MRT_KINETIC_MOMENTS],
}

impl MrtD3Q15 {
    pub fn new(tau: f64) -> Self {
        let omega = 1.0 / tau;
        let mut rates = [0.0; MRT_KINETIC_MOMENTS];
        rates[0] = 1.6; // e
        rates[1] = 1.2; // epsilon
        rates[2] = 1.6; // q_x
        rates[3] = 1.6; // q_y
        rates[4] = 1.6; // q_z
        for r in &mut rates[5..10] {
            *r = omega; // 3p_xx, p_ww, p_xy, p_yz, p_zx
        }
        rates[10] = 1.2; // m_xyz
        MrtD3Q15 { rates }
    }

    /// Uniform kinetic rates (degenerates to LBGK); used by tests.
    pub fn with_uniform_rate(omega: f64) -> Self {
        MrtD3Q15 { rates: [omega; MRT_KINETIC_MOMENTS] }
    }
}

impl<L: Lattice> Kernel<L> for MrtD3Q15 {
    fn calc_pre_collision(&mut self, params: &LbmParameters, _site: usize, hv: &mut HydroVars) {
        // Configuration validation only wires this kernel up with D3Q15.
        debug_assert_eq!(L::Q, 15, "the reduced MRT basis is defined on D3Q15");
        fill_std_moments::<L>(hv);
        hv.tau = params.tau;
    }

    fn collide(&mut self, _params: &LbmParameters, hv: &mut HydroVars) {
        let q = 15;
        let mut m_neq = [0.0f64; MRT_KINETIC_MOMENTS];
        for j in 0..MRT_KINETIC_MOMENTS {
            for i in 0..q {
                m_neq[j] += MRT_D3Q15_BASIS[j][i] * hv.f_neq[i];
            }
        }
        hv.f_post[..q].copy_from_slice(&hv.f[..q]);
        for j in 0..MRT_KINETIC_MOMENTS {
            let scaled = self.rates[j] * m_neq[j] / MRT_D3Q15_BASIS_NORM[j];
            for i in 0..q {
                hv.f_post[i] -= MRT_D3Q15_BASIS[j][i] * scaled;
            }
        }
    }

    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
        lattice::equilibrium::<L>(density, momentum, f_eq);
    }
}

// ============================================================================
// Entropic (Ansumali)
// ============================================================================

/// Entropic kernel after Ansumali et al.: product-form equilibrium and a
/// per-site over-relaxation parameter alpha found by Newton iteration on
/// the discrete H-function, then `f* = f + alpha beta (f_eq - f)` with
/// `beta = 1/(2 tau)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntropicAnsumali;

impl EntropicAnsumali {
    const MAX_NEWTON_ITERATIONS: usize = 20;
    const TOLERANCE: f64 = 1e-10;

    /// `H(f) = sum f ln(f / w)`; `h(alpha) = H(f + alpha delta) - H(f)`.
    /// Returns the non-trivial root, or the LBGK-compatible value 2 when
    /// the deviation is too small for the iteration to be meaningful.
    fn alpha<L: Lattice>(f: &[f64], delta: &[f64]) -> f64 {
        let deviation_sq: f64 = delta.iter().map(|d| d * d).sum();
        if deviation_sq < 1e-28 {
            return 2.0;
        }
        let mut alpha = 2.0f64;
        for _ in 0..Self::MAX_NEWTON_ITERATIONS {
            let mut h = 0.0;
            let mut dh = 0.0;
            let mut valid = true;
            for d in 0..L::Q {
                let fd = f[d] + alpha * delta[d];
                if fd <= 0.0 {
                    valid = false;
                    break;
                }
                let log_ratio = (fd / L::W[d]).ln();
                h += fd * log_ratio - f[d] * (f[d] / L::W[d]).ln();
                dh += delta[d] * (log_ratio + 1.0);
            }
            if !valid {
                alpha *= 0.5;
                continue;
            }
            if dh.abs() < 1e-14 || h.abs() < Self::TOLERANCE {
                break;
            }
            let step = h / dh;
            alpha -= step;
            // The physical root sits near 2; leaving the bracket (towards
            // the trivial root at 0, or beyond over-relaxation) means the
            // iteration lost it, so fall back to the BGK point.
            if !(1.0..=4.0).contains(&alpha) {
                return 2.0;
            }
            if step.abs() < Self::TOLERANCE {
                break;
            }
        }
        alpha
    }
}

impl<L: Lattice> Kernel<L> for EntropicAnsumali {
    fn calc_pre_collision(&mut self, params: &LbmParameters, _site: usize, hv: &mut HydroVars) {
        let (density, momentum) = lattice::density_and_momentum::<L>(&hv.f[..L::Q]);
        hv.density = density;
        hv.momentum = momentum;
        lattice::equilibrium_entropic::<L>(density, momentum, &mut hv.f_eq[..L::Q]);
        for d in 0..L::Q {
            hv.f_neq[d] = hv.f[d] - hv.f_eq[d];
        }
        hv.tau = params.tau;
    }

    fn collide(&mut self, params: &LbmParameters, hv: &mut HydroVars) {
        let beta = 1.0 / (2.0 * params.tau);
        let mut delta = [0.0f64; MAX_Q];
        for d in 0..L::Q {
            delta[d] = -hv.f_neq[d];
        }
        let alpha = Self::alpha::<L>(&hv.f[..L::Q], &delta[..L::Q]);
        for d in 0..L::Q {
            hv.f_post[d] = hv.f[d] + alpha * beta * delta[d];
        }
    }

    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
        lattice::equilibrium_entropic::<L>(density, momentum, f_eq);
    }
}

/// Entropic kernel in the Chikatamarla variant: the same H-function
/// over-relaxation search, but against the polynomial (second-order)
/// equilibrium rather than the product form.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntropicChik;

impl<L: Lattice> Kernel<L> for EntropicChik {
    fn calc_pre_collision(&mut self, params: &LbmParameters, _site: usize, hv: &mut HydroVars) {
        fill_std_moments::<L>(hv);
        hv.tau = params.tau;
    }

    fn collide(&mut self, params: &LbmParameters, hv: &mut HydroVars) {
        let beta = 1.0 / (2.0 * params.tau);
        let mut delta = [0.0f64; MAX_Q];
        for d in 0..L::Q {
            delta[d] = -hv.f_neq[d];
        }
        let alpha = EntropicAnsumali::alpha::<L>(&hv.f[..L::Q], &delta[..L::Q]);
        for d in 0..L::Q {
            hv.f_post[d] = hv.f[d] + alpha * beta * delta[d];
        }
    }

    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
        lattice::equilibrium::<L>(density, momentum, f_eq);
    }
}

// ============================================================================
// Non-Newtonian LBGK
// ============================================================================

/// A shear-thinning/thickening viscosity law. Input is the physical shear
/// rate in 1/s; output is the dynamic viscosity in Pa s.
pub trait RheologyModel: Send + Clone {
    fn viscosity(&self, shear_rate: f64) -> f64;
    fn name(&self) -> &'static str;
}

/// Carreau-Yasuda with the human-blood fit.
#[derive(Clone, Debug)]
pub struct CarreauYasuda {
    pub eta_zero: f64,
    pub eta_inf: f64,
    pub lambda: f64,
    pub a: f64,
    pub n: f64,
}

impl Default for CarreauYasuda {
    fn default() -> Self {
        CarreauYasuda { eta_zero: 0.16, eta_inf: 0.0035, lambda: 8.2, a: 0.64, n: 0.2128 }
    }
}

impl RheologyModel for CarreauYasuda {
    fn viscosity(&self, shear_rate: f64) -> f64 {
        self.eta_inf
            + (self.eta_zero - self.eta_inf)
                * (1.0 + (self.lambda * shear_rate).powf(self.a)).powf((self.n - 1.0) / self.a)
    }

    fn name(&self) -> &'static str {
        "carreau-yasuda"
    }
}

/// Casson model, capped at the zero-shear plateau.
#[derive(Clone, Debug)]
pub struct Casson {
    pub k0: f64,
    pub k1: f64,
    pub max_viscosity: f64,
}

impl Default for Casson {
    fn default() -> Self {
        Casson { k0: 0.1937, k1: 0.055, max_viscosity: 0.16 }
    }
}

impl RheologyModel for Casson {
    fn viscosity(&self, shear_rate: f64) -> f64 {
        if shear_rate <= 0.0 {
            return self.max_viscosity;
        }
        let k = self.k0 + self.k1 * shear_rate.sqrt();
        (k * k / shear_rate).min(self.max_viscosity)
    }

    fn name(&self) -> &'static str {
        "casson"
    }
}

/// Power law with the shear rate truncated to `[gamma_min, gamma_max]`.
#[derive(Clone, Debug)]
pub struct TruncatedPowerLaw {
    pub m: f64,
    pub n: f64,
    pub gamma_min: f64,
    pub gamma_max: f64,
}

impl Default for TruncatedPowerLaw {
    fn default() -> Self {
        TruncatedPowerLaw { m: 0.0035, n: 1.0, gamma_min: 6.25e-3, gamma_max: 1.2e2 }
    }
}

impl RheologyModel for TruncatedPowerLaw {
    fn viscosity(&self, shear_rate: f64) -> f64 {
        let gamma = shear_rate.clamp(self.gamma_min, self.gamma_max);
        self.m * gamma.powf(self.n - 1.0)
    }

    fn name(&self) -> &'static str {
        "truncated-power-law"
    }
}

/// LBGK with a per-site relaxation time re-evaluated from the local strain
/// rate every step. Converts between lattice and physical shear rate /
/// viscosity with the voxel size and time step carried in the parameters.
#[derive(Clone, Debug)]
pub struct LbgkNonNewtonian<R: RheologyModel> {
    rheology: R,
    tau_per_site: Vec<f64>,
}

impl<R: RheologyModel> LbgkNonNewtonian<R> {
    pub fn new(rheology: R, site_count: usize, initial_tau: f64) -> Self {
        LbgkNonNewtonian { rheology, tau_per_site: vec![initial_tau; site_count] }
    }

    /// Current relaxation time at a site (monitoring, tests).
    pub fn tau_at(&self, site: usize) -> f64 {
        self.tau_per_site[site]
    }
}

impl<L: Lattice, R: RheologyModel> Kernel<L> for LbgkNonNewtonian<R> {
    fn calc_pre_collision(&mut self, params: &LbmParameters, site: usize, hv: &mut HydroVars) {
        fill_std_moments::<L>(hv);
        let old_tau = self.tau_per_site[site];
        let gamma_lattice = lattice::shear_rate::<L>(old_tau, hv.density, &hv.f_neq[..L::Q]);
        let gamma_physical = gamma_lattice / params.time_step;
        let eta = self.rheology.viscosity(gamma_physical);
        let nu_physical = eta / params.fluid_density;
        let nu_lattice = nu_physical * params.time_step / (params.voxel_size * params.voxel_size);
        let tau = 0.5 + 3.0 * nu_lattice;
        self.tau_per_site[site] = tau;
        hv.tau = tau;
    }

    fn collide(&mut self, _params: &LbmParameters, hv: &mut HydroVars) {
        let omega = 1.0 / hv.tau;
        for d in 0..L::Q {
            hv.f_post[d] = hv.f[d] - omega * hv.f_neq[d];
        }
    }

    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
        lattice::equilibrium::<L>(density, momentum, f_eq);
    }
}

// ============================================================================
// Guo-forcing LBGK
// ============================================================================

/// LBGK with the Guo body-force scheme: the equilibrium sees the
/// half-force-shifted momentum, and a per-direction forcing term scaled by
/// `(1 - omega/2)` is added, so the net momentum input per step is exactly
/// the force.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuoForcingLbgk;

impl<L: Lattice> Kernel<L> for GuoForcingLbgk {
    fn calc_pre_collision(&mut self, params: &LbmParameters, _site: usize, hv: &mut HydroVars) {
        let (density, momentum) = lattice::density_and_momentum::<L>(&hv.f[..L::Q]);
        hv.density = density;
        // Half-step momentum shift; this is the momentum the macroscopic
        // fields report as well.
        hv.momentum = [
            momentum[0] + 0.5 * params.force[0],
            momentum[1] + 0.5 * params.force[1],
            momentum[2] + 0.5 * params.force[2],
        ];
        lattice::equilibrium::<L>(density, hv.momentum, &mut hv.f_eq[..L::Q]);
        for d in 0..L::Q {
            hv.f_neq[d] = hv.f[d] - hv.f_eq[d];
        }
        hv.tau = params.tau;
    }

    fn collide(&mut self, params: &LbmParameters, hv: &mut HydroVars) {
        let omega = params.omega();
        let prefactor = 1.0 - 0.5 * omega;
        let u = hv.velocity();
        let force = params.force;
        for d in 0..L::Q {
            let c = L::c(d);
            let cu = c[0] * u[0] + c[1] * u[1] + c[2] * u[2];
            let mut forcing = 0.0;
            for a in 0..3 {
                forcing += ((c[a] - u[a]) / CS2 + cu * c[a] / (CS2 * CS2)) * force[a];
            }
            hv.f_post[d] =
                hv.f[d] - omega * hv.f_neq[d] + prefactor * L::W[d] * forcing;
        }
    }

    fn equilibrium(&self, density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
        lattice::equilibrium::<L>(density, momentum, f_eq);
    }
}

// ============================================================================
// Tests
// ============================================================================
