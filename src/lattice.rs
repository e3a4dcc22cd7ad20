//! Discrete velocity sets & moment algebra
//!
//! A lattice is the triple (Q, c, w): the number of discrete velocities, the
//! direction vectors (with `c[0] = 0`) and the equilibrium weights. The fixed
//! involution `inv` satisfies `c[inv(d)] = -c[d]` and pairs adjacent entries
//! (`inv(1) = 2`, `inv(3) = 4`, ...), which every table below preserves.
//!
//! All operations here are pure and stateless; they act on distribution
//! slices of length `Q` and on `(density, momentum)` pairs. **Convention:**
//! the momentum vector stores `rho * u`; consumers divide by the density
//! where an actual velocity is required. The incompressible equilibrium and
//! the moment extraction are exact inverses of one another, which the tests
//! at the bottom of this module pin down.

#![allow(clippy::needless_range_loop)]

/// Upper bound on `Q` across the supported velocity sets; scratch arrays in
/// hot paths are sized to this so no per-site allocation is ever needed.
pub const MAX_Q: usize = 27;

/// Lattice speed of sound squared, `c_s^2 = 1/3` in lattice units.
pub const CS2: f64 = 1.0 / 3.0;

/// A discrete velocity set. Implementations are zero-sized tag types; all
/// data lives in `'static` tables so generic code stays monomorphic.
pub trait Lattice: Copy + Send + Sync + 'static {
    /// Number of discrete velocities.
    const Q: usize;
    /// x components of the direction vectors.
    const CX: &'static [i32];
    /// y components of the direction vectors.
    const CY: &'static [i32];
    /// z components of the direction vectors.
    const CZ: &'static [i32];
    /// Equilibrium weights.
    const W: &'static [f64];
    /// Direction inversion table.
    const INVERSE: &'static [usize];

    /// Short name used in logs and reports.
    const NAME: &'static str;

    /// The direction vector for `d` as f64 components.
    #[inline]
    fn c(d: usize) -> [f64; 3] {
        [Self::CX[d] as f64, Self::CY[d] as f64, Self::CZ[d] as f64]
    }

    /// The direction vector for `d` as integer components.
    #[inline]
    fn ci(d: usize) -> [i32; 3] {
        [Self::CX[d], Self::CY[d], Self::CZ[d]]
    }
}

// ============================================================================
// Velocity sets
// ============================================================================

/// The default 15-velocity set: rest, 6 face neighbours, 8 cube corners.
#[derive(Copy, Clone, Debug)]
pub struct D3Q15;

impl Lattice for D3Q15 {
    const Q: usize = 15;
    const CX: &'static [i32] = &[0, 1, -1, 0, 0, 0, 0, 1, -1, 1, -1, 1, -1, 1, -1];
    const CY: &'static [i32] = &[0, 0, 0, 1, -1, 0, 0, 1, -1, 1, -1, -1, 1, -1, 1];
    const CZ: &'static [i32] = &[0, 0, 0, 0, 0, 1, -1, 1, -1, -1, 1, 1, -1, -1, 1];
    #[rustfmt::skip]
    const W: &'static [f64] = &[
        2.0 / 9.0,
        1.0 / 9.0, 1.0 / 9.0, 1.0 / 9.0, 1.0 / 9.0, 1.0 / 9.0, 1.0 / 9.0,
        1.0 / 72.0, 1.0 / 72.0, 1.0 / 72.0, 1.0 / 72.0,
        1.0 / 72.0, 1.0 / 72.0, 1.0 / 72.0, 1.0 / 72.0,
    ];
    const INVERSE: &'static [usize] = &[0, 2, 1, 4, 3, 6, 5, 8, 7, 10, 9, 12, 11, 14, 13];
    const NAME: &'static str = "D3Q15";
}

/// 19-velocity set: rest, 6 face neighbours, 12 edge neighbours.
#[derive(Copy, Clone, Debug)]
pub struct D3Q19;

impl Lattice for D3Q19 {
    const Q: usize = 19;
    #[rustfmt::skip]
    const CX: &'static [i32] = &[0, 1, -1, 0, 0, 0, 0, 1, -1, 1, -1, 1, -1, 1, -1, 0, 0, 0, 0];
    #[rustfmt::skip]
    const CY: &'static [i32] = &[0, 0, 0, 1, -1, 0, 0, 1, -1, -1, 1, 0, 0, 0, 0, 1, -1, 1, -1];
    #[rustfmt::skip]
    const CZ: &'static [i32] = &[0, 0, 0, 0, 0, 1, -1, 0, 0, 0, 0, 1, -1, -1, 1, 1, -1, -1, 1];
    #[rustfmt::skip]
    const W: &'static [f64] = &[
        1.0 / 3.0,
        1.0 / 18.0, 1.0 / 18.0, 1.0 / 18.0, 1.0 / 18.0, 1.0 / 18.0, 1.0 / 18.0,
        1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0,
        1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0, 1.0 / 36.0,
    ];
    #[rustfmt::skip]
    const INVERSE: &'static [usize] =
        &[0, 2, 1, 4, 3, 6, 5, 8, 7, 10, 9, 12, 11, 14, 13, 16, 15, 18, 17];
    const NAME: &'static str = "D3Q19";
}

/// 27-velocity set: the full first neighbourhood of the cubic lattice.
#[derive(Copy, Clone, Debug)]
pub struct D3Q27;

impl Lattice for D3Q27 {
    const Q: usize = 27;
    #[rustfmt::skip]
    const CX: &'static [i32] = &[
        0, 1, -1, 0, 0, 0, 0,
        1, -1, 1, -1, 1, -1, 1, -1, 0, 0, 0, 0,
        1, -1, 1, -1, 1, -1, -1, 1,
    ];
    #[rustfmt::skip]
    const CY: &'static [i32] = &[
        0, 0, 0, 1, -1, 0, 0,
        1, -1, -1, 1, 0, 0, 0, 0, 1, -1, 1, -1,
        1, -1, 1, -1, -1, 1, 1, -1,
    ];
    #[rustfmt::skip]
    const CZ: &'static [i32] = &[
        0, 0, 0, 0, 0, 1, -1,
        0, 0, 0, 0, 1, -1, -1, 1, 1, -1, -1, 1,
        1, -1, -1, 1, 1, -1, 1, -1,
    ];
    #[rustfmt::skip]
    const W: &'static [f64] = &[
        8.0 / 27.0,
        2.0 / 27.0, 2.0 / 27.0, 2.0 / 27.0, 2.0 / 27.0, 2.0 / 27.0, 2.0 / 27.0,
        1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0,
        1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0, 1.0 / 54.0,
        1.0 / 216.0, 1.0 / 216.0, 1.0 / 216.0, 1.0 / 216.0,
        1.0 / 216.0, 1.0 / 216.0, 1.0 / 216.0, 1.0 / 216.0,
    ];
    #[rustfmt::skip]
    const INVERSE: &'static [usize] = &[
        0, 2, 1, 4, 3, 6, 5,
        8, 7, 10, 9, 12, 11, 14, 13, 16, 15, 18, 17,
        20, 19, 22, 21, 24, 23, 26, 25,
    ];
    const NAME: &'static str = "D3Q27";
}

// ============================================================================
// Moments & equilibria
// ============================================================================

/// Zeroth and first moments: `rho = sum f[d]`, `j = sum c[d] f[d]`.
#[inline]
pub fn density_and_momentum<L: Lattice>(f: &[f64]) -> (f64, [f64; 3]) {
    debug_assert_eq!(f.len(), L::Q);
    let mut density = 0.0;
    let mut j = [0.0f64; 3];
    for d in 0..L::Q {
        density += f[d];
        j[0] += L::CX[d] as f64 * f[d];
        j[1] += L::CY[d] as f64 * f[d];
        j[2] += L::CZ[d] as f64 * f[d];
    }
    (density, j)
}

/// Standard second-order Maxwell-Boltzmann truncation, written in terms of
/// the momentum `j = rho * u`:
///
/// `f_eq[d] = w[d] (rho + 3 (c.j) + 9/2 (c.j)^2 / rho - 3/2 (j.j) / rho)`
///
/// `density_and_momentum(equilibrium(rho, j)) == (rho, j)` to machine
/// precision.
pub fn equilibrium<L: Lattice>(density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
    debug_assert!(density > 0.0, "equilibrium needs a positive density");
    let inv_density = 1.0 / density;
    let j_sq = momentum[0] * momentum[0] + momentum[1] * momentum[1] + momentum[2] * momentum[2];
    let common = density - 1.5 * j_sq * inv_density;
    for d in 0..L::Q {
        let cj = L::CX[d] as f64 * momentum[0]
            + L::CY[d] as f64 * momentum[1]
            + L::CZ[d] as f64 * momentum[2];
        f_eq[d] = L::W[d] * (common + 3.0 * cj + 4.5 * cj * cj * inv_density);
    }
}

/// Product-form entropic equilibrium after Ansumali et al.
///
/// `f_eq[i] = rho w_i prod_a (2 - s_a) ((2 u_a + s_a) / (1 - u_a))^{c_ia}`
/// with `s_a = sqrt(1 + 3 u_a^2)`. Only defined for `|u_a| < 1`.
pub fn equilibrium_entropic<L: Lattice>(density: f64, momentum: [f64; 3], f_eq: &mut [f64]) {
    debug_assert!(density > 0.0);
    let u = [
        momentum[0] / density,
        momentum[1] / density,
        momentum[2] / density,
    ];
    let mut chi = [0.0f64; 3]; // (2 - s_a)
    let mut zeta = [0.0f64; 3]; // (2 u_a + s_a) / (1 - u_a)
    for a in 0..3 {
        let s = (1.0 + 3.0 * u[a] * u[a]).sqrt();
        chi[a] = 2.0 - s;
        zeta[a] = (2.0 * u[a] + s) / (1.0 - u[a]);
    }
    for d in 0..L::Q {
        let c = L::ci(d);
        let mut value = density * L::W[d];
        for a in 0..3 {
            value *= chi[a];
            match c[a] {
                1 => value *= zeta[a],
                -1 => value /= zeta[a],
                _ => {}
            }
        }
        f_eq[d] = value;
    }
}

// ============================================================================
// Stress reductions
// ============================================================================

/// The symmetric second moment of a (non-equilibrium) distribution,
/// `Pi_ab = sum_d c_a c_b f[d]`, packed as
/// `[xx, yy, zz, xy, xz, yz]`.
#[inline]
pub fn second_moment<L: Lattice>(f_neq: &[f64]) -> [f64; 6] {
    let mut pi = [0.0f64; 6];
    for d in 0..L::Q {
        let cx = L::CX[d] as f64;
        let cy = L::CY[d] as f64;
        let cz = L::CZ[d] as f64;
        pi[0] += cx * cx * f_neq[d];
        pi[1] += cy * cy * f_neq[d];
        pi[2] += cz * cz * f_neq[d];
        pi[3] += cx * cy * f_neq[d];
        pi[4] += cx * cz * f_neq[d];
        pi[5] += cy * cz * f_neq[d];
    }
    pi
}

/// Scalar von Mises stress of the deviatoric stress tensor.
///
/// `stress_parameter` is `(1 - 1/(2 tau)) / sqrt(2)`; see
/// [`crate::LbmParameters::stress_parameter`].
pub fn von_mises_stress<L: Lattice>(f_neq: &[f64], stress_parameter: f64) -> f64 {
    let pi = second_moment::<L>(f_neq);
    let d_xx_yy = pi[0] - pi[1];
    let d_yy_zz = pi[1] - pi[2];
    let d_xx_zz = pi[0] - pi[2];
    let a = d_xx_yy * d_xx_yy + d_yy_zz * d_yy_zz + d_xx_zz * d_xx_zz;
    let b = pi[3] * pi[3] + pi[4] * pi[4] + pi[5] * pi[5];
    stress_parameter * (a + 6.0 * b).sqrt()
}

/// Magnitude of the tangential traction on the plane with unit normal
/// `normal`. The full stress tensor is `sigma = -sqrt(2) p Pi`; the traction
/// is `t = sigma n`, and the wall shear stress is
/// `sqrt(|t|^2 - (t.n)^2)`.
pub fn shear_stress<L: Lattice>(f_neq: &[f64], normal: [f64; 3], stress_parameter: f64) -> f64 {
    let scale = -(2.0f64).sqrt() * stress_parameter;
    let pi = second_moment::<L>(f_neq);
    // Row-major symmetric tensor.
    let sigma = [
        [pi[0] * scale, pi[3] * scale, pi[4] * scale],
        [pi[3] * scale, pi[1] * scale, pi[5] * scale],
        [pi[4] * scale, pi[5] * scale, pi[2] * scale],
    ];
    let mut traction = [0.0f64; 3];
    let mut traction_sq = 0.0;
    let mut normal_component = 0.0;
    for i in 0..3 {
        for j in 0..3 {
            traction[i] += sigma[i][j] * normal[j];
        }
        traction_sq += traction[i] * traction[i];
        normal_component += traction[i] * normal[i];
    }
    (traction_sq - normal_component * normal_component).max(0.0).sqrt()
}

/// Full traction vector `sigma n` (used by the property cache).
pub fn traction<L: Lattice>(f_neq: &[f64], normal: [f64; 3], stress_parameter: f64) -> [f64; 3] {
    let scale = -(2.0f64).sqrt() * stress_parameter;
    let pi = second_moment::<L>(f_neq);
    [
        scale * (pi[0] * normal[0] + pi[3] * normal[1] + pi[4] * normal[2]),
        scale * (pi[3] * normal[0] + pi[1] * normal[1] + pi[5] * normal[2]),
        scale * (pi[4] * normal[0] + pi[5] * normal[1] + pi[2] * normal[2]),
    ]
}

/// Local shear rate magnitude from the non-equilibrium second moment:
/// `S_ab = -3/(2 tau rho) Pi_ab`, `gamma_dot = sqrt(2 S:S)`.
pub fn shear_rate<L: Lattice>(tau: f64, density: f64, f_neq: &[f64]) -> f64 {
    let pi = second_moment::<L>(f_neq);
    let scale = -3.0 / (2.0 * tau * density);
    let mut contraction = 0.0;
    // Diagonal once, off-diagonal twice (symmetric tensor).
    for &p in &pi[0..3] {
        let s = scale * p;
        contraction += s * s;
    }
    for &p in &pi[3..6] {
        let s = scale * p;
        contraction += 2.0 * s * s;
    }
    (2.0 * contraction).sqrt()
}

// ============================================================================
// Tests
// ============================================================================
