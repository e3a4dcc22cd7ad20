//! Distributed stability & convergence monitoring
//!
//! Each rank scans its freshly streamed distributions for any value that is
//! not strictly positive (the test `!(value > 0)` also catches NaN) and
//! reduces the per-rank verdict to a global one with a split-phase MIN
//! reduction: the gather leg is issued at the `Send` step, the result
//! arrives at `Wait`. Ordering is `Unstable < Stable < StableAndConverged`,
//! so one bad site anywhere poisons the whole run's verdict.
//!
//! The optional convergence check compares the site density before and
//! after the step against a relative tolerance; it only upgrades a verdict
//! that is already stable.

use crate::comm::{CommError, MinReduction, Transport, TAG_STABILITY_BCAST, TAG_STABILITY_GATHER};
use crate::domain::FluidDomain;
use crate::lattice::Lattice;

/// Global stability verdict, MIN-reduced across ranks.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Stability {
    /// No reduction has completed yet (start-up and just after a reset).
    Undefined = -1,
    Unstable = 0,
    Stable = 1,
    StableAndConverged = 2,
}

impl Stability {
    fn from_reduced(value: i32) -> Stability {
        match value {
            0 => Stability::Unstable,
            1 => Stability::Stable,
            2 => Stability::StableAndConverged,
            _ => Stability::Undefined,
        }
    }
}

/// Per-rank monitor driving the non-blocking reduction.
pub struct StabilityMonitor {
    reduction: MinReduction,
    local: Stability,
    global: Stability,
    check_convergence: bool,
    tolerance: f64,
    in_flight: bool,
}

impl StabilityMonitor {
    pub fn new(check_convergence: bool, tolerance: f64) -> Self {
        StabilityMonitor {
            reduction: MinReduction::new(TAG_STABILITY_GATHER, TAG_STABILITY_BCAST),
            local: Stability::Undefined,
            global: Stability::Undefined,
            check_convergence,
            tolerance,
            in_flight: false,
        }
    }

    /// Back to the undefined state (instability reset).
    pub fn reset(&mut self) {
        debug_assert!(!self.in_flight, "reset with a reduction in flight");
        self.local = Stability::Undefined;
        self.global = Stability::Undefined;
    }

    #[inline]
    pub fn global_stability(&self) -> Stability {
        self.global
    }

    /// Scan the local distributions (`PreSend` step, after the collisions
    /// have run).
    pub fn scan<L: Lattice>(&mut self, domain: &FluidDomain<L>) {
        let q = L::Q;
        let f_new = domain.f_new();
        let f_old = domain.f_old();
        let mut unconverged_site = false;
        let mut check_convergence = self.check_convergence;
        self.local = Stability::Stable;

        'sites: for site in 0..domain.site_count() {
            let new = &f_new[site * q..(site + 1) * q];
            for &value in new {
                if !(value > 0.0) {
                    self.local = Stability::Unstable;
                    break 'sites;
                }
            }
            if check_convergence {
                let density_new: f64 = new.iter().sum();
                let density_old: f64 = f_old[site * q..(site + 1) * q].iter().sum();
                let relative = ((density_new - density_old) / density_old).abs();
                if relative > self.tolerance {
                    // Stable but not settled everywhere; skip further
                    // comparisons this step.
                    unconverged_site = true;
                    check_convergence = false;
                }
            }
        }

        if self.local == Stability::Stable && self.check_convergence && !unconverged_site {
            self.local = Stability::StableAndConverged;
        }
    }

    /// Issue the gather leg (`Send` step).
    pub fn start_reduction(&mut self, transport: &dyn Transport) -> Result<(), CommError> {
        debug_assert_ne!(self.local, Stability::Undefined, "scan must run before the send");
        self.reduction.start(transport, self.local as i32)?;
        self.in_flight = true;
        Ok(())
    }

    /// Complete the reduction (`Wait` step) and return the global verdict.
    pub fn finish_reduction(
        &mut self,
        transport: &dyn Transport,
    ) -> Result<Stability, CommError> {
        debug_assert!(self.in_flight, "no reduction in flight");
        let reduced = self.reduction.complete(transport)?;
        self.in_flight = false;
        self.global = Stability::from_reduced(reduced);
        if self.global == Stability::Unstable {
            tracing::warn!("global stability reduction reported an unstable field");
        }
        Ok(self.global)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::RankFabric;
    use crate::domain::DomainBuilder;
    use crate::lattice::D3Q15;
    use crate::site::SiteData;

    fn small_domain() -> FluidDomain<D3Q15> {
        let mut b = DomainBuilder::new([2, 2, 2], 4, [true; 3]);
        for x in 0..2i64 {
            for y in 0..2i64 {
                for z in 0..2i64 {
                    b.add_site([x, y, z], 0, SiteData::bulk()).unwrap();
                }
            }
        }
        b.build::<D3Q15>(0).unwrap()
    }

    #[test]
    fn positive_field_is_stable_and_negative_or_nan_is_not() {
        let transport = RankFabric::solo();
        let mut domain = small_domain();
        // f_new starts at the rest equilibrium: strictly positive.
        let mut monitor = StabilityMonitor::new(false, 1e-9);
        monitor.scan(&domain);
        monitor.start_reduction(&transport).unwrap();
        assert_eq!(monitor.finish_reduction(&transport).unwrap(), Stability::Stable);

        domain.f_new_mut()[7] = -1.0;
        monitor.scan(&domain);
        monitor.start_reduction(&transport).unwrap();
        assert_eq!(monitor.finish_reduction(&transport).unwrap(), Stability::Unstable);

        domain.f_new_mut()[7] = f64::NAN;
        monitor.scan(&domain);
        assert_eq!(monitor.local, Stability::Unstable);
    }

    #[test]
    fn convergence_upgrades_a_settled_field() {
        let transport = RankFabric::solo();
        let domain = small_domain();
        // f_old == f_new == equilibrium: converged by construction.
        let mut monitor = StabilityMonitor::new(true, 1e-9);
        monitor.scan(&domain);
        monitor.start_reduction(&transport).unwrap();
        assert_eq!(
            monitor.finish_reduction(&transport).unwrap(),
            Stability::StableAndConverged
        );
    }

    #[test]
    fn reset_returns_to_undefined() {
        let domain = small_domain();
        let mut monitor = StabilityMonitor::new(false, 1e-9);
        monitor.scan(&domain);
        assert_ne!(monitor.global_stability(), Stability::Stable); // not reduced yet
        monitor.reset();
        assert_eq!(monitor.global_stability(), Stability::Undefined);
        assert_eq!(monitor.local, Stability::Undefined);
    }

    #[test]
    fn verdict_ordering_matches_the_min_reduction() {
        assert!(Stability::Unstable < Stability::Stable);
        assert!(Stability::Stable < Stability::StableAndConverged);
    }
}
