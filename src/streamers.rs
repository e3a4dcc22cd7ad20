//! Link-wise propagation with wall & iolet treatments
//!
//! The driver collides a type-homogeneous site range, writes the
//! post-collision distributions back into `f_old` (post-step passes and
//! downstream readers rely on this), and streams every direction through
//! the neighbour index table. Boundary-cut links never propagate; the
//! configured wall/iolet policy supplies the missing inverse population,
//! either directly in the streaming pass or in the `post_step` pass once
//! all streamed values (including received halo values) are in place.
//!
//! Policies are plain data dispatched per link kind; composite wall+iolet
//! sites fall out of the per-link match for free. The choice is global for
//! all wall links and, independently, for all iolet links.

use crate::boundaries::IoletValueStore;
use crate::cache::PropertyCache;
use crate::domain::FluidDomain;
use crate::kernels::{HydroVars, Kernel};
use crate::lattice::{self, Lattice, CS2, MAX_Q};
use crate::site::LinkKind;
use crate::LbmParameters;

/// Wall-link treatment, applied to every wall-cut link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WallPolicy {
    /// Bounce the post-collision population straight back.
    SimpleBounceBack,
    /// Bouzidi-Firdaous-Lallemand interpolated bounce-back; needs the
    /// post-step pass.
    Bfl,
    /// Guo-Zheng-Shi non-equilibrium extrapolation; needs the post-step
    /// pass.
    GuoZhengShi,
}

impl WallPolicy {
    /// Whether the policy revisits wall links after `copy_received`.
    #[inline]
    pub fn needs_post_step(self) -> bool {
        matches!(self, WallPolicy::Bfl | WallPolicy::GuoZhengShi)
    }
}

/// Iolet-link treatment, applied to every inlet/outlet-cut link.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoletPolicy {
    /// Impose the iolet density on a ghost site and stream its equilibrium
    /// back (pressure iolets).
    NashZerothOrderPressure,
    /// Moving-wall bounce-back against the prescribed surface velocity
    /// (velocity iolets).
    Ladd,
    /// Free outflow: the missing population copies the outgoing one in the
    /// same direction.
    Outflow,
    /// Plain bounce-back at the open surface.
    OutflowBounceBack,
}

/// The configured pair of treatments.
#[derive(Copy, Clone, Debug)]
pub struct StreamerPolicies {
    pub wall: WallPolicy,
    pub iolet: IoletPolicy,
}

/// Collide and stream all sites in `[range.0, range.1)`.
#[allow(clippy::too_many_arguments)]
pub fn stream_and_collide<L: Lattice, K: Kernel<L>>(
    domain: &mut FluidDomain<L>,
    kernel: &mut K,
    params: &LbmParameters,
    policies: &StreamerPolicies,
    iolets: &IoletValueStore,
    cache: &mut PropertyCache,
    range: (usize, usize),
) {
    let q = L::Q;
    let update_cache = cache.any_required();
    let stress_parameter = params.stress_parameter();
    let mut hv = HydroVars::new();
    let mut ghost_feq = [0.0f64; MAX_Q];
    let access = domain.stream_access();

    for site in range.0..range.1 {
        let base = site * q;
        hv.load(&access.f_old[base..base + q]);
        kernel.calc_pre_collision(params, site, &mut hv);
        kernel.collide(params, &mut hv);

        // Post-collision write-back; post-step interpolation reads these.
        access.f_old[base..base + q].copy_from_slice(&hv.f_post[..q]);

        let data = &access.site_data[site];
        access.f_new[access.neighbour_index[base]] = hv.f_post[0];
        for d in 1..q {
            let link = data.link(d);
            match link.kind {
                LinkKind::NoBoundary => {
                    access.f_new[access.neighbour_index[base + d]] = hv.f_post[d];
                }
                LinkKind::Wall => match policies.wall {
                    WallPolicy::SimpleBounceBack => {
                        access.f_new[base + L::INVERSE[d]] = hv.f_post[d];
                    }
                    // Reconstructed in the post-step pass.
                    WallPolicy::Bfl | WallPolicy::GuoZhengShi => {}
                },
                kind @ (LinkKind::Inlet | LinkKind::Outlet) => {
                    let Some(id) = link.iolet else {
                        debug_assert!(false, "iolet link without id survived validation");
                        continue;
                    };
                    let unstreamed = L::INVERSE[d];
                    match policies.iolet {
                        IoletPolicy::NashZerothOrderPressure => {
                            let ghost_density = iolets.ghost_density(kind, id);
                            let normal = iolets.normal(kind, id);
                            // Momentum convention: divide by density to get
                            // the velocity component along the normal.
                            let component = (hv.momentum[0] * normal[0]
                                + hv.momentum[1] * normal[1]
                                + hv.momentum[2] * normal[2])
                                / hv.density;
                            let ghost_momentum = [
                                normal[0] * component * ghost_density,
                                normal[1] * component * ghost_density,
                                normal[2] * component * ghost_density,
                            ];
                            kernel.equilibrium(
                                ghost_density,
                                ghost_momentum,
                                &mut ghost_feq[..q],
                            );
                            access.f_new[base + unstreamed] = ghost_feq[unstreamed];
                        }
                        IoletPolicy::Ladd => {
                            let u_wall = iolets.wall_velocity(kind, id);
                            let c = L::c(d);
                            let cu =
                                c[0] * u_wall[0] + c[1] * u_wall[1] + c[2] * u_wall[2];
                            access.f_new[base + unstreamed] =
                                hv.f_post[d] - 2.0 * L::W[d] * hv.density * cu / CS2;
                        }
                        IoletPolicy::Outflow => {
                            access.f_new[base + unstreamed] = hv.f_post[unstreamed];
                        }
                        IoletPolicy::OutflowBounceBack => {
                            access.f_new[base + unstreamed] = hv.f_post[d];
                        }
                    }
                }
            }
        }

        if update_cache {
            write_cache::<L>(cache, site, &hv, data.wall_normal, stress_parameter);
        }
    }
}

fn write_cache<L: Lattice>(
    cache: &mut PropertyCache,
    site: usize,
    hv: &HydroVars,
    wall_normal: Option<[f64; 3]>,
    stress_parameter: f64,
) {
    let q = L::Q;
    if cache.density.required() {
        cache.density.set(site, hv.density);
    }
    if cache.velocity.required() {
        cache.velocity.set(site, hv.velocity());
    }
    if cache.von_mises_stress.required() {
        cache
            .von_mises_stress
            .set(site, lattice::von_mises_stress::<L>(&hv.f_neq[..q], stress_parameter));
    }
    if cache.shear_rate.required() {
        cache
            .shear_rate
            .set(site, lattice::shear_rate::<L>(hv.tau, hv.density, &hv.f_neq[..q]));
    }
    if cache.stress_tensor.required() {
        let scale = -(2.0f64).sqrt() * stress_parameter;
        let mut pi = lattice::second_moment::<L>(&hv.f_neq[..q]);
        for p in &mut pi {
            *p *= scale;
        }
        cache.stress_tensor.set(site, pi);
    }
    if let Some(normal) = wall_normal {
        if cache.wall_shear_stress_magnitude.required() {
            cache.wall_shear_stress_magnitude.set(
                site,
                lattice::shear_stress::<L>(&hv.f_neq[..q], normal, stress_parameter),
            );
        }
        if cache.traction.required() || cache.tangential_traction.required() {
            let t = lattice::traction::<L>(&hv.f_neq[..q], normal, stress_parameter);
            if cache.traction.required() {
                cache.traction.set(site, t);
            }
            if cache.tangential_traction.required() {
                let tn = t[0] * normal[0] + t[1] * normal[1] + t[2] * normal[2];
                cache.tangential_traction.set(
                    site,
                    [t[0] - tn * normal[0], t[1] - tn * normal[1], t[2] - tn * normal[2]],
                );
            }
        }
    }
}

/// Second pass over wall links, run after `copy_received` so both `f_old`
/// (post-collision) and `f_new` (post-stream) values are in place on every
/// side of the link.
pub fn post_step<L: Lattice, K: Kernel<L>>(
    domain: &mut FluidDomain<L>,
    kernel: &mut K,
    policies: &StreamerPolicies,
    range: (usize, usize),
) {
    if !policies.wall.needs_post_step() {
        return;
    }
    let q = L::Q;
    let local_slots = domain.site_count() * q;
    let mut site_feq = [0.0f64; MAX_Q];
    let mut ghost_feq = [0.0f64; MAX_Q];
    let access = domain.stream_access();

    for site in range.0..range.1 {
        let base = site * q;
        let data = &access.site_data[site];
        if !data.site_type.has_wall() {
            continue;
        }
        for d in 1..q {
            let link = data.link(d);
            if link.kind != LinkKind::Wall {
                continue;
            }
            let unstreamed = L::INVERSE[d];
            match policies.wall {
                WallPolicy::Bfl => {
                    // Interpolated bounce-back on the cut distance. `f_old`
                    // holds the post-collision values; `f_new[base + d]`
                    // holds what streamed in from the next site away from
                    // the wall.
                    let two_q = 2.0 * link.distance;
                    access.f_new[base + unstreamed] = if two_q < 1.0 {
                        access.f_new[base + d]
                            + two_q * (access.f_old[base + d] - access.f_new[base + d])
                    } else {
                        access.f_old[base + unstreamed]
                            + (1.0 / two_q)
                                * (access.f_old[base + d] - access.f_old[base + unstreamed])
                    };
                }
                WallPolicy::GuoZhengShi => {
                    let cut = link.distance;
                    let (density, momentum) =
                        lattice::density_and_momentum::<L>(&access.f_old[base..base + q]);
                    let u_f = [
                        momentum[0] / density,
                        momentum[1] / density,
                        momentum[2] / density,
                    ];
                    // Fictitious velocity at the solid node, extrapolated
                    // along the link (the wall itself is at rest). The
                    // two-point form engages when the cut is short and the
                    // next site away from the wall is a local fluid site.
                    let away_slot = access.neighbour_index[base + unstreamed];
                    let mut u_b = [
                        (cut - 1.0) / cut * u_f[0],
                        (cut - 1.0) / cut * u_f[1],
                        (cut - 1.0) / cut * u_f[2],
                    ];
                    if cut < 0.75 && away_slot < local_slots {
                        let second = away_slot / q;
                        let (density_2, momentum_2) = lattice::density_and_momentum::<L>(
                            &access.f_old[second * q..(second + 1) * q],
                        );
                        let w2 = (1.0 - cut) * (cut - 1.0) / (1.0 + cut);
                        for a in 0..3 {
                            u_b[a] = (cut - 1.0) * u_f[a]
                                + w2 * momentum_2[a] / density_2;
                        }
                    }
                    kernel.equilibrium(density, momentum, &mut site_feq[..q]);
                    let ghost_momentum =
                        [density * u_b[0], density * u_b[1], density * u_b[2]];
                    kernel.equilibrium(density, ghost_momentum, &mut ghost_feq[..q]);
                    // The post-collision non-equilibrium already carries
                    // the (1 - omega) factor.
                    let f_neq = access.f_old[base + unstreamed] - site_feq[unstreamed];
                    access.f_new[base + unstreamed] = ghost_feq[unstreamed] + f_neq;
                }
                WallPolicy::SimpleBounceBack => unreachable!(),
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainBuilder;
    use crate::kernels::Lbgk;
    use crate::lattice::D3Q15;
    use crate::site::{IoletId, Link, SiteData};

    fn no_iolets() -> IoletValueStore {
        IoletValueStore::new(Vec::new(), Vec::new())
    }

    fn single_wall_site() -> FluidDomain<D3Q15> {
        // One fluid site; every direction is either a wall cut (+x family)
        // or leaves the lattice.
        let mut b = DomainBuilder::new([1, 1, 1], 4, [false; 3]);
        let mut data = SiteData::bulk();
        for d in 1..15 {
            if D3Q15::CX[d] == 1 {
                data.set_link(d, Link::wall(0.5));
            }
        }
        data.classify(15);
        b.add_site([0, 0, 0], 0, data).unwrap();
        b.build::<D3Q15>(0).unwrap()
    }

    #[test]
    fn simple_bounce_back_reflects_into_the_inverse_direction() {
        let mut domain = single_wall_site();
        // A single population aimed into the wall; an effectively infinite
        // relaxation time freezes the collision so only streaming acts.
        let d = 1; // (+1, 0, 0), wall-cut
        for slot in domain.f_old_mut().iter_mut() {
            *slot = 0.0;
        }
        domain.f_old_mut()[d] = 0.25;
        for slot in domain.f_new_mut().iter_mut() {
            *slot = 0.0;
        }

        let params = LbmParameters::from_tau(1e15);
        let policies = StreamerPolicies {
            wall: WallPolicy::SimpleBounceBack,
            iolet: IoletPolicy::NashZerothOrderPressure,
        };
        let mut cache = PropertyCache::new(domain.site_count());
        let mut kernel = Lbgk;
        stream_and_collide(
            &mut domain,
            &mut kernel,
            &params,
            &policies,
            &no_iolets(),
            &mut cache,
            (0, 1),
        );

        let inverse = D3Q15::INVERSE[d];
        for slot in 0..15 {
            let value = domain.f_new()[slot];
            if slot == inverse {
                assert!((value - 0.25).abs() < 1e-12, "bounced value {value}");
            } else {
                assert!(value.abs() < 1e-12, "slot {slot} leaked {value}");
            }
        }
    }

    #[test]
    fn bfl_at_half_cut_matches_simple_bounce_back() {
        // 2q = 1 puts BFL exactly on the plain bounce-back branch.
        let run = |wall: WallPolicy| -> Vec<f64> {
            let mut domain = single_wall_site();
            let mut f = vec![0.0; domain.f_old().len()];
            lattice::equilibrium::<D3Q15>(1.02, [0.01, -0.004, 0.002], &mut f[..15]);
            domain.f_old_mut().copy_from_slice(&f);
            let params = LbmParameters::from_tau(0.8);
            let policies =
                StreamerPolicies { wall, iolet: IoletPolicy::NashZerothOrderPressure };
            let mut cache = PropertyCache::new(1);
            let mut kernel = Lbgk;
            stream_and_collide(
                &mut domain,
                &mut kernel,
                &params,
                &policies,
                &no_iolets(),
                &mut cache,
                (0, 1),
            );
            post_step(&mut domain, &mut kernel, &policies, (0, 1));
            domain.f_new()[..15].to_vec()
        };
        let bb = run(WallPolicy::SimpleBounceBack);
        let bfl = run(WallPolicy::Bfl);
        for d in 0..15 {
            let wall_cut = D3Q15::CX[d] == 1;
            if wall_cut || D3Q15::CX[D3Q15::INVERSE[d]] == 1 {
                // Only the wall-facing pairs are defined by the policies.
                assert!(
                    (bb[d] - bfl[d]).abs() < 1e-13,
                    "direction {d}: bb {} vs bfl {}",
                    bb[d],
                    bfl[d]
                );
            }
        }
    }

    #[test]
    fn guo_zheng_shi_keeps_a_resting_field_at_rest() {
        let mut domain = single_wall_site();
        let mut f = vec![0.0; domain.f_old().len()];
        lattice::equilibrium::<D3Q15>(1.0, [0.0; 3], &mut f[..15]);
        domain.f_old_mut().copy_from_slice(&f);
        domain.f_new_mut().copy_from_slice(&f);

        let params = LbmParameters::from_tau(0.8);
        let policies = StreamerPolicies {
            wall: WallPolicy::GuoZhengShi,
            iolet: IoletPolicy::NashZerothOrderPressure,
        };
        let mut cache = PropertyCache::new(1);
        let mut kernel = Lbgk;
        stream_and_collide(
            &mut domain,
            &mut kernel,
            &params,
            &policies,
            &no_iolets(),
            &mut cache,
            (0, 1),
        );
        post_step(&mut domain, &mut kernel, &policies, (0, 1));

        // At rest the extrapolated ghost state is the site's own
        // equilibrium, so every reconstructed population matches it.
        for d in 1..15 {
            if D3Q15::CX[d] == 1 {
                let unstreamed = D3Q15::INVERSE[d];
                assert!(
                    (domain.f_new()[unstreamed] - f[unstreamed]).abs() < 1e-14,
                    "direction {unstreamed} disturbed at rest"
                );
            }
        }
    }

    #[test]
    fn ladd_reduces_to_bounce_back_for_a_wall_at_rest() {
        use crate::boundaries::{IoletDescriptor, IoletKind, ValueSource};
        let make_store = |speed: f64| {
            let mut store = IoletValueStore::new(
                vec![IoletDescriptor {
                    kind: IoletKind::Velocity,
                    normal: [0.0, 0.0, -1.0],
                    position: [0.0; 3],
                    source: ValueSource::Cosine {
                        mean: speed,
                        amplitude: 0.0,
                        phase: 0.0,
                        period: 1.0,
                    },
                }],
                Vec::new(),
            );
            store.set_value(LinkKind::Inlet, 0, speed);
            store
        };
        let run = |speed: f64| -> (f64, f64) {
            let mut b = DomainBuilder::new([1, 1, 1], 4, [false; 3]).with_iolets(1, 0);
            let mut data = SiteData::bulk();
            let d = 5; // (0, 0, +1) out through the iolet
            data.set_link(d, Link::iolet(LinkKind::Inlet, 0.5, IoletId(0)));
            data.classify(15);
            b.add_site([0, 0, 0], 0, data).unwrap();
            let mut domain = b.build::<D3Q15>(0).unwrap();
            let mut f = vec![0.0; domain.f_old().len()];
            lattice::equilibrium::<D3Q15>(1.0, [0.0, 0.0, 0.001], &mut f[..15]);
            domain.f_old_mut().copy_from_slice(&f);

            let params = LbmParameters::from_tau(0.9);
            let policies =
                StreamerPolicies { wall: WallPolicy::SimpleBounceBack, iolet: IoletPolicy::Ladd };
            let mut cache = PropertyCache::new(1);
            let mut kernel = Lbgk;
            stream_and_collide(
                &mut domain,
                &mut kernel,
                &params,
                &policies,
                &make_store(speed),
                &mut cache,
                (0, 1),
            );
            let unstreamed = D3Q15::INVERSE[d];
            (domain.f_new()[unstreamed], domain.f_old()[d])
        };

        // A resting surface is plain bounce-back.
        let (bounced, outgoing) = run(0.0);
        assert!((bounced - outgoing).abs() < 1e-15);

        // A surface moving into the domain (against the outgoing link)
        // returns more than it received.
        let (bounced_moving, outgoing_moving) = run(0.01);
        assert!(bounced_moving > outgoing_moving);
    }

    #[test]
    fn nash_imposes_the_ghost_equilibrium() {
        let mut b = DomainBuilder::new([1, 1, 1], 4, [false; 3]).with_iolets(1, 0);
        let mut data = SiteData::bulk();
        let d = 5; // (0, 0, +1)
        data.set_link(d, Link::iolet(LinkKind::Inlet, 0.5, IoletId(0)));
        data.classify(15);
        b.add_site([0, 0, 0], 0, data).unwrap();
        let mut domain = b.build::<D3Q15>(0).unwrap();

        let ghost_density = 1.03;
        let iolets = {
            use crate::boundaries::{IoletDescriptor, IoletKind, ValueSource};
            let mut store = IoletValueStore::new(
                vec![IoletDescriptor {
                    kind: IoletKind::Pressure,
                    normal: [0.0, 0.0, -1.0],
                    position: [0.0; 3],
                    source: ValueSource::Cosine {
                        mean: ghost_density,
                        amplitude: 0.0,
                        phase: 0.0,
                        period: 1.0,
                    },
                }],
                Vec::new(),
            );
            store.set_value(LinkKind::Inlet, 0, ghost_density);
            store
        };

        // Start from rest: the momentum component along the normal is zero,
        // so the ghost state is (rho_ghost, 0).
        let params = LbmParameters::from_tau(1.0);
        let policies = StreamerPolicies {
            wall: WallPolicy::SimpleBounceBack,
            iolet: IoletPolicy::NashZerothOrderPressure,
        };
        let mut cache = PropertyCache::new(1);
        let mut kernel = Lbgk;
        stream_and_collide(
            &mut domain,
            &mut kernel,
            &params,
            &policies,
            &iolets,
            &mut cache,
            (0, 1),
        );

        let mut ghost = [0.0; MAX_Q];
        lattice::equilibrium::<D3Q15>(ghost_density, [0.0; 3], &mut ghost[..15]);
        let unstreamed = D3Q15::INVERSE[d];
        assert!((domain.f_new()[unstreamed] - ghost[unstreamed]).abs() < 1e-13);
    }

    #[test]
    fn outflow_variants_copy_the_expected_population() {
        for (policy, pick_inverse) in
            [(IoletPolicy::Outflow, false), (IoletPolicy::OutflowBounceBack, true)]
        {
            let mut b = DomainBuilder::new([1, 1, 1], 4, [false; 3]).with_iolets(0, 1);
            let mut data = SiteData::bulk();
            let d = 6; // (0, 0, -1)
            data.set_link(d, Link::iolet(LinkKind::Outlet, 0.3, IoletId(0)));
            data.classify(15);
            b.add_site([0, 0, 0], 0, data).unwrap();
            let mut domain = b.build::<D3Q15>(0).unwrap();
            let mut f = vec![0.0; domain.f_old().len()];
            lattice::equilibrium::<D3Q15>(0.99, [0.002, 0.001, -0.006], &mut f[..15]);
            domain.f_old_mut().copy_from_slice(&f);

            let iolets = {
                use crate::boundaries::{IoletDescriptor, IoletKind, ValueSource};
                IoletValueStore::new(
                    Vec::new(),
                    vec![IoletDescriptor {
                        kind: IoletKind::Pressure,
                        normal: [0.0, 0.0, 1.0],
                        position: [0.0; 3],
                        source: ValueSource::Cosine {
                            mean: 1.0,
                            amplitude: 0.0,
                            phase: 0.0,
                            period: 1.0,
                        },
                    }],
                )
            };
            let params = LbmParameters::from_tau(0.9);
            let policies =
                StreamerPolicies { wall: WallPolicy::SimpleBounceBack, iolet: policy };
            let mut cache = PropertyCache::new(1);
            let mut kernel = Lbgk;
            stream_and_collide(
                &mut domain,
                &mut kernel,
                &params,
                &policies,
                &iolets,
                &mut cache,
                (0, 1),
            );
            let unstreamed = D3Q15::INVERSE[d];
            // f_old now holds post-collision values.
            let expected = if pick_inverse {
                domain.f_old()[d]
            } else {
                domain.f_old()[unstreamed]
            };
            assert!((domain.f_new()[unstreamed] - expected).abs() < 1e-14);
        }
    }

    #[test]
    fn cache_is_filled_when_flagged() {
        let mut domain = single_wall_site();
        let mut f = vec![0.0; domain.f_old().len()];
        lattice::equilibrium::<D3Q15>(1.05, [0.01, 0.0, 0.0], &mut f[..15]);
        domain.f_old_mut().copy_from_slice(&f);
        let params = LbmParameters::from_tau(0.8);
        let policies = StreamerPolicies {
            wall: WallPolicy::SimpleBounceBack,
            iolet: IoletPolicy::NashZerothOrderPressure,
        };
        let mut cache = PropertyCache::new(1);
        cache.density.require();
        cache.velocity.require();
        let mut kernel = Lbgk;
        stream_and_collide(
            &mut domain,
            &mut kernel,
            &params,
            &policies,
            &no_iolets(),
            &mut cache,
            (0, 1),
        );
        assert!((cache.density.get(0) - 1.05).abs() < 1e-12);
        let u = cache.velocity.get(0);
        assert!((u[0] - 0.01 / 1.05).abs() < 1e-12);
    }
}
