//! Phased per-iteration orchestration
//!
//! Every major component implements [`Actor`]: eight step methods, any of
//! which may be a no-op. The [`StepManager`] drives all registered actors
//! through the same fixed order each timestep:
//!
//! 1. `BeginIteration`  2. `RequestComms` (post requests with the Net)
//! 3. `PreSend` (edge-site work)  4. `Send` + Net issue  5. `PreReceive`
//! (inner-site work)  6. Net wait + actor `Wait`  7. `PostReceive`
//! (consume arrived data)  8. `EndIteration` (buffer swap, flag resets).
//!
//! With the in-process transport, posting a receive registers the match
//! immediately, so a separate receive-issuing sub-step has no work left to
//! do; completion still happens only at the wait. The manager is a
//! single-threaded cooperative loop per rank; the only parallelism is
//! between ranks.
//!
//! Actor order within a step is registration order, and it matters:
//! the iolet distributor publishes fresh values at the top of `PreSend`,
//! the LB actor reads them in the same step, and the stability monitor
//! scans the outcome afterwards.

use std::sync::Arc;

use crate::boundaries::{IoletDistributor, IoletValueStore};
use crate::cache::PropertyCache;
use crate::comm::{CommError, Net, Transport};
use crate::domain::{FluidDomain, GROUP_COUNT};
use crate::exchange::NeighbourExchange;
use crate::kernels::Kernel;
use crate::lattice::Lattice;
use crate::stability::{Stability, StabilityMonitor};
use crate::streamers::{self, StreamerPolicies};
use crate::LbmParameters;

/// Errors surfaced by the step loop. All are fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error("numerical instability at step {step} (resets exhausted)")]
    RepeatedInstability { step: u64 },
    #[error("numerical instability at step {step} and resets are disabled")]
    InstabilityWithoutReset { step: u64 },
}

/// Why the run loop stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunTermination {
    MaxSteps,
    Converged,
    ExternalTerminate,
}

/// Final accounting for a completed run.
#[derive(Copy, Clone, Debug)]
pub struct RunSummary {
    pub termination: RunTermination,
    pub steps: u64,
    pub resets: u32,
    pub final_stability: Stability,
}

// ============================================================================
// Simulation state
// ============================================================================

/// Timestep/cycle counters and the run-level flags every actor can see.
pub struct SimulationState {
    time_step: u64,
    steps_per_cycle: u64,
    cycle: u64,
    stability: Stability,
    terminate: bool,
}

impl SimulationState {
    pub fn new(steps_per_cycle: u64) -> Self {
        SimulationState {
            time_step: 0,
            steps_per_cycle: steps_per_cycle.max(1),
            cycle: 0,
            stability: Stability::Undefined,
            terminate: false,
        }
    }

    #[inline]
    pub fn time_step(&self) -> u64 {
        self.time_step
    }

    #[inline]
    pub fn steps_per_cycle(&self) -> u64 {
        self.steps_per_cycle
    }

    #[inline]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    #[inline]
    pub fn stability(&self) -> Stability {
        self.stability
    }

    #[inline]
    pub fn set_stability(&mut self, stability: Stability) {
        self.stability = stability;
    }

    /// External terminate flag (steering).
    #[inline]
    pub fn request_terminate(&mut self) {
        self.terminate = true;
    }

    #[inline]
    pub fn terminate_requested(&self) -> bool {
        self.terminate
    }

    fn advance(&mut self) {
        self.time_step += 1;
        if self.time_step % self.steps_per_cycle == 0 {
            self.cycle += 1;
        }
    }

    /// Restart the clock at a finer time resolution: the timestep halves by
    /// doubling the steps per cycle.
    fn reset(&mut self, refine_time: bool) {
        self.time_step = 0;
        self.cycle = 0;
        self.stability = Stability::Undefined;
        if refine_time {
            self.steps_per_cycle *= 2;
        }
    }
}

// ============================================================================
// Actor protocol
// ============================================================================

/// Shared per-step context handed to every actor. All cross-actor state
/// lives here; actors keep only their private bookkeeping.
pub struct StepContext<'a, L: Lattice> {
    pub domain: &'a mut FluidDomain<L>,
    pub net: &'a mut Net,
    pub iolets: &'a mut IoletValueStore,
    pub cache: &'a mut PropertyCache,
    pub state: &'a mut SimulationState,
    pub params: &'a LbmParameters,
}

/// The eight phase-step callbacks plus the instability reset hook.
#[allow(unused_variables)]
pub trait Actor<L: Lattice>: Send {
    fn begin_iteration(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    fn request_comms(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    fn pre_send(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    fn send(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    fn pre_receive(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    fn wait(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    fn post_receive(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    fn end_iteration(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
    /// Instability recovery: return to the post-init state.
    fn reset(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        Ok(())
    }
}

// ============================================================================
// The LB actor: collision + streaming + halo exchange
// ============================================================================

/// Drives stream-and-collide over the partitioned site ranges and the halo
/// exchange around them.
pub struct LbActor<L: Lattice, K: Kernel<L>> {
    kernel: K,
    policies: StreamerPolicies,
    exchange: NeighbourExchange,
    reference_density: f64,
    _lattice: std::marker::PhantomData<L>,
}

impl<L: Lattice, K: Kernel<L>> LbActor<L, K> {
    pub fn new(kernel: K, policies: StreamerPolicies, reference_density: f64) -> Self {
        LbActor {
            kernel,
            policies,
            exchange: NeighbourExchange::new(),
            reference_density,
            _lattice: std::marker::PhantomData,
        }
    }
}

impl<L: Lattice, K: Kernel<L>> Actor<L> for LbActor<L, K> {
    fn request_comms(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        self.exchange.post_receives(ctx.domain, ctx.net);
        Ok(())
    }

    fn pre_send(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        for g in 0..GROUP_COUNT {
            let range = ctx.domain.ordering().edge[g];
            if range.0 < range.1 {
                streamers::stream_and_collide(
                    ctx.domain,
                    &mut self.kernel,
                    ctx.params,
                    &self.policies,
                    ctx.iolets,
                    ctx.cache,
                    range,
                );
            }
        }
        Ok(())
    }

    fn send(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        self.exchange.post_sends(ctx.domain, ctx.net);
        Ok(())
    }

    fn pre_receive(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        for g in 0..GROUP_COUNT {
            let range = ctx.domain.ordering().inner[g];
            if range.0 < range.1 {
                streamers::stream_and_collide(
                    ctx.domain,
                    &mut self.kernel,
                    ctx.params,
                    &self.policies,
                    ctx.iolets,
                    ctx.cache,
                    range,
                );
            }
        }
        Ok(())
    }

    fn post_receive(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        self.exchange.complete(ctx.domain, ctx.net);
        ctx.domain.copy_received();
        if self.policies.wall.needs_post_step() {
            // Inner ranges first, then edge.
            for g in 0..GROUP_COUNT {
                let range = ctx.domain.ordering().inner[g];
                if range.0 < range.1 {
                    streamers::post_step(ctx.domain, &mut self.kernel, &self.policies, range);
                }
            }
            for g in 0..GROUP_COUNT {
                let range = ctx.domain.ordering().edge[g];
                if range.0 < range.1 {
                    streamers::post_step(ctx.domain, &mut self.kernel, &self.policies, range);
                }
            }
        }
        Ok(())
    }

    fn end_iteration(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        ctx.domain.swap();
        ctx.cache.reset_requirements();
        Ok(())
    }

    fn reset(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        ctx.domain.reset_to_equilibrium(self.reference_density);
        Ok(())
    }
}

// ============================================================================
// The iolet actor: value distribution
// ============================================================================

/// Wraps the per-kind distributors; must be registered before the LB actor
/// so fresh values are published before any streamer reads them.
pub struct IoletActor {
    distributors: Vec<IoletDistributor>,
    transport: Arc<dyn Transport>,
}

impl IoletActor {
    pub fn new(distributors: Vec<IoletDistributor>, transport: Arc<dyn Transport>) -> Self {
        IoletActor { distributors, transport }
    }
}

impl<L: Lattice> Actor<L> for IoletActor {
    fn request_comms(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        for distributor in &mut self.distributors {
            distributor.evaluate_and_send(
                ctx.iolets,
                ctx.state.time_step(),
                ctx.state.steps_per_cycle(),
                self.transport.as_ref(),
            )?;
        }
        Ok(())
    }

    fn pre_send(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        for distributor in &mut self.distributors {
            distributor.receive_and_publish(ctx.iolets, self.transport.as_ref())?;
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        for distributor in &mut self.distributors {
            distributor.distribute_now(
                ctx.iolets,
                0,
                ctx.state.steps_per_cycle(),
                self.transport.as_ref(),
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// The stability actor
// ============================================================================

/// Scans after the local collisions and folds the verdict into the shared
/// state at the wait.
pub struct StabilityActor {
    monitor: StabilityMonitor,
    transport: Arc<dyn Transport>,
}

impl StabilityActor {
    pub fn new(monitor: StabilityMonitor, transport: Arc<dyn Transport>) -> Self {
        StabilityActor { monitor, transport }
    }
}

impl<L: Lattice> Actor<L> for StabilityActor {
    fn pre_send(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        self.monitor.scan(ctx.domain);
        Ok(())
    }

    fn send(&mut self, _ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        self.monitor.start_reduction(self.transport.as_ref())?;
        Ok(())
    }

    fn wait(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        let global = self.monitor.finish_reduction(self.transport.as_ref())?;
        ctx.state.set_stability(global);
        Ok(())
    }

    fn reset(&mut self, ctx: &mut StepContext<'_, L>) -> Result<(), StepError> {
        self.monitor.reset();
        ctx.state.set_stability(Stability::Undefined);
        Ok(())
    }
}

// ============================================================================
// Step manager
// ============================================================================

/// Owns the shared state and the actor registry, and runs the phased loop.
pub struct StepManager<L: Lattice> {
    actors: Vec<Box<dyn Actor<L>>>,
    pub domain: FluidDomain<L>,
    pub net: Net,
    pub iolets: IoletValueStore,
    pub cache: PropertyCache,
    pub state: SimulationState,
    pub params: LbmParameters,
    resets: u32,
}

impl<L: Lattice> StepManager<L> {
    pub fn new(
        domain: FluidDomain<L>,
        net: Net,
        iolets: IoletValueStore,
        params: LbmParameters,
        steps_per_cycle: u64,
    ) -> Self {
        let cache = PropertyCache::new(domain.site_count());
        StepManager {
            actors: Vec::new(),
            domain,
            net,
            iolets,
            cache,
            state: SimulationState::new(steps_per_cycle),
            params,
            resets: 0,
        }
    }

    /// Register an actor; per-step invocation order is registration order.
    pub fn register(&mut self, actor: Box<dyn Actor<L>>) {
        self.actors.push(actor);
    }

    pub fn resets(&self) -> u32 {
        self.resets
    }

    fn with_actors<F>(&mut self, mut f: F) -> Result<(), StepError>
    where
        F: FnMut(&mut Box<dyn Actor<L>>, &mut StepContext<'_, L>) -> Result<(), StepError>,
    {
        let mut actors = std::mem::take(&mut self.actors);
        let mut result = Ok(());
        for actor in actors.iter_mut() {
            let mut ctx = StepContext {
                domain: &mut self.domain,
                net: &mut self.net,
                iolets: &mut self.iolets,
                cache: &mut self.cache,
                state: &mut self.state,
                params: &self.params,
            };
            result = f(actor, &mut ctx);
            if result.is_err() {
                break;
            }
        }
        self.actors = actors;
        result
    }

    /// One full timestep through the fixed phase order.
    pub fn step(&mut self) -> Result<(), StepError> {
        self.with_actors(|a, ctx| a.begin_iteration(ctx))?;
        self.with_actors(|a, ctx| a.request_comms(ctx))?;
        self.with_actors(|a, ctx| a.pre_send(ctx))?;
        self.with_actors(|a, ctx| a.send(ctx))?;
        self.net.send()?;
        self.with_actors(|a, ctx| a.pre_receive(ctx))?;
        self.net.wait()?;
        self.with_actors(|a, ctx| a.wait(ctx))?;
        self.with_actors(|a, ctx| a.post_receive(ctx))?;
        self.with_actors(|a, ctx| a.end_iteration(ctx))?;
        self.net.clear();
        self.state.advance();
        Ok(())
    }

    /// Re-initialise the run after a detected instability: fields at rest,
    /// monitors undefined, iolet values rebroadcast, the clock restarted at
    /// a finer resolution.
    pub fn reset_run(&mut self, refine_time: bool) -> Result<(), StepError> {
        tracing::info!(
            step = self.state.time_step(),
            refine_time,
            "resetting unstable simulation"
        );
        self.state.reset(refine_time);
        self.with_actors(|a, ctx| a.reset(ctx))?;
        self.net.clear();
        Ok(())
    }

    /// Run until one of the termination conditions: max steps executed,
    /// converged, or an external terminate request. Instability triggers
    /// one reset when `reset_on_instability` is set; any further
    /// instability (or any instability with resets disabled) is fatal.
    pub fn run_loop(
        &mut self,
        max_steps: u64,
        reset_on_instability: bool,
    ) -> Result<RunSummary, StepError> {
        let mut executed = 0u64;
        let termination = loop {
            if executed >= max_steps {
                break RunTermination::MaxSteps;
            }
            self.step()?;
            executed += 1;
            match self.state.stability() {
                Stability::Unstable => {
                    if !reset_on_instability {
                        return Err(StepError::InstabilityWithoutReset {
                            step: self.state.time_step(),
                        });
                    }
                    if self.resets >= 1 {
                        return Err(StepError::RepeatedInstability {
                            step: self.state.time_step(),
                        });
                    }
                    self.resets += 1;
                    self.reset_run(true)?;
                }
                Stability::StableAndConverged => break RunTermination::Converged,
                _ => {}
            }
            if self.state.terminate_requested() {
                break RunTermination::ExternalTerminate;
            }
        };
        Ok(RunSummary {
            termination,
            steps: executed,
            resets: self.resets,
            final_stability: self.state.stability(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_clock_and_reset_semantics() {
        let mut state = SimulationState::new(100);
        for _ in 0..250 {
            state.advance();
        }
        assert_eq!(state.time_step(), 250);
        assert_eq!(state.cycle(), 2);

        state.reset(true);
        assert_eq!(state.time_step(), 0);
        assert_eq!(state.cycle(), 0);
        assert_eq!(state.steps_per_cycle(), 200);
        assert_eq!(state.stability(), Stability::Undefined);

        state.reset(false);
        assert_eq!(state.steps_per_cycle(), 200);
    }

    #[test]
    fn terminate_flag_is_sticky() {
        let mut state = SimulationState::new(10);
        assert!(!state.terminate_requested());
        state.request_terminate();
        state.advance();
        assert!(state.terminate_requested());
    }
}
