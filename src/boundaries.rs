//! Iolet boundary values & their distribution
//!
//! Each inlet/outlet surface carries a time-dependent scalar: a ghost
//! density for pressure-imposing iolets, a speed along the surface normal
//! for velocity-imposing ones. Values are evaluated once per timestep on
//! the controller rank (rank 0 of the communicator, passed in explicitly)
//! and shipped to every rank owning at least one site of the iolet.
//!
//! Registration happens once at init: every rank sends the controller a
//! bitmap of the iolets it touches, and the controller keeps per-iolet
//! subscriber lists. Per iteration the controller evaluates and issues its
//! non-blocking sends during `RequestComms`; subscribers complete the
//! receive at the top of `PreSend`, before any streamer reads a value.
//! All quantities are in lattice units; the external unit converter has
//! already been applied to the configured waveforms.

use std::f64::consts::PI;

use crate::comm::{CommError, Tag, Transport, TAG_INIT_IOLET};
use crate::domain::FluidDomain;
use crate::lattice::Lattice;
use crate::site::{IoletId, LinkKind};

/// What the iolet imposes on the flow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IoletKind {
    /// Ghost density (pressure) prescribed; Nash-type streamers use it.
    Pressure,
    /// Speed along the normal prescribed; Ladd-type streamers use it.
    Velocity,
}

/// Time-series table: (cycle fraction, value) pairs, linearly interpolated
/// and wrapped over the cycle.
#[derive(Clone, Debug)]
pub struct TimeSeries {
    samples: Vec<(f64, f64)>,
}

#[derive(Debug, thiserror::Error)]
pub enum TimeSeriesError {
    #[error("time series needs at least two samples (got {0})")]
    TooShort(usize),
    #[error("time series times must be strictly increasing at row {0}")]
    NotMonotone(usize),
    #[error("time series parse error at line {line}: `{token}`")]
    Parse { line: usize, token: String },
}

impl TimeSeries {
    pub fn new(samples: Vec<(f64, f64)>) -> Result<Self, TimeSeriesError> {
        if samples.len() < 2 {
            return Err(TimeSeriesError::TooShort(samples.len()));
        }
        for i in 1..samples.len() {
            if samples[i].0 <= samples[i - 1].0 {
                return Err(TimeSeriesError::NotMonotone(i));
            }
        }
        Ok(TimeSeries { samples })
    }

    /// Parse `time value` rows; `#` starts a comment, blank lines skipped.
    pub fn parse(text: &str) -> Result<Self, TimeSeriesError> {
        let mut samples = Vec::new();
        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let mut next = |line_no: usize| -> Result<f64, TimeSeriesError> {
                let token = fields.next().ok_or_else(|| TimeSeriesError::Parse {
                    line: line_no + 1,
                    token: String::from("<missing field>"),
                })?;
                token.parse::<f64>().map_err(|_| TimeSeriesError::Parse {
                    line: line_no + 1,
                    token: token.to_string(),
                })
            };
            let t = next(line_no)?;
            let v = next(line_no)?;
            samples.push((t, v));
        }
        TimeSeries::new(samples)
    }

    /// Value at cycle fraction `t` (wrapped into the sampled span).
    pub fn value_at(&self, t: f64) -> f64 {
        let t0 = self.samples[0].0;
        let t1 = self.samples[self.samples.len() - 1].0;
        let span = t1 - t0;
        let mut x = (t - t0).rem_euclid(span) + t0;
        if !x.is_finite() {
            x = t0;
        }
        let pos = self.samples.partition_point(|&(st, _)| st <= x);
        if pos == 0 {
            return self.samples[0].1;
        }
        if pos >= self.samples.len() {
            return self.samples[self.samples.len() - 1].1;
        }
        let (ta, va) = self.samples[pos - 1];
        let (tb, vb) = self.samples[pos];
        va + (vb - va) * (x - ta) / (tb - ta)
    }
}

/// Where an iolet's value comes from.
#[derive(Clone, Debug)]
pub enum ValueSource {
    /// `mean + amplitude * cos(2 pi t / period + phase)` with `t` in
    /// cycles (period is normally 1.0).
    Cosine { mean: f64, amplitude: f64, phase: f64, period: f64 },
    /// File-driven waveform over the cycle.
    TimeSeries(TimeSeries),
}

impl ValueSource {
    /// Evaluate at timestep `step` of a cycle of `steps_per_cycle`.
    pub fn value_at(&self, step: u64, steps_per_cycle: u64) -> f64 {
        let t = step as f64 / steps_per_cycle.max(1) as f64;
        match self {
            ValueSource::Cosine { mean, amplitude, phase, period } => {
                mean + amplitude * (2.0 * PI * t / period + phase).cos()
            }
            ValueSource::TimeSeries(series) => series.value_at(t),
        }
    }
}

/// One iolet surface: position and normal in lattice coordinates, the
/// imposed quantity, and its value source.
#[derive(Clone, Debug)]
pub struct IoletDescriptor {
    pub kind: IoletKind,
    /// Unit normal pointing into the fluid domain.
    pub normal: [f64; 3],
    pub position: [f64; 3],
    pub source: ValueSource,
}

// ============================================================================
// Value store (read by streamers)
// ============================================================================

/// The per-rank snapshot of every iolet's current value, refreshed once per
/// iteration before any streamer runs.
pub struct IoletValueStore {
    inlets: Vec<IoletDescriptor>,
    outlets: Vec<IoletDescriptor>,
    inlet_values: Vec<f64>,
    outlet_values: Vec<f64>,
}

impl IoletValueStore {
    pub fn new(inlets: Vec<IoletDescriptor>, outlets: Vec<IoletDescriptor>) -> Self {
        let inlet_values = inlets
            .iter()
            .map(|d| match d.kind {
                IoletKind::Pressure => 1.0,
                IoletKind::Velocity => 0.0,
            })
            .collect();
        let outlet_values = outlets
            .iter()
            .map(|d| match d.kind {
                IoletKind::Pressure => 1.0,
                IoletKind::Velocity => 0.0,
            })
            .collect();
        IoletValueStore { inlets, outlets, inlet_values, outlet_values }
    }

    #[inline]
    pub fn count(&self, kind: LinkKind) -> usize {
        match kind {
            LinkKind::Inlet => self.inlets.len(),
            LinkKind::Outlet => self.outlets.len(),
            _ => 0,
        }
    }

    #[inline]
    pub fn descriptor(&self, kind: LinkKind, id: IoletId) -> &IoletDescriptor {
        match kind {
            LinkKind::Inlet => &self.inlets[id.as_usize()],
            _ => &self.outlets[id.as_usize()],
        }
    }

    #[inline]
    pub fn value(&self, kind: LinkKind, id: IoletId) -> f64 {
        match kind {
            LinkKind::Inlet => self.inlet_values[id.as_usize()],
            _ => self.outlet_values[id.as_usize()],
        }
    }

    #[inline]
    pub fn set_value(&mut self, kind: LinkKind, id: usize, value: f64) {
        match kind {
            LinkKind::Inlet => self.inlet_values[id] = value,
            _ => self.outlet_values[id] = value,
        }
    }

    /// Ghost density used by pressure-imposing treatments.
    #[inline]
    pub fn ghost_density(&self, kind: LinkKind, id: IoletId) -> f64 {
        match self.descriptor(kind, id).kind {
            IoletKind::Pressure => self.value(kind, id),
            // Velocity iolets leave the density free.
            IoletKind::Velocity => 1.0,
        }
    }

    /// Surface velocity used by velocity-imposing treatments.
    #[inline]
    pub fn wall_velocity(&self, kind: LinkKind, id: IoletId) -> [f64; 3] {
        let descriptor = self.descriptor(kind, id);
        let speed = match descriptor.kind {
            IoletKind::Velocity => self.value(kind, id),
            IoletKind::Pressure => 0.0,
        };
        [
            speed * descriptor.normal[0],
            speed * descriptor.normal[1],
            speed * descriptor.normal[2],
        ]
    }

    #[inline]
    pub fn normal(&self, kind: LinkKind, id: IoletId) -> [f64; 3] {
        self.descriptor(kind, id).normal
    }
}

// ============================================================================
// Controller/subscriber distribution
// ============================================================================

/// Iolet ids of `kind` with at least one cut link on this rank, ascending.
pub fn local_iolets<L: Lattice>(domain: &FluidDomain<L>, kind: LinkKind) -> Vec<usize> {
    let mut out: Vec<usize> = Vec::new();
    for site in 0..domain.site_count() {
        let data = domain.site_data(site);
        for d in 1..L::Q {
            let link = data.link(d);
            if link.kind == kind {
                if let Some(id) = link.iolet {
                    if !out.contains(&id.as_usize()) {
                        out.push(id.as_usize());
                    }
                }
            }
        }
    }
    out.sort_unstable();
    out
}

/// Distributes one iolet kind's values from the controller rank to its
/// subscribers every iteration. One instance per kind, each on its own tag
/// channel.
pub struct IoletDistributor {
    kind: LinkKind,
    tag: Tag,
    iolet_count: usize,
    /// Ids this rank touches, ascending (receive payload order).
    local_ids: Vec<usize>,
    /// Controller only: for each rank, the ids it subscribed to.
    subscribers: Vec<Vec<usize>>,
    /// Scratch for the controller's per-step evaluation.
    current: Vec<f64>,
}

impl IoletDistributor {
    /// Register this rank with the controller and build the subscriber
    /// lists. Collective over the communicator: every rank must call it, in
    /// the same order per kind.
    pub fn register<L: Lattice>(
        kind: LinkKind,
        tag: Tag,
        iolet_count: usize,
        domain: &FluidDomain<L>,
        transport: &dyn Transport,
    ) -> Result<Self, CommError> {
        debug_assert!(matches!(kind, LinkKind::Inlet | LinkKind::Outlet));
        let local_ids = local_iolets(domain, kind);
        let size = transport.size();
        let mut subscribers = Vec::new();
        if transport.rank() == 0 {
            subscribers = vec![Vec::new(); size];
            subscribers[0] = local_ids.clone();
            for rank in 1..size {
                let bitmap = transport.recv(rank, TAG_INIT_IOLET)?;
                if bitmap.len() != iolet_count {
                    return Err(CommError::LengthMismatch {
                        from: rank,
                        tag: TAG_INIT_IOLET,
                        expected: iolet_count,
                        got: bitmap.len(),
                    });
                }
                subscribers[rank] =
                    (0..iolet_count).filter(|&i| bitmap[i] != 0.0).collect();
            }
        } else {
            let mut bitmap = vec![0.0f64; iolet_count];
            for &id in &local_ids {
                bitmap[id] = 1.0;
            }
            transport.send(0, TAG_INIT_IOLET, bitmap)?;
        }
        tracing::debug!(
            rank = transport.rank(),
            ?kind,
            locals = local_ids.len(),
            "iolet distributor registered"
        );
        Ok(IoletDistributor {
            kind,
            tag,
            iolet_count,
            local_ids,
            subscribers,
            current: vec![0.0; iolet_count],
        })
    }

    #[inline]
    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    /// Controller: evaluate every iolet and issue the per-subscriber sends
    /// (non-blocking). Subscribers do nothing here. `RequestComms` step.
    pub fn evaluate_and_send(
        &mut self,
        store: &IoletValueStore,
        step: u64,
        steps_per_cycle: u64,
        transport: &dyn Transport,
    ) -> Result<(), CommError> {
        if transport.rank() != 0 {
            return Ok(());
        }
        for id in 0..self.iolet_count {
            self.current[id] = store
                .descriptor(self.kind, IoletId(id))
                .source
                .value_at(step, steps_per_cycle);
        }
        for (rank, ids) in self.subscribers.iter().enumerate().skip(1) {
            if ids.is_empty() {
                continue;
            }
            let payload: Vec<f64> = ids.iter().map(|&id| self.current[id]).collect();
            transport.send(rank, self.tag, payload)?;
        }
        Ok(())
    }

    /// Complete the receive and publish the fresh values into the store.
    /// Runs at the top of `PreSend`, before any streamer reads a value.
    pub fn receive_and_publish(
        &mut self,
        store: &mut IoletValueStore,
        transport: &dyn Transport,
    ) -> Result<(), CommError> {
        if transport.rank() == 0 {
            for id in 0..self.iolet_count {
                store.set_value(self.kind, id, self.current[id]);
            }
            return Ok(());
        }
        if self.local_ids.is_empty() {
            return Ok(());
        }
        let payload = transport.recv(0, self.tag)?;
        if payload.len() != self.local_ids.len() {
            return Err(CommError::LengthMismatch {
                from: 0,
                tag: self.tag,
                expected: self.local_ids.len(),
                got: payload.len(),
            });
        }
        for (&id, &value) in self.local_ids.iter().zip(payload.iter()) {
            store.set_value(self.kind, id, value);
        }
        Ok(())
    }

    /// Run a full distribute cycle immediately (init and instability
    /// reset).
    pub fn distribute_now(
        &mut self,
        store: &mut IoletValueStore,
        step: u64,
        steps_per_cycle: u64,
        transport: &dyn Transport,
    ) -> Result<(), CommError> {
        self.evaluate_and_send(store, step, steps_per_cycle, transport)?;
        self.receive_and_publish(store, transport)
    }
}

// ============================================================================
// Tests
// ============================================================================
