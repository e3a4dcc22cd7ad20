//! Rank-to-rank transport & the Net request aggregator
//!
//! The step protocol needs three things from the message layer: tagged
//! non-blocking point-to-point sends, receives that are posted early and
//! completed at the phase barrier, and a MIN reduction for the stability
//! scalar. All of it is expressed against the [`Transport`] trait so the
//! domain, exchange, boundary and stability code take an explicit
//! communicator handle (no process-wide topology singleton).
//!
//! The in-tree implementation is [`RankFabric`]: one endpoint per rank,
//! message matching by `(source, tag)` channel with per-channel FIFO order,
//! exactly the guarantee the MPI runtime gives per communicator. Sends
//! never block; receives block only inside [`Net::wait`]. A deployment
//! binding to an MPI library implements the same trait and nothing above
//! this module changes.
//!
//! Payloads are `f64` words. Integer-valued messages (shared-link
//! coordinate quadruples at init, the stability scalar) ride in `f64`,
//! which is exact for magnitudes below 2^53.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

/// Rank of a process within the communicator, `0..size`.
pub type Rank = usize;

/// Logical channel id; every concern gets its own channel.
pub type Tag = u16;

/// Halo exchange of boundary-crossing distributions.
pub const TAG_HALO: Tag = 1;
/// Iolet value distribution, inlets.
pub const TAG_IOLET_INLET: Tag = 2;
/// Iolet value distribution, outlets.
pub const TAG_IOLET_OUTLET: Tag = 3;
/// Stability MIN-reduction, gather leg.
pub const TAG_STABILITY_GATHER: Tag = 4;
/// Stability MIN-reduction, broadcast leg.
pub const TAG_STABILITY_BCAST: Tag = 5;
/// Init-time shared-link list exchange.
pub const TAG_INIT_SHARED: Tag = 6;
/// Init-time iolet subscriber registration.
pub const TAG_INIT_IOLET: Tag = 7;

/// Communication failures. All of them are fatal for the run: the caller
/// aborts rather than retrying.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("rank {rank} out of range (size {size})")]
    InvalidRank { rank: Rank, size: usize },
    #[error("message from rank {from} tag {tag}: expected {expected} words, got {got}")]
    LengthMismatch { from: Rank, tag: Tag, expected: usize, got: usize },
    #[error("transport shut down while waiting on rank {from} tag {tag}")]
    Disconnected { from: Rank, tag: Tag },
}

/// The communicator seam. `send` must be non-blocking; `recv` blocks until
/// a message matching `(from, tag)` is available.
pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;
    fn size(&self) -> usize;
    fn send(&self, to: Rank, tag: Tag, payload: Vec<f64>) -> Result<(), CommError>;
    fn recv(&self, from: Rank, tag: Tag) -> Result<Vec<f64>, CommError>;
}

// ============================================================================
// In-process rank fabric
// ============================================================================

struct Mailbox {
    queues: Mutex<HashMap<(Rank, Tag), VecDeque<Vec<f64>>>>,
    arrived: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox { queues: Mutex::new(HashMap::new()), arrived: Condvar::new() }
    }
}

/// Shared state of an in-process communicator: one mailbox per rank.
pub struct RankFabric {
    mailboxes: Vec<Mailbox>,
}

impl RankFabric {
    /// Create a fabric of `size` ranks and return one endpoint per rank.
    /// Endpoints are handed to the per-rank threads; each is a full
    /// [`Transport`].
    pub fn endpoints(size: usize) -> Vec<FabricEndpoint> {
        assert!(size > 0, "communicator must have at least one rank");
        let fabric = Arc::new(RankFabric {
            mailboxes: (0..size).map(|_| Mailbox::new()).collect(),
        });
        (0..size)
            .map(|rank| FabricEndpoint { fabric: Arc::clone(&fabric), rank })
            .collect()
    }

    /// A single-rank communicator for serial runs and unit tests.
    pub fn solo() -> FabricEndpoint {
        RankFabric::endpoints(1).pop().unwrap()
    }
}

/// One rank's handle onto a [`RankFabric`].
pub struct FabricEndpoint {
    fabric: Arc<RankFabric>,
    rank: Rank,
}

impl Transport for FabricEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.mailboxes.len()
    }

    fn send(&self, to: Rank, tag: Tag, payload: Vec<f64>) -> Result<(), CommError> {
        let size = self.size();
        let mailbox = self
            .fabric
            .mailboxes
            .get(to)
            .ok_or(CommError::InvalidRank { rank: to, size })?;
        let mut queues = mailbox.queues.lock().expect("fabric mailbox poisoned");
        queues.entry((self.rank, tag)).or_default().push_back(payload);
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, from: Rank, tag: Tag) -> Result<Vec<f64>, CommError> {
        if from >= self.size() {
            return Err(CommError::InvalidRank { rank: from, size: self.size() });
        }
        let mailbox = &self.fabric.mailboxes[self.rank];
        let mut queues = mailbox.queues.lock().expect("fabric mailbox poisoned");
        loop {
            if let Some(queue) = queues.get_mut(&(from, tag)) {
                if let Some(payload) = queue.pop_front() {
                    return Ok(payload);
                }
            }
            queues = mailbox
                .arrived
                .wait(queues)
                .expect("fabric mailbox poisoned");
        }
    }
}

// ============================================================================
// Net: request aggregation with deferred completion
// ============================================================================

/// Handle to a posted receive; redeem it after [`Net::wait`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecvHandle(usize);

struct RecvSlot {
    from: Rank,
    tag: Tag,
    expected: usize,
    payload: Option<Vec<f64>>,
}

/// Aggregates the requests actors post during `RequestComms`, issues the
/// sends at the `Send` step and completes everything at `Wait`.
/// Sends copy their payload at request time;
/// the shared-region discipline (outbound slots written before
/// `request_send` is called on them) keeps that copy coherent.
pub struct Net {
    transport: Arc<dyn Transport>,
    queued_sends: Vec<(Rank, Tag, Vec<f64>)>,
    recvs: Vec<RecvSlot>,
}

impl Net {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Net { transport, queued_sends: Vec::new(), recvs: Vec::new() }
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Borrow the underlying transport (for collectives that manage their
    /// own channel).
    #[inline]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Queue a send of `data` to `to` on channel `tag`.
    pub fn request_send(&mut self, to: Rank, tag: Tag, data: &[f64]) {
        self.queued_sends.push((to, tag, data.to_vec()));
    }

    /// Post a receive of `expected` words from `from` on channel `tag`.
    pub fn request_receive(&mut self, from: Rank, tag: Tag, expected: usize) -> RecvHandle {
        self.recvs.push(RecvSlot { from, tag, expected, payload: None });
        RecvHandle(self.recvs.len() - 1)
    }

    /// Issue every queued send. Non-blocking by the transport contract.
    pub fn send(&mut self) -> Result<(), CommError> {
        for (to, tag, payload) in self.queued_sends.drain(..) {
            self.transport.send(to, tag, payload)?;
        }
        Ok(())
    }

    /// Complete every posted receive, blocking as needed. Length mismatches
    /// are protocol corruption and fatal.
    pub fn wait(&mut self) -> Result<(), CommError> {
        let transport = Arc::clone(&self.transport);
        for slot in self.recvs.iter_mut().filter(|s| s.payload.is_none()) {
            let payload = transport.recv(slot.from, slot.tag)?;
            if payload.len() != slot.expected {
                return Err(CommError::LengthMismatch {
                    from: slot.from,
                    tag: slot.tag,
                    expected: slot.expected,
                    got: payload.len(),
                });
            }
            slot.payload = Some(payload);
        }
        Ok(())
    }

    /// The payload of a completed receive. Panics if called before the
    /// handle's `wait` completed; that is a phase-ordering bug, not a
    /// runtime condition.
    pub fn received(&self, handle: RecvHandle) -> &[f64] {
        self.recvs[handle.0]
            .payload
            .as_deref()
            .expect("receive redeemed before Net::wait completed")
    }

    /// Drop all request state at end of iteration.
    pub fn clear(&mut self) {
        self.queued_sends.clear();
        self.recvs.clear();
    }
}

// ============================================================================
// MIN reduction (split into request + completion, like MPI_Iallreduce)
// ============================================================================

/// A split-phase allreduce-MIN over `i32` values: `start` at the Send step,
/// `complete` at the Wait step. Every rank must call both exactly once per
/// iteration that uses the channel.
pub struct MinReduction {
    gather_tag: Tag,
    bcast_tag: Tag,
    local: Option<i32>,
}

impl MinReduction {
    pub fn new(gather_tag: Tag, bcast_tag: Tag) -> Self {
        MinReduction { gather_tag, bcast_tag, local: None }
    }

    /// Contribute the local value; the gather leg is issued immediately
    /// (non-blocking).
    pub fn start(&mut self, transport: &dyn Transport, value: i32) -> Result<(), CommError> {
        debug_assert!(self.local.is_none(), "reduction started twice without completion");
        self.local = Some(value);
        if transport.size() > 1 && transport.rank() != 0 {
            transport.send(0, self.gather_tag, vec![value as f64])?;
        }
        Ok(())
    }

    /// Finish the reduction and return the global minimum.
    pub fn complete(&mut self, transport: &dyn Transport) -> Result<i32, CommError> {
        let local = self
            .local
            .take()
            .expect("reduction completed without a start");
        let size = transport.size();
        if size == 1 {
            return Ok(local);
        }
        if transport.rank() == 0 {
            let mut global = local;
            for from in 1..size {
                let payload = transport.recv(from, self.gather_tag)?;
                if payload.len() != 1 {
                    return Err(CommError::LengthMismatch {
                        from,
                        tag: self.gather_tag,
                        expected: 1,
                        got: payload.len(),
                    });
                }
                global = global.min(payload[0] as i32);
            }
            for to in 1..size {
                transport.send(to, self.bcast_tag, vec![global as f64])?;
            }
            Ok(global)
        } else {
            let payload = transport.recv(0, self.bcast_tag)?;
            if payload.len() != 1 {
                return Err(CommError::LengthMismatch {
                    from: 0,
                    tag: self.bcast_tag,
                    expected: 1,
                    got: payload.len(),
                });
            }
            Ok(payload[0] as i32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fabric_delivers_in_channel_order() {
        let mut endpoints = RankFabric::endpoints(2);
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();

        a.send(1, TAG_HALO, vec![1.0]).unwrap();
        a.send(1, TAG_HALO, vec![2.0]).unwrap();
        a.send(1, TAG_IOLET_INLET, vec![9.0]).unwrap();

        // Different tags are independent channels; same tag preserves order.
        assert_eq!(b.recv(0, TAG_IOLET_INLET).unwrap(), vec![9.0]);
        assert_eq!(b.recv(0, TAG_HALO).unwrap(), vec![1.0]);
        assert_eq!(b.recv(0, TAG_HALO).unwrap(), vec![2.0]);
    }

    #[test]
    fn net_round_trip_between_two_ranks() {
        let endpoints = RankFabric::endpoints(2);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                thread::spawn(move || {
                    let me = ep.rank();
                    let peer = 1 - me;
                    let mut net = Net::new(Arc::new(ep));
                    let h = net.request_receive(peer, TAG_HALO, 3);
                    net.request_send(peer, TAG_HALO, &[me as f64, 10.0, 20.0]);
                    net.send().unwrap();
                    net.wait().unwrap();
                    let got = net.received(h).to_vec();
                    net.clear();
                    got
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], vec![1.0, 10.0, 20.0]);
        assert_eq!(results[1], vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn min_reduction_agrees_on_every_rank() {
        let endpoints = RankFabric::endpoints(3);
        let handles: Vec<_> = endpoints
            .into_iter()
            .map(|ep| {
                thread::spawn(move || {
                    let value = match ep.rank() {
                        0 => 2,
                        1 => 0,
                        _ => 1,
                    };
                    let mut reduction =
                        MinReduction::new(TAG_STABILITY_GATHER, TAG_STABILITY_BCAST);
                    reduction.start(&ep, value).unwrap();
                    reduction.complete(&ep).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 0);
        }
    }

    #[test]
    fn solo_reduction_is_identity() {
        let ep = RankFabric::solo();
        let mut reduction = MinReduction::new(TAG_STABILITY_GATHER, TAG_STABILITY_BCAST);
        reduction.start(&ep, 7).unwrap();
        assert_eq!(reduction.complete(&ep).unwrap(), 7);
    }
}
