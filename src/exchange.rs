//! Halo exchange of boundary-crossing distributions
//!
//! Each pair of neighbouring ranks shares an ordered list of links; the
//! lower-ranked side owns the canonical (site, direction) identity and the
//! higher-ranked side derives the same list by translating its own entries
//! by `c[d]` and inverting the direction. Both derivations happen
//! independently inside [`crate::domain::DomainBuilder::build`]; under the
//! `strict-exchange-check` feature the lists are exchanged once at init and
//! compared entry by entry, failing setup on any disagreement.
//!
//! Per iteration the protocol is:
//!
//! 1. `post_receives` during `RequestComms`: one receive per neighbour
//!    covering its inbound slice of the shared region.
//! 2. Edge-site stream-and-collide fills the outbound slots in `f_new`'s
//!    tail (`PreSend`).
//! 3. `post_sends` at the `Send` step snapshots the outbound slices and the
//!    Net issues them.
//! 4. After `Net::wait`, `complete` lands every inbound payload in
//!    `f_old`'s shared tail, and [`FluidDomain::copy_received`] distributes
//!    the values to the interior `f_new` slots they belong to.
//!
//! Any transport error is fatal; there is no per-peer recovery.

use crate::comm::{Net, RecvHandle, TAG_HALO, TAG_INIT_SHARED};
use crate::domain::{FluidDomain, SetupError};
use crate::lattice::Lattice;

/// Per-rank halo-exchange driver. Holds only per-iteration request state;
/// the shared-region layout lives in the domain.
pub struct NeighbourExchange {
    pending: Vec<PendingRecv>,
}

struct PendingRecv {
    first_shared: usize,
    count: usize,
    handle: RecvHandle,
}

impl NeighbourExchange {
    pub fn new() -> Self {
        NeighbourExchange { pending: Vec::new() }
    }

    /// Cross-check both ends' shared-link derivations (one exchange per
    /// neighbour pair). The lower rank sends its canonical
    /// `(x, y, z, direction)` quadruples; the higher rank compares them
    /// against its own derivation.
    #[cfg(feature = "strict-exchange-check")]
    pub fn verify_shared_lists<L: Lattice>(
        &self,
        domain: &FluidDomain<L>,
        net: &mut Net,
    ) -> Result<(), SetupError> {
        let my_rank = net.rank();

        let canon_of = |rank: usize| -> Vec<(usize, [i64; 3], usize)> {
            domain
                .shared_meta()
                .iter()
                .enumerate()
                .filter(|(_, (peer, _, _))| *peer == rank)
                .map(|(slot, &(_, coords, dir))| (slot, coords, dir))
                .collect()
        };

        let mut posted: Vec<(usize, RecvHandle)> = Vec::new();
        for neighbour in domain.neighbours() {
            let slots = canon_of(neighbour.rank);
            if my_rank < neighbour.rank {
                let mut payload = Vec::with_capacity(4 * slots.len());
                for (_, coords, dir) in &slots {
                    payload.extend(coords.iter().map(|&c| c as f64));
                    payload.push(*dir as f64);
                }
                net.request_send(neighbour.rank, TAG_INIT_SHARED, &payload);
            } else {
                let handle =
                    net.request_receive(neighbour.rank, TAG_INIT_SHARED, 4 * slots.len());
                posted.push((neighbour.rank, handle));
            }
        }
        net.send()?;
        net.wait()?;

        // Higher-ranked side replays the comparison against its own
        // derivation.
        for (peer, handle) in posted {
            let payload = net.received(handle).to_vec();
            for (k, (slot, coords, dir)) in canon_of(peer).into_iter().enumerate() {
                let got = &payload[4 * k..4 * k + 4];
                let matches =
                    (0..3).all(|a| got[a] as i64 == coords[a]) && got[3] as usize == dir;
                if !matches {
                    return Err(SetupError::SharedListMismatch { peer, slot });
                }
            }
        }
        net.clear();
        tracing::debug!(rank = my_rank, "shared-link lists verified");
        Ok(())
    }

    /// Post one receive per neighbour into the inbound shared region
    /// (`RequestComms` step).
    pub fn post_receives<L: Lattice>(&mut self, domain: &FluidDomain<L>, net: &mut Net) {
        debug_assert!(self.pending.is_empty(), "receives already posted this iteration");
        for neighbour in domain.neighbours() {
            let handle = net.request_receive(neighbour.rank, TAG_HALO, neighbour.count);
            self.pending.push(PendingRecv {
                first_shared: neighbour.first_shared,
                count: neighbour.count,
                handle,
            });
        }
    }

    /// Queue one send per neighbour from the outbound shared region of
    /// `f_new` (`Send` step, after the edge sites have been streamed).
    pub fn post_sends<L: Lattice>(&self, domain: &FluidDomain<L>, net: &mut Net) {
        for neighbour in domain.neighbours() {
            let region =
                &domain.f_new()[neighbour.first_shared..neighbour.first_shared + neighbour.count];
            net.request_send(neighbour.rank, TAG_HALO, region);
        }
    }

    /// Land every completed inbound payload in `f_old`'s shared tail
    /// (`PostReceive` step, after `Net::wait`).
    pub fn complete<L: Lattice>(&mut self, domain: &mut FluidDomain<L>, net: &Net) {
        for pending in self.pending.drain(..) {
            let payload = net.received(pending.handle);
            debug_assert_eq!(payload.len(), pending.count);
            domain.f_old_mut()[pending.first_shared..pending.first_shared + pending.count]
                .copy_from_slice(payload);
        }
    }
}

impl Default for NeighbourExchange {
    fn default() -> Self {
        Self::new()
    }
}
