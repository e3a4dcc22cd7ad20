//! The local fluid domain: blocks, buffers, neighbour table
//!
//! One `FluidDomain` per rank. It owns:
//!
//! - the two distribution arrays `f_old` / `f_new`, each of length
//!   `Q * N_local + 1 + N_shared`: site-major slots, then the sentinel
//!   no-propagation slot, then the shared region exchanged with
//!   neighbouring ranks;
//! - the dense neighbour index table: for `(site, direction)` the absolute
//!   slot its post-collision value streams into (a local slot, the
//!   sentinel, or an outbound shared slot);
//! - per-site metadata ([`SiteData`]) and the inner/edge x site-type range
//!   partition that collision drivers walk;
//! - the per-neighbour shared-region layout and the receive lookup built by
//!   [`crate::exchange`].
//!
//! Sites are grouped so the range `[0, inner_count)` holds sites with no
//! inter-partition links and `[inner_count, N_local)` the edge sites;
//! within each half sites are contiguous per site-type group. The swap at
//! end of iteration is a pointer exchange; the shared region received into
//! `f_old` at step `t` therefore sits in `f_new`'s tail when step `t + 1`
//! reads it, which is exactly what the receive lookup accounts for.
//!
//! Site views borrow the domain (arena + index); per-site records store no
//! back-pointers.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use crate::comm::Rank;
use crate::lattice::{self, Lattice};
use crate::site::{IoletId, Link, LinkKind, SiteData, SiteDataError, SiteType};

/// Global lattice coordinates of a site.
pub type GlobalCoords = [i64; 3];

/// Fatal bring-up failures; the run aborts before the time loop.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    SiteData(#[from] SiteDataError),
    #[error("site {0:?} listed more than once")]
    DuplicateSite(GlobalCoords),
    #[error("site {0:?} outside the {1:?}-site lattice")]
    SiteOutsideLattice(GlobalCoords, [usize; 3]),
    #[error("rank {rank} owns no fluid sites")]
    EmptyPartition { rank: Rank },
    #[error("relaxation time {0} must exceed 0.5")]
    BadRelaxationTime(f64),
    #[error("shared-link lists disagree with rank {peer}: slot {slot}")]
    SharedListMismatch { peer: Rank, slot: usize },
    #[error("communication failed during setup: {0}")]
    Comm(#[from] crate::comm::CommError),
    #[error("wall treatment {0} is not available in this build")]
    UnsupportedWallTreatment(&'static str),
}

/// Site-type groups in collision-driver order.
pub const GROUP_COUNT: usize = 6;

/// The position of a site type's range within each (inner/edge) half.
#[inline]
pub fn group_of(site_type: SiteType) -> usize {
    match site_type {
        SiteType::BulkFluid => 0,
        SiteType::Wall => 1,
        SiteType::Inlet => 2,
        SiteType::Outlet => 3,
        SiteType::InletWall => 4,
        SiteType::OutletWall => 5,
    }
}

/// One neighbouring rank's slice of the shared region.
#[derive(Clone, Debug)]
pub struct NeighbourRank {
    pub rank: Rank,
    /// First shared slot in the distribution arrays.
    pub first_shared: usize,
    /// Number of shared links with this neighbour.
    pub count: usize,
}

/// Inner/edge x site-type partition of `[0, N_local)`.
#[derive(Clone, Debug, Default)]
pub struct SiteOrdering {
    /// `inner[g]` is the half-open range of inner sites in group `g`.
    pub inner: [(usize, usize); GROUP_COUNT],
    /// `edge[g]` likewise for edge sites.
    pub edge: [(usize, usize); GROUP_COUNT],
}

impl SiteOrdering {
    /// Number of sites with no inter-partition links.
    #[inline]
    pub fn inner_count(&self) -> usize {
        self.inner.last().map(|r| r.1).unwrap_or(0)
    }
}

/// The per-rank spatial data model plus distribution storage.
pub struct FluidDomain<L: Lattice> {
    f_old: Vec<f64>,
    f_new: Vec<f64>,
    neighbour_index: Vec<usize>,
    site_data: Vec<SiteData>,
    coords: Vec<GlobalCoords>,
    ordering: SiteOrdering,
    neighbours: Vec<NeighbourRank>,
    /// `recv_lookup[k]`: the `f_new` slot the k-th inbound shared value is
    /// copied into after the halo wait.
    recv_lookup: Vec<usize>,
    /// Canonical identity (peer, lower-rank coords, lower-rank direction)
    /// of each shared slot, kept for the init-time cross-check.
    shared_meta: Vec<(Rank, GlobalCoords, usize)>,
    site_count: usize,
    shared_count: usize,
    _lattice: PhantomData<L>,
}

impl<L: Lattice> FluidDomain<L> {
    /// Number of locally owned fluid sites.
    #[inline]
    pub fn site_count(&self) -> usize {
        self.site_count
    }

    /// Total shared slots across all neighbours.
    #[inline]
    pub fn shared_count(&self) -> usize {
        self.shared_count
    }

    /// Index of the sentinel no-propagation slot.
    #[inline]
    pub fn sentinel(&self) -> usize {
        self.site_count * L::Q
    }

    /// First slot of the shared region.
    #[inline]
    pub fn shared_base(&self) -> usize {
        self.site_count * L::Q + 1
    }

    #[inline]
    pub fn ordering(&self) -> &SiteOrdering {
        &self.ordering
    }

    #[inline]
    pub fn neighbours(&self) -> &[NeighbourRank] {
        &self.neighbours
    }

    #[inline]
    pub fn recv_lookup(&self) -> &[usize] {
        &self.recv_lookup
    }

    /// Canonical (peer, coords, direction) of each shared slot, in slot
    /// order.
    #[inline]
    pub fn shared_meta(&self) -> &[(Rank, GlobalCoords, usize)] {
        &self.shared_meta
    }

    /// Global coordinates of a local site.
    #[inline]
    pub fn coords_of(&self, site: usize) -> GlobalCoords {
        self.coords[site]
    }

    /// Read-only metadata view of one site.
    #[inline]
    pub fn site(&self, index: usize) -> Site<'_, L> {
        Site { domain: self, index }
    }

    #[inline]
    pub fn site_data(&self, index: usize) -> &SiteData {
        &self.site_data[index]
    }

    /// Where `(site, direction)` streams to.
    #[inline]
    pub fn stream_index(&self, site: usize, direction: usize) -> usize {
        self.neighbour_index[site * L::Q + direction]
    }

    /// Both distribution buffers, for the stream-and-collide drivers.
    #[inline]
    pub fn buffers_mut(&mut self) -> (&mut [f64], &mut [f64]) {
        (&mut self.f_old, &mut self.f_new)
    }

    /// Split view for the hot loop: both buffers mutably plus the immutable
    /// tables, borrowed disjointly.
    #[inline]
    pub fn stream_access(&mut self) -> StreamAccess<'_> {
        StreamAccess {
            f_old: &mut self.f_old,
            f_new: &mut self.f_new,
            neighbour_index: &self.neighbour_index,
            site_data: &self.site_data,
        }
    }

    #[inline]
    pub fn f_old(&self) -> &[f64] {
        &self.f_old
    }

    #[inline]
    pub fn f_new(&self) -> &[f64] {
        &self.f_new
    }

    #[inline]
    pub fn f_old_mut(&mut self) -> &mut [f64] {
        &mut self.f_old
    }

    #[inline]
    pub fn f_new_mut(&mut self) -> &mut [f64] {
        &mut self.f_new
    }

    /// The current distributions of one site.
    #[inline]
    pub fn site_f_old(&self, site: usize) -> &[f64] {
        &self.f_old[site * L::Q..(site + 1) * L::Q]
    }

    /// Exchange `f_old` and `f_new`. O(1).
    #[inline]
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.f_old, &mut self.f_new);
    }

    /// Copy inbound shared values from their landing slots in `f_old`'s
    /// tail into the `f_new` interior slots they belong to.
    pub fn copy_received(&mut self) {
        let base = self.shared_base();
        for (k, &target) in self.recv_lookup.iter().enumerate() {
            self.f_new[target] = self.f_old[base + k];
        }
    }

    /// Re-initialise every distribution to the uniform-rest equilibrium at
    /// `density`, including the sentinel and shared tails. Used at start-up
    /// and by the instability reset.
    pub fn reset_to_equilibrium(&mut self, density: f64) {
        let mut f_eq = [0.0f64; lattice::MAX_Q];
        lattice::equilibrium::<L>(density, [0.0; 3], &mut f_eq[..L::Q]);
        for site in 0..self.site_count {
            for d in 0..L::Q {
                self.f_old[site * L::Q + d] = f_eq[d];
                self.f_new[site * L::Q + d] = f_eq[d];
            }
        }
        for slot in self.site_count * L::Q..self.f_old.len() {
            self.f_old[slot] = 0.0;
            self.f_new[slot] = 0.0;
        }
    }

    /// Sum of all distributions over local sites (conservation checks).
    pub fn total_mass(&self) -> f64 {
        self.f_old[..self.site_count * L::Q].iter().sum()
    }
}

/// Disjoint borrows of the domain's buffers and tables for the
/// stream-and-collide drivers.
pub struct StreamAccess<'a> {
    pub f_old: &'a mut [f64],
    pub f_new: &'a mut [f64],
    pub neighbour_index: &'a [usize],
    pub site_data: &'a [SiteData],
}

/// Read-only query surface of one site.
#[derive(Copy, Clone)]
pub struct Site<'a, L: Lattice> {
    domain: &'a FluidDomain<L>,
    index: usize,
}

impl<'a, L: Lattice> Site<'a, L> {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn site_type(&self) -> SiteType {
        self.domain.site_data[self.index].site_type
    }

    #[inline]
    pub fn iolet(&self) -> Option<IoletId> {
        self.domain.site_data[self.index].iolet
    }

    #[inline]
    pub fn link(&self, direction: usize) -> &'a Link {
        self.domain.site_data[self.index].link(direction)
    }

    #[inline]
    pub fn wall_normal(&self) -> Option<[f64; 3]> {
        self.domain.site_data[self.index].wall_normal
    }

    #[inline]
    pub fn stream_index(&self, direction: usize) -> usize {
        self.domain.stream_index(self.index, direction)
    }

    #[inline]
    pub fn f_old(&self) -> &'a [f64] {
        self.domain.site_f_old(self.index)
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Traversal key of a global site: blocks row-major over (i, j, k), then
/// sites row-major within the block. This single global order is what makes
/// both ends of an inter-rank interface derive identical shared-link lists
/// without exchanging them.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TraversalKey {
    block: usize,
    site_in_block: usize,
}

/// Geometry description consumed by [`FluidDomain`] bring-up. The real
/// geometry loader and decomposer are external collaborators; this builder
/// is the in-memory hand-off they populate (tests and the demo geometries
/// populate it directly).
pub struct DomainBuilder {
    site_dims: [usize; 3],
    block_size: usize,
    block_dims: [usize; 3],
    periodic: [bool; 3],
    sites: BTreeMap<GlobalCoords, (Rank, SiteData)>,
    inlet_count: usize,
    outlet_count: usize,
}

impl DomainBuilder {
    /// A lattice of `site_dims` sites grouped in cubic blocks of side
    /// `block_size`. `periodic` enables wrap-around per axis.
    pub fn new(site_dims: [usize; 3], block_size: usize, periodic: [bool; 3]) -> Self {
        assert!(block_size > 0, "block side must be positive");
        let block_dims = [
            site_dims[0].div_ceil(block_size),
            site_dims[1].div_ceil(block_size),
            site_dims[2].div_ceil(block_size),
        ];
        DomainBuilder {
            site_dims,
            block_size,
            block_dims,
            periodic,
            sites: BTreeMap::new(),
            inlet_count: 0,
            outlet_count: 0,
        }
    }

    /// Declare how many iolets of each kind exist (for id validation).
    pub fn with_iolets(mut self, inlets: usize, outlets: usize) -> Self {
        self.inlet_count = inlets;
        self.outlet_count = outlets;
        self
    }

    #[inline]
    pub fn site_dims(&self) -> [usize; 3] {
        self.site_dims
    }

    /// Register a fluid site owned by `rank`.
    pub fn add_site(
        &mut self,
        coords: GlobalCoords,
        rank: Rank,
        data: SiteData,
    ) -> Result<(), SetupError> {
        if !self.in_lattice(coords) {
            return Err(SetupError::SiteOutsideLattice(coords, self.site_dims));
        }
        if self.sites.insert(coords, (rank, data)).is_some() {
            return Err(SetupError::DuplicateSite(coords));
        }
        Ok(())
    }

    #[inline]
    fn in_lattice(&self, c: GlobalCoords) -> bool {
        (0..3).all(|a| c[a] >= 0 && (c[a] as usize) < self.site_dims[a])
    }

    /// Wrap or reject a neighbour coordinate.
    pub fn resolve(&self, mut c: GlobalCoords) -> Option<GlobalCoords> {
        for a in 0..3 {
            let n = self.site_dims[a] as i64;
            if self.periodic[a] {
                c[a] = c[a].rem_euclid(n);
            } else if c[a] < 0 || c[a] >= n {
                return None;
            }
        }
        Some(c)
    }

    /// Owner rank of the fluid site at `c`, if fluid.
    pub fn owner(&self, c: GlobalCoords) -> Option<Rank> {
        self.sites.get(&c).map(|(rank, _)| *rank)
    }

    /// The global traversal key of a site.
    pub fn traversal_key(&self, c: GlobalCoords) -> TraversalKey {
        let b = self.block_size as i64;
        let block_coords = [c[0].div_euclid(b), c[1].div_euclid(b), c[2].div_euclid(b)];
        let in_block = [c[0].rem_euclid(b), c[1].rem_euclid(b), c[2].rem_euclid(b)];
        let block = (block_coords[0] as usize * self.block_dims[1]
            + block_coords[1] as usize)
            * self.block_dims[2]
            + block_coords[2] as usize;
        let site_in_block = (in_block[0] as usize * self.block_size
            + in_block[1] as usize)
            * self.block_size
            + in_block[2] as usize;
        TraversalKey { block, site_in_block }
    }

    /// Sites owned by `rank` in global traversal order.
    pub fn sites_of(&self, rank: Rank) -> Vec<GlobalCoords> {
        let mut out: Vec<GlobalCoords> = self
            .sites
            .iter()
            .filter(|(_, (r, _))| *r == rank)
            .map(|(c, _)| *c)
            .collect();
        out.sort_by_key(|c| self.traversal_key(*c));
        out
    }

    /// Classify and validate every registered site, then build the local
    /// domain for `my_rank`: local ordering, neighbour index table and the
    /// shared-region layout. The cross-rank verification of the shared
    /// lists is owned by [`crate::exchange::NeighbourExchange`].
    pub fn build<L: Lattice>(&self, my_rank: Rank) -> Result<FluidDomain<L>, SetupError> {
        let locals = self.sites_of(my_rank);
        if locals.is_empty() {
            return Err(SetupError::EmptyPartition { rank: my_rank });
        }

        // First pass: validate, and split inner from edge.
        let mut is_edge = vec![false; locals.len()];
        for (i, &c) in locals.iter().enumerate() {
            let (_, data) = &self.sites[&c];
            data.validate(i, L::Q, self.inlet_count, self.outlet_count)?;
            for d in 1..L::Q {
                if data.link(d).kind != LinkKind::NoBoundary {
                    continue;
                }
                let cv = L::ci(d);
                let target = [c[0] + cv[0] as i64, c[1] + cv[1] as i64, c[2] + cv[2] as i64];
                if let Some(t) = self.resolve(target) {
                    if let Some(owner) = self.owner(t) {
                        if owner != my_rank {
                            is_edge[i] = true;
                        }
                    }
                }
            }
        }

        // Order sites: inner half then edge half, each grouped by type, the
        // global traversal order preserved inside every bucket.
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); 2 * GROUP_COUNT];
        for (i, &c) in locals.iter().enumerate() {
            let group = group_of(self.sites[&c].1.site_type);
            let bucket = if is_edge[i] { GROUP_COUNT + group } else { group };
            buckets[bucket].push(i);
        }
        let mut ordering = SiteOrdering::default();
        let mut coords = Vec::with_capacity(locals.len());
        let mut site_data = Vec::with_capacity(locals.len());
        let mut local_id: BTreeMap<GlobalCoords, usize> = BTreeMap::new();
        let mut cursor = 0usize;
        for (bucket, members) in buckets.iter().enumerate() {
            let start = cursor;
            for &i in members {
                local_id.insert(locals[i], cursor);
                coords.push(locals[i]);
                site_data.push(self.sites[&locals[i]].1.clone());
                cursor += 1;
            }
            if bucket < GROUP_COUNT {
                ordering.inner[bucket] = (start, cursor);
            } else {
                ordering.edge[bucket - GROUP_COUNT] = (start, cursor);
            }
        }
        let site_count = cursor;

        // Second pass: neighbour index table. Shared links get their slots
        // here too; until assignment every slot starts at the sentinel so a
        // partially initialised table can never scribble on another site.
        let sentinel = site_count * L::Q;
        let mut neighbour_index = vec![sentinel; site_count * L::Q];
        let mut shared: Vec<SharedLink> = Vec::new();
        for site in 0..site_count {
            let c = coords[site];
            neighbour_index[site * L::Q] = site * L::Q;
            for d in 1..L::Q {
                if site_data[site].link(d).kind != LinkKind::NoBoundary {
                    // Boundary-cut link: no propagation; the streamer's
                    // wall/iolet policy supplies the missing population.
                    continue;
                }
                let cv = L::ci(d);
                let target = [c[0] + cv[0] as i64, c[1] + cv[1] as i64, c[2] + cv[2] as i64];
                let Some(t) = self.resolve(target) else {
                    continue;
                };
                match self.owner(t) {
                    None => {}
                    Some(owner) if owner == my_rank => {
                        let n = local_id[&t];
                        neighbour_index[site * L::Q + d] = n * L::Q + d;
                    }
                    Some(owner) => {
                        // Canonical identity of the link: the lower rank's
                        // (site, direction).
                        let (canon_coords, canon_dir) = if my_rank < owner {
                            (c, d)
                        } else {
                            (t, L::INVERSE[d])
                        };
                        shared.push(SharedLink {
                            peer: owner,
                            key: self.traversal_key(canon_coords),
                            canon_coords,
                            canon_dir,
                            site,
                            direction: d,
                        });
                    }
                }
            }
        }

        // Shared slots: per peer (ascending rank), canonical order.
        shared.sort_by_key(|s| (s.peer, s.key, s.canon_dir));
        let mut neighbours: Vec<NeighbourRank> = Vec::new();
        let shared_count = shared.len();
        let shared_base = site_count * L::Q + 1;
        let mut recv_lookup = vec![0usize; shared_count];
        let mut shared_meta = Vec::with_capacity(shared_count);
        for (k, link) in shared.iter().enumerate() {
            match neighbours.last_mut() {
                Some(last) if last.rank == link.peer => last.count += 1,
                _ => neighbours.push(NeighbourRank {
                    rank: link.peer,
                    first_shared: shared_base + k,
                    count: 1,
                }),
            }
            neighbour_index[link.site * L::Q + link.direction] = shared_base + k;
            recv_lookup[k] = link.site * L::Q + L::INVERSE[link.direction];
            shared_meta.push((link.peer, link.canon_coords, link.canon_dir));
        }

        tracing::debug!(
            rank = my_rank,
            sites = site_count,
            inner = ordering.inner_count(),
            shared = shared_count,
            neighbours = neighbours.len(),
            lattice = L::NAME,
            "fluid domain assembled"
        );

        let slots = site_count * L::Q + 1 + shared_count;
        let mut domain = FluidDomain {
            f_old: vec![0.0; slots],
            f_new: vec![0.0; slots],
            neighbour_index,
            site_data,
            coords,
            ordering,
            neighbours,
            recv_lookup,
            shared_meta,
            site_count,
            shared_count,
            _lattice: PhantomData,
        };
        domain.reset_to_equilibrium(1.0);
        Ok(domain)
    }
}

struct SharedLink {
    peer: Rank,
    key: TraversalKey,
    canon_coords: GlobalCoords,
    canon_dir: usize,
    site: usize,
    direction: usize,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::D3Q15;

    fn cube_builder(n: usize, periodic: bool) -> DomainBuilder {
        let mut b = DomainBuilder::new([n, n, n], 4, [periodic; 3]);
        for x in 0..n as i64 {
            for y in 0..n as i64 {
                for z in 0..n as i64 {
                    b.add_site([x, y, z], 0, SiteData::bulk()).unwrap();
                }
            }
        }
        b
    }

    #[test]
    fn bulk_cube_has_no_edge_sites_and_correct_ranges() {
        let b = cube_builder(4, true);
        let domain = b.build::<D3Q15>(0).unwrap();
        assert_eq!(domain.site_count(), 64);
        assert_eq!(domain.shared_count(), 0);
        assert_eq!(domain.ordering().inner[0], (0, 64));
        assert_eq!(domain.ordering().inner_count(), 64);
        for g in 1..GROUP_COUNT {
            let (s, e) = domain.ordering().inner[g];
            assert_eq!(s, e);
        }
    }

    #[test]
    fn periodic_wrap_makes_every_link_local() {
        let b = cube_builder(4, true);
        let domain = b.build::<D3Q15>(0).unwrap();
        let sentinel = domain.sentinel();
        for site in 0..domain.site_count() {
            for d in 0..15 {
                let target = domain.stream_index(site, d);
                assert_ne!(target, sentinel, "site {site} dir {d} lost to sentinel");
                assert!(target < sentinel);
                assert_eq!(target % 15, d, "streaming preserves the direction slot");
            }
        }
    }

    #[test]
    fn open_boundary_links_hit_the_sentinel() {
        let b = cube_builder(3, false);
        let domain = b.build::<D3Q15>(0).unwrap();
        // The corner site has several off-lattice neighbours.
        let corner = (0..domain.site_count())
            .find(|&s| domain.coords_of(s) == [0, 0, 0])
            .unwrap();
        let sentinel = domain.sentinel();
        assert_eq!(domain.stream_index(corner, 2), sentinel); // -x
        assert_eq!(domain.stream_index(corner, 1) % 15, 1); // +x stays local
    }

    #[test]
    fn two_rank_split_builds_mirrored_shared_regions() {
        // 4x2x2 bar split along x into two ranks.
        let mut b = DomainBuilder::new([4, 2, 2], 4, [true, true, true]);
        for x in 0..4i64 {
            for y in 0..2i64 {
                for z in 0..2i64 {
                    let rank = usize::from(x >= 2);
                    b.add_site([x, y, z], rank, SiteData::bulk()).unwrap();
                }
            }
        }
        let d0 = b.build::<D3Q15>(0).unwrap();
        let d1 = b.build::<D3Q15>(1).unwrap();
        assert_eq!(d0.neighbours().len(), 1);
        assert_eq!(d1.neighbours().len(), 1);
        assert_eq!(d0.neighbours()[0].count, d1.neighbours()[0].count);
        assert!(d0.shared_count() > 0);
        // Every site on a 2-wide slab touches the other rank.
        assert_eq!(d0.ordering().inner_count(), 0);
    }

    #[test]
    fn swap_and_copy_received_route_shared_values() {
        let mut b = DomainBuilder::new([2, 1, 1], 4, [true, false, false]);
        b.add_site([0, 0, 0], 0, SiteData::bulk()).unwrap();
        b.add_site([1, 0, 0], 1, SiteData::bulk()).unwrap();
        let mut d = b.build::<D3Q15>(0).unwrap();
        let base = d.shared_base();
        let lookup = d.recv_lookup().to_vec();
        assert_eq!(lookup.len(), d.shared_count());

        // Pretend the wait landed values in the f_old tail.
        for k in 0..d.shared_count() {
            d.f_old_mut()[base + k] = 100.0 + k as f64;
        }
        d.copy_received();
        for (k, &target) in lookup.iter().enumerate() {
            assert_eq!(d.f_new()[target], 100.0 + k as f64);
        }

        let before = d.f_new()[0];
        d.swap();
        assert_eq!(d.f_old()[0], before);
    }

    #[test]
    fn site_view_exposes_the_metadata_surface() {
        use crate::site::{IoletId, Link, LinkKind};
        let mut b = DomainBuilder::new([2, 1, 1], 4, [false; 3]).with_iolets(1, 0);
        let mut data = SiteData::bulk();
        data.set_link(3, Link::wall(0.25));
        data.set_link(5, Link::iolet(LinkKind::Inlet, 0.75, IoletId(0)));
        data.wall_normal = Some([0.0, 1.0, 0.0]);
        data.classify(15);
        b.add_site([0, 0, 0], 0, data).unwrap();
        b.add_site([1, 0, 0], 0, SiteData::bulk()).unwrap();
        let domain = b.build::<D3Q15>(0).unwrap();

        // Type grouping puts the bulk site first; look the boundary site up
        // by coordinates.
        let id = (0..domain.site_count())
            .find(|&s| domain.coords_of(s) == [0, 0, 0])
            .unwrap();
        let site = domain.site(id);
        assert_eq!(site.site_type(), crate::site::SiteType::InletWall);
        assert_eq!(site.iolet(), Some(IoletId(0)));
        assert_eq!(site.link(3).kind, LinkKind::Wall);
        assert!((site.link(3).distance - 0.25).abs() < 1e-15);
        assert_eq!(site.wall_normal(), Some([0.0, 1.0, 0.0]));
        // Wall-cut direction points at the sentinel; the +x link reaches
        // the neighbour's slot.
        assert_eq!(site.stream_index(3), domain.sentinel());
        assert_eq!(site.stream_index(1) % 15, 1);
        assert_eq!(site.f_old().len(), 15);
    }

    #[test]
    fn reset_restores_rest_equilibrium_and_mass() {
        let b = cube_builder(3, false);
        let mut d = b.build::<D3Q15>(0).unwrap();
        d.f_old_mut()[5] = 9.0;
        d.reset_to_equilibrium(1.0);
        let mass = d.total_mass();
        assert!((mass - 27.0).abs() < 1e-12);
        assert!((d.f_old()[0] - 2.0 / 9.0).abs() < 1e-15);
    }
}
