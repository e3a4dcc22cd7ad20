//! Per-site classification & link metadata
//!
//! Every local fluid site carries a type, an optional iolet id, an optional
//! wall normal, and one link record per outgoing direction `d > 0`. The
//! metadata is populated once at domain bring-up and never mutated during
//! the run; streamers and kernels see it only through the read-only
//! [`Site`](crate::domain::Site) view, which borrows the owning domain
//! instead of storing back-pointers.

use serde::{Deserialize, Serialize};

use crate::lattice::MAX_Q;

/// Identifier of an inlet or outlet surface, densely indexed from 0 within
/// its kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IoletId(pub usize);
impl IoletId {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Classification of a fluid site.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SiteType {
    /// No boundary-bearing links at all.
    BulkFluid,
    /// At least one wall link, no iolet links.
    Wall,
    /// At least one inlet link, no wall links.
    Inlet,
    /// At least one outlet link, no wall links.
    Outlet,
    /// Both inlet and wall links.
    InletWall,
    /// Both outlet and wall links.
    OutletWall,
}

impl SiteType {
    /// Whether sites of this type reference an iolet.
    #[inline]
    pub fn has_iolet(self) -> bool {
        matches!(
            self,
            SiteType::Inlet | SiteType::Outlet | SiteType::InletWall | SiteType::OutletWall
        )
    }

    /// Whether sites of this type carry at least one wall link.
    #[inline]
    pub fn has_wall(self) -> bool {
        matches!(self, SiteType::Wall | SiteType::InletWall | SiteType::OutletWall)
    }
}

/// What an outgoing link first intersects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    /// The link reaches the contiguous fluid neighbour.
    NoBoundary,
    /// The link crosses a wall surface.
    Wall,
    /// The link crosses an inlet surface.
    Inlet,
    /// The link crosses an outlet surface.
    Outlet,
}

/// Metadata for one outgoing direction of one site.
///
/// `distance` is the fraction of the lattice vector at which the boundary
/// surface is first intersected; it is meaningful only when
/// `kind != NoBoundary` and always satisfies `0 < distance <= 1`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Link {
    pub kind: LinkKind,
    pub distance: f64,
    pub iolet: Option<IoletId>,
}

impl Link {
    /// A plain in-domain link.
    pub const OPEN: Link = Link {
        kind: LinkKind::NoBoundary,
        distance: 0.0,
        iolet: None,
    };

    /// A wall-cut link at the given distance.
    #[inline]
    pub fn wall(distance: f64) -> Self {
        Link { kind: LinkKind::Wall, distance, iolet: None }
    }

    /// An iolet-cut link at the given distance.
    #[inline]
    pub fn iolet(kind: LinkKind, distance: f64, id: IoletId) -> Self {
        debug_assert!(matches!(kind, LinkKind::Inlet | LinkKind::Outlet));
        Link { kind, distance, iolet: Some(id) }
    }
}

/// Validation failures over site/link metadata, all fatal at setup time.
#[derive(Debug, thiserror::Error)]
pub enum SiteDataError {
    #[error("site {site}: link {direction} distance {distance} outside (0, 1]")]
    BadCutDistance { site: usize, direction: usize, distance: f64 },
    #[error("site {site}: type {site_type:?} requires an iolet id but none is set")]
    MissingIoletId { site: usize, site_type: SiteType },
    #[error("site {site}: iolet id {iolet} out of range (count {count})")]
    IoletOutOfRange { site: usize, iolet: usize, count: usize },
    #[error("site {site}: type {site_type:?} but no link of the matching kind")]
    InconsistentLinks { site: usize, site_type: SiteType },
    #[error("site {site}: wall normal has zero length")]
    DegenerateWallNormal { site: usize },
}

/// The full metadata record for one local fluid site.
///
/// Link records are stored inline (up to [`MAX_Q`] minus the rest
/// direction) so the per-site footprint is fixed and allocation-free.
#[derive(Clone, Debug)]
pub struct SiteData {
    pub site_type: SiteType,
    pub iolet: Option<IoletId>,
    /// Unit wall normal, when the chosen streamer needs one.
    pub wall_normal: Option<[f64; 3]>,
    links: [Link; MAX_Q - 1],
}

impl SiteData {
    /// A bulk-fluid record with all links open.
    pub fn bulk() -> Self {
        SiteData {
            site_type: SiteType::BulkFluid,
            iolet: None,
            wall_normal: None,
            links: [Link::OPEN; MAX_Q - 1],
        }
    }

    /// Set the link record for direction `d` (`d >= 1`).
    pub fn set_link(&mut self, d: usize, link: Link) {
        debug_assert!(d >= 1, "direction 0 never carries a link record");
        self.links[d - 1] = link;
    }

    /// The link record for direction `d` (`d >= 1`).
    #[inline]
    pub fn link(&self, d: usize) -> &Link {
        debug_assert!(d >= 1, "direction 0 never carries a link record");
        &self.links[d - 1]
    }

    /// Recompute the site type from the link records, preserving iolet ids.
    pub fn classify(&mut self, q: usize) {
        let mut saw_wall = false;
        let mut saw_inlet = false;
        let mut saw_outlet = false;
        for d in 1..q {
            match self.link(d).kind {
                LinkKind::Wall => saw_wall = true,
                LinkKind::Inlet => saw_inlet = true,
                LinkKind::Outlet => saw_outlet = true,
                LinkKind::NoBoundary => {}
            }
        }
        self.site_type = match (saw_wall, saw_inlet, saw_outlet) {
            (false, false, false) => SiteType::BulkFluid,
            (true, false, false) => SiteType::Wall,
            (false, true, false) => SiteType::Inlet,
            (false, false, true) => SiteType::Outlet,
            (true, true, false) => SiteType::InletWall,
            (true, false, true) => SiteType::OutletWall,
            // A site cut by both an inlet and an outlet is malformed input;
            // classify as inlet-wall and let validation reject it upstream.
            _ => SiteType::InletWall,
        };
        if self.iolet.is_none() {
            self.iolet = (1..q).find_map(|d| self.link(d).iolet);
        }
    }

    /// Check the metadata invariants for this record.
    pub fn validate(
        &self,
        site: usize,
        q: usize,
        inlet_count: usize,
        outlet_count: usize,
    ) -> Result<(), SiteDataError> {
        for d in 1..q {
            let link = self.link(d);
            if link.kind != LinkKind::NoBoundary
                && !(link.distance > 0.0 && link.distance <= 1.0)
            {
                return Err(SiteDataError::BadCutDistance {
                    site,
                    direction: d,
                    distance: link.distance,
                });
            }
        }
        if self.site_type.has_iolet() {
            let id = self
                .iolet
                .ok_or(SiteDataError::MissingIoletId { site, site_type: self.site_type })?;
            let count = match self.site_type {
                SiteType::Inlet | SiteType::InletWall => inlet_count,
                _ => outlet_count,
            };
            if id.as_usize() >= count {
                return Err(SiteDataError::IoletOutOfRange {
                    site,
                    iolet: id.as_usize(),
                    count,
                });
            }
        }
        if self.site_type.has_wall()
            && !(1..q).any(|d| self.link(d).kind == LinkKind::Wall)
        {
            return Err(SiteDataError::InconsistentLinks { site, site_type: self.site_type });
        }
        if let Some(normal) = self.wall_normal {
            let len_sq: f64 = normal.iter().map(|x| x * x).sum();
            if len_sq < 1e-12 {
                return Err(SiteDataError::DegenerateWallNormal { site });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_links() {
        let q = 15;
        let mut data = SiteData::bulk();
        data.classify(q);
        assert_eq!(data.site_type, SiteType::BulkFluid);

        data.set_link(3, Link::wall(0.5));
        data.classify(q);
        assert_eq!(data.site_type, SiteType::Wall);

        data.set_link(5, Link::iolet(LinkKind::Inlet, 0.4, IoletId(0)));
        data.classify(q);
        assert_eq!(data.site_type, SiteType::InletWall);
        assert_eq!(data.iolet, Some(IoletId(0)));
    }

    #[test]
    fn validation_rejects_bad_distances_and_missing_iolets() {
        let q = 15;
        let mut data = SiteData::bulk();
        data.set_link(1, Link::wall(0.0));
        data.classify(q);
        assert!(matches!(
            data.validate(0, q, 0, 0),
            Err(SiteDataError::BadCutDistance { .. })
        ));

        let mut data = SiteData::bulk();
        data.set_link(1, Link::iolet(LinkKind::Outlet, 0.7, IoletId(2)));
        data.classify(q);
        assert!(matches!(
            data.validate(0, q, 0, 1),
            Err(SiteDataError::IoletOutOfRange { .. })
        ));
        assert!(data.validate(0, q, 0, 3).is_ok());
    }
}
