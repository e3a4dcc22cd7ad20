//! Macroscopic property caches
//!
//! A write-through side channel: consumers (extraction, visualisation)
//! flag the quantities they need for the coming iteration, the streamer
//! writes them from the hydrodynamic bundle it already computed, and the
//! flags are cleared at end of iteration. Nothing here triggers an extra
//! pass over the distributions.

/// One refreshable per-site array.
#[derive(Clone, Debug)]
pub struct RefreshableCache<T: Copy + Default> {
    values: Vec<T>,
    refresh: bool,
}

impl<T: Copy + Default> RefreshableCache<T> {
    fn new(site_count: usize) -> Self {
        RefreshableCache { values: vec![T::default(); site_count], refresh: false }
    }

    /// Request a refresh for the coming iteration.
    #[inline]
    pub fn require(&mut self) {
        self.refresh = true;
    }

    #[inline]
    pub fn required(&self) -> bool {
        self.refresh
    }

    #[inline]
    pub fn set(&mut self, site: usize, value: T) {
        self.values[site] = value;
    }

    #[inline]
    pub fn get(&self, site: usize) -> T {
        self.values[site]
    }

    #[inline]
    pub fn values(&self) -> &[T] {
        &self.values
    }

    #[inline]
    fn clear_flag(&mut self) {
        self.refresh = false;
    }
}

/// All cached macroscopic quantities, indexed by local site id.
pub struct PropertyCache {
    pub density: RefreshableCache<f64>,
    pub velocity: RefreshableCache<[f64; 3]>,
    pub wall_shear_stress_magnitude: RefreshableCache<f64>,
    pub von_mises_stress: RefreshableCache<f64>,
    pub shear_rate: RefreshableCache<f64>,
    /// Packed symmetric tensor `[xx, yy, zz, xy, xz, yz]`.
    pub stress_tensor: RefreshableCache<[f64; 6]>,
    pub traction: RefreshableCache<[f64; 3]>,
    pub tangential_traction: RefreshableCache<[f64; 3]>,
    site_count: usize,
}

impl PropertyCache {
    pub fn new(site_count: usize) -> Self {
        PropertyCache {
            density: RefreshableCache::new(site_count),
            velocity: RefreshableCache::new(site_count),
            wall_shear_stress_magnitude: RefreshableCache::new(site_count),
            von_mises_stress: RefreshableCache::new(site_count),
            shear_rate: RefreshableCache::new(site_count),
            stress_tensor: RefreshableCache::new(site_count),
            traction: RefreshableCache::new(site_count),
            tangential_traction: RefreshableCache::new(site_count),
            site_count,
        }
    }

    #[inline]
    pub fn site_count(&self) -> usize {
        self.site_count
    }

    /// True if any quantity is flagged for this iteration.
    pub fn any_required(&self) -> bool {
        self.density.required()
            || self.velocity.required()
            || self.wall_shear_stress_magnitude.required()
            || self.von_mises_stress.required()
            || self.shear_rate.required()
            || self.stress_tensor.required()
            || self.traction.required()
            || self.tangential_traction.required()
    }

    /// Drop all refresh flags; consumers re-register each step.
    pub fn reset_requirements(&mut self) {
        self.density.clear_flag();
        self.velocity.clear_flag();
        self.wall_shear_stress_magnitude.clear_flag();
        self.von_mises_stress.clear_flag();
        self.shear_rate.clear_flag();
        self.stress_tensor.clear_flag();
        self.traction.clear_flag();
        self.tangential_traction.clear_flag();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_per_iteration() {
        let mut cache = PropertyCache::new(4);
        assert!(!cache.any_required());
        cache.density.require();
        cache.velocity.require();
        assert!(cache.any_required());
        cache.density.set(2, 1.25);
        assert_eq!(cache.density.get(2), 1.25);
        cache.reset_requirements();
        assert!(!cache.any_required());
        // Values survive the flag reset.
        assert_eq!(cache.density.get(2), 1.25);
    }
}
