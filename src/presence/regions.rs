use tracing::{debug, info, warn};

use crate::persistence::Persistence;
use crate::protocol::payload::Waypoint;

/// The region list sent to the apps with `setWaypoints`.
///
/// Starts from the configured regions, or from the last imported list when
/// one was persisted.
#[derive(Debug)]
pub struct RegionRegistry {
    regions: Vec<Waypoint>,
    store: Option<Persistence>,
}

impl RegionRegistry {
    pub fn new(configured: Vec<Waypoint>, store: Option<Persistence>) -> Self {
        let saved = store.as_ref().and_then(|s| match s.load_regions() {
            Ok(regions) => regions,
            Err(e) => {
                warn!("Could not load stored regions: {}", e);
                None
            }
        });
        Self {
            regions: saved.unwrap_or(configured),
            store,
        }
    }

    pub fn regions(&self) -> &[Waypoint] {
        &self.regions
    }

    /// Merge client-submitted regions: an incoming region with the same
    /// `tst` as a known one replaces it, the rest are appended. Returns
    /// whether the list changed.
    pub fn merge(&mut self, mut incoming: Vec<Waypoint>) -> bool {
        let before = self.regions.clone();

        for region in self.regions.iter_mut() {
            if let Some(index) = incoming.iter().position(|w| w.tst == region.tst) {
                debug!("Updating region {}", region.desc);
                *region = incoming.remove(index);
            }
        }
        if !incoming.is_empty() {
            debug!(
                "Adding regions {}",
                incoming.iter().map(|w| w.desc.as_str()).collect::<Vec<_>>().join(", ")
            );
            self.regions.append(&mut incoming);
        }

        if self.regions == before {
            info!("Region import changed nothing");
            return false;
        }

        info!("Regions updated ({} total)", self.regions.len());
        if let Some(store) = &self.store {
            if let Err(e) = store.save_regions(&self.regions) {
                warn!("Could not save regions: {}", e);
            }
        }
        true
    }
}
