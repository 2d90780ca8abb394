//! Frame computation.
//!
//! Given a city's current vehicle set, [`FrameComputer`] recomputes one
//! [`ScopedTrainsFrame`] per active scope and writes it through the store,
//! superseding the prior frame. A failure on one scope is collected into the
//! result and never aborts the rest of the batch — partial success is the
//! normal outcome under degraded conditions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{ScopeDefinition, ScopeId, ScopedTrainsFrame, VehiclePosition};
use crate::store::{ScopeStore, StoreError};

/// Per-scope (or per-pass) computation failure, collected not thrown.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The store could not enumerate active scopes for the city.
    #[error("scope enumeration failed for city {city_id}: {source}")]
    Enumerate {
        city_id: String,
        source: StoreError,
    },

    /// The store rejected the frame write for one scope.
    #[error("frame write failed for scope {scope_id}: {source}")]
    Write {
        scope_id: ScopeId,
        source: StoreError,
    },
}

/// Aggregate result of one recomputation pass.
///
/// Returned for observability; never persisted.
#[derive(Debug, Default)]
pub struct FrameComputation {
    /// Scopes for which a frame was successfully written.
    pub scopes_processed: usize,
    /// Total vehicle entries across all written frames.
    pub vehicles_included: usize,
    /// Wall-clock duration of the pass.
    pub processing_time: Duration,
    /// Failures collected along the way.
    pub errors: Vec<FrameError>,
}

/// Computes and persists per-scope frames for a city.
pub struct FrameComputer {
    store: Arc<dyn ScopeStore>,
    frame_ttl: Duration,
}

impl FrameComputer {
    pub fn new(store: Arc<dyn ScopeStore>, frame_ttl: Duration) -> Self {
        Self { store, frame_ttl }
    }

    /// Recompute frames for every active scope of `city_id` passing
    /// `scope_filter`.
    ///
    /// Vehicles are included in a frame iff their last-known coordinate lies
    /// inside the scope's bbox (inclusive bounds). Each written frame is
    /// stamped with the current time and a checksum over its vehicle set.
    pub fn compute_frames(
        &self,
        city_id: &str,
        vehicles: &[VehiclePosition],
        scope_filter: &dyn Fn(&ScopeDefinition) -> bool,
    ) -> FrameComputation {
        let started = Instant::now();
        let mut result = FrameComputation::default();

        let mut scopes: Vec<ScopeDefinition> = Vec::new();
        let enumerated = self.store.for_each_active_scope(&mut |def| {
            if def.city_id == city_id && scope_filter(def) {
                scopes.push(def.clone());
            }
        });
        if let Err(source) = enumerated {
            warn!(city_id, %source, "scope enumeration failed");
            result.errors.push(FrameError::Enumerate {
                city_id: city_id.to_string(),
                source,
            });
            result.processing_time = started.elapsed();
            return result;
        }

        for scope in scopes {
            let included: Vec<VehiclePosition> = vehicles
                .iter()
                .filter(|v| scope.bbox.contains(&v.coordinate))
                .cloned()
                .collect();

            let frame = ScopedTrainsFrame {
                scope_id: scope.id.clone(),
                city_id: scope.city_id.clone(),
                bbox: scope.bbox,
                at: Utc::now(),
                checksum: Some(vehicle_checksum(&included)),
                vehicles: included,
            };
            let vehicle_count = frame.vehicles.len();

            match self.store.set_frame(&scope.id, frame, self.frame_ttl) {
                Ok(()) => {
                    result.scopes_processed += 1;
                    result.vehicles_included += vehicle_count;
                }
                Err(source) => {
                    warn!(scope_id = %scope.id, %source, "frame write failed, continuing");
                    result.errors.push(FrameError::Write {
                        scope_id: scope.id,
                        source,
                    });
                }
            }
        }

        result.processing_time = started.elapsed();
        debug!(
            city_id,
            scopes = result.scopes_processed,
            vehicles = result.vehicles_included,
            errors = result.errors.len(),
            elapsed_ms = result.processing_time.as_millis() as u64,
            "frame recomputation pass complete"
        );
        result
    }
}

/// SHA-256 over the vehicle set, in hex.
///
/// Hashes identity and position only; two frames with the same vehicles in
/// the same places carry the same checksum regardless of computation time.
fn vehicle_checksum(vehicles: &[VehiclePosition]) -> String {
    let mut hasher = Sha256::new();
    for vehicle in vehicles {
        hasher.update(vehicle.id.as_bytes());
        hasher.update(vehicle.coordinate.lat.to_le_bytes());
        hasher.update(vehicle.coordinate.lng.to_le_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BBox, Coordinate};
    use crate::store::MemoryScopeStore;

    fn store_with_scopes(defs: &[(&str, &str, BBox)]) -> Arc<MemoryScopeStore> {
        let store = Arc::new(MemoryScopeStore::new());
        for (id, city, bbox) in defs {
            store
                .upsert_scope(
                    id,
                    ScopeDefinition {
                        id: (*id).to_string(),
                        city_id: (*city).to_string(),
                        bbox: *bbox,
                        created_at: Utc::now(),
                    },
                    Duration::from_secs(60),
                )
                .unwrap();
        }
        store
    }

    fn vehicle(id: &str, lat: f64, lng: f64) -> VehiclePosition {
        VehiclePosition {
            id: id.to_string(),
            coordinate: Coordinate { lat, lng },
            updated_at: Utc::now(),
            bearing: None,
            speed_mps: None,
            status: None,
        }
    }

    fn nyc_bbox() -> BBox {
        BBox {
            south: 40.0,
            west: -74.5,
            north: 41.0,
            east: -73.5,
            zoom: None,
        }
    }

    #[test]
    fn test_frames_filter_vehicles_by_bbox() {
        let store = store_with_scopes(&[("s1", "nyc", nyc_bbox())]);
        let computer = FrameComputer::new(Arc::clone(&store) as Arc<dyn ScopeStore>, Duration::from_secs(30));

        let vehicles = vec![
            vehicle("inside", 40.5, -74.0),
            vehicle("outside", 42.0, -74.0),
            vehicle("on-edge", 41.0, -73.5),
        ];
        let result = computer.compute_frames("nyc", &vehicles, &|_| true);

        assert_eq!(result.scopes_processed, 1);
        assert_eq!(result.vehicles_included, 2);
        assert!(result.errors.is_empty());

        let frame = store.get_frame("s1").unwrap().unwrap();
        let ids: Vec<&str> = frame.vehicles.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["inside", "on-edge"]);
        assert!(frame.checksum.is_some());
    }

    #[test]
    fn test_only_matching_city_scopes_are_computed() {
        let store = store_with_scopes(&[("nyc-1", "nyc", nyc_bbox()), ("akl-1", "akl", nyc_bbox())]);
        let computer = FrameComputer::new(Arc::clone(&store) as Arc<dyn ScopeStore>, Duration::from_secs(30));

        let result = computer.compute_frames("nyc", &[vehicle("v", 40.5, -74.0)], &|_| true);

        assert_eq!(result.scopes_processed, 1);
        assert!(store.get_frame("nyc-1").unwrap().is_some());
        assert!(store.get_frame("akl-1").unwrap().is_none());
    }

    #[test]
    fn test_scope_filter_excludes_scopes() {
        let store = store_with_scopes(&[("s1", "nyc", nyc_bbox()), ("s2", "nyc", nyc_bbox())]);
        let computer = FrameComputer::new(Arc::clone(&store) as Arc<dyn ScopeStore>, Duration::from_secs(30));

        let result = computer.compute_frames("nyc", &[], &|def| def.id == "s2");

        assert_eq!(result.scopes_processed, 1);
        assert!(store.get_frame("s1").unwrap().is_none());
        assert!(store.get_frame("s2").unwrap().is_some());
    }

    #[test]
    fn test_recomputation_supersedes_prior_frame() {
        let store = store_with_scopes(&[("s1", "nyc", nyc_bbox())]);
        let computer = FrameComputer::new(Arc::clone(&store) as Arc<dyn ScopeStore>, Duration::from_secs(30));

        computer.compute_frames("nyc", &[vehicle("v1", 40.5, -74.0)], &|_| true);
        computer.compute_frames("nyc", &[], &|_| true);

        let frame = store.get_frame("s1").unwrap().unwrap();
        assert!(frame.vehicles.is_empty(), "later frame replaces, never merges");
    }

    #[test]
    fn test_checksum_tracks_vehicle_set() {
        let a = vehicle_checksum(&[vehicle("v1", 40.5, -74.0)]);
        let b = vehicle_checksum(&[vehicle("v1", 40.5, -74.0)]);
        let c = vehicle_checksum(&[vehicle("v1", 40.6, -74.0)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    /// Store that fails writes for one designated scope id.
    struct FlakyStore {
        inner: MemoryScopeStore,
        poison: String,
    }

    impl ScopeStore for FlakyStore {
        fn upsert_scope(
            &self,
            id: &str,
            def: ScopeDefinition,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.inner.upsert_scope(id, def, ttl)
        }

        fn get_scope(&self, id: &str) -> Result<Option<ScopeDefinition>, StoreError> {
            self.inner.get_scope(id)
        }

        fn set_frame(
            &self,
            id: &str,
            frame: ScopedTrainsFrame,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            if id == self.poison {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.set_frame(id, frame, ttl)
        }

        fn get_frame(&self, id: &str) -> Result<Option<ScopedTrainsFrame>, StoreError> {
            self.inner.get_frame(id)
        }

        fn for_each_active_scope(
            &self,
            f: &mut dyn FnMut(&ScopeDefinition),
        ) -> Result<(), StoreError> {
            self.inner.for_each_active_scope(f)
        }
    }

    #[test]
    fn test_one_broken_scope_does_not_abort_the_batch() {
        let flaky = Arc::new(FlakyStore {
            inner: MemoryScopeStore::new(),
            poison: "bad".to_string(),
        });
        for id in ["bad", "good"] {
            flaky
                .upsert_scope(
                    id,
                    ScopeDefinition {
                        id: id.to_string(),
                        city_id: "nyc".to_string(),
                        bbox: nyc_bbox(),
                        created_at: Utc::now(),
                    },
                    Duration::from_secs(60),
                )
                .unwrap();
        }
        let computer = FrameComputer::new(Arc::clone(&flaky) as Arc<dyn ScopeStore>, Duration::from_secs(30));

        let result = computer.compute_frames("nyc", &[vehicle("v", 40.5, -74.0)], &|_| true);

        assert_eq!(result.scopes_processed, 1, "healthy scope still processed");
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(&result.errors[0], FrameError::Write { scope_id, .. } if scope_id == "bad"));
        assert!(flaky.get_frame("good").unwrap().is_some());
    }
}
