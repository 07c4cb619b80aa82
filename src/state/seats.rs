use std::collections::HashMap;
use std::f32::consts::TAU;

use thiserror::Error;

use crate::protocol::{ConnId, Seat, TrialId};

/// Gallery geometry: concentric tiers of evenly spaced seats.
#[derive(Debug, Clone)]
pub struct SeatLayoutConfig {
    pub tiers: u32,
    pub per_tier: u32,
    pub base_radius: f32,
    pub tier_gap: f32,
}

impl Default for SeatLayoutConfig {
    fn default() -> Self {
        Self {
            tiers: 5,
            per_tier: 24,
            base_radius: 12.0,
            tier_gap: 2.0,
        }
    }
}

#[derive(Debug, Error)]
#[error("no free seats in the room")]
pub struct NoSeatsAvailable;

/// Result of a successful seat request. `released` carries the key of a seat
/// the same connection held before, which the caller must announce as freed.
pub struct SeatAssignment {
    pub seat: Seat,
    pub released: Option<String>,
}

/// Seat geometry and occupancy for one room.
pub struct SeatMap {
    seats: Vec<Seat>,
    taken: HashMap<String, ConnId>,
}

impl SeatMap {
    fn generate(config: &SeatLayoutConfig) -> Self {
        let mut seats = Vec::with_capacity((config.tiers * config.per_tier) as usize);
        for t in 0..config.tiers {
            let radius = config.base_radius + t as f32 * config.tier_gap;
            for i in 0..config.per_tier {
                let angle = i as f32 / config.per_tier as f32 * TAU;
                let x = angle.cos() * radius;
                let z = angle.sin() * radius;
                seats.push(Seat {
                    key: seat_key(t + 1, x, z),
                    tier: t + 1,
                    x,
                    y: 0.0,
                    z,
                    angle,
                });
            }
        }
        Self {
            seats,
            taken: HashMap::new(),
        }
    }

    /// Nearest free seat by squared horizontal distance. Ties resolve to the
    /// earliest-generated seat (strict less-than in a forward scan).
    fn nearest_free(&self, hint: (f32, f32)) -> Option<&Seat> {
        let mut best: Option<&Seat> = None;
        let mut best_dist = f32::INFINITY;
        for seat in &self.seats {
            if self.taken.contains_key(&seat.key) {
                continue;
            }
            let dx = seat.x - hint.0;
            let dz = seat.z - hint.1;
            let dist = dx * dx + dz * dz;
            if dist < best_dist {
                best_dist = dist;
                best = Some(seat);
            }
        }
        best
    }

    fn release(&mut self, conn_id: &str) -> Option<String> {
        let key = self
            .taken
            .iter()
            .find_map(|(key, holder)| (holder == conn_id).then(|| key.clone()))?;
        self.taken.remove(&key);
        Some(key)
    }
}

/// Stable seat identity from immutable geometry, never from array position.
fn seat_key(tier: u32, x: f32, z: f32) -> String {
    format!("{}:{:.3}:{:.3}", tier, x, z)
}

/// Per-room seat layouts and occupancy. Layouts are generated lazily and
/// memoized, so repeated lookups for a room return identical seats.
pub struct SeatAllocator {
    config: SeatLayoutConfig,
    rooms: HashMap<TrialId, SeatMap>,
}

impl SeatAllocator {
    pub fn new(config: SeatLayoutConfig) -> Self {
        Self {
            config,
            rooms: HashMap::new(),
        }
    }

    pub fn layout_for(&mut self, trial_id: &str) -> &mut SeatMap {
        let config = &self.config;
        self.rooms
            .entry(trial_id.to_owned())
            .or_insert_with(|| SeatMap::generate(config))
    }

    /// Assign the nearest free seat to `hint`. A connection holds at most one
    /// seat: any seat it already holds in the room is released first, and the
    /// freed key is reported back for broadcast.
    pub fn request_seat(
        &mut self,
        trial_id: &str,
        conn_id: &str,
        hint: (f32, f32),
    ) -> Result<SeatAssignment, NoSeatsAvailable> {
        let map = self.layout_for(trial_id);
        let released = map.release(conn_id);
        let seat = map.nearest_free(hint).cloned().ok_or(NoSeatsAvailable)?;
        map.taken.insert(seat.key.clone(), conn_id.to_owned());
        Ok(SeatAssignment { seat, released })
    }

    /// Free whatever seat the connection holds in the room. Holding none is
    /// not an error.
    pub fn release_seat(&mut self, trial_id: &str, conn_id: &str) -> Option<String> {
        self.rooms.get_mut(trial_id)?.release(conn_id)
    }

    /// Drop the cached layout once a room has emptied.
    pub fn remove_room(&mut self, trial_id: &str) {
        self.rooms.remove(trial_id);
    }
}

impl Default for SeatAllocator {
    fn default() -> Self {
        Self::new(SeatLayoutConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SeatLayoutConfig {
        SeatLayoutConfig {
            tiers: 1,
            per_tier: 2,
            base_radius: 12.0,
            tier_gap: 2.0,
        }
    }

    #[test]
    fn layout_is_idempotent() {
        let mut alloc = SeatAllocator::default();
        let first: Vec<String> = alloc
            .layout_for("t1")
            .seats
            .iter()
            .map(|s| s.key.clone())
            .collect();
        let second: Vec<String> = alloc
            .layout_for("t1")
            .seats
            .iter()
            .map(|s| s.key.clone())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5 * 24);

        // A fresh allocator with the same configuration yields the same keys.
        let mut other = SeatAllocator::default();
        let third: Vec<String> = other
            .layout_for("t1")
            .seats
            .iter()
            .map(|s| s.key.clone())
            .collect();
        assert_eq!(first, third);
    }

    #[test]
    fn nearest_seat_from_origin_is_on_the_inner_tier() {
        let mut alloc = SeatAllocator::default();
        let assignment = alloc.request_seat("t1", "conn-a", (0.0, 0.0)).unwrap();
        let seat = assignment.seat;
        let dist = (seat.x * seat.x + seat.z * seat.z).sqrt();
        assert!((dist - 12.0).abs() < 1e-3, "expected inner tier, got {}", dist);
        // All inner-tier seats are equidistant from the origin, so the
        // first-generated one (angle 0) wins the tie.
        assert!((seat.x - 12.0).abs() < 1e-3);
        assert!(seat.z.abs() < 1e-3);
        assert_eq!(seat.tier, 1);
    }

    #[test]
    fn equidistant_tie_breaks_by_generation_order() {
        let mut alloc = SeatAllocator::default();
        let first = alloc.request_seat("t1", "conn-a", (0.0, 0.0)).unwrap().seat;
        let second = alloc.request_seat("t1", "conn-b", (0.0, 0.0)).unwrap().seat;
        let order: Vec<String> = alloc
            .layout_for("t1")
            .seats
            .iter()
            .map(|s| s.key.clone())
            .collect();
        assert_eq!(order[0], first.key);
        assert_eq!(order[1], second.key);
    }

    #[test]
    fn no_two_connections_share_a_seat() {
        let mut alloc = SeatAllocator::new(small_config());
        let a = alloc.request_seat("t1", "conn-a", (0.0, 0.0)).unwrap().seat;
        let b = alloc.request_seat("t1", "conn-b", (0.0, 0.0)).unwrap().seat;
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn full_room_fails_without_mutation() {
        let mut alloc = SeatAllocator::new(small_config());
        alloc.request_seat("t1", "conn-a", (0.0, 0.0)).unwrap();
        alloc.request_seat("t1", "conn-b", (0.0, 0.0)).unwrap();

        assert!(alloc.request_seat("t1", "conn-c", (0.0, 0.0)).is_err());
        let map = alloc.layout_for("t1");
        assert_eq!(map.taken.len(), 2);
        assert!(!map.taken.values().any(|holder| holder == "conn-c"));
    }

    #[test]
    fn re_request_releases_the_previous_seat() {
        let mut alloc = SeatAllocator::new(small_config());
        let first = alloc.request_seat("t1", "conn-a", (12.0, 0.0)).unwrap();
        assert!(first.released.is_none());

        // Hint at the opposite seat; the old one must come back as released.
        let second = alloc.request_seat("t1", "conn-a", (-12.0, 0.0)).unwrap();
        assert_eq!(second.released.as_deref(), Some(first.seat.key.as_str()));
        assert_ne!(second.seat.key, first.seat.key);

        let map = alloc.layout_for("t1");
        assert_eq!(map.taken.len(), 1);
        assert!(!map.taken.contains_key(&first.seat.key));
    }

    #[test]
    fn release_is_a_noop_when_nothing_is_held() {
        let mut alloc = SeatAllocator::new(small_config());
        assert!(alloc.release_seat("t1", "conn-a").is_none());

        let held = alloc.request_seat("t1", "conn-a", (0.0, 0.0)).unwrap().seat;
        assert_eq!(alloc.release_seat("t1", "conn-a"), Some(held.key.clone()));
        assert!(alloc.release_seat("t1", "conn-a").is_none());

        // The freed seat is assignable again.
        let again = alloc.request_seat("t1", "conn-b", (held.x, held.z)).unwrap();
        assert_eq!(again.seat.key, held.key);
    }

    #[test]
    fn rooms_do_not_share_occupancy() {
        let mut alloc = SeatAllocator::new(small_config());
        let a = alloc.request_seat("t1", "conn-a", (12.0, 0.0)).unwrap().seat;
        let b = alloc.request_seat("t2", "conn-b", (12.0, 0.0)).unwrap().seat;
        assert_eq!(a.key, b.key);
    }
}
