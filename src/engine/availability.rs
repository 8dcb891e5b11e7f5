use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

// ── Availability Projection ───────────────────────────────────────

/// Per-resource availability classification, recomputed on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Availability {
    /// No blocking window today or in the future.
    FullyAvailable,
    /// A blocking window contains today; `until` is the latest dropoff among
    /// such windows.
    Booked { until: Day },
    /// Free today, but a future blocking window starts at `next_pickup`,
    /// `days_free` days from today.
    AvailableUntil { next_pickup: Day, days_free: i64 },
}

/// Merge the cached windows with the ledger's view of the same resource.
/// The ledger wins on any mismatch; entries are deduped by reservation id.
/// Output is sorted by pickup day.
pub fn merge_windows(cache: &[BookingWindow], ledger: &[BookingWindow]) -> Vec<BookingWindow> {
    let mut by_reservation: HashMap<Ulid, BookingWindow> = HashMap::new();
    for w in cache {
        by_reservation.insert(w.reservation_id, *w);
    }
    for w in ledger {
        by_reservation.insert(w.reservation_id, *w); // ledger wins
    }
    let mut merged: Vec<BookingWindow> = by_reservation.into_values().collect();
    merged.sort_by_key(|w| w.period.pickup);
    merged
}

/// Classify one resource's calendar against `today`.
pub fn classify(cache: &[BookingWindow], ledger: &[BookingWindow], today: Day) -> Availability {
    let merged = merge_windows(cache, ledger);

    let mut booked_until: Option<Day> = None;
    let mut next_pickup: Option<Day> = None;

    for w in merged.iter().filter(|w| w.status.is_blocking()) {
        if w.period.contains_day(today) {
            booked_until = Some(match booked_until {
                Some(until) => until.max(w.period.dropoff),
                None => w.period.dropoff,
            });
        } else if w.period.pickup > today {
            next_pickup = Some(match next_pickup {
                Some(next) => next.min(w.period.pickup),
                None => w.period.pickup,
            });
        }
    }

    if let Some(until) = booked_until {
        return Availability::Booked { until };
    }
    if let Some(next) = next_pickup {
        return Availability::AvailableUntil {
            next_pickup: next,
            days_free: (next - today).num_days(),
        };
    }
    Availability::FullyAvailable
}

/// Derive a resource's status from its blocking windows (strict rule: rented
/// iff some blocking window contains today). `Maintenance` is a manual
/// override the derivation passes through untouched.
pub fn derive_status(current: ResourceStatus, windows: &[BookingWindow], today: Day) -> ResourceStatus {
    if current == ResourceStatus::Maintenance {
        return ResourceStatus::Maintenance;
    }
    let occupied = windows
        .iter()
        .any(|w| w.status.is_blocking() && w.period.contains_day(today));
    if occupied {
        ResourceStatus::Rented
    } else {
        ResourceStatus::Available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Day {
        s.parse().unwrap()
    }

    fn window(pickup: &str, dropoff: &str, status: ReservationStatus) -> BookingWindow {
        BookingWindow {
            reservation_id: Ulid::new(),
            period: Period::new(d(pickup), d(dropoff)),
            status,
        }
    }

    // ── classify ─────────────────────────────────────────

    #[test]
    fn classify_booked_when_window_contains_today() {
        let windows = vec![window("2025-06-10", "2025-06-15", ReservationStatus::Active)];
        let got = classify(&windows, &windows, d("2025-06-12"));
        assert_eq!(got, Availability::Booked { until: d("2025-06-15") });
    }

    #[test]
    fn classify_available_until_future_window() {
        let windows = vec![window("2025-06-10", "2025-06-15", ReservationStatus::Upcoming)];
        let got = classify(&windows, &windows, d("2025-06-01"));
        assert_eq!(
            got,
            Availability::AvailableUntil {
                next_pickup: d("2025-06-10"),
                days_free: 9,
            }
        );
    }

    #[test]
    fn classify_fully_available_when_only_past_windows() {
        let windows = vec![window("2025-05-01", "2025-05-05", ReservationStatus::Completed)];
        let got = classify(&windows, &windows, d("2025-06-01"));
        assert_eq!(got, Availability::FullyAvailable);
    }

    #[test]
    fn classify_booked_until_max_dropoff() {
        // Two windows touch today (e.g. a stale cache row beside the live
        // one) — report the furthest dropoff.
        let windows = vec![
            window("2025-06-10", "2025-06-12", ReservationStatus::Active),
            window("2025-06-12", "2025-06-18", ReservationStatus::Pending),
        ];
        let got = classify(&windows, &[], d("2025-06-12"));
        assert_eq!(got, Availability::Booked { until: d("2025-06-18") });
    }

    #[test]
    fn classify_skips_non_blocking() {
        let windows = vec![
            window("2025-06-10", "2025-06-15", ReservationStatus::Cancelled),
            window("2025-06-20", "2025-06-25", ReservationStatus::Completed),
        ];
        assert_eq!(classify(&windows, &windows, d("2025-06-12")), Availability::FullyAvailable);
    }

    #[test]
    fn classify_earliest_future_window_wins() {
        let windows = vec![
            window("2025-07-20", "2025-07-25", ReservationStatus::Upcoming),
            window("2025-07-04", "2025-07-06", ReservationStatus::Pending),
        ];
        let got = classify(&windows, &windows, d("2025-07-01"));
        assert_eq!(
            got,
            Availability::AvailableUntil {
                next_pickup: d("2025-07-04"),
                days_free: 3,
            }
        );
    }

    // ── merge_windows ────────────────────────────────────

    #[test]
    fn merge_ledger_wins_on_mismatch() {
        let id = Ulid::new();
        let stale = BookingWindow {
            reservation_id: id,
            period: Period::new(d("2025-06-01"), d("2025-06-05")),
            status: ReservationStatus::Pending,
        };
        let live = BookingWindow {
            reservation_id: id,
            period: Period::new(d("2025-06-01"), d("2025-06-07")),
            status: ReservationStatus::Active,
        };
        let merged = merge_windows(&[stale], &[live]);
        assert_eq!(merged, vec![live]);
    }

    #[test]
    fn merge_dedupes_and_keeps_cache_only_entries() {
        let cache_only = window("2025-06-01", "2025-06-03", ReservationStatus::Pending);
        let shared = window("2025-06-10", "2025-06-12", ReservationStatus::Active);
        let merged = merge_windows(&[cache_only, shared], &[shared]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_classify_uses_ledger_status() {
        // Cache says pending (blocking), ledger says cancelled — resource is free.
        let id = Ulid::new();
        let cached = BookingWindow {
            reservation_id: id,
            period: Period::new(d("2025-06-10"), d("2025-06-15")),
            status: ReservationStatus::Pending,
        };
        let ledger = BookingWindow {
            status: ReservationStatus::Cancelled,
            ..cached
        };
        assert_eq!(classify(&[cached], &[ledger], d("2025-06-12")), Availability::FullyAvailable);
    }

    // ── derive_status ────────────────────────────────────

    #[test]
    fn derive_status_rented_only_when_window_contains_today() {
        let windows = vec![window("2025-06-10", "2025-06-15", ReservationStatus::Active)];
        assert_eq!(
            derive_status(ResourceStatus::Available, &windows, d("2025-06-12")),
            ResourceStatus::Rented
        );
        assert_eq!(
            derive_status(ResourceStatus::Rented, &windows, d("2025-06-16")),
            ResourceStatus::Available
        );
    }

    #[test]
    fn derive_status_ignores_future_only_window() {
        // Deliberately stricter than counting any booking with a dropoff
        // still ahead: a future-only window leaves the vehicle available
        // today.
        let windows = vec![window("2025-06-10", "2025-06-15", ReservationStatus::Upcoming)];
        assert_eq!(
            derive_status(ResourceStatus::Available, &windows, d("2025-06-01")),
            ResourceStatus::Available
        );
    }

    #[test]
    fn derive_status_keeps_maintenance_override() {
        let windows = vec![window("2025-06-10", "2025-06-15", ReservationStatus::Active)];
        assert_eq!(
            derive_status(ResourceStatus::Maintenance, &windows, d("2025-06-12")),
            ResourceStatus::Maintenance
        );
    }
}
