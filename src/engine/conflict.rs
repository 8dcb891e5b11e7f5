use chrono::{Datelike, Utc};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn today() -> Day {
    Utc::now().date_naive()
}

pub(crate) fn validate_period(period: &Period) -> Result<(), EngineError> {
    use crate::limits::*;
    if period.dropoff < period.pickup {
        return Err(EngineError::validation(
            "dropoff",
            "return date is before pickup date",
        ));
    }
    if period.pickup.year() < MIN_VALID_YEAR || period.dropoff.year() > MAX_VALID_YEAR {
        return Err(EngineError::validation("pickup", "date out of range"));
    }
    if period.len_days() > MAX_RENTAL_DAYS {
        return Err(EngineError::LimitExceeded("rental too long"));
    }
    Ok(())
}

/// Conflict Guard: append `window` to the resource's cache iff no blocking
/// window overlaps its period. Scan and append are one critical section —
/// every caller holds the resource's exclusive write lock, so nothing can
/// interleave between the check and the write.
///
/// `exclude` skips the reservation's own cache entry when re-admitting
/// (date changes, re-activation).
pub(crate) fn admit(
    rs: &mut ResourceState,
    window: BookingWindow,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if let Some(clash) = find_blocking_overlap(rs, &window.period, exclude) {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        return Err(EngineError::Conflict {
            reservation_id: clash.reservation_id,
            until: clash.period.dropoff,
        });
    }
    rs.insert_window(window);
    Ok(())
}

/// First blocking window overlapping `period`, if any. Cancelled/completed
/// entries never block.
pub(crate) fn find_blocking_overlap(
    rs: &ResourceState,
    period: &Period,
    exclude: Option<Ulid>,
) -> Option<BookingWindow> {
    rs.overlapping(period)
        .find(|w| w.status.is_blocking() && Some(w.reservation_id) != exclude)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Day {
        s.parse().unwrap()
    }

    fn resource() -> ResourceState {
        ResourceState::new(Ulid::new(), Ulid::new(), "Vios".into(), 14000, "MYR".into())
    }

    fn window(pickup: &str, dropoff: &str, status: ReservationStatus) -> BookingWindow {
        BookingWindow {
            reservation_id: Ulid::new(),
            period: Period::new(d(pickup), d(dropoff)),
            status,
        }
    }

    #[test]
    fn admit_into_empty_calendar() {
        let mut rs = resource();
        let w = window("2025-07-01", "2025-07-05", ReservationStatus::Pending);
        admit(&mut rs, w, None).unwrap();
        assert_eq!(rs.windows.len(), 1);
    }

    #[test]
    fn admit_overlap_conflicts_and_reports_dropoff() {
        let mut rs = resource();
        admit(&mut rs, window("2025-07-01", "2025-07-05", ReservationStatus::Pending), None).unwrap();

        let err = admit(
            &mut rs,
            window("2025-07-04", "2025-07-06", ReservationStatus::Pending),
            None,
        )
        .unwrap_err();
        match err {
            EngineError::Conflict { until, .. } => assert_eq!(until, d("2025-07-05")),
            other => panic!("expected conflict, got {other:?}"),
        }
        // Rejected window must not have been appended.
        assert_eq!(rs.windows.len(), 1);
    }

    #[test]
    fn admit_back_to_back_same_day_conflicts() {
        // Closed-interval policy: dropoff day == next pickup day clashes.
        let mut rs = resource();
        admit(&mut rs, window("2025-07-01", "2025-07-05", ReservationStatus::Active), None).unwrap();
        let err = admit(
            &mut rs,
            window("2025-07-05", "2025-07-08", ReservationStatus::Pending),
            None,
        );
        assert!(matches!(err, Err(EngineError::Conflict { .. })));
    }

    #[test]
    fn cancelled_windows_never_block() {
        let mut rs = resource();
        rs.insert_window(window("2025-07-01", "2025-07-05", ReservationStatus::Cancelled));
        rs.insert_window(window("2025-07-03", "2025-07-06", ReservationStatus::Completed));
        admit(&mut rs, window("2025-07-02", "2025-07-04", ReservationStatus::Pending), None).unwrap();
    }

    #[test]
    fn exclude_skips_own_entry() {
        let mut rs = resource();
        let own = window("2025-07-01", "2025-07-05", ReservationStatus::Active);
        rs.insert_window(own);
        // Re-admitting the same reservation with shifted dates ignores its
        // previous entry but still sees everyone else's.
        let shifted = BookingWindow {
            reservation_id: own.reservation_id,
            period: Period::new(d("2025-07-03"), d("2025-07-08")),
            status: ReservationStatus::Active,
        };
        admit(&mut rs, shifted, Some(own.reservation_id)).unwrap();
    }

    #[test]
    fn validate_period_rejects_inverted() {
        let p = Period {
            pickup: d("2025-07-05"),
            dropoff: d("2025-07-01"),
        };
        match validate_period(&p) {
            Err(EngineError::Validation { field, .. }) => assert_eq!(field, "dropoff"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn validate_period_rejects_overlong() {
        let p = Period::new(d("2025-01-01"), d("2027-01-01"));
        assert!(matches!(validate_period(&p), Err(EngineError::LimitExceeded(_))));
    }
}
