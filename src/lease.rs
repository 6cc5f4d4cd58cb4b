//! Lease state machine for containers and blobs.
//!
//! Leases never change state on a timer. Every check derives the effective
//! state from the stored instants and the caller's `now` (see [`Lease::state`]).

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::models::{Lease, LeaseDuration, LeaseState};

/// Longest accepted break period, in seconds.
pub const MAX_BREAK_PERIOD: u32 = 60;

/// A lease operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    Acquire {
        proposed_id: Option<String>,
        /// Seconds, or `-1` for an infinite lease.
        duration: i64,
    },
    Renew {
        lease_id: String,
    },
    Change {
        lease_id: String,
        proposed_id: String,
    },
    Release {
        lease_id: Option<String>,
    },
    Break {
        break_period: Option<u32>,
    },
}

impl LeaseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseAction::Acquire { .. } => "acquire",
            LeaseAction::Renew { .. } => "renew",
            LeaseAction::Change { .. } => "change",
            LeaseAction::Release { .. } => "release",
            LeaseAction::Break { .. } => "break",
        }
    }
}

/// The kind of resource a lease lives on. Selects the error codes reported
/// for usage violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTarget {
    Container,
    Blob,
}

/// Whether an operation reads or mutates the leased resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseAccess {
    Read,
    Write,
}

/// What a lease operation reports back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseOutcome {
    pub lease_id: Option<String>,
    /// Seconds until a breaking lease becomes broken.
    pub lease_time: Option<u32>,
}

/// Applies `action` to `lease` at `now` and returns the new lease record.
///
/// `etag` is the current ETag of the blob and is recorded on acquisition; pass
/// `None` for containers.
pub fn apply(
    lease: &Lease,
    action: &LeaseAction,
    now: DateTime<Utc>,
    etag: Option<&str>,
) -> StorageResult<(Lease, LeaseOutcome)> {
    let state = lease.state(now);

    match action {
        LeaseAction::Acquire {
            proposed_id,
            duration,
        } => {
            let duration = LeaseDuration::from_secs(*duration).ok_or_else(|| {
                StorageError::with_message(
                    ErrorCode::InvalidHeaderValue,
                    "The lease duration must be -1 or between 15 and 60 seconds.",
                )
            })?;

            match state {
                LeaseState::Leased => {
                    let same = proposed_id
                        .as_deref()
                        .map(|id| lease.matches(id))
                        .unwrap_or(false);
                    if !same {
                        return Err(StorageError::new(ErrorCode::LeaseAlreadyPresent));
                    }
                }
                LeaseState::Breaking => {
                    return Err(StorageError::new(
                        ErrorCode::LeaseIsBreakingAndCannotBeAcquired,
                    ));
                }
                LeaseState::Available | LeaseState::Expired | LeaseState::Broken => {}
            }

            let lease_id = proposed_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let next = Lease {
                lease_id: Some(lease_id.clone()),
                recorded_state: LeaseState::Leased,
                duration: Some(duration),
                expires_on: expiry(duration, now),
                break_on: None,
                etag: etag.map(str::to_string),
            };
            Ok((
                next,
                LeaseOutcome {
                    lease_id: Some(lease_id),
                    lease_time: None,
                },
            ))
        }

        LeaseAction::Renew { lease_id } => {
            if matches!(state, LeaseState::Available | LeaseState::Expired) {
                return Err(StorageError::new(
                    ErrorCode::LeaseNotPresentWithLeaseOperation,
                ));
            }
            if !lease.matches(lease_id) {
                return Err(StorageError::new(
                    ErrorCode::LeaseIdMismatchWithLeaseOperation,
                ));
            }
            if state == LeaseState::Broken {
                return Err(StorageError::new(ErrorCode::LeaseIsBrokenAndCannotBeRenewed));
            }

            let duration = lease.duration.unwrap_or(LeaseDuration::Infinite);
            let mut next = lease.clone();
            next.recorded_state = LeaseState::Leased;
            next.duration = Some(duration);
            next.expires_on = expiry(duration, now);
            next.break_on = None;
            Ok((
                next,
                LeaseOutcome {
                    lease_id: Some(lease_id.clone()),
                    lease_time: None,
                },
            ))
        }

        LeaseAction::Change {
            lease_id,
            proposed_id,
        } => {
            match state {
                LeaseState::Available | LeaseState::Expired | LeaseState::Broken => {
                    return Err(StorageError::new(
                        ErrorCode::LeaseNotPresentWithLeaseOperation,
                    ));
                }
                LeaseState::Breaking => {
                    if !lease.matches(lease_id) {
                        return Err(StorageError::new(
                            ErrorCode::LeaseIdMismatchWithLeaseOperation,
                        ));
                    }
                    return Err(StorageError::new(
                        ErrorCode::LeaseIsBreakingAndCannotBeChanged,
                    ));
                }
                LeaseState::Leased => {}
            }

            // Repeating a change that already happened is accepted.
            if !lease.matches(lease_id) && !lease.matches(proposed_id) {
                return Err(StorageError::new(
                    ErrorCode::LeaseIdMismatchWithLeaseOperation,
                ));
            }

            let mut next = lease.clone();
            next.lease_id = Some(proposed_id.clone());
            Ok((
                next,
                LeaseOutcome {
                    lease_id: Some(proposed_id.clone()),
                    lease_time: None,
                },
            ))
        }

        LeaseAction::Release { lease_id } => {
            match state {
                LeaseState::Available => {
                    return Err(StorageError::new(
                        ErrorCode::LeaseNotPresentWithLeaseOperation,
                    ));
                }
                LeaseState::Leased | LeaseState::Breaking => match lease_id {
                    None => return Err(StorageError::new(ErrorCode::LeaseIdMissing)),
                    Some(id) if !lease.matches(id) => {
                        return Err(StorageError::new(
                            ErrorCode::LeaseIdMismatchWithLeaseOperation,
                        ));
                    }
                    Some(_) => {}
                },
                LeaseState::Broken | LeaseState::Expired => {}
            }

            Ok((Lease::default(), LeaseOutcome::default()))
        }

        LeaseAction::Break { break_period } => {
            if let Some(period) = break_period {
                if *period > MAX_BREAK_PERIOD {
                    return Err(StorageError::with_message(
                        ErrorCode::InvalidHeaderValue,
                        "The break period must be between 0 and 60 seconds.",
                    ));
                }
            }

            let break_on = match state {
                LeaseState::Available | LeaseState::Expired | LeaseState::Broken => {
                    return Err(StorageError::new(
                        ErrorCode::LeaseNotPresentWithLeaseOperation,
                    ));
                }
                LeaseState::Leased => {
                    let requested = break_period.map(|p| now + Duration::seconds(p as i64));
                    match (lease.expires_on, requested) {
                        (Some(expiry), Some(requested)) => expiry.min(requested),
                        (Some(expiry), None) => expiry,
                        (None, Some(requested)) => requested,
                        (None, None) => now,
                    }
                }
                LeaseState::Breaking => {
                    let current = lease.break_on.unwrap_or(now);
                    match break_period {
                        Some(p) => current.min(now + Duration::seconds(*p as i64)),
                        None => current,
                    }
                }
            };

            let mut next = lease.clone();
            next.recorded_state = LeaseState::Breaking;
            next.break_on = Some(break_on);
            let remaining = (break_on - now).num_seconds().max(0) as u32;
            Ok((
                next,
                LeaseOutcome {
                    lease_id: None,
                    lease_time: Some(remaining),
                },
            ))
        }
    }
}

/// Checks that an operation may touch a resource holding `lease`.
pub fn validate(
    lease: &Lease,
    supplied: Option<&str>,
    access: LeaseAccess,
    target: LeaseTarget,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    let (not_present, mismatch) = match target {
        LeaseTarget::Container => (
            ErrorCode::LeaseNotPresentWithContainerOperation,
            ErrorCode::LeaseIdMismatchWithContainerOperation,
        ),
        LeaseTarget::Blob => (
            ErrorCode::LeaseNotPresentWithBlobOperation,
            ErrorCode::LeaseIdMismatchWithBlobOperation,
        ),
    };

    match lease.state(now) {
        LeaseState::Available | LeaseState::Broken | LeaseState::Expired => match supplied {
            Some(_) => Err(StorageError::new(not_present)),
            None => Ok(()),
        },
        LeaseState::Leased | LeaseState::Breaking => match (supplied, access) {
            (None, LeaseAccess::Write) => Err(StorageError::new(ErrorCode::LeaseIdMissing)),
            (None, LeaseAccess::Read) => Ok(()),
            (Some(id), _) if lease.matches(id) => Ok(()),
            (Some(_), _) => Err(StorageError::new(mismatch)),
        },
    }
}

fn expiry(duration: LeaseDuration, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match duration {
        LeaseDuration::Infinite => None,
        LeaseDuration::Fixed(secs) => Some(now + Duration::seconds(secs as i64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn acquire(lease: &Lease, id: &str, duration: i64, now: DateTime<Utc>) -> Lease {
        let action = LeaseAction::Acquire {
            proposed_id: Some(id.to_string()),
            duration,
        };
        apply(lease, &action, now, None).unwrap().0
    }

    fn code(result: StorageResult<(Lease, LeaseOutcome)>) -> ErrorCode {
        result.unwrap_err().code
    }

    #[test]
    fn acquire_sets_expiry_and_state() {
        let lease = acquire(&Lease::default(), "a", 15, t0());
        assert_eq!(lease.state(t0()), LeaseState::Leased);
        assert_eq!(lease.expires_on, Some(t0() + Duration::seconds(15)));
        assert_eq!(
            lease.state(t0() + Duration::seconds(15)),
            LeaseState::Expired
        );
    }

    #[test]
    fn acquire_generates_id_and_records_etag() {
        let action = LeaseAction::Acquire {
            proposed_id: None,
            duration: -1,
        };
        let (lease, outcome) = apply(&Lease::default(), &action, t0(), Some("\"0x1\"")).unwrap();
        assert!(outcome.lease_id.is_some());
        assert_eq!(lease.lease_id, outcome.lease_id);
        assert_eq!(lease.etag.as_deref(), Some("\"0x1\""));
        assert_eq!(lease.expires_on, None);
    }

    #[test]
    fn acquire_rejects_bad_duration() {
        let action = LeaseAction::Acquire {
            proposed_id: None,
            duration: 10,
        };
        assert_eq!(
            code(apply(&Lease::default(), &action, t0(), None)),
            ErrorCode::InvalidHeaderValue
        );
    }

    #[test]
    fn acquire_while_leased_needs_same_id() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        let again = acquire(&lease, "a", 30, t0());
        assert!(again.matches("a"));

        let other = LeaseAction::Acquire {
            proposed_id: Some("b".into()),
            duration: -1,
        };
        assert_eq!(
            code(apply(&lease, &other, t0(), None)),
            ErrorCode::LeaseAlreadyPresent
        );
    }

    #[test]
    fn acquire_after_expiry_succeeds() {
        let lease = acquire(&Lease::default(), "a", 15, t0());
        let later = t0() + Duration::seconds(20);
        let next = acquire(&lease, "b", 15, later);
        assert!(next.matches("b"));
        assert_eq!(next.state(later), LeaseState::Leased);
    }

    #[test]
    fn renew_recomputes_expiry_from_now() {
        let lease = acquire(&Lease::default(), "a", 15, t0());
        let later = t0() + Duration::seconds(10);
        let action = LeaseAction::Renew {
            lease_id: "a".into(),
        };
        let (renewed, _) = apply(&lease, &action, later, None).unwrap();
        assert_eq!(renewed.expires_on, Some(later + Duration::seconds(15)));
    }

    #[test]
    fn renew_broken_lease_fails() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        let (broken, _) = apply(
            &lease,
            &LeaseAction::Break {
                break_period: Some(0),
            },
            t0(),
            None,
        )
        .unwrap();
        assert_eq!(broken.state(t0()), LeaseState::Broken);

        let renew = LeaseAction::Renew {
            lease_id: "a".into(),
        };
        assert_eq!(
            code(apply(&broken, &renew, t0(), None)),
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed
        );
    }

    #[test]
    fn change_requires_matching_id() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        let bad = LeaseAction::Change {
            lease_id: "x".into(),
            proposed_id: "b".into(),
        };
        assert_eq!(
            code(apply(&lease, &bad, t0(), None)),
            ErrorCode::LeaseIdMismatchWithLeaseOperation
        );

        let good = LeaseAction::Change {
            lease_id: "a".into(),
            proposed_id: "b".into(),
        };
        let (changed, outcome) = apply(&lease, &good, t0(), None).unwrap();
        assert!(changed.matches("b"));
        assert_eq!(outcome.lease_id.as_deref(), Some("b"));
    }

    #[test]
    fn change_while_breaking_fails() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        let (breaking, _) = apply(
            &lease,
            &LeaseAction::Break {
                break_period: Some(30),
            },
            t0(),
            None,
        )
        .unwrap();
        let change = LeaseAction::Change {
            lease_id: "a".into(),
            proposed_id: "b".into(),
        };
        assert_eq!(
            code(apply(&breaking, &change, t0(), None)),
            ErrorCode::LeaseIsBreakingAndCannotBeChanged
        );
    }

    #[test]
    fn release_returns_to_available() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        let release = LeaseAction::Release {
            lease_id: Some("a".into()),
        };
        let (released, _) = apply(&lease, &release, t0(), None).unwrap();
        assert_eq!(released.state(t0()), LeaseState::Available);
        assert_eq!(released.lease_id, None);
    }

    #[test]
    fn release_expired_lease_needs_no_id() {
        let lease = acquire(&Lease::default(), "a", 15, t0());
        let later = t0() + Duration::seconds(16);
        let release = LeaseAction::Release { lease_id: None };
        let (released, _) = apply(&lease, &release, later, None).unwrap();
        assert_eq!(released.state(later), LeaseState::Available);
    }

    #[test]
    fn break_uses_shorter_of_remaining_and_period() {
        let lease = acquire(&Lease::default(), "a", 20, t0());

        let (short, outcome) = apply(
            &lease,
            &LeaseAction::Break {
                break_period: Some(5),
            },
            t0(),
            None,
        )
        .unwrap();
        assert_eq!(outcome.lease_time, Some(5));
        assert_eq!(short.state(t0() + Duration::seconds(4)), LeaseState::Breaking);
        assert_eq!(short.state(t0() + Duration::seconds(5)), LeaseState::Broken);

        let (long, outcome) = apply(
            &lease,
            &LeaseAction::Break {
                break_period: Some(60),
            },
            t0(),
            None,
        )
        .unwrap();
        assert_eq!(outcome.lease_time, Some(20));
        assert_eq!(long.break_on, lease.expires_on);
    }

    #[test]
    fn break_infinite_without_period_is_immediate() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        let (broken, outcome) =
            apply(&lease, &LeaseAction::Break { break_period: None }, t0(), None).unwrap();
        assert_eq!(outcome.lease_time, Some(0));
        assert_eq!(broken.state(t0()), LeaseState::Broken);
    }

    #[test]
    fn break_available_lease_fails() {
        assert_eq!(
            code(apply(
                &Lease::default(),
                &LeaseAction::Break { break_period: None },
                t0(),
                None
            )),
            ErrorCode::LeaseNotPresentWithLeaseOperation
        );
    }

    #[test]
    fn renew_expired_lease_fails() {
        let lease = acquire(&Lease::default(), "a", 15, t0());
        let later = t0() + Duration::seconds(16);
        let renew = LeaseAction::Renew {
            lease_id: "a".into(),
        };
        assert_eq!(
            code(apply(&lease, &renew, later, None)),
            ErrorCode::LeaseNotPresentWithLeaseOperation
        );
    }

    #[test]
    fn break_expired_or_broken_lease_fails() {
        let brk = LeaseAction::Break { break_period: None };

        let expiring = acquire(&Lease::default(), "a", 15, t0());
        let later = t0() + Duration::seconds(16);
        assert_eq!(expiring.state(later), LeaseState::Expired);
        assert_eq!(
            code(apply(&expiring, &brk, later, None)),
            ErrorCode::LeaseNotPresentWithLeaseOperation
        );

        let infinite = acquire(&Lease::default(), "b", -1, t0());
        let (broken, _) = apply(&infinite, &brk, t0(), None).unwrap();
        assert_eq!(broken.state(t0()), LeaseState::Broken);
        assert_eq!(
            code(apply(&broken, &brk, t0(), None)),
            ErrorCode::LeaseNotPresentWithLeaseOperation
        );
    }

    #[test]
    fn write_without_id_on_leased_blob_fails() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        let err = validate(&lease, None, LeaseAccess::Write, LeaseTarget::Blob, t0()).unwrap_err();
        assert_eq!(err.code, ErrorCode::LeaseIdMissing);

        validate(&lease, Some("a"), LeaseAccess::Write, LeaseTarget::Blob, t0()).unwrap();
        assert_eq!(lease.state(t0()), LeaseState::Leased);

        let err = validate(&lease, Some("b"), LeaseAccess::Write, LeaseTarget::Blob, t0())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LeaseIdMismatchWithBlobOperation);
    }

    #[test]
    fn reads_allow_missing_id() {
        let lease = acquire(&Lease::default(), "a", -1, t0());
        validate(&lease, None, LeaseAccess::Read, LeaseTarget::Blob, t0()).unwrap();
        let err = validate(&lease, Some("b"), LeaseAccess::Read, LeaseTarget::Container, t0())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LeaseIdMismatchWithContainerOperation);
    }

    #[test]
    fn supplied_id_without_lease_fails() {
        let err = validate(
            &Lease::default(),
            Some("a"),
            LeaseAccess::Read,
            LeaseTarget::Container,
            t0(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::LeaseNotPresentWithContainerOperation);
    }
}
