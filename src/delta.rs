//! Consent deltas and the diff engine.
//!
//! [`diff`] is a pure function over two optional policy sets. It is total:
//! every presence combination of the before/after snapshots yields a
//! [`PolicyDiff`]. [`ConsentDelta`] attaches the subject, the store commit
//! time and the feed position so a delta recomputed from the same change is
//! byte-for-byte identical.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::FeedPosition;
use crate::ids::SubjectId;
use crate::policy::PolicySet;
use crate::subject::Subject;

/// Namespace for deterministic event ids (UUID v5).
const EVENT_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_4e0a_93d2_4b8e_9a57_1c0d_2e3f_4a5b);

/// What happened to the subject record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Subject appeared.
    Created,
    /// Subject document replaced.
    Updated,
    /// Subject removed.
    Deleted,
}

/// Set difference between two snapshots of a subject's policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDiff {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Policies granted by the change.
    pub added: PolicySet,
    /// Policies withdrawn by the change.
    pub withdrawn: PolicySet,
}

impl PolicyDiff {
    /// True when nothing was granted or withdrawn.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.withdrawn.is_empty()
    }
}

/// Computes the consent difference between two snapshots.
///
/// - no previous record: `Created`, everything in `new` is added
/// - record removed: `Deleted`, everything in `old` is withdrawn
/// - both present: `Updated` with `new − old` added and `old − new` withdrawn
/// - both absent: an empty `Deleted` diff the caller may suppress
#[must_use]
pub fn diff(old: Option<&PolicySet>, new: Option<&PolicySet>) -> PolicyDiff {
    match (old, new) {
        (None, Some(new)) => PolicyDiff {
            kind: ChangeKind::Created,
            added: new.clone(),
            withdrawn: PolicySet::new(),
        },
        (Some(old), None) => PolicyDiff {
            kind: ChangeKind::Deleted,
            added: PolicySet::new(),
            withdrawn: old.clone(),
        },
        (Some(old), Some(new)) => PolicyDiff {
            kind: ChangeKind::Updated,
            added: new.difference(old),
            withdrawn: old.difference(new),
        },
        (None, None) => PolicyDiff {
            kind: ChangeKind::Deleted,
            added: PolicySet::new(),
            withdrawn: PolicySet::new(),
        },
    }
}

/// One consent change of one subject, as published to the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentDelta {
    /// Deterministic id derived from subject and feed position.
    pub event_id: Uuid,
    /// Subject the delta is about; also the bus key.
    pub subject_id: SubjectId,
    /// Policies granted by this change.
    pub added_policies: PolicySet,
    /// Policies withdrawn by this change.
    pub withdrawn_policies: PolicySet,
    /// Store commit time of the mutation.
    pub occurred_at: DateTime<Utc>,
    /// Kind of change.
    pub change_kind: ChangeKind,
    /// Feed position the delta was computed from.
    pub sequence: FeedPosition,
}

impl ConsentDelta {
    /// Builds the delta for one before/after pair of a subject.
    #[must_use]
    pub fn from_change(
        subject_id: SubjectId,
        old: Option<&Subject>,
        new: Option<&Subject>,
        occurred_at: DateTime<Utc>,
        sequence: FeedPosition,
    ) -> Self {
        let d = diff(old.map(|s| &s.policies), new.map(|s| &s.policies));
        Self {
            event_id: event_id(&subject_id, sequence),
            subject_id,
            added_policies: d.added,
            withdrawn_policies: d.withdrawn,
            occurred_at,
            change_kind: d.kind,
            sequence,
        }
    }

    /// True when nothing was granted or withdrawn.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added_policies.is_empty() && self.withdrawn_policies.is_empty()
    }

    /// Tombstones carry no payload; everything else is JSON.
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        matches!(self.change_kind, ChangeKind::Deleted)
    }

    /// Encodes the bus payload: `None` for deletions, JSON otherwise.
    pub fn encode_payload(&self) -> Result<Option<Vec<u8>>, serde_json::Error> {
        if self.is_tombstone() {
            return Ok(None);
        }
        serde_json::to_vec(self).map(Some)
    }
}

/// Deterministic event id for `(subject, position)`.
#[must_use]
pub fn event_id(subject_id: &SubjectId, sequence: FeedPosition) -> Uuid {
    let mut name = Vec::with_capacity(subject_id.as_bytes().len() + 9);
    name.extend_from_slice(subject_id.as_bytes());
    name.push(b'@');
    name.extend_from_slice(&sequence.as_u64().to_be_bytes());
    Uuid::new_v5(&EVENT_NAMESPACE, &name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn set(ids: &[&str]) -> PolicySet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_created() {
        let d = diff(None, Some(&set(&["p1"])));
        assert_eq!(d.kind, ChangeKind::Created);
        assert_eq!(d.added, set(&["p1"]));
        assert!(d.withdrawn.is_empty());
    }

    #[test]
    fn test_updated_swaps_policies() {
        let d = diff(Some(&set(&["p1", "p2"])), Some(&set(&["p2", "p3"])));
        assert_eq!(d.kind, ChangeKind::Updated);
        assert_eq!(d.added, set(&["p3"]));
        assert_eq!(d.withdrawn, set(&["p1"]));
    }

    #[test]
    fn test_deleted() {
        let d = diff(Some(&set(&["p1", "p2"])), None);
        assert_eq!(d.kind, ChangeKind::Deleted);
        assert!(d.added.is_empty());
        assert_eq!(d.withdrawn, set(&["p1", "p2"]));
    }

    #[test]
    fn test_both_absent_is_empty() {
        let d = diff(None, None);
        assert!(d.is_empty());
    }

    #[test]
    fn test_unchanged_update_is_empty() {
        let d = diff(Some(&set(&["p1"])), Some(&set(&["p1"])));
        assert_eq!(d.kind, ChangeKind::Updated);
        assert!(d.is_empty());
    }

    #[test]
    fn test_tombstone_payload_is_none() {
        let old = Subject::new("u1", "x").with_policies(["p1"]);
        let delta = ConsentDelta::from_change(SubjectId::new("u1"), Some(&old), None, Utc::now(), FeedPosition::new(3));
        assert!(delta.is_tombstone());
        assert!(delta.encode_payload().unwrap().is_none());
    }

    #[test]
    fn test_payload_is_deterministic() {
        let at = Utc::now();
        let new = Subject::new("u1", "x").with_policies(["p2", "p1"]);
        let a = ConsentDelta::from_change(SubjectId::new("u1"), None, Some(&new), at, FeedPosition::new(9));
        let b = ConsentDelta::from_change(SubjectId::new("u1"), None, Some(&new), at, FeedPosition::new(9));
        assert_eq!(a.encode_payload().unwrap(), b.encode_payload().unwrap());
        assert_eq!(a.event_id, b.event_id);

        let json: serde_json::Value = serde_json::from_slice(&a.encode_payload().unwrap().unwrap()).unwrap();
        assert_eq!(json["changeKind"], "Created");
        assert_eq!(json["addedPolicies"], serde_json::json!(["p1", "p2"]));
        assert_eq!(json["withdrawnPolicies"], serde_json::json!([]));
    }

    #[test]
    fn test_event_id_depends_on_position() {
        let s = SubjectId::new("u1");
        assert_ne!(event_id(&s, FeedPosition::new(1)), event_id(&s, FeedPosition::new(2)));
    }

    fn policy_set() -> impl Strategy<Value = PolicySet> {
        prop::collection::btree_set("p[0-9]{1,2}", 0..12)
            .prop_map(|ids| ids.into_iter().map(crate::ids::PolicyId::from).collect())
    }

    proptest! {
        #[test]
        fn prop_added_and_withdrawn_are_disjoint(old in policy_set(), new in policy_set()) {
            let d = diff(Some(&old), Some(&new));
            prop_assert!(d.added.is_disjoint(&d.withdrawn));
        }

        #[test]
        fn prop_applying_diff_reproduces_new(old in policy_set(), new in policy_set()) {
            let d = diff(Some(&old), Some(&new));
            let rebuilt = old.difference(&d.withdrawn).union(&d.added);
            prop_assert_eq!(rebuilt, new);
        }

        #[test]
        fn prop_total_over_presence(old in proptest::option::of(policy_set()), new in proptest::option::of(policy_set())) {
            let d = diff(old.as_ref(), new.as_ref());
            prop_assert!(d.added.is_disjoint(&d.withdrawn));
            if new.is_none() {
                prop_assert!(d.added.is_empty());
            }
            if old.is_none() {
                prop_assert!(d.withdrawn.is_empty());
            }
        }
    }
}
