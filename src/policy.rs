//! Policies and policy sets.
//!
//! A [`Policy`] is an immutable taxonomy entry describing one combination of
//! data category, location, processing, purpose and recipient. Subjects hold
//! a [`PolicySet`] of the policies they consented to.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::PolicyId;

/// A data-processing policy subject to consent.
///
/// The atoms are open enumerations (e.g. `dataAtom: "Anonymized"`,
/// `locationAtom: "EULike"`); the relay stores them verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Policy id.
    pub id: PolicyId,
    /// What data is covered.
    pub data_atom: String,
    /// Where it may be processed.
    pub location_atom: String,
    /// How it is processed.
    pub process_atom: String,
    /// Why it is processed.
    pub purpose_atom: String,
    /// Who receives it.
    pub recipient_atom: String,
}

impl Policy {
    /// Creates a policy from its id and the five atoms, in
    /// data/location/process/purpose/recipient order.
    #[must_use]
    pub fn new(
        id: impl Into<PolicyId>,
        data: impl Into<String>,
        location: impl Into<String>,
        process: impl Into<String>,
        purpose: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            data_atom: data.into(),
            location_atom: location.into(),
            process_atom: process.into(),
            purpose_atom: purpose.into(),
            recipient_atom: recipient.into(),
        }
    }
}

/// A set of policy ids.
///
/// Backed by a `BTreeSet` so serialization is a sorted array and two equal
/// sets always encode to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicySet(BTreeSet<PolicyId>);

impl PolicySet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no policy is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `id` is in the set.
    #[must_use]
    pub fn contains(&self, id: &PolicyId) -> bool {
        self.0.contains(id)
    }

    /// Adds a policy; returns false if it was already present.
    pub fn insert(&mut self, id: PolicyId) -> bool {
        self.0.insert(id)
    }

    /// Removes a policy; returns false if it was absent.
    pub fn remove(&mut self, id: &PolicyId) -> bool {
        self.0.remove(id)
    }

    /// Policies in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &PolicyId> {
        self.0.iter()
    }

    /// `self − other`.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    /// `self ∩ other`.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    /// `self ∪ other`.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// True when no policy is in both sets.
    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.0.is_disjoint(&other.0)
    }
}

impl FromIterator<PolicyId> for PolicySet {
    fn from_iter<I: IntoIterator<Item = PolicyId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> FromIterator<&'a str> for PolicySet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(PolicyId::from).collect())
    }
}

impl IntoIterator for PolicySet {
    type Item = PolicyId;
    type IntoIter = std::collections::btree_set::IntoIter<PolicyId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a PolicySet {
    type Item = &'a PolicyId;
    type IntoIter = std::collections::btree_set::Iter<'a, PolicyId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for PolicySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{id}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_json_shape() {
        let policy = Policy::new("p1", "Anonymized", "Europe", "Collect", "Account", "Delivery");
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["id"], "p1");
        assert_eq!(json["dataAtom"], "Anonymized");
        assert_eq!(json["recipientAtom"], "Delivery");
    }

    #[test]
    fn test_policy_set_serializes_sorted() {
        let set: PolicySet = ["p3", "p1", "p2", "p1"].into_iter().collect();
        assert_eq!(set.len(), 3);
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["p1","p2","p3"]"#);
    }

    #[test]
    fn test_set_algebra() {
        let a: PolicySet = ["p1", "p2"].into_iter().collect();
        let b: PolicySet = ["p2", "p3"].into_iter().collect();
        assert_eq!(a.difference(&b), ["p1"].into_iter().collect());
        assert_eq!(a.intersection(&b), ["p2"].into_iter().collect());
        assert_eq!(a.union(&b), ["p1", "p2", "p3"].into_iter().collect());
        assert!(!a.is_disjoint(&b));
    }

    #[test]
    fn test_display() {
        let set: PolicySet = ["b", "a"].into_iter().collect();
        assert_eq!(set.to_string(), "[a, b]");
    }
}
