//! Data subjects and applications.

use serde::{Deserialize, Serialize};

use crate::ids::{ApplicationId, PolicyId, SubjectId};
use crate::policy::PolicySet;

/// An end user whose consent is tracked.
///
/// `policies` may reference ids missing from the policy catalog; readers
/// must tolerate dangling references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject id.
    pub id: SubjectId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Consented policies.
    #[serde(default)]
    pub policies: PolicySet,
}

impl Subject {
    /// Subject with no consented policies.
    #[must_use]
    pub fn new(id: impl Into<SubjectId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            policies: PolicySet::new(),
        }
    }

    /// Builder-style helper setting the consented policies.
    #[must_use]
    pub fn with_policies<I, P>(mut self, policies: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PolicyId>,
    {
        self.policies = policies.into_iter().map(Into::into).collect();
        self
    }
}

/// An application and the policies it needs consent for.
///
/// Accepts the legacy document names `needed-policies` and `policies` on
/// input; always writes `neededPolicies`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Application id.
    pub id: ApplicationId,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Policies the application needs consent for.
    #[serde(default, alias = "needed-policies", alias = "policies")]
    pub needed_policies: Vec<PolicyId>,
}

impl Application {
    /// Application needing `needed`.
    #[must_use]
    pub fn new<I, P>(id: impl Into<ApplicationId>, name: impl Into<String>, needed: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PolicyId>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            needed_policies: needed.into_iter().map(Into::into).collect(),
        }
    }

    /// The needed policies as a set (order dropped).
    #[must_use]
    pub fn needed_set(&self) -> PolicySet {
        self.needed_policies.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_roundtrip_shape() {
        let subject = Subject::new("u1", "Bernard Antoine").with_policies(["p2", "p1"]);
        let json = serde_json::to_value(&subject).unwrap();
        assert_eq!(json["id"], "u1");
        assert_eq!(json["policies"], serde_json::json!(["p1", "p2"]));
    }

    #[test]
    fn test_subject_missing_policies_defaults_empty() {
        let subject: Subject = serde_json::from_str(r#"{"id":"u1","name":"x"}"#).unwrap();
        assert!(subject.policies.is_empty());
    }

    #[test]
    fn test_subject_rejects_non_array_policies() {
        let result: Result<Subject, _> = serde_json::from_str(r#"{"id":"u1","policies":"p1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_application_legacy_field_names() {
        let legacy: Application =
            serde_json::from_str(r#"{"id":"a1","name":"Super application","needed-policies":["p1","p2"]}"#).unwrap();
        assert_eq!(legacy.needed_policies.len(), 2);

        let short: Application = serde_json::from_str(r#"{"id":"a2","policies":["p3"]}"#).unwrap();
        assert_eq!(short.needed_set(), ["p3"].into_iter().collect());

        let out = serde_json::to_value(&legacy).unwrap();
        assert!(out.get("neededPolicies").is_some());
    }
}
