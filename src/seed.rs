//! Demo catalog: ten policies, two applications, two subjects.
//!
//! Seeding replaces records with the same id, so it is safe to repeat.

use crate::policy::Policy;
use crate::storage::{ApplicationCatalog, ConsentStore, PolicyCatalog, StorageError};
use crate::subject::{Application, Subject};

const POLICIES: [(&str, &str, &str, &str, &str, &str); 10] = [
    ("d5bbb4cc-59c0-4077-9f7e-2fad74dc9998", "Anonymized", "Europe", "Collect", "Account", "Delivery"),
    ("54ff9c00-1b47-4389-8390-870b2ee9a03c", "Derived", "EULike", "Copy", "Admin", "Same"),
    ("d308b593-a2ad-4d9f-bcc3-ff47f4acfe5c", "Computer", "ThirdParty", "Move", "Browsing", "Public"),
    ("fcef1dbf-7b3d-4608-bebc-3f7ff6ae4f29", "Activity", "ControllerServers", "Aggregate", "Account", "Delivery"),
    ("be155566-7b56-4265-92fe-cb474aa0ed42", "Anonymized", "EU", "Analyze", "Admin", "Ours"),
    ("8a7cf1f6-4c34-497f-8a65-4c985eb47a35", "AudiovisualActivity", "EULike", "Anonymize", "AnyContact", "Public"),
    ("2f274ae6-6c2e-4350-9109-6c15e50ba670", "Computer", "ThirdCountries", "Copy", "Arts", "Same"),
    ("5f8d8a7b-e250-41ca-b23e-efbfd2d83911", "Content", "OurServers", "Derive", "AuxPurpose", "Unrelated"),
    ("86371d81-30ff-49c4-897f-5e6dbc721e85", "Demographic", "ProcessorServers", "Move", "Browsing", "Delivery"),
    ("4d675233-279f-4b5e-8695-b0b66be4f0f9", "Derived", "ThirdParty", "Aggregate", "Charity", "OtherRecipient"),
];

/// Application id of "Super application".
pub const SUPER_APPLICATION: &str = "d5aca7a6-ed5f-411c-b927-6f19c36b93c3";
/// Application id of "Super duper application".
pub const SUPER_DUPER_APPLICATION: &str = "c52dcc17-89f7-4a56-8836-bad27fd15bb3";
/// Subject id of "Bernard Antoine".
pub const BERNARD: &str = "9b84f8a5-e37c-4baf-8bdd-92135b1bc0f9";
/// Subject id of "Roger Frederick".
pub const ROGER: &str = "14f97114-bb25-43d2-85f9-b42c10538c09";

/// Demo policy catalog.
#[must_use]
pub fn demo_policies() -> Vec<Policy> {
    POLICIES
        .iter()
        .map(|(id, data, location, process, purpose, recipient)| {
            Policy::new(*id, *data, *location, *process, *purpose, *recipient)
        })
        .collect()
}

/// Demo applications.
#[must_use]
pub fn demo_applications() -> Vec<Application> {
    vec![
        Application::new(
            SUPER_APPLICATION,
            "Super application",
            POLICIES[..6].iter().map(|p| p.0),
        ),
        Application::new(
            SUPER_DUPER_APPLICATION,
            "Super duper application",
            POLICIES[4..].iter().map(|p| p.0),
        ),
    ]
}

/// Demo subjects.
#[must_use]
pub fn demo_subjects() -> Vec<Subject> {
    vec![
        Subject::new(BERNARD, "Bernard Antoine").with_policies([POLICIES[0].0]),
        Subject::new(ROGER, "Roger Frederick").with_policies([POLICIES[2].0]),
    ]
}

/// What [`seed_demo`] wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    /// Policies written.
    pub policies: usize,
    /// Applications written.
    pub applications: usize,
    /// Subjects whose document changed (and so produced a feed entry).
    pub subjects_changed: usize,
}

/// Inserts the demo catalog, replacing records with the same id.
pub fn seed_demo(
    subjects: &dyn ConsentStore,
    policies: &dyn PolicyCatalog,
    applications: &dyn ApplicationCatalog,
) -> Result<SeedReport, StorageError> {
    let mut report = SeedReport::default();
    for policy in demo_policies() {
        policies.put_policy(policy)?;
        report.policies += 1;
    }
    for application in demo_applications() {
        applications.put_application(application)?;
        report.applications += 1;
    }
    for subject in demo_subjects() {
        if subjects.put_subject(subject)?.is_some() {
            report.subjects_changed += 1;
        }
    }
    tracing::info!(
        policies = report.policies,
        applications = report.applications,
        subjects_changed = report.subjects_changed,
        "demo data seeded"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ApplicationId, SubjectId};
    use crate::storage::InMemoryStores;

    #[test]
    fn test_demo_shape() {
        assert_eq!(demo_policies().len(), 10);
        let apps = demo_applications();
        assert_eq!(apps[0].needed_policies.len(), 6);
        assert_eq!(apps[1].needed_policies.len(), 6);
        // the two applications share two policies
        assert_eq!(apps[0].needed_set().intersection(&apps[1].needed_set()).len(), 2);
    }

    #[test]
    fn test_seed_is_idempotent() {
        let stores = InMemoryStores::new();
        let first = seed_demo(&stores.subjects, &stores.policies, &stores.applications).unwrap();
        assert_eq!(first.subjects_changed, 2);

        let second = seed_demo(&stores.subjects, &stores.policies, &stores.applications).unwrap();
        assert_eq!(second.subjects_changed, 0);
        assert_eq!(stores.policies.list_policies(None).unwrap().len(), 10);
        assert!(stores
            .applications
            .get_application(&ApplicationId::new(SUPER_APPLICATION))
            .unwrap()
            .is_some());
        let bernard = stores.subjects.get_subject(&SubjectId::new(BERNARD)).unwrap().unwrap();
        assert_eq!(bernard.policies.len(), 1);
    }
}
