use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix the legacy roster application puts in front of raw user ids when
/// it mints gateway tokens. Both `42` and `sso_42` refer to the same person,
/// depending on which era of the system wrote the record.
const PROVIDER_PREFIX: &str = "sso_";

/// A participant identity as issued by the external roster application.
///
/// The same human can be on record under more than one textual form, so any
/// comparison must go through [`Identity::equivalent_forms`] rather than
/// literal string equality. This type is the single place where the
/// equivalence rule lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The unprefixed form. Used to key transient structures (presence)
    /// where one entry per human is wanted.
    pub fn canonical(&self) -> &str {
        self.0.strip_prefix(PROVIDER_PREFIX).unwrap_or(&self.0)
    }

    /// All known textual forms that refer to this identity. Total and
    /// deterministic: an unrecognized shape still yields itself.
    pub fn equivalent_forms(&self) -> Vec<String> {
        let mut forms = vec![self.0.clone()];
        match self.0.strip_prefix(PROVIDER_PREFIX) {
            Some(stripped) if !stripped.is_empty() => forms.push(stripped.to_string()),
            Some(_) => {}
            None => forms.push(format!("{PROVIDER_PREFIX}{}", self.0)),
        }
        forms
    }

    /// Equivalence forms plus the username-derived prefixed variant some
    /// legacy records were keyed by. Used by the notification pull endpoint,
    /// which receives the username alongside the id.
    pub fn equivalent_forms_with_username(&self, username: &str) -> Vec<String> {
        let mut forms = self.equivalent_forms();
        if !username.is_empty() {
            let derived = format!("{PROVIDER_PREFIX}{username}");
            if !forms.contains(&derived) {
                forms.push(derived);
            }
        }
        forms
    }

    /// True if the two identities share at least one textual form.
    pub fn same_as(&self, other: &Identity) -> bool {
        let theirs = other.equivalent_forms();
        self.equivalent_forms().iter().any(|f| theirs.contains(f))
    }

    /// True if any equivalence form of `self` appears in `participant_forms`,
    /// the identity strings recorded on a conversation's participants.
    pub fn is_member(&self, participant_forms: &[String]) -> bool {
        let mine = self.equivalent_forms();
        participant_forms.iter().any(|p| mine.contains(p))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Identity {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for Identity {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_id_gains_prefixed_twin() {
        let forms = Identity::new("42").equivalent_forms();
        assert_eq!(forms, vec!["42".to_string(), "sso_42".to_string()]);
    }

    #[test]
    fn prefixed_id_gains_raw_twin() {
        let forms = Identity::new("sso_42").equivalent_forms();
        assert_eq!(forms, vec!["sso_42".to_string(), "42".to_string()]);
    }

    #[test]
    fn bare_prefix_is_a_singleton() {
        let forms = Identity::new("sso_").equivalent_forms();
        assert_eq!(forms, vec!["sso_".to_string()]);
    }

    #[test]
    fn membership_is_symmetric_across_variants() {
        let participants = vec!["sso_42".to_string(), "7".to_string()];
        assert!(Identity::new("42").is_member(&participants));
        assert!(Identity::new("sso_42").is_member(&participants));
        assert!(Identity::new("7").is_member(&participants));
        assert!(Identity::new("sso_7").is_member(&participants));
        assert!(!Identity::new("43").is_member(&participants));
    }

    #[test]
    fn same_as_matches_either_direction() {
        assert!(Identity::new("42").same_as(&Identity::new("sso_42")));
        assert!(Identity::new("sso_42").same_as(&Identity::new("42")));
        assert!(!Identity::new("42").same_as(&Identity::new("sso_43")));
    }

    #[test]
    fn canonical_strips_the_prefix() {
        assert_eq!(Identity::new("sso_42").canonical(), "42");
        assert_eq!(Identity::new("42").canonical(), "42");
    }

    #[test]
    fn username_variant_is_appended_once() {
        let forms = Identity::new("42").equivalent_forms_with_username("olena");
        assert_eq!(
            forms,
            vec![
                "42".to_string(),
                "sso_42".to_string(),
                "sso_olena".to_string()
            ]
        );
    }
}
