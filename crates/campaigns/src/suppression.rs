//! Suppression lists and the target validation chain.
//!
//! Validation runs twice per target: once at queue-time (cheap rejection,
//! smaller queue) and again at send-time (suppression lists may change
//! between the two). The chain is ordered and short-circuits on the first
//! failing check; each check carries a distinct key for the campaign log.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use mailforge_core::TargetId;

use crate::target::Target;

/// Reason a target was rejected, one per validator in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Address is not the record's designated primary address.
    NotPrimary,
    /// Address fails syntax validation.
    InvalidAddress,
    /// Send policy requires confirmed opt-in and the record has none.
    OptInPolicy,
    /// Record carries an explicit opt-out flag.
    OptOut,
    /// Address matches a suppressed domain.
    DomainSuppressed,
    /// Address (or the record itself) is on a suppression list.
    AddressSuppressed,
    /// A queue row or log entry for this target already exists.
    Duplicate,
}

impl RejectReason {
    /// Stable audit key, logged as `blocked-<key>`.
    pub fn key(&self) -> &'static str {
        match self {
            RejectReason::NotPrimary => "primary-address",
            RejectReason::InvalidAddress => "invalid-email",
            RejectReason::OptInPolicy => "opt-in",
            RejectReason::OptOut => "opt-out",
            RejectReason::DomainSuppressed => "domain-suppression",
            RejectReason::AddressSuppressed => "address-suppression",
            RejectReason::Duplicate => "duplicate",
        }
    }

    /// Inverse of [`RejectReason::key`].
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "primary-address" => Some(RejectReason::NotPrimary),
            "invalid-email" => Some(RejectReason::InvalidAddress),
            "opt-in" => Some(RejectReason::OptInPolicy),
            "opt-out" => Some(RejectReason::OptOut),
            "domain-suppression" => Some(RejectReason::DomainSuppressed),
            "address-suppression" => Some(RejectReason::AddressSuppressed),
            "duplicate" => Some(RejectReason::Duplicate),
            _ => None,
        }
    }
}

/// Outcome of validating one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFeedback {
    Passed,
    Rejected(RejectReason),
}

impl ValidationFeedback {
    pub fn passed(&self) -> bool {
        matches!(self, ValidationFeedback::Passed)
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            ValidationFeedback::Passed => None,
            ValidationFeedback::Rejected(reason) => Some(*reason),
        }
    }
}

/// Campaign-wide send policy inputs to the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendPolicy {
    /// Only send to records with confirmed opt-in.
    pub require_opt_in: bool,
}

/// Suppression state for one mailing, computed per validation pass.
///
/// Derived from the campaign's exempt / exempt-address / exempt-domain list
/// membership; not materialized as its own entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuppressionLists {
    /// Suppressed domain fragments, matched case-insensitively as substrings.
    pub domains: Vec<String>,
    /// Suppressed addresses, lowercased, matched exactly.
    pub addresses: HashSet<String>,
    /// Targets suppressed by membership in an exempt prospect list.
    pub target_ids: HashSet<TargetId>,
}

impl SuppressionLists {
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.addresses.is_empty() && self.target_ids.is_empty()
    }

    pub fn suppress_domain(&mut self, domain: impl Into<String>) {
        self.domains.push(domain.into().to_lowercase());
    }

    pub fn suppress_address(&mut self, address: impl Into<String>) {
        self.addresses.insert(address.into().to_lowercase());
    }

    pub fn suppress_target(&mut self, target_id: TargetId) {
        self.target_ids.insert(target_id);
    }
}

/// Minimal address-syntax check.
///
/// Deliberately permissive: one `@`, a non-empty local part, a dotted domain,
/// no whitespace. Deliverability is the transport's problem; this gate only
/// rejects addresses that cannot possibly be routed.
pub fn is_valid_email(address: &str) -> bool {
    if address.is_empty() || address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    let dotted = domain.split('.').collect::<Vec<_>>();
    dotted.len() >= 2 && dotted.iter().all(|part| !part.is_empty())
}

/// Run the ordered validation chain against one target.
///
/// Pure given its inputs: the same target against the same policy and lists
/// always yields the same feedback.
pub fn validate_target(
    target: &Target,
    policy: &SendPolicy,
    lists: &SuppressionLists,
) -> ValidationFeedback {
    if !target.primary_address {
        return ValidationFeedback::Rejected(RejectReason::NotPrimary);
    }
    if target.invalid_email || !is_valid_email(&target.email) {
        return ValidationFeedback::Rejected(RejectReason::InvalidAddress);
    }
    if policy.require_opt_in && !target.opt_in_confirmed {
        return ValidationFeedback::Rejected(RejectReason::OptInPolicy);
    }
    if target.opt_out {
        return ValidationFeedback::Rejected(RejectReason::OptOut);
    }

    let email = target.email_lower();
    if lists.domains.iter().any(|domain| email.contains(domain)) {
        return ValidationFeedback::Rejected(RejectReason::DomainSuppressed);
    }
    if lists.addresses.contains(&email) || lists.target_ids.contains(&target.id) {
        return ValidationFeedback::Rejected(RejectReason::AddressSuppressed);
    }

    ValidationFeedback::Passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetKind;
    use proptest::prelude::*;

    fn target(email: &str) -> Target {
        Target {
            id: TargetId::new(),
            kind: TargetKind::Contact,
            list_id: None,
            email: email.to_string(),
            name: None,
            primary_address: true,
            opt_in_confirmed: false,
            opt_out: false,
            invalid_email: false,
        }
    }

    #[test]
    fn accepts_a_clean_target() {
        let feedback = validate_target(
            &target("ada@example.com"),
            &SendPolicy::default(),
            &SuppressionLists::default(),
        );
        assert!(feedback.passed());
        assert_eq!(feedback.reason(), None);
    }

    #[test]
    fn email_syntax_gate() {
        assert!(is_valid_email("ada@example.com"));
        assert!(is_valid_email("a.b+tag@mail.example.co"));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("ada@example"));
        assert!(!is_valid_email("ada@exa mple.com"));
        assert!(!is_valid_email("ada@example..com"));
        assert!(!is_valid_email("ada@@example.com"));
    }

    #[test]
    fn chain_order_first_failure_wins() {
        // A target failing several checks reports the earliest one.
        let mut t = target("bad email");
        t.primary_address = false;
        t.opt_out = true;

        let feedback = validate_target(&t, &SendPolicy::default(), &SuppressionLists::default());
        assert_eq!(feedback.reason(), Some(RejectReason::NotPrimary));

        t.primary_address = true;
        let feedback = validate_target(&t, &SendPolicy::default(), &SuppressionLists::default());
        assert_eq!(feedback.reason(), Some(RejectReason::InvalidAddress));

        t.email = "ada@example.com".to_string();
        let feedback = validate_target(&t, &SendPolicy::default(), &SuppressionLists::default());
        assert_eq!(feedback.reason(), Some(RejectReason::OptOut));
    }

    #[test]
    fn opt_in_policy_applies_only_when_required() {
        let t = target("ada@example.com");
        let lists = SuppressionLists::default();

        let lax = SendPolicy {
            require_opt_in: false,
        };
        assert!(validate_target(&t, &lax, &lists).passed());

        let strict = SendPolicy {
            require_opt_in: true,
        };
        assert_eq!(
            validate_target(&t, &strict, &lists).reason(),
            Some(RejectReason::OptInPolicy)
        );
    }

    #[test]
    fn domain_suppression_is_case_insensitive_substring() {
        let mut lists = SuppressionLists::default();
        lists.suppress_domain("Example.COM");

        let feedback = validate_target(
            &target("Ada@EXAMPLE.com"),
            &SendPolicy::default(),
            &lists,
        );
        assert_eq!(feedback.reason(), Some(RejectReason::DomainSuppressed));

        // Substring semantics: a suffix fragment also matches.
        let mut lists = SuppressionLists::default();
        lists.suppress_domain("example.com");
        let feedback = validate_target(
            &target("ada@mail.example.com"),
            &SendPolicy::default(),
            &lists,
        );
        assert_eq!(feedback.reason(), Some(RejectReason::DomainSuppressed));
    }

    #[test]
    fn address_suppression_exact_and_by_membership() {
        let t = target("ada@example.com");

        let mut lists = SuppressionLists::default();
        lists.suppress_address("ADA@example.com");
        assert_eq!(
            validate_target(&t, &SendPolicy::default(), &lists).reason(),
            Some(RejectReason::AddressSuppressed)
        );

        let mut lists = SuppressionLists::default();
        lists.suppress_address("other@example.com");
        assert!(validate_target(&t, &SendPolicy::default(), &lists).passed());

        let mut lists = SuppressionLists::default();
        lists.suppress_target(t.id);
        assert_eq!(
            validate_target(&t, &SendPolicy::default(), &lists).reason(),
            Some(RejectReason::AddressSuppressed)
        );
    }

    proptest! {
        /// Validation is idempotent: repeated runs against unchanged inputs
        /// agree.
        #[test]
        fn validation_is_idempotent(
            email in "[a-z]{1,8}(@[a-z]{1,8}\\.[a-z]{2,3})?",
            opt_out in any::<bool>(),
            primary in any::<bool>(),
            suppress_domain in any::<bool>(),
        ) {
            let mut t = target(&email);
            t.opt_out = opt_out;
            t.primary_address = primary;

            let mut lists = SuppressionLists::default();
            if suppress_domain {
                lists.suppress_domain("example.org");
            }
            let policy = SendPolicy::default();

            let first = validate_target(&t, &policy, &lists);
            let second = validate_target(&t, &policy, &lists);
            prop_assert_eq!(first, second);
        }
    }
}
