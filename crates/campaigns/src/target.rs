//! Recipient targets.

use serde::{Deserialize, Serialize};

use mailforge_core::{DomainError, DomainResult, ListId, Record, TargetId};

/// Module/kind a target record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Prospect,
    Contact,
    Lead,
    User,
    /// A bare address from a static list; no backing CRM record.
    Address,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Prospect => "prospects",
            TargetKind::Contact => "contacts",
            TargetKind::Lead => "leads",
            TargetKind::User => "users",
            TargetKind::Address => "addresses",
        }
    }
}

impl core::str::FromStr for TargetKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prospects" => Ok(TargetKind::Prospect),
            "contacts" => Ok(TargetKind::Contact),
            "leads" => Ok(TargetKind::Lead),
            "users" => Ok(TargetKind::User),
            "addresses" => Ok(TargetKind::Address),
            other => Err(DomainError::validation(format!(
                "unknown target kind '{other}'"
            ))),
        }
    }
}

/// Lightweight reference to a target, as enumerated by the target provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub target_id: TargetId,
    pub kind: TargetKind,
    /// Prospect list the target was reached through, if any.
    pub list_id: Option<ListId>,
}

/// A fully-loaded recipient candidate.
///
/// Materialized from the record provider's attribute map at the data-access
/// boundary; the validation chain operates on this and never on raw records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub kind: TargetKind,
    pub list_id: Option<ListId>,
    pub email: String,
    pub name: Option<String>,
    /// The address above is the record's designated primary address.
    pub primary_address: bool,
    /// The record has confirmed opt-in (where the send policy demands it).
    pub opt_in_confirmed: bool,
    pub opt_out: bool,
    pub invalid_email: bool,
}

impl Target {
    /// Materialize a target from a provider record.
    ///
    /// Field conventions: `email` is required; `email_is_primary` defaults to
    /// true when absent (single-address records); the flag columns default to
    /// false.
    pub fn from_record(reference: TargetRef, record: &Record) -> DomainResult<Self> {
        let email = record.require_str("email")?.to_string();
        let primary_address = if record.contains("email_is_primary") {
            record.flag("email_is_primary")
        } else {
            true
        };

        Ok(Self {
            id: reference.target_id,
            kind: reference.kind,
            list_id: reference.list_id,
            email,
            name: record.str_field("name").map(str::to_string),
            primary_address,
            opt_in_confirmed: record.flag("opt_in_confirmed"),
            opt_out: record.flag("email_opt_out"),
            invalid_email: record.flag("invalid_email"),
        })
    }

    /// Lowercased address, the form every suppression comparison uses.
    pub fn email_lower(&self) -> String {
        self.email.to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> TargetRef {
        TargetRef {
            target_id: TargetId::new(),
            kind: TargetKind::Contact,
            list_id: Some(ListId::new()),
        }
    }

    #[test]
    fn from_record_reads_flags_and_defaults() {
        let record = Record::new("contacts", "c-1")
            .with("email", "Ada@Example.com")
            .with("name", "Ada Lovelace")
            .with("email_opt_out", 1);

        let target = Target::from_record(reference(), &record).unwrap();
        assert_eq!(target.email, "Ada@Example.com");
        assert_eq!(target.email_lower(), "ada@example.com");
        assert_eq!(target.name.as_deref(), Some("Ada Lovelace"));
        assert!(target.primary_address);
        assert!(target.opt_out);
        assert!(!target.invalid_email);
    }

    #[test]
    fn from_record_requires_an_address() {
        let record = Record::new("contacts", "c-2").with("name", "No Email");
        assert!(Target::from_record(reference(), &record).is_err());
    }

    #[test]
    fn explicit_non_primary_flag_is_honored() {
        let record = Record::new("contacts", "c-3")
            .with("email", "alt@example.com")
            .with("email_is_primary", false);

        let target = Target::from_record(reference(), &record).unwrap();
        assert!(!target.primary_address);
    }
}
