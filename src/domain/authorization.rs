use super::ids::{AuthorizationId, CustomerId, LoanId};
use crate::error::{AutopayError, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Active,
    Paused,
    Revoked,
}

impl AuthorizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationStatus::Active => "Active",
            AuthorizationStatus::Paused => "Paused",
            AuthorizationStatus::Revoked => "Revoked",
        }
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graded result of the processor's instant account verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    #[serde(rename = "POS")]
    Positive,
    #[serde(rename = "NEG")]
    Negative,
    #[serde(rename = "UNK")]
    Unknown,
}

impl VerificationStatus {
    /// Anything other than an explicit POS or NEG grade counts as unknown.
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "POS" => VerificationStatus::Positive,
            "NEG" => VerificationStatus::Negative,
            _ => VerificationStatus::Unknown,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            VerificationStatus::Positive => "POS",
            VerificationStatus::Negative => "NEG",
            VerificationStatus::Unknown => "UNK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Checking,
    Savings,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Checking => "Checking",
            AccountType::Savings => "Savings",
        }
    }
}

impl FromStr for AccountType {
    type Err = AutopayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "checking" => Ok(AccountType::Checking),
            "savings" => Ok(AccountType::Savings),
            other => Err(AutopayError::ValidationError(format!(
                "Unknown account type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckType {
    #[default]
    Personal,
    Business,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Personal => "Personal",
            CheckType::Business => "Business",
        }
    }
}

impl FromStr for CheckType {
    type Err = AutopayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "personal" => Ok(CheckType::Personal),
            "business" => Ok(CheckType::Business),
            other => Err(AutopayError::ValidationError(format!(
                "Unknown check type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenSource {
    Manual,
    Plaid,
}

/// A nine digit ABA routing number. Only ever held in memory on the way to
/// the processor; its `Debug` output is masked.
#[derive(Clone, PartialEq, Eq)]
pub struct RoutingNumber(String);

impl RoutingNumber {
    pub fn parse(raw: &str) -> Result<Self> {
        let digits = raw.trim();
        if digits.len() != 9 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AutopayError::ValidationError(
                "Routing number must be exactly 9 digits".to_string(),
            ));
        }
        Ok(Self(digits.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn last4(&self) -> String {
        last4(&self.0)
    }
}

impl fmt::Debug for RoutingNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutingNumber(*****{})", self.last4())
    }
}

/// A bank account number of 4 to 17 digits, masked in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct AccountNumber(String);

impl AccountNumber {
    pub fn parse(raw: &str) -> Result<Self> {
        let digits = raw.trim();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AutopayError::ValidationError(
                "Account number must contain only digits".to_string(),
            ));
        }
        if !(4..=17).contains(&digits.len()) {
            return Err(AutopayError::ValidationError(
                "Account number must be between 4 and 17 digits".to_string(),
            ));
        }
        Ok(Self(digits.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn last4(&self) -> String {
        last4(&self.0)
    }
}

impl fmt::Debug for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountNumber(****{})", self.last4())
    }
}

fn last4(digits: &str) -> String {
    let start = digits.len().saturating_sub(4);
    digits[start..].to_string()
}

/// Opaque token standing in for the bank account at the processor.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessorToken(String);

impl ProcessorToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ProcessorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProcessorToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    pub ip_address: Option<String>,
    pub captured_at: NaiveDateTime,
    pub sec_code: String,
}

/// A customer's consent to debit one bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub id: AuthorizationId,
    pub customer_id: CustomerId,
    /// Set when the mandate is bound to a single loan.
    pub loan_id: Option<LoanId>,
    /// Customer-level default account in multi-account mode.
    pub is_default: bool,
    pub status: AuthorizationStatus,
    pub account_holder: String,
    pub bank_name: String,
    pub account_last4: String,
    pub routing_last4: String,
    pub account_type: AccountType,
    pub token: ProcessorToken,
    pub verification_status: VerificationStatus,
    pub token_source: TokenSource,
    pub consent: Consent,
    pub revoked_at: Option<NaiveDateTime>,
    pub revocation_reason: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Authorization {
    pub fn is_active(&self) -> bool {
        self.status == AuthorizationStatus::Active
    }

    pub fn pause(&mut self) -> Result<()> {
        if self.status != AuthorizationStatus::Active {
            return Err(AutopayError::InvalidTransition(
                "Only active authorizations can be paused".to_string(),
            ));
        }
        self.status = AuthorizationStatus::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.status != AuthorizationStatus::Paused {
            return Err(AutopayError::InvalidTransition(
                "Only paused authorizations can be resumed".to_string(),
            ));
        }
        self.status = AuthorizationStatus::Active;
        Ok(())
    }

    pub fn revoke(&mut self, reason: Option<String>, at: NaiveDateTime) -> Result<()> {
        if self.status == AuthorizationStatus::Revoked {
            return Err(AutopayError::InvalidTransition(
                "Authorization is already revoked".to_string(),
            ));
        }
        self.status = AuthorizationStatus::Revoked;
        self.is_default = false;
        self.revoked_at = Some(at);
        self.revocation_reason = reason;
        Ok(())
    }

    fn make_default(&mut self) -> Result<()> {
        if !self.is_active() {
            return Err(AutopayError::InvalidTransition(
                "Only active authorizations can be set as default".to_string(),
            ));
        }
        self.is_default = true;
        Ok(())
    }

    /// True when `other` is a different Active mandate bound to the same loan.
    fn competes_with(&self, other: &Authorization) -> bool {
        other.id != self.id
            && other.is_active()
            && self.loan_id.is_some()
            && other.loan_id == self.loan_id
    }
}

/// A status change that touches more than one record of the same customer.
///
/// Stores apply these under a single write lock so that the check against
/// sibling authorizations and the resulting writes happen as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationChange {
    Pause,
    Resume,
    Revoke {
        reason: Option<String>,
        at: NaiveDateTime,
    },
    SetDefault,
}

impl AuthorizationChange {
    /// Applies the change to `target`, given every other authorization of
    /// the same customer. Returns all records that must be persisted, the
    /// updated target first.
    pub fn apply(
        self,
        mut target: Authorization,
        siblings: Vec<Authorization>,
    ) -> Result<Vec<Authorization>> {
        match self {
            AuthorizationChange::Pause => {
                target.pause()?;
                Ok(vec![target])
            }
            AuthorizationChange::Resume => {
                target.resume()?;
                ensure_exclusive(&target, &siblings)?;
                Ok(vec![target])
            }
            AuthorizationChange::Revoke { reason, at } => {
                target.revoke(reason, at)?;
                Ok(vec![target])
            }
            AuthorizationChange::SetDefault => {
                target.make_default()?;
                let mut changed = vec![target];
                changed.extend(clear_defaults(siblings));
                Ok(changed)
            }
        }
    }
}

/// Admits a newly linked authorization next to the customer's existing ones.
///
/// Rejects a second Active mandate for the same loan; when the newcomer is
/// the default, every prior default of the customer is unset.
pub fn admit(candidate: Authorization, siblings: Vec<Authorization>) -> Result<Vec<Authorization>> {
    if candidate.is_active() {
        ensure_exclusive(&candidate, &siblings)?;
    }
    let is_default = candidate.is_default;
    let mut changed = vec![candidate];
    if is_default {
        changed.extend(clear_defaults(siblings));
    }
    Ok(changed)
}

fn ensure_exclusive(candidate: &Authorization, siblings: &[Authorization]) -> Result<()> {
    if let Some(existing) = siblings.iter().find(|other| candidate.competes_with(other)) {
        let loan = existing
            .loan_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        return Err(AutopayError::Conflict(format!(
            "An active authorization ({}) already exists for loan {loan}",
            existing.id
        )));
    }
    Ok(())
}

fn clear_defaults(siblings: Vec<Authorization>) -> Vec<Authorization> {
    siblings
        .into_iter()
        .filter(|other| other.is_default)
        .map(|mut other| {
            other.is_default = false;
            other
        })
        .collect()
}
