use super::AutopayContext;
use super::lifecycle::TransactionLifecycle;
use crate::domain::authorization::{
    AccountNumber, AccountType, Authorization, AuthorizationChange, AuthorizationStatus,
    CheckType, Consent, ProcessorToken, RoutingNumber, TokenSource, VerificationStatus,
};
use crate::domain::ids::{AuthorizationId, CustomerId, LoanId};
use crate::domain::loan::{Loan, PaymentOverride};
use crate::domain::processor::TokenizeRequest;
use crate::domain::transaction::{TransactionFilter, TransactionStatus};
use crate::error::{AutopayError, Result};
use crate::settings::BindingMode;
use serde::Serialize;
use std::cmp::Reverse;
use tracing::{error, info, warn};

/// Bank details and consent captured when a customer links an account.
#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub customer_id: CustomerId,
    /// Required in single-loan mode, ignored in multi-account mode.
    pub loan_id: Option<LoanId>,
    pub routing_number: String,
    pub account_number: String,
    pub account_type: AccountType,
    pub customer_name: String,
    pub check_type: Option<CheckType>,
    /// A customer without an Active default gets this account as default regardless.
    pub is_default: bool,
    pub ip_address: Option<String>,
}

/// An account already verified by the aggregator, linked with the processor
/// token it issued.
#[derive(Debug, Clone)]
pub struct VerifiedTokenLink {
    pub customer_id: CustomerId,
    pub loan_id: Option<LoanId>,
    pub token: ProcessorToken,
    pub account_type: AccountType,
    pub bank_name: String,
    pub account_last4: String,
    pub customer_name: String,
    pub is_default: bool,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    LoanOverride,
    CustomerDefault,
    LoanBinding,
    None,
}

/// The account a loan's debits go to, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveAccount {
    pub authorization: Option<Authorization>,
    pub source: ResolutionSource,
}

impl EffectiveAccount {
    fn none() -> Self {
        Self {
            authorization: None,
            source: ResolutionSource::None,
        }
    }
}

/// Customer-facing summary of a loan's payment account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationSummary {
    pub has_authorization: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_id: Option<AuthorizationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AuthorizationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bank_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_last4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_type: Option<AccountType>,
    pub is_default: bool,
    pub is_override: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_source: Option<TokenSource>,
    pub resolution: ResolutionSource,
}

/// One row of a customer's account list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountListing {
    pub authorization_id: AuthorizationId,
    pub status: AuthorizationStatus,
    pub bank_name: String,
    pub account_last4: String,
    pub account_type: AccountType,
    pub is_default: bool,
    pub token_source: TokenSource,
    pub loan_id: Option<LoanId>,
}

impl From<&Authorization> for AccountListing {
    fn from(auth: &Authorization) -> Self {
        Self {
            authorization_id: auth.id,
            status: auth.status,
            bank_name: auth.bank_name.clone(),
            account_last4: auth.account_last4.clone(),
            account_type: auth.account_type,
            is_default: auth.is_default,
            token_source: auth.token_source,
            loan_id: auth.loan_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Revocation {
    pub authorization: Authorization,
    pub cancelled_transactions: usize,
    /// Set when loans are left without a payment account.
    pub warning: Option<String>,
}

/// Bank-account mandates: linking, lifecycle and resolution per loan.
#[derive(Clone)]
pub struct AuthorizationRegistry {
    ctx: AutopayContext,
    lifecycle: TransactionLifecycle,
}

impl AuthorizationRegistry {
    pub fn new(ctx: AutopayContext) -> Self {
        let lifecycle = TransactionLifecycle::new(ctx.clone());
        Self { ctx, lifecycle }
    }

    async fn load(&self, id: AuthorizationId) -> Result<Authorization> {
        self.ctx
            .authorizations
            .get(id)
            .await?
            .ok_or_else(|| AutopayError::NotFound(format!("Authorization {id}")))
    }

    async fn load_loan(&self, id: &LoanId) -> Result<Loan> {
        self.ctx
            .loans
            .get(id)
            .await?
            .ok_or_else(|| AutopayError::NotFound(format!("Loan {id}")))
    }

    /// Decides which loan a new authorization is bound to, checking ownership
    /// and exclusivity in single-loan mode.
    async fn binding_for(
        &self,
        customer_id: &CustomerId,
        loan_id: Option<&LoanId>,
    ) -> Result<Option<LoanId>> {
        if self.ctx.settings.binding_mode == BindingMode::MultiAccount {
            return Ok(None);
        }
        let loan_id = loan_id.ok_or_else(|| {
            AutopayError::ValidationError("A loan is required to link an account".to_string())
        })?;
        let loan = self.load_loan(loan_id).await?;
        if loan.customer_id != *customer_id {
            return Err(AutopayError::ValidationError(
                "Loan does not belong to this customer".to_string(),
            ));
        }
        let bound = self.ctx.authorizations.for_loan(loan_id).await?;
        if bound.iter().any(Authorization::is_active) {
            return Err(AutopayError::Conflict(format!(
                "An active authorization already exists for loan {loan_id}. Please revoke it first."
            )));
        }
        Ok(Some(loan.id))
    }

    /// Whether a new multi-account authorization becomes the default: when
    /// asked to, or when the customer has no Active default yet.
    async fn wants_default(&self, customer_id: &CustomerId, requested: bool) -> Result<bool> {
        if self.ctx.settings.binding_mode != BindingMode::MultiAccount {
            return Ok(false);
        }
        if requested {
            return Ok(true);
        }
        let has_default = self
            .ctx
            .authorizations
            .for_customer(customer_id)
            .await?
            .iter()
            .any(|a| a.is_default && a.is_active());
        Ok(!has_default)
    }

    /// Tokenizes and verifies a bank account with the processor and stores
    /// the resulting Active authorization.
    pub async fn tokenize_and_link(&self, request: LinkRequest) -> Result<Authorization> {
        if !self.ctx.settings.enabled {
            return Err(AutopayError::Disabled);
        }
        let routing_number = RoutingNumber::parse(&request.routing_number)?;
        let account_number = AccountNumber::parse(&request.account_number)?;
        let customer_name = request.customer_name.trim();
        if customer_name.is_empty() {
            return Err(AutopayError::ValidationError(
                "Customer name is required".to_string(),
            ));
        }
        let loan_id = self
            .binding_for(&request.customer_id, request.loan_id.as_ref())
            .await?;
        let is_default = self
            .wants_default(&request.customer_id, request.is_default)
            .await?;

        let tokenize = TokenizeRequest {
            routing_number,
            account_number,
            account_type: request.account_type,
            customer_name: customer_name.to_string(),
            check_type: request.check_type,
        };
        let verified = self
            .ctx
            .processor
            .tokenize_and_verify(&tokenize)
            .await
            .map_err(|failure| AutopayError::ProcessorError(failure.message))?;

        match verified.verification {
            VerificationStatus::Negative => {
                warn!(customer_id = %request.customer_id, "Bank account failed verification");
                return Err(AutopayError::VerificationFailed(
                    "This account cannot be used for autopay".to_string(),
                ));
            }
            VerificationStatus::Unknown if !self.ctx.settings.policy.allow_unknown_verification => {
                warn!(customer_id = %request.customer_id, "Bank account could not be verified");
                return Err(AutopayError::VerificationFailed(
                    "Bank account could not be verified. Please contact support.".to_string(),
                ));
            }
            _ => {}
        }

        let now = self.ctx.clock.now();
        let authorization = Authorization {
            id: AuthorizationId::generate(),
            customer_id: request.customer_id,
            loan_id,
            is_default,
            status: AuthorizationStatus::Active,
            account_holder: customer_name.to_string(),
            bank_name: verified.bank_name.unwrap_or_default(),
            account_last4: verified.account_last4,
            routing_last4: verified.routing_last4,
            account_type: request.account_type,
            token: verified.token,
            verification_status: verified.verification,
            token_source: TokenSource::Manual,
            consent: Consent {
                ip_address: request.ip_address,
                captured_at: now,
                sec_code: self.ctx.settings.policy.default_sec_code.clone(),
            },
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        };

        let stored = self.ctx.authorizations.insert(authorization).await?;
        info!(
            authorization_id = %stored.id,
            customer_id = %stored.customer_id,
            account_last4 = %stored.account_last4,
            verification = stored.verification_status.as_code(),
            is_default = stored.is_default,
            "Linked bank account"
        );
        Ok(stored)
    }

    /// Links an account the aggregator already verified. Such accounts count
    /// as positively verified.
    pub async fn link_verified_token(&self, link: VerifiedTokenLink) -> Result<Authorization> {
        if !self.ctx.settings.enabled {
            return Err(AutopayError::Disabled);
        }
        let loan_id = self
            .binding_for(&link.customer_id, link.loan_id.as_ref())
            .await?;
        let is_default = self.wants_default(&link.customer_id, link.is_default).await?;

        let now = self.ctx.clock.now();
        let authorization = Authorization {
            id: AuthorizationId::generate(),
            customer_id: link.customer_id,
            loan_id,
            is_default,
            status: AuthorizationStatus::Active,
            account_holder: link.customer_name,
            bank_name: link.bank_name,
            account_last4: link.account_last4,
            routing_last4: String::new(),
            account_type: link.account_type,
            token: link.token,
            verification_status: VerificationStatus::Positive,
            token_source: TokenSource::Plaid,
            consent: Consent {
                ip_address: link.ip_address,
                captured_at: now,
                sec_code: self.ctx.settings.policy.default_sec_code.clone(),
            },
            revoked_at: None,
            revocation_reason: None,
            created_at: now,
        };

        let stored = self.ctx.authorizations.insert(authorization).await?;
        info!(
            authorization_id = %stored.id,
            customer_id = %stored.customer_id,
            "Linked aggregator-verified bank account"
        );
        Ok(stored)
    }

    /// The loan's override: one set through [`set_loan_override`](Self::set_loan_override)
    /// takes precedence over the loan book's.
    async fn payment_override(&self, loan: &Loan) -> Result<Option<AuthorizationId>> {
        Ok(match self.ctx.overrides.find(&loan.id).await? {
            Some(stored) => stored.authorization_id,
            None => loan.payment_override,
        })
    }

    /// Resolves the account a loan's debits go to.
    ///
    /// A loan-level override wins. If the override is not Active the loan has
    /// no account at all: there is no fallback to the customer default. In
    /// single-loan mode a loan is only ever paid by the mandate bound to it.
    pub async fn effective_account(&self, loan_id: &LoanId) -> Result<EffectiveAccount> {
        let loan = self.load_loan(loan_id).await?;

        if let Some(override_id) = self.payment_override(&loan).await? {
            return match self.ctx.authorizations.get(override_id).await? {
                Some(auth) if auth.is_active() => Ok(EffectiveAccount {
                    authorization: Some(auth),
                    source: ResolutionSource::LoanOverride,
                }),
                Some(auth) => {
                    error!(
                        loan_id = %loan.id,
                        authorization_id = %auth.id,
                        status = %auth.status,
                        "Loan payment override is not active"
                    );
                    Ok(EffectiveAccount::none())
                }
                None => {
                    error!(
                        loan_id = %loan.id,
                        authorization_id = %override_id,
                        "Loan payment override does not exist"
                    );
                    Ok(EffectiveAccount::none())
                }
            };
        }

        let found = match self.ctx.settings.binding_mode {
            BindingMode::MultiAccount => self
                .ctx
                .authorizations
                .for_customer(&loan.customer_id)
                .await?
                .into_iter()
                .find(|a| a.is_default && a.is_active())
                .map(|auth| (auth, ResolutionSource::CustomerDefault)),
            BindingMode::SingleLoan => self
                .ctx
                .authorizations
                .for_loan(&loan.id)
                .await?
                .into_iter()
                .find(Authorization::is_active)
                .map(|auth| (auth, ResolutionSource::LoanBinding)),
        };

        Ok(match found {
            Some((authorization, source)) => EffectiveAccount {
                authorization: Some(authorization),
                source,
            },
            None => EffectiveAccount::none(),
        })
    }

    pub async fn resolve_payment_account(&self, loan_id: &LoanId) -> Result<Option<Authorization>> {
        Ok(self.effective_account(loan_id).await?.authorization)
    }

    pub async fn authorization_status(&self, loan_id: &LoanId) -> Result<AuthorizationSummary> {
        let effective = self.effective_account(loan_id).await?;
        let is_override = effective.source == ResolutionSource::LoanOverride;
        Ok(match effective.authorization {
            Some(auth) => AuthorizationSummary {
                has_authorization: true,
                authorization_id: Some(auth.id),
                status: Some(auth.status),
                bank_name: Some(auth.bank_name),
                account_last4: Some(auth.account_last4),
                account_type: Some(auth.account_type),
                is_default: auth.is_default,
                is_override,
                token_source: Some(auth.token_source),
                resolution: effective.source,
            },
            None => AuthorizationSummary {
                has_authorization: false,
                authorization_id: None,
                status: None,
                bank_name: None,
                account_last4: None,
                account_type: None,
                is_default: false,
                is_override: false,
                token_source: None,
                resolution: ResolutionSource::None,
            },
        })
    }

    pub async fn pause(&self, id: AuthorizationId, reason: Option<String>) -> Result<Authorization> {
        let auth = self
            .ctx
            .authorizations
            .apply(id, AuthorizationChange::Pause)
            .await?;
        info!(
            authorization_id = %id,
            reason = reason.as_deref().unwrap_or_default(),
            "Authorization paused"
        );
        Ok(auth)
    }

    pub async fn resume(&self, id: AuthorizationId) -> Result<Authorization> {
        let auth = self
            .ctx
            .authorizations
            .apply(id, AuthorizationChange::Resume)
            .await?;
        info!(authorization_id = %id, "Authorization resumed");
        Ok(auth)
    }

    /// Revokes an authorization for good and cancels its Scheduled and
    /// Initiated transactions. A cancellation that fails is logged and the
    /// rest still proceed.
    pub async fn revoke(&self, id: AuthorizationId, reason: Option<String>) -> Result<Revocation> {
        let before = self.load(id).await?;
        let warning = if before.is_default {
            self.orphaned_loans_warning(&before).await?
        } else {
            None
        };

        let authorization = self
            .ctx
            .authorizations
            .apply(
                id,
                AuthorizationChange::Revoke {
                    reason: reason.clone(),
                    at: self.ctx.clock.now(),
                },
            )
            .await?;
        if let Some(message) = &warning {
            warn!(authorization_id = %id, customer_id = %authorization.customer_id, "{message}");
        }

        let pending = self
            .ctx
            .transactions
            .query(
                &TransactionFilter::with_statuses(&[
                    TransactionStatus::Scheduled,
                    TransactionStatus::Initiated,
                ])
                .authorization(id),
            )
            .await?;
        let mut cancelled = 0;
        for txn in pending {
            let txn_id = txn.id;
            match self
                .lifecycle
                .cancel_loaded(txn, Some("Authorization revoked".to_string()))
                .await
            {
                Ok(_) => cancelled += 1,
                Err(e) => error!(
                    authorization_id = %id,
                    transaction_id = %txn_id,
                    error = %e,
                    "Failed to cancel transaction of revoked authorization"
                ),
            }
        }

        info!(
            authorization_id = %id,
            reason = reason.as_deref().unwrap_or_default(),
            cancelled,
            "Authorization revoked"
        );
        Ok(Revocation {
            authorization,
            cancelled_transactions: cancelled,
            warning,
        })
    }

    /// Warns when `auth` is the customer's only Active account and loans
    /// without an override rely on it.
    async fn orphaned_loans_warning(&self, auth: &Authorization) -> Result<Option<String>> {
        let other_active = self
            .ctx
            .authorizations
            .for_customer(&auth.customer_id)
            .await?
            .iter()
            .any(|a| a.id != auth.id && a.is_active());
        if other_active {
            return Ok(None);
        }
        let mut relying = 0;
        for loan in self.ctx.loans.loans_for_customer(&auth.customer_id).await? {
            if self.payment_override(&loan).await?.is_none() {
                relying += 1;
            }
        }
        Ok((relying > 0).then(|| {
            format!(
                "{relying} active loan(s) will have no payment account after revocation. \
                 Consider adding a new account first."
            )
        }))
    }

    /// Makes `id` the customer's default, unsetting the previous one. Only
    /// meaningful in multi-account mode.
    pub async fn set_as_default(&self, id: AuthorizationId) -> Result<Authorization> {
        if self.ctx.settings.binding_mode != BindingMode::MultiAccount {
            return Err(AutopayError::ValidationError(
                "Default accounts are not used when each account is bound to a loan".to_string(),
            ));
        }
        let auth = self
            .ctx
            .authorizations
            .apply(id, AuthorizationChange::SetDefault)
            .await?;
        info!(authorization_id = %id, customer_id = %auth.customer_id, "Default account changed");
        Ok(auth)
    }

    /// Points a loan at a specific account, or back at the customer default
    /// when `authorization` is `None`.
    pub async fn set_loan_override(
        &self,
        loan_id: &LoanId,
        authorization: Option<AuthorizationId>,
    ) -> Result<()> {
        let loan = self.load_loan(loan_id).await?;
        if let Some(id) = authorization {
            let auth = self.load(id).await?;
            if auth.customer_id != loan.customer_id {
                return Err(AutopayError::ValidationError(
                    "This bank account does not belong to this customer".to_string(),
                ));
            }
            if !auth.is_active() {
                return Err(AutopayError::ValidationError(
                    "This bank account is not active".to_string(),
                ));
            }
        }
        self.ctx
            .overrides
            .save(PaymentOverride {
                loan_id: loan.id,
                authorization_id: authorization,
                updated_at: self.ctx.clock.now(),
            })
            .await?;
        info!(
            loan_id = %loan_id,
            authorization_id = ?authorization,
            "Loan payment account updated"
        );
        Ok(())
    }

    /// Active and Paused accounts of a customer, the default first, then
    /// newest first.
    pub async fn list_customer_accounts(&self, customer_id: &CustomerId) -> Result<Vec<AccountListing>> {
        let mut accounts: Vec<Authorization> = self
            .ctx
            .authorizations
            .for_customer(customer_id)
            .await?
            .into_iter()
            .filter(|a| a.status != AuthorizationStatus::Revoked)
            .collect();
        accounts.sort_by_key(|a| (Reverse(a.is_default), Reverse(a.created_at)));
        Ok(accounts.iter().map(AccountListing::from).collect())
    }
}
