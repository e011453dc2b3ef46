mod common;

use ach_autopay::application::registry::{ResolutionSource, VerifiedTokenLink};
use ach_autopay::domain::authorization::{
    AccountType, AuthorizationChange, AuthorizationStatus, ProcessorToken, TokenSource,
    VerificationStatus,
};
use ach_autopay::domain::ids::{CustomerId, LoanId};
use ach_autopay::domain::loan::Loan;
use ach_autopay::domain::transaction::TransactionStatus;
use ach_autopay::error::AutopayError;
use ach_autopay::settings::BindingMode;
use chrono::Duration;
use common::{Harness, enabled_settings, start};
use rust_decimal_macros::dec;

fn single_loan() -> Harness {
    let mut settings = enabled_settings();
    settings.binding_mode = BindingMode::SingleLoan;
    Harness::with_settings(settings)
}

fn token_link(customer: &str, loan: Option<&str>) -> VerifiedTokenLink {
    VerifiedTokenLink {
        customer_id: CustomerId::from(customer),
        loan_id: loan.map(LoanId::from),
        token: ProcessorToken::new("processor-sandbox-7f3a"),
        account_type: AccountType::Savings,
        bank_name: "Aggregated Credit Union".to_string(),
        account_last4: "4321".to_string(),
        customer_name: "Jane Borrower".to_string(),
        is_default: false,
        ip_address: Some("203.0.113.7".to_string()),
    }
}

#[tokio::test]
async fn test_default_account_pays_loans_without_override() {
    let h = Harness::new();
    h.add_loan("LOAN-1", "CUST-1").await;
    let auth = h.link("CUST-1", true).await;

    let effective = h.registry().effective_account(&LoanId::from("LOAN-1")).await.unwrap();

    assert_eq!(effective.source, ResolutionSource::CustomerDefault);
    assert_eq!(effective.authorization.map(|a| a.id), Some(auth.id));
}

#[tokio::test]
async fn test_inactive_override_fails_closed() {
    let h = Harness::new();
    let loan = h.add_loan("LOAN-1", "CUST-1").await;
    let default = h.link("CUST-1", true).await;
    let dedicated = h.link("CUST-1", false).await;
    let registry = h.registry();
    registry.set_loan_override(&loan.id, Some(dedicated.id)).await.unwrap();

    let effective = registry.effective_account(&loan.id).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::LoanOverride);
    assert_eq!(effective.authorization.map(|a| a.id), Some(dedicated.id));

    registry.pause(dedicated.id, None).await.unwrap();

    let effective = registry.effective_account(&loan.id).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::None);
    assert!(effective.authorization.is_none());
    assert!(registry.resolve_payment_account(&loan.id).await.unwrap().is_none());
    let summary = registry.authorization_status(&loan.id).await.unwrap();
    assert!(!summary.has_authorization);
    assert!(default.is_default);
}

#[tokio::test]
async fn test_override_must_belong_to_customer_and_be_active() {
    let h = Harness::new();
    let loan = h.add_loan("LOAN-1", "CUST-1").await;
    let foreign = h.link("CUST-2", true).await;
    let own = h.link("CUST-1", true).await;
    let registry = h.registry();

    assert!(matches!(
        registry.set_loan_override(&loan.id, Some(foreign.id)).await,
        Err(AutopayError::ValidationError(_))
    ));

    registry.pause(own.id, None).await.unwrap();
    assert!(matches!(
        registry.set_loan_override(&loan.id, Some(own.id)).await,
        Err(AutopayError::ValidationError(_))
    ));

    registry.resume(own.id).await.unwrap();
    registry.set_loan_override(&loan.id, Some(own.id)).await.unwrap();
    registry.set_loan_override(&loan.id, None).await.unwrap();
    let effective = registry.effective_account(&loan.id).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::CustomerDefault);
}

#[tokio::test]
async fn test_pause_and_resume_transitions() {
    let h = Harness::new();
    let auth = h.link("CUST-1", true).await;
    let registry = h.registry();

    assert!(matches!(
        registry.resume(auth.id).await,
        Err(AutopayError::InvalidTransition(_))
    ));
    let paused = registry.pause(auth.id, Some("Travelling".to_string())).await.unwrap();
    assert_eq!(paused.status, AuthorizationStatus::Paused);
    assert!(matches!(
        registry.pause(auth.id, None).await,
        Err(AutopayError::InvalidTransition(_))
    ));
    let resumed = registry.resume(auth.id).await.unwrap();
    assert_eq!(resumed.status, AuthorizationStatus::Active);
}

#[tokio::test]
async fn test_revoke_cancels_open_debits_and_warns() {
    let h = Harness::new();
    let loan = h.add_loan("LOAN-1", "CUST-1").await;
    let auth = h.link("CUST-1", true).await;
    let initiated = h.initiated(&auth, &loan, dec!(150.00)).await;
    let scheduled = h
        .schedule(&auth, &loan, dec!(150.00), start().date() + Duration::days(30))
        .await;

    let revocation = h
        .registry()
        .revoke(auth.id, Some("Closed account".to_string()))
        .await
        .unwrap();

    assert_eq!(revocation.authorization.status, AuthorizationStatus::Revoked);
    assert_eq!(
        revocation.authorization.revocation_reason.as_deref(),
        Some("Closed account")
    );
    assert!(revocation.authorization.revoked_at.is_some());
    assert_eq!(revocation.cancelled_transactions, 2);
    assert_eq!(
        revocation.warning.as_deref(),
        Some(
            "1 active loan(s) will have no payment account after revocation. \
             Consider adding a new account first."
        )
    );
    assert_eq!(h.processor.cancelled(), vec!["ACHQ-1".to_string()]);
    for txn in [&initiated, &scheduled] {
        let stored = h.reload(txn).await;
        assert_eq!(stored.status, TransactionStatus::Cancelled);
        assert_eq!(stored.failure_reason.as_deref(), Some("Authorization revoked"));
    }

    assert!(matches!(
        h.registry().resume(auth.id).await,
        Err(AutopayError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn test_revoke_without_warning_when_another_account_remains() {
    let h = Harness::new();
    h.add_loan("LOAN-1", "CUST-1").await;
    let default = h.link("CUST-1", true).await;
    h.link("CUST-1", false).await;

    let revocation = h.registry().revoke(default.id, None).await.unwrap();

    assert_eq!(revocation.warning, None);
    assert_eq!(revocation.cancelled_transactions, 0);
}

#[tokio::test]
async fn test_new_default_replaces_previous() {
    let h = Harness::new();
    let first = h.link("CUST-1", true).await;
    let second = h.link("CUST-1", true).await;

    let accounts = h
        .registry()
        .list_customer_accounts(&CustomerId::from("CUST-1"))
        .await
        .unwrap();

    let defaults: Vec<_> = accounts.iter().filter(|a| a.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].authorization_id, second.id);
    assert!(accounts.iter().any(|a| a.authorization_id == first.id && !a.is_default));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_set_default_leaves_one_default() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(h.link("CUST-1", false).await.id);
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let registry = h.registry();
        handles.push(tokio::spawn(async move { registry.set_as_default(id).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let accounts = h
        .registry()
        .list_customer_accounts(&CustomerId::from("CUST-1"))
        .await
        .unwrap();
    assert_eq!(accounts.len(), 8);
    assert_eq!(accounts.iter().filter(|a| a.is_default).count(), 1);
}

#[tokio::test]
async fn test_listing_puts_default_first_then_newest() {
    let h = Harness::new();
    let oldest = h.link("CUST-1", false).await;
    h.clock.set(start() + Duration::hours(1));
    let default = h.link("CUST-1", true).await;
    h.clock.set(start() + Duration::hours(2));
    let newest = h.link("CUST-1", false).await;
    h.clock.set(start() + Duration::hours(3));
    let revoked = h.link("CUST-1", false).await;
    h.registry().revoke(revoked.id, None).await.unwrap();

    let order: Vec<_> = h
        .registry()
        .list_customer_accounts(&CustomerId::from("CUST-1"))
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.authorization_id)
        .collect();

    assert_eq!(order, vec![default.id, newest.id, oldest.id]);
}

#[tokio::test]
async fn test_single_loan_binding_is_exclusive() {
    let h = single_loan();
    h.add_loan("LOAN-1", "CUST-1").await;
    let registry = h.registry();

    let bound = registry
        .tokenize_and_link(Harness::link_request("CUST-1", Some("LOAN-1"), true))
        .await
        .unwrap();
    assert_eq!(bound.loan_id, Some(LoanId::from("LOAN-1")));
    assert!(!bound.is_default);

    let effective = registry.effective_account(&LoanId::from("LOAN-1")).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::LoanBinding);

    assert!(matches!(
        registry
            .tokenize_and_link(Harness::link_request("CUST-1", Some("LOAN-1"), false))
            .await,
        Err(AutopayError::Conflict(_))
    ));
    assert!(matches!(
        registry
            .tokenize_and_link(Harness::link_request("CUST-1", None, false))
            .await,
        Err(AutopayError::ValidationError(_))
    ));
    assert!(matches!(
        registry
            .tokenize_and_link(Harness::link_request("CUST-2", Some("LOAN-1"), false))
            .await,
        Err(AutopayError::ValidationError(_))
    ));

    registry.revoke(bound.id, None).await.unwrap();
    registry
        .tokenize_and_link(Harness::link_request("CUST-1", Some("LOAN-1"), false))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_linking_requires_feature_enabled() {
    let h = Harness::with_settings(Default::default());

    let result = h
        .registry()
        .tokenize_and_link(Harness::link_request("CUST-1", None, true))
        .await;

    assert!(matches!(result, Err(AutopayError::Disabled)));
}

#[tokio::test]
async fn test_first_linked_account_becomes_default() {
    let h = Harness::new();
    let loan = h.add_loan("LOAN-1", "CUST-1").await;
    let registry = h.registry();

    let only = h.link("CUST-1", false).await;
    assert!(only.is_default);
    let resolved = registry.resolve_payment_account(&loan.id).await.unwrap();
    assert_eq!(resolved.map(|a| a.id), Some(only.id));

    let second = h.link("CUST-1", false).await;
    assert!(!second.is_default);

    registry.pause(only.id, None).await.unwrap();
    let third = h.link("CUST-1", false).await;
    assert!(third.is_default);
    let effective = registry.effective_account(&loan.id).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::CustomerDefault);
    assert_eq!(effective.authorization.map(|a| a.id), Some(third.id));
}

#[tokio::test]
async fn test_single_loan_mode_has_no_customer_default() {
    let h = single_loan();
    h.add_loan("LOAN-1", "CUST-1").await;
    h.add_loan("LOAN-2", "CUST-1").await;
    let registry = h.registry();
    let first = registry
        .tokenize_and_link(Harness::link_request("CUST-1", Some("LOAN-1"), true))
        .await
        .unwrap();
    let second = registry
        .tokenize_and_link(Harness::link_request("CUST-1", Some("LOAN-2"), true))
        .await
        .unwrap();

    assert!(matches!(
        registry.set_as_default(first.id).await,
        Err(AutopayError::ValidationError(_))
    ));

    // A default flag left over from multi-account data does not leak across loans.
    h.ctx
        .authorizations
        .apply(first.id, AuthorizationChange::SetDefault)
        .await
        .unwrap();
    let effective = registry.effective_account(&LoanId::from("LOAN-2")).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::LoanBinding);
    assert_eq!(effective.authorization.map(|a| a.id), Some(second.id));
}

#[tokio::test]
async fn test_stored_override_replaces_loan_book_override() {
    let h = Harness::new();
    let default = h.link("CUST-1", true).await;
    let dedicated = h.link("CUST-1", false).await;
    let loan_id = LoanId::from("LOAN-1");
    h.loans
        .upsert_loan(Loan {
            id: loan_id.clone(),
            customer_id: CustomerId::from("CUST-1"),
            payment_override: Some(dedicated.id),
        })
        .await;
    let registry = h.registry();

    let effective = registry.effective_account(&loan_id).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::LoanOverride);
    assert_eq!(effective.authorization.map(|a| a.id), Some(dedicated.id));

    registry.set_loan_override(&loan_id, None).await.unwrap();

    let effective = registry.effective_account(&loan_id).await.unwrap();
    assert_eq!(effective.source, ResolutionSource::CustomerDefault);
    assert_eq!(effective.authorization.map(|a| a.id), Some(default.id));
    let stored = h.ctx.overrides.find(&loan_id).await.unwrap().unwrap();
    assert_eq!(stored.authorization_id, None);
    assert_eq!(stored.updated_at, start());
}

#[tokio::test]
async fn test_token_link_records_aggregator_account() {
    let h = Harness::new();
    let loan = h.add_loan("LOAN-1", "CUST-1").await;

    let auth = h
        .registry()
        .link_verified_token(token_link("CUST-1", None))
        .await
        .unwrap();

    assert!(auth.is_active());
    assert!(auth.is_default);
    assert_eq!(auth.token_source, TokenSource::Plaid);
    assert_eq!(auth.verification_status, VerificationStatus::Positive);
    assert_eq!(auth.account_last4, "4321");
    assert_eq!(auth.consent.ip_address.as_deref(), Some("203.0.113.7"));

    let summary = h.registry().authorization_status(&loan.id).await.unwrap();
    assert_eq!(summary.token_source, Some(TokenSource::Plaid));
    assert_eq!(summary.bank_name.as_deref(), Some("Aggregated Credit Union"));

    h.initiated(&auth, &loan, dec!(150.00)).await;
    let submitted = h.processor.submitted();
    assert_eq!(submitted[0].token_source, TokenSource::Plaid);
    assert_eq!(submitted[0].token.expose(), "processor-sandbox-7f3a");
}

#[tokio::test]
async fn test_token_link_requires_feature_enabled() {
    let h = Harness::with_settings(Default::default());

    let result = h
        .registry()
        .link_verified_token(token_link("CUST-1", None))
        .await;

    assert!(matches!(result, Err(AutopayError::Disabled)));
}

#[tokio::test]
async fn test_token_link_single_loan_binding_is_exclusive() {
    let h = single_loan();
    h.add_loan("LOAN-1", "CUST-1").await;
    let registry = h.registry();

    let bound = registry
        .link_verified_token(token_link("CUST-1", Some("LOAN-1")))
        .await
        .unwrap();
    assert_eq!(bound.loan_id, Some(LoanId::from("LOAN-1")));
    assert!(!bound.is_default);

    assert!(matches!(
        registry
            .link_verified_token(token_link("CUST-1", Some("LOAN-1")))
            .await,
        Err(AutopayError::Conflict(_))
    ));
    assert!(matches!(
        registry.link_verified_token(token_link("CUST-1", None)).await,
        Err(AutopayError::ValidationError(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resumes_leave_one_active_per_loan() {
    let h = single_loan();
    let loan = h.add_loan("LOAN-1", "CUST-1").await;
    let registry = h.registry();
    let mut ids = Vec::new();
    for _ in 0..2 {
        let auth = registry
            .tokenize_and_link(Harness::link_request("CUST-1", Some("LOAN-1"), false))
            .await
            .unwrap();
        registry.pause(auth.id, None).await.unwrap();
        ids.push(auth.id);
    }

    let mut handles = Vec::new();
    for id in ids {
        let registry = h.registry();
        handles.push(tokio::spawn(async move { registry.resume(id).await }));
    }
    let mut resumed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => resumed += 1,
            Err(e) => assert!(matches!(e, AutopayError::Conflict(_)), "{e}"),
        }
    }

    assert_eq!(resumed, 1);
    let active = h
        .ctx
        .authorizations
        .for_loan(&loan.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.is_active())
        .count();
    assert_eq!(active, 1);
}
