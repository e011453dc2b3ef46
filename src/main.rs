use ach_autopay::application::AutopayContext;
use ach_autopay::application::reconciliation::Reconciler;
use ach_autopay::application::registry::{
    AccountListing, AuthorizationRegistry, LinkRequest, VerifiedTokenLink,
};
use ach_autopay::application::scheduler::{Job, SchedulerDriver};
use ach_autopay::domain::authorization::{AccountType, CheckType, ProcessorToken};
use ach_autopay::domain::ids::{AuthorizationId, CustomerId, LoanId};
use ach_autopay::domain::ports::{
    AuthorizationStoreRef, PaymentOverrideStoreRef, SettlementStoreRef, TransactionStoreRef,
};
use ach_autopay::error::AutopayError;
use ach_autopay::infrastructure::achq::AchqClient;
use ach_autopay::infrastructure::clock::SystemClock;
use ach_autopay::infrastructure::in_memory::{
    InMemoryAuthorizationStore, InMemoryLoanBook, InMemoryPaymentOverrideStore,
    InMemorySettlementStore, InMemoryTransactionStore,
};
use ach_autopay::infrastructure::notifier::TracingNotifier;
use ach_autopay::interfaces::csv::loan_reader::{LoanReader, load_loan_book};
use ach_autopay::interfaces::http;
use ach_autopay::settings::Settings;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use serde_json::{Value, json};
use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML settings file; `ACH_AUTOPAY__*` environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Loan book snapshot (`loan,customer,due_date,amount,payment_account`)
    #[arg(long, global = true)]
    loans: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Verify a bank account with the processor and record the customer's mandate
    LinkAccount {
        #[arg(long)]
        customer: CustomerId,
        /// Loan to bind the account to (single-loan mode)
        #[arg(long)]
        loan: Option<LoanId>,
        #[arg(long)]
        routing_number: String,
        #[arg(long)]
        account_number: String,
        #[arg(long, default_value = "checking")]
        account_type: AccountType,
        /// Name on the bank account
        #[arg(long)]
        name: String,
        #[arg(long)]
        check_type: Option<CheckType>,
        /// Keep the current default account (multi-account mode)
        #[arg(long)]
        no_default: bool,
        /// Address the customer consented from
        #[arg(long)]
        ip: Option<String>,
    },
    /// Record an account the bank-data aggregator already verified, by the
    /// processor token it issued
    LinkToken {
        #[arg(long)]
        customer: CustomerId,
        #[arg(long)]
        loan: Option<LoanId>,
        #[arg(long)]
        token: String,
        #[arg(long, default_value = "checking")]
        account_type: AccountType,
        #[arg(long)]
        bank_name: String,
        #[arg(long)]
        last4: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        no_default: bool,
        #[arg(long)]
        ip: Option<String>,
    },
    /// Show the payment account a loan's debits go to
    AccountStatus {
        #[arg(long)]
        loan: LoanId,
    },
    Pause {
        authorization: AuthorizationId,
        #[arg(long)]
        reason: Option<String>,
    },
    Resume {
        authorization: AuthorizationId,
    },
    /// Revoke a mandate and cancel its scheduled debits
    Revoke {
        authorization: AuthorizationId,
        #[arg(long)]
        reason: Option<String>,
    },
    ListAccounts {
        #[arg(long)]
        customer: CustomerId,
    },
    SetDefault {
        authorization: AuthorizationId,
    },
    /// Point a loan at one account, or back at the customer default when omitted
    SetLoanAccount {
        #[arg(long)]
        loan: LoanId,
        #[arg(long)]
        authorization: Option<AuthorizationId>,
    },
    /// The loan's effective account together with every account it could use
    LoanAccountInfo {
        #[arg(long)]
        loan: LoanId,
    },
    /// Run one scheduled job now
    RunJob { job: Job },
    /// Feed a saved webhook body through reconciliation
    Webhook { file: PathBuf },
    /// Serve the webhook endpoint and run the jobs on their schedule
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ach_autopay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).into_diagnostic()?;
    let ctx = build_context(&cli, settings).await?;

    match cli.command {
        Command::RunJob { job } => {
            let report = SchedulerDriver::new(ctx).run(job).await.into_diagnostic()?;
            print_json(&json!({ "job": job.name(), "report": report }))?;
        }
        Command::Webhook { file } => {
            let body = std::fs::read_to_string(file).into_diagnostic()?;
            let ack = Reconciler::new(ctx).handle_webhook(&body).await;
            print_json(&serde_json::to_value(ack).into_diagnostic()?)?;
        }
        Command::Serve { addr } => {
            let scheduler = SchedulerDriver::new(ctx.clone());
            tokio::spawn(async move { scheduler.run_forever().await });

            let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
            info!(%addr, "Webhook endpoint listening");
            axum::serve(listener, http::router(Reconciler::new(ctx)))
                .await
                .into_diagnostic()?;
        }
        command => {
            let registry = AuthorizationRegistry::new(ctx.clone());
            return match execute(&ctx, &registry, command).await {
                Ok(body) => {
                    print_json(&body)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_json(&json!({ "success": false, "message": e.to_string() }))?;
                    Ok(ExitCode::FAILURE)
                }
            };
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Runs one account operation and renders its `{success, message, ...}` body.
async fn execute(
    ctx: &AutopayContext,
    registry: &AuthorizationRegistry,
    command: Command,
) -> ach_autopay::error::Result<Value> {
    let body = match command {
        Command::LinkAccount {
            customer,
            loan,
            routing_number,
            account_number,
            account_type,
            name,
            check_type,
            no_default,
            ip,
        } => {
            let auth = registry
                .tokenize_and_link(LinkRequest {
                    customer_id: customer,
                    loan_id: loan,
                    routing_number,
                    account_number,
                    account_type,
                    customer_name: name,
                    check_type,
                    is_default: !no_default,
                    ip_address: ip,
                })
                .await?;
            success(
                "Bank account linked successfully",
                json!({ "account": AccountListing::from(&auth) }),
            )
        }
        Command::LinkToken {
            customer,
            loan,
            token,
            account_type,
            bank_name,
            last4,
            name,
            no_default,
            ip,
        } => {
            let auth = registry
                .link_verified_token(VerifiedTokenLink {
                    customer_id: customer,
                    loan_id: loan,
                    token: ProcessorToken::new(token),
                    account_type,
                    bank_name,
                    account_last4: last4,
                    customer_name: name,
                    is_default: !no_default,
                    ip_address: ip,
                })
                .await?;
            success(
                "Bank account linked successfully",
                json!({ "account": AccountListing::from(&auth) }),
            )
        }
        Command::AccountStatus { loan } => {
            let summary = registry.authorization_status(&loan).await?;
            success("Payment account status", serde_json::to_value(summary)?)
        }
        Command::Pause {
            authorization,
            reason,
        } => {
            let auth = registry.pause(authorization, reason).await?;
            success(
                "Bank account paused",
                json!({ "account": AccountListing::from(&auth) }),
            )
        }
        Command::Resume { authorization } => {
            let auth = registry.resume(authorization).await?;
            success(
                "Bank account resumed",
                json!({ "account": AccountListing::from(&auth) }),
            )
        }
        Command::Revoke {
            authorization,
            reason,
        } => {
            let revocation = registry.revoke(authorization, reason).await?;
            success(
                "Bank account revoked",
                json!({
                    "account": AccountListing::from(&revocation.authorization),
                    "cancelled_transactions": revocation.cancelled_transactions,
                    "warning": revocation.warning,
                }),
            )
        }
        Command::ListAccounts { customer } => {
            let accounts = registry.list_customer_accounts(&customer).await?;
            success(
                &format!("{} account(s) found", accounts.len()),
                json!({ "accounts": accounts }),
            )
        }
        Command::SetDefault { authorization } => {
            let auth = registry.set_as_default(authorization).await?;
            success(
                "Default bank account updated",
                json!({ "account": AccountListing::from(&auth) }),
            )
        }
        Command::SetLoanAccount {
            loan,
            authorization,
        } => {
            registry.set_loan_override(&loan, authorization).await?;
            let message = match authorization {
                Some(_) => "Loan payment account updated",
                None => "Loan now uses the customer default account",
            };
            success(message, serde_json::to_value(registry.authorization_status(&loan).await?)?)
        }
        Command::LoanAccountInfo { loan } => {
            let record = ctx
                .loans
                .get(&loan)
                .await?
                .ok_or_else(|| AutopayError::NotFound(format!("Loan {loan}")))?;
            let current = registry.authorization_status(&loan).await?;
            let accounts = registry.list_customer_accounts(&record.customer_id).await?;
            success(
                "Loan payment account",
                json!({ "loan_id": loan, "current": current, "accounts": accounts }),
            )
        }
        Command::RunJob { .. } | Command::Webhook { .. } | Command::Serve { .. } => {
            return Err(AutopayError::ValidationError(
                "Not an account operation".to_string(),
            ));
        }
    };
    Ok(body)
}

fn success(message: &str, details: Value) -> Value {
    let mut body = json!({ "success": true, "message": message });
    if let (Some(body), Value::Object(details)) = (body.as_object_mut(), details) {
        body.extend(details);
    }
    body
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

async fn build_context(cli: &Cli, settings: Settings) -> Result<AutopayContext> {
    let (authorizations, transactions, settlements, overrides) =
        open_stores(cli.db_path.as_deref())?;

    let loans = InMemoryLoanBook::new();
    if let Some(path) = &cli.loans {
        let file = File::open(path).into_diagnostic()?;
        let loaded = load_loan_book(LoanReader::new(file), &loans)
            .await
            .into_diagnostic()?;
        info!(rows = loaded, path = %path.display(), "Loan book loaded");
    }

    let processor = AchqClient::new(settings.processor.clone()).into_diagnostic()?;

    Ok(AutopayContext {
        authorizations,
        transactions,
        settlements,
        loans: Arc::new(loans),
        overrides,
        processor: Arc::new(processor),
        notifier: Arc::new(TracingNotifier),
        clock: Arc::new(SystemClock),
        settings: Arc::new(settings),
    })
}

type Stores = (
    AuthorizationStoreRef,
    TransactionStoreRef,
    SettlementStoreRef,
    PaymentOverrideStoreRef,
);

fn in_memory_stores() -> Stores {
    (
        Arc::new(InMemoryAuthorizationStore::new()),
        Arc::new(InMemoryTransactionStore::new()),
        Arc::new(InMemorySettlementStore::new()),
        Arc::new(InMemoryPaymentOverrideStore::new()),
    )
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    use ach_autopay::infrastructure::rocksdb::RocksDBStore;

    let Some(db_path) = db_path else {
        return Ok(in_memory_stores());
    };
    let store = RocksDBStore::open(db_path).into_diagnostic()?;
    info!(path = %db_path.display(), "Using RocksDB storage");
    let authorizations: AuthorizationStoreRef = Arc::new(store.clone());
    let transactions: TransactionStoreRef = Arc::new(store.clone());
    let settlements: SettlementStoreRef = Arc::new(store.clone());
    let overrides: PaymentOverrideStoreRef = Arc::new(store);
    Ok((authorizations, transactions, settlements, overrides))
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<&Path>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}
