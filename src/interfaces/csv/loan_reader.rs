use crate::domain::ids::{AuthorizationId, CustomerId, LoanId};
use crate::domain::loan::{DuePayment, Loan};
use crate::error::{AutopayError, Result};
use crate::infrastructure::in_memory::InMemoryLoanBook;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One line of a loan book snapshot: `loan,customer,due_date,amount,payment_account`.
///
/// A loan may span several lines, one per instalment. The last non-empty
/// `payment_account` seen for a loan becomes its override.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoanRow {
    pub loan: LoanId,
    pub customer: CustomerId,
    pub due_date: Option<NaiveDate>,
    pub amount: Option<Decimal>,
    pub payment_account: Option<AuthorizationId>,
}

/// Reads loan book rows from a CSV source.
pub struct LoanReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> LoanReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    pub fn rows(self) -> impl Iterator<Item = Result<LoanRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(AutopayError::from))
    }
}

/// Loads every row into `book`. Returns the number of rows loaded.
pub async fn load_loan_book<R: Read>(reader: LoanReader<R>, book: &InMemoryLoanBook) -> Result<usize> {
    let mut loaded = 0;
    for row in reader.rows() {
        let row = row?;
        let existing = crate::domain::ports::LoanBook::get(book, &row.loan).await?;
        let payment_override = row
            .payment_account
            .or(existing.and_then(|loan| loan.payment_override));
        book.upsert_loan(Loan {
            id: row.loan.clone(),
            customer_id: row.customer,
            payment_override,
        })
        .await;
        if let (Some(due_date), Some(amount)) = (row.due_date, row.amount) {
            book.add_instalment(&row.loan, DuePayment { due_date, amount })
                .await?;
        }
        loaded += 1;
    }
    Ok(loaded)
}
