#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::SubjectId;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineItem {
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub category: String,
}

/// Structured receipt produced by the response normalizer. Every field other than
/// `total_amount`/`currency` is optional and defaults to empty or zero.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ExtractedTransaction {
    pub transaction_id: String,
    pub merchant_name: String,
    pub transaction_datetime: Option<DateTime<Utc>>,
    pub payment_method: String,
    pub total_amount: Option<Decimal>,
    pub currency: String,
    pub line_items: Vec<LineItem>,
    pub spending_category: String,
}

impl ExtractedTransaction {
    /// `total_amount` and `currency` gate persistence.
    pub fn persistable_total(&self) -> Result<(Decimal, &str), ContractViolation> {
        let amount = self.total_amount.ok_or(ContractViolation::Missing {
            field: "extracted_transaction.total_amount",
        })?;
        if self.currency.trim().is_empty() {
            return Err(ContractViolation::Missing {
                field: "extracted_transaction.currency",
            });
        }
        Ok((amount, self.currency.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpenseRowId(Uuid);

impl ExpenseRowId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ExpenseRowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One row of `expense_data`. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpenseRow {
    pub row_id: ExpenseRowId,
    pub subject_id: SubjectId,
    pub transaction_datetime: Option<DateTime<Utc>>,
    pub merchant_name: String,
    pub payment_method: String,
    pub total_amount: Decimal,
    pub currency: String,
    pub spending_category: String,
}

impl ExpenseRow {
    pub fn from_transaction(
        row_id: ExpenseRowId,
        subject_id: SubjectId,
        tx: &ExtractedTransaction,
    ) -> Result<Self, ContractViolation> {
        let (total_amount, currency) = tx.persistable_total()?;
        let row = Self {
            row_id,
            subject_id,
            transaction_datetime: tx.transaction_datetime,
            merchant_name: tx.merchant_name.clone(),
            payment_method: tx.payment_method.clone(),
            total_amount,
            currency: currency.to_string(),
            spending_category: tx.spending_category.clone(),
        };
        row.validate()?;
        Ok(row)
    }
}

impl Validate for ExpenseRow {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.currency.is_empty() {
            return Err(ContractViolation::Missing {
                field: "expense_row.currency",
            });
        }
        if self.currency.chars().count() > 16 {
            return Err(ContractViolation::InvalidLength {
                field: "expense_row.currency",
                min: 1,
                max: 16,
                got: self.currency.chars().count(),
            });
        }
        Ok(())
    }
}
