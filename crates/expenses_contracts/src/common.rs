#![forbid(unsafe_code)]

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReasonCodeId(pub u32);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContractViolation {
    #[error("{field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
    #[error("{field}: length {got} outside {min}..={max}")]
    InvalidLength {
        field: &'static str,
        min: usize,
        max: usize,
        got: usize,
    },
    #[error("{field}: required")]
    Missing { field: &'static str },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ContractViolation>;
}

pub(crate) fn validate_len(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ContractViolation> {
    let got = value.chars().count();
    if got < min || got > max {
        return Err(ContractViolation::InvalidLength {
            field,
            min,
            max,
            got,
        });
    }
    Ok(())
}
