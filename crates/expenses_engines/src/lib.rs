#![forbid(unsafe_code)]

pub mod chunk;
pub mod extraction;
pub mod normalize;
pub mod password;
pub mod token_mint;
