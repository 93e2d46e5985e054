#![forbid(unsafe_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use expenses_contracts::auth::TokenValue;
use expenses_contracts::ContractViolation;
use rand::rngs::OsRng;
use rand::RngCore;

pub const TOKEN_ENTROPY_BYTES: usize = 32;

/// Fresh opaque bearer value: 32 OS-random bytes, URL-safe base64 without padding.
pub fn mint_token_value() -> Result<TokenValue, ContractViolation> {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    TokenValue::new(URL_SAFE_NO_PAD.encode(bytes))
}
