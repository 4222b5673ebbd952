use crate::prelude::{RideError, RideResult};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CODE_LENGTH: usize = 6;

/// Short numeric code keying one pairing session on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCode(String);

impl SessionCode {
    /// Parses manually typed input; spaces and dashes are ignored.
    pub fn parse(input: &str) -> RideResult<Self> {
        let digits: String = input
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        if digits.len() != CODE_LENGTH || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(RideError::InvalidInput(format!(
                "pairing code must be {} digits, got {:?}",
                CODE_LENGTH, input
            )));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Payload encoded into the scannable code shown next to the digits.
    pub fn join_link(&self, base_url: &str) -> String {
        format!("{}/pair?code={}", base_url.trim_end_matches('/'), self.0)
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out fresh codes; never repeats the code it issued last.
pub struct CodeAllocator {
    rng: StdRng,
    last: Option<SessionCode>,
}

impl CodeAllocator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            last: None,
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            last: None,
        }
    }

    pub fn allocate(&mut self) -> SessionCode {
        loop {
            let value: u32 = self.rng.gen_range(0..1_000_000);
            let code = SessionCode(format!("{:06}", value));
            if self.last.as_ref() != Some(&code) {
                self.last = Some(code.clone());
                return code;
            }
        }
    }
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}
