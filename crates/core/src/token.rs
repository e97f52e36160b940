use std::fmt;

pub const TRADER_TOKEN_MIN_LEN: usize = 15;
pub const TRADER_TOKEN_MAX_LEN: usize = 32;

/// Reasons a trader token is rejected before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Please enter a valid trader token")]
    Empty,
    #[error("Trader token must be {min}-{max} characters (got {len})")]
    Length { len: usize, min: usize, max: usize },
    #[error("Trader token contains an invalid character: {0:?}")]
    InvalidCharacter(char),
}

/// The credential identifying which trader's activity to mirror.
///
/// Only letters, digits, underscores, whitespace and hyphens are accepted, 15 to
/// 32 characters long. Surrounding whitespace is stripped from the value sent
/// on the wire.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TraderToken(String);

impl TraderToken {
    pub fn parse(input: &str) -> Result<Self, TokenError> {
        if input.trim().is_empty() {
            return Err(TokenError::Empty);
        }

        let len = input.chars().count();
        if !(TRADER_TOKEN_MIN_LEN..=TRADER_TOKEN_MAX_LEN).contains(&len) {
            return Err(TokenError::Length {
                len,
                min: TRADER_TOKEN_MIN_LEN,
                max: TRADER_TOKEN_MAX_LEN,
            });
        }

        if let Some(bad) = input.chars().find(|c| !is_token_char(*c)) {
            return Err(TokenError::InvalidCharacter(bad));
        }

        Ok(Self(input.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// `[\w\s-]`: ASCII word characters, whitespace, hyphen.
fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c.is_whitespace()
}

impl std::str::FromStr for TraderToken {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Never print the full credential.
impl fmt::Debug for TraderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraderToken({})", self.redacted())
    }
}

impl TraderToken {
    /// First four characters followed by an ellipsis, for logs.
    pub fn redacted(&self) -> String {
        let head: String = self.0.chars().take(4).collect();
        format!("{head}…")
    }
}
