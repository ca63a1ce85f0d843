use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;

use data_encoding::BASE64URL_NOPAD;
use mongodb::bson::Bson;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bytes of randomness in a token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// The opaque credential carried by an invitation.
///
/// Tokens are drawn from a CSPRNG and encoded as unpadded URL-safe base64, so
/// they can be embedded in a voting link as-is. They carry no voter data.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Generate a fresh random token.
    pub fn random() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(BASE64URL_NOPAD.encode(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for Token {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Token {
    fn from(token: String) -> Self {
        Self(token)
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl From<Token> for Bson {
    fn from(token: Token) -> Self {
        Bson::String(token.0)
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tokens are credentials; keep them out of debug output and logs.
impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.0.chars().take(4).collect();
        write!(f, "Token({prefix}…)")
    }
}
