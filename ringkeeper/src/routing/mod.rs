//! Entities that let requests be routed to the nodes owning their data:
//! - token representation,
//! - partitioners, which compute a token from a partition key,
//! - the replica locator, which maps tokens to replica sets per keyspace.

pub mod locator;
pub mod partitioner;

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Token is a result of computing a hash of a partition key.
///
/// It is basically an i64 with one caveat: i64::MIN is not
/// a valid token. It is used to represent infinity.
/// For this reason tokens are normalized - i64::MIN
/// is replaced with i64::MAX.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    /// Creates a new token with given value, normalizing the value if necessary
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl FromStr for Token {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Token::new)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::Token;

    #[test]
    fn min_value_is_normalized() {
        assert_eq!(Token::new(i64::MIN).value(), i64::MAX);
        assert_eq!("-9223372036854775808".parse::<Token>().unwrap(), Token::new(i64::MAX));
        assert_eq!(" 42 ".parse::<Token>().unwrap().value(), 42);
        assert!("forty-two".parse::<Token>().is_err());
    }
}
