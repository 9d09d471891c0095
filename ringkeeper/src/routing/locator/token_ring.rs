use crate::routing::Token;

/// A token ring is a continuous hash ring: keys are hashed onto the ring
/// and ownership is found by walking the ring in the direction of increasing tokens.
///
/// Each member has a token which defines its position. After the maximum token
/// the ring wraps around to the lowest one. `TokenRing` makes it cheap to
/// traverse the ring starting at any given token.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) const fn new_empty() -> TokenRing<ElemT> {
        Self { ring: Vec::new() }
    }

    /// Builds a ring from unordered `(token, element)` pairs.
    ///
    /// The sort is stable, so members sharing a token keep their input order.
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Index of the first member whose token is not lower than `token`, wrapping to 0.
    fn start_index(&self, token: Token) -> usize {
        let index = match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(exact_match_index) => exact_match_index,
            Err(first_greater_index) => first_greater_index,
        };
        if index == self.ring.len() {
            0
        } else {
            index
        }
    }

    /// Iterates over the ring members starting at the given token.
    ///
    /// After reaching the maximum token it wraps around and continues from the lowest one.
    /// Each member is visited exactly once.
    pub fn ring_range_full(&self, token: Token) -> impl Iterator<Item = &(Token, ElemT)> {
        let start = self.start_index(token);

        self.ring[start..]
            .iter()
            .chain(self.ring[..start].iter())
    }

    /// Like [`TokenRing::ring_range_full`], yielding only the elements.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        self.ring_range_full(token).map(|(_t, e)| e)
    }

    /// Returns the member owning `token`, that is the first one encountered walking from it.
    pub fn get_elem_for_token(&self, token: Token) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    /// Get the total number of members in the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` if the token ring contains no elements.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Builds a ring with the same tokens, mapping every element.
    pub(crate) fn map<U>(&self, mut f: impl FnMut(Token, &ElemT) -> U) -> TokenRing<U> {
        TokenRing {
            ring: self.ring.iter().map(|(t, e)| (*t, f(*t, e))).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TokenRing;
    use crate::routing::Token;

    #[test]
    fn test_token_ring() {
        let ring_data = [
            (Token::new(-30), -3),
            (Token::new(-20), -2),
            (Token::new(-10), -1),
            (Token::new(0), 0),
            (Token::new(10), 1),
            (Token::new(20), 2),
            (Token::new(30), 3),
        ];

        let ring: TokenRing<i32> = TokenRing::new(ring_data.into_iter());

        let check = |token: i64, expected: [i32; 7]| {
            assert_eq!(
                ring.ring_range(Token::new(token))
                    .cloned()
                    .collect::<Vec<i32>>(),
                expected,
                "walking from {token}"
            );
        };

        check(-35, [-3, -2, -1, 0, 1, 2, 3]);
        check(-30, [-3, -2, -1, 0, 1, 2, 3]);
        check(-25, [-2, -1, 0, 1, 2, 3, -3]);
        check(-20, [-2, -1, 0, 1, 2, 3, -3]);
        check(-5, [0, 1, 2, 3, -3, -2, -1]);
        check(5, [1, 2, 3, -3, -2, -1, 0]);
        check(30, [3, -3, -2, -1, 0, 1, 2]);
        check(35, [-3, -2, -1, 0, 1, 2, 3]);

        assert_eq!(ring.get_elem_for_token(Token::new(11)), Some(&2));
        assert_eq!(ring.get_elem_for_token(Token::new(i64::MAX)), Some(&-3));
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let ring: TokenRing<u8> = TokenRing::new_empty();
        assert!(ring.is_empty());
        assert_eq!(ring.ring_range(Token::new(0)).count(), 0);
        assert_eq!(ring.get_elem_for_token(Token::new(0)), None);
    }
}
