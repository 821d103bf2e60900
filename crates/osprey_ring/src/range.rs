//! Token algebra: wrapping ranges over the circular token domain and their
//! interval encodings.
//!
//! A [`TokenRange`] is half-open by convention — a node at token `t` owns
//! `(predecessor(t), t]` — but each bound carries its own inclusivity so the
//! four interval encodings of the pending-range map can round-trip through
//! it. A range whose start is not below its end *wraps*: it covers
//! `(start, +inf] ∪ [-inf, end]`.

use std::fmt;

use serde::{Deserialize, Serialize};

use osprey_common::Token;

/// One bound of a [`TokenRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeBound {
    pub token: Token,
    pub inclusive: bool,
}

impl RangeBound {
    pub fn inclusive(token: Token) -> Self {
        Self {
            token,
            inclusive: true,
        }
    }

    pub fn exclusive(token: Token) -> Self {
        Self {
            token,
            inclusive: false,
        }
    }
}

/// A range of tokens with optional bounds.
///
/// A missing start stands for [`Token::MINIMUM`], a missing end for
/// [`Token::MAXIMUM`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Option<RangeBound>,
    pub end: Option<RangeBound>,
}

impl TokenRange {
    pub fn new(start: Option<RangeBound>, end: Option<RangeBound>) -> Self {
        Self { start, end }
    }

    /// The whole ring.
    pub fn full() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// The primary-range shape `(left, right]`.
    pub fn left_open(left: Token, right: Token) -> Self {
        Self {
            start: Some(RangeBound::exclusive(left)),
            end: Some(RangeBound::inclusive(right)),
        }
    }

    /// The token probed when this range stands for "everything up to and
    /// including my end": the end bound, or the maximum sentinel when the
    /// range is unbounded above.
    pub fn end_token(&self) -> Token {
        self.end.map(|b| b.token).unwrap_or(Token::MAXIMUM)
    }

    /// Whether the range crosses the minimum sentinel.
    ///
    /// Only a range with both bounds present can wrap. Equal bounds wrap
    /// unless both are inclusive (the single-point range `[t, t]`).
    pub fn is_wrapping(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => {
                s.token > e.token
                    || (s.token == e.token && !(s.inclusive && e.inclusive))
            }
            _ => false,
        }
    }

    /// Split a wrapping range at the minimum sentinel into its at most two
    /// non-wrapping parts; a non-wrapping range is returned unchanged.
    pub fn unwrap_at_minimum(&self) -> Vec<TokenRange> {
        if !self.is_wrapping() {
            return vec![self.clone()];
        }
        vec![
            TokenRange {
                start: self.start,
                end: None,
            },
            TokenRange {
                start: None,
                end: self.end,
            },
        ]
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            Some(b) if b.inclusive => write!(f, "[{}", b.token)?,
            Some(b) => write!(f, "({}", b.token)?,
            None => write!(f, "(-inf")?,
        }
        write!(f, ", ")?;
        match &self.end {
            Some(b) if b.inclusive => write!(f, "{}]", b.token),
            Some(b) => write!(f, "{})", b.token),
            None => write!(f, "+inf)"),
        }
    }
}

/// Inclusivity of a [`TokenInterval`]'s two bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntervalBounds {
    /// `(lower, upper)`
    Open,
    /// `(lower, upper]`
    LeftOpen,
    /// `[lower, upper)`
    RightOpen,
    /// `[lower, upper]`
    Closed,
}

/// The closed/open interval encoding of a [`TokenRange`], with the
/// sentinels substituted for missing bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenInterval {
    pub lower: Token,
    pub upper: Token,
    pub bounds: IntervalBounds,
}

impl TokenInterval {
    pub fn contains(&self, t: Token) -> bool {
        let above_lower = match self.bounds {
            IntervalBounds::RightOpen | IntervalBounds::Closed => t >= self.lower,
            IntervalBounds::Open | IntervalBounds::LeftOpen => t > self.lower,
        };
        let below_upper = match self.bounds {
            IntervalBounds::LeftOpen | IntervalBounds::Closed => t <= self.upper,
            IntervalBounds::Open | IntervalBounds::RightOpen => t < self.upper,
        };
        above_lower && below_upper
    }
}

/// Encode a non-wrapping range as an interval; missing bounds become the
/// sentinels, and a missing bound counts as exclusive.
pub fn range_to_interval(r: &TokenRange) -> TokenInterval {
    let (lower, start_inclusive) = match &r.start {
        Some(b) => (b.token, b.inclusive),
        None => (Token::MINIMUM, false),
    };
    let (upper, end_inclusive) = match &r.end {
        Some(b) => (b.token, b.inclusive),
        None => (Token::MAXIMUM, false),
    };
    let bounds = match (start_inclusive, end_inclusive) {
        (false, false) => IntervalBounds::Open,
        (false, true) => IntervalBounds::LeftOpen,
        (true, false) => IntervalBounds::RightOpen,
        (true, true) => IntervalBounds::Closed,
    };
    TokenInterval {
        lower,
        upper,
        bounds,
    }
}

/// Decode an interval back into a range with both bounds present.
pub fn interval_to_range(i: &TokenInterval) -> TokenRange {
    let (start_inclusive, end_inclusive) = match i.bounds {
        IntervalBounds::Open => (false, false),
        IntervalBounds::LeftOpen => (false, true),
        IntervalBounds::RightOpen => (true, false),
        IntervalBounds::Closed => (true, true),
    };
    TokenRange {
        start: Some(RangeBound {
            token: i.lower,
            inclusive: start_inclusive,
        }),
        end: Some(RangeBound {
            token: i.upper,
            inclusive: end_inclusive,
        }),
    }
}

/// Lazy walk of the sorted token vector: every token exactly once, starting
/// at the first token ≥ `start` and wrapping through the end back to the
/// beginning.
///
/// Restartable by reconstructing from the same starting token.
#[derive(Debug, Clone)]
pub struct RingRange<'a> {
    tokens: &'a [Token],
    cursor: usize,
    remaining: usize,
}

impl<'a> RingRange<'a> {
    pub(crate) fn new(tokens: &'a [Token], first_index: usize) -> Self {
        Self {
            tokens,
            cursor: first_index,
            remaining: tokens.len(),
        }
    }
}

impl Iterator for RingRange<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if self.remaining == 0 {
            return None;
        }
        let t = self.tokens[self.cursor];
        self.cursor += 1;
        if self.cursor == self.tokens.len() {
            self.cursor = 0;
        }
        self.remaining -= 1;
        Some(t)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for RingRange<'_> {}
