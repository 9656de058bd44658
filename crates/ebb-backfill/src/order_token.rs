//! Order tokens: per-stream sequence markers.
//!
//! Every stream of ordered messages (one backfill session, or one node's
//! live-write stream) draws tokens from its own *domain*. Within a domain
//! sequences start at 1 and increase by exactly one; receivers check this
//! with [`validate`]. Tokens from different domains are never compared:
//! cross-stream ordering comes from the version map, not from tokens.

use std::collections::HashMap;
use std::fmt::Display;

use ebb_types::NodeId;
use serde::{Deserialize, Serialize};

/// Identifier of one token domain.
///
/// Scoped by the issuing node so domains allocated on different nodes never
/// collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenDomainId {
    pub node: NodeId,
    pub counter: u64,
}

impl Display for TokenDomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "d{}.{}", self.node.as_u64(), self.counter)
    }
}

/// A position in one domain's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderToken {
    pub domain: TokenDomainId,
    pub sequence: u64,
}

impl Display for OrderToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.domain, self.sequence)
    }
}

/// A token arrived out of order: wrong domain, a gap, or a repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of order token {incoming}: expected {expected_domain}#{expected_sequence}")]
pub struct OutOfOrder {
    pub expected_domain: TokenDomainId,
    pub expected_sequence: u64,
    pub incoming: OrderToken,
}

/// Issues tokens for the domains owned by one node.
#[derive(Debug, Clone)]
pub struct OrderTokenSequencer {
    node: NodeId,
    next_domain: u64,
    last_issued: HashMap<TokenDomainId, u64>,
}

impl OrderTokenSequencer {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next_domain: 0,
            last_issued: HashMap::new(),
        }
    }

    /// Allocates a fresh domain. Domain ids are never reused.
    pub fn new_domain(&mut self) -> TokenDomainId {
        let domain = TokenDomainId {
            node: self.node,
            counter: self.next_domain,
        };
        self.next_domain += 1;
        self.last_issued.insert(domain, 0);
        domain
    }

    /// Issues the next token for `domain`.
    pub fn next(&mut self, domain: TokenDomainId) -> OrderToken {
        debug_assert_eq!(domain.node, self.node, "domain owned by another node");
        let last = self.last_issued.entry(domain).or_insert(0);
        *last += 1;
        OrderToken {
            domain,
            sequence: *last,
        }
    }

    /// Releases bookkeeping for a finished domain. The id stays retired.
    pub fn retire(&mut self, domain: TokenDomainId) {
        self.last_issued.remove(&domain);
    }
}

/// Checks that `incoming` is the token immediately after `last_seen` in
/// `expected_domain`.
pub fn validate(
    expected_domain: TokenDomainId,
    last_seen: u64,
    incoming: OrderToken,
) -> Result<(), OutOfOrder> {
    let expected_sequence = last_seen + 1;
    if incoming.domain != expected_domain || incoming.sequence != expected_sequence {
        return Err(OutOfOrder {
            expected_domain,
            expected_sequence,
            incoming,
        });
    }
    Ok(())
}

/// Receiver-side state for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenValidator {
    domain: TokenDomainId,
    last_seen: u64,
}

impl TokenValidator {
    pub fn new(domain: TokenDomainId) -> Self {
        Self {
            domain,
            last_seen: 0,
        }
    }

    pub fn domain(&self) -> TokenDomainId {
        self.domain
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Validates `incoming` and advances on success. A rejected token leaves
    /// the validator unchanged.
    pub fn accept(&mut self, incoming: OrderToken) -> Result<(), OutOfOrder> {
        validate(self.domain, self.last_seen, incoming)?;
        self.last_seen = incoming.sequence;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sequencer() -> OrderTokenSequencer {
        OrderTokenSequencer::new(NodeId::new(1))
    }

    fn token(domain: TokenDomainId, sequence: u64) -> OrderToken {
        OrderToken { domain, sequence }
    }

    #[test]
    fn domains_are_never_reused() {
        let mut seq = sequencer();
        let a = seq.new_domain();
        seq.retire(a);
        let b = seq.new_domain();
        assert_ne!(a, b);
    }

    #[test]
    fn tokens_increase_by_one_per_domain() {
        let mut seq = sequencer();
        let a = seq.new_domain();
        let b = seq.new_domain();
        assert_eq!(seq.next(a).sequence, 1);
        assert_eq!(seq.next(a).sequence, 2);
        assert_eq!(seq.next(b).sequence, 1);
        assert_eq!(seq.next(a).sequence, 3);
    }

    #[test]
    fn gap_is_rejected() {
        let mut seq = sequencer();
        let d = seq.new_domain();
        let mut validator = TokenValidator::new(d);
        validator.accept(token(d, 1)).unwrap();
        validator.accept(token(d, 2)).unwrap();
        let err = validator.accept(token(d, 4)).unwrap_err();
        assert_eq!(err.expected_sequence, 3);
        assert_eq!(validator.last_seen(), 2);
    }

    #[test]
    fn repeat_is_rejected() {
        let mut seq = sequencer();
        let d = seq.new_domain();
        let mut validator = TokenValidator::new(d);
        validator.accept(token(d, 1)).unwrap();
        validator.accept(token(d, 2)).unwrap();
        assert!(validator.accept(token(d, 2)).is_err());
    }

    #[test]
    fn foreign_domain_is_rejected() {
        let mut seq = sequencer();
        let d = seq.new_domain();
        let other = seq.new_domain();
        assert!(validate(d, 0, token(other, 1)).is_err());
    }

    proptest! {
        #[test]
        fn validator_accepts_exactly_the_issued_order(len in 1usize..50) {
            let mut seq = sequencer();
            let d = seq.new_domain();
            let mut validator = TokenValidator::new(d);
            for _ in 0..len {
                prop_assert!(validator.accept(seq.next(d)).is_ok());
            }
        }

        #[test]
        fn any_other_sequence_is_rejected(last_seen in 0u64..1000, incoming in 0u64..1000) {
            let mut seq = sequencer();
            let d = seq.new_domain();
            let result = validate(d, last_seen, token(d, incoming));
            prop_assert_eq!(result.is_ok(), incoming == last_seen + 1);
        }
    }
}
