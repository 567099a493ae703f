use crate::primitives::{EthBlock, EthHeader};
use alloy_primitives::{U256, keccak256};
use alloy_rlp::Encodable;
use thiserror::Error;

pub const MIN_DIFFICULTY: u64 = 131_072;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("ommers hash does not match header")]
    OmmersHashMismatch,
    #[error("transactions root does not match header")]
    TransactionsRootMismatch,
    #[error("transaction {0} has an invalid signature")]
    InvalidTransactionSignature(usize),
}

/// Stateless integrity checks on a reassembled block: ommers hash,
/// transactions-trie root, and every transaction signature. No balance or
/// execution checks are performed.
pub fn validate_block(block: &EthBlock) -> Result<(), BlockError> {
    let ommers_hash = keccak256(alloy_rlp::encode(&block.ommers));
    if ommers_hash != block.header.ommers_hash {
        return Err(BlockError::OmmersHashMismatch);
    }

    let transactions_root =
        alloy_consensus::proofs::ordered_trie_root_with_encoder(&block.transactions, |tx, buf| {
            tx.encode(buf)
        });
    if transactions_root != block.header.transactions_root {
        return Err(BlockError::TransactionsRootMismatch);
    }

    for (index, tx) in block.transactions.iter().enumerate() {
        tx.recover_sender()
            .map_err(|_| BlockError::InvalidTransactionSignature(index))?;
    }

    Ok(())
}

/// Homestead difficulty adjustment, including the ice-age component.
pub fn expected_difficulty(parent: &EthHeader, number: u64, timestamp: u64) -> U256 {
    let adjustment = parent.difficulty / U256::from(2048u64);
    let elapsed = timestamp.saturating_sub(parent.timestamp);
    let sigma = (1i64 - (elapsed / 10) as i64).max(-99);

    let mut difficulty = if sigma >= 0 {
        parent.difficulty + adjustment * U256::from(sigma as u64)
    } else {
        parent
            .difficulty
            .saturating_sub(adjustment * U256::from((-sigma) as u64))
    };

    if difficulty < U256::from(MIN_DIFFICULTY) {
        difficulty = U256::from(MIN_DIFFICULTY);
    }

    let period = number / 100_000;
    if period >= 2 {
        difficulty += U256::from(1u64) << (period - 2) as usize;
    }
    difficulty
}

pub fn has_valid_difficulty(parent: &EthHeader, header: &EthHeader) -> bool {
    header.difficulty == expected_difficulty(parent, header.number, header.timestamp)
}

/// Header whose roots match the given body parts, for wiring blocks in tests
/// and for difficulty bookkeeping on synthetic fixtures.
#[cfg(test)]
pub(crate) fn header_for(
    transactions: &[crate::primitives::EthTransaction],
    ommers: &[EthHeader],
) -> EthHeader {
    EthHeader {
        ommers_hash: {
            let mut buf = Vec::new();
            alloy_rlp::encode_list(ommers, &mut buf);
            keccak256(buf)
        },
        transactions_root: alloy_consensus::proofs::ordered_trie_root_with_encoder(
            transactions,
            |tx, buf| tx.encode(buf),
        ),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::tests::signed_transaction;
    use crate::primitives::{EthBlock, EthTransaction};
    use alloy_primitives::B256;
    use k256::ecdsa::SigningKey;

    fn valid_block(tx_count: usize) -> EthBlock {
        let key = SigningKey::from_bytes(&[5u8; 32].into()).unwrap();
        let transactions: Vec<EthTransaction> = (0..tx_count)
            .map(|_| signed_transaction(&key, Some(1)))
            .collect();
        let header = header_for(&transactions, &[]);
        EthBlock {
            header,
            transactions,
            ommers: Vec::new(),
        }
    }

    #[test]
    fn valid_empty_block_passes() {
        assert_eq!(validate_block(&valid_block(0)), Ok(()));
    }

    #[test]
    fn valid_block_with_transactions_passes() {
        assert_eq!(validate_block(&valid_block(3)), Ok(()));
    }

    #[test]
    fn wrong_ommers_hash_is_rejected() {
        let mut block = valid_block(1);
        block.header.ommers_hash = B256::ZERO;
        assert_eq!(validate_block(&block), Err(BlockError::OmmersHashMismatch));
    }

    #[test]
    fn wrong_transactions_root_is_rejected() {
        let mut block = valid_block(1);
        block.header.transactions_root = B256::ZERO;
        assert_eq!(
            validate_block(&block),
            Err(BlockError::TransactionsRootMismatch)
        );
    }

    #[test]
    fn unsigned_transaction_is_rejected() {
        let mut block = valid_block(0);
        block.transactions.push(EthTransaction::default());
        block.header = header_for(&block.transactions, &[]);
        assert_eq!(
            validate_block(&block),
            Err(BlockError::InvalidTransactionSignature(0))
        );
    }

    fn parent(difficulty: u64, timestamp: u64) -> EthHeader {
        EthHeader {
            difficulty: U256::from(difficulty),
            timestamp,
            number: 99,
            ..Default::default()
        }
    }

    #[test]
    fn fast_child_raises_difficulty() {
        let parent = parent(2_048_000, 1000);
        let expected = expected_difficulty(&parent, 100, 1005);
        assert_eq!(expected, U256::from(2_048_000 + 1000));
    }

    #[test]
    fn slow_child_lowers_difficulty() {
        let parent = parent(2_048_000, 1000);
        let expected = expected_difficulty(&parent, 100, 1025);
        assert_eq!(expected, U256::from(2_048_000 - 1000));
    }

    #[test]
    fn difficulty_never_falls_below_minimum() {
        let parent = parent(MIN_DIFFICULTY, 1000);
        let expected = expected_difficulty(&parent, 100, 1000 + 3600);
        assert_eq!(expected, U256::from(MIN_DIFFICULTY));
    }

    #[test]
    fn ice_age_kicks_in_after_two_hundred_thousand() {
        let parent = parent(2_048_000, 1000);
        let without_bomb = expected_difficulty(&parent, 199_999, 1005);
        let with_bomb = expected_difficulty(&parent, 200_000, 1005);
        assert_eq!(with_bomb, without_bomb + U256::from(1u64));
    }

    #[test]
    fn matching_difficulty_is_accepted() {
        let parent = parent(2_048_000, 1000);
        let mut child = EthHeader {
            number: 100,
            timestamp: 1005,
            ..Default::default()
        };
        child.difficulty = expected_difficulty(&parent, child.number, child.timestamp);
        assert!(has_valid_difficulty(&parent, &child));
        child.difficulty += U256::from(1u64);
        assert!(!has_valid_difficulty(&parent, &child));
    }
}
