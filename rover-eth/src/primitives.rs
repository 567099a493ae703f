use alloy_primitives::{Address, B64, B256, Bloom, Bytes, TxKind, U256, keccak256};
use alloy_rlp::{Encodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

/// Pre-EIP-1559 block header, the shape served by eth/62-63 peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct EthHeader {
    pub parent_hash: B256,
    pub ommers_hash: B256,
    pub beneficiary: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,
}

impl EthHeader {
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unsupported v value: {0}")]
    InvalidV(u64),
    #[error("signature scalars out of range")]
    InvalidScalars,
    #[error("public key recovery failed")]
    Recovery,
}

/// Legacy (pre-typed-envelope) transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct EthTransaction {
    pub nonce: u64,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub to: TxKind,
    pub value: U256,
    pub input: Bytes,
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

impl EthTransaction {
    pub fn hash(&self) -> B256 {
        keccak256(alloy_rlp::encode(self))
    }

    /// EIP-155 chain id carried by `v`, if any.
    pub fn chain_id(&self) -> Option<u64> {
        if self.v >= 35 {
            Some((self.v - 35) / 2)
        } else {
            None
        }
    }

    /// The hash the sender signed: six fields pre-EIP-155, nine after.
    fn signature_hash(&self) -> B256 {
        let chain_id = self.chain_id();
        let mut payload_length = self.nonce.length()
            + self.gas_price.length()
            + self.gas_limit.length()
            + self.to.length()
            + self.value.length()
            + self.input.length();
        if let Some(id) = chain_id {
            payload_length += id.length() + 0u8.length() + 0u8.length();
        }

        let mut buf = Vec::with_capacity(payload_length + 3);
        alloy_rlp::Header {
            list: true,
            payload_length,
        }
        .encode(&mut buf);
        self.nonce.encode(&mut buf);
        self.gas_price.encode(&mut buf);
        self.gas_limit.encode(&mut buf);
        self.to.encode(&mut buf);
        self.value.encode(&mut buf);
        self.input.encode(&mut buf);
        if let Some(id) = chain_id {
            id.encode(&mut buf);
            0u8.encode(&mut buf);
            0u8.encode(&mut buf);
        }
        keccak256(&buf)
    }

    /// Recovers the sending address, validating the signature on the way.
    pub fn recover_sender(&self) -> Result<Address, SignatureError> {
        let rec_byte = match self.v {
            27 | 28 => (self.v - 27) as u8,
            v if v >= 35 => ((v - 35) % 2) as u8,
            v => return Err(SignatureError::InvalidV(v)),
        };
        let signature = k256::ecdsa::Signature::from_scalars(
            self.r.to_be_bytes::<32>(),
            self.s.to_be_bytes::<32>(),
        )
        .map_err(|_| SignatureError::InvalidScalars)?;
        let recovery_id =
            k256::ecdsa::RecoveryId::from_byte(rec_byte).ok_or(SignatureError::InvalidScalars)?;
        let key = k256::ecdsa::VerifyingKey::recover_from_prehash(
            self.signature_hash().as_slice(),
            &signature,
            recovery_id,
        )
        .map_err(|_| SignatureError::Recovery)?;

        let uncompressed = key.to_encoded_point(false);
        Ok(Address::from_slice(
            &keccak256(&uncompressed.as_bytes()[1..])[12..],
        ))
    }
}

/// Transactions and ommers of one block, as carried by BLOCK_BODIES.
#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct EthBlockBody {
    pub transactions: Vec<EthTransaction>,
    pub ommers: Vec<EthHeader>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct EthBlock {
    pub header: EthHeader,
    pub transactions: Vec<EthTransaction>,
    pub ommers: Vec<EthHeader>,
}

impl EthBlock {
    pub fn from_parts(header: EthHeader, body: EthBlockBody) -> Self {
        Self {
            header,
            transactions: body.transactions,
            ommers: body.ommers,
        }
    }

    pub fn hash(&self) -> B256 {
        self.header.hash()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;

    pub(crate) fn signed_transaction(key: &SigningKey, chain_id: Option<u64>) -> EthTransaction {
        let mut tx = EthTransaction {
            nonce: 9,
            gas_price: U256::from(20_000_000_000u64),
            gas_limit: 21_000,
            to: TxKind::Call(Address::repeat_byte(0x35)),
            value: U256::from(10u64).pow(U256::from(18u64)),
            input: Bytes::new(),
            v: chain_id.map_or(27, |id| id * 2 + 35),
            r: U256::ZERO,
            s: U256::ZERO,
        };
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(tx.signature_hash().as_slice())
            .unwrap();
        tx.v = match chain_id {
            Some(id) => id * 2 + 35 + recovery_id.to_byte() as u64,
            None => 27 + recovery_id.to_byte() as u64,
        };
        tx.r = U256::from_be_slice(&signature.r().to_bytes());
        tx.s = U256::from_be_slice(&signature.s().to_bytes());
        tx
    }

    fn address_of(key: &SigningKey) -> Address {
        let uncompressed = key.verifying_key().to_encoded_point(false);
        Address::from_slice(&keccak256(&uncompressed.as_bytes()[1..])[12..])
    }

    #[test]
    fn header_rlp_round_trips() {
        let header = crate::params::dao_fork_header();
        let encoded = alloy_rlp::encode(&header);
        let decoded = alloy_rlp::decode_exact::<EthHeader>(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }

    #[test]
    fn recovers_pre_eip155_sender() {
        let key = SigningKey::from_bytes(&[7u8; 32].into()).unwrap();
        let tx = signed_transaction(&key, None);
        assert_eq!(tx.recover_sender().unwrap(), address_of(&key));
    }

    #[test]
    fn recovers_eip155_sender() {
        let key = SigningKey::from_bytes(&[42u8; 32].into()).unwrap();
        let tx = signed_transaction(&key, Some(1));
        assert_eq!(tx.chain_id(), Some(1));
        assert_eq!(tx.recover_sender().unwrap(), address_of(&key));
    }

    #[test]
    fn tampered_value_changes_recovered_sender() {
        let key = SigningKey::from_bytes(&[42u8; 32].into()).unwrap();
        let mut tx = signed_transaction(&key, Some(1));
        tx.value += U256::from(1u64);
        match tx.recover_sender() {
            Ok(address) => assert_ne!(address, address_of(&key)),
            Err(_) => {}
        }
    }

    #[test]
    fn garbage_v_is_rejected() {
        let tx = EthTransaction {
            v: 3,
            ..Default::default()
        };
        assert_eq!(tx.recover_sender(), Err(SignatureError::InvalidV(3)));
    }

    #[test]
    fn transaction_rlp_round_trips() {
        let key = SigningKey::from_bytes(&[1u8; 32].into()).unwrap();
        let tx = signed_transaction(&key, Some(1));
        let encoded = alloy_rlp::encode(&tx);
        let decoded = alloy_rlp::decode_exact::<EthTransaction>(&encoded).unwrap();
        assert_eq!(decoded, tx);
    }
}
