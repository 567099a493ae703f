use serde::{Deserialize, Deserializer};

/// Block shape served by the Lisk HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LskBlock {
    pub id: String,
    pub height: u64,
    #[serde(default)]
    pub previous_block: Option<String>,
    /// Seconds since the Lisk genesis instant, not unix time.
    pub timestamp: u64,
    #[serde(default)]
    pub payload_hash: String,
    #[serde(default)]
    pub payload_length: u64,
    #[serde(default)]
    pub generator_public_key: String,
    pub block_signature: String,
    #[serde(default)]
    pub number_of_transactions: u64,
}

/// Transaction shape served by the Lisk HTTP API. Type 0 is the plain
/// value transfer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LskTransaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_public_key: String,
    #[serde(default)]
    pub recipient_id: Option<String>,
    /// Beddows; newer API versions serialize this as a string.
    #[serde(default, deserialize_with = "amount_from_api")]
    pub amount: u128,
}

pub const LSK_TRANSFER_TYPE: u8 = 0;

fn amount_from_api<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(amount) => Ok(amount as u128),
        Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parses_api_shape() {
        let raw = r#"{
            "id": "10881767460073655903",
            "height": 8128779,
            "previousBlock": "1349213844499460766",
            "timestamp": 87022900,
            "payloadHash": "aa",
            "payloadLength": 117,
            "generatorPublicKey": "bb",
            "blockSignature": "cc",
            "numberOfTransactions": 1
        }"#;
        let block: LskBlock = serde_json::from_str(raw).unwrap();
        assert_eq!(block.height, 8_128_779);
        assert_eq!(block.previous_block.as_deref(), Some("1349213844499460766"));
        assert_eq!(block.block_signature, "cc");
    }

    #[test]
    fn block_tolerates_missing_optional_fields() {
        let raw = r#"{
            "id": "1",
            "height": 2,
            "timestamp": 3,
            "blockSignature": "sig"
        }"#;
        let block: LskBlock = serde_json::from_str(raw).unwrap();
        assert_eq!(block.previous_block, None);
        assert_eq!(block.number_of_transactions, 0);
    }

    #[test]
    fn amount_accepts_number_and_string() {
        let raw = r#"{"id": "t1", "type": 0, "amount": 100000000}"#;
        let tx: LskTransaction = serde_json::from_str(raw).unwrap();
        assert_eq!(tx.amount, 100_000_000);

        let raw = r#"{"id": "t2", "type": 0, "amount": "250000000"}"#;
        let tx: LskTransaction = serde_json::from_str(raw).unwrap();
        assert_eq!(tx.amount, 250_000_000);
    }

    #[test]
    fn garbage_amount_is_an_error() {
        let raw = r#"{"id": "t3", "type": 0, "amount": "not-a-number"}"#;
        assert!(serde_json::from_str::<LskTransaction>(raw).is_err());
    }
}
