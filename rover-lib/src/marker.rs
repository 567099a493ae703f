use crate::builder::ForeignTx;
use async_trait::async_trait;
use rover_protocol::{Chain, EMB_TOKEN};

/// Settlement-window lookup served by the parent coordinator.
#[async_trait]
pub trait SettlementProbe: Send + Sync {
    async fn is_before_settle_height(&self, from: &str, to: &str, chain: Chain) -> bool;
}

/// Probe that never reports an open settlement window.
pub struct NeverSettles;

#[async_trait]
impl SettlementProbe for NeverSettles {
    async fn is_before_settle_height(&self, _from: &str, _to: &str, _chain: Chain) -> bool {
        false
    }
}

/// Per-transaction marking policy.
pub struct TxMarker {
    designated_key: Option<String>,
    standalone: bool,
}

impl TxMarker {
    pub fn new(designated_key: Option<String>, standalone: bool) -> Self {
        Self {
            designated_key,
            standalone,
        }
    }

    /// Token tag for a transaction, or `None` when it stays unmarked.
    ///
    /// The designated-asset classification wins over the settlement window.
    /// Settlement lookups are skipped entirely in standalone mode.
    pub async fn token_for(
        &self,
        chain: Chain,
        tx: &ForeignTx,
        probe: &dyn SettlementProbe,
    ) -> Option<String> {
        if let Some(key) = &self.designated_key {
            if tx.is_value_transfer && tx.sender_key.eq_ignore_ascii_case(key) {
                return Some(EMB_TOKEN.to_string());
            }
        }
        if self.standalone {
            return None;
        }
        if probe
            .is_before_settle_height(&tx.sender, &tx.recipient, chain)
            .await
        {
            return Some(chain.as_str().to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysSettles;

    #[async_trait]
    impl SettlementProbe for AlwaysSettles {
        async fn is_before_settle_height(&self, _from: &str, _to: &str, _chain: Chain) -> bool {
            true
        }
    }

    fn transfer(sender_key: &str) -> ForeignTx {
        ForeignTx {
            hash: "aa".into(),
            sender: "sender".into(),
            recipient: "recipient".into(),
            value: vec![1],
            is_value_transfer: true,
            sender_key: sender_key.into(),
        }
    }

    #[tokio::test]
    async fn designated_sender_gets_emb() {
        let marker = TxMarker::new(Some("deadbeef".into()), false);
        let token = marker
            .token_for(Chain::Lsk, &transfer("deadbeef"), &NeverSettles)
            .await;
        assert_eq!(token.as_deref(), Some(EMB_TOKEN));
    }

    #[tokio::test]
    async fn emb_wins_over_settlement_window() {
        let marker = TxMarker::new(Some("deadbeef".into()), false);
        let token = marker
            .token_for(Chain::Lsk, &transfer("deadbeef"), &AlwaysSettles)
            .await;
        assert_eq!(token.as_deref(), Some(EMB_TOKEN));
    }

    #[tokio::test]
    async fn settlement_window_marks_with_chain_tag() {
        let marker = TxMarker::new(Some("deadbeef".into()), false);
        let token = marker
            .token_for(Chain::Lsk, &transfer("someone-else"), &AlwaysSettles)
            .await;
        assert_eq!(token.as_deref(), Some("lsk"));
    }

    #[tokio::test]
    async fn non_transfer_type_is_not_designated() {
        let marker = TxMarker::new(Some("deadbeef".into()), false);
        let mut tx = transfer("deadbeef");
        tx.is_value_transfer = false;
        let token = marker.token_for(Chain::Lsk, &tx, &NeverSettles).await;
        assert_eq!(token, None);
    }

    #[tokio::test]
    async fn standalone_skips_settlement_lookup() {
        let marker = TxMarker::new(None, true);
        let token = marker
            .token_for(Chain::Eth, &transfer("any"), &AlwaysSettles)
            .await;
        assert_eq!(token, None);
    }

    #[tokio::test]
    async fn no_designated_key_disables_emb() {
        let marker = TxMarker::new(None, false);
        let token = marker
            .token_for(Chain::Eth, &transfer("deadbeef"), &NeverSettles)
            .await;
        assert_eq!(token, None);
    }
}
