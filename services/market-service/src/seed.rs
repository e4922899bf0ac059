use anyhow::Context;
use cm_api_types::CardMetadata;
use cm_chain_client::WalletProvider;
use cm_devnet::Devnet;
use cm_market_core::{MarketActions, MarketConfig, SessionGuard, TransactionSubmitter, build_handles};
use std::sync::Arc;
use tracing::info;

/// (image uri, type, rarity)
const SAMPLE_CARDS: [(&str, &str, &str); 3] = [
    ("https://i.imgur.com/2PZQaMN.jpeg", "Fire", "Legendary"),
    ("https://i.imgur.com/YC6yfGo.jpeg", "Water", "Rare"),
    ("https://i.imgur.com/qxzHEPM.jpeg", "Electric", "Epic"),
];

/// Mints the sample cards to the deployer, which owns the registry.
pub(crate) async fn mint_sample_cards(devnet: &Devnet, config: &MarketConfig) -> anyhow::Result<usize> {
    let deployer = devnet.deployer();
    let signer = devnet.signer(deployer)?;
    let handles = build_handles(&signer, &SessionGuard::default(), config)?;
    let actions = MarketActions::new(Arc::new(TransactionSubmitter::new()));

    for (uri, card_type, rarity) in SAMPLE_CARDS {
        let metadata = CardMetadata {
            uri: uri.to_owned(),
            card_type: card_type.to_owned(),
            rarity: rarity.to_owned(),
        };
        let receipt = actions
            .mint(&handles, deployer, &metadata)
            .await
            .with_context(|| format!("failed to mint sample {card_type} card"))?;
        info!(card_type, rarity, block = receipt.block_number, "sample card minted");
    }

    Ok(SAMPLE_CARDS.len())
}
