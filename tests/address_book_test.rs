/// Saved and tracked address tests: CRUD, network checks and balance refresh
mod common;

use trustless_wallet::{AddressList, WalletError};

use common::*;

#[tokio::test]
async fn test_saved_address_crud() -> anyhow::Result<()> {
    init_logging();
    let env = TestEnvironment::new()?;
    let payee = foreign_address(0).to_string();

    let landlord = env
        .manager
        .add_saved_address(AddressList::Saved, &payee, Some("  Landlord "))
        .await?;
    assert_eq!(landlord.name, "Landlord");
    assert_eq!(landlord.network, "regtest");
    assert_eq!(landlord.balance, 0);
    assert!(landlord.last_updated.is_none());

    let unnamed = env
        .manager
        .add_saved_address(AddressList::Saved, &foreign_address(1).to_string(), None)
        .await?;
    assert_eq!(unnamed.name, "");

    // Lists are independent
    assert!(env.manager.saved_addresses(AddressList::Tracked)?.is_empty());
    assert_eq!(env.manager.saved_addresses(AddressList::Saved)?.len(), 2);

    let renamed = env
        .manager
        .rename_saved_address(AddressList::Saved, &unnamed.id, "Exchange")
        .await?;
    assert_eq!(renamed.name, "Exchange");

    env.manager
        .remove_saved_address(AddressList::Saved, &landlord.id)
        .await?;
    assert_eq!(env.manager.saved_addresses(AddressList::Saved)?, vec![renamed]);

    assert!(matches!(
        env.manager
            .remove_saved_address(AddressList::Saved, &landlord.id)
            .await,
        Err(WalletError::AddressNotFound(_))
    ));
    assert!(matches!(
        env.manager
            .rename_saved_address(AddressList::Tracked, &unnamed.id, "x")
            .await,
        Err(WalletError::AddressNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_address_for_other_network_is_rejected() -> anyhow::Result<()> {
    let env = TestEnvironment::new()?;
    let result = env
        .manager
        .add_saved_address(
            AddressList::Tracked,
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4",
            Some("mainnet"),
        )
        .await;
    assert!(matches!(result, Err(WalletError::InvalidAddress(_))));
    assert!(env.manager.saved_addresses(AddressList::Tracked)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_tracked_balances_refresh() -> anyhow::Result<()> {
    init_logging();
    let env = TestEnvironment::new()?;
    let cold = foreign_address(3);
    let hot = foreign_address(4);
    let cold_row = env
        .manager
        .add_saved_address(AddressList::Tracked, &cold.to_string(), Some("cold"))
        .await?;
    let hot_row = env
        .manager
        .add_saved_address(AddressList::Tracked, &hot.to_string(), Some("hot"))
        .await?;

    env.backend.set_stats(&cold, 2_500_000, 3);
    env.backend.set_stats(&hot, 12_000, 1);
    let rows = env
        .manager
        .refresh_saved_addresses(AddressList::Tracked)
        .await?;
    assert_eq!(rows[0].id, cold_row.id);
    assert_eq!(rows[0].balance, 2_500_000);
    assert_eq!(rows[1].id, hot_row.id);
    assert_eq!(rows[1].balance, 12_000);
    let first_update = rows[1].last_updated;
    assert!(first_update.is_some());

    // A failing fetch keeps the previous balance and timestamp
    env.backend.set_stats(&cold, 2_400_000, 4);
    env.backend.set_failing(&hot, true);
    let rows = env
        .manager
        .refresh_saved_addresses(AddressList::Tracked)
        .await?;
    assert_eq!(rows[0].balance, 2_400_000);
    assert_eq!(rows[1].balance, 12_000);
    assert_eq!(rows[1].last_updated, first_update);

    // Persisted, and the saved list was never touched
    assert_eq!(env.manager.saved_addresses(AddressList::Tracked)?, rows);
    assert!(env.manager.saved_addresses(AddressList::Saved)?.is_empty());
    Ok(())
}
