use crate::error::AppError;
use crate::models::{ActionType, AddonPool, PurchaseRecord};
use crate::remote::EntitlementBackend;
use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseReceipt {
    pub record: PurchaseRecord,
    pub addons: AddonPool,
}

/// Adds purchased credits to one action's balance and returns the new balance.
/// Only ever increases a balance; decreases happen through reconciliation.
pub fn credit_addon(pool: &mut AddonPool, action: ActionType, quantity: u64) -> Result<u64, AppError> {
    if quantity == 0 {
        return Err(AppError::InvalidQuantity);
    }
    let next = pool
        .balances
        .get(action)
        .checked_add(quantity)
        .ok_or_else(|| AppError::Config(format!("{action} balance would overflow")))?;
    pool.balances.set(action, next);
    Ok(next)
}

/// Appends the purchase to the backend's ledger once the new balance is durable.
pub async fn record_purchase(
    backend: &dyn EntitlementBackend,
    user_id: &str,
    action: ActionType,
    quantity: u64,
    now: DateTime<Utc>,
) -> Result<PurchaseRecord, AppError> {
    let record = PurchaseRecord {
        action_type: action,
        quantity,
        timestamp: now,
    };
    backend.append_purchase(user_id, &record).await?;
    info!(%action, user_id, quantity, "recorded add-on purchase");
    Ok(record)
}
