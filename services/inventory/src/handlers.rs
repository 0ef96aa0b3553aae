//! Ties reservation, restock, and the deletion-vote validator to storage
//! and the outbox.
//!
//! Inventory has no invoice-shaped FSM of its own: a reservation is a
//! straight atomic decrement per line item (`InventoryStore::try_reserve`),
//! and restock on compensation is the inverse, guarded by the
//! `applied_compensations` idempotency ledger so a redelivered
//! `compensate-inventory` can't double-credit stock.

use std::sync::Arc;

use entity_store::{compensation_key, IdempotencyLedger};
use tracing::{info, warn};

use crate::error::InventoryError;
use crate::events::envelope::{
    self, subjects, CustomerDeletionResponded, DeletionVote, InventoryCompensationResponded,
    InventoryReservationResponded, LineItem,
};
use crate::events::outbox::Outbox;
use crate::store::InventoryStore;

const COMPENSATION_TYPE: &str = "restore_inventory";

pub struct InventoryService {
    pub store: Arc<dyn InventoryStore>,
    pub outbox: Arc<dyn Outbox>,
    pub ledger: Arc<dyn IdempotencyLedger>,
}

impl InventoryService {
    pub fn new(store: Arc<dyn InventoryStore>, outbox: Arc<dyn Outbox>, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        Self { store, outbox, ledger }
    }

    /// Reserves every line item in turn. If any item can't be fully
    /// reserved, whatever was already reserved for this request is rolled
    /// back before responding `approved = false` — partial holds are never
    /// left behind.
    pub async fn handle_reservation_request(
        &self,
        invoice_id: uuid::Uuid,
        tenant_id: &str,
        items: Vec<LineItem>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), InventoryError> {
        let mut reserved: Vec<(String, i64)> = Vec::new();
        let mut failure: Option<String> = None;

        for item in &items {
            match self
                .store
                .try_reserve(&item.product_id, item.quantity as i64)
                .await?
            {
                Some(_) => reserved.push((item.product_id.clone(), item.quantity as i64)),
                None => {
                    failure = Some(format!(
                        "insufficient stock for product {}",
                        item.product_id
                    ));
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            for (product_id, quantity) in reserved {
                if let Err(e) = self.store.restore(&product_id, quantity).await {
                    warn!(%product_id, error = %e, "failed to roll back partial reservation");
                }
            }
            self.publish(
                subjects::INVENTORY_RESERVATION_RESPONDED,
                tenant_id,
                InventoryReservationResponded {
                    invoice_id,
                    approved: false,
                    reason: Some(reason),
                },
                correlation_id,
                causation_id,
            )
            .await?;
            return Ok(());
        }

        self.publish(
            subjects::INVENTORY_RESERVATION_RESPONDED,
            tenant_id,
            InventoryReservationResponded {
                invoice_id,
                approved: true,
                reason: None,
            },
            correlation_id,
            causation_id,
        )
        .await
    }

    /// Restores every line item named in a compensation request,
    /// short-circuiting per-item on a repeat delivery.
    pub async fn handle_compensation_request(
        &self,
        invoice_id: uuid::Uuid,
        tenant_id: &str,
        items: Vec<LineItem>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), InventoryError> {
        if items.is_empty() {
            self.publish(
                subjects::INVENTORY_COMPENSATION_RESPONDED,
                tenant_id,
                InventoryCompensationResponded {
                    invoice_id,
                    compensation_successful: false,
                    error: Some("not found".to_string()),
                },
                correlation_id,
                causation_id,
            )
            .await?;
            return Ok(());
        }

        let mut error = None;
        for item in &items {
            let key = compensation_key(&invoice_id.to_string(), &item.product_id, COMPENSATION_TYPE);
            if self.ledger.is_processed(&key, "inventory").await? {
                continue;
            }
            match self.store.restore(&item.product_id, item.quantity as i64).await? {
                Some(updated) => {
                    info!(invoice_id = %invoice_id, product_id = %item.product_id, quantity = updated.quantity, "restored inventory compensation");
                    self.ledger.mark_processed(&key, COMPENSATION_TYPE, "inventory").await?;
                }
                None => {
                    error = Some(format!("product {} not found", item.product_id));
                }
            }
        }

        self.publish(
            subjects::INVENTORY_COMPENSATION_RESPONDED,
            tenant_id,
            InventoryCompensationResponded {
                invoice_id,
                compensation_successful: error.is_none(),
                error,
            },
            correlation_id,
            causation_id,
        )
        .await
    }

    /// Inventory has no per-customer reservation ledger — stock is tracked
    /// by product, not by customer — so it never vetoes a deletion.
    pub fn evaluate_deletion_vote(&self) -> (DeletionVote, Option<String>) {
        (DeletionVote::Approve, None)
    }

    pub async fn publish_deletion_vote(
        &self,
        customer_id: &str,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), InventoryError> {
        let (vote, reason) = self.evaluate_deletion_vote();
        self.publish(
            subjects::CUSTOMER_DELETION_RESPONDED,
            "platform",
            CustomerDeletionResponded {
                customer_id: customer_id.to_string(),
                service: envelope::SOURCE_MODULE.to_string(),
                vote,
                reason,
            },
            correlation_id,
            causation_id,
        )
        .await
    }

    async fn publish<T: serde::Serialize>(
        &self,
        subject: &str,
        tenant_id: &str,
        payload: T,
        correlation_id: Option<String>,
        causation_id: Option<String>,
    ) -> Result<(), InventoryError> {
        let envelope = envelope::build_envelope(tenant_id, correlation_id, causation_id, payload);
        let bytes = serde_json::to_vec(&envelope)
            .map_err(|e| InventoryError::Bus(event_bus::BusError::SerializationError(e.to_string())))?;
        self.outbox.enqueue(subject, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::outbox::DirectOutbox;
    use crate::store::InMemoryInventoryStore;
    use entity_store::InMemoryIdempotencyLedger;
    use event_bus::{EventBus, InMemoryBus};
    use futures::StreamExt;
    use rust_decimal_macros::dec;

    fn sample_service() -> (Arc<InventoryService>, Arc<InMemoryInventoryStore>, Arc<InMemoryBus>) {
        let store = Arc::new(InMemoryInventoryStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let ledger: Arc<dyn IdempotencyLedger> = Arc::new(InMemoryIdempotencyLedger::new());
        let service = Arc::new(InventoryService::new(
            store.clone(),
            Arc::new(DirectOutbox::new(bus.clone())),
            ledger,
        ));
        (service, store, bus)
    }

    #[tokio::test]
    async fn test_reservation_approves_when_stock_sufficient() {
        let (service, store, bus) = sample_service();
        store
            .insert(&crate::models::InventoryItem::new(
                "prod-1".to_string(),
                "Widget".to_string(),
                5,
                dec!(10.00),
            ))
            .await
            .unwrap();

        let mut responses = bus.subscribe(subjects::INVENTORY_RESERVATION_RESPONDED).await.unwrap();
        service
            .handle_reservation_request(
                uuid::Uuid::new_v4(),
                "platform",
                vec![LineItem { product_id: "prod-1".to_string(), quantity: 2 }],
                None,
                None,
            )
            .await
            .unwrap();

        let item = store.get("prod-1").await.unwrap().unwrap();
        assert_eq!(item.quantity, 3);

        let msg = responses.next().await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(raw["payload"]["approved"], true);
    }

    #[tokio::test]
    async fn test_reservation_rejects_and_rolls_back_partial_hold() {
        let (service, store, bus) = sample_service();
        store
            .insert(&crate::models::InventoryItem::new("prod-1".to_string(), "Widget".to_string(), 5, dec!(10.00)))
            .await
            .unwrap();
        store
            .insert(&crate::models::InventoryItem::new("prod-2".to_string(), "Gadget".to_string(), 0, dec!(5.00)))
            .await
            .unwrap();

        let mut responses = bus.subscribe(subjects::INVENTORY_RESERVATION_RESPONDED).await.unwrap();
        service
            .handle_reservation_request(
                uuid::Uuid::new_v4(),
                "platform",
                vec![
                    LineItem { product_id: "prod-1".to_string(), quantity: 2 },
                    LineItem { product_id: "prod-2".to_string(), quantity: 1 },
                ],
                None,
                None,
            )
            .await
            .unwrap();

        let item = store.get("prod-1").await.unwrap().unwrap();
        assert_eq!(item.quantity, 5, "reservation of prod-1 must be rolled back");

        let msg = responses.next().await.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(raw["payload"]["approved"], false);
    }

    #[tokio::test]
    async fn test_compensation_is_idempotent_per_product() {
        let (service, store, _bus) = sample_service();
        store
            .insert(&crate::models::InventoryItem::new("prod-1".to_string(), "Widget".to_string(), 3, dec!(10.00)))
            .await
            .unwrap();

        let invoice_id = uuid::Uuid::new_v4();
        let items = vec![LineItem { product_id: "prod-1".to_string(), quantity: 2 }];

        service
            .handle_compensation_request(invoice_id, "platform", items.clone(), None, None)
            .await
            .unwrap();
        service
            .handle_compensation_request(invoice_id, "platform", items, None, None)
            .await
            .unwrap();

        let item = store.get("prod-1").await.unwrap().unwrap();
        assert_eq!(item.quantity, 5, "second delivery must not double-credit stock");
    }

    #[tokio::test]
    async fn test_inventory_never_vetoes_deletion() {
        let (service, _store, _bus) = sample_service();
        let (vote, reason) = service.evaluate_deletion_vote();
        assert_eq!(vote, DeletionVote::Approve);
        assert!(reason.is_none());
    }
}
