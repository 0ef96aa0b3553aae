//! spec.md §8 + §5: a payment stuck in `PAYMENT_PROCESSING` past its
//! timeout is cancelled and the reserved stock is restored.
//!
//! Payments authorizes synchronously in this environment, so there is no
//! window to observe a real invoice sitting in `PAYMENT_PROCESSING` long
//! enough for its timer to fire naturally. Instead this seeds an invoice
//! already parked in that state — exactly the state `on_inventory_response`
//! leaves one in right before payment responds — and fires the timeout
//! handler directly, the same call `billing::timers::TimerWheel`'s
//! background task makes once a real deadline elapses.

mod common;

use std::time::Duration;

use billing::models::{Invoice, InvoiceStatus, LineItem, SubStatus};
use billing::store::InvoiceStore;
use chrono::{Duration as ChronoDuration, Utc};
use common::{wait_until, Harness};
use inventory::store::InventoryStore;
use rust_decimal_macros::dec;

#[tokio::test]
async fn payment_timeout_cancels_invoice_and_restores_stock() {
    let h = Harness::new();
    h.seed_product("widget", "Widget", 5, dec!(5.00)).await;
    h.seed_customer("cust-1").await;

    let mut parked = Invoice::new(
        "platform".to_string(),
        "cust-1".to_string(),
        "cust-1@example.com".to_string(),
        vec![LineItem {
            product_id: "widget".to_string(),
            quantity: 2,
            unit_price: dec!(5.00),
        }],
    );
    parked.status = InvoiceStatus::PaymentProcessing;
    parked.inventory_status = SubStatus::Approved;
    parked.payment_status = SubStatus::Pending;
    parked.payment_timeout_at = Some(Utc::now() - ChronoDuration::seconds(1));
    h.billing_store.insert(&parked).await.unwrap();
    h.inventory_store.try_reserve("widget", 2).await.unwrap();

    h.billing.handle_payment_timeout(parked.invoice_id).await.unwrap();

    wait_until(Duration::from_secs(2), || async {
        let status = h.invoice_status(parked.invoice_id).await?;
        (status == InvoiceStatus::Cancelled).then_some(())
    })
    .await;

    wait_until(Duration::from_secs(2), || async {
        (h.inventory_quantity("widget").await == 5).then_some(())
    })
    .await;
}
