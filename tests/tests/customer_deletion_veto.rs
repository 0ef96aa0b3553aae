//! spec.md §8 + §4.5: a single veto cancels the deletion immediately —
//! billing still has a non-terminal invoice in flight for this customer,
//! so it casts `can_delete = false` and the customer lands back `ACTIVE`
//! with `deletion_blocked_by` naming the blocker.

mod common;

use std::time::Duration;

use accounts::models::CustomerStatus;
use billing::models::{Invoice, InvoiceStatus, LineItem, SubStatus};
use billing::store::InvoiceStore;
use common::{wait_until, Harness};
use rust_decimal_macros::dec;

#[tokio::test]
async fn deletion_is_cancelled_when_a_participant_vetoes() {
    let h = Harness::new();
    h.seed_customer("cust-1").await;

    let mut in_flight = Invoice::new(
        "platform".to_string(),
        "cust-1".to_string(),
        "cust-1@example.com".to_string(),
        vec![LineItem {
            product_id: "widget".to_string(),
            quantity: 1,
            unit_price: dec!(5.00),
        }],
    );
    in_flight.status = InvoiceStatus::Processing;
    in_flight.inventory_status = SubStatus::Approved;
    h.billing_store.insert(&in_flight).await.unwrap();

    h.accounts.request_deletion("cust-1").await.unwrap();

    wait_until(Duration::from_secs(2), || async {
        let status = h.customer_status("cust-1").await?;
        (status == CustomerStatus::Active).then_some(())
    })
    .await;

    let customer = h.accounts_store_get("cust-1").await;
    assert!(customer.deletion_completed);
    let blockers = customer.deletion_blocked_by.unwrap();
    assert!(blockers.iter().any(|b| b.service == "billing"));
}
