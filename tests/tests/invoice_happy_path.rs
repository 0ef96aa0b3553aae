//! spec.md §8: the order workflow's golden path — inventory and customer
//! both check out, payment authorizes, the invoice reaches `COMPLETED`
//! with stock decremented by exactly what was ordered.

mod common;

use std::time::Duration;

use billing::models::{CreateInvoiceRequest, InvoiceStatus, LineItem};
use common::{wait_until, Harness};
use rust_decimal_macros::dec;

#[tokio::test]
async fn invoice_completes_and_reserves_stock() {
    let h = Harness::new();
    h.seed_product("widget", "Widget", 10, dec!(5.00)).await;
    h.seed_customer("cust-1").await;

    let invoice = h
        .billing
        .create_invoice(CreateInvoiceRequest {
            tenant_id: "platform".to_string(),
            customer_id: "cust-1".to_string(),
            customer_email: "cust-1@example.com".to_string(),
            items: vec![LineItem {
                product_id: "widget".to_string(),
                quantity: 2,
                unit_price: dec!(5.00),
            }],
        })
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), || async {
        let status = h.invoice_status(invoice.invoice_id).await?;
        (status == InvoiceStatus::Completed).then_some(())
    })
    .await;

    let stored = h.billing_store_get(invoice.invoice_id).await;
    assert_eq!(stored.total_amount, dec!(10.00));
    assert!(stored.notes.is_empty(), "a clean happy path leaves no late-event narrative");

    assert_eq!(h.inventory_quantity("widget").await, 8, "2 units must be reserved out of the seeded 10");
}
