//! spec.md §8: inventory rejects the reservation outright (no stock was
//! ever held), so the invoice fails straight from `PROCESSING` with no
//! compensation — there is nothing to roll back.

mod common;

use std::time::Duration;

use billing::models::{CreateInvoiceRequest, InvoiceStatus, LineItem};
use common::{wait_until, Harness};
use rust_decimal_macros::dec;

#[tokio::test]
async fn invoice_fails_when_stock_is_insufficient() {
    let h = Harness::new();
    h.seed_product("widget", "Widget", 0, dec!(5.00)).await;
    h.seed_customer("cust-1").await;

    let invoice = h
        .billing
        .create_invoice(CreateInvoiceRequest {
            tenant_id: "platform".to_string(),
            customer_id: "cust-1".to_string(),
            customer_email: "cust-1@example.com".to_string(),
            items: vec![LineItem {
                product_id: "widget".to_string(),
                quantity: 1,
                unit_price: dec!(5.00),
            }],
        })
        .await
        .unwrap();

    wait_until(Duration::from_secs(2), || async {
        let status = h.invoice_status(invoice.invoice_id).await?;
        (status == InvoiceStatus::Failed).then_some(())
    })
    .await;

    let stored = h.billing_store_get(invoice.invoice_id).await;
    assert!(stored.failure_reason.unwrap().contains("insufficient stock"));
    assert_eq!(h.inventory_quantity("widget").await, 0, "nothing was reserved, so nothing is restored");
}
