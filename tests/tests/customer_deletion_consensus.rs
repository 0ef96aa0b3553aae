//! spec.md §8 + §4.5: every expected participant approves, so the
//! customer's deletion commits on consensus rather than a timeout.

mod common;

use std::time::Duration;

use accounts::models::CustomerStatus;
use common::{wait_until, Harness};

#[tokio::test]
async fn deletion_commits_when_every_participant_approves() {
    let h = Harness::new();
    h.seed_customer("cust-1").await;

    let status = h.accounts.request_deletion("cust-1").await.unwrap();
    assert_eq!(status.status, CustomerStatus::PendingDeletion);

    wait_until(Duration::from_secs(2), || async {
        let status = h.customer_status("cust-1").await?;
        (status == CustomerStatus::Deleted).then_some(())
    })
    .await;

    let customer = h.accounts_store_get("cust-1").await;
    assert!(customer.deletion_completed);
    assert!(customer.deletion_blocked_by.is_none());
}
