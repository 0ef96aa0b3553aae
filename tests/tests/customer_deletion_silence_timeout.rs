//! spec.md §8 + §4.5 rule 3 + §5: a participant that never votes doesn't
//! block deletion forever — once the silence timer fires, a synthetic
//! `{can_delete = true, timeout = true}` vote is injected for it and the
//! decision commits by "silence as consent".
//!
//! The harness's three real services (billing, inventory, payment) all
//! vote instantly and always approve an uninvolved customer, which would
//! otherwise reach consensus before any silence could be observed. This
//! test adds a fourth expected voter, `archive`, that no running service
//! ever casts a vote for, so the deletion is guaranteed to still be
//! pending when the silence timer is fired.

mod common;

use std::sync::Arc;
use std::time::Duration;

use accounts::deletion::Method;
use accounts::events::consumer_tasks as accounts_consumers;
use accounts::events::outbox::DirectOutbox;
use accounts::handlers::AccountsService;
use accounts::models::{Customer, CustomerStatus};
use accounts::store::{CustomerStore, InMemoryCustomerStore};
use accounts::timers::TimerWheel;
use common::{wait_until, Harness};
use futures::StreamExt;

#[tokio::test]
async fn deletion_commits_by_silence_once_one_voter_never_responds() {
    let h = Harness::new();

    let store = Arc::new(InMemoryCustomerStore::new());
    store
        .insert(&Customer::new(
            "cust-1".to_string(),
            "cust-1@example.com".to_string(),
            "Test".to_string(),
            "Customer".to_string(),
        ))
        .await
        .unwrap();
    let (timers, mut fired) = TimerWheel::spawn();
    let accounts_svc = Arc::new(AccountsService::new(
        store.clone(),
        Arc::new(DirectOutbox::new(h.bus.clone())),
        Arc::new(timers),
        vec!["billing".to_string(), "inventory".to_string(), "payment".to_string(), "archive".to_string()],
        60,
    ));
    tokio::spawn({
        let svc = accounts_svc.clone();
        async move {
            while let Some(id) = fired.recv().await {
                let _ = svc.handle_silence_timeout(&id).await;
            }
        }
    });
    accounts_consumers::spawn_all(h.bus.clone(), accounts_svc.clone(), accounts_consumers::default_ledger());

    let mut completed = h.bus.subscribe(accounts::events::envelope::subjects::CUSTOMER_DELETION_COMPLETED).await.unwrap();

    accounts_svc.request_deletion("cust-1").await.unwrap();

    // The three real participants respond quickly; "archive" never will.
    wait_until(Duration::from_secs(2), || async {
        let customer = store.get("cust-1").await.ok()??;
        (customer.deletion_responses.len() == 3 && !customer.deletion_completed).then_some(())
    })
    .await;
    assert_eq!(
        store.get("cust-1").await.unwrap().unwrap().status,
        CustomerStatus::PendingDeletion,
        "still waiting on the fourth voter"
    );

    accounts_svc.handle_silence_timeout("cust-1").await.unwrap();

    wait_until(Duration::from_secs(2), || async {
        let customer = store.get("cust-1").await.ok()??;
        (customer.status == CustomerStatus::Deleted).then_some(())
    })
    .await;

    let msg = completed.next().await.unwrap();
    let raw: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(raw["payload"]["method"], serde_json::to_value(Method::SilenceTimeout).unwrap());

    let customer = store.get("cust-1").await.unwrap().unwrap();
    assert!(customer.deletion_responses.get("archive").unwrap().timeout);
}
