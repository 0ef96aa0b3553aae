//! Wires all four services together over one shared [`InMemoryBus`], the
//! same topology `main.rs` in each service assembles against NATS and
//! Postgres, but entirely in-process so a scenario test can drive the
//! invoice saga and the deletion protocol end to end without a database.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use event_bus::{EventBus, InMemoryBus};
use uuid::Uuid;

use accounts::events::consumer_tasks as accounts_consumers;
use accounts::events::outbox::DirectOutbox as AccountsOutbox;
use accounts::handlers::AccountsService;
use accounts::models::Customer;
use accounts::store::{CustomerStore, InMemoryCustomerStore};
use accounts::timers::TimerWheel as SilenceTimerWheel;

use billing::events::consumer_tasks as billing_consumers;
use billing::events::outbox::DirectOutbox as BillingOutbox;
use billing::handlers::BillingService;
use billing::store::{InMemoryInvoiceStore, InvoiceStore};
use billing::timers::TimerWheel as PaymentTimerWheel;

use inventory::events::consumer_tasks as inventory_consumers;
use inventory::events::outbox::DirectOutbox as InventoryOutbox;
use inventory::handlers::InventoryService;
use inventory::models::InventoryItem;
use inventory::store::{InMemoryInventoryStore, InventoryStore};

use payments::events::consumer_tasks as payments_consumers;
use payments::events::outbox::DirectOutbox as PaymentsOutbox;
use payments::handlers::PaymentsService;
use payments::store::InMemoryPaymentStore;

pub const EXPECTED_DELETION_VOTERS: &[&str] = &["billing", "inventory", "payment"];
pub const SILENCE_TIMEOUT_SECONDS: i64 = 60;

/// Every service's entry point plus the in-memory store each is backed by,
/// so a test can assert on persisted state without going back through HTTP.
pub struct Harness {
    pub bus: Arc<dyn EventBus>,
    pub billing: Arc<BillingService>,
    pub billing_store: Arc<InMemoryInvoiceStore>,
    pub accounts: Arc<AccountsService>,
    pub accounts_store: Arc<InMemoryCustomerStore>,
    pub inventory: Arc<InventoryService>,
    pub inventory_store: Arc<InMemoryInventoryStore>,
    pub payments: Arc<PaymentsService>,
}

impl Harness {
    /// Spawns every consumer task and both timer wheels against one bus,
    /// mirroring what each `main.rs` does for `InMemoryBus`-backed dev runs.
    pub fn new() -> Self {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());

        let billing_store = Arc::new(InMemoryInvoiceStore::new());
        let (payment_timers, mut payment_fired) = PaymentTimerWheel::spawn();
        let billing_svc = Arc::new(BillingService::new(
            billing_store.clone(),
            Arc::new(BillingOutbox::new(bus.clone())),
            Arc::new(payment_timers),
        ));
        tokio::spawn({
            let billing_svc = billing_svc.clone();
            async move {
                while let Some(invoice_id) = payment_fired.recv().await {
                    let _ = billing_svc.handle_payment_timeout(invoice_id).await;
                }
            }
        });
        billing_consumers::spawn_all(
            bus.clone(),
            billing_svc.clone(),
            billing_consumers::default_ledger(),
            billing_consumers::default_dlq(),
        );

        let accounts_store = Arc::new(InMemoryCustomerStore::new());
        let (silence_timers, mut silence_fired) = SilenceTimerWheel::spawn();
        let accounts_svc = Arc::new(AccountsService::new(
            accounts_store.clone(),
            Arc::new(AccountsOutbox::new(bus.clone())),
            Arc::new(silence_timers),
            EXPECTED_DELETION_VOTERS.iter().map(|s| s.to_string()).collect(),
            SILENCE_TIMEOUT_SECONDS,
        ));
        tokio::spawn({
            let accounts_svc = accounts_svc.clone();
            async move {
                while let Some(customer_id) = silence_fired.recv().await {
                    let _ = accounts_svc.handle_silence_timeout(&customer_id).await;
                }
            }
        });
        accounts_consumers::spawn_all(bus.clone(), accounts_svc.clone(), accounts_consumers::default_ledger());

        let inventory_store = Arc::new(InMemoryInventoryStore::new());
        let inventory_svc = Arc::new(InventoryService::new(
            inventory_store.clone(),
            Arc::new(InventoryOutbox::new(bus.clone())),
            inventory_consumers::default_ledger(),
        ));
        inventory_consumers::spawn_all(bus.clone(), inventory_svc.clone(), inventory_consumers::default_ledger());

        let payments_store = Arc::new(InMemoryPaymentStore::new());
        let payments_svc = Arc::new(PaymentsService::new(
            payments_store,
            Arc::new(PaymentsOutbox::new(bus.clone())),
        ));
        payments_consumers::spawn_all(bus.clone(), payments_svc.clone(), payments_consumers::default_ledger());

        Self {
            bus,
            billing: billing_svc,
            billing_store,
            accounts: accounts_svc,
            accounts_store,
            inventory: inventory_svc,
            inventory_store,
            payments: payments_svc,
        }
    }

    pub async fn seed_product(&self, product_id: &str, name: &str, quantity: i64, price: rust_decimal::Decimal) {
        self.inventory_store
            .insert(&InventoryItem::new(product_id.to_string(), name.to_string(), quantity, price))
            .await
            .unwrap();
    }

    pub async fn seed_customer(&self, customer_id: &str) {
        self.accounts_store
            .insert(&Customer::new(
                customer_id.to_string(),
                format!("{customer_id}@example.com"),
                "Test".to_string(),
                "Customer".to_string(),
            ))
            .await
            .unwrap();
    }

    pub async fn invoice_status(&self, invoice_id: Uuid) -> Option<billing::models::InvoiceStatus> {
        self.billing_store.get(invoice_id).await.unwrap().map(|i| i.status)
    }

    pub async fn billing_store_get(&self, invoice_id: Uuid) -> billing::models::Invoice {
        self.billing_store.get(invoice_id).await.unwrap().expect("invoice must exist")
    }

    pub async fn customer_status(&self, customer_id: &str) -> Option<accounts::models::CustomerStatus> {
        self.accounts_store.get(customer_id).await.unwrap().map(|c| c.status)
    }

    pub async fn accounts_store_get(&self, customer_id: &str) -> Customer {
        self.accounts_store.get(customer_id).await.unwrap().expect("customer must exist")
    }

    pub async fn inventory_quantity(&self, product_id: &str) -> i64 {
        self.inventory_store.get(product_id).await.unwrap().expect("product must exist").quantity
    }
}

/// Polls `predicate` every 10ms until it returns `Some`, or panics once
/// `timeout` elapses. The saga advances across several independently
/// scheduled consumer tasks, so tests can't assume a fixed number of
/// `yield_now` calls settles it — polling with a generous ceiling is the
/// same tradeoff `event_bus::consumer_retry` makes for redelivery backoff.
pub async fn wait_until<F, Fut, T>(timeout: Duration, mut predicate: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = predicate().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
