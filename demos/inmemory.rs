use std::time::Duration;

use mailslot::transport::{InMemory, Json, Transport};
use mailslot::{Backoff, Envelope, Worker};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Order {
    id: u32,
    amount_cents: u64,
}

async fn handle(envelope: Envelope<Order>) -> Result<(), BoxError> {
    let order = envelope.message();
    if order.amount_cents == 0 {
        return Err(format!("order {} has no amount", order.id).into());
    }
    tracing::info!(order = order.id, amount = order.amount_cents, "Order processed");
    Ok(())
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let web = InMemory::new().with_visibility_timeout(Duration::from_secs(30));
    let store = InMemory::new().with_visibility_timeout(Duration::from_secs(30));

    let producers = [web.clone(), store.clone()];
    let cancel_producer = cancel.clone();
    let producer_handle = tokio::spawn(async move {
        let mut id = 0;
        while !cancel_producer.is_cancelled() {
            let queue = &producers[id as usize % producers.len()];
            if id % 7 == 6 {
                queue.push_raw("{ not an order").await;
            } else {
                let order = Order {
                    id,
                    amount_cents: u64::from(id % 5) * 250,
                };
                queue.send(&order).await.expect("order serializes");
            }
            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    let worker = Worker::<Order, _>::new(tower::service_fn(handle))
        .with_receiver("web", Transport::new(web, Json).with_batch_size(5))
        .with_receiver("store", Transport::new(store, Json).with_batch_size(5))
        .with_backoff(Backoff::Fixed(Duration::from_secs(1)))
        .with_idle_delay(Duration::from_millis(250))
        .with_concurrency(4);

    let worker_handle = tokio::spawn(async move {
        worker.run(cancel).await.expect("worker is configured");
    });

    tokio::try_join!(cancel_handle, producer_handle, worker_handle).unwrap();
}
