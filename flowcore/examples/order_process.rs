//! Order fulfilment on the in-memory store.
//!
//! Starts a few orders, lets the job executor run the asynchronous charge
//! step and the invoice timer, completes the shipping user task by
//! signalling it and cancels the remaining orders through a batch.
//!
//! Run with: `RUST_LOG=flowcore=debug cargo run --example order_process`

use std::sync::Arc;
use std::time::Duration;

use flowcore::batch::PROCESS_INSTANCE_CANCELLATION_BATCH;
use flowcore::*;
use serde_json::json;
use tokio::sync::broadcast;

/// Prints every activity an order passes through.
struct TraceListener;

impl ExecutionListener for TraceListener {
    fn notify(&self, event: &ListenerEvent<'_>) -> Result<()> {
        if event.kind == ListenerEventKind::Start {
            println!("[LISTENER] {} entered {}", event.process_instance_id, event.activity_id);
        }
        Ok(())
    }
}

/// start -> validate -> charge (async) -> fork -> ship | invoice (timer) -> join -> end
fn order_process() -> anyhow::Result<ProcessDefinition> {
    ProcessDefinition::builder("order")
        .start("start")
        .task("validate")
        .service_task("charge")
        .async_before()
        .parallel_gateway("fork")
        .user_task("ship")
        .timer("invoice", 500)
        .parallel_gateway("join")
        .end("end")
        .flow("start", "validate")
        .flow("validate", "charge")
        .flow("charge", "fork")
        .flow("fork", "ship")
        .flow("fork", "invoice")
        .flow("ship", "join")
        .flow("invoice", "join")
        .flow("join", "end")
        .build()
        .map_err(Into::into)
}

async fn print_events(mut events: broadcast::Receiver<EngineEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("[EVENT] {event:?}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                println!("[EVENT] skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowcore=info".into()),
        )
        .init();

    let config = EngineConfig::default()
        .with_job_executor(
            JobExecutorConfig::new("example-node")
                .with_acquisition_interval(200)
                .with_worker_pool_size(4)
                .with_lock_sweep_interval(1_000),
        )
        .with_batch(BatchConfig::default().with_chunk_size(2).with_monitor_poll_interval(200));

    let engine = ProcessEngine::builder(config)
        .with_store(Arc::new(InMemoryStore::new()))
        .with_definition(order_process()?)
        .with_execution_listener(Arc::new(TraceListener))
        .build()?;
    tokio::spawn(print_events(engine.subscribe()));
    engine.start().await?;

    let mut orders = Vec::new();
    for customer in ["ada", "grace", "linus"] {
        let order = engine
            .execute(
                StartProcessInstanceCommand::new("order")
                    .with_business_key(format!("order-{customer}"))
                    .with_variable("customer", json!(customer)),
            )
            .await?;
        println!("[MAIN] started order {order} for {customer}");
        orders.push(order);
    }

    // Charging runs on the job executor; wait for the first order to reach shipping.
    let first = orders[0];
    let ship = loop {
        let waiting = engine
            .executions(ExecutionQuery::by_process_instance(first).at_activity("ship"))
            .await?;
        if let Some(execution) = waiting.into_iter().next() {
            break execution;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    engine.signal(ship.id).await?;
    println!("[MAIN] shipped order {first}");

    // The invoice timer completes the first order.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let stale: Vec<String> = orders[1..].iter().map(ToString::to_string).collect();
    let batch = engine
        .create_batch(
            PROCESS_INSTANCE_CANCELLATION_BATCH,
            stale,
            json!({ "reason": "warehouse closed" }),
        )
        .await?;
    println!("[MAIN] created cancellation batch {batch}");

    tokio::time::sleep(Duration::from_secs(1)).await;

    for order in &orders {
        let remaining = engine
            .executions(ExecutionQuery::by_process_instance(*order))
            .await?;
        println!("[MAIN] order {order}: {} executions left", remaining.len());
    }
    println!("[MAIN] metrics: {:?}", engine.metrics());

    engine.shutdown().await?;
    Ok(())
}
