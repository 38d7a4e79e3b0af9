use docbind_sdk::prelude::*;
use serde_json::json;
use std::time::Duration;
use stress_test::stress_test_sessions;
use tracing_subscriber::EnvFilter;


#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║            TWO REPLICAS, ONE DOCUMENT                       ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let remote = MemoryEngine::new("remote");
    let laptop = Database::connect(
        MemoryEngine::new("laptop"),
        DatabaseConfig::default(),
        &remote,
    );
    let phone = Database::connect(
        MemoryEngine::new("phone"),
        DatabaseConfig::default(),
        &remote,
    );

    let on_laptop = laptop.open_document_with("todo", SessionOptions::new().debug(true));
    let on_phone = phone.open_document("todo");
    on_laptop.wait_initialized().await;
    on_phone.wait_initialized().await;

    if let Some(patch) = json!({ "title": "Groceries", "done": false }).as_object() {
        let _ = on_laptop.put_document(patch.clone()).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("phone sees:  {}", serde_json::Value::Object(on_phone.data()));

    if let Some(patch) = json!({ "title": "Groceries", "done": true }).as_object() {
        let _ = on_phone.put_document(patch.clone()).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("laptop sees: {}", serde_json::Value::Object(on_laptop.data()));

    laptop.close();
    phone.close();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let stats = stress_test_sessions(4, 25).await;
    stats.print();

    let stats = stress_test_sessions(10, 100).await;
    stats.print();

    println!("\n✓ All stress tests completed");
}
