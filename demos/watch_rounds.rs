use anyhow::Result;
use livestack_sdk::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8877".to_string());
    let view = std::env::var("VIEW").unwrap_or_else(|_| "Round/list".to_string());

    let client = LiveStack::builder().url(&url).connect().await?;
    println!("connected, watching {}...\n", view);

    let rounds = client.list_view::<serde_json::Value>(&view);
    let mut updates = rounds.watch(WatchOptions::default());

    while let Some(update) = updates.next().await {
        match update {
            Update::Upsert { key, data } => println!("upsert {} -> {}", key, data),
            Update::Patch { key, data } => println!("patch  {} -> {}", key, data),
            Update::Delete { key } => println!("delete {}", key),
        }
    }

    client.disconnect().await;
    Ok(())
}
