mod device;
mod host;
mod outbox;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
