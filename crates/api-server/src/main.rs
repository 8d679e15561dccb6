//! dubtrack api-server: standalone process entry point. Equivalent to the
//! root `dubtrack` CLI's `serve` subcommand, kept as its own binary for
//! deployments that run the API as the only process in its container.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    api_server::boot::init_tracing();
    api_server::boot::serve().await
}
