use clap::Parser;

use tabmesh_hub::{run, HubArgs};
use tabmesh_runtime::init_logging;

#[tokio::main]
async fn main() {
    let args = HubArgs::parse();

    if let Err(e) = init_logging(&args.log_config()) {
        eprintln!("tabmesh-hub: {}", e);
        std::process::exit(2);
    }
    tracing::info!(listen = %args.listen, "starting tabmesh hub v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        tracing::error!("hub stopped: {}", e);
        std::process::exit(1);
    }
}
