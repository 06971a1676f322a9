// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use hsvm_node::config::NodeConfig;
use hsvm_node::server::build_router;
use hsvm_node::storage::Storage;
use hsvm_node::telemetry::init_telemetry;
use hsvm_node::vm::Vm;
use hsvm_persistence::Store;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    init_telemetry();

    let cfg = NodeConfig::from_env();
    tracing::info!("Initializing hsvm node {} with config: {:?}", cfg.server_name, cfg);

    let store = match &cfg.data_dir {
        Some(dir) => {
            tracing::info!("Opening store at {:?}", dir);
            Store::open(dir).expect("Failed to open store")
        }
        None => Store::memory(),
    };
    let store: Arc<dyn Storage> = Arc::new(store);

    let addr = cfg.bind_addr;
    let vm = Vm::builder(cfg).storage(store).build();
    let app = build_router(vm.clone());

    tracing::info!("Listening on {}", addr);
    let listener = TcpListener::bind(addr).await.expect("Failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("Server error");

    vm.fini().await;
}
