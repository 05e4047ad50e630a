use std::sync::Arc;

use common::{ClusterConfig, Rank};
use runtime::{KernelRegistry, WorkerRuntime};
use table::Registry;
use transport::TcpTransport;

/// Binds one loopback `TcpTransport` per rank, rank 0 through `worker_count`
/// inclusive. Rank 0 is always the master; the rest are workers.
pub async fn bind_cluster(base_port: u16, worker_count: u32) -> Vec<Arc<TcpTransport>> {
    let config = ClusterConfig::loopback(base_port, worker_count + 1);
    let mut transports = Vec::new();
    for rank in 0..=worker_count {
        transports.push(TcpTransport::bind_cluster(Rank(rank), &config).await.unwrap());
    }
    transports
}

/// Starts a worker's run loop on a fresh `Registry` and returns both, so the
/// caller can register tables against it before the master dispatches any
/// work.
pub fn spawn_worker(
    rank: Rank,
    transport: Arc<TcpTransport>,
    kernels: KernelRegistry,
) -> (Arc<Registry>, tokio::task::JoinHandle<()>) {
    let registry = Registry::new();
    let worker = WorkerRuntime::new(rank, transport, registry.clone(), kernels);
    let handle = tokio::spawn(async move { worker.run().await.unwrap() });
    (registry, handle)
}
