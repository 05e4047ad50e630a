//! End to end: two workers each add into a shared counter bucket that
//! lives on one of them, exercising the remote buffered write path merged
//! by `Accumulator::Sum` rather than overwritten by whichever write lands
//! last.

mod harness;

use std::sync::Arc;

use common::Rank;
use kernels::{AccumulateParams, CounterKernel, COUNTERS};
use runtime::{KernelRegistry, MasterRuntime, RunDescriptor};

#[tokio::test]
async fn buffered_writes_from_every_shard_sum_together() {
    let transports = harness::bind_cluster(29100, 2).await;
    let (master_t, worker_ts) = (transports[0].clone(), transports[1..].to_vec());
    let workers = vec![Rank(1), Rank(2)];

    let tmp = std::env::temp_dir().join("kernels-test-sum-accumulation");
    let master_store = Arc::new(store::LocalFileStore::new(&tmp).unwrap());
    let master = MasterRuntime::new(master_t, master_store, workers.clone());
    master.register_table(COUNTERS, 2).await;

    let mut counters_by_rank = Vec::new();
    for (i, rank) in workers.iter().enumerate() {
        let mut kernels = KernelRegistry::new();
        kernels.register("counter", CounterKernel::factory());
        let (registry, _handle) = harness::spawn_worker(*rank, worker_ts[i].clone(), kernels);
        let store = Arc::new(store::LocalFileStore::new(tmp.join(format!("rank-{}", rank.0))).unwrap());
        let counters = kernels::build_counters_table(*rank, 2, worker_ts[i].clone(), store, &registry).await;
        counters_by_rank.push(counters);
    }

    let params = AccumulateParams {
        deltas: vec![(0, 1); 100],
    };
    let encoded = bincode::encode_to_vec(&params, common::bincode_config()).unwrap();
    let run = RunDescriptor::run_all("counter", "accumulate", COUNTERS).with_parameters(encoded);
    master.dispatch(&run).await.unwrap();

    // Bucket 0 lives on shard 0, owned by the first worker in round-robin
    // order. Both shard tasks wrote into it: one locally, one buffered
    // over the wire, so the sum should reflect both.
    let owner_table = &counters_by_rank[0];
    assert_eq!(owner_table.get(&0).await.unwrap(), 200);

    master.shutdown().await.unwrap();
}
