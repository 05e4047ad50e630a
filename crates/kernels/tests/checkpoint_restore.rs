//! End to end: checkpoint a table mid-run, mutate it further, then restore
//! and confirm the later mutation is gone. Exercises the master-driven
//! `StartCheckpoint`/`FinishCheckpoint`/`Restore` broadcast sequence rather
//! than `LocalShard`'s serialize/apply_updates round trip directly.

mod harness;

use std::sync::Arc;

use common::{Epoch, Rank};
use kernels::{AccumulateParams, CounterKernel, COUNTERS};
use runtime::{KernelRegistry, MasterRuntime, RunDescriptor};

async fn accumulate(master: &Arc<MasterRuntime>, delta: i64) {
    let params = AccumulateParams { deltas: vec![(0, delta)] };
    let encoded = bincode::encode_to_vec(&params, common::bincode_config()).unwrap();
    let run = RunDescriptor::run_all("counter", "accumulate", COUNTERS).with_parameters(encoded);
    master.dispatch(&run).await.unwrap();
}

#[tokio::test]
async fn restore_discards_writes_made_after_the_checkpoint() {
    let transports = harness::bind_cluster(29200, 1).await;
    let (master_t, worker_t) = (transports[0].clone(), transports[1].clone());
    let worker_rank = Rank(1);

    let tmp = std::env::temp_dir().join("kernels-test-checkpoint-restore");
    let _ = std::fs::remove_dir_all(&tmp);
    let master_store = Arc::new(store::LocalFileStore::new(&tmp).unwrap());
    let master = MasterRuntime::new(master_t, master_store, vec![worker_rank]);
    master.register_table(COUNTERS, 1).await;

    let mut kernels = KernelRegistry::new();
    kernels.register("counter", CounterKernel::factory());
    let (registry, _handle) = harness::spawn_worker(worker_rank, worker_t.clone(), kernels);
    let worker_store = Arc::new(store::LocalFileStore::new(tmp.join("worker")).unwrap());
    let counters = kernels::build_counters_table(worker_rank, 1, worker_t, worker_store, &registry).await;

    accumulate(&master, 5).await;
    assert_eq!(counters.get(&0).await.unwrap(), 5);

    master.checkpoint(&[COUNTERS], "ckpt").await.unwrap();

    accumulate(&master, 3).await;
    assert_eq!(counters.get(&0).await.unwrap(), 8);

    master.restore(Epoch(1), &[COUNTERS], "ckpt").await.unwrap();
    assert_eq!(counters.get(&0).await.unwrap(), 5);

    master.shutdown().await.unwrap();
}
