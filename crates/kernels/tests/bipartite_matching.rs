//! End to end bipartite matching on a single shard: a fully connected
//! left/right graph with distinct edge costs should converge to a perfect
//! matching after enough alternating left/right rounds, with every denied
//! proposal re-routed by `MatchDenyTrigger` rather than left dangling.

mod harness;

use std::sync::Arc;

use common::Rank;
use kernels::{BpmtKernel, BpmtParams};
use runtime::{KernelRegistry, MasterRuntime, RunDescriptor};

#[tokio::test]
async fn fully_connected_graph_converges_to_a_perfect_matching() {
    let transports = harness::bind_cluster(29300, 1).await;
    let (master_t, worker_t) = (transports[0].clone(), transports[1].clone());
    let worker_rank = Rank(1);

    let tmp = std::env::temp_dir().join("kernels-test-bipartite");
    let master_store = Arc::new(store::LocalFileStore::new(&tmp).unwrap());
    let master = MasterRuntime::new(master_t, master_store, vec![worker_rank]);

    let mut kernels = KernelRegistry::new();
    kernels.register("bpmt", BpmtKernel::factory());
    let (registry, _handle) = harness::spawn_worker(worker_rank, worker_t.clone(), kernels);
    let worker_store = Arc::new(store::LocalFileStore::new(tmp.join("worker")).unwrap());

    let params = BpmtParams {
        left_vertices: 4,
        right_vertices: 4,
        edge_probability: 1.0,
        edge_costs: true,
    };
    let (match_request_id, match_deny_id) =
        kernels::build_bipartite_tables(worker_rank, 1, worker_t, worker_store, &registry, params.edge_costs)
            .await
            .unwrap();
    assert_ne!(match_request_id, match_deny_id);

    // Every table the kernel touches shares a shard count of 1, so
    // registering them all up front lets the master's shard-assignment
    // broadcast reach every one of them, not just the locality table
    // `dispatch` is called against.
    for table in [
        kernels::LEFT_OUT_EDGES,
        kernels::LEFT_OUT_COSTS,
        kernels::LEFT_MATCHES,
        kernels::RIGHT_MATCHES,
        kernels::RIGHT_COSTS,
        kernels::MATCH_STATS,
    ] {
        master.register_table(table, 1).await;
    }

    let run = |method: &str| {
        let encoded = bincode::encode_to_vec(&params, common::bincode_config()).unwrap();
        RunDescriptor::run_all("bpmt", method, kernels::LEFT_OUT_EDGES).with_parameters(encoded)
    };

    master.dispatch(&run("init_tables")).await.unwrap();
    master.dispatch(&run("populate_left")).await.unwrap();

    // Each round resolves one more hop of the propose/veto/re-propose
    // cascade (denials are buffered and only applied on the next flush),
    // so a handful of alternating rounds is enough for four vertices.
    for _ in 0..8 {
        master.dispatch(&run("left_bpmt")).await.unwrap();
        master.dispatch(&run("right_bpmt")).await.unwrap();
    }
    master.dispatch(&run("eval_performance")).await.unwrap();

    let left_matches: Arc<table::GlobalTable<i64, i64>> = registry.get(kernels::LEFT_MATCHES).unwrap();
    let right_matches: Arc<table::GlobalTable<i64, i64>> = registry.get(kernels::RIGHT_MATCHES).unwrap();

    let mut matched_rights = Vec::new();
    for left in 0..params.left_vertices as i64 {
        let right = left_matches.get(&left).await.unwrap();
        assert_ne!(right, -1, "left vertex {left} never matched in a complete graph");
        matched_rights.push(right);
    }
    matched_rights.sort_unstable();
    matched_rights.dedup();
    assert_eq!(
        matched_rights.len(),
        params.left_vertices as usize,
        "every left vertex should hold a distinct right vertex: {matched_rights:?}"
    );

    for right in matched_rights {
        let left = right_matches.get(&right).await.unwrap();
        assert_ne!(left, -1);
    }

    master.shutdown().await.unwrap();
}
