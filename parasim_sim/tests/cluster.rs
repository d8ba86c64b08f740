//! End-to-end runs of the phase protocol: in-process over the channel mesh
//! and across sockets over TCP.

use parasim_core::{Agent, Coordinator, ModelConfig, PhaseCode, Worker};
use parasim_env::{Rank, TcpTransport};
use parasim_sim::LocalCluster;
use proptest::prelude::*;
use std::sync::Arc;
use tokio::net::TcpListener;

fn ids(population: &[Agent]) -> Vec<u64> {
    population.iter().map(|a| a.id).collect()
}

#[tokio::test]
async fn test_ten_agents_three_workers() {
    let mut cluster = LocalCluster::launch(ModelConfig::default(), 4).unwrap();
    let report = cluster.run(1).await.unwrap();
    assert!(!report.is_degraded());

    let population = cluster.coordinator().population().to_vec();
    assert_eq!(ids(&population), (0..10).collect::<Vec<_>>());
    assert!(population.iter().all(|a| a.value == 2));

    let shutdown = cluster.shutdown().await.unwrap();
    assert!(shutdown.worker_errors.is_empty());
    let chunks: Vec<usize> = shutdown.workers.iter().map(|w| w.chunk_len).collect();
    assert_eq!(chunks, vec![3, 3, 4]);
    assert!(shutdown.workers.iter().all(|w| w.iterations == 1));
}

#[tokio::test]
async fn test_value_after_n_ticks() {
    for ticks in [0u64, 1, 7] {
        let config = ModelConfig::default().with_agents(23).with_seed(ticks);
        let mut cluster = LocalCluster::launch(config, 5).unwrap();
        cluster.run(ticks).await.unwrap();

        let coordinator = cluster.coordinator();
        assert_eq!(coordinator.model_iteration(), ticks);
        assert!(
            coordinator.population().iter().all(|a| a.value == 1 + ticks as i64),
            "values drifted after {} ticks",
            ticks
        );
        cluster.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_fewer_agents_than_workers() {
    let config = ModelConfig::default().with_agents(2);
    let mut cluster = LocalCluster::launch(config, 6).unwrap();
    cluster.run(2).await.unwrap();

    assert_eq!(ids(cluster.coordinator().population()), vec![0, 1]);
    let shutdown = cluster.shutdown().await.unwrap();
    let chunks: Vec<usize> = shutdown.workers.iter().map(|w| w.chunk_len).collect();
    assert_eq!(chunks, vec![0, 0, 0, 0, 2]);
}

#[tokio::test]
async fn test_continue_is_idempotent() {
    let mut cluster = LocalCluster::launch(ModelConfig::default(), 3).unwrap();
    let coordinator = cluster.coordinator_mut();
    coordinator.build().await.unwrap();

    for _ in 0..3 {
        coordinator.broadcast(PhaseCode::Continue).await.unwrap();
    }
    coordinator.tick().await.unwrap();
    let after_tick = coordinator.population().to_vec();

    coordinator.broadcast(PhaseCode::Continue).await.unwrap();
    coordinator.broadcast(PhaseCode::Continue).await.unwrap();
    coordinator.tick().await.unwrap();

    let population = coordinator.population();
    for (before, now) in after_tick.iter().zip(population) {
        assert_eq!(now.value, before.value + 1);
        assert_eq!((now.x, now.y), (before.x, before.y));
    }

    let shutdown = cluster.shutdown().await.unwrap();
    assert!(shutdown.workers.iter().all(|w| w.iterations == 2 && w.ignored_codes == 0));
}

#[tokio::test]
async fn test_severed_step_is_reported_not_silent() {
    let mut cluster = LocalCluster::launch(ModelConfig::default(), 4).unwrap();
    cluster.coordinator_mut().build().await.unwrap();

    cluster.coordinator_mut().pre_step().await.unwrap();
    cluster.controller().sever(Rank::COORDINATOR, Rank(2));
    cluster.coordinator_mut().step().await.unwrap();
    cluster.controller().heal_all();
    cluster.coordinator_mut().post_step().await.unwrap();

    let report = cluster.coordinator_mut().take_report();
    assert!(report.is_degraded());
    assert_eq!(report.failed_ranks(), vec![Rank(2)]);
    assert_eq!(report.degraded[0].phase, PhaseCode::Step);

    // Rank 2 owns agents 3..6 and missed its step
    let values: Vec<i64> = cluster.coordinator().population().iter().map(|a| a.value).collect();
    assert_eq!(values, vec![2, 2, 2, 1, 1, 1, 2, 2, 2, 2]);

    let shutdown = cluster.shutdown().await.unwrap();
    assert!(!shutdown.end.is_degraded());
    assert!(shutdown.worker_errors.is_empty());
}

#[tokio::test]
async fn test_tcp_end_to_end() {
    let world_size = 3;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let workers: Vec<_> = Rank::workers(world_size)
        .map(move |rank| {
            tokio::spawn(async move {
                let transport = TcpTransport::worker(addr, rank, world_size).await.unwrap();
                let mut worker = Worker::new(Arc::new(transport), ModelConfig::default()).unwrap();
                worker.run().await
            })
        })
        .collect();

    let transport = TcpTransport::accept_workers(listener, world_size).await.unwrap();
    let config = ModelConfig::default().with_agents(7);
    let mut coordinator = Coordinator::new(Arc::new(transport), config).unwrap();

    assert!(!coordinator.build().await.unwrap().is_degraded());
    for _ in 0..2 {
        assert!(!coordinator.tick().await.unwrap().is_degraded());
    }
    coordinator.at_end().await.unwrap();

    assert_eq!(ids(coordinator.population()), (0..7).collect::<Vec<_>>());
    assert!(coordinator.population().iter().all(|a| a.value == 3));

    let mut chunks = Vec::new();
    for handle in workers {
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.iterations, 2);
        chunks.push(summary.chunk_len);
    }
    assert_eq!(chunks, vec![3, 4]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Scatter followed by gather with no step leaves the population as built.
    #[test]
    fn prop_scatter_gather_preserves_population(
        total in 0usize..60,
        world_size in 2usize..7,
        seed in any::<u64>(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (built, gathered) = rt.block_on(async {
            let config = ModelConfig::default().with_agents(total).with_seed(seed);
            let mut cluster = LocalCluster::launch(config, world_size).unwrap();

            let coordinator = cluster.coordinator_mut();
            coordinator.build().await.unwrap();
            let built = coordinator.population().to_vec();
            coordinator.post_step().await.unwrap();
            let gathered = coordinator.population().to_vec();

            cluster.shutdown().await.unwrap();
            (built, gathered)
        });

        prop_assert_eq!(built.len(), total);
        prop_assert_eq!(&built, &gathered);
    }
}
