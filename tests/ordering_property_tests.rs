//! Property-based tests for per-key ordering
//!
//! Work sharing a queuing key must be applied in submission order, whatever
//! the lane count, lane size and batch size, with several producers running
//! at once.

mod common;

use common::{orchestrator, Op};
use index_orchestrator::{OrchestratorConfig, SubmissionPolicy};
use proptest::prelude::*;
use proptest::test_runner::Config;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const LIVENESS: Duration = Duration::from_secs(20);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn config_strategy() -> impl Strategy<Value = OrchestratorConfig> {
    (2usize..=4, 1usize..=8, 1usize..=6).prop_map(|(queue_count, queue_size, batch_size)| {
        OrchestratorConfig {
            queue_count,
            queue_size,
            batch_size,
            ..OrchestratorConfig::default()
        }
    })
}

// Each producer gets its own list of document numbers; a key is only ever
// written by one producer so its submission order is well defined.
fn producers_strategy() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(0u8..5, 1..40), 2..6)
}

fn key(producer: usize, doc: u8) -> String {
    format!("p{producer}-doc{doc}")
}

proptest! {
    #![proptest_config(Config::with_cases(24))]

    /// Property: items with the same key are applied in submission order
    #[test]
    fn prop_per_key_submission_order(config in config_strategy(), producers in producers_strategy()) {
        let rt = runtime();
        rt.block_on(async {
            let (orchestrator, index) = orchestrator(config);
            let orchestrator = Arc::new(orchestrator);
            orchestrator.start().await.unwrap();

            let mut tasks = Vec::new();
            for (producer, docs) in producers.iter().cloned().enumerate() {
                let orchestrator = orchestrator.clone();
                tasks.push(tokio::spawn(async move {
                    let mut handles = Vec::new();
                    for (seq, doc) in docs.into_iter().enumerate() {
                        let op = Op::new(&key(producer, doc), seq as u64);
                        handles.push(
                            orchestrator
                                .submit(op, &SubmissionPolicy::Blocking)
                                .await
                                .unwrap(),
                        );
                    }
                    for handle in handles {
                        handle.await.unwrap();
                    }
                }));
            }
            for task in tasks {
                timeout(LIVENESS, task).await.expect("producer stalled").unwrap();
            }
            orchestrator.stop().await.unwrap();

            let mut expected: HashMap<String, Vec<u64>> = HashMap::new();
            for (producer, docs) in producers.iter().enumerate() {
                for (seq, doc) in docs.iter().enumerate() {
                    expected.entry(key(producer, *doc)).or_default().push(seq as u64);
                }
            }

            let total: usize = producers.iter().map(Vec::len).sum();
            prop_assert_eq!(index.applied_count(), total);
            prop_assert_eq!(index.committed_count(), total);
            for (key, seqs) in &expected {
                prop_assert_eq!(&index.applied_for(key), seqs, "order broken for {}", key);
            }
            Ok(())
        })?;
    }

    /// Property: the writer is never opened twice concurrently
    #[test]
    fn prop_single_writer(config in config_strategy(), producers in producers_strategy()) {
        let rt = runtime();
        rt.block_on(async {
            let (orchestrator, index) = orchestrator(config);
            let orchestrator = Arc::new(orchestrator);
            orchestrator.start().await.unwrap();

            let mut tasks = Vec::new();
            for (producer, docs) in producers.iter().cloned().enumerate() {
                let orchestrator = orchestrator.clone();
                tasks.push(tokio::spawn(async move {
                    for (seq, doc) in docs.into_iter().enumerate() {
                        let op = Op::new(&key(producer, doc), seq as u64);
                        let handle = orchestrator
                            .submit(op, &SubmissionPolicy::Blocking)
                            .await
                            .unwrap();
                        if seq % 7 == 0 {
                            orchestrator.force_commit().await.unwrap();
                        }
                        drop(handle);
                    }
                }));
            }
            for task in tasks {
                timeout(LIVENESS, task).await.expect("producer stalled").unwrap();
            }
            orchestrator.stop().await.unwrap();

            prop_assert_eq!(index.max_open_writers.load(Ordering::SeqCst), 1);
            prop_assert_eq!(index.open_writers.load(Ordering::SeqCst), 0);
            Ok(())
        })?;
    }
}
