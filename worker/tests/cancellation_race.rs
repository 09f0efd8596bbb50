//! Concurrent job-fatal classifications against one job record.

use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use hypersearch_worker::classify::{classify_failure, escalate_job_failure};
use hypersearch_worker::core::types::{CompletionReason, JobId, ModelId};
use hypersearch_worker::io::engine::EvalError;
use hypersearch_worker::io::store::{JobRecord, MemoryStore};
use hypersearch_worker::test_support::seeded_store;

const JOB: JobId = JobId(7);
const WORKERS: u64 = 8;

#[test]
fn exactly_one_escalation_wins() {
    let store = Arc::new(seeded_store(JOB, &[]));
    let barrier = Arc::new(Barrier::new(WORKERS as usize));

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let message = format!("worker {worker} failed");
                let won = escalate_job_failure(JOB, store.as_ref(), &message).expect("escalate");
                (won, message)
            })
        })
        .collect();
    let results: Vec<(bool, String)> = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .collect();

    let winners: Vec<&String> = results
        .iter()
        .filter(|(won, _)| *won)
        .map(|(_, message)| message)
        .collect();
    assert_eq!(winners.len(), 1);

    let job = store.job(JOB).expect("job");
    assert!(job.cancel);
    assert_eq!(job.worker_completion_reason, CompletionReason::Error);
    assert_eq!(job.worker_completion_msg.as_ref(), Some(winners[0]));
}

#[test]
fn concurrent_classifications_keep_first_message() {
    let model_ids: Vec<ModelId> = (0..WORKERS).map(|i| ModelId(100 + i)).collect();
    let store = Arc::new(seeded_store(JOB, &model_ids));
    let barrier = Arc::new(Barrier::new(model_ids.len()));

    let handles: Vec<_> = model_ids
        .iter()
        .map(|&model_id| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let err = EvalError::job_fatal([format!("model {model_id} hit bad data")]);
                classify_failure(JOB, model_id, store.as_ref(), Path::new("/tmp/ws"), &err)
                    .expect("classify")
            })
        })
        .collect();
    for handle in handles {
        let outcome = handle.join().expect("join");
        assert_eq!(outcome.reason, CompletionReason::Error);
    }

    let job = store.job(JOB).expect("job");
    assert!(job.cancel);
    let message = job.worker_completion_msg.expect("message");
    assert!(
        model_ids
            .iter()
            .any(|id| message == format!("model {id} hit bad data"))
    );

    // A late failure leaves the recorded one alone.
    assert!(!escalate_job_failure(JOB, store.as_ref(), "late").expect("late"));
    assert_eq!(store.job(JOB).expect("job").worker_completion_msg, Some(message));
}

#[test]
fn escalation_respects_failure_recorded_by_other_host() {
    let store = MemoryStore::new();
    let mut job = JobRecord::new(JOB);
    job.worker_completion_reason = CompletionReason::Error;
    job.worker_completion_msg = Some("recorded elsewhere".to_string());
    store.insert_job(job.clone()).expect("job");

    assert!(!escalate_job_failure(JOB, &store, "mine").expect("escalate"));
    assert_eq!(store.job(JOB).expect("job"), job);
}
