use std::collections::HashMap;

use camreel_job_model::{Job, JobId, JobQueue, JobStatus};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    AddConvert,
    AddDownload,
    SetStatus(usize, JobStatus),
    Remove(usize),
    Clear,
    Retry(usize),
}

fn status_strategy() -> impl Strategy<Value = JobStatus> {
    prop_oneof![
        Just(JobStatus::Pending),
        Just(JobStatus::Downloading),
        Just(JobStatus::Downloaded),
        Just(JobStatus::Running),
        Just(JobStatus::Done),
        Just(JobStatus::Skipped),
        Just(JobStatus::Error),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::AddConvert),
        1 => Just(Op::AddDownload),
        8 => (0usize..16, status_strategy()).prop_map(|(i, s)| Op::SetStatus(i, s)),
        1 => (0usize..16).prop_map(Op::Remove),
        1 => Just(Op::Clear),
        1 => (0usize..16).prop_map(Op::Retry),
    ]
}

fn pick(queue: &JobQueue, index: usize) -> Option<JobId> {
    if queue.is_empty() {
        None
    } else {
        Some(queue.jobs()[index % queue.len()].id)
    }
}

proptest! {
    #[test]
    fn single_flight_and_terminal_states_hold(ops in proptest::collection::vec(op_strategy(), 1..80)) {
        let mut queue = JobQueue::new();
        let mut counter = 0usize;

        for op in ops {
            let before: HashMap<JobId, JobStatus> =
                queue.iter().map(|j| (j.id, j.status())).collect();
            let mut retried = Vec::new();

            match op {
                Op::AddConvert => {
                    counter += 1;
                    queue.enqueue(Job::convert(format!("rec_{counter}.mjpg"))).unwrap();
                }
                Op::AddDownload => {
                    counter += 1;
                    queue
                        .enqueue(Job::download(format!("cam{counter}"), "/rec", "/dst"))
                        .unwrap();
                }
                Op::SetStatus(i, status) => {
                    if let Some(id) = pick(&queue, i) {
                        let _ = queue.set_status(id, status);
                    }
                }
                Op::Remove(i) => {
                    if let Some(id) = pick(&queue, i) {
                        queue.remove(&[id]);
                    }
                }
                Op::Clear => {
                    queue.clear();
                }
                Op::Retry(i) => {
                    if let Some(id) = pick(&queue, i) {
                        retried = queue.retry(&[id]);
                    }
                }
            }

            let active = queue.iter().filter(|j| j.status().is_active()).count();
            prop_assert!(active <= 1, "{active} active jobs");

            for job in queue.iter() {
                if let Some(prev) = before.get(&job.id) {
                    if prev.is_terminal() && !retried.contains(&job.id) {
                        prop_assert_eq!(*prev, job.status());
                    }
                }
            }

            let mut ids: Vec<JobId> = queue.iter().map(|j| j.id).collect();
            let len = ids.len();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), len);
        }
    }

    #[test]
    fn insertion_order_survives_removal(n in 1usize..20, drop_mask in proptest::collection::vec(any::<bool>(), 20)) {
        let mut queue = JobQueue::new();
        let ids = queue.add_files((0..n).map(|i| format!("f{i}.mjpg")));
        let dropped: Vec<JobId> = ids
            .iter()
            .zip(&drop_mask)
            .filter_map(|(id, drop)| drop.then_some(*id))
            .collect();
        queue.remove(&dropped);

        let expected: Vec<JobId> = ids.into_iter().filter(|id| !dropped.contains(id)).collect();
        let actual: Vec<JobId> = queue.iter().map(|j| j.id).collect();
        prop_assert_eq!(actual, expected);
    }
}
