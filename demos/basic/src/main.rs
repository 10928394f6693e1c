use std::{sync::Arc, thread, time::Duration};

use chrono::TimeDelta;
use jobsched::{listener::JobChangeKind, prelude::*};

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let manager = JobManager::with_config(ManagerConfig::new().with_max_workers(4));
    let (sender, mut events) = tokio::sync::mpsc::unbounded_channel();
    manager.add_job_change_listener(Arc::new(sender));

    // Both writers share a rule, so they never run at the same time.
    let log_file = MutexRule::new("log-file").into_rule();
    let writers: Vec<Job> = (1..=2)
        .map(|index| {
            JobBuilder::new(format!("writer-{index}"))
                .with_rule(log_file.clone())
                .build(&manager, |job: &Job, monitor: &Monitor| {
                    monitor.begin_task(&job.name(), Some(5));
                    for _ in 0..5 {
                        if monitor.is_canceled() {
                            return ExecutionResult::cancel();
                        }
                        thread::sleep(Duration::from_millis(100));
                        monitor.worked(1);
                    }
                    monitor.done();
                    ExecutionResult::ok()
                })
                .unwrap()
        })
        .collect();

    let reporter = JobBuilder::new("reporter")
        .with_priority(Priority::Short)
        .build(&manager, |_job: &Job, _monitor: &Monitor| {
            println!("All quiet on the reporter front");
            ExecutionResult::ok()
        })
        .unwrap();

    let doomed = manager.new_job("doomed", |_job: &Job, _monitor: &Monitor| {
        ExecutionResult::error("should never run")
    });

    for writer in &writers {
        writer.schedule().unwrap();
    }
    reporter.schedule_in(TimeDelta::milliseconds(300)).unwrap();
    doomed.schedule_in(TimeDelta::seconds(10)).unwrap();
    println!("Cancelled doomed job before it ran: {}", doomed.cancel());

    let mut finished = 0;
    while let Some(event) = events.recv().await {
        println!("{} {}", event.job.name(), event.kind);
        if event.kind == JobChangeKind::Done && event.job != doomed {
            finished += 1;
            if finished == writers.len() + 1 {
                break;
            }
        }
    }

    for job in writers.iter().chain([&reporter]) {
        println!("{} finished with {:?}", job.name(), job.result());
    }
    manager.shutdown();
}
