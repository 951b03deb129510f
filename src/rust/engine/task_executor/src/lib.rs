// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! A small durable-ish task runtime with two independent lanes and
//! countdown-based rescheduling, standing in for the two dedicated worker
//! queues (`command`, `monitor`) that this system's job-control tasks are
//! routed across. A task that needs to retry later returns
//! [`TaskOutcome::Retry`] and hands back its own (possibly updated) state;
//! the runtime re-enqueues it after the delay, rather than the task looping
//! or sleeping itself. A task that needs to enqueue a successor (the next
//! step of a job, or a sibling observer) does so through the
//! [`TaskRuntime`] handle it's given, never through a global queue.
//!
//! Task bodies are responsible for their own idempotence: nothing here
//! deduplicates retries of the same logical unit of work.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::time::DelayQueue;

/// Which of the two independent worker pools a task runs on. Mirrors the
/// `command`/`monitor` routing of this system's task queues: job submission
/// and termination commands run on [`Lane::Command`], the long-lived
/// polling loops (process and queue monitors) run on [`Lane::Monitor`], so
/// that a backlog of slow monitor polls never starves new submissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lane {
    Command,
    Monitor,
}

/// The result of a single tick of a task's `run` method.
pub enum TaskOutcome {
    /// The task is finished; it will not run again.
    Done,
    /// Re-run `task` after `after` elapses, on the lane it was already
    /// running on. Mirrors `task.retry(countdown=..)` in the system this is
    /// modeled on: the tick simply returns rather than raising, so a retry
    /// is never logged as a failure.
    Retry {
        task: Box<dyn Task>,
        after: Duration,
    },
}

/// A unit of work. `run` takes `self` by boxed value so that a `Retry`
/// result can move the same task back onto the queue without cloning it.
#[async_trait]
pub trait Task: Send + 'static {
    /// A short human-readable label, used only for logging.
    fn label(&self) -> String;

    async fn run(self: Box<Self>, rt: &TaskRuntime) -> TaskOutcome;
}

struct Envelope {
    task: Box<dyn Task>,
    lane: Lane,
    delay: Option<Duration>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope({:?}, {})", self.lane, self.task.label())
    }
}

/// Handle through which task bodies enqueue follow-up work. Cheaply
/// `Clone`-able; every clone feeds the same two lane workers.
#[derive(Clone)]
pub struct TaskRuntime {
    command: mpsc::UnboundedSender<Envelope>,
    monitor: mpsc::UnboundedSender<Envelope>,
}

impl TaskRuntime {
    /// Spawns the two lane workers onto `tasks`, returning a handle used to
    /// enqueue work. Each lane worker runs until its sender side (every
    /// clone of the returned handle) is dropped.
    pub fn start(tasks: &mut JoinSet<()>) -> TaskRuntime {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();

        let rt = TaskRuntime {
            command: command_tx,
            monitor: monitor_tx,
        };

        tasks.spawn(run_lane(rt.clone(), Lane::Command, command_rx));
        tasks.spawn(run_lane(rt.clone(), Lane::Monitor, monitor_rx));
        rt
    }

    fn sender(&self, lane: Lane) -> &mpsc::UnboundedSender<Envelope> {
        match lane {
            Lane::Command => &self.command,
            Lane::Monitor => &self.monitor,
        }
    }

    pub fn enqueue(&self, lane: Lane, task: Box<dyn Task>) {
        let label = task.label();
        let envelope = Envelope {
            task,
            lane,
            delay: None,
        };
        if self.sender(lane).send(envelope).is_err() {
            log::warn!("task `{label}` enqueued on {lane:?} after the runtime shut down");
        }
    }

    pub fn enqueue_after(&self, lane: Lane, task: Box<dyn Task>, after: Duration) {
        let label = task.label();
        let envelope = Envelope {
            task,
            lane,
            delay: Some(after),
        };
        if self.sender(lane).send(envelope).is_err() {
            log::warn!("task `{label}` rescheduled on {lane:?} after the runtime shut down");
        }
    }
}

async fn run_lane(rt: TaskRuntime, lane: Lane, mut immediate_rx: mpsc::UnboundedReceiver<Envelope>) {
    log::debug!("starting task runtime lane {lane:?}");
    let mut delayed: DelayQueue<Envelope> = DelayQueue::new();
    let mut running: JoinSet<Result<(), String>> = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            envelope = immediate_rx.recv() => {
                match envelope {
                    Some(envelope) if envelope.delay.is_some() => {
                        let after = envelope.delay.unwrap_or_default();
                        delayed.insert(envelope, after);
                    }
                    Some(envelope) => {
                        let rt = rt.clone();
                        running.spawn(drive(rt, envelope));
                    }
                    None => break,
                }
            }

            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                let rt = rt.clone();
                running.spawn(drive(rt, expired.into_inner()));
            }

            Some(join_result) = running.join_next(), if !running.is_empty() => {
                match join_result {
                    Ok(Ok(())) => {}
                    Ok(Err(label)) => log::error!("task `{label}` on {lane:?} panicked"),
                    Err(err) => log::error!("a task on lane {lane:?} could not be joined: {err}"),
                }
            }
        }
    }
    log::debug!("task runtime lane {lane:?} shut down");
}

async fn drive(rt: TaskRuntime, envelope: Envelope) -> Result<(), String> {
    let Envelope { task, lane, .. } = envelope;
    let label = task.label();
    match task.run(&rt).await {
        TaskOutcome::Done => {
            log::trace!("task `{label}` on {lane:?} completed");
        }
        TaskOutcome::Retry { task, after } => {
            log::trace!("task `{label}` on {lane:?} rescheduled after {after:?}");
            rt.enqueue_after(lane, task, after);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountToThree {
        attempts: Arc<AtomicUsize>,
        done_tx: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl Task for CountToThree {
        fn label(&self) -> String {
            "count-to-three".to_string()
        }

        async fn run(self: Box<Self>, _rt: &TaskRuntime) -> TaskOutcome {
            let attempts = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts < 3 {
                TaskOutcome::Retry {
                    task: self,
                    after: Duration::from_millis(5),
                }
            } else {
                let _ = self.done_tx.send(());
                TaskOutcome::Done
            }
        }
    }

    #[tokio::test]
    async fn retried_task_eventually_completes() {
        let mut tasks = JoinSet::new();
        let rt = TaskRuntime::start(&mut tasks);
        let attempts = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        rt.enqueue(
            Lane::Command,
            Box::new(CountToThree {
                attempts: Arc::clone(&attempts),
                done_tx,
            }),
        );

        tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("task should complete before the test timeout")
            .expect("done channel should not close early");

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn independent_lanes_both_make_progress() {
        let mut tasks = JoinSet::new();
        let rt = TaskRuntime::start(&mut tasks);

        let (command_done_tx, mut command_done_rx) = mpsc::unbounded_channel();
        let (monitor_done_tx, mut monitor_done_rx) = mpsc::unbounded_channel();

        rt.enqueue(
            Lane::Command,
            Box::new(CountToThree {
                attempts: Arc::new(AtomicUsize::new(0)),
                done_tx: command_done_tx,
            }),
        );
        rt.enqueue(
            Lane::Monitor,
            Box::new(CountToThree {
                attempts: Arc::new(AtomicUsize::new(0)),
                done_tx: monitor_done_tx,
            }),
        );

        tokio::time::timeout(Duration::from_secs(5), command_done_rx.recv())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), monitor_done_rx.recv())
            .await
            .unwrap();
    }
}
