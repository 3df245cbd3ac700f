use jobkit::{Job, JobError, JobObserver, JobOutcome, JobState, JobsConfig, Manager};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn manager(workers: usize) -> Manager {
    Manager::new(JobsConfig::new(workers).with_poll_interval(Duration::from_millis(10)))
        .expect("manager should start")
}

fn wait_for_state(job: &Job, state: JobState) {
    let deadline = Instant::now() + WAIT;
    while job.state() != state {
        assert!(Instant::now() < deadline, "job never reached {:?}", state);
        thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct Tally {
    added: AtomicUsize,
    removed: AtomicUsize,
    finished: Mutex<Vec<u64>>,
}

impl JobObserver for Tally {
    fn job_added(&self, _job: &Job) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn job_removed(&self, _job: &Job) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn job_finished(&self, job: &Job) {
        self.finished.lock().unwrap().push(job.id());
    }
}

#[test]
fn three_noop_jobs_settle_and_each_finishes_once() {
    let manager = manager(3);
    let tally = Arc::new(Tally::default());
    manager.subscribe(tally.clone());

    let jobs: Vec<Job> = (0..3).map(|_| manager.job().on_start(|_job| Ok(())).build()).collect();
    for job in &jobs {
        assert!(manager.add(job).expect("add should succeed"));
    }
    for job in &jobs {
        job.wait(WAIT).expect("job should finish");
    }

    assert_eq!(manager.num_jobs(), 0);
    assert_eq!(tally.added.load(Ordering::SeqCst), 3);

    let finished = tally.finished.lock().unwrap().clone();
    assert_eq!(finished.len(), 3);
    let unique: HashSet<u64> = finished.into_iter().collect();
    let expected: HashSet<u64> = jobs.iter().map(Job::id).collect();
    assert_eq!(unique, expected);

    manager.shutdown();
}

#[test]
fn membership_round_trips() {
    let manager = manager(1);
    let (release, gate) = mpsc::channel::<()>();
    let job = manager
        .job()
        .on_start(move |_job| {
            let _ = gate.recv_timeout(WAIT);
            Ok(())
        })
        .build();

    assert!(!manager.contains(&job));
    manager.add(&job).expect("add should succeed");
    assert!(manager.contains(&job));

    release.send(()).expect("job should be waiting");
    job.wait(WAIT).expect("job should finish");
    assert!(!manager.contains(&job));

    let removed = manager.job().build();
    let blocker = manager
        .job()
        .on_start(|_job| {
            thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .build();
    manager.add(&blocker).expect("add should succeed");
    manager.add(&removed).expect("add should succeed");
    assert!(manager.remove(&removed));
    assert!(!manager.contains(&removed));

    assert!(manager.wait_all(WAIT));
    manager.shutdown();
}

#[test]
fn cancel_while_queued_never_starts_but_finishes_once() {
    let manager = manager(1);
    let (release, gate) = mpsc::channel::<()>();
    let blocker = manager
        .job()
        .on_start(move |_job| {
            let _ = gate.recv_timeout(WAIT);
            Ok(())
        })
        .build();

    let started = Arc::new(AtomicUsize::new(0));
    let finishes = Arc::new(Mutex::new(Vec::new()));
    let queued = {
        let started = started.clone();
        let finishes = finishes.clone();
        manager
            .job()
            .on_start(move |_job| {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .on_finish(move |_job, outcome| finishes.lock().unwrap().push(outcome.clone()))
            .build()
    };

    manager.add(&blocker).expect("add should succeed");
    manager.add(&queued).expect("add should succeed");
    wait_for_state(&blocker, JobState::Running);
    assert_eq!(queued.state(), JobState::Queued);

    queued.cancel();
    queued.cancel();
    release.send(()).expect("blocker should be waiting");

    let outcome = queued.wait(WAIT).expect("job should finish");
    assert!(matches!(outcome, Some(JobOutcome::Cancelled)));
    assert_eq!(started.load(Ordering::SeqCst), 0);

    let finishes = finishes.lock().unwrap();
    assert_eq!(finishes.len(), 1);
    assert!(finishes[0].is_cancelled());

    manager.shutdown();
}

#[test]
fn self_cancel_ends_cancelled_not_failed() {
    let manager = manager(1);
    let finishes = Arc::new(AtomicUsize::new(0));
    let job = {
        let finishes = finishes.clone();
        manager
            .job()
            .on_start(|job| {
                for step in 0.. {
                    if step == 3 {
                        job.cancel();
                    }
                    job.checkpoint()?;
                    job.progress().set_value(step);
                }
                Ok(())
            })
            .on_finish(move |_job, _outcome| {
                finishes.fetch_add(1, Ordering::SeqCst);
            })
            .build()
    };

    manager.add(&job).expect("add should succeed");
    let outcome = job.wait(WAIT).expect("job should finish");

    assert!(matches!(outcome, Some(JobOutcome::Cancelled)));
    assert!(job.error().is_none());
    assert!(!job.success());
    assert_eq!(job.progress().value(), 2);
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().jobs_cancelled, 1);

    manager.shutdown();
}

#[test]
fn failing_job_captures_error_and_finishes_once() {
    let manager = manager(2);
    let finishes = Arc::new(Mutex::new(Vec::new()));
    let job = {
        let finishes = finishes.clone();
        manager
            .job()
            .name("open missing.osg")
            .on_start(|_job| {
                std::fs::read("/nonexistent/missing.osg")?;
                Ok(())
            })
            .on_finish(move |job, outcome| {
                finishes.lock().unwrap().push((job.id(), outcome.error().is_some()));
            })
            .build()
    };

    manager.add(&job).expect("add should succeed");
    job.wait(WAIT).expect("job should finish");

    assert!(job.error().is_some());
    assert!(!job.success());
    assert!(matches!(*job.error().unwrap(), JobError::Source(_)));
    assert_eq!(*finishes.lock().unwrap(), vec![(job.id(), true)]);
    assert_eq!(manager.stats().jobs_failed, 1);

    manager.shutdown();
}

#[test]
fn cross_thread_cancel_stops_polling_job() {
    let manager = manager(1);
    let job = manager
        .job()
        .on_start(|job| loop {
            job.checkpoint()?;
            thread::sleep(Duration::from_millis(2));
        })
        .build();

    manager.add(&job).expect("add should succeed");
    wait_for_state(&job, JobState::Running);
    assert_eq!(manager.num_running(), 1);

    assert!(manager.remove(&job));
    let outcome = job.wait(WAIT).expect("job should stop at its checkpoint");
    assert!(matches!(outcome, Some(JobOutcome::Cancelled)));

    manager.shutdown();
}

#[test]
fn job_ignoring_the_token_runs_to_completion() {
    let manager = manager(1);
    let steps = Arc::new(AtomicUsize::new(0));
    let job = {
        let steps = steps.clone();
        manager
            .job()
            .on_start(move |_job| {
                for _ in 0..5 {
                    steps.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
            .build()
    };

    manager.add(&job).expect("add should succeed");
    wait_for_state(&job, JobState::Running);
    job.cancel();

    let outcome = job.wait(WAIT).expect("job should finish");
    assert_eq!(steps.load(Ordering::SeqCst), 5);
    assert!(matches!(outcome, Some(JobOutcome::Cancelled)));

    manager.shutdown();
}

#[test]
fn pause_and_resume_are_cooperative() {
    let manager = manager(1);
    let steps = Arc::new(AtomicUsize::new(0));
    let job = {
        let steps = steps.clone();
        manager
            .job()
            .on_start(move |job| {
                for _ in 0..20 {
                    job.checkpoint()?;
                    steps.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(())
            })
            .build()
    };

    job.pause();
    manager.add(&job).expect("add should succeed");
    wait_for_state(&job, JobState::Running);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(steps.load(Ordering::SeqCst), 0);
    assert!(job.is_paused());

    job.resume();
    let outcome = job.wait(WAIT).expect("job should finish");
    assert!(outcome.expect("job was queued").is_success());
    assert_eq!(steps.load(Ordering::SeqCst), 20);

    manager.shutdown();
}

#[test]
fn progress_sink_is_rate_limited_on_worker() {
    let manager = Manager::new(
        JobsConfig::new(1).with_progress_interval(Duration::from_secs(60)),
    )
    .expect("manager should start");
    let notifications = Arc::new(Mutex::new(Vec::new()));
    let job = {
        let notifications = notifications.clone();
        manager
            .job()
            .bounds(0, 1000)
            .on_progress(move |job| {
                notifications
                    .lock()
                    .unwrap()
                    .push((job.progress().value(), thread::current().name().map(String::from)));
            })
            .on_start(|job| {
                for i in 0..=1000 {
                    job.progress().set_value(i);
                }
                Ok(())
            })
            .build()
    };

    manager.add(&job).expect("add should succeed");
    job.wait(WAIT).expect("job should finish");

    let notifications = notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert!(notifications[0]
        .1
        .as_deref()
        .is_some_and(|name| name.starts_with("jobs-worker-")));
    assert_eq!(job.progress().fraction(), 1.0);

    manager.shutdown();
}

#[test]
fn finish_callback_runs_on_a_worker_thread() {
    let manager = manager(1);
    let caller = thread::current().id();
    let finished_on = Arc::new(Mutex::new(None));
    let job = {
        let finished_on = finished_on.clone();
        manager
            .job()
            .on_finish(move |_job, _outcome| {
                *finished_on.lock().unwrap() = Some(thread::current().id());
            })
            .build()
    };

    manager.add(&job).expect("add should succeed");
    job.wait(WAIT).expect("job should finish");

    let finished_on = finished_on.lock().unwrap().expect("finish callback should run");
    assert_ne!(finished_on, caller);

    manager.shutdown();
}

#[test]
fn shutdown_cancels_and_drains_in_flight_jobs() {
    let manager = manager(1);
    let tally = Arc::new(Tally::default());
    manager.subscribe(tally.clone());

    let running = manager
        .job()
        .on_start(|job| loop {
            job.checkpoint()?;
            thread::sleep(Duration::from_millis(2));
        })
        .build();
    let queued: Vec<Job> = (0..3).map(|_| manager.job().build()).collect();

    manager.add(&running).expect("add should succeed");
    for job in &queued {
        manager.add(job).expect("add should succeed");
    }
    wait_for_state(&running, JobState::Running);

    manager.shutdown();

    assert_eq!(manager.num_jobs(), 0);
    assert!(running.is_done());
    assert!(queued.iter().all(|job| job.is_done() && job.is_cancelled()));
    assert_eq!(tally.removed.load(Ordering::SeqCst), 4);
    assert_eq!(tally.finished.lock().unwrap().len(), 4);
    assert!(matches!(
        manager.add(&manager.job().build()),
        Err(JobError::ShutDown)
    ));
}
