use jobfiber::{Affinity, Fiber, FiberScheduler, JobSystem, SleepManager, job_fn};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn main() {
    jobfiber::trace::init();
    println!("jobfiber - job scheduler and fiber scheduler demo\n");

    let num_threads = 4;
    let system = match JobSystem::new(num_threads) {
        Ok(system) => system,
        Err(err) => {
            eprintln!("failed to start job system: {err}");
            std::process::exit(1);
        }
    };
    println!("Initialized job system with {num_threads} worker threads\n");

    // Example 1: Parallel jobs
    println!("Example 1: Parallel computation");
    let sum = Arc::new(AtomicUsize::new(0));
    let num_jobs = 100;
    let start = Instant::now();
    let ids = system.run_multiple((0..num_jobs).map(|i| {
        let sum = sum.clone();
        move |_: &jobfiber::JobContext<'_>| {
            let local: usize = (0..1000).sum();
            std::hint::black_box(local);
            sum.fetch_add(i, Ordering::SeqCst);
        }
    }));
    system.wait_all(&ids);
    let expected: usize = (0..num_jobs).sum();
    println!("  Executed {num_jobs} jobs in {:?}", start.elapsed());
    println!("  Sum result: {} (expected: {expected})\n", sum.load(Ordering::SeqCst));

    // Example 2: Dependencies and parent/child
    println!("Example 2: Dependency chain and parent/child completion");
    let order = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str| {
        let order = order.clone();
        job_fn(move |_| order.lock().unwrap_or_else(|e| e.into_inner()).push(name))
    };
    let parent = system.submit(step("parent"), Affinity::Any);
    let load = system.submit(step("load"), Affinity::Any);
    let decode = system.submit(step("decode"), Affinity::Any);
    let upload = system.submit(step("upload"), Affinity::Any);
    for child in [load, decode, upload] {
        system.add_child(parent, child).ok();
    }
    system.depends_on(decode, load).ok();
    system.depends_on(upload, decode).ok();
    for id in [parent, load, decode, upload] {
        system.finalize(id).ok();
    }
    system.wait(parent);
    println!("  Completion order: {:?}\n", order.lock().unwrap_or_else(|e| e.into_inner()));

    // Example 3: A job pinned to one worker
    println!("Example 3: Affinity");
    let tokens = system.worker_tokens();
    if let Some(&target) = tokens.last() {
        let pinned = system
            .add_finalized(
                job_fn(move |cx| println!("  pinned job ran on {} (wanted {target})", cx.thread())),
                None,
                None,
                Affinity::Only(target),
            )
            .ok();
        if let Some(pinned) = pinned {
            while !system.is_done(pinned) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
    println!();

    // Example 4: Fibers driven from inside a job
    println!("Example 4: Fibers with a sleep manager");
    let report = Arc::new(Mutex::new(Vec::new()));
    let fiber_report = report.clone();
    let fibers = system.run(move |_| {
        let mut scheduler = FiberScheduler::default();
        let sleep = SleepManager::new();
        sleep.spawn(&mut scheduler);
        let local = Rc::new(RefCell::new(Vec::new()));

        for (name, millis) in [("c", 30u64), ("a", 10), ("b", 20)] {
            let sleep = sleep.clone();
            let local = local.clone();
            scheduler.add(
                Fiber::new(move |cx| {
                    cx.yield_now();
                    sleep.sleep_for(cx, Duration::from_millis(millis));
                    local.borrow_mut().push(format!("{name} woke after {millis}ms"));
                })
                .named(name),
            );
        }

        while local.borrow().len() < 3 {
            scheduler.update(Duration::from_millis(5));
        }
        scheduler.stop();
        fiber_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(local.borrow_mut().drain(..));
    });
    system.wait(fibers);
    for line in report.lock().unwrap_or_else(|e| e.into_inner()).iter() {
        println!("  {line}");
    }
    println!();

    println!("Completed jobs: {}", system.completed_jobs());
    match system.shutdown() {
        Ok(()) => println!("Job system shut down cleanly"),
        Err(err) => eprintln!("shutdown failed: {err}"),
    }
}
