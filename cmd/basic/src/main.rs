//! Basic taskpool demo: a bounded pool, posted work items, and a periodic
//! timer coexisting on the same workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskpool::{rel_ms, Environment, Pool, Priority, Timer, Work};

fn main() {
    taskpool::init_logging();

    let pool = Pool::new();
    pool.set_max_threads(4);
    let env = Environment::new().with_pool(&pool);

    let completed = Arc::new(AtomicUsize::new(0));
    let c = completed.clone();
    let work = Work::new(Some(&env), move |_| {
        // Pretend to do something useful.
        std::thread::sleep(Duration::from_millis(20));
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        println!("work item {} done on {:?}", n, std::thread::current().name());
    })
    .expect("allocate work");

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let timer_env = Environment::new()
        .with_pool(&pool)
        .with_priority(Priority::High);
    let timer = Timer::new(Some(&timer_env), move |_| {
        let n = t.fetch_add(1, Ordering::SeqCst) + 1;
        println!("timer tick {}", n);
    })
    .expect("allocate timer");

    timer.set(Some(rel_ms(50)), 100, 10);

    for _ in 0..16 {
        work.post();
    }
    work.wait(false);

    std::thread::sleep(Duration::from_millis(400));
    timer.set(None, 0, 0);
    timer.wait(true);

    println!(
        "finished: {} work items, {} timer ticks",
        completed.load(Ordering::SeqCst),
        ticks.load(Ordering::SeqCst)
    );
}
