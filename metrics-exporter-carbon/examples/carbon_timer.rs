use std::{thread, time::Duration};

use metrics_exporter_carbon::CarbonStat;

fn fib(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib(n - 1) + fib(n - 2)
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let stat = CarbonStat::builder()
        .with_remote_address("localhost:2003")
        .expect("failed to parse remote address")
        .with_namespace("example")
        .build();

    let uptime = stat.metric("uptime_secs");
    uptime.set_accumulate(true);

    let timed_fib = stat.wrap("fib", fib);

    for round in 0..10u64 {
        stat.metric("rounds").incr(1);
        uptime.add(1);

        let value = timed_fib(20 + round);
        stat.metric("fib_value").set(value);

        let mut timer = stat.timer("sleep");
        thread::sleep(Duration::from_millis(10 * round));
        if let Err(e) = timer.stop() {
            tracing::warn!(error = %e, "Timer was not running.");
        }

        let outcome = stat.flush();
        tracing::info!(?outcome, round, "Flushed.");

        thread::sleep(Duration::from_secs(1));
    }
}
