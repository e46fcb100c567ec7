use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_carbon::CarbonStatBuilder;

fn main() {
    tracing_subscriber::fmt::init();

    let flusher = CarbonStatBuilder::from_env()
        .expect("failed to read configuration from environment")
        .with_flush_interval(Duration::from_secs(1))
        .with_telemetry(true)
        .install()
        .expect("failed to install Carbon recorder");

    counter!("idle_metric").increment(1);
    gauge!("testing").set(42.0);

    let server_loops = counter!("tcp_server_loops", "system" => "foo");
    let server_loops_delta_secs = histogram!("tcp_server_loop_delta_secs", "system" => "foo");

    // Pretend to do some work for a while.
    for i in 0..50u32 {
        server_loops.increment(1);
        server_loops_delta_secs.record(f64::from(i % 7) / 10.0);

        let gauge = gauge!("lucky_iterations");
        if i % 4 == 0 {
            gauge.decrement(1.0);
        } else {
            gauge.increment(1.0);
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    flusher.shutdown();
}
