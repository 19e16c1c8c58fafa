use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mirrorline_core::{ConnectionId, InstanceId};
use mirrorline_page::{ConnectionConfig, EnqueueOutcome, LossAction, PageConnection};
use mirrorline_sim::scenarios::{practical_baseline, run_producers, ConcurrencyTrackingSink};

fn parse_arg(args: &[String], name: &str) -> Option<usize> {
    args.windows(2)
        .find(|pair| pair[0] == name)
        .and_then(|pair| pair[1].parse().ok())
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let mut scenario = practical_baseline();
    if let Some(producers) = parse_arg(&args, "--producers") {
        scenario.producers = producers;
    }
    if let Some(batches) = parse_arg(&args, "--batches") {
        scenario.batches_per_producer = batches;
    }
    if let Some(task_len) = parse_arg(&args, "--task-len") {
        scenario.task_len = task_len;
    }
    let lossless = args.iter().any(|arg| arg == "--lossless");
    let limit = parse_arg(&args, "--buffer-limit").unwrap_or(64 * 1024);

    let config = ConnectionConfig {
        output_buffer_limit: limit,
        output_buffer_timeout: Duration::from_secs(5),
        loss_action: lossless.then(|| LossAction::with_recovery_task(b"reload".to_vec())),
        ..ConnectionConfig::default()
    };
    let connection = match PageConnection::open(ConnectionId(1), InstanceId::from("bench"), config)
    {
        Ok(connection) => Arc::new(connection),
        Err(err) => {
            eprintln!("failed to open connection: {err}");
            std::process::exit(1);
        }
    };
    let sink = Arc::new(ConcurrencyTrackingSink::new(Duration::ZERO));
    connection.attach_sink(sink.clone());

    let started = Instant::now();
    let outcomes = run_producers(&connection, scenario);
    let elapsed = started.elapsed();

    let queued = outcomes
        .iter()
        .filter(|outcome| **outcome == EnqueueOutcome::Queued)
        .count();
    let frames = sink.frames().len();
    let stats = connection.output_stats();
    println!("producers={} batches={} queued={queued}", scenario.producers, outcomes.len());
    println!(
        "frames={frames} expected={} elapsed_ms={} frames_per_sec={:.0}",
        scenario.total_tasks(),
        elapsed.as_millis(),
        frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "peak_in_flight={} outstanding_bytes={} bypasses={} timeouts={}",
        sink.peak_in_flight(),
        stats.outstanding_bytes(),
        stats.bypasses,
        stats.timeouts
    );
}
