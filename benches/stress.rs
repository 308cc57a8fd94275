use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("slotdesk")
        .user("bench")
        .password("slotdesk");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// The server keeps state across runs, so every run books into its own
/// stretch of far-future dates.
fn run_base_date() -> NaiveDate {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    NaiveDate::from_ymd_opt(2100, 1, 1)
        .unwrap()
        .checked_add_days(Days::new((secs / 60) % 200_000 * 8))
        .unwrap()
}

fn day(base: NaiveDate, offset: u64) -> NaiveDate {
    base.checked_add_days(Days::new(offset)).unwrap()
}

async fn generate(client: &tokio_postgres::Client, date: NaiveDate, capacity: u32) {
    client
        .batch_execute(&format!(
            "INSERT INTO slots (start_date, end_date, capacity) VALUES ('{date}', '{date}', {capacity})"
        ))
        .await
        .unwrap();
}

fn booking_sql(n: usize, date: NaiveDate, slot: &str) -> String {
    format!(
        "INSERT INTO bookings VALUES ('Bench Customer {n}', 'bench{n}@example.com', '98{n:08}', \
         '1 Bench Street', '560001', 'Bengaluru', NULL, 'Karnataka', 'LP-100', \
         'Lily Pad Mattress', 'Lilypad', '{date}', '{slot}')"
    )
}

async fn phase1_sequential(host: &str, port: u16, date: NaiveDate) {
    let client = connect(host, port).await;
    generate(&client, date, 10_000).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(i, date, "10:00"))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for one slot. Exactly `capacity` of them may win.
async fn phase2_contention(host: &str, port: u16, date: NaiveDate) {
    let capacity = 25;
    let n_tasks = 20;
    let n_per_task = 10;

    let setup = connect(host, port).await;
    generate(&setup, date, capacity).await;

    let booked = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let booked = booked.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for j in 0..n_per_task {
                // Alternate between creating bookings and raw reservations.
                let sql = if j % 2 == 0 {
                    booking_sql(t * n_per_task + j, date, "13:00-14:00")
                } else {
                    format!(
                        "UPDATE slots SET reserved_count = reserved_count + 1 \
                         WHERE slot_date = '{date}' AND start_time = '13:00'"
                    )
                };
                match client.batch_execute(&sql).await {
                    Ok(()) => booked.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.code().map(|c| c.code()) == Some("53400") => {
                        refused.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let booked = booked.load(Ordering::Relaxed);
    let refused = refused.load(Ordering::Relaxed);
    println!(
        "  {} attempts on capacity {capacity}: {booked} booked, {refused} refused in {:.2}s",
        n_tasks * n_per_task,
        elapsed.as_secs_f64()
    );
    assert_eq!(booked, capacity as usize, "slot overbooked or underfilled");

    let rows = setup
        .simple_query(&format!("SELECT * FROM slots WHERE slot_date = '{date}'"))
        .await
        .unwrap();
    let reserved = rows.iter().find_map(|msg| match msg {
        SimpleQueryMessage::Row(row) if row.get("start_time") == Some("13:00") => {
            row.get("reserved_count").map(str::to_string)
        }
        _ => None,
    });
    assert_eq!(reserved.as_deref(), Some(capacity.to_string().as_str()));
    println!("  reserved_count = {capacity}, no overbooking");
}

async fn phase3_read_under_load(host: &str, port: u16, base: NaiveDate) {
    let setup = connect(host, port).await;
    for w in 0..5 {
        generate(&setup, day(base, w), 10_000).await;
    }
    drop(setup);

    // Writer tasks: continuously create bookings in the background
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let stop = stop.clone();
        let date = day(base, w);
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&booking_sql(i, date, "16:00")).await;
                i += 1;
            }
        }));
    }

    // Reader tasks: admin listings and dashboard stats
    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        let date = day(base, r % 5);
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut listing = Vec::with_capacity(reads_per_reader);
            let mut stats = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(
                        "SELECT * FROM bookings WHERE status = 'PENDING' AND search = 'bench' \
                         AND size = 20",
                    )
                    .await
                    .unwrap();
                listing.push(t.elapsed());

                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM booking_stats WHERE demo_date = '{date}'"
                    ))
                    .await
                    .unwrap();
                stats.push(t.elapsed());
            }
            (listing, stats)
        }));
    }

    let mut all_listing = Vec::new();
    let mut all_stats = Vec::new();
    for h in reader_handles {
        let (listing, stats) = h.await.unwrap();
        all_listing.extend(listing);
        all_stats.extend(stats);
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("booking listing", &mut all_listing);
    print_latency("booking stats", &mut all_stats);
}

async fn phase4_connection_storm(host: &str, port: u16, date: NaiveDate) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let setup = connect(host, port).await;
    generate(&setup, date, 10_000).await;
    drop(setup);

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for i in 0..ops_per_conn {
                client
                    .batch_execute(&booking_sql(c * ops_per_conn + i, date, "10:00-11:00"))
                    .await
                    .unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SLOTDESK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SLOTDESK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SLOTDESK_PORT");

    let base = run_base_date();
    println!("=== slotdesk stress benchmark ===");
    println!("target: {host}:{port}, dates from {base}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port, day(base, 0)).await;

    println!("\n[phase 2] contention on one slot");
    phase2_contention(&host, port, day(base, 1)).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, day(base, 2)).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port, day(base, 7)).await;

    println!("\n=== benchmark complete ===");
}
