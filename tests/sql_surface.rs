use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use slotdesk::engine::Engine;
use slotdesk::wire;

// ── Test infrastructure ──────────────────────────────────────

static SERVER_SEQ: AtomicUsize = AtomicUsize::new(0);

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!(
        "slotdesk_int_test_{}_{}",
        std::process::id(),
        SERVER_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("slotdesk.wal"), 1000).unwrap());

    let engine2 = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, "slotdesk".to_string(), 2, None)
                    .await;
            });
        }
    });

    (addr, engine)
}

async fn connect_as(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("slotdesk")
        .user(user)
        .password("slotdesk");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "admin@lilypad.com").await
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().expect("server error carries a SQLSTATE").code().to_string()
}

fn booking_sql(name: &str, date: &str, slot: &str) -> String {
    format!(
        "INSERT INTO bookings (full_name, email, mobile_number, address_line, pincode, city, \
         landmark, state, product_id, product_name, product_brand, demo_date, time_slot) \
         VALUES ('{name}', '{}@example.com', '9800000001', '12 Lake Road', '560001', \
         'Bengaluru', NULL, 'Karnataka', 'LP-100', 'Lily Pad Mattress', 'Lilypad', \
         '{date}', '{slot}') RETURNING *",
        name.to_lowercase().replace(' ', ".")
    )
}

async fn book(client: &Client, name: &str, date: &str, slot: &str) -> i64 {
    let created = rows(client, &booking_sql(name, date, slot)).await;
    assert_eq!(created.len(), 1);
    created[0].get("id").unwrap().parse().unwrap()
}

async fn generate(client: &Client, date: &str) {
    client
        .batch_execute(&format!(
            "INSERT INTO slots (start_date, end_date) VALUES ('{date}', '{date}')"
        ))
        .await
        .unwrap();
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn generate_and_list_slots() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(
            "INSERT INTO slots (start_date, end_date, capacity) VALUES ('2030-01-15', '2030-01-16', 4)",
        )
        .await
        .unwrap();

    let slots = rows(&client, "SELECT * FROM slots WHERE slot_date = '2030-01-16'").await;
    let starts: Vec<&str> = slots.iter().map(|r| r.get("start_time").unwrap()).collect();
    assert_eq!(starts, vec!["10:00", "13:00", "16:00"]);
    assert_eq!(slots[0].get("end_time"), Some("11:00"));
    assert_eq!(slots[0].get("total_capacity"), Some("4"));
    assert_eq!(slots[0].get("reserved_count"), Some("0"));
    assert_eq!(slots[0].get("available"), Some("t"));

    let none = rows(&client, "SELECT * FROM slots WHERE slot_date = '2030-01-17'").await;
    assert!(none.is_empty());
}

#[tokio::test]
async fn regenerate_reports_only_new_slots() {
    let (addr, engine) = start_test_server().await;
    let client = connect(addr).await;

    let first = client
        .execute(
            "INSERT INTO slots (start_date, end_date) VALUES ('2030-01-15', '2030-01-15')",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(first, 3);

    let again = client
        .execute(
            "INSERT INTO slots (start_date, end_date) VALUES ('2030-01-15', '2030-01-16')",
            &[],
        )
        .await
        .unwrap();
    assert_eq!(again, 3);
    assert_eq!(engine.list_slots(chrono::NaiveDate::from_ymd_opt(2030, 1, 15).unwrap()).len(), 3);
}

#[tokio::test]
async fn custom_windows_and_capacity() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;

    client
        .batch_execute(
            "INSERT INTO slots (start_date, end_date, capacity, windows) \
             VALUES ('2030-01-15', '2030-01-15', 1, '09:30-10:15,18:00-19:00')",
        )
        .await
        .unwrap();

    let slots = rows(&client, "SELECT * FROM slots WHERE slot_date = '2030-01-15'").await;
    assert_eq!(slots.len(), 2);
    assert_eq!(slots[0].get("start_time"), Some("09:30"));
    assert_eq!(slots[0].get("end_time"), Some("10:15"));
    assert_eq!(slots[1].get("total_capacity"), Some("1"));
}

#[tokio::test]
async fn reserve_and_release_through_update() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;

    let reserved = rows(
        &client,
        "UPDATE slots SET reserved_count = reserved_count + 1 \
         WHERE slot_date = '2030-01-15' AND start_time = '13:00' RETURNING *",
    )
    .await;
    assert_eq!(reserved[0].get("reserved_count"), Some("1"));
    assert_eq!(reserved[0].get("remaining"), Some("1"));

    let released = rows(
        &client,
        "UPDATE slots SET reserved_count = reserved_count - 1 \
         WHERE slot_date = '2030-01-15' AND start_time = '13:00' AND end_time = '14:00' RETURNING *",
    )
    .await;
    assert_eq!(released[0].get("reserved_count"), Some("0"));

    // Releasing an empty slot is not an error.
    client
        .batch_execute(
            "UPDATE slots SET reserved_count = reserved_count - 1 \
             WHERE slot_date = '2030-01-15' AND start_time = '13:00'",
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn full_slot_reports_sqlstate() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;

    let reserve = "UPDATE slots SET reserved_count = reserved_count + 1 \
                   WHERE slot_date = '2030-01-15' AND start_time = '10:00'";
    client.batch_execute(reserve).await.unwrap();
    client.batch_execute(reserve).await.unwrap();
    assert_eq!(sqlstate(&client, reserve).await, "53400");

    let booking = booking_sql("Asha Rao", "2030-01-15", "10:00-11:00");
    assert_eq!(sqlstate(&client, &booking).await, "53400");
}

#[tokio::test]
async fn booking_lifecycle_over_the_wire() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;

    let id = book(&client, "Asha Rao", "2030-01-15", "10:00").await;

    let fetched = rows(&client, &format!("SELECT * FROM bookings WHERE id = {id}")).await;
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].get("status"), Some("PENDING"));
    assert_eq!(fetched[0].get("time_slot"), Some("10:00-11:00"));
    assert_eq!(fetched[0].get("landmark"), None);

    let slots = rows(&client, "SELECT * FROM slots WHERE slot_date = '2030-01-15'").await;
    assert_eq!(slots[0].get("reserved_count"), Some("1"));

    let rejected = rows(
        &client,
        &format!(
            "UPDATE bookings SET status = 'REJECTED', admin_comments = 'outside service area' \
             WHERE id = {id} RETURNING *"
        ),
    )
    .await;
    assert_eq!(rejected[0].get("status"), Some("REJECTED"));
    assert_eq!(rejected[0].get("admin_comments"), Some("outside service area"));
    assert_eq!(rejected[0].get("processed_by"), Some("admin@lilypad.com"));
    assert!(rejected[0].get("rejected_on").is_some());
    assert_eq!(rejected[0].get("approved_on"), None);

    let slots = rows(&client, "SELECT * FROM slots WHERE slot_date = '2030-01-15'").await;
    assert_eq!(slots[0].get("reserved_count"), Some("0"));
}

#[tokio::test]
async fn explicit_processed_by_wins_over_login() {
    let (addr, _engine) = start_test_server().await;
    let client = connect_as(addr, "console").await;
    generate(&client, "2030-01-15").await;
    let id = book(&client, "Ravi K", "2030-01-15", "16:00-17:00").await;

    let approved = rows(
        &client,
        &format!(
            "UPDATE bookings SET status = 'APPROVED', processed_by = 'ops@lilypad.com' \
             WHERE id = {id} RETURNING *"
        ),
    )
    .await;
    assert_eq!(approved[0].get("status"), Some("APPROVED"));
    assert_eq!(approved[0].get("processed_by"), Some("ops@lilypad.com"));
    assert!(approved[0].get("approved_on").is_some());
}

#[tokio::test]
async fn second_decision_is_invalid_transition() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;
    let id = book(&client, "Asha Rao", "2030-01-15", "10:00").await;

    client
        .batch_execute(&format!("UPDATE bookings SET status = 'APPROVED' WHERE id = {id}"))
        .await
        .unwrap();
    let code = sqlstate(
        &client,
        &format!("UPDATE bookings SET status = 'REJECTED' WHERE id = {id}"),
    )
    .await;
    assert_eq!(code, "55000");
}

#[tokio::test]
async fn listing_filters_and_pages() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    client
        .batch_execute(
            "INSERT INTO slots (start_date, end_date, capacity) VALUES ('2030-01-15', '2030-01-15', 10)",
        )
        .await
        .unwrap();

    let asha = book(&client, "Asha Rao", "2030-01-15", "10:00").await;
    book(&client, "Ravi K", "2030-01-15", "13:00").await;
    book(&client, "Meera Iyer", "2030-01-15", "16:00").await;
    client
        .batch_execute(&format!("UPDATE bookings SET status = 'APPROVED' WHERE id = {asha}"))
        .await
        .unwrap();

    let all = rows(&client, "SELECT * FROM bookings WHERE sort_by = 'id' AND sort_direction = 'ASC'").await;
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].get("id"), Some(asha.to_string().as_str()));
    assert_eq!(all[0].get("total_elements"), Some("3"));

    let pending = rows(&client, "SELECT * FROM bookings WHERE status = 'PENDING'").await;
    assert_eq!(pending.len(), 2);

    let search = rows(&client, "SELECT * FROM bookings WHERE search = 'MEERA'").await;
    assert_eq!(search.len(), 1);
    assert_eq!(search[0].get("full_name"), Some("Meera Iyer"));

    let page = rows(
        &client,
        "SELECT * FROM bookings WHERE page = 1 AND size = 2 AND sort_by = 'id' AND sort_direction = 'ASC'",
    )
    .await;
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].get("total_pages"), Some("2"));

    let past_end = rows(&client, "SELECT * FROM bookings WHERE page = 9 AND size = 2").await;
    assert!(past_end.is_empty());
}

#[tokio::test]
async fn stats_for_a_day() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;
    generate(&client, "2030-01-16").await;

    let a = book(&client, "Asha Rao", "2030-01-15", "10:00").await;
    let b = book(&client, "Ravi K", "2030-01-15", "13:00").await;
    book(&client, "Meera Iyer", "2030-01-16", "10:00").await;
    client
        .batch_execute(&format!("UPDATE bookings SET status = 'APPROVED' WHERE id = {a}"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("UPDATE bookings SET status = 'REJECTED' WHERE id = {b}"))
        .await
        .unwrap();

    let stats = rows(&client, "SELECT * FROM booking_stats WHERE demo_date = '2030-01-15'").await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].get("demo_date"), Some("2030-01-15"));
    assert_eq!(stats[0].get("total"), Some("3"));
    assert_eq!(stats[0].get("pending"), Some("1"));
    assert_eq!(stats[0].get("approved"), Some("1"));
    assert_eq!(stats[0].get("rejected"), Some("1"));
    assert_eq!(stats[0].get("scheduled_on_day"), Some("1"));
}

#[tokio::test]
async fn error_codes_by_kind() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;

    assert_eq!(sqlstate(&client, "SELECT * FROM bookings WHERE id = 999").await, "P0002");
    assert_eq!(
        sqlstate(&client, &booking_sql("Asha Rao", "2030-01-15", "11:00")).await,
        "P0002"
    );
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO slots (start_date, end_date) VALUES ('2030-01-16', '2030-01-15')"
        )
        .await,
        "22023"
    );
    assert_eq!(
        sqlstate(
            &client,
            "INSERT INTO slots (start_date, end_date) VALUES ('2030-01-01', '2032-01-01')"
        )
        .await,
        "54000"
    );
    assert_eq!(sqlstate(&client, "SELECT * FROM bookings WHERE size = 500").await, "54000");
    assert_eq!(sqlstate(&client, "DELETE FROM bookings").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM customers").await, "42601");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;
    let id = book(&client, "Asha Rao", "2030-01-15", "10:00").await;

    let id_text = id.to_string();
    let found = client
        .execute("SELECT * FROM bookings WHERE id = $1", &[&id_text])
        .await
        .unwrap();
    assert_eq!(found, 1);

    let updated = client
        .execute(
            "UPDATE bookings SET status = 'REJECTED', admin_comments = $2 WHERE id = $1",
            &[&id_text, &"customer's request"],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let fetched = rows(&client, &format!("SELECT * FROM bookings WHERE id = {id}")).await;
    assert_eq!(fetched[0].get("admin_comments"), Some("customer's request"));
}

#[tokio::test]
async fn bound_comment_may_contain_placeholder_text() {
    let (addr, _engine) = start_test_server().await;
    let client = connect(addr).await;
    generate(&client, "2030-01-15").await;
    let id = book(&client, "Asha Rao", "2030-01-15", "10:00").await;

    let id_text = id.to_string();
    let updated = client
        .execute(
            "UPDATE bookings SET status = 'REJECTED', admin_comments = $2 WHERE id = $1",
            &[&id_text, &"refund $1 later"],
        )
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let fetched = rows(&client, &format!("SELECT * FROM bookings WHERE id = {id}")).await;
    assert_eq!(fetched[0].get("status"), Some("REJECTED"));
    assert_eq!(fetched[0].get("admin_comments"), Some("refund $1 later"));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = std::env::temp_dir().join(format!("slotdesk_int_restart_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join("slotdesk.wal");
    let day = chrono::NaiveDate::from_ymd_opt(2030, 1, 15).unwrap();

    {
        let engine = Engine::new(wal_path.clone(), 1000).unwrap();
        let windows = slotdesk::model::default_windows();
        engine.generate_slots(day, day, &windows, 2).unwrap();
        let key = engine.resolve_slot(day, windows[0].start).unwrap();
        engine.reserve_slot(key).unwrap();
        engine.compact_wal().unwrap();
    }

    let engine = Engine::new(wal_path, 1000).unwrap();
    let slots = engine.list_slots(day);
    assert_eq!(slots.len(), 3);
    assert_eq!(slots[0].reserved_count, 1);
}
