use std::net::SocketAddr;

use crate::sql::{Command, SlotAdjustment};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotdesk_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotdesk_connections_rejected_total";

/// Histogram: WAL append + fsync duration in seconds.
pub const WAL_APPEND_DURATION_SECONDS: &str = "slotdesk_wal_append_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: slots newly created by generation.
pub const SLOTS_GENERATED_TOTAL: &str = "slotdesk_slots_generated_total";

/// Counter: reservation attempts. Labels: outcome (ok, full).
pub const RESERVATIONS_TOTAL: &str = "slotdesk_reservations_total";

/// Counter: slot units given back, by release or reject.
pub const RELEASES_TOTAL: &str = "slotdesk_releases_total";

/// Counter: bookings created.
pub const BOOKINGS_CREATED_TOTAL: &str = "slotdesk_bookings_created_total";

/// Counter: admin decisions. Labels: decision (approve, reject).
pub const DECISIONS_TOTAL: &str = "slotdesk_decisions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::warn!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::GenerateSlots { .. } => "generate_slots",
        Command::SelectSlots { .. } => "select_slots",
        Command::AdjustSlot {
            adjustment: SlotAdjustment::Reserve,
            ..
        } => "reserve_slot",
        Command::AdjustSlot {
            adjustment: SlotAdjustment::Release,
            ..
        } => "release_slot",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::DecideBooking { .. } => "decide_booking",
        Command::SelectStats { .. } => "select_stats",
    }
}
