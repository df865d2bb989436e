use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "petbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "petbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "petbook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "petbook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "petbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "petbook_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "petbook_wal_flush_batch_size";

/// Counter: WAL compactions run by the background compactor.
pub const WAL_COMPACTIONS_TOTAL: &str = "petbook_wal_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: availability computations that returned a result.
pub const SLOT_QUERIES_TOTAL: &str = "petbook_slot_queries_total";

/// Counter: bookings rejected because the time was taken or not offered.
pub const BOOKING_CONFLICTS_TOTAL: &str = "petbook_booking_conflicts_total";

/// Gauge: businesses currently loaded.
pub const BUSINESSES_ACTIVE: &str = "petbook_businesses_active";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on query metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBusiness { .. } => "insert_business",
        Command::DeleteBusiness { .. } => "delete_business",
        Command::InsertSchedule { .. } => "set_schedule",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertAppointmentStatus { .. } => "update_status",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectBusinesses => "select_businesses",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}
