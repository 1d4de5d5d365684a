//! Prometheus metrics export

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::events::PositionEvent;
use crate::risk::GateResult;

pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metrics();
    info!("Prometheus metrics server started on {}", addr);
    Ok(())
}

fn register_metrics() {
    // Lifecycle
    describe_counter!("options_pilot_positions_opened_total", "Entry orders submitted");
    describe_counter!("options_pilot_positions_filled_total", "Entries confirmed filled");
    describe_counter!("options_pilot_positions_closed_total", "Positions closed, by exit reason");
    describe_counter!("options_pilot_positions_voided_total", "Unfilled entries voided");
    describe_counter!("options_pilot_entries_failed_total", "Entries that never filled");
    describe_counter!("options_pilot_reductions_total", "Partial closes");
    describe_counter!("options_pilot_stop_adjustments_total", "Accepted stop ratchets");
    describe_counter!("options_pilot_exit_failures_total", "Exit sells that failed and will retry");
    describe_counter!("options_pilot_expiry_warnings_total", "Same-day expiry warnings sent");

    // Risk
    describe_counter!("options_pilot_gate_rejections_total", "Failed safety gates, by gate");

    // Advisor
    describe_counter!("options_pilot_ai_calls_total", "AI arbitration calls, by outcome");

    // P&L
    describe_histogram!("options_pilot_realized_pnl_usd", "Realized P&L per closed position");

    // System
    describe_gauge!("options_pilot_active_agents", "Live position agents");
}

pub fn record_gate_rejections(result: &GateResult) {
    for failure in &result.failures {
        counter!("options_pilot_gate_rejections_total", "gate" => failure.gate.as_str()).increment(1);
    }
}

pub fn record_ai_call(success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!("options_pilot_ai_calls_total", "outcome" => outcome).increment(1);
}

pub fn record_active_agents(count: usize) {
    gauge!("options_pilot_active_agents").set(count as f64);
}

/// Leading token of a close reason, e.g. `STOP_HIT` from `STOP_HIT: 0.99 <= stop 1.00`
pub fn exit_reason_label(reason: &str) -> String {
    reason
        .split(|c: char| c == ':' || c.is_whitespace())
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("UNKNOWN")
        .to_string()
}

pub fn record_event(event: &PositionEvent) {
    match event {
        PositionEvent::Opened { .. } => {
            counter!("options_pilot_positions_opened_total").increment(1);
        }
        PositionEvent::Filled { .. } => {
            counter!("options_pilot_positions_filled_total").increment(1);
        }
        PositionEvent::Reduced { .. } => {
            counter!("options_pilot_reductions_total").increment(1);
        }
        PositionEvent::StopAdjusted { .. } => {
            counter!("options_pilot_stop_adjustments_total").increment(1);
        }
        PositionEvent::ExpiryWarning { .. } => {
            counter!("options_pilot_expiry_warnings_total").increment(1);
        }
        PositionEvent::Closed {
            reason,
            realized_pnl,
            ..
        } => {
            counter!("options_pilot_positions_closed_total", "reason" => exit_reason_label(reason))
                .increment(1);
            histogram!("options_pilot_realized_pnl_usd").record(*realized_pnl);
        }
        PositionEvent::Voided { .. } => {
            counter!("options_pilot_positions_voided_total").increment(1);
        }
        PositionEvent::Failed { .. } => {
            counter!("options_pilot_entries_failed_total").increment(1);
        }
        PositionEvent::ExitFailed { .. } => {
            counter!("options_pilot_exit_failures_total").increment(1);
        }
    }
}
