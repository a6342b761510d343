//! `bwk metrics`: retry, breaker and health counters per provider.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::cli::{status_color, truncate};
use crate::state::AppState;

pub async fn metrics(state: &AppState, json: bool) -> Result<()> {
    let report = state.coordinator.get_comprehensive_metrics();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Provider").fg(Color::White),
        Cell::new("Circuit").fg(Color::White),
        Cell::new("Calls").fg(Color::White),
        Cell::new("Failed").fg(Color::White),
        Cell::new("Retries").fg(Color::White),
        Cell::new("Rejected").fg(Color::White),
        Cell::new("Failure Rate").fg(Color::White),
        Cell::new("Last Error").fg(Color::White),
    ]);
    for (name, m) in &report.providers {
        let circuit = m.circuit.state.to_string();
        table.add_row(vec![
            Cell::new(name).fg(Color::Cyan),
            Cell::new(&circuit).fg(status_color(&circuit)),
            Cell::new(m.total_operations).fg(Color::White),
            Cell::new(m.failed_operations).fg(Color::White),
            Cell::new(m.total_retries).fg(Color::White),
            Cell::new(m.circuit.rejected_requests).fg(Color::White),
            Cell::new(format!("{:.1}%", m.circuit.failure_rate() * 100.0)).fg(Color::White),
            Cell::new(truncate(m.last_error.as_deref().unwrap_or("-"), 40)).fg(Color::DarkGrey),
        ]);
    }
    println!("{table}");
    println!();

    let strategy = &report.fallback_strategy;
    println!(
        "  {} {} (depth {})",
        style("Fallback:").bold(),
        if strategy.preference.is_empty() {
            "-".to_string()
        } else {
            strategy.preference.join(" -> ")
        },
        strategy.max_fallback_depth
    );
    println!(
        "  {} {:.0}% average availability",
        style("Health:").bold(),
        report.health.average_availability * 100.0
    );
    println!();

    Ok(())
}
