//! `bwk status`: lifecycle, circuit and health overview.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use crate::cli::{status_color, truncate};
use crate::state::AppState;

pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let report = state.factory.get_factory_status();

    if json {
        let failed: Vec<_> = state
            .failed
            .iter()
            .map(|(name, error)| serde_json::json!({ "provider": name, "error": error }))
            .collect();
        let out = serde_json::json!({
            "config_path": state.config_path().display().to_string(),
            "status": report,
            "failed": failed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("Provider Status").bold());
    println!(
        "  {}",
        style(format!("config: {}", state.config_path().display())).dim()
    );
    println!();

    if report.providers.is_empty() && state.failed.is_empty() {
        println!(
            "  {} No providers configured. Add a {} entry to the config file.",
            style("i").blue().bold(),
            style("[[providers]]").cyan()
        );
        println!();
        return Ok(());
    }

    let monitor = state.factory.health_monitor();
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Provider").fg(Color::White),
        Cell::new("Kind").fg(Color::White),
        Cell::new("Model").fg(Color::White),
        Cell::new("State").fg(Color::White),
        Cell::new("Circuit").fg(Color::White),
        Cell::new("Health").fg(Color::White),
        Cell::new("Availability").fg(Color::White),
        Cell::new("Last Error").fg(Color::White),
    ]);

    for summary in &report.providers {
        let state_str = summary.state.to_string();
        let circuit = summary
            .circuit_state
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        let health = monitor.get_provider_health(&summary.name);
        let (health_str, availability, last_error) = match &health {
            Some(metrics) => (
                metrics.status.to_string(),
                format!("{:.0}%", metrics.availability_rate * 100.0),
                metrics.last_error.clone().unwrap_or_else(|| "-".to_string()),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string()),
        };

        table.add_row(vec![
            Cell::new(&summary.name).fg(Color::Cyan),
            Cell::new(summary.kind.to_string()).fg(Color::DarkGrey),
            Cell::new(&summary.model).fg(Color::DarkGrey),
            Cell::new(&state_str).fg(status_color(&state_str)),
            Cell::new(&circuit).fg(status_color(&circuit)),
            Cell::new(&health_str).fg(status_color(&health_str)),
            Cell::new(availability).fg(Color::White),
            Cell::new(truncate(&last_error, 40)).fg(Color::DarkGrey),
        ]);
    }

    for (name, error) in &state.failed {
        table.add_row(vec![
            Cell::new(name).fg(Color::Cyan),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new("failed").fg(Color::Red),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new("-").fg(Color::DarkGrey),
            Cell::new(truncate(error, 40)).fg(Color::DarkGrey),
        ]);
    }

    println!("{table}");
    println!();
    let health = &report.health;
    println!(
        "  {} provider{}: {} healthy, {} degraded, {} unhealthy, {} unknown",
        style(report.total_providers).bold(),
        if report.total_providers == 1 { "" } else { "s" },
        style(health.healthy).green(),
        style(health.degraded).yellow(),
        style(health.unhealthy).red(),
        style(health.unknown).dim(),
    );
    let kinds: Vec<String> = report.registered_kinds.clone();
    println!("  {}", style(format!("adapters: {}", kinds.join(", "))).dim());
    println!();

    Ok(())
}
