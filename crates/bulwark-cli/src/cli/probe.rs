//! `bwk probe`: run health probes immediately.

use anyhow::Result;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use bulwark_types::health::HealthCheckResult;

use crate::cli::{status_color, truncate};
use crate::state::AppState;

pub async fn probe(state: &AppState, name: Option<&str>, json: bool) -> Result<()> {
    let mut results: Vec<HealthCheckResult> = Vec::new();
    for instance in state.select(name)? {
        // Also moves the instance among active/degraded/unhealthy.
        results.push(state.factory.refresh_provider_health(instance.name()).await?);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    println!();
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Provider").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Latency").fg(Color::White),
        Cell::new("Error").fg(Color::White),
    ]);
    for result in &results {
        let status = result.status.to_string();
        table.add_row(vec![
            Cell::new(&result.provider).fg(Color::Cyan),
            Cell::new(&status).fg(status_color(&status)),
            Cell::new(format!("{}ms", result.latency_ms)).fg(Color::White),
            Cell::new(truncate(result.error.as_deref().unwrap_or("-"), 50)).fg(Color::DarkGrey),
        ]);
    }
    println!("{table}");

    let usable = results.iter().filter(|r| r.status.is_usable()).count();
    println!();
    println!(
        "  {}/{} provider{} usable",
        style(usable).bold(),
        results.len(),
        if results.len() == 1 { "" } else { "s" }
    );
    println!();

    Ok(())
}
