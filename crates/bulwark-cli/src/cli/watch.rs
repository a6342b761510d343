//! `bwk watch`: run the background monitor and stream status changes.

use std::time::Duration;

use anyhow::Result;
use console::style;
use tokio::sync::broadcast::error::RecvError;

use crate::state::AppState;

pub async fn watch(state: &AppState, duration: Option<Duration>, json: bool) -> Result<()> {
    let monitor = state.factory.health_monitor();
    let mut changes = monitor.subscribe();
    state.factory.start_monitoring().await;

    if !json {
        println!();
        println!(
            "  {} Watching {} provider{} every {}s. {}",
            style("*").cyan().bold(),
            state.provider_order.len(),
            if state.provider_order.len() == 1 { "" } else { "s" },
            monitor.config().check_interval().as_secs(),
            style("Press Ctrl+C to stop").dim()
        );
        println!();
    }

    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut deadline => break,
            change = changes.recv() => match change {
                Ok(change) => {
                    if json {
                        println!("{}", serde_json::to_string(&change)?);
                    } else {
                        println!(
                            "  {} {} {} -> {}",
                            style(change.timestamp.format("%H:%M:%S")).dim(),
                            style(&change.provider).cyan(),
                            change.previous,
                            style(change.current).bold()
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "status change stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    state.factory.stop_monitoring().await;
    Ok(())
}
