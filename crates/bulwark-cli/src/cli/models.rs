//! `bwk models`: list the models each provider serves.

use anyhow::Result;
use console::style;

use crate::state::AppState;

pub async fn models(state: &AppState, name: Option<&str>, json: bool) -> Result<()> {
    let mut listings = Vec::new();
    for instance in state.select(name)? {
        let result = instance.list_models().await;
        listings.push((instance.name().to_string(), instance.config().model.clone(), result));
    }

    if json {
        let out: Vec<_> = listings
            .iter()
            .map(|(provider, _, result)| match result {
                Ok(models) => serde_json::json!({ "provider": provider, "models": models }),
                Err(e) => serde_json::json!({
                    "provider": provider,
                    "error": e.kind_name(),
                    "message": e.to_string(),
                }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    for (provider, configured, result) in &listings {
        println!("  {}", style(provider).cyan().bold());
        match result {
            Ok(models) if models.is_empty() => {
                println!("    {}", style("(no models reported)").dim());
            }
            Ok(models) => {
                for model in models {
                    let marker = if model == configured {
                        style("*").green().bold().to_string()
                    } else {
                        " ".to_string()
                    };
                    println!("  {marker} {model}");
                }
            }
            Err(e) => {
                println!("    {} {}", style("!").red().bold(), e);
            }
        }
        println!();
    }

    Ok(())
}
