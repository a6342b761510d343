//! `bwk generate`: one chat completion, optionally across the fallback chain.

use anyhow::Result;
use console::style;

use bulwark_types::llm::{ChatMessage, GenerationResponse};

use crate::state::AppState;

pub async fn generate(
    state: &AppState,
    prompt: &str,
    provider: Option<&str>,
    system: Option<&str>,
    fallback: bool,
    verbose: bool,
    json: bool,
) -> Result<()> {
    let messages = build_messages(prompt, system);
    let primary = match provider {
        Some(name) => name,
        None => state.default_provider()?,
    };

    let response = if fallback {
        state
            .coordinator
            .chat_completion_with_fallback(primary, &messages)
            .await?
    } else {
        let instance = state.select(Some(primary))?.remove(0);
        instance.chat_completion(&messages).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.content);
    if verbose {
        print_details(primary, &response);
    }
    Ok(())
}

fn build_messages(prompt: &str, system: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));
    messages
}

fn print_details(primary: &str, response: &GenerationResponse) {
    eprintln!();
    if response.provider != primary {
        eprintln!(
            "  {} answered by fallback provider {}",
            style("!").yellow().bold(),
            style(&response.provider).cyan()
        );
    }
    eprintln!(
        "  {}",
        style(format!(
            "{} / {} | {}ms | {} in, {} out | request {}",
            response.provider,
            response.model,
            response.latency_ms,
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            response.annotations.request_id,
        ))
        .dim()
    );
    if let Some(tag) = &response.annotations.policy_tag {
        eprintln!("  {}", style(format!("policy: {tag}")).dim());
    }
}

#[cfg(test)]
mod tests {
    use bulwark_types::llm::MessageRole;

    use super::*;

    #[test]
    fn test_build_messages_with_system() {
        let messages = build_messages("hi", Some("be brief"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::System);
        assert_eq!(messages[1].content, "hi");
    }

    #[test]
    fn test_build_messages_prompt_only() {
        let messages = build_messages("hi", None);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
    }
}
