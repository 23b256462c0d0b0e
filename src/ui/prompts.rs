//! Prompts with a non-interactive fallback

use super::context::UiContext;
use crate::error::{KilnError, KilnResult};

/// Ask a yes/no question; non-interactive sessions get `default`
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> KilnResult<bool> {
    if ctx.auto_yes() {
        return Ok(true);
    }
    if !ctx.is_interactive() {
        return Ok(default);
    }

    // cliclack blocks on the terminal
    let message = message.to_string();
    tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message)
            .initial_value(default)
            .interact()
    })
    .await
    .map_err(|e| KilnError::User(format!("Prompt task failed: {}", e)))?
    .map_err(|e| KilnError::User(format!("Prompt failed: {}", e)))
}

/// Pick one of `options` as `(value, label, hint)`; non-interactive
/// sessions get the first option
pub async fn select<T>(ctx: &UiContext, message: &str, options: &[(T, &str, &str)]) -> KilnResult<T>
where
    T: Clone + Eq + Send + 'static,
{
    let first = options
        .first()
        .map(|(value, _, _)| value.clone())
        .ok_or_else(|| KilnError::Internal("select without options".to_string()))?;
    if !ctx.is_interactive() || ctx.auto_yes() {
        return Ok(first);
    }

    let message = message.to_string();
    let items: Vec<(T, String, String)> = options
        .iter()
        .map(|(value, label, hint)| (value.clone(), label.to_string(), hint.to_string()))
        .collect();
    tokio::task::spawn_blocking(move || {
        let mut select = cliclack::select(&message);
        for (value, label, hint) in items {
            select = select.item(value, label, hint);
        }
        select.interact()
    })
    .await
    .map_err(|e| KilnError::User(format!("Select task failed: {}", e)))?
    .map_err(|e| KilnError::User(format!("Select failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirm_auto_yes() {
        let ctx = UiContext::non_interactive().with_auto_yes(true);
        assert!(confirm(&ctx, "Clear the cache?", false).await.unwrap());
    }

    #[tokio::test]
    async fn confirm_non_interactive_default() {
        let ctx = UiContext::non_interactive();
        assert!(confirm(&ctx, "Resume?", true).await.unwrap());
        assert!(!confirm(&ctx, "Resume?", false).await.unwrap());
    }

    #[tokio::test]
    async fn select_non_interactive_first() {
        let ctx = UiContext::non_interactive();
        let options = [("abort", "Abort", "fail the node"), ("resume", "Resume", "")];
        assert_eq!(select(&ctx, "Next?", &options).await.unwrap(), "abort");
    }

    #[tokio::test]
    async fn select_without_options_is_an_error() {
        let ctx = UiContext::non_interactive();
        let options: [(u8, &str, &str); 0] = [];
        assert!(select(&ctx, "Next?", &options).await.is_err());
    }
}
