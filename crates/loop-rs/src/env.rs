//! Process-level switches read once from the environment.

use std::env;
use std::sync::OnceLock;

static LOOPRS_EAGER: OnceLock<bool> = OnceLock::new();

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `LOOPRS_EAGER=1` makes every captured node execute immediately, trading
/// batching for step-by-step debuggability.
pub(crate) fn eager_enabled() -> bool {
    *LOOPRS_EAGER.get_or_init(|| match env::var("LOOPRS_EAGER") {
        Ok(value) if !value.trim().is_empty() => truthy(&value),
        _ => false,
    })
}
