use std::env;
use std::sync::OnceLock;

static CMDBUF_PASS_STATS: OnceLock<bool> = OnceLock::new();
static CMDBUF_PIPELINE_MAX_ITERS: OnceLock<usize> = OnceLock::new();

const DEFAULT_PIPELINE_MAX_ITERS: usize = 4;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_usize(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|v| *v > 0)
}

/// Emit a stats event after every pipeline pass (`CMDBUF_PASS_STATS`).
pub fn pass_stats_enabled() -> bool {
    *CMDBUF_PASS_STATS.get_or_init(|| match env::var("CMDBUF_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Iteration bound for fixed-point pipeline steps (`CMDBUF_PIPELINE_MAX_ITERS`).
pub fn pipeline_max_iters() -> usize {
    *CMDBUF_PIPELINE_MAX_ITERS.get_or_init(|| {
        env::var("CMDBUF_PIPELINE_MAX_ITERS")
            .ok()
            .and_then(|value| parse_usize(&value))
            .unwrap_or(DEFAULT_PIPELINE_MAX_ITERS)
    })
}
