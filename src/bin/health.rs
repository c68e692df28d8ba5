use std::env;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde_json::Value;

/// Exits non-zero unless `GET <url>` succeeds and reports `"ok": true`.
fn main() -> Result<()> {
    let url = env::args()
        .nth(1)
        .context("Missing URL argument, e.g. http://localhost:8080/health")?;
    let url = Url::parse(&url)?;

    let response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        bail!("Health check failed with status {}", response.status());
    }

    let body: Value = serde_json::from_str(&response.text()?)?;
    if body.get("ok").and_then(Value::as_bool) != Some(true) {
        bail!("Service reported unhealthy: {}", body);
    }
    if body.get("moderation_enabled").and_then(Value::as_bool) == Some(false) {
        eprintln!("Warning: moderation is not configured on this instance");
    }
    Ok(())
}
