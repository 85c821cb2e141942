use crate::config::{Config, ProviderKind};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

fn ok(label: &str, detail: &str) {
    println!("  {GREEN}[OK]{RESET}   {label}: {detail}");
}

fn fail(label: &str, detail: &str) {
    println!("  {RED}[FAIL]{RESET} {label}: {detail}");
}

fn info(label: &str, detail: &str) {
    println!("  {CYAN}[INFO]{RESET} {label}: {detail}");
}

/// Validate the configuration and probe each provider. Fails when the
/// configuration itself is invalid; unreachable providers are only reported.
pub async fn run(config: &Config, config_path: Option<&Path>) -> Result<()> {
    println!("codestream check\n");

    ok("Version", env!("CARGO_PKG_VERSION"));

    match config_path {
        Some(p) => ok("Config", &p.display().to_string()),
        None => info("Config", "(default)"),
    }

    if let Err(e) = config.validate() {
        fail("Config", &e.to_string());
        println!();
        return Err(e);
    }
    ok("Default model", &config.generation.default_model);
    for rule in &config.generation.fallbacks {
        info(
            "Fallback",
            &format!("{} ({:?}) -> {}", rule.provider, rule.error_class, rule.model),
        );
    }

    check_providers(config).await;
    check_collaborators(config);
    check_log_dir(config);

    println!();
    Ok(())
}

async fn check_providers(config: &Config) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(c) => c,
        Err(_) => {
            fail("Providers", "failed to build HTTP client");
            return;
        }
    };

    for provider in &config.providers {
        let label = format!("Provider [{}]", provider.id);
        let base = provider.url.trim_end_matches('/');
        let check_url = match provider.kind {
            ProviderKind::Ollama => format!("{}/api/tags", base),
            ProviderKind::OpenAi => format!("{}/models", base),
        };

        let api_key = provider.resolved_api_key();
        if provider.kind == ProviderKind::OpenAi && api_key.is_none() {
            info(&label, "no API key configured");
        }

        let mut req = client.get(&check_url);
        if let Some(key) = &api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => {
                ok(&label, &format!("{} @ {} (reachable)", provider.kind.as_str(), provider.url));
            }
            Ok(resp) => fail(
                &label,
                &format!("{} @ {} (HTTP {})", provider.kind.as_str(), provider.url, resp.status()),
            ),
            Err(e) => fail(&label, &format!("{} @ {} ({})", provider.kind.as_str(), provider.url, e)),
        }
    }
}

fn check_collaborators(config: &Config) {
    let collaborators = &config.collaborators;
    match collaborators.sandbox_url.as_deref() {
        Some(url) => ok("Sandbox files", url),
        None => info("Sandbox files", "not configured"),
    }
    match collaborators.intent_url.as_deref() {
        Some(url) => ok("Edit intent", url),
        None => info("Edit intent", "not configured"),
    }
}

fn check_log_dir(config: &Config) {
    let dir = config
        .logging
        .directory
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(crate::paths::logs_dir);

    if dir.exists() {
        let test_path = dir.join(".check-write");
        match std::fs::write(&test_path, "") {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                ok("Logs", &dir.display().to_string());
            }
            Err(_) => fail("Logs", &format!("{} (not writable)", dir.display())),
        }
    } else {
        info("Logs", &format!("{} (not found)", dir.display()));
    }
}
