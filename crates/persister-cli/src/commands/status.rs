//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    #[serde(default)]
    running: bool,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show health and headline metrics of a running persister.
pub async fn run(url: &str, metrics_url: Option<&str>) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the persister running?");
            println!("Start it with: persister run --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = match metrics_url {
        Some(u) => format!("{}/metrics", u.trim_end_matches('/')),
        None => format!("{}/metrics", url.trim_end_matches('/').replace(":8080", ":9090")),
    };

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => println!("Failed to fetch metrics: {}", e),
    }

    Ok(())
}

fn status_tag(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        status_tag(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!(
        "Consume loop: {}",
        if health.running { "running" } else { "stopped" }
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            match &status.message {
                Some(msg) => println!(
                    "  {} {}: {} ({})",
                    status_tag(&status.status),
                    name,
                    status.status,
                    msg
                ),
                None => println!("  {} {}: {}", status_tag(&status.status), name, status.status),
            }
        }
    }
}

/// Sum every sample of each metric family, ignoring labels.
fn sum_by_family(metrics_text: &str) -> BTreeMap<&str, f64> {
    let mut values = BTreeMap::new();

    for line in metrics_text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(series), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let family = series.split('{').next().unwrap_or(series);
        if let Ok(value) = value.parse::<f64>() {
            *values.entry(family).or_insert(0.0) += value;
        }
    }

    values
}

fn print_metrics(metrics_text: &str) {
    let values = sum_by_family(metrics_text);

    if let Some(v) = values.get("persister_messages_total") {
        println!("Messages Written:  {}", format_number(*v as u64));
    }
    if let Some(v) = values.get("persister_dropped_messages_total") {
        println!("Messages Dropped:  {}", format_number(*v as u64));
    }
    if let Some(v) = values.get("persister_partial_writes_total") {
        println!("Partial Writes:    {}", *v as u64);
    }
    if let Some(v) = values.get("persister_messages_per_second") {
        println!("Messages/sec:      {:.1}", v);
    }

    if values.is_empty() {
        println!("No metrics available yet.");
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_by_family_ignores_labels() {
        let text = "\
# HELP persister_messages_per_topic_total Total number of messages processed from one topic
# TYPE persister_messages_per_topic_total counter
persister_messages_per_topic_total{topic=\"metrics\"} 10
persister_messages_per_topic_total{topic=\"events\"} 5
persister_messages_per_second{topic=\"metrics\"} 2.5
";
        let values = sum_by_family(text);
        assert_eq!(values.get("persister_messages_per_topic_total"), Some(&15.0));
        assert_eq!(values.get("persister_messages_per_second"), Some(&2.5));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_500), "1.50K");
        assert_eq!(format_number(2_000_000), "2.00M");
        assert_eq!(format_number(3_100_000_000), "3.10B");
    }

    #[test]
    fn test_health_response_parses_server_output() {
        let body = r#"{"status":"degraded","running":true,"components":{"kafka":{"status":"healthy"},"storage":{"status":"degraded","message":"partial write"}}}"#;
        let health: HealthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(health.status, "degraded");
        assert!(health.running);
        assert_eq!(
            health.components["storage"].message.as_deref(),
            Some("partial write")
        );
    }
}
