//! Periodic diagnostics: per-app connection counts appended to a log file,
//! registry gauges refreshed on every tick.

use anyhow::Result;
use beacon_core::RealmRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::config::DiagnosticsConfig;
use crate::metrics::names;

#[derive(Serialize)]
struct ConnsRecord<'a> {
    timestamp: u64,
    conns: usize,
    app_id: &'a str,
    mesh_id: &'a str,
}

/// Run the diagnostics loop forever.
pub async fn run(registry: Arc<RealmRegistry>, config: DiagnosticsConfig) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms));
    ticker.tick().await; // the first tick fires immediately

    loop {
        ticker.tick().await;
        refresh_gauges(&registry);
        if let Err(err) = report(&registry, &config.conns_log_path).await {
            error!(error = %err, path = %config.conns_log_path, "connections report failed");
        }
    }
}

fn refresh_gauges(registry: &RealmRegistry) {
    let snapshot = registry.snapshot();
    let channels: usize = snapshot.iter().map(|realm| realm.channels.len()).sum();
    metrics::gauge!(names::REALMS_ACTIVE).set(snapshot.len() as f64);
    metrics::gauge!(names::CHANNELS_ACTIVE).set(channels as f64);
}

/// Append one JSON line per appID with a positive connection count.
async fn report(registry: &RealmRegistry, path: &str) -> Result<()> {
    let counts = registry.connection_counts();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();

    let mut lines = String::new();
    for (app_id, conns) in &counts {
        if *conns == 0 {
            continue;
        }
        let record = ConnsRecord {
            timestamp,
            conns: *conns,
            app_id,
            mesh_id: registry.mesh_id(),
        };
        lines.push_str(&serde_json::to_string(&record)?);
        lines.push('\n');
    }

    if lines.is_empty() {
        return Ok(());
    }

    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    file.write_all(lines.as_bytes()).await?;

    debug!(apps = counts.len(), path, "connections report appended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::{NoopConnection, NoopMeshBridge};

    #[tokio::test]
    async fn test_report_appends_json_lines() {
        let registry = RealmRegistry::new("node-test", Arc::new(NoopMeshBridge::new()));
        let realm = registry.get_or_create("app-1", "").await;
        let alice = realm.add_peer(Arc::new(NoopConnection::new("sid-a")), "alice");
        alice.join("room1").await;
        alice.join("room2").await;

        let path = std::env::temp_dir().join(format!("beacon-conns-{}.log", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();
        let _ = tokio::fs::remove_file(&path).await;

        report(&registry, &path_str).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let line = contents.lines().next().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["app_id"], "app-1");
        assert_eq!(parsed["conns"], 2);
        assert_eq!(parsed["mesh_id"], "node-test");
        assert!(parsed["timestamp"].as_u64().unwrap() > 0);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_report_skips_empty_registry() {
        let registry = RealmRegistry::new("node-test", Arc::new(NoopMeshBridge::new()));
        let path = std::env::temp_dir().join(format!("beacon-empty-{}.log", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();
        let _ = tokio::fs::remove_file(&path).await;

        report(&registry, &path_str).await.unwrap();
        assert!(tokio::fs::metadata(&path).await.is_err());
    }
}
