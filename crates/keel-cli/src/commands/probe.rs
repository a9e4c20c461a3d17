use keel_core::parse_duration;
use keel_health::{http_probe, HealthStatus, ProbeResult};

pub async fn probe(address: &str, path: &str, timeout: &str) -> anyhow::Result<()> {
    let timeout = parse_duration(timeout)
        .ok_or_else(|| anyhow::anyhow!("invalid timeout: {timeout:?}"))?;

    let result = http_probe(address, path, timeout).await;
    let status = HealthStatus::from(result);
    println!("{address}{path}: {}", serde_json::to_string(&status)?);

    if result != ProbeResult::Healthy {
        anyhow::bail!("{address}{path} is not healthy");
    }
    Ok(())
}
