//! Configuration validation

use super::*;
use crate::backend::KNOWN_BACKENDS;
use crate::Result;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_sampling(&config.sampling)?;
    validate_cluster(&config.cluster)?;
    validate_backends(&config.backends)?;
    Ok(())
}

/// Validate sampling configuration
pub fn validate_sampling(sampling: &SamplingConfig) -> Result<()> {
    if !sampling.frequency.is_finite() || sampling.frequency <= 0.0 {
        anyhow::bail!(
            "frequency must be a positive number of Hz, got {}",
            sampling.frequency
        );
    }
    Ok(())
}

/// Validate cluster configuration
pub fn validate_cluster(cluster: &ClusterConfig) -> Result<()> {
    let (rank, size) = cluster.world();

    if size == 0 {
        anyhow::bail!("size must be at least 1");
    }
    if rank >= size {
        anyhow::bail!("rank ({}) must be less than size ({})", rank, size);
    }
    if size > 1 && cluster.coordinator.as_deref().map_or(true, str::is_empty) {
        anyhow::bail!("coordinator address is required when size > 1");
    }
    if cluster.connect_timeout_secs == 0 {
        anyhow::bail!("connect_timeout_secs must be greater than 0");
    }
    Ok(())
}

/// Validate backend configuration
pub fn validate_backends(backends: &BackendsConfig) -> Result<()> {
    for name in &backends.enabled {
        if !KNOWN_BACKENDS.contains(&name.as_str()) {
            anyhow::bail!(
                "unknown backend '{}' (known: {})",
                name,
                KNOWN_BACKENDS.join(", ")
            );
        }
    }
    Ok(())
}
