//! Pre-flight checks on requested resource limits and mounts
//!
//! Runs before any engine object is created. The first failing check wins.

use bollard::models::{HostConfig, Mount, MountTypeEnum, ResourcesUlimits};
use std::sync::Arc;

use crate::engine::{Engine, HostResources};
use crate::error::{CpiError, Result};
use crate::props::VmProps;

/// Smallest memory limit the engine accepts
pub const MIN_MEMORY: i64 = 32 * 1024 * 1024;

/// Memory assumed to be taken by the host itself
pub const SYSTEM_RESERVED_MEMORY: i64 = 1024 * 1024 * 1024;

/// Period applied when a quota is given without one (100ms)
pub const DEFAULT_CPU_PERIOD: i64 = 100_000;

/// Smallest CPU quota (1ms per period)
pub const MIN_CPU_QUOTA: i64 = 1_000;

const NANO_CPUS_PER_CPU: f64 = 1e9;

/// Smallest `NanoCpus` request (0.01 CPU)
pub const MIN_NANO_CPUS: i64 = 10_000_000;

/// Mount targets that would shadow the VM's own system
const PROTECTED_MOUNT_TARGETS: &[&str] = &["/", "/etc", "/usr", "/bin", "/sbin", "/lib", "/lib64"];

/// Bind destinations refused in addition to [`PROTECTED_MOUNT_TARGETS`]
const PROTECTED_BIND_TARGETS: &[&str] = &["/proc", "/sys"];

const BIND_OPTIONS: &[&str] = &[
    "ro", "rw", "z", "Z", "rslave", "rprivate", "rshared", "slave", "private", "shared",
];

fn invalid(message: impl Into<String>) -> CpiError {
    CpiError::Validation(message.into())
}

/// Checks VM properties against host capacity
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceValidator {
    host: Option<HostResources>,
}

impl ResourceValidator {
    /// Validator for a host with known capacity.
    pub fn new(host: HostResources) -> Self {
        Self { host: Some(host) }
    }

    /// Validator that only runs host-independent checks.
    pub fn without_capacity() -> Self {
        Self { host: None }
    }

    /// Ask the engine for host capacity. When the engine cannot report it,
    /// capacity checks are skipped rather than failing the create.
    pub async fn for_engine(engine: &Arc<dyn Engine>) -> Self {
        match engine.host_resources().await {
            Ok(host) => Self::new(host),
            Err(e) => {
                tracing::warn!(error = %e, "host capacity unavailable, skipping capacity checks");
                Self::without_capacity()
            }
        }
    }

    /// Validate `props`, filling in an unset CPU period when a quota is given.
    pub fn validate(&self, props: &mut VmProps) -> Result<()> {
        let host = &mut props.host_config;
        self.validate_memory(host)?;
        self.validate_cpu(host)?;
        validate_pids_limit(host.pids_limit)?;
        if let Some(ulimits) = &host.ulimits {
            validate_ulimits(ulimits)?;
        }
        if let Some(mounts) = host.mounts.as_mut() {
            for mount in mounts.iter_mut() {
                validate_mount(mount)?;
            }
        }
        if let Some(binds) = &host.binds {
            for bind in binds {
                validate_bind(bind)?;
            }
        }
        Ok(())
    }

    /// Requirements:
    /// - at least [`MIN_MEMORY`] and at most total host memory
    /// - swap ceiling, when set, not below the memory limit
    fn validate_memory(&self, host: &HostConfig) -> Result<()> {
        let memory = host.memory.unwrap_or(0);
        if memory != 0 {
            if memory < 0 {
                return Err(invalid(format!("Memory limit cannot be negative: {memory}")));
            }
            if memory < MIN_MEMORY {
                return Err(invalid(format!(
                    "Memory limit {memory} bytes is below the minimum of {MIN_MEMORY} bytes (32MB)"
                )));
            }
            if let Some(resources) = self.host {
                if memory > resources.total_memory {
                    return Err(invalid(format!(
                        "Memory limit {memory} bytes exceeds host total memory of {} bytes",
                        resources.total_memory
                    )));
                }
                let available = (resources.total_memory - SYSTEM_RESERVED_MEMORY).max(0);
                if memory > available {
                    tracing::warn!(
                        memory,
                        available,
                        "memory limit exceeds memory available after the system reserve"
                    );
                }
            }
        }

        let swap = host.memory_swap.unwrap_or(0);
        if swap > 0 && memory > 0 && swap < memory {
            return Err(invalid(format!(
                "MemorySwap ({swap}) must be larger than Memory limit ({memory})"
            )));
        }
        Ok(())
    }

    fn validate_cpu(&self, host: &mut HostConfig) -> Result<()> {
        let shares = host.cpu_shares.unwrap_or(0);
        if shares < 0 {
            return Err(invalid(format!("CPU shares cannot be negative: {shares}")));
        }

        let quota = host.cpu_quota.unwrap_or(0);
        if quota > 0 {
            let period = match host.cpu_period {
                Some(period) if period > 0 => period,
                _ => {
                    host.cpu_period = Some(DEFAULT_CPU_PERIOD);
                    DEFAULT_CPU_PERIOD
                }
            };
            if quota < MIN_CPU_QUOTA {
                return Err(invalid(format!(
                    "CPU quota {quota} is below the minimum of {MIN_CPU_QUOTA} (1ms)"
                )));
            }
            if let Some(resources) = self.host {
                let requested = quota as f64 / period as f64;
                if requested > resources.cpus as f64 {
                    return Err(invalid(format!(
                        "CPU quota/period implies {requested:.2} CPUs, host has {}",
                        resources.cpus
                    )));
                }
            }
        }

        let nano_cpus = host.nano_cpus.unwrap_or(0);
        if nano_cpus > 0 {
            if let Some(resources) = self.host {
                let requested = nano_cpus as f64 / NANO_CPUS_PER_CPU;
                if requested > resources.cpus as f64 {
                    return Err(invalid(format!(
                        "NanoCpus requests {requested:.2} CPUs, host has {}",
                        resources.cpus
                    )));
                }
            }
            if nano_cpus < MIN_NANO_CPUS {
                return Err(invalid(format!(
                    "NanoCpus {nano_cpus} is below the minimum of {MIN_NANO_CPUS} (0.01 CPU)"
                )));
            }
        }

        if let (Some(cpuset), Some(resources)) = (host.cpuset_cpus.as_deref(), self.host) {
            validate_cpuset(cpuset, resources.cpus)?;
        }
        Ok(())
    }
}

fn validate_pids_limit(limit: Option<i64>) -> Result<()> {
    match limit {
        Some(limit) if limit < 0 => Err(invalid(format!("PIDs limit cannot be negative: {limit}"))),
        _ => Ok(()),
    }
}

/// `CpusetCpus` like `0-3,6`; every CPU must exist on the host.
fn validate_cpuset(cpuset: &str, cpus: i64) -> Result<()> {
    let bad = || invalid(format!("Invalid CpusetCpus '{cpuset}'"));
    for part in cpuset.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => (start, end),
            None => (part, part),
        };
        let start: i64 = start.trim().parse().map_err(|_| bad())?;
        let end: i64 = end.trim().parse().map_err(|_| bad())?;
        if start > end {
            return Err(bad());
        }
        if end >= cpus {
            return Err(invalid(format!(
                "CpusetCpus '{cpuset}' references CPU {end}, host has {cpus}"
            )));
        }
    }
    Ok(())
}

fn validate_ulimits(ulimits: &[ResourcesUlimits]) -> Result<()> {
    for ulimit in ulimits {
        let name = ulimit.name.as_deref().unwrap_or("");
        let soft = ulimit.soft.unwrap_or(0);
        let hard = ulimit.hard.unwrap_or(0);
        if soft < 0 || hard < 0 {
            return Err(invalid(format!("Ulimit {name} cannot be negative")));
        }
        if soft > hard {
            return Err(invalid(format!(
                "Ulimit {name}: soft limit ({soft}) cannot exceed hard limit ({hard})"
            )));
        }
    }
    Ok(())
}

/// Requirements:
/// - type is bind, volume, tmpfs or npipe; unset means volume
/// - target set and not a protected system directory
/// - bind mounts name a source
/// - tmpfs size not negative
fn validate_mount(mount: &mut Mount) -> Result<()> {
    let typ = match mount.typ {
        None | Some(MountTypeEnum::EMPTY) => {
            mount.typ = Some(MountTypeEnum::VOLUME);
            MountTypeEnum::VOLUME
        }
        Some(
            typ @ (MountTypeEnum::BIND
            | MountTypeEnum::VOLUME
            | MountTypeEnum::TMPFS
            | MountTypeEnum::NPIPE),
        ) => typ,
        Some(other) => return Err(invalid(format!("Invalid mount type: {other}"))),
    };

    let target = mount.target.as_deref().unwrap_or("");
    if target.is_empty() {
        return Err(invalid("Mount target is required"));
    }
    if PROTECTED_MOUNT_TARGETS.contains(&target) {
        return Err(invalid(format!(
            "Mounting over system directory {target} is not allowed"
        )));
    }

    if typ == MountTypeEnum::BIND && mount.source.as_deref().unwrap_or("").is_empty() {
        return Err(invalid(format!("Bind mount to {target} requires a source")));
    }

    if typ == MountTypeEnum::TMPFS {
        if let Some(size) = mount.tmpfs_options.as_ref().and_then(|o| o.size_bytes) {
            if size < 0 {
                return Err(invalid(format!("Tmpfs size cannot be negative: {size}")));
            }
        }
    }
    Ok(())
}

/// `source:dest[:opt,opt]`
fn validate_bind(bind: &str) -> Result<()> {
    let parts: Vec<&str> = bind.split(':').collect();
    if parts.len() < 2 {
        return Err(invalid(format!(
            "Invalid bind format '{bind}', expected source:destination[:options]"
        )));
    }

    let (source, dest) = (parts[0], parts[1]);
    if source.is_empty() || dest.is_empty() {
        return Err(invalid(format!(
            "Bind '{bind}' requires both source and destination"
        )));
    }
    if PROTECTED_MOUNT_TARGETS.contains(&dest) || PROTECTED_BIND_TARGETS.contains(&dest) {
        return Err(invalid(format!(
            "Mounting over system directory {dest} is not allowed"
        )));
    }

    if let Some(options) = parts.get(2) {
        for option in options.split(',') {
            if !BIND_OPTIONS.contains(&option) {
                return Err(invalid(format!("Invalid bind option '{option}' in '{bind}'")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::MountTmpfsOptions;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn validator() -> ResourceValidator {
        ResourceValidator::new(HostResources {
            total_memory: 8 * GIB,
            cpus: 4,
        })
    }

    fn props(host_config: HostConfig) -> VmProps {
        VmProps {
            host_config,
            ..Default::default()
        }
    }

    fn check(host_config: HostConfig) -> Result<VmProps> {
        let mut props = props(host_config);
        validator().validate(&mut props)?;
        Ok(props)
    }

    #[test]
    fn test_memory_minimum_boundary() {
        assert!(check(HostConfig {
            memory: Some(MIN_MEMORY),
            ..Default::default()
        })
        .is_ok());

        let err = check(HostConfig {
            memory: Some(MIN_MEMORY - 1),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("below the minimum"));
    }

    #[test]
    fn test_memory_against_host() {
        assert!(check(HostConfig {
            memory: Some(8 * GIB + 1),
            ..Default::default()
        })
        .is_err());

        // Above the available estimate is only a warning
        assert!(check(HostConfig {
            memory: Some(8 * GIB - 1),
            ..Default::default()
        })
        .is_ok());

        assert!(check(HostConfig {
            memory: Some(-1),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_swap_below_memory() {
        let err = check(HostConfig {
            memory: Some(GIB),
            memory_swap: Some(GIB / 2),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("MemorySwap"));

        assert!(check(HostConfig {
            memory: Some(GIB),
            memory_swap: Some(2 * GIB),
            ..Default::default()
        })
        .is_ok());
    }

    #[test]
    fn test_cpu_quota_boundary() {
        // 4 CPUs exactly
        assert!(check(HostConfig {
            cpu_quota: Some(400_000),
            cpu_period: Some(100_000),
            ..Default::default()
        })
        .is_ok());

        let err = check(HostConfig {
            cpu_quota: Some(400_001),
            cpu_period: Some(100_000),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("host has 4"));
    }

    #[test]
    fn test_cpu_quota_defaults_period() {
        let props = check(HostConfig {
            cpu_quota: Some(50_000),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(props.host_config.cpu_period, Some(DEFAULT_CPU_PERIOD));

        assert!(check(HostConfig {
            cpu_quota: Some(999),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_nano_cpus() {
        assert!(check(HostConfig {
            nano_cpus: Some(MIN_NANO_CPUS),
            ..Default::default()
        })
        .is_ok());
        assert!(check(HostConfig {
            nano_cpus: Some(MIN_NANO_CPUS - 1),
            ..Default::default()
        })
        .is_err());
        assert!(check(HostConfig {
            nano_cpus: Some(5_000_000_000),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_negative_counters() {
        assert!(check(HostConfig {
            cpu_shares: Some(-1),
            ..Default::default()
        })
        .is_err());
        assert!(check(HostConfig {
            pids_limit: Some(-1),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_cpuset() {
        assert!(validate_cpuset("0-3", 4).is_ok());
        assert!(validate_cpuset("0,2", 4).is_ok());
        assert!(validate_cpuset("0-4", 4).is_err());
        assert!(validate_cpuset("3-1", 4).is_err());
        assert!(validate_cpuset("a", 4).is_err());
    }

    #[test]
    fn test_ulimits() {
        let ulimit = |soft, hard| ResourcesUlimits {
            name: Some("nofile".to_string()),
            soft: Some(soft),
            hard: Some(hard),
        };
        assert!(validate_ulimits(&[ulimit(1024, 4096)]).is_ok());
        assert!(validate_ulimits(&[ulimit(4096, 1024)]).is_err());
        assert!(validate_ulimits(&[ulimit(-1, 1024)]).is_err());
    }

    #[test]
    fn test_mounts() {
        let mut mount = Mount {
            target: Some("/data".to_string()),
            ..Default::default()
        };
        validate_mount(&mut mount).unwrap();
        assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));

        let mut mount = Mount {
            typ: Some(MountTypeEnum::BIND),
            target: Some("/data".to_string()),
            ..Default::default()
        };
        assert!(validate_mount(&mut mount).is_err());

        let mut mount = Mount {
            typ: Some(MountTypeEnum::VOLUME),
            target: Some("/etc".to_string()),
            ..Default::default()
        };
        let err = validate_mount(&mut mount).unwrap_err();
        assert!(err.to_string().contains("Mounting over system directory /etc"));

        let mut mount = Mount {
            typ: Some(MountTypeEnum::TMPFS),
            target: Some("/scratch".to_string()),
            tmpfs_options: Some(MountTmpfsOptions {
                size_bytes: Some(-1),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate_mount(&mut mount).is_err());

        let mut mount = Mount {
            typ: Some(MountTypeEnum::IMAGE),
            target: Some("/img".to_string()),
            ..Default::default()
        };
        assert!(validate_mount(&mut mount).is_err());

        let mut mount = Mount::default();
        assert!(validate_mount(&mut mount).is_err());
    }

    #[test]
    fn test_binds() {
        assert!(validate_bind("/tmp:/mnt").is_ok());
        assert!(validate_bind("vol-1:/warden-cpi-dev/vol-1:ro,rshared").is_ok());
        assert!(validate_bind("/tmp").is_err());
        assert!(validate_bind(":/mnt").is_err());
        assert!(validate_bind("/host:/proc").is_err());
        assert!(validate_bind("/host:/usr").is_err());

        let err = validate_bind("/tmp:/mnt:rw,exec").unwrap_err();
        assert!(err.to_string().contains("Invalid bind option 'exec' in '/tmp:/mnt:rw,exec'"));
    }

    #[test]
    fn test_without_capacity_skips_host_checks() {
        let mut props = props(HostConfig {
            memory: Some(1024 * GIB),
            cpu_quota: Some(10_000_000),
            ..Default::default()
        });
        ResourceValidator::without_capacity().validate(&mut props).unwrap();

        let mut props = self::props(HostConfig {
            memory: Some(MIN_MEMORY - 1),
            ..Default::default()
        });
        assert!(ResourceValidator::without_capacity().validate(&mut props).is_err());
    }
}
