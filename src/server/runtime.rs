/// Container-aware CPU limit detection for sizing the tokio worker thread
/// pool. Checks, in order: the `SEISFED_CPU_LIMIT` env var, cgroup v2
/// (`cpu.max`), cgroup v1 (`cpu.cfs_quota_us`/`cpu.cfs_period_us`), and
/// finally the host CPU count. Without this, tokio spawns one thread per
/// host core even when the container is limited to a fraction of them.
pub fn get_container_cpu_limit() -> usize {
    if let Some(cores) = std::env::var("SEISFED_CPU_LIMIT")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return cores.max(1);
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_quota_period(&max) {
            return cores.max(1);
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        let combined = format!("{} {}", quota.trim(), period.trim());
        if let Some(cores) = parse_quota_period(&combined) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Parse "quota period" pairs; "max" means unlimited.
fn parse_quota_period(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quota_period() {
        assert_eq!(parse_quota_period("400000 100000"), Some(4));
        assert_eq!(parse_quota_period("200000 100000"), Some(2));
        assert_eq!(parse_quota_period("max 100000"), None);
        assert_eq!(parse_quota_period("-1 100000"), None);
        assert_eq!(parse_quota_period(""), None);
    }
}
