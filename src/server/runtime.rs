/// Sizing the tokio worker pool for containerized deployments.
///
/// A bridge pod pinned to a couple of cores must not spin up a thread per
/// host CPU, so the pool size comes from, in order: the `BRIDGE_CPU_LIMIT`
/// env override, the cgroup (v2 then v1) CPU quota, and finally host
/// parallelism. Detection runs before the tracing subscriber exists, so the
/// chosen source is returned alongside the count and logged by bootstrap.
pub fn worker_threads() -> (usize, &'static str) {
    if let Some(cores) = env_limit() {
        return (cores.max(1), "env");
    }
    if let Some(cores) = cgroup_v2_limit() {
        return (cores.max(1), "cgroup_v2");
    }
    if let Some(cores) = cgroup_v1_limit() {
        return (cores.max(1), "cgroup_v1");
    }
    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    (host, "host")
}

/// `BRIDGE_CPU_LIMIT` accepts whole cores ("4") or k8s millicores ("4000m").
fn env_limit() -> Option<usize> {
    parse_cores(&std::env::var("BRIDGE_CPU_LIMIT").ok()?)
}

/// cgroup v2 unified hierarchy: `cpu.max` holds "<quota> <period>", or
/// "max <period>" when unlimited.
fn cgroup_v2_limit() -> Option<usize> {
    let raw = std::fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
    let mut fields = raw.split_whitespace();
    let quota = fields.next()?;
    if quota == "max" {
        return None;
    }
    quota_cores(quota, fields.next()?)
}

/// cgroup v1 legacy hierarchy: quota and period live in separate files; a
/// quota of -1 means unlimited.
fn cgroup_v1_limit() -> Option<usize> {
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
    quota_cores(quota.trim(), period.trim())
}

fn quota_cores(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}

fn parse_cores(raw: &str) -> Option<usize> {
    let raw = raw.trim();
    match raw.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => raw.parse().ok(),
    }
}
