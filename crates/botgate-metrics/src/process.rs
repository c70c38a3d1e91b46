use serde::{Deserialize, Serialize};

/// Process memory usage in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub resident_peak_bytes: u64,
    pub virtual_peak_bytes: u64,
}

/// Samples the current process's memory usage.
///
/// Best-effort: returns `None` where `/proc` is unavailable (non-Linux targets, some sandboxes).
pub fn memory_usage() -> Option<MemoryUsage> {
    #[cfg(target_os = "linux")]
    {
        let status = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(
                        target: "botgate.metrics",
                        error = %err,
                        "failed to read /proc/self/status while sampling memory"
                    );
                }
                return None;
            }
        };
        parse_proc_status(&status)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_status(status: &str) -> Option<MemoryUsage> {
    let mut usage = MemoryUsage::default();
    let mut seen_rss = false;
    for line in status.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match key.trim() {
            "VmRSS" => {
                seen_rss = true;
                &mut usage.resident_bytes
            }
            "VmSize" => &mut usage.virtual_bytes,
            "VmHWM" => &mut usage.resident_peak_bytes,
            "VmPeak" => &mut usage.virtual_peak_bytes,
            _ => continue,
        };
        // Values are reported in kB.
        let Some(kb) = rest.split_whitespace().next() else {
            continue;
        };
        match kb.parse::<u64>() {
            Ok(kb) => *slot = kb.saturating_mul(1024),
            Err(err) => {
                static REPORTED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
                if REPORTED.set(()).is_ok() {
                    tracing::debug!(
                        target: "botgate.metrics",
                        key = key.trim(),
                        value = kb,
                        error = %err,
                        "failed to parse /proc/self/status entry"
                    );
                }
            }
        }
    }
    seen_rss.then_some(usage)
}
