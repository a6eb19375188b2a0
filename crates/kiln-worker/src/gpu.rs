use tokio::process::Command;

use kiln_common::GpuStatus;

/// Gather per-GPU snapshots via `nvidia-smi`. Part of the off-loop,
/// CPU-bound work the Health/Status Reporter gathers under its 2-second
/// timeout (§4.G).
pub async fn read_gpu_statuses() -> Vec<GpuStatus> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=index,memory.total,memory.used,utilization.gpu,temperature.gpu")
        .arg("--format=csv,noheader,nounits")
        .output()
        .await;

    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut out = Vec::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 5 {
            continue;
        }
        let Ok(index) = parts[0].parse::<u32>() else {
            continue;
        };
        out.push(GpuStatus {
            index,
            memory_total_mb: parts[1].parse().unwrap_or(0),
            memory_used_mb: parts[2].parse().unwrap_or(0),
            utilization_pct: parts[3].parse().ok(),
            temperature_c: parts[4].parse().ok(),
        });
    }
    out
}

/// The list of GPU indices this worker is permitted to use — either
/// discovered from the host or configured explicitly at construction time.
/// The Device Accountant treats this as the static `total_gpus` universe.
pub async fn discover_total_gpus() -> Vec<u32> {
    read_gpu_statuses().await.into_iter().map(|g| g.index).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_csv_row() {
        let row = "0, 24564, 1024, 12, 45";
        let parts: Vec<&str> = row.split(',').map(|s| s.trim()).collect();
        assert_eq!(parts[0].parse::<u32>().unwrap(), 0);
        assert_eq!(parts[1].parse::<u64>().unwrap(), 24564);
    }
}
