use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use policy::PressureLevel;
use tracing::debug;

use crate::SystemMemory;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Pressure threshold expressed as headroom per-mille (0-1000).
///
/// High pressure starts below 20% headroom. This is where Linux reclaim
/// activity is common.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemoryPressureThresholds {
    pub high_headroom_per_mille: u16,
}

impl Default for MemoryPressureThresholds {
    fn default() -> Self {
        Self {
            high_headroom_per_mille: 200,
        }
    }
}

/// Result of a memory pressure sample.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PressureReading {
    pub level: PressureLevel,
    pub total_mb: u64,
    pub available_mb: u64,
    /// `None` when the total is unknown.
    pub headroom_per_mille: Option<u16>,
}

/// Classifies system memory state once per sweep.
///
/// Sampling is a synchronous read of the memory source on the calling thread.
pub struct MemoryPressureMonitor {
    source: Box<dyn SystemMemory>,
    thresholds: MemoryPressureThresholds,
}

impl MemoryPressureMonitor {
    pub fn new<S: SystemMemory + 'static>(source: S) -> Self {
        Self::with_thresholds(source, MemoryPressureThresholds::default())
    }

    pub fn with_thresholds<S: SystemMemory + 'static>(
        source: S,
        thresholds: MemoryPressureThresholds,
    ) -> Self {
        Self {
            source: Box::new(source),
            thresholds,
        }
    }

    /// Samples the current pressure level.
    pub fn sample(&self) -> PressureLevel {
        self.reading().level
    }

    /// Samples the source and returns the full reading.
    pub fn reading(&self) -> PressureReading {
        let total_mb = self.source.total_physical_mb();
        let available_mb = self.source.available_physical_mb().min(total_mb);
        let headroom = headroom_per_mille(available_mb, total_mb);
        let level = match headroom {
            Some(per_mille) => map_headroom_per_mille(per_mille, &self.thresholds),
            None => PressureLevel::Normal,
        };
        PressureReading {
            level,
            total_mb,
            available_mb,
            headroom_per_mille: headroom,
        }
    }
}

/// Composite source that prefers the process cgroup limit, then system meminfo.
#[derive(Debug)]
pub struct DefaultSystemMemory {
    cgroup: Option<CgroupV2Source>,
    system: MemInfoSource,
}

impl DefaultSystemMemory {
    pub fn new() -> Self {
        Self {
            cgroup: CgroupV2Source::detect(),
            system: MemInfoSource::new(),
        }
    }

    fn cgroup_limited(&self) -> Option<&CgroupV2Source> {
        self.cgroup
            .as_ref()
            .filter(|source| source.total_physical_mb() > 0)
    }
}

impl Default for DefaultSystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemory for DefaultSystemMemory {
    fn total_physical_mb(&self) -> u64 {
        match self.cgroup_limited() {
            Some(cgroup) => cgroup.total_physical_mb(),
            None => self.system.total_physical_mb(),
        }
    }

    fn available_physical_mb(&self) -> u64 {
        match self.cgroup_limited() {
            Some(cgroup) => cgroup.available_physical_mb(),
            None => self.system.available_physical_mb(),
        }
    }
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`.
#[derive(Debug)]
pub struct MemInfoSource {
    path: PathBuf,
    buffer: RefCell<Vec<u8>>,
}

impl MemInfoSource {
    pub fn new() -> Self {
        Self::with_path("/proc/meminfo")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: RefCell::new(Vec::with_capacity(4096)),
        }
    }

    fn read(&self) -> Option<(u64, u64)> {
        let mut buffer = self.buffer.borrow_mut();
        let bytes = match read_to_buffer(&self.path, &mut buffer) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = %self.path.display(), %err, "meminfo unavailable");
                return None;
            }
        };
        parse_meminfo(bytes)
    }
}

impl Default for MemInfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemory for MemInfoSource {
    fn total_physical_mb(&self) -> u64 {
        self.read().map(|(total, _)| total / BYTES_PER_MB).unwrap_or(0)
    }

    fn available_physical_mb(&self) -> u64 {
        self.read()
            .map(|(_, available)| available / BYTES_PER_MB)
            .unwrap_or(0)
    }
}

/// Reads the memory limit and usage of the process's cgroup v2.
///
/// Reports zero when the cgroup has no limit (`max`).
#[derive(Debug)]
pub struct CgroupV2Source {
    memory_max: PathBuf,
    memory_current: PathBuf,
    buffer: RefCell<Vec<u8>>,
}

impl CgroupV2Source {
    /// Locates the cgroup of the current process.
    pub fn detect() -> Option<Self> {
        cgroup_v2_path().map(Self::at)
    }

    /// Uses the cgroup directory at `path`.
    pub fn at(path: PathBuf) -> Self {
        Self {
            memory_max: path.join("memory.max"),
            memory_current: path.join("memory.current"),
            buffer: RefCell::new(Vec::with_capacity(128)),
        }
    }

    fn read_value(&self, path: &Path) -> Option<u64> {
        let mut buffer = self.buffer.borrow_mut();
        let Ok(bytes) = read_to_buffer(path, &mut buffer) else {
            return None;
        };
        parse_cgroup_value(bytes)
    }

    fn limit_bytes(&self) -> Option<u64> {
        self.read_value(&self.memory_max).filter(|limit| *limit > 0)
    }
}

impl SystemMemory for CgroupV2Source {
    fn total_physical_mb(&self) -> u64 {
        self.limit_bytes().map(|limit| limit / BYTES_PER_MB).unwrap_or(0)
    }

    fn available_physical_mb(&self) -> u64 {
        let Some(limit) = self.limit_bytes() else {
            return 0;
        };
        let current = self.read_value(&self.memory_current).unwrap_or(limit);
        limit.saturating_sub(current) / BYTES_PER_MB
    }
}

fn map_headroom_per_mille(
    headroom_per_mille: u16,
    thresholds: &MemoryPressureThresholds,
) -> PressureLevel {
    if headroom_per_mille < thresholds.high_headroom_per_mille {
        PressureLevel::High
    } else {
        PressureLevel::Normal
    }
}

fn headroom_per_mille(available: u64, total: u64) -> Option<u16> {
    if total == 0 {
        return None;
    }
    let ratio = available.saturating_mul(1000) / total;
    Some(ratio.min(1000) as u16)
}

fn read_to_buffer<'a>(path: &Path, buffer: &'a mut Vec<u8>) -> io::Result<&'a [u8]> {
    buffer.clear();
    let mut file = File::open(path)?;
    file.read_to_end(buffer)?;
    Ok(buffer.as_slice())
}

fn parse_cgroup_value(bytes: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut saw_digit = false;
    for byte in bytes.iter().copied() {
        if byte.is_ascii_digit() {
            saw_digit = true;
            value = value
                .saturating_mul(10)
                .saturating_add((byte - b'0') as u64);
        } else if byte == b'm' || byte == b'M' {
            // "max": no limit.
            return None;
        } else if saw_digit {
            break;
        }
    }
    saw_digit.then_some(value)
}

fn cgroup_v2_path() -> Option<PathBuf> {
    let mut buffer = Vec::with_capacity(256);
    let bytes = read_to_buffer(Path::new("/proc/self/cgroup"), &mut buffer).ok()?;
    for line in bytes.split(|b| *b == b'\n') {
        if let Some(path) = line.strip_prefix(b"0::") {
            let path = if path.is_empty() {
                "/"
            } else {
                std::str::from_utf8(path).ok()?
            };
            return Some(PathBuf::from("/sys/fs/cgroup").join(path.trim_start_matches('/')));
        }
    }
    None
}

/// Returns `(total, available)` in bytes.
fn parse_meminfo(bytes: &[u8]) -> Option<(u64, u64)> {
    let mut total: Option<u64> = None;
    let mut available: Option<u64> = None;

    for line in bytes.split(|b| *b == b'\n') {
        if total.is_none() && line.starts_with(b"MemTotal:") {
            total = parse_kb_value(line).map(|v| v.saturating_mul(1024));
        } else if available.is_none() && line.starts_with(b"MemAvailable:") {
            available = parse_kb_value(line).map(|v| v.saturating_mul(1024));
        }

        if total.is_some() && available.is_some() {
            break;
        }
    }

    Some((total?, available?))
}

fn parse_kb_value(line: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    let mut saw_digit = false;
    for byte in line.iter().copied() {
        if byte.is_ascii_digit() {
            saw_digit = true;
            value = value
                .saturating_mul(10)
                .saturating_add((byte - b'0') as u64);
        } else if saw_digit {
            break;
        }
    }
    saw_digit.then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FixedSystemMemory;
    use std::io::Write;

    #[test]
    fn maps_headroom_to_pressure() {
        let thresholds = MemoryPressureThresholds::default();

        assert_eq!(map_headroom_per_mille(250, &thresholds), PressureLevel::Normal);
        assert_eq!(map_headroom_per_mille(200, &thresholds), PressureLevel::Normal);
        assert_eq!(map_headroom_per_mille(199, &thresholds), PressureLevel::High);
        assert_eq!(map_headroom_per_mille(5, &thresholds), PressureLevel::High);
    }

    #[test]
    fn high_pressure_below_twenty_percent() {
        let memory = std::rc::Rc::new(FixedSystemMemory::new(16_000, 3_200));
        let monitor = MemoryPressureMonitor::new(std::rc::Rc::clone(&memory));
        assert_eq!(monitor.sample(), PressureLevel::Normal);

        memory.set_available_mb(3_199);
        assert_eq!(monitor.sample(), PressureLevel::High);

        memory.set_available_mb(1_600);
        let reading = monitor.reading();
        assert_eq!(reading.level, PressureLevel::High);
        assert_eq!(reading.headroom_per_mille, Some(100));
    }

    #[test]
    fn unknown_total_reads_as_normal() {
        let monitor = MemoryPressureMonitor::new(FixedSystemMemory::new(0, 0));
        let reading = monitor.reading();
        assert_eq!(reading.level, PressureLevel::Normal);
        assert_eq!(reading.headroom_per_mille, None);
    }

    #[test]
    fn parses_meminfo() {
        let sample = b"MemTotal:       16318412 kB\nMemFree:         1234567 kB\nMemAvailable:    8159206 kB\n";
        let (total, available) = parse_meminfo(sample).unwrap();
        assert_eq!(total, 16318412 * 1024);
        assert_eq!(available, 8159206 * 1024);

        assert_eq!(parse_meminfo(b"MemTotal: 100 kB\n"), None);
    }

    #[test]
    fn meminfo_source_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MemTotal:        2097152 kB").unwrap();
        writeln!(file, "MemAvailable:     204800 kB").unwrap();

        let source = MemInfoSource::with_path(file.path());
        assert_eq!(source.total_physical_mb(), 2048);
        assert_eq!(source.available_physical_mb(), 200);

        let missing = MemInfoSource::with_path("/nonexistent/meminfo");
        assert_eq!(missing.total_physical_mb(), 0);
    }

    #[test]
    fn parses_cgroup_values() {
        assert_eq!(parse_cgroup_value(b"1073741824\n"), Some(1073741824));
        assert_eq!(parse_cgroup_value(b"max\n"), None);
        assert_eq!(parse_cgroup_value(b"\n"), None);
    }

    #[test]
    fn cgroup_source_reports_limit_headroom() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.max"), "1073741824\n").unwrap();
        std::fs::write(dir.path().join("memory.current"), "805306368\n").unwrap();

        let source = CgroupV2Source::at(dir.path().to_path_buf());
        assert_eq!(source.total_physical_mb(), 1024);
        assert_eq!(source.available_physical_mb(), 256);

        std::fs::write(dir.path().join("memory.max"), "max\n").unwrap();
        assert_eq!(source.total_physical_mb(), 0);
        assert_eq!(source.available_physical_mb(), 0);
    }
}
