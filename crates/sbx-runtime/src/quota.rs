//! Per-sandbox quota accounting and admission.
//!
//! The bucket is owned by its sandbox and only ever touched under the
//! sandbox mutex, which makes admission totally ordered: two concurrent
//! admissions can never both observe headroom that only exists for one.

use sbx_core::config::QuotaConfig;
use sbx_core::error::QuotaKind;
use tracing::warn;

/// Number of fixed minute slots backing the rolling one-hour exec window.
const WINDOW_SLOTS: usize = 60;

/// Soft-cap warning threshold.
const SOFT_THRESHOLD: f64 = 0.8;

const KINDS: [QuotaKind; 6] = [
    QuotaKind::ExecRate,
    QuotaKind::ConcurrentExec,
    QuotaKind::Memory,
    QuotaKind::Storage,
    QuotaKind::Egress,
    QuotaKind::Cpu,
];

/// Rolling usage counters for one sandbox. A limit of zero means unlimited.
pub struct QuotaBucket {
    limits: QuotaConfig,
    slots: [u32; WINDOW_SLOTS],
    last_minute: u64,
    concurrent_exec: u32,
    memory_bytes_estimate: u64,
    storage_bytes: u64,
    egress_bytes: u64,
    cpu_seconds: u64,
    soft_warned: [bool; KINDS.len()],
}

impl QuotaBucket {
    pub fn new(limits: QuotaConfig) -> Self {
        Self {
            limits,
            slots: [0; WINDOW_SLOTS],
            last_minute: now_minute(),
            concurrent_exec: 0,
            memory_bytes_estimate: 0,
            storage_bytes: 0,
            egress_bytes: 0,
            cpu_seconds: 0,
            soft_warned: [false; KINDS.len()],
        }
    }

    /// Zero out minute slots that have fallen out of the window.
    fn rotate(&mut self, now_min: u64) {
        if now_min <= self.last_minute {
            return;
        }
        let elapsed = (now_min - self.last_minute).min(WINDOW_SLOTS as u64);
        for i in 1..=elapsed {
            let idx = ((self.last_minute + i) % WINDOW_SLOTS as u64) as usize;
            self.slots[idx] = 0;
        }
        self.last_minute = now_min;
    }

    fn execs_in_window(&self) -> u32 {
        self.slots.iter().sum()
    }

    /// Admit one exec, or name the cap that rejected it.
    ///
    /// On success the exec is counted against the window and the
    /// concurrency gauge; the caller must pair it with `release_exec`.
    pub fn admit_exec(&mut self) -> Result<(), QuotaKind> {
        self.admit_exec_at(now_minute())
    }

    pub fn admit_exec_at(&mut self, now_min: u64) -> Result<(), QuotaKind> {
        self.rotate(now_min);

        if exceeded(self.execs_in_window() as u64 + 1, self.limits.max_exec_per_hour as u64) {
            return Err(QuotaKind::ExecRate);
        }
        if exceeded(
            self.concurrent_exec as u64 + 1,
            self.limits.max_concurrent_exec as u64,
        ) {
            return Err(QuotaKind::ConcurrentExec);
        }
        if exceeded(self.memory_bytes_estimate, self.limits.max_memory_bytes) {
            return Err(QuotaKind::Memory);
        }
        if exceeded(self.storage_bytes, self.limits.max_storage_bytes) {
            return Err(QuotaKind::Storage);
        }
        if exceeded(self.egress_bytes, self.limits.max_egress_bytes) {
            return Err(QuotaKind::Egress);
        }
        if exceeded(self.cpu_seconds, self.limits.max_cpu_seconds) {
            return Err(QuotaKind::Cpu);
        }

        let idx = (now_min % WINDOW_SLOTS as u64) as usize;
        self.slots[idx] += 1;
        self.concurrent_exec += 1;
        self.emit_soft_warnings();
        Ok(())
    }

    pub fn release_exec(&mut self) {
        self.concurrent_exec = self.concurrent_exec.saturating_sub(1);
    }

    pub fn charge_storage(&mut self, bytes: u64) {
        self.storage_bytes = self.storage_bytes.saturating_add(bytes);
    }

    pub fn release_storage(&mut self, bytes: u64) {
        self.storage_bytes = self.storage_bytes.saturating_sub(bytes);
    }

    pub fn charge_egress(&mut self, bytes: u64) {
        self.egress_bytes = self.egress_bytes.saturating_add(bytes);
    }

    pub fn charge_cpu(&mut self, seconds: u64) {
        self.cpu_seconds = self.cpu_seconds.saturating_add(seconds);
    }

    pub fn set_memory_estimate(&mut self, bytes: u64) {
        self.memory_bytes_estimate = bytes;
    }

    pub fn concurrent_exec(&self) -> u32 {
        self.concurrent_exec
    }

    fn utilization(&self, kind: QuotaKind) -> f64 {
        let (used, limit) = match kind {
            QuotaKind::ExecRate => (
                self.execs_in_window() as u64,
                self.limits.max_exec_per_hour as u64,
            ),
            QuotaKind::ConcurrentExec => (
                self.concurrent_exec as u64,
                self.limits.max_concurrent_exec as u64,
            ),
            QuotaKind::Memory => (self.memory_bytes_estimate, self.limits.max_memory_bytes),
            QuotaKind::Storage => (self.storage_bytes, self.limits.max_storage_bytes),
            QuotaKind::Egress => (self.egress_bytes, self.limits.max_egress_bytes),
            QuotaKind::Cpu => (self.cpu_seconds, self.limits.max_cpu_seconds),
        };
        if limit == 0 {
            0.0
        } else {
            used as f64 / limit as f64
        }
    }

    /// One warning per crossing of the soft threshold; the latch resets
    /// when utilization falls back under it.
    fn emit_soft_warnings(&mut self) {
        for (i, kind) in KINDS.iter().enumerate() {
            let util = self.utilization(*kind);
            if util >= SOFT_THRESHOLD && !self.soft_warned[i] {
                self.soft_warned[i] = true;
                warn!(
                    kind = kind.as_str(),
                    utilization = format!("{:.0}%", util * 100.0),
                    "quota soft cap crossed"
                );
            } else if util < SOFT_THRESHOLD {
                self.soft_warned[i] = false;
            }
        }
    }
}

/// Hard caps reject when the would-be usage exceeds the limit; zero disables.
fn exceeded(would_be: u64, limit: u64) -> bool {
    limit != 0 && would_be > limit
}

fn now_minute() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() / 60)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(concurrent: u32, per_hour: u32) -> QuotaConfig {
        QuotaConfig {
            max_exec_per_hour: per_hour,
            max_concurrent_exec: concurrent,
            ..QuotaConfig::default()
        }
    }

    #[test]
    fn test_admit_and_release() {
        let mut bucket = QuotaBucket::new(limits(2, 100));
        assert!(bucket.admit_exec_at(0).is_ok());
        assert!(bucket.admit_exec_at(0).is_ok());
        assert_eq!(bucket.admit_exec_at(0), Err(QuotaKind::ConcurrentExec));

        bucket.release_exec();
        assert!(bucket.admit_exec_at(0).is_ok());
    }

    #[test]
    fn test_single_unit_headroom_admits_exactly_one() {
        let mut bucket = QuotaBucket::new(limits(1, 100));
        let first = bucket.admit_exec_at(0);
        let second = bucket.admit_exec_at(0);
        assert!(first.is_ok());
        assert_eq!(second, Err(QuotaKind::ConcurrentExec));
    }

    #[test]
    fn test_exec_rate_window() {
        let mut bucket = QuotaBucket::new(limits(100, 3));
        for _ in 0..3 {
            bucket.admit_exec_at(0).unwrap();
            bucket.release_exec();
        }
        assert_eq!(bucket.admit_exec_at(0), Err(QuotaKind::ExecRate));

        // 30 minutes later the window still holds all three.
        assert_eq!(bucket.admit_exec_at(30), Err(QuotaKind::ExecRate));

        // 61 minutes later the old slots have rotated out.
        assert!(bucket.admit_exec_at(61).is_ok());
    }

    #[test]
    fn test_window_rotation_is_per_slot() {
        let mut bucket = QuotaBucket::new(limits(100, 2));
        bucket.admit_exec_at(0).unwrap();
        bucket.release_exec();
        bucket.admit_exec_at(59).unwrap();
        bucket.release_exec();
        assert_eq!(bucket.admit_exec_at(59), Err(QuotaKind::ExecRate));

        // Minute 60 evicts only the slot from minute 0.
        assert!(bucket.admit_exec_at(60).is_ok());
        bucket.release_exec();
        assert_eq!(bucket.admit_exec_at(60), Err(QuotaKind::ExecRate));
    }

    #[test]
    fn test_long_idle_clears_window() {
        let mut bucket = QuotaBucket::new(limits(100, 1));
        bucket.admit_exec_at(0).unwrap();
        bucket.release_exec();
        assert!(bucket.admit_exec_at(1000).is_ok());
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        let mut bucket = QuotaBucket::new(limits(0, 0));
        for _ in 0..100 {
            assert!(bucket.admit_exec_at(0).is_ok());
        }
    }

    #[test]
    fn test_storage_cap() {
        let mut config = limits(10, 100);
        config.max_storage_bytes = 1000;
        let mut bucket = QuotaBucket::new(config);
        bucket.charge_storage(500);
        assert!(bucket.admit_exec_at(0).is_ok());
        bucket.release_exec();

        bucket.charge_storage(600);
        assert_eq!(bucket.admit_exec_at(0), Err(QuotaKind::Storage));

        bucket.release_storage(600);
        assert!(bucket.admit_exec_at(0).is_ok());
    }

    #[test]
    fn test_memory_and_cpu_caps() {
        let mut config = limits(10, 100);
        config.max_memory_bytes = 1024;
        config.max_cpu_seconds = 10;
        let mut bucket = QuotaBucket::new(config);

        bucket.set_memory_estimate(2048);
        assert_eq!(bucket.admit_exec_at(0), Err(QuotaKind::Memory));
        bucket.set_memory_estimate(512);

        bucket.charge_cpu(11);
        assert_eq!(bucket.admit_exec_at(0), Err(QuotaKind::Cpu));
    }

    #[test]
    fn test_egress_cap() {
        let mut config = limits(10, 100);
        config.max_egress_bytes = 100;
        let mut bucket = QuotaBucket::new(config);
        bucket.charge_egress(101);
        assert_eq!(bucket.admit_exec_at(0), Err(QuotaKind::Egress));
    }

    #[test]
    fn test_soft_warning_latch_resets() {
        let mut bucket = QuotaBucket::new(limits(10, 100));
        for _ in 0..8 {
            bucket.admit_exec_at(0).unwrap();
        }
        // 80% crossed; the latch is set.
        assert!(bucket.soft_warned[1]);

        for _ in 0..8 {
            bucket.release_exec();
        }
        bucket.admit_exec_at(0).unwrap();
        assert!(!bucket.soft_warned[1]);
    }
}
