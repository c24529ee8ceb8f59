//! Liveness tracking and master/slave failover.
//!
//! The control plane runs a one-second ticker. Each tick it sends a PING on
//! every path and compares the tick counter against the last PONG seen per
//! path: five missed seconds mark a path BAD, a fresh PONG while BAD marks
//! it OK again. The active path for all tap-to-UDP egress is the master
//! whenever the master is OK, the slave otherwise.
//!
//! Writer discipline: the ticker owns the tick counter, statuses and the
//! selector; each UDP receive task owns its path's `last_pong` and receive
//! counters. Other tasks only read, and only need approximate recency, so
//! all fields are relaxed atomics.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use tracing::info;

/// A path becomes BAD after this many seconds without a PONG.
const PONG_TIMEOUT_TICKS: u32 = 5;
/// A BAD path recovers when a PONG arrived within this many ticks.
const PONG_RECOVERY_TICKS: u32 = 4;
/// Counter report interval, in ticks.
const REPORT_INTERVAL_TICKS: u32 = 3600;

/// Identifies one of the two UDP paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathIndex {
    Master = 0,
    Slave = 1,
}

impl PathIndex {
    pub fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            PathIndex::Master => "master",
            PathIndex::Slave => "slave",
        }
    }
}

/// Keepalive counters for one path; reset after every report.
#[derive(Debug, Default)]
pub struct PathCounters {
    ping_send: AtomicU32,
    ping_recv: AtomicU32,
    pong_send: AtomicU32,
    pong_recv: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub ping_send: u32,
    pub ping_recv: u32,
    pub pong_send: u32,
    pub pong_recv: u32,
}

impl PathCounters {
    pub fn record_ping_send(&self) {
        self.ping_send.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ping_recv(&self) {
        self.ping_recv.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pong_send(&self) {
        self.pong_send.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            ping_send: self.ping_send.load(Ordering::Relaxed),
            ping_recv: self.ping_recv.load(Ordering::Relaxed),
            pong_send: self.pong_send.load(Ordering::Relaxed),
            pong_recv: self.pong_recv.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.ping_send.store(0, Ordering::Relaxed);
        self.ping_recv.store(0, Ordering::Relaxed);
        self.pong_send.store(0, Ordering::Relaxed);
        self.pong_recv.store(0, Ordering::Relaxed);
    }
}

/// Per-path liveness state.
#[derive(Debug)]
pub struct PathState {
    pub counters: PathCounters,
    last_pong: AtomicU32,
    healthy: AtomicBool,
}

impl Default for PathState {
    fn default() -> Self {
        Self {
            counters: PathCounters::default(),
            last_pong: AtomicU32::new(0),
            healthy: AtomicBool::new(true),
        }
    }
}

impl PathState {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn last_pong(&self) -> u32 {
        self.last_pong.load(Ordering::Relaxed)
    }
}

/// A path status transition detected by [`ControlState::evaluate_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    WentBad,
    Recovered,
}

/// Shared liveness state for both paths plus the active-path selector.
#[derive(Debug)]
pub struct ControlState {
    ticket: AtomicU32,
    current_remote: AtomicUsize,
    paths: [PathState; 2],
    master_slave: bool,
    last_report: AtomicU32,
}

impl ControlState {
    pub fn new(master_slave: bool) -> Self {
        Self {
            ticket: AtomicU32::new(0),
            current_remote: AtomicUsize::new(PathIndex::Master.as_usize()),
            paths: [PathState::default(), PathState::default()],
            master_slave,
            last_report: AtomicU32::new(0),
        }
    }

    pub fn ticket(&self) -> u32 {
        self.ticket.load(Ordering::Relaxed)
    }

    /// Advance the tick counter; returns the new value.
    pub fn advance_ticket(&self) -> u32 {
        self.ticket.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_remote(&self) -> PathIndex {
        if self.current_remote.load(Ordering::Relaxed) == PathIndex::Slave.as_usize() {
            PathIndex::Slave
        } else {
            PathIndex::Master
        }
    }

    pub fn path(&self, index: PathIndex) -> &PathState {
        &self.paths[index.as_usize()]
    }

    /// Record a PONG on `index`: stamp the current tick and count it.
    pub fn record_pong(&self, index: PathIndex) {
        let path = self.path(index);
        path.last_pong.store(self.ticket(), Ordering::Relaxed);
        path.counters.pong_recv.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-evaluate one path's status against the current tick.
    ///
    /// A master transition moves the selector: to the slave when the master
    /// goes BAD (if a slave exists), back to the master when it recovers. A
    /// slave transition never moves the selector by itself.
    pub fn evaluate_path(&self, index: PathIndex) -> Option<StatusChange> {
        let ticket = self.ticket();
        let path = self.path(index);
        let last_pong = path.last_pong.load(Ordering::Relaxed);
        if path.healthy.load(Ordering::Relaxed) {
            if ticket > last_pong + PONG_TIMEOUT_TICKS {
                path.healthy.store(false, Ordering::Relaxed);
                if self.master_slave && index == PathIndex::Master {
                    self.current_remote
                        .store(PathIndex::Slave.as_usize(), Ordering::Relaxed);
                }
                return Some(StatusChange::WentBad);
            }
        } else if ticket < last_pong + PONG_RECOVERY_TICKS {
            path.healthy.store(true, Ordering::Relaxed);
            if index == PathIndex::Master {
                self.current_remote
                    .store(PathIndex::Master.as_usize(), Ordering::Relaxed);
            }
            return Some(StatusChange::Recovered);
        }
        None
    }

    /// Emit the counter report when due (every hour of ticks) or when
    /// forced by the operator; counters reset only on the periodic report.
    pub fn maybe_report(&self, force: bool) {
        let ticket = self.ticket();
        let due = ticket >= self.last_report.load(Ordering::Relaxed) + REPORT_INTERVAL_TICKS;
        if !force && !due {
            return;
        }
        info!(
            ticket,
            master_slave = self.master_slave,
            master_ok = self.path(PathIndex::Master).is_healthy(),
            slave_ok = self.path(PathIndex::Slave).is_healthy(),
            current_remote = self.current_remote().name(),
            "tunnel status"
        );
        for index in [PathIndex::Master, PathIndex::Slave] {
            let snap = self.path(index).counters.snapshot();
            info!(
                path = index.name(),
                ping_send = snap.ping_send,
                pong_recv = snap.pong_recv,
                ping_recv = snap.ping_recv,
                pong_send = snap.pong_send,
                "keepalive counters"
            );
        }
        if due {
            self.paths[0].counters.reset();
            self.paths[1].counters.reset();
            self.last_report.store(ticket, Ordering::Relaxed);
        }
    }
}
