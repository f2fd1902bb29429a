//! RSU key-rotation coordination.
//!
//! Grounded on `original_source/include/rsu_engine.hh`'s key-sender
//! thread. The original's RSUs are independent OS processes cooperating
//! through a POSIX shared-memory mutex and a pair of barriers; this crate
//! runs every RSU as a thread inside one process, so `RsuCoordination`
//! replaces the shared-memory segment with an in-process
//! `Mutex`/`Barrier` pair serving the same role (Open Question, see
//! DESIGN.md). spec.md §5 already lists the RSU thread's barrier wait as
//! an accepted, non-cancellable suspension point, so `stop()` only takes
//! effect between cycles rather than interrupting a barrier rendezvous.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::mac::{MacEngine, MacKeyEntry};
use crate::protocol::{Protocol, CONTROL_PORT};
use crate::topology::{Coordinate, Topology};

/// Default `RENEW_MAC_INTERVAL` (spec.md §4.8).
pub const DEFAULT_RENEW_INTERVAL: u32 = 3;

/// Shared key matrix and barrier pair joining every `RSUEngine` in one
/// simulated deployment, standing in for the original's shared-memory
/// segment.
pub struct RsuCoordination {
    key_matrix: Mutex<HashMap<i32, MacKeyEntry>>,
    epoch: Mutex<u32>,
    barrier1: Barrier,
    barrier2: Barrier,
}

impl RsuCoordination {
    /// Build coordination state for `rsu_count` cooperating RSUs. Every
    /// `RSUEngine` sharing this handle must be constructed (and must keep
    /// running) for the barriers to ever release.
    #[must_use]
    pub fn new(rsu_count: usize) -> Arc<Self> {
        Arc::new(Self {
            key_matrix: Mutex::new(HashMap::new()),
            epoch: Mutex::new(0),
            barrier1: Barrier::new(rsu_count),
            barrier2: Barrier::new(rsu_count),
        })
    }
}

/// One RSU's key-sender thread.
pub struct RSUEngine {
    running: Mutex<bool>,
    run_cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RSUEngine {
    /// Start the key-sender thread for the RSU positioned at `coord`.
    /// `is_designated` marks the one RSU in `coordination` responsible for
    /// advancing the shared epoch counter (spec.md §4.8 step 3's "lowest
    /// process id"; the caller picks it instead here — see DESIGN.md).
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocol: Arc<Protocol>,
        coordination: Arc<RsuCoordination>,
        mac_engine: Arc<dyn MacEngine>,
        topology: Topology,
        coord: Coordinate,
        is_designated: bool,
        renew_interval: u32,
        period: Duration,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            running: Mutex::new(true),
            run_cv: Condvar::new(),
            thread: Mutex::new(None),
        });
        engine.clone().spawn_thread(
            protocol,
            coordination,
            mac_engine,
            topology,
            coord,
            is_designated,
            renew_interval.max(1),
            period,
        );
        engine
    }

    /// Stop the key-sender thread. Idempotent. Takes effect after this
    /// RSU's current cycle clears `barrier2`.
    pub fn stop(&self) {
        {
            let mut running = self.running.lock().expect("rsu engine running mutex poisoned");
            if !*running {
                return;
            }
            *running = false;
        }
        self.run_cv.notify_all();
        if let Some(h) = self.thread.lock().expect("rsu engine thread mutex poisoned").take() {
            let _ = h.join();
        }
    }

    fn cancellable_sleep(&self, dur: Duration) -> bool {
        let guard = self.running.lock().expect("rsu engine running mutex poisoned");
        let (guard, _) = self
            .run_cv
            .wait_timeout_while(guard, dur, |running| *running)
            .expect("rsu engine running mutex poisoned");
        *guard
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_thread(
        self: Arc<Self>,
        protocol: Arc<Protocol>,
        coordination: Arc<RsuCoordination>,
        mac_engine: Arc<dyn MacEngine>,
        topology: Topology,
        coord: Coordinate,
        is_designated: bool,
        renew_interval: u32,
        period: Duration,
    ) {
        let quadrant_id = topology.quadrant_id(coord);
        let (col, row) = topology.cell(coord);
        let (cols, rows) = topology.size();

        let handle = std::thread::spawn(move || {
            let mut seed = u64::from(protocol.sys().0);
            loop {
                if !*self.running.lock().expect("rsu engine running mutex poisoned") {
                    break;
                }

                {
                    let mut epoch = coordination.epoch.lock().expect("rsu epoch mutex poisoned");
                    if *epoch == 0 {
                        let key = mac_engine.gen_key(seed);
                        seed = seed.wrapping_add(1);
                        coordination
                            .key_matrix
                            .lock()
                            .expect("rsu key matrix mutex poisoned")
                            .insert(quadrant_id, MacKeyEntry { id: quadrant_id, bytes: key });
                    }
                }

                coordination.barrier1.wait();

                if is_designated {
                    let mut epoch = coordination.epoch.lock().expect("rsu epoch mutex poisoned");
                    *epoch = (*epoch + 1) % renew_interval;
                }

                self.cancellable_sleep(period);

                coordination.barrier2.wait();

                let mut entries = Vec::with_capacity(9);
                {
                    let matrix = coordination.key_matrix.lock().expect("rsu key matrix mutex poisoned");
                    for dr in -1..=1 {
                        for dc in -1..=1 {
                            let c = col + dc;
                            let r = row + dr;
                            if c < 0 || r < 0 || c >= cols || r >= rows {
                                continue;
                            }
                            if let Some(entry) = matrix.get(&topology.id_of(c, r)) {
                                entries.push(*entry);
                            }
                        }
                    }
                }
                if !entries.is_empty() {
                    protocol.broadcast_keys(CONTROL_PORT, &entries);
                }

                if !*self.running.lock().expect("rsu engine running mutex poisoned") {
                    break;
                }
            }
        });
        *self.thread.lock().expect("rsu engine thread mutex poisoned") = Some(handle);
    }
}

impl Drop for RSUEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
