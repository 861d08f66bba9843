// distributor.rs — sliding-window work-unit distribution
//
// The master hands numbered units to whichever workers have window
// capacity, lowest unit first, and merges results as they arrive.
// Worker disconnects put their in-flight units back in the pool, so
// every unit is processed exactly once no matter how workers come and
// go. Completion is reported in contiguous runs from the bottom.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use rayon::prelude::*;

use myrad_common::console::fatal_error;
use myrad_common::msgbuf::SizeBuf;

use crate::packets::{MpiPacket, MAX_MPI_PACKET};
use crate::transport::Transport;
use crate::vfs::VirtualFileStore;

/// Outstanding assignments allowed per worker before it must return a
/// result.
pub const DEFAULT_WINDOW_SIZE: usize = 4;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Caller-supplied work logic, implemented once per work type
/// (face lighting, vis leafs, static props).
pub trait WorkUnitHandler: Sync {
    /// Compute one unit. `out` is the serialization buffer in
    /// networked mode and None on the local path, where results land
    /// directly in shared memory.
    fn process_work_unit(&self, unit: u64, out: Option<&mut SizeBuf>) -> Result<(), String>;

    /// Master side: merge one unit's serialized results.
    fn receive_result(&self, unit: u64, payload: &[u8]) -> Result<(), String>;

    /// Called whenever the contiguous run of completed units starting
    /// at zero grows; `total` units [0, total) are now complete.
    fn on_work_units_completed(&self, _total: u64) {}

    /// Worker side: an out-of-band file was announced.
    fn on_file_announce(&self, _name: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Unassigned,
    InFlight(usize),
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Cancelling,
    Done,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MasterStats {
    pub completed: u64,
    pub assigned: u64,
    pub results_received: u64,
    pub duplicates_ignored: u64,
    pub requeued: u64,
}

struct WorkerSlot {
    transport: Box<dyn Transport>,
    in_flight: usize,
    dead: bool,
}

pub struct WorkUnitDistributor {
    units: Vec<UnitState>,
    state: RunState,
    window_size: usize,
    /// Lowest unit not yet completed; everything below is done
    lowest_incomplete: u64,
    cancel: Arc<AtomicBool>,
}

impl WorkUnitDistributor {
    pub fn new(num_units: u64, window_size: usize) -> WorkUnitDistributor {
        WorkUnitDistributor {
            units: vec![UnitState::Unassigned; num_units as usize],
            state: RunState::Running,
            window_size: window_size.max(1),
            lowest_incomplete: 0,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancel: no new units are assigned, in-flight units
    /// drain, and run_master returns early.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Shared flag other threads poke to cancel a run in progress.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn completed_count(&self) -> u64 {
        self.units
            .iter()
            .filter(|u| matches!(u, UnitState::Completed))
            .count() as u64
    }

    // ========================================================
    // Master
    // ========================================================

    /// Drive the whole distribution: poll results, requeue after
    /// disconnects, hand out units, and report contiguous completion.
    /// `late_workers` lets connections join mid-run; pass None for a
    /// fixed worker set. Returns the stats and the still-connected
    /// transports so the caller can run its next pass over them.
    pub fn run_master(
        &mut self,
        workers: Vec<Box<dyn Transport>>,
        late_workers: Option<&Receiver<Box<dyn Transport>>>,
        handler: &dyn WorkUnitHandler,
    ) -> Result<(MasterStats, Vec<Box<dyn Transport>>), String> {
        let mut stats = MasterStats::default();
        let mut slots: Vec<WorkerSlot> = workers
            .into_iter()
            .map(|transport| WorkerSlot {
                transport,
                in_flight: 0,
                dead: false,
            })
            .collect();

        loop {
            // Late joiners
            if let Some(rx) = late_workers {
                while let Ok(transport) = rx.try_recv() {
                    slots.push(WorkerSlot {
                        transport,
                        in_flight: 0,
                        dead: false,
                    });
                }
            }

            // Drain results. Frames buffered before a disconnect still
            // arrive here, so nothing a worker finished is lost.
            for w in 0..slots.len() {
                while let Some(frame) = slots[w].transport.recv_timeout(Duration::ZERO) {
                    let packet = match MpiPacket::decode(&frame) {
                        Ok(p) => p,
                        // A desynced worker build would corrupt the map
                        Err(e) => fatal_error(&format!("malformed results packet: {}", e)),
                    };
                    let MpiPacket::WorkUnitResults { unit, payload } = packet else {
                        fatal_error("unexpected packet type from worker");
                    };
                    if unit as usize >= self.units.len() {
                        fatal_error(&format!("results for out-of-range unit {}", unit));
                    }
                    stats.results_received += 1;

                    match self.units[unit as usize] {
                        UnitState::Completed => {
                            // Stale duplicate from a requeued unit
                            stats.duplicates_ignored += 1;
                            continue;
                        }
                        UnitState::InFlight(owner) => {
                            if let Some(slot) = slots.get_mut(owner) {
                                slot.in_flight = slot.in_flight.saturating_sub(1);
                            }
                        }
                        UnitState::Unassigned => {}
                    }
                    self.units[unit as usize] = UnitState::Completed;
                    if let Err(e) = handler.receive_result(unit, &payload) {
                        fatal_error(&format!("processing results for unit {}: {}", unit, e));
                    }
                    self.advance_contiguous(handler);
                }
            }

            // Disconnect sweep: requeue whatever a dead worker held
            for (w, slot) in slots.iter_mut().enumerate() {
                if slot.dead || slot.transport.is_connected() {
                    continue;
                }
                slot.dead = true;
                for unit in self.units.iter_mut() {
                    if *unit == UnitState::InFlight(w) {
                        *unit = UnitState::Unassigned;
                        stats.requeued += 1;
                    }
                }
                slot.in_flight = 0;
                log::info!("worker {} disconnected, units requeued", w);
            }

            if self.cancel.load(Ordering::SeqCst) && self.state == RunState::Running {
                self.state = RunState::Cancelling;
            }

            // Assignment: lowest unassigned unit to any spare window
            if self.state == RunState::Running {
                for (w, slot) in slots.iter_mut().enumerate() {
                    if slot.dead {
                        continue;
                    }
                    while slot.in_flight < self.window_size {
                        let Some(unit) = self.lowest_unassigned() else {
                            break;
                        };
                        let packet = MpiPacket::AssignWorkUnit { unit };
                        if slot.transport.send(&packet.encode()).is_err() {
                            // Sweep picks the disconnect up next round
                            break;
                        }
                        self.units[unit as usize] = UnitState::InFlight(w);
                        slot.in_flight += 1;
                        stats.assigned += 1;
                    }
                }
            }

            // Exit conditions
            if self.lowest_incomplete as usize >= self.units.len() {
                self.state = RunState::Done;
                stats.completed = self.units.len() as u64;
                for slot in &slots {
                    if !slot.dead {
                        let _ = slot.transport.send(&MpiPacket::Done.encode());
                    }
                }
                return Ok((stats, Self::survivors(slots)));
            }
            if self.state == RunState::Cancelling {
                let drained = !self
                    .units
                    .iter()
                    .any(|u| matches!(u, UnitState::InFlight(_)));
                if drained || slots.iter().all(|s| s.dead) {
                    stats.completed = self.completed_count();
                    return Ok((stats, Self::survivors(slots)));
                }
            }
            // With a fixed worker set, losing them all is unrecoverable;
            // with an accept channel, wait for the next joiner.
            if late_workers.is_none() && slots.iter().all(|s| s.dead) {
                return Err("all workers disconnected with work remaining".to_string());
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn survivors(slots: Vec<WorkerSlot>) -> Vec<Box<dyn Transport>> {
        slots
            .into_iter()
            .filter(|s| !s.dead)
            .map(|s| s.transport)
            .collect()
    }

    fn lowest_unassigned(&self) -> Option<u64> {
        self.units
            .iter()
            .position(|u| matches!(u, UnitState::Unassigned))
            .map(|i| i as u64)
    }

    fn advance_contiguous(&mut self, handler: &dyn WorkUnitHandler) {
        let before = self.lowest_incomplete;
        while (self.lowest_incomplete as usize) < self.units.len()
            && self.units[self.lowest_incomplete as usize] == UnitState::Completed
        {
            self.lowest_incomplete += 1;
        }
        if self.lowest_incomplete != before {
            handler.on_work_units_completed(self.lowest_incomplete);
        }
    }
}

// ============================================================
// Worker
// ============================================================

/// Serve assignments until the master says Done or hangs up. Returns
/// how many units this worker processed.
pub fn run_worker(
    transport: &dyn Transport,
    handler: &dyn WorkUnitHandler,
    vfs: &VirtualFileStore,
) -> Result<u64, String> {
    let mut processed = 0u64;
    loop {
        let Some(frame) = transport.recv_timeout(Duration::from_millis(100)) else {
            if !transport.is_connected() {
                return Err("master disconnected".to_string());
            }
            continue;
        };
        let packet = match MpiPacket::decode(&frame) {
            Ok(p) => p,
            Err(e) => fatal_error(&format!("malformed packet from master: {}", e)),
        };
        match packet {
            MpiPacket::AssignWorkUnit { unit } => {
                let mut out = SizeBuf::new(MAX_MPI_PACKET / 2);
                if let Err(e) = handler.process_work_unit(unit, Some(&mut out)) {
                    // Half-computed results would silently corrupt the
                    // master's merge
                    fatal_error(&format!("processing unit {}: {}", unit, e));
                }
                let results = MpiPacket::WorkUnitResults {
                    unit,
                    payload: out.as_slice().to_vec(),
                };
                if transport.send(&results.encode()).is_err() {
                    return Err("master disconnected".to_string());
                }
                processed += 1;
            }
            MpiPacket::FileData { name, data } => {
                vfs.store_named(&name, data);
            }
            MpiPacket::FileAnnounce { name } => {
                handler.on_file_announce(&name);
            }
            MpiPacket::Done => return Ok(processed),
            MpiPacket::WorkUnitResults { .. } => {
                fatal_error("results packet sent to a worker");
            }
        }
    }
}

// ============================================================
// Local path
// ============================================================

/// Single-machine distribution: the identical handler runs on rayon
/// threads with no serialization (the process callback sees None for
/// its transmit buffer). Honors the same cancel flag and contiguous
/// completion reporting as the networked path.
pub fn run_local(
    num_units: u64,
    handler: &dyn WorkUnitHandler,
    cancel: &AtomicBool,
) -> u64 {
    let completed = Mutex::new(vec![false; num_units as usize]);
    let contiguous = AtomicU64::new(0);
    let processed = AtomicU64::new(0);

    (0..num_units).into_par_iter().for_each(|unit| {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = handler.process_work_unit(unit, None) {
            fatal_error(&format!("processing unit {}: {}", unit, e));
        }
        processed.fetch_add(1, Ordering::SeqCst);

        let mut done = completed.lock();
        done[unit as usize] = true;
        let mut low = contiguous.load(Ordering::SeqCst);
        let before = low;
        while (low as usize) < done.len() && done[low as usize] {
            low += 1;
        }
        if low != before {
            contiguous.store(low, Ordering::SeqCst);
            handler.on_work_units_completed(low);
        }
    });

    processed.load(Ordering::SeqCst)
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback_pair;
    use parking_lot::Mutex as PlMutex;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Echo handler: workers serialize the unit index, the master
    /// records which units it received and how often.
    #[derive(Default)]
    struct RecordingHandler {
        received: PlMutex<Vec<u64>>,
        reported: PlMutex<Vec<u64>>,
    }

    impl WorkUnitHandler for RecordingHandler {
        fn process_work_unit(
            &self,
            unit: u64,
            out: Option<&mut SizeBuf>,
        ) -> Result<(), String> {
            if let Some(sb) = out {
                myrad_common::msgbuf::msg_write_u64(sb, unit * 10);
            }
            Ok(())
        }

        fn receive_result(&self, unit: u64, payload: &[u8]) -> Result<(), String> {
            let mut sb = SizeBuf::from_bytes(payload);
            let value = myrad_common::msgbuf::msg_read_u64(&mut sb);
            if value != unit * 10 {
                return Err(format!("bad payload for unit {}", unit));
            }
            self.received.lock().push(unit);
            Ok(())
        }

        fn on_work_units_completed(&self, total: u64) {
            self.reported.lock().push(total);
        }
    }

    fn spawn_worker(
        transport: impl Transport + 'static,
        handler: Arc<RecordingHandler>,
    ) -> std::thread::JoinHandle<Result<u64, String>> {
        std::thread::spawn(move || {
            let vfs = VirtualFileStore::new();
            run_worker(&transport, &*handler, &vfs)
        })
    }

    #[test]
    fn test_two_workers_complete_all_units() {
        let handler = Arc::new(RecordingHandler::default());
        let (m1, w1) = loopback_pair();
        let (m2, w2) = loopback_pair();

        let h1 = spawn_worker(w1, handler.clone());
        let h2 = spawn_worker(w2, handler.clone());

        let mut dist = WorkUnitDistributor::new(20, 2);
        let (stats, survivors) = dist
            .run_master(vec![Box::new(m1), Box::new(m2)], None, &*handler)
            .unwrap();

        assert_eq!(stats.completed, 20);
        assert_eq!(survivors.len(), 2);
        assert_eq!(dist.state(), RunState::Done);

        // Each unit received exactly once
        let received = handler.received.lock();
        let unique: HashSet<u64> = received.iter().copied().collect();
        assert_eq!(received.len(), 20);
        assert_eq!(unique.len(), 20);

        // Contiguous reporting is monotonic and ends at 20
        let reported = handler.reported.lock();
        assert!(reported.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*reported.last().unwrap(), 20);

        assert!(h1.join().unwrap().is_ok());
        assert!(h2.join().unwrap().is_ok());
    }

    /// Worker B completes a couple of units then
    /// dies; late-joining worker C finishes the rest; all units
    /// complete exactly once.
    #[test]
    fn test_worker_disconnect_requeues() {
        let handler = Arc::new(RecordingHandler::default());

        // Worker B: processes its first two assignments, then dies.
        let (mb, wb) = loopback_pair();
        let hb = std::thread::spawn(move || {
            let mut done = 0;
            while done < 2 {
                let Some(frame) = wb.recv_timeout(Duration::from_secs(2)) else {
                    break;
                };
                let Ok(MpiPacket::AssignWorkUnit { unit }) = MpiPacket::decode(&frame)
                else {
                    break;
                };
                let mut sb = SizeBuf::new(64);
                myrad_common::msgbuf::msg_write_u64(&mut sb, unit * 10);
                let results = MpiPacket::WorkUnitResults {
                    unit,
                    payload: sb.as_slice().to_vec(),
                };
                wb.send(&results.encode()).unwrap();
                done += 1;
            }
            // Dropping wb severs the connection with units in flight
        });

        // Worker C joins late through the accept channel
        let (mc, wc) = loopback_pair();
        let (late_tx, late_rx) = crossbeam::channel::unbounded::<Box<dyn Transport>>();
        let handler_c = handler.clone();
        let hc = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            late_tx.send(Box::new(mc)).unwrap();
            let vfs = VirtualFileStore::new();
            run_worker(&wc, &*handler_c, &vfs)
        });

        let mut dist = WorkUnitDistributor::new(10, 4);
        let (stats, survivors) = dist
            .run_master(vec![Box::new(mb)], Some(&late_rx), &*handler)
            .unwrap();

        assert_eq!(stats.completed, 10);
        assert_eq!(survivors.len(), 1, "only worker C survives");
        assert!(stats.requeued > 0, "B's in-flight units were requeued");

        let received = handler.received.lock();
        let unique: HashSet<u64> = received.iter().copied().collect();
        assert_eq!(unique.len(), 10, "every unit delivered");
        assert_eq!(received.len(), 10, "no unit processed twice");
        assert_eq!(*handler.reported.lock().last().unwrap(), 10);

        hb.join().unwrap();
        assert!(hc.join().unwrap().is_ok());
    }

    #[test]
    fn test_cancellation_stops_assignment() {
        let handler = Arc::new(RecordingHandler::default());

        // A worker that answers slowly, so cancel lands mid-run
        let (m1, w1) = loopback_pair();
        let h = std::thread::spawn(move || {
            let mut served = 0u64;
            loop {
                let Some(frame) = w1.recv_timeout(Duration::from_millis(500)) else {
                    return served;
                };
                match MpiPacket::decode(&frame) {
                    Ok(MpiPacket::AssignWorkUnit { unit }) => {
                        std::thread::sleep(Duration::from_millis(20));
                        let mut sb = SizeBuf::new(64);
                        myrad_common::msgbuf::msg_write_u64(&mut sb, unit * 10);
                        let results = MpiPacket::WorkUnitResults {
                            unit,
                            payload: sb.as_slice().to_vec(),
                        };
                        if w1.send(&results.encode()).is_err() {
                            return served;
                        }
                        served += 1;
                    }
                    _ => return served,
                }
            }
        });

        let mut dist = WorkUnitDistributor::new(1000, 2);
        let cancel = dist.cancel_handle();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            cancel.store(true, Ordering::SeqCst);
        });

        let (stats, _survivors) = dist
            .run_master(vec![Box::new(m1)], None, &*handler)
            .unwrap();

        assert!(stats.completed < 1000, "cancel returned early");
        assert_eq!(dist.state(), RunState::Cancelling);
        h.join().unwrap();
    }

    #[test]
    fn test_local_path_processes_all() {
        struct LocalHandler {
            seen_none_buffer: AtomicBool,
            reported: PlMutex<Vec<u64>>,
        }
        impl WorkUnitHandler for LocalHandler {
            fn process_work_unit(
                &self,
                _unit: u64,
                out: Option<&mut SizeBuf>,
            ) -> Result<(), String> {
                if out.is_none() {
                    self.seen_none_buffer.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
            fn receive_result(&self, _unit: u64, _payload: &[u8]) -> Result<(), String> {
                unreachable!("local path never serializes results");
            }
            fn on_work_units_completed(&self, total: u64) {
                self.reported.lock().push(total);
            }
        }

        let handler = LocalHandler {
            seen_none_buffer: AtomicBool::new(false),
            reported: PlMutex::new(Vec::new()),
        };
        let cancel = AtomicBool::new(false);
        let processed = run_local(64, &handler, &cancel);

        assert_eq!(processed, 64);
        assert!(handler.seen_none_buffer.load(Ordering::SeqCst));
        assert_eq!(*handler.reported.lock().last().unwrap(), 64);
    }

    #[test]
    fn test_local_cancel_skips_remaining() {
        struct CancellingHandler<'a> {
            cancel: &'a AtomicBool,
        }
        impl WorkUnitHandler for CancellingHandler<'_> {
            fn process_work_unit(
                &self,
                unit: u64,
                _out: Option<&mut SizeBuf>,
            ) -> Result<(), String> {
                if unit == 0 {
                    self.cancel.store(true, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            }
            fn receive_result(&self, _unit: u64, _payload: &[u8]) -> Result<(), String> {
                Ok(())
            }
        }

        let cancel = AtomicBool::new(false);
        let handler = CancellingHandler { cancel: &cancel };
        let processed = run_local(10_000, &handler, &cancel);
        assert!(processed < 10_000);
    }
}
