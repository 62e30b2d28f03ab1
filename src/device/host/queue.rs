use crate::device::EventTiming;
use crate::error::{ComputeError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, warn};

pub(crate) type Work = Box<dyn FnOnce() -> std::result::Result<(), String> + Send + 'static>;

/// Monotonic origin shared by every queue and event of one host device.
#[derive(Debug)]
pub(crate) struct DeviceClock {
    origin: Instant,
    next_event: AtomicU64,
}

impl DeviceClock {
    pub(crate) fn new() -> Self {
        Self { origin: Instant::now(), next_event: AtomicU64::new(1) }
    }

    #[inline]
    pub(crate) fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Status {
    Queued,
    Running,
    Complete,
    Failed(String),
}

struct EventState {
    id: u64,
    label: &'static str,
    status: Mutex<Status>,
    cond: Condvar,
    timing: Mutex<EventTiming>,
}

/// Completion event of one host command.
#[derive(Clone)]
pub struct HostEvent(Arc<EventState>);

impl HostEvent {
    fn new(id: u64, label: &'static str, queued_ns: u64) -> Self {
        HostEvent(Arc::new(EventState {
            id,
            label,
            status: Mutex::new(Status::Queued),
            cond: Condvar::new(),
            timing: Mutex::new(EventTiming { queued_ns, start_ns: queued_ns, end_ns: queued_ns }),
        }))
    }

    fn set_running(&self, start_ns: u64) {
        self.0.timing.lock().start_ns = start_ns;
        *self.0.status.lock() = Status::Running;
    }

    fn finish(&self, outcome: std::result::Result<(), String>, start_ns: u64, end_ns: u64) {
        {
            let mut t = self.0.timing.lock();
            t.start_ns = start_ns;
            t.end_ns = end_ns;
        }
        let mut status = self.0.status.lock();
        *status = match outcome {
            Ok(()) => Status::Complete,
            Err(msg) => Status::Failed(msg),
        };
        self.0.cond.notify_all();
    }

    /// Blocks until the command finished. The error carries the failure message.
    pub fn wait(&self) -> std::result::Result<(), String> {
        let mut status = self.0.status.lock();
        loop {
            let outcome = match &*status {
                Status::Complete => Some(Ok(())),
                Status::Failed(msg) => {
                    Some(Err(format!("{} #{}: {}", self.0.label, self.0.id, msg)))
                }
                Status::Queued | Status::Running => None,
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            self.0.cond.wait(&mut status);
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(*self.0.status.lock(), Status::Complete)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.0.status.lock(), Status::Failed(_))
    }

    pub fn timing(&self) -> EventTiming {
        *self.0.timing.lock()
    }

    pub fn label(&self) -> &'static str {
        self.0.label
    }
}

impl fmt::Debug for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostEvent")
            .field("id", &self.0.id)
            .field("label", &self.0.label)
            .field("status", &*self.0.status.lock())
            .finish()
    }
}

struct Command {
    event: HostEvent,
    wait: Vec<HostEvent>,
    work: Work,
}

struct QueueInner {
    id: usize,
    tx: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    clock: Arc<DeviceClock>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx.take();
        if let Some(handle) = self.worker.take() {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!(queue = self.id, "host queue worker panicked");
            }
        }
    }
}

/// In-order command queue backed by one worker thread.
#[derive(Clone)]
pub struct HostQueue(Arc<QueueInner>);

impl HostQueue {
    pub(crate) fn spawn(id: usize, clock: Arc<DeviceClock>) -> Result<Self> {
        let (tx, rx) = unbounded::<Command>();
        let worker_clock = clock.clone();
        let worker = std::thread::Builder::new()
            .name(format!("host-queue-{id}"))
            .spawn(move || run_worker(rx, worker_clock))
            .map_err(|e| {
                ComputeError::Initialization(format!("failed to spawn host queue {id}: {e}"))
            })?;
        debug!(queue = id, "host queue started");
        Ok(HostQueue(Arc::new(QueueInner { id, tx: Some(tx), worker: Some(worker), clock })))
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.0.id
    }

    pub(crate) fn submit(
        &self,
        label: &'static str,
        wait: &[HostEvent],
        work: Work,
    ) -> Result<HostEvent> {
        let clock = &self.0.clock;
        let id = clock.next_event.fetch_add(1, Ordering::Relaxed);
        let event = HostEvent::new(id, label, clock.now_ns());
        let cmd = Command { event: event.clone(), wait: wait.to_vec(), work };
        let tx = self
            .0
            .tx
            .as_ref()
            .ok_or_else(|| ComputeError::Device(format!("host queue {} is closed", self.0.id)))?;
        tx.send(cmd)
            .map_err(|_| ComputeError::Device(format!("host queue {} is closed", self.0.id)))?;
        Ok(event)
    }
}

impl fmt::Debug for HostQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostQueue").field(&self.0.id).finish()
    }
}

fn run_worker(rx: Receiver<Command>, clock: Arc<DeviceClock>) {
    for cmd in rx.iter() {
        let dependency = cmd.wait.iter().find_map(|ev| ev.wait().err());
        if let Some(msg) = dependency {
            let now = clock.now_ns();
            cmd.event.finish(Err(format!("dependency failed ({msg})")), now, now);
            continue;
        }
        let start = clock.now_ns();
        cmd.event.set_running(start);
        let outcome = match catch_unwind(AssertUnwindSafe(cmd.work)) {
            Ok(res) => res,
            Err(_) => Err("command panicked".to_string()),
        };
        let end = clock.now_ns();
        cmd.event.finish(outcome, start, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn job(f: impl FnOnce() -> std::result::Result<(), String> + Send + 'static) -> Work {
        Box::new(f)
    }

    fn queue() -> HostQueue {
        HostQueue::spawn(0, Arc::new(DeviceClock::new())).unwrap()
    }

    #[test]
    fn commands_run_in_submission_order() {
        let q = queue();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut last = None;
        for i in 0..8 {
            let log = log.clone();
            last = Some(q.submit("test", &[], job(move || {
                log.lock().push(i);
                Ok(())
            })).unwrap());
        }
        last.unwrap().wait().unwrap();
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn failure_propagates_to_dependents() {
        let q = queue();
        let ran = Arc::new(AtomicUsize::new(0));
        let bad = q.submit("bad", &[], job(|| Err("boom".to_string()))).unwrap();
        let ran2 = ran.clone();
        let dep = q
            .submit("dep", &[bad.clone()], job(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert!(bad.wait().unwrap_err().contains("boom"));
        let err = dep.wait().unwrap_err();
        assert!(err.contains("dependency failed"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cross_queue_dependency_is_honoured() {
        let clock = Arc::new(DeviceClock::new());
        let a = HostQueue::spawn(0, clock.clone()).unwrap();
        let b = HostQueue::spawn(1, clock).unwrap();
        let flag = Arc::new(AtomicUsize::new(0));
        let f1 = flag.clone();
        let first = a
            .submit("first", &[], job(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                f1.store(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        let f2 = flag.clone();
        let second = b
            .submit("second", &[first], job(move || {
                if f2.load(Ordering::SeqCst) == 1 { Ok(()) } else { Err("ran early".to_string()) }
            }))
            .unwrap();
        second.wait().unwrap();
    }

    #[test]
    fn panicking_command_fails_event() {
        let q = queue();
        let ev = q.submit("panic", &[], job(|| panic!("kernel bug"))).unwrap();
        assert!(ev.wait().is_err());
        // The worker survives.
        let ok = q.submit("ok", &[], job(|| Ok(()))).unwrap();
        ok.wait().unwrap();
        assert!(ok.is_complete());
    }

    #[test]
    fn timing_is_ordered() {
        let q = queue();
        let ev = q
            .submit("sleep", &[], job(|| {
                std::thread::sleep(std::time::Duration::from_millis(2));
                Ok(())
            }))
            .unwrap();
        ev.wait().unwrap();
        let t = ev.timing();
        assert!(t.queued_ns <= t.start_ns);
        assert!(t.start_ns < t.end_ns);
        assert!(t.duration_ms() > 0.0);
    }
}
