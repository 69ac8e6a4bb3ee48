//! Per-adapter deferred-work thread. Interrupts and pending transmits queue
//! a main-process pass; passes requested while one is already queued are
//! coalesced into it.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, trace, warn};

use crate::adapter::Adapter;

enum WorkItem {
    MainProcess,
}

pub(crate) struct WorkQueue {
    label: String,
    tx: Option<Sender<WorkItem>>,
    queued: Arc<AtomicBool>,
    passes: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl WorkQueue {
    pub(crate) fn start(label: &str, adapter: Weak<Adapter>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<WorkItem>();
        let queued = Arc::new(AtomicBool::new(false));
        let passes = Arc::new(AtomicU64::new(0));
        let worker_queued = Arc::clone(&queued);
        let worker_passes = Arc::clone(&passes);
        let worker_label = label.to_string();
        let handle = thread::Builder::new()
            .name(format!("{label}-work"))
            .spawn(move || {
                while let Ok(item) = rx.recv() {
                    match item {
                        WorkItem::MainProcess => {
                            worker_queued.store(false, Ordering::SeqCst);
                            let Some(adapter) = adapter.upgrade() else {
                                break;
                            };
                            if adapter.is_removed() {
                                trace!("{worker_label}: main process skipped, adapter removed");
                                continue;
                            }
                            adapter.run_main_process();
                            worker_passes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                debug!("{worker_label}: work queue drained");
            })?;
        Ok(Self {
            label: label.to_string(),
            tx: Some(tx),
            queued,
            passes,
            handle: Some(handle),
        })
    }

    /// Requests a main-process pass unless one is already queued.
    pub(crate) fn queue_main_work(&self) {
        if self.queued.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.tx.as_ref() {
            if tx.send(WorkItem::MainProcess).is_err() {
                self.queued.store(false, Ordering::SeqCst);
                warn!("{}: work queue closed", self.label);
            }
        }
    }

    pub(crate) fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Flushes queued work and joins the thread.
    pub(crate) fn terminate(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("{}: work queue thread panicked", self.label);
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
