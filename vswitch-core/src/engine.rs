//! Worker threads.
//!
//! One thread per enabled core, pinned to that core when the host has it,
//! walking the core's graph until the engine is stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use core_affinity::CoreId;

use crate::graph::Graph;
use crate::Result;

pub struct Engine {
    stop: Arc<AtomicBool>,
    workers: Vec<Worker>,
}

struct Worker {
    core: u16,
    handle: JoinHandle<()>,
}

impl Engine {
    /// Spawn a worker for every graph. If a spawn fails, the workers
    /// already running are stopped before the error is returned.
    pub fn launch(graphs: Vec<Graph>) -> Result<Self> {
        let host_cores = core_affinity::get_core_ids().unwrap_or_default();

        let mut engine = Engine {
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::with_capacity(graphs.len()),
        };

        for graph in graphs {
            let core = graph.core();
            let pin = host_cores.iter().copied().find(|c| c.id == core as usize);
            let stop = engine.stop.clone();

            let handle = std::thread::Builder::new()
                .name(graph.name().to_string())
                .spawn(move || run(graph, pin, stop))?;

            engine.workers.push(Worker { core, handle });
        }

        Ok(engine)
    }

    pub fn nb_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn cores(&self) -> impl Iterator<Item = u16> + '_ {
        self.workers.iter().map(|w| w.core)
    }

    /// Raise the stop flag and wait for every worker to leave its loop.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);

        for w in self.workers.drain(..) {
            if w.handle.join().is_err() {
                log::error!("worker on core {} panicked", w.core);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut graph: Graph, pin: Option<CoreId>, stop: Arc<AtomicBool>) {
    match pin {
        Some(id) => {
            core_affinity::set_for_current(id);
        }
        None => log::debug!("core {} not present on this host, not pinning", graph.core()),
    }

    if let Err(e) = graph.init() {
        panic!("graph {}: {}", graph.name(), e);
    }

    log::info!("graph {} running on core {}", graph.name(), graph.core());

    while !stop.load(Ordering::Relaxed) {
        if graph.walk() == 0 {
            std::thread::yield_now();
        }
    }

    log::debug!("graph {} stopped", graph.name());
}
