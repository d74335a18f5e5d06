//! Multi-worker server: binds listeners, starts one readiness loop per
//! worker thread, and stops them on request.
//!
//! ```no_run
//! use std::sync::Arc;
//! use milli_serve::config::WorkerConfig;
//! use milli_serve::server::Server;
//! use milli_serve::service::Services;
//!
//! let config = Arc::new(WorkerConfig::default());
//! let services = Services::static_files(&config.root_dir);
//! let handle = Server::bind(config, services)?.start()?;
//! handle.shutdown();
//! handle.join();
//! # Ok::<(), milli_serve::error::Error>(())
//! ```

mod connection;
mod exchange;
mod h2_session;
mod h3_session;
mod http1_session;
pub mod keepalive;
pub mod listener;
pub mod poller;
pub mod upstream;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use mio::Waker;
use tracing::{error, info, warn};

use crate::config::{AcceptMode, WorkerConfig};
use crate::error::Error;
use crate::service::Services;

pub use keepalive::KeepAliveTuner;
pub use listener::{Acceptor, bind_reuse_port, bind_tcp};
pub use upstream::{Backoff, Outcome, UpstreamRetry};
pub use worker::Worker;

enum Plan {
    ReusePort(Vec<Vec<mio::net::TcpListener>>),
    Handoff(Acceptor),
}

/// Listeners bound, workers not yet running.
pub struct Server {
    config: Arc<WorkerConfig>,
    services: Services,
    plan: Plan,
    addrs: Vec<SocketAddr>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: Arc<WorkerConfig>, services: Services) -> Result<Self, Error> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = config.worker_count();
        let (plan, addrs) = match config.accept_mode {
            AcceptMode::ReusePort => {
                let per_worker = bind_reuse_port(&config.listen, workers)?;
                let addrs = per_worker
                    .first()
                    .map(|ls| ls.iter().filter_map(|l| l.local_addr().ok()).collect())
                    .unwrap_or_default();
                (Plan::ReusePort(per_worker), addrs)
            }
            AcceptMode::Handoff => {
                let acceptor = Acceptor::new(&config.listen, shutdown.clone())?;
                let addrs = acceptor.local_addrs();
                (Plan::Handoff(acceptor), addrs)
            }
        };
        info!(workers, mode = ?config.accept_mode, ?addrs, "server bound");
        Ok(Self { config, services, plan, addrs, shutdown })
    }

    /// Bound TCP addresses (resolved when a port of 0 was configured).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn start(self) -> Result<ServerHandle, Error> {
        let Server { config, services, plan, shutdown, .. } = self;
        let count = config.worker_count();
        let mut workers = Vec::with_capacity(count);
        let mut acceptor = None;
        match plan {
            Plan::ReusePort(per_worker) => {
                for (i, listeners) in per_worker.into_iter().enumerate() {
                    workers.push(Worker::new(i, config.clone(), services.clone(), listeners, shutdown.clone())?);
                }
            }
            Plan::Handoff(mut a) => {
                for i in 0..count {
                    let mut worker = Worker::new(i, config.clone(), services.clone(), Vec::new(), shutdown.clone())?;
                    worker.set_inbox(a.add_worker(worker.waker()));
                    workers.push(worker);
                }
                acceptor = Some(a);
            }
        }

        let mut wakers = Vec::with_capacity(workers.len());
        let mut threads = Vec::with_capacity(workers.len() + 1);
        for (i, worker) in workers.into_iter().enumerate() {
            wakers.push(worker.waker());
            let thread = thread::Builder::new().name(format!("milli-worker-{i}")).spawn(move || {
                if let Err(e) = worker.run() {
                    error!(worker = i, error = %e, "worker exited with error");
                }
            })?;
            threads.push(thread);
        }
        if let Some(acceptor) = acceptor {
            let thread = thread::Builder::new().name("milli-acceptor".to_string()).spawn(move || {
                if let Err(e) = acceptor.run() {
                    error!(error = %e, "acceptor exited with error");
                }
            })?;
            threads.push(thread);
        }
        Ok(ServerHandle { shutdown, threads, wakers })
    }
}

/// Running server.
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    wakers: Vec<Arc<Waker>>,
}

impl ServerHandle {
    /// Ask every worker to drain and stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for waker in &self.wakers {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "failed to wake worker");
            }
        }
    }

    /// The flag signal handlers set; workers poll it at least every 250ms.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn join(self) {
        for thread in self.threads {
            if thread.join().is_err() {
                error!("server thread panicked");
            }
        }
    }
}

/// Bind, start, and block until SIGINT or SIGTERM has drained the workers.
pub fn run(config: Arc<WorkerConfig>, services: Services) -> Result<(), Error> {
    let handle = Server::bind(config, services)?.start()?;
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, handle.shutdown_flag())?;
    }
    info!("server running");
    handle.join();
    info!("server stopped");
    Ok(())
}
