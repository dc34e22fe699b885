//! Process-wide controller state and the long-running service tasks.
//!
//! Four named reader-writer locks guard the shared state and are only
//! ever taken in this order: config, jobs, nodes, partitions. Partial
//! subsets are fine; taking them out of order is not. The association
//! cache, reservation ledger, and license ledger sit behind separate
//! mutexes acquired innermost. The agent queues live for the process
//! lifetime and drain on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::acct::{FlatfileJobComp, JobAcctSink, JobCompSink, LogAcctSink, NullJobComp};
use crate::agent::{Agent, AgentRequest, AgentTarget};
use crate::assoc::AssocCache;
use crate::codec::msg::Message;
use crate::config::Config;
use crate::constants::{
    PERIODIC_CHECKPOINT, PERIODIC_PURGE, PERIODIC_SCHEDULE, PERIODIC_TIMEOUT, RPC_RETRY_INTERVAL,
};
use crate::error::SchedResult;
use crate::job::table::JobTable;
use crate::license::LicenseLedger;
use crate::node::NodeRegistry;
use crate::partition::PartTable;
use crate::reservation::ResvLedger;
use crate::sched::select::{LinearSelector, Selector};
use crate::transport::{NodeTransport, TcpTransport};
use crate::{lifecycle, now, sched, state};

pub struct Controller {
    pub config: RwLock<Config>,
    pub jobs: RwLock<JobTable>,
    pub nodes: RwLock<NodeRegistry>,
    pub parts: RwLock<PartTable>,

    // innermost, self-contained locks
    pub assoc: Mutex<AssocCache>,
    pub resv: Mutex<ResvLedger>,
    pub licenses: Mutex<LicenseLedger>,

    pub acct: Box<dyn JobAcctSink>,
    pub jobcomp: Box<dyn JobCompSink>,
    pub selector: Box<dyn Selector>,
    pub transport: Arc<dyn NodeTransport>,
    pub agent: Agent,

    sched_wake: Notify,
    shutdown: AtomicBool,
    ping_in_progress: AtomicBool,
}

impl Controller {
    /// Build a controller from configuration with the default plugin
    /// set (log accounting, flatfile jobcomp, linear selection, TCP).
    pub fn new(config: Config) -> SchedResult<Arc<Controller>> {
        let jobcomp: Box<dyn JobCompSink> = if config.job_comp_loc.is_empty() {
            Box::new(NullJobComp)
        } else {
            Box::new(FlatfileJobComp::new(config.job_comp_loc.clone().into()))
        };
        Controller::with_plugins(
            config,
            Box::new(LogAcctSink::default()),
            jobcomp,
            Box::new(LinearSelector),
            Arc::new(TcpTransport),
        )
    }

    /// Build with explicit plugin implementations (tests substitute
    /// mocks here).
    pub fn with_plugins(
        config: Config,
        acct: Box<dyn JobAcctSink>,
        jobcomp: Box<dyn JobCompSink>,
        selector: Box<dyn Selector>,
        transport: Arc<dyn NodeTransport>,
    ) -> SchedResult<Arc<Controller>> {
        let nodes = NodeRegistry::from_config(&config)?;
        let parts = PartTable::from_config(&config, &nodes)?;
        let licenses = LicenseLedger::from_config(&config);
        let jobs = JobTable::new(config.first_job_id, config.max_job_cnt);

        Ok(Arc::new(Controller {
            config: RwLock::new(config),
            jobs: RwLock::new(jobs),
            nodes: RwLock::new(nodes),
            parts: RwLock::new(parts),
            assoc: Mutex::new(AssocCache::new()),
            resv: Mutex::new(ResvLedger::default()),
            licenses: Mutex::new(licenses),
            acct,
            jobcomp,
            selector,
            transport,
            agent: Agent::new(),
            sched_wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            ping_in_progress: AtomicBool::new(false),
        }))
    }

    pub fn cluster_name(&self) -> String {
        self.config.read().cluster_name.clone()
    }

    /// Ask the scheduler to run soon.
    pub fn wake_scheduler(&self) {
        self.sched_wake.notify_one();
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Begin shutdown: stop periodic work and drain the agent queues.
    pub fn begin_shutdown(&self) {
        info!("controller shutting down");
        self.shutdown.store(true, Ordering::Relaxed);
        self.sched_wake.notify_waiters();
        crate::agent::agent_purge(self);
    }

    /// Serialize only one ping sweep at a time.
    pub fn ping_begin(&self) -> bool {
        !self.ping_in_progress.swap(true, Ordering::Relaxed)
    }

    pub fn ping_end(&self) {
        self.ping_in_progress.store(false, Ordering::Relaxed);
    }

    /// Recover persisted state: job records, bitmaps, counters, and
    /// on-disk job files. Call once before `start`.
    pub fn recover(self: &Arc<Self>) {
        let cfg = self.config.read().clone();
        let mut jobs = self.jobs.write();
        match state::load_all_job_state(self, &cfg, &mut jobs) {
            Ok(count) => {
                let mut nodes = self.nodes.write();
                let parts = self.parts.read();
                state::reset_job_bitmaps(self, &cfg, &mut jobs, &mut nodes, &parts);
                state::sync_job_files(&cfg, &mut jobs);
                info!("recovered {} jobs from state file", count);
            }
            Err(err) => {
                info!("no job state recovered: {}", err);
            }
        }
    }

    /// Spawn the long-running service tasks: agent pump, scheduler,
    /// time-limit enforcement, state save, purge, node ping, and the
    /// RPC dispatcher.
    pub async fn start(self: &Arc<Self>) -> SchedResult<()> {
        Agent::start(self.clone());

        // scheduler: periodic plus on-demand wakes
        {
            let ctl = self.clone();
            tokio::spawn(async move {
                loop {
                    let timeout = tokio::time::sleep(Duration::from_secs(PERIODIC_SCHEDULE as u64));
                    tokio::select! {
                        _ = timeout => {}
                        _ = ctl.sched_wake.notified() => {}
                    }
                    if ctl.shutting_down() {
                        break;
                    }
                    let started = sched::schedule(&ctl);
                    if started > 0 {
                        if let Err(err) = state::dump_all_job_state(&ctl) {
                            error!("job state save failed: {}", err);
                        }
                    }
                    crate::agent::agent_retry(&ctl, RPC_RETRY_INTERVAL);
                }
            });
        }

        // time-limit and health enforcement
        {
            let ctl = self.clone();
            tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(Duration::from_secs(PERIODIC_TIMEOUT as u64));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if ctl.shutting_down() {
                        break;
                    }
                    lifecycle::timelimit::job_time_limit(&ctl, PERIODIC_TIMEOUT);
                    sched::set_job_elig_time(&ctl);
                }
            });
        }

        // periodic state checkpoint
        {
            let ctl = self.clone();
            tokio::spawn(async move {
                let mut tick =
                    tokio::time::interval(Duration::from_secs(PERIODIC_CHECKPOINT as u64));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if ctl.shutting_down() {
                        break;
                    }
                    if let Err(err) = state::dump_all_job_state(&ctl) {
                        error!("job state save failed: {}", err);
                    }
                }
            });
        }

        // old-record purge
        {
            let ctl = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(PERIODIC_PURGE as u64));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if ctl.shutting_down() {
                        break;
                    }
                    lifecycle::purge_old_jobs(&ctl);
                }
            });
        }

        // node liveness: ping stale nodes, down unresponsive ones
        {
            let ctl = self.clone();
            tokio::spawn(async move {
                let period = {
                    let cfg = ctl.config.read();
                    (cfg.node_timeout / 3).max(10)
                };
                let mut tick = tokio::time::interval(Duration::from_secs(period as u64));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if ctl.shutting_down() {
                        break;
                    }
                    ctl.ping_nodes();
                }
            });
        }

        // client/node RPC dispatcher
        crate::dispatch::serve(self.clone()).await
    }

    /// One ping sweep: fan a PING out to nodes that have gone quiet
    /// and take truly dead ones out of service.
    pub fn ping_nodes(self: &Arc<Self>) {
        if !self.ping_begin() {
            debug!("ping sweep already in progress");
            return;
        }
        let (stale_targets, dead_names) = {
            let cfg = self.config.read();
            let nodes = self.nodes.read();
            let now_t = now();
            let ping_cutoff = now_t.saturating_sub((cfg.node_timeout / 3).max(10));
            let dead_cutoff = now_t.saturating_sub(cfg.node_timeout);

            let mut stale = Vec::new();
            let mut dead = Vec::new();
            for (_, rec) in nodes.iter() {
                if rec.is_down() || rec.state == crate::node::NodeState::Unknown {
                    continue;
                }
                if rec.last_response < dead_cutoff {
                    dead.push(rec.name.clone());
                } else if rec.last_response < ping_cutoff {
                    stale.push(AgentTarget {
                        name: rec.name.clone(),
                        addr: rec.addr,
                    });
                }
            }
            (stale, dead)
        };

        for name in dead_names {
            let cfg = self.config.read();
            let mut jobs = self.jobs.write();
            let mut nodes = self.nodes.write();
            error!("node {} not responding, setting DOWN", name);
            nodes.set_down(&name, "Not responding");
            lifecycle::kill_running_job_by_node_name(self, &cfg, &mut jobs, &mut nodes, &name);
        }

        // interactive clients get a liveness probe on the same cadence
        self.srun_ping_jobs();

        if stale_targets.is_empty() {
            self.ping_end();
            return;
        }
        debug!("pinging {} quiet nodes", stale_targets.len());
        self.agent.queue_request(AgentRequest {
            msg: Message::RequestPing,
            targets: stale_targets,
            retry: false,
        });
    }

    /// Probe the allocating client of every running interactive job.
    fn srun_ping_jobs(self: &Arc<Self>) {
        let _cfg = self.config.read();
        let jobs = self.jobs.read();
        for job in jobs.iter() {
            if job.is_running() && job.batch_flag == 0 && job.other_port != 0 {
                crate::srun::srun_ping(self, job);
            }
        }
    }
}
