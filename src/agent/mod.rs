//! Outbound RPC agent.
//!
//! Every queued request gets one supervisor task that fans the message
//! out across the forwarding tree: one worker task per subgroup proxy,
//! at most `AGENT_THREAD_COUNT` active at once, the whole process
//! bounded at `MAX_AGENT_CNT` concurrent supervisors. A watchdog polls
//! worker state at exponentially growing intervals (125 ms to 1 s) and
//! cancels any worker still ACTIVE past `COMMAND_TIMEOUT`, scoring its
//! nodes NO_RESP.
//!
//! Delivery is at-least-once: unanswered retryable requests go to the
//! retry queue and are re-driven (oldest first, behind a minimum-age
//! gate) whenever a supervisor slot frees up or the controller ticks.
//! The mail queue rides the same wake cycle to keep notifications out
//! of the hot path.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::codec::forward::{span, ForwardSpec, ReturnItem};
use crate::codec::msg::{Message, MsgType};
use crate::constants::{AGENT_THREAD_COUNT, COMMAND_TIMEOUT, MAX_AGENT_CNT, RPC_RETRY_INTERVAL};
use crate::controller::Controller;
use crate::error::SchedError;
use crate::job::JobRecord;
use crate::{lifecycle, now, UnixTime};

/// One delivery target.
#[derive(Debug, Clone)]
pub struct AgentTarget {
    pub name: String,
    pub addr: std::net::SocketAddrV4,
}

/// A fan-out request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub msg: Message,
    pub targets: Vec<AgentTarget>,
    /// Re-queue unreachable targets for later redelivery.
    pub retry: bool,
}

struct QueuedRequest {
    req: AgentRequest,
    last_attempt: UnixTime,
}

/// Queued e-mail notification.
pub struct MailNotice {
    pub user_name: String,
    pub message: String,
}

/// Mail mask bits on the job record.
pub const MAIL_JOB_BEGIN: u16 = 0x0001;
pub const MAIL_JOB_END: u16 = 0x0002;
pub const MAIL_JOB_FAIL: u16 = 0x0004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    New,
    Active,
    Done,
    NoResp,
    Failed,
}

struct WorkerMeta {
    state: WorkerState,
    start: UnixTime,
    /// Proxy plus its forwarding descendants.
    nodes: Vec<AgentTarget>,
    results: Vec<ReturnItem>,
}

pub struct Agent {
    tx: mpsc::UnboundedSender<AgentRequest>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<AgentRequest>>>,
    retry_queue: Mutex<VecDeque<QueuedRequest>>,
    mail_queue: Mutex<VecDeque<MailNotice>>,
    supervisors: Arc<Semaphore>,
}

impl Default for Agent {
    fn default() -> Self {
        Agent::new()
    }
}

impl Agent {
    pub fn new() -> Agent {
        let (tx, rx) = mpsc::unbounded_channel();
        Agent {
            tx,
            rx: Mutex::new(Some(rx)),
            retry_queue: Mutex::new(VecDeque::new()),
            mail_queue: Mutex::new(VecDeque::new()),
            supervisors: Arc::new(Semaphore::new(MAX_AGENT_CNT)),
        }
    }

    /// Enqueue a request for delivery. Never blocks; the pump admits
    /// supervisors as slots free up.
    pub fn queue_request(&self, req: AgentRequest) {
        if req.targets.is_empty() {
            return;
        }
        metrics::counter!("agent_requests_total").increment(1);
        if self.tx.send(req).is_err() {
            error!("agent pump is gone, dropping request");
        }
    }

    /// Queue an e-mail notification.
    pub fn queue_mail(&self, notice: MailNotice) {
        self.mail_queue.lock().push_back(notice);
    }

    pub fn retry_depth(&self) -> usize {
        self.retry_queue.lock().len()
    }

    /// Start the pump: admits one supervisor per queued request,
    /// bounded by the process-wide supervisor cap.
    pub fn start(ctl: Arc<Controller>) {
        let mut rx = ctl
            .agent
            .rx
            .lock()
            .take()
            .expect("agent pump started twice");
        let sem = ctl.agent.supervisors.clone();
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let permit = match sem.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let ctl2 = ctl.clone();
                tokio::spawn(async move {
                    run_supervisor(ctl2.clone(), req).await;
                    drop(permit);
                    // a slot just freed: give the retry queue a chance
                    agent_retry(&ctl2, RPC_RETRY_INTERVAL);
                });
            }
        });
    }
}

/// Re-issue one queued request if it has aged at least `min_wait`
/// seconds; otherwise process one queued mail notice. Returns the
/// number of requests still queued.
pub fn agent_retry(ctl: &Arc<Controller>, min_wait: u32) -> usize {
    let agent = &ctl.agent;
    if agent.supervisors.available_permits() == 0 {
        return agent.retry_queue.lock().len(); // too much work already
    }

    let popped = {
        let mut q = agent.retry_queue.lock();
        match q.front() {
            Some(front) if now().saturating_sub(front.last_attempt) > min_wait => q.pop_front(),
            _ => None,
        }
    };

    if let Some(queued) = popped {
        debug!(
            "retrying agent request {:?} for {} nodes",
            queued.req.msg.msg_type(),
            queued.req.targets.len()
        );
        agent.queue_request(queued.req);
    } else {
        let mail = agent.mail_queue.lock().pop_front();
        if let Some(mi) = mail {
            process_mail(mi);
        }
    }
    agent.retry_queue.lock().len()
}

/// Drop every pending retry and mail notice (shutdown path).
pub fn agent_purge(ctl: &Controller) {
    ctl.agent.retry_queue.lock().clear();
    ctl.agent.mail_queue.lock().clear();
}

fn is_srun_msg(t: MsgType) -> bool {
    matches!(
        t,
        MsgType::SrunPing
            | MsgType::SrunTimeout
            | MsgType::SrunNodeFail
            | MsgType::SrunJobComplete
            | MsgType::ResponseResourceAllocation
    )
}

fn is_kill_msg(t: MsgType) -> bool {
    matches!(t, MsgType::RequestTerminateJob | MsgType::RequestKillTimelimit)
}

fn expects_reply(t: MsgType) -> bool {
    !matches!(t, MsgType::RequestShutdown | MsgType::RequestReconfigure)
}

fn msg_job_id(msg: &Message) -> Option<u32> {
    match msg {
        Message::SrunPing(m) | Message::SrunJobComplete(m) => Some(m.job_id),
        Message::SrunTimeout(m) => Some(m.job_id),
        Message::SrunNodeFail(m) => Some(m.job_id),
        Message::ResponseResourceAllocation(m) => Some(m.job_id),
        Message::RequestBatchJobLaunch(m) => Some(m.job_id),
        Message::RequestTerminateJob(m)
        | Message::RequestKillTimelimit(m)
        | Message::RequestAbortJob(m) => Some(m.job_id),
        _ => None,
    }
}

async fn run_supervisor(ctl: Arc<Controller>, req: AgentRequest) {
    let msg_type = req.msg.msg_type();
    let srun_agent = is_srun_msg(msg_type);
    let spans = span(req.targets.len(), 0);
    debug!(
        "agent fan-out {:?} to {} nodes over {} workers",
        msg_type,
        req.targets.len(),
        spans.len()
    );

    let metas: Arc<DashMap<usize, WorkerMeta>> = Arc::new(DashMap::new());
    let worker_sem = Arc::new(Semaphore::new(AGENT_THREAD_COUNT));
    let handles: Arc<Mutex<Vec<Option<tokio::task::JoinHandle<()>>>>> =
        Arc::new(Mutex::new(Vec::new()));

    let mut offset = 0usize;
    for (i, descendants) in spans.iter().enumerate() {
        let group: Vec<AgentTarget> = req.targets[offset..offset + descendants + 1].to_vec();
        offset += descendants + 1;
        metas.insert(
            i,
            WorkerMeta {
                state: WorkerState::New,
                start: 0,
                nodes: group.clone(),
                results: Vec::new(),
            },
        );
        let handle = tokio::spawn(run_worker(
            ctl.clone(),
            req.msg.clone(),
            group,
            i,
            metas.clone(),
            worker_sem.clone(),
        ));
        handles.lock().push(Some(handle));
    }

    watchdog(&metas, &handles).await;

    // cancelled workers are already terminal; reap the rest so their
    // results are fully published before aggregation
    let remaining: Vec<_> = handles.lock().iter_mut().filter_map(|h| h.take()).collect();
    let _ = futures::future::join_all(remaining).await;

    if srun_agent {
        notify_jobs(&ctl, &req.msg, &metas);
    } else {
        notify_nodes(&ctl, &req, &metas);
    }
}

async fn run_worker(
    ctl: Arc<Controller>,
    msg: Message,
    group: Vec<AgentTarget>,
    idx: usize,
    metas: Arc<DashMap<usize, WorkerMeta>>,
    worker_sem: Arc<Semaphore>,
) {
    let _permit = match worker_sem.acquire_owned().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let msg_type = msg.msg_type();

    // don't try to communicate with a defunct job
    if is_srun_msg(msg_type) {
        let proceed = match msg_job_id(&msg) {
            Some(job_id) => {
                let jobs = ctl.jobs.read();
                match jobs.find(job_id) {
                    Some(job) => {
                        job.is_running()
                            || (job.is_completing() && msg_type == MsgType::SrunNodeFail)
                    }
                    None => false,
                }
            }
            None => true,
        };
        if !proceed {
            if let Some(mut m) = metas.get_mut(&idx) {
                m.state = WorkerState::Done;
            }
            return;
        }
    }

    if let Some(mut m) = metas.get_mut(&idx) {
        m.state = WorkerState::Active;
        m.start = now();
    }

    let proxy = group[0].clone();
    let forward = ForwardSpec {
        targets: group[1..].iter().map(|t| t.name.clone()).collect(),
        timeout: COMMAND_TIMEOUT,
    };

    if !expects_reply(msg_type) {
        let state = match ctl.transport.send_only(proxy.addr, &msg).await {
            Ok(()) => WorkerState::Done,
            Err(_) => WorkerState::NoResp,
        };
        if let Some(mut m) = metas.get_mut(&idx) {
            m.state = state;
        }
        return;
    }

    let outcome = ctl
        .transport
        .send_recv(
            proxy.addr,
            &proxy.name,
            &msg,
            forward,
            Duration::from_secs(COMMAND_TIMEOUT as u64),
        )
        .await;

    let (state, results) = match outcome {
        Err(err) => {
            if !is_srun_msg(msg_type) {
                debug!("agent send to {} failed: {}", proxy.name, err);
            }
            (WorkerState::NoResp, Vec::new())
        }
        Ok(items) => classify_results(&ctl, &msg, items),
    };

    if let Some(mut m) = metas.get_mut(&idx) {
        m.state = state;
        m.results = results;
    }
}

/// Map per-node return codes to a worker verdict, handling the
/// downstream special cases along the way.
fn classify_results(
    ctl: &Arc<Controller>,
    msg: &Message,
    items: Vec<ReturnItem>,
) -> (WorkerState, Vec<ReturnItem>) {
    let msg_type = msg.msg_type();
    let kill = is_kill_msg(msg_type);
    let srun = is_srun_msg(msg_type);
    let mut state = WorkerState::Done;
    let mut out = Vec::with_capacity(items.len());

    for mut item in items {
        let rc = SchedError::from_code(item.err);
        if item.err == 0 {
            out.push(item);
            continue;
        }

        // job already gone on the node: mark its epilog complete
        if kill && rc == SchedError::KillJobAlreadyComplete {
            if let Some(job_id) = msg_job_id(msg) {
                lifecycle::handle_epilog_complete(ctl.as_ref(), job_id, &item.node_name, 0);
            }
            item.err = 0;
            out.push(item);
            continue;
        }

        // non-startable batch job: kill it rather than leave it stuck
        if msg_type == MsgType::RequestBatchJobLaunch {
            if let Some(job_id) = msg_job_id(msg) {
                info!(
                    "killing non-startable batch job {}: {}",
                    job_id,
                    SchedError::from_code(item.err)
                );
                lifecycle::job_complete_locked(ctl.as_ref(), job_id, 0, false, 1);
            }
            out.push(item);
            continue;
        }

        match rc {
            SchedError::EpilogFailed => {
                error!("epilog failure on host {}, setting DOWN", item.node_name);
                state = WorkerState::Failed;
            }
            SchedError::PrologFailed => {
                error!("prolog failure on host {}, setting DOWN", item.node_name);
                state = WorkerState::Failed;
            }
            SchedError::InvalidJobId | SchedError::JobNotRunning => {
                // race tolerance: the node already forgot the job
                debug!(
                    "agent rpc to {}: {} (ignored)",
                    item.node_name,
                    SchedError::from_code(item.err)
                );
                item.err = 0;
            }
            _ => {
                if srun {
                    state = WorkerState::Failed;
                } else {
                    // transient failure, don't drain the node
                    warn!(
                        "agent rpc to {} returned {}",
                        item.node_name,
                        SchedError::from_code(item.err)
                    );
                }
            }
        }
        out.push(item);
    }
    (state, out)
}

/// Poll workers until all reach a terminal state, cancelling any that
/// stay ACTIVE past the command timeout.
async fn watchdog(
    metas: &Arc<DashMap<usize, WorkerMeta>>,
    handles: &Arc<Mutex<Vec<Option<tokio::task::JoinHandle<()>>>>>,
) {
    let mut sleep_usec: u64 = 125_000;
    loop {
        tokio::time::sleep(Duration::from_micros(sleep_usec)).await;
        sleep_usec = (sleep_usec * 2).min(1_000_000);

        let now_t = now();
        let mut work_done = true;
        for mut entry in metas.iter_mut() {
            match entry.state {
                WorkerState::New => work_done = false,
                WorkerState::Active => {
                    work_done = false;
                    if now_t > entry.start + COMMAND_TIMEOUT {
                        let idx = *entry.key();
                        debug!("agent worker {} timed out, cancelling", idx);
                        if let Some(handle) = handles.lock()[idx].take() {
                            handle.abort();
                        }
                        entry.state = WorkerState::NoResp;
                    }
                }
                _ => {}
            }
        }
        if work_done {
            break;
        }
    }
}

/// srun-facing completion: nothing to feed back into node state.
fn notify_jobs(ctl: &Arc<Controller>, msg: &Message, metas: &Arc<DashMap<usize, WorkerMeta>>) {
    let delivered = metas
        .iter()
        .any(|m| m.state == WorkerState::Done && !m.nodes.is_empty());
    if let Some(job_id) = msg_job_id(msg) {
        debug!(
            "srun notification {:?} for job {} delivered={}",
            msg.msg_type(),
            job_id,
            delivered
        );
    }
    let _ = ctl;
}

/// Node-facing completion: update responsiveness, down failed nodes,
/// queue retries, and re-drive the scheduler if anything completed.
fn notify_nodes(ctl: &Arc<Controller>, req: &AgentRequest, metas: &Arc<DashMap<usize, WorkerMeta>>) {
    let mut no_resp: Vec<AgentTarget> = Vec::new();

    {
        let _cfg = ctl.config.read();
        let mut nodes = ctl.nodes.write();
        for meta in metas.iter() {
            match meta.state {
                WorkerState::Done => {
                    if meta.results.is_empty() {
                        for t in &meta.nodes {
                            nodes.node_did_resp(&t.name);
                        }
                    } else {
                        for item in &meta.results {
                            if item.err == 0 {
                                nodes.node_did_resp(&item.node_name);
                            }
                        }
                    }
                }
                WorkerState::Failed => {
                    for item in &meta.results {
                        if item.err != 0 {
                            nodes.set_down(&item.node_name, "Prolog/epilog failure");
                        }
                    }
                }
                WorkerState::NoResp => {
                    for t in &meta.nodes {
                        nodes.node_not_resp(&t.name);
                        no_resp.push(t.clone());
                    }
                }
                WorkerState::New | WorkerState::Active => {
                    error!("agent worker finished in non-terminal state");
                }
            }
        }
    }

    // a completed ping sweep releases the interlock
    if matches!(
        req.msg.msg_type(),
        MsgType::RequestPing | MsgType::RequestNodeRegistrationStatus
    ) {
        ctl.ping_end();
    }

    if !no_resp.is_empty() {
        // a batch launch that never arrived requeues the job
        if req.msg.msg_type() == MsgType::RequestBatchJobLaunch {
            if let Some(job_id) = msg_job_id(&req.msg) {
                info!("non-responding node, requeue batch job {}", job_id);
                lifecycle::job_complete_locked(ctl.as_ref(), job_id, 0, true, 0);
            }
        }
        if req.retry {
            debug!(
                "queueing {:?} for retry on {} nodes",
                req.msg.msg_type(),
                no_resp.len()
            );
            ctl.agent.retry_queue.lock().push_back(QueuedRequest {
                req: AgentRequest {
                    msg: req.msg.clone(),
                    targets: no_resp,
                    retry: true,
                },
                last_attempt: now(),
            });
        }
    }
}

/// Resolve a uid to a login name for mail delivery.
pub fn uid_to_name(uid: u32) -> Option<String> {
    let mut buf = vec![0u8; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return None;
    }
    let name = unsafe { std::ffi::CStr::from_ptr(pwd.pw_name) };
    name.to_str().ok().map(|s| s.to_string())
}

fn mail_type_str(mail_type: u16) -> &'static str {
    match mail_type {
        MAIL_JOB_BEGIN => "Began",
        MAIL_JOB_END => "Ended",
        MAIL_JOB_FAIL => "Failed",
        _ => "unknown",
    }
}

/// Queue an e-mail notice of a job state change.
pub fn mail_job_info(ctl: &Controller, job: &JobRecord, mail_type: u16) {
    let user_name = match &job.mail_user {
        Some(u) => u.clone(),
        None => match uid_to_name(job.user_id) {
            Some(u) => u,
            None => {
                error!("no mail recipient for uid {}", job.user_id);
                return;
            }
        },
    };
    let message = format!(
        "Job_id={} Name={} {}",
        job.job_id,
        job.name.as_deref().unwrap_or(""),
        mail_type_str(mail_type)
    );
    info!("mail to {}: {}", user_name, message);
    ctl.agent.queue_mail(MailNotice { user_name, message });
}

/// Hand a notice to the system mail helper.
fn process_mail(mi: MailNotice) {
    tokio::spawn(async move {
        let result = tokio::process::Command::new("mail")
            .arg("-s")
            .arg(&mi.message)
            .arg(&mi.user_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            error!("mail helper failed: {}", e);
        }
    });
}
