//! End-to-end scheduler and lifecycle scenarios, driven through the
//! dispatcher exactly as client and node-agent RPCs would arrive.

use std::sync::Arc;

use clusterd::codec::msg::{
    CancelJobStepMsg, CompleteBatchScriptMsg, EpilogCompleteMsg, JobDescMsg, Message,
    NodeRegistrationMsg, SuspendMsg, RESUME_JOB, SUSPEND_JOB,
};
use clusterd::config::{Config, NodeConfig, PartitionConfig};
use clusterd::constants::{INFINITE, NO_VAL};
use clusterd::dispatch::dispatch;
use clusterd::job::BaseState;
use clusterd::{lifecycle, now, sched, Controller};

fn test_config(state_dir: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.cluster_name = "testcluster".into();
    cfg.first_job_id = 42;
    cfg.state_save_location = state_dir.to_string_lossy().into_owned();
    cfg.job_ckpt_dir = state_dir.join("ckpt").to_string_lossy().into_owned();
    cfg.min_job_age = 300;
    cfg.nodes = vec![NodeConfig {
        names: "n[0-3]".into(),
        cpus: 2,
        sockets: 1,
        cores: 2,
        threads: 1,
        real_memory: 1024,
        tmp_disk: 100,
        weight: 1,
        features: vec!["fast".into()],
        port: 6818,
        address: None,
    }];
    cfg.partitions = vec![PartitionConfig {
        name: "debug".into(),
        nodes: "n[0-3]".into(),
        default: true,
        max_time: 60,
        default_time: 30,
        max_nodes: 4,
        min_nodes: 1,
        hidden: false,
        root_only: false,
        disable_root_jobs: false,
        shared: false,
        priority: 10,
        state_up: true,
        allow_groups: vec![],
    }];
    cfg
}

fn controller(state_dir: &std::path::Path) -> Arc<Controller> {
    let ctl = Controller::new(test_config(state_dir)).unwrap();
    {
        let mut nodes = ctl.nodes.write();
        for i in 0..4 {
            nodes
                .register(
                    &NodeRegistrationMsg {
                        node_name: format!("n{}", i),
                        cpus: 2,
                        real_memory: 1024,
                        tmp_disk: 100,
                        ..Default::default()
                    },
                    true,
                )
                .unwrap();
        }
    }
    ctl
}

fn batch_desc(name: &str) -> JobDescMsg {
    let mut desc = JobDescMsg::default();
    desc.user_id = 500;
    desc.group_id = 500;
    desc.name = Some(name.into());
    desc.partition = Some("debug".into());
    desc.num_procs = 4;
    desc.min_nodes = 2;
    desc.time_limit = 5;
    desc.script = Some("#!/bin/sh\nexit 0\n".into());
    desc.work_dir = Some("/tmp".into());
    desc
}

fn submit(ctl: &Arc<Controller>, desc: JobDescMsg) -> u32 {
    match dispatch(ctl, Message::RequestSubmitBatchJob(desc), 500) {
        Message::ResponseSubmitBatchJob(resp) => {
            assert_eq!(resp.error_code, 0, "submit rejected");
            resp.job_id
        }
        other => panic!("unexpected submit reply: {:?}", other),
    }
}

#[test]
fn test_submit_schedule_complete_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());

    // freshly initialized sequence starts at first_job_id
    let job_id = submit(&ctl, batch_desc("hello"));
    assert_eq!(job_id, 42);
    {
        let jobs = ctl.jobs.read();
        let job = jobs.find(job_id).unwrap();
        assert!(job.is_pending());
        assert_eq!(job.batch_flag, 1);
    }

    assert_eq!(sched::schedule(&ctl), 1);
    let lead_node = {
        let jobs = ctl.jobs.read();
        let nodes = ctl.nodes.read();
        let job = jobs.find(job_id).unwrap();
        assert!(job.is_running());
        assert_eq!(job.node_cnt, 2);
        assert_eq!(job.total_procs, 4);
        assert_eq!(job.next_step_id, 1);
        // two allocated nodes left the idle set
        assert_eq!(nodes.idle_bitmap.count(), 2);
        let bm = job.node_bitmap.as_ref().unwrap();
        nodes.get(bm.first_set().unwrap()).name.clone()
    };

    // node agent reports the batch script finished cleanly
    let reply = dispatch(
        &ctl,
        Message::RequestCompleteBatchScript(CompleteBatchScriptMsg {
            job_id,
            job_rc: 0,
            node_rc: 0,
            node_name: lead_node,
        }),
        0,
    );
    assert_eq!(reply, Message::rc(0));
    let allocated: Vec<String> = {
        let jobs = ctl.jobs.read();
        let nodes = ctl.nodes.read();
        let job = jobs.find(job_id).unwrap();
        assert_eq!(job.state.base, BaseState::Complete);
        assert!(job.is_completing());
        job.node_bitmap
            .as_ref()
            .unwrap()
            .iter_set()
            .map(|i| nodes.get(i).name.clone())
            .collect()
    };

    // epilogs drain the COMPLETING flag and re-idle the nodes
    for node in allocated {
        dispatch(
            &ctl,
            Message::MessageEpilogComplete(EpilogCompleteMsg {
                job_id,
                return_code: 0,
                node_name: node,
            }),
            0,
        );
    }
    let jobs = ctl.jobs.read();
    let nodes = ctl.nodes.read();
    let job = jobs.find(job_id).unwrap();
    assert_eq!(job.state.base, BaseState::Complete);
    assert!(!job.is_completing());
    assert_eq!(job.exit_code, 0);
    assert_eq!(nodes.idle_bitmap.count(), 4);
}

#[test]
fn test_afterok_dependency_cancelled_on_parent_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());

    let parent = submit(&ctl, batch_desc("parent"));
    let mut child_desc = batch_desc("child");
    child_desc.dependency = Some(format!("afterok:{}", parent));
    let child = submit(&ctl, child_desc);

    // only the parent can start; the child is dependency-held
    assert_eq!(sched::schedule(&ctl), 1);
    {
        let jobs = ctl.jobs.read();
        assert!(jobs.find(parent).unwrap().is_running());
        assert!(jobs.find(child).unwrap().is_pending());
    }

    // parent's script exits 1
    let lead = {
        let jobs = ctl.jobs.read();
        let nodes = ctl.nodes.read();
        let bm = jobs.find(parent).unwrap().node_bitmap.clone().unwrap();
        bm.iter_set()
            .map(|i| nodes.get(i).name.clone())
            .collect::<Vec<_>>()
    };
    dispatch(
        &ctl,
        Message::RequestCompleteBatchScript(CompleteBatchScriptMsg {
            job_id: parent,
            job_rc: 1,
            node_rc: 0,
            node_name: lead[0].clone(),
        }),
        0,
    );
    for node in lead {
        dispatch(
            &ctl,
            Message::MessageEpilogComplete(EpilogCompleteMsg {
                job_id: parent,
                return_code: 0,
                node_name: node,
            }),
            0,
        );
    }
    {
        let jobs = ctl.jobs.read();
        let p = jobs.find(parent).unwrap();
        assert_eq!(p.state.base, BaseState::Failed);
        assert_eq!(p.exit_code, 1);
    }

    // next tick: the afterok child becomes permanently unsatisfiable
    assert_eq!(sched::schedule(&ctl), 0);
    let jobs = ctl.jobs.read();
    let c = jobs.find(child).unwrap();
    assert_eq!(c.state.base, BaseState::Cancelled);
    assert_eq!(
        c.state_reason,
        clusterd::job::StateReason::Dependency
    );
    assert!(c.exit_code >= 1);
}

#[test]
fn test_requeue_on_node_failure() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());

    let mut desc = batch_desc("requeueable");
    desc.min_nodes = 1;
    desc.num_procs = 1;
    desc.requeue = 1;
    let job_id = submit(&ctl, desc);
    assert_eq!(sched::schedule(&ctl), 1);

    let failed_node = {
        let jobs = ctl.jobs.read();
        let nodes = ctl.nodes.read();
        let bm = jobs.find(job_id).unwrap().node_bitmap.clone().unwrap();
        nodes.get(bm.first_set().unwrap()).name.clone()
    };

    {
        let cfg = ctl.config.read();
        let mut jobs = ctl.jobs.write();
        let mut nodes = ctl.nodes.write();
        nodes.set_down(&failed_node, "test failure");
        let killed =
            lifecycle::kill_running_job_by_node_name(&ctl, &cfg, &mut jobs, &mut nodes, &failed_node);
        assert_eq!(killed, 1);
    }

    {
        let jobs = ctl.jobs.read();
        let job = jobs.find(job_id).unwrap();
        assert!(job.is_pending());
        assert_eq!(job.restart_cnt, 1);
        assert_eq!(job.db_index, 0);
    }

    // epilog from the dead node clears the completing allocation,
    // then the scheduler places the job again on a healthy node
    dispatch(
        &ctl,
        Message::MessageEpilogComplete(EpilogCompleteMsg {
            job_id,
            return_code: 0,
            node_name: failed_node.clone(),
        }),
        0,
    );
    {
        // the relaunch guard defers the job a few seconds; lift it
        let mut jobs = ctl.jobs.write();
        if let Some(d) = jobs.find_mut(job_id).unwrap().details.as_mut() {
            d.begin_time = 0;
        }
    }
    assert_eq!(sched::schedule(&ctl), 1);
    let jobs = ctl.jobs.read();
    let job = jobs.find(job_id).unwrap();
    assert!(job.is_running());
    let bm = job.node_bitmap.as_ref().unwrap();
    let nodes = ctl.nodes.read();
    assert_ne!(nodes.get(bm.first_set().unwrap()).name, failed_node);
}

#[test]
fn test_surviving_node_failure_on_multi_node_job() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());

    let mut desc = batch_desc("tolerant");
    desc.min_nodes = 3;
    desc.num_procs = 3;
    desc.kill_on_node_fail = 0;
    let job_id = submit(&ctl, desc);
    assert_eq!(sched::schedule(&ctl), 1);

    let (first, node_cnt) = {
        let jobs = ctl.jobs.read();
        let nodes = ctl.nodes.read();
        let job = jobs.find(job_id).unwrap();
        let bm = job.node_bitmap.as_ref().unwrap();
        (
            nodes.get(bm.first_set().unwrap()).name.clone(),
            job.node_cnt,
        )
    };
    assert_eq!(node_cnt, 3);

    {
        let cfg = ctl.config.read();
        let mut jobs = ctl.jobs.write();
        let mut nodes = ctl.nodes.write();
        nodes.set_down(&first, "died");
        lifecycle::kill_running_job_by_node_name(&ctl, &cfg, &mut jobs, &mut nodes, &first);
    }

    let jobs = ctl.jobs.read();
    let job = jobs.find(job_id).unwrap();
    assert!(job.is_running(), "job should survive on remaining nodes");
    assert_eq!(job.node_cnt, 2);
    assert!(!job.nodes.as_deref().unwrap().contains(&first));
}

#[test]
fn test_time_limit_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());

    let mut desc = batch_desc("short");
    desc.min_nodes = 1;
    desc.num_procs = 1;
    desc.time_limit = 1;
    let job_id = submit(&ctl, desc);
    assert_eq!(sched::schedule(&ctl), 1);

    // pretend the job started two minutes ago
    {
        let mut jobs = ctl.jobs.write();
        let job = jobs.find_mut(job_id).unwrap();
        job.start_time = now() - 120;
        job.end_time = job.start_time + 60;
    }

    lifecycle::timelimit::job_time_limit(&ctl, 30);

    let jobs = ctl.jobs.read();
    let job = jobs.find(job_id).unwrap();
    assert_eq!(job.state.base, BaseState::Timeout);
    assert!(job.is_completing());
    assert_eq!(job.state_reason, clusterd::job::StateReason::Timeout);
    assert!(job.exit_code >= 1);
}

#[test]
fn test_suspend_resume_preserves_allowance() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());

    let mut desc = batch_desc("pausable");
    desc.min_nodes = 1;
    desc.num_procs = 1;
    desc.time_limit = 60;
    let job_id = submit(&ctl, desc);
    assert_eq!(sched::schedule(&ctl), 1);

    let reply = dispatch(
        &ctl,
        Message::RequestSuspend(SuspendMsg {
            op: SUSPEND_JOB,
            job_id,
        }),
        0,
    );
    assert_eq!(reply, Message::rc(0));
    {
        let jobs = ctl.jobs.read();
        let nodes = ctl.nodes.read();
        let job = jobs.find(job_id).unwrap();
        assert!(job.is_suspended());
        // suspended jobs do not hold node claims
        let bm = job.node_bitmap.as_ref().unwrap();
        assert_eq!(nodes.get(bm.first_set().unwrap()).run_job_cnt, 0);
    }

    // pretend the job ran 10 minutes before suspension
    {
        let mut jobs = ctl.jobs.write();
        jobs.find_mut(job_id).unwrap().pre_sus_time = 600;
    }

    let reply = dispatch(
        &ctl,
        Message::RequestSuspend(SuspendMsg {
            op: RESUME_JOB,
            job_id,
        }),
        0,
    );
    assert_eq!(reply, Message::rc(0));
    let jobs = ctl.jobs.read();
    let job = jobs.find(job_id).unwrap();
    assert!(job.is_running());
    // 60 minutes allowed, 10 consumed: 50 minutes remain
    let expect = now() + 3600 - 600;
    assert!(job.end_time.abs_diff(expect) <= 2);
}

#[test]
fn test_cancel_pending_and_unknown_job() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());
    let job_id = submit(&ctl, batch_desc("doomed"));

    let reply = dispatch(
        &ctl,
        Message::RequestCancelJobStep(CancelJobStepMsg {
            job_id,
            step_id: NO_VAL,
            signal: 9,
            batch_flag: 0,
        }),
        500,
    );
    assert_eq!(reply, Message::rc(0));
    {
        let jobs = ctl.jobs.read();
        assert_eq!(jobs.find(job_id).unwrap().state.base, BaseState::Cancelled);
    }

    // a purged/unknown id is an error, never a crash
    let reply = dispatch(
        &ctl,
        Message::RequestCancelJobStep(CancelJobStepMsg {
            job_id: 99999,
            step_id: NO_VAL,
            signal: 9,
            batch_flag: 0,
        }),
        500,
    );
    assert_eq!(
        reply,
        Message::rc(clusterd::SchedError::InvalidJobId.code())
    );
}

#[test]
fn test_cancel_requires_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());
    let job_id = submit(&ctl, batch_desc("private"));

    let reply = dispatch(
        &ctl,
        Message::RequestCancelJobStep(CancelJobStepMsg {
            job_id,
            step_id: NO_VAL,
            signal: 9,
            batch_flag: 0,
        }),
        777, // someone else
    );
    assert_eq!(
        reply,
        Message::rc(clusterd::SchedError::AccessDenied.code())
    );
}

#[test]
fn test_job_table_cap_returns_retryable_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.max_job_cnt = 1;
    let ctl = Controller::new(cfg).unwrap();

    let first = dispatch(
        &ctl,
        Message::RequestSubmitBatchJob(batch_desc("one")),
        500,
    );
    assert!(matches!(first, Message::ResponseSubmitBatchJob(_)));

    let second = dispatch(
        &ctl,
        Message::RequestSubmitBatchJob(batch_desc("two")),
        500,
    );
    assert_eq!(
        second,
        Message::rc(clusterd::SchedError::JobTableFull.code())
    );
    assert_eq!(ctl.jobs.read().len(), 1);
}

#[test]
fn test_unknown_feature_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());
    let mut desc = batch_desc("fancy");
    desc.features = Some("quantum".into());
    let reply = dispatch(&ctl, Message::RequestSubmitBatchJob(desc), 500);
    assert_eq!(
        reply,
        Message::rc(clusterd::SchedError::InvalidFeature.code())
    );
}

#[test]
fn test_part_limits_enforced_at_submit() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.enforce_part_limits = true;
    let ctl = Controller::new(cfg).unwrap();
    let mut desc = batch_desc("huge");
    desc.min_nodes = 64;
    let reply = dispatch(&ctl, Message::RequestSubmitBatchJob(desc), 500);
    assert_eq!(
        reply,
        Message::rc(clusterd::SchedError::TooManyRequestedNodes.code())
    );
}

#[test]
fn test_partition_deletion_kills_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());
    let running = submit(&ctl, batch_desc("runner"));
    assert_eq!(sched::schedule(&ctl), 1);
    let pending = submit(&ctl, batch_desc("waiter"));

    {
        let mut jobs = ctl.jobs.write();
        let mut nodes = ctl.nodes.write();
        let killed = lifecycle::kill_job_by_part_name(&ctl, &mut jobs, &mut nodes, "debug");
        assert_eq!(killed, 2);
    }
    ctl.parts.write().remove("debug");

    let jobs = ctl.jobs.read();
    assert_eq!(jobs.find(running).unwrap().state.base, BaseState::NodeFail);
    assert_eq!(jobs.find(pending).unwrap().state.base, BaseState::Cancelled);
    assert_eq!(ctl.parts.read().len(), 0);
}

#[test]
fn test_assoc_deletion_cancels_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());
    let assoc_id = ctl.assoc.lock().add_user_assoc(500, "alice", "science", None);

    let job_id = submit(&ctl, batch_desc("banked"));
    {
        let mut jobs = ctl.jobs.write();
        jobs.find_mut(job_id).unwrap().assoc_id = assoc_id;
    }
    ctl.assoc.lock().delete(assoc_id);

    {
        let cfg = ctl.config.read();
        let mut jobs = ctl.jobs.write();
        let mut nodes = ctl.nodes.write();
        let cancelled =
            lifecycle::job_cancel_by_assoc_id(&ctl, &cfg, &mut jobs, &mut nodes, assoc_id);
        assert_eq!(cancelled, 1);
    }
    let jobs = ctl.jobs.read();
    let job = jobs.find(job_id).unwrap();
    assert_eq!(job.state.base, BaseState::Cancelled);
    assert_eq!(job.state_reason, clusterd::job::StateReason::BankAccount);
}

#[test]
fn test_update_job_hold_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());
    let job_id = submit(&ctl, batch_desc("held"));

    let mut hold = JobDescMsg::default();
    hold.job_id = job_id;
    hold.priority = 0;
    assert_eq!(dispatch(&ctl, Message::RequestUpdateJob(hold), 0), Message::rc(0));
    assert_eq!(ctl.jobs.read().find(job_id).unwrap().priority, 0);

    // held jobs never schedule
    assert_eq!(sched::schedule(&ctl), 0);

    let mut release = JobDescMsg::default();
    release.job_id = job_id;
    release.priority = INFINITE;
    assert_eq!(
        dispatch(&ctl, Message::RequestUpdateJob(release), 0),
        Message::rc(0)
    );
    assert!(ctl.jobs.read().find(job_id).unwrap().priority > 1);
    assert_eq!(sched::schedule(&ctl), 1);
}

#[test]
fn test_preempt_requeue_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.preempt_mode = clusterd::config::PreemptMode::Requeue;
    let ctl = Controller::new(cfg).unwrap();
    {
        let mut nodes = ctl.nodes.write();
        for i in 0..4 {
            nodes
                .register(
                    &NodeRegistrationMsg {
                        node_name: format!("n{}", i),
                        cpus: 2,
                        ..Default::default()
                    },
                    true,
                )
                .unwrap();
        }
    }

    let mut desc = batch_desc("victim");
    desc.min_nodes = 1;
    desc.num_procs = 1;
    desc.requeue = 1;
    let job_id = submit(&ctl, desc);
    assert_eq!(sched::schedule(&ctl), 1);

    lifecycle::job_preempt_remove(&ctl, job_id);

    let jobs = ctl.jobs.read();
    let job = jobs.find(job_id).unwrap();
    assert!(job.is_pending());
    assert_eq!(job.restart_cnt, 1);
}

#[test]
fn test_info_queries() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = controller(dir.path());
    let job_id = submit(&ctl, batch_desc("visible"));

    match dispatch(
        &ctl,
        Message::RequestJobInfo(clusterd::codec::msg::LastUpdateMsg::default()),
        500,
    ) {
        Message::ResponseJobInfo(info) => {
            assert_eq!(info.jobs.len(), 1);
            assert_eq!(info.jobs[0].job_id, job_id);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    match dispatch(
        &ctl,
        Message::RequestNodeInfo(clusterd::codec::msg::LastUpdateMsg::default()),
        500,
    ) {
        Message::ResponseNodeInfo(info) => assert_eq!(info.nodes.len(), 4),
        other => panic!("unexpected reply {:?}", other),
    }

    match dispatch(
        &ctl,
        Message::RequestBuildInfo(clusterd::codec::msg::LastUpdateMsg::default()),
        500,
    ) {
        Message::ResponseBuildInfo(info) => {
            assert_eq!(info.cluster_name, "testcluster");
            assert_eq!(info.first_job_id, 42);
        }
        other => panic!("unexpected reply {:?}", other),
    }
}

#[test]
fn test_private_data_hides_other_users_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.private_data = clusterd::config::PRIVATE_JOBS;
    let ctl = Controller::new(cfg).unwrap();
    submit(&ctl, batch_desc("secret"));

    match dispatch(
        &ctl,
        Message::RequestJobInfo(clusterd::codec::msg::LastUpdateMsg::default()),
        777,
    ) {
        Message::ResponseJobInfo(info) => assert!(info.jobs.is_empty()),
        other => panic!("unexpected reply {:?}", other),
    }
}
