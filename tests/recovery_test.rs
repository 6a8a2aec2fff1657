//! Fault handling: affected-context expansion and the recovery worker.

mod common;

use common::{dual_pix, next_outcome, rdi_only, recovery_config, single_pix, sorted, Harness};
use std::time::Duration;
use tfe_hw_mgr::error::HwMgrError;
use tfe_hw_mgr::event::IspErrorType;
use tfe_hw_mgr::hw::mock::{FailPoint, MockOp};
use tfe_hw_mgr::hw::{
    CsidPathId, HaltMode, HwCommand, HwEventKind, HwFault, NodeState, OutResId, ResetType,
    ResourceKind, TfeInId,
};
use tfe_hw_mgr::manager::{ConfigArgs, HwUpdateEntry, RecoveryOutcome, StartArgs, StopArgs};

fn overflow() -> HwEventKind {
    HwEventKind::Error(HwFault::Overflow)
}

#[tokio::test]
async fn contexts_sharing_a_core_recover_together() {
    let h = Harness::with_config(2, recovery_config());
    let (dual, dual_rec) = h.acquire_recorded(dual_pix());
    let (rdi, rdi_rec) = h.acquire_recorded(rdi_only(&[OutResId::Rdi0]));
    assert_eq!(h.mgr.snapshot(rdi).unwrap().bases[0].idx, 1);
    for ctx in [dual, rdi] {
        h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    }
    let mut outcomes = h.mgr.subscribe_recovery();
    h.rig.log.clear();

    assert!(h.rig.tfe[1].raise(ResourceKind::TfeIn, TfeInId::Rdi0.raw(), overflow()));
    assert_eq!(dual_rec.errors(), vec![(IspErrorType::Overflow, true)]);
    assert_eq!(rdi_rec.errors(), vec![(IspErrorType::Overflow, true)]);

    match next_outcome(&mut outcomes).await {
        RecoveryOutcome::Recovered { contexts, cores } => {
            assert_eq!(sorted(contexts), sorted(vec![dual, rdi]));
            assert_eq!(cores, vec![0, 1]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let core_resets: Vec<u32> = h
        .rig
        .log
        .resets()
        .iter()
        .filter(|r| r.op == MockOp::Reset(ResetType::Hw))
        .map(|r| r.hw_idx)
        .collect();
    assert_eq!(core_resets, vec![0, 1]);
    assert!(h
        .rig
        .log
        .stops()
        .iter()
        .all(|r| r.op == MockOp::Stop(HaltMode::Immediate)));

    for ctx in [dual, rdi] {
        let snap = h.mgr.snapshot(ctx).unwrap();
        assert!(!snap.overflow_pending);
        assert!(snap.counters.is_zero());
        assert!(snap
            .csid
            .iter()
            .flat_map(|e| e.nodes.iter())
            .all(|n| n.state == NodeState::Streaming));
    }
    h.mgr
        .config_hw(dual, ConfigArgs::update(9, vec![HwUpdateEntry::general(1, 0, 16)]))
        .await
        .unwrap();
}

fn all_nodes_reserved(h: &Harness, ctx: tfe_hw_mgr::CtxHandle) -> bool {
    let snap = h.mgr.snapshot(ctx).unwrap();
    snap.csid
        .iter()
        .chain(snap.tfe_in.iter())
        .chain(snap.tfe_out.iter())
        .flat_map(|e| e.nodes.iter())
        .all(|n| n.state == NodeState::Reserved)
}

#[tokio::test]
async fn acquired_only_context_is_reset_but_not_started() {
    let h = Harness::with_config(2, recovery_config());
    let (dual, _) = h.acquire_recorded(dual_pix());
    let (idle, idle_rec) = h.acquire_recorded(rdi_only(&[OutResId::Rdi0]));
    assert_eq!(h.mgr.snapshot(idle).unwrap().bases[0].idx, 1);
    h.mgr.start(dual, StartArgs::default()).await.unwrap();
    let mut outcomes = h.mgr.subscribe_recovery();
    h.rig.log.clear();

    h.rig.tfe[0].raise_camif(overflow());
    assert_eq!(idle_rec.errors(), vec![(IspErrorType::Overflow, true)]);
    match next_outcome(&mut outcomes).await {
        RecoveryOutcome::Recovered { contexts, cores } => {
            assert_eq!(sorted(contexts), sorted(vec![dual, idle]));
            assert_eq!(cores, vec![0, 1]);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let snap = h.mgr.snapshot(idle).unwrap();
    assert!(!snap.overflow_pending);
    assert!(!snap.init_done);
    assert!(!snap.streaming);
    assert!(all_nodes_reserved(&h, idle));
    assert!(h.rig.log.resets().iter().any(|r| r.hw_idx == 1
        && r.op == MockOp::Reset(ResetType::Path)
        && r.res_id == Some(CsidPathId::Rdi0.raw())));
    assert!(!h
        .rig
        .log
        .starts()
        .iter()
        .any(|r| r.res_id == Some(TfeInId::Rdi0.raw()) && r.kind == Some(ResourceKind::TfeIn)));

    let dual_snap = h.mgr.snapshot(dual).unwrap();
    assert!(dual_snap.streaming);
    assert!(dual_snap
        .csid
        .iter()
        .flat_map(|e| e.nodes.iter())
        .all(|n| n.state == NodeState::Streaming));
}

#[tokio::test]
async fn stopped_context_stays_stopped_after_recovery() {
    let h = Harness::with_config(3, recovery_config());
    let (ctx, _) = h.acquire_recorded(single_pix());
    h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    h.mgr.stop(ctx, StopArgs::default()).await.unwrap();
    let mut outcomes = h.mgr.subscribe_recovery();
    h.rig.log.clear();

    h.rig.tfe[2].raise_camif(overflow());
    assert_eq!(
        next_outcome(&mut outcomes).await,
        RecoveryOutcome::Recovered {
            contexts: vec![ctx],
            cores: vec![2],
        }
    );
    assert!(h.rig.log.starts().is_empty());
    assert!(h.rig.log.stops().is_empty());
    let snap = h.mgr.snapshot(ctx).unwrap();
    assert!(!snap.overflow_pending);
    assert!(!snap.init_done);
    assert!(all_nodes_reserved(&h, ctx));
}

#[tokio::test]
async fn unrelated_cores_are_left_alone() {
    let h = Harness::with_config(3, recovery_config());
    let (dual, dual_rec) = h.acquire_recorded(dual_pix());
    let (single, _) = h.acquire_recorded(single_pix());
    for ctx in [dual, single] {
        h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    }
    let mut outcomes = h.mgr.subscribe_recovery();
    h.rig.log.clear();

    h.rig.tfe[2].raise_camif(overflow());
    assert_eq!(
        next_outcome(&mut outcomes).await,
        RecoveryOutcome::Recovered {
            contexts: vec![single],
            cores: vec![2],
        }
    );
    assert!(dual_rec.errors().is_empty());
    assert!(h.rig.log.stops().iter().all(|r| r.hw_idx == 2));
    assert!(!h.mgr.snapshot(dual).unwrap().overflow_pending);
}

#[tokio::test]
async fn affected_set_is_closed_over_shared_cores() {
    // C sits on core 1 only, A spans cores 0 and 1, B sits on core 0 only. A
    // fault on core 0 reaches C only through A, which is listed after C.
    let h = Harness::new(2);
    let (c, c_rec) = h.acquire_recorded(rdi_only(&[OutResId::Rdi0]));
    let (a, a_rec) = h.acquire_recorded(dual_pix());
    let (b, b_rec) = h.acquire_recorded(rdi_only(&[OutResId::Rdi0]));
    assert_eq!(h.mgr.snapshot(c).unwrap().bases[0].idx, 1);
    assert_eq!(h.mgr.snapshot(b).unwrap().bases[0].idx, 0);
    let mut outcomes = h.mgr.subscribe_recovery();

    assert!(h.rig.tfe[0].raise(ResourceKind::TfeIn, TfeInId::Rdi0.raw(), overflow()));

    for rec in [&a_rec, &b_rec, &c_rec] {
        assert_eq!(rec.errors(), vec![(IspErrorType::Overflow, false)]);
    }
    match next_outcome(&mut outcomes).await {
        RecoveryOutcome::DumpOnly { contexts } => {
            assert_eq!(sorted(contexts), sorted(vec![a, b, c]));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn disabled_recovery_dumps_and_leaves_contexts_halted() {
    let h = Harness::new(3);
    h.mgr.debug_flags().set_reg_dump_enabled(true);
    let (ctx, rec) = h.acquire_recorded(single_pix());
    h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    let mut outcomes = h.mgr.subscribe_recovery();
    h.rig.log.clear();

    h.rig.tfe[2].raise_camif(overflow());
    assert_eq!(rec.errors(), vec![(IspErrorType::Overflow, false)]);
    assert_eq!(
        next_outcome(&mut outcomes).await,
        RecoveryOutcome::DumpOnly {
            contexts: vec![ctx]
        }
    );

    let dumps = h
        .rig
        .log
        .filter(|op| *op == MockOp::Command(HwCommand::DumpRegisters));
    assert_eq!(dumps.len(), 2);
    assert!(h.rig.log.resets().is_empty());
    assert!(h.rig.log.stops().is_empty());

    assert!(h.mgr.snapshot(ctx).unwrap().overflow_pending);
    let err = h
        .mgr
        .config_hw(ctx, ConfigArgs::update(2, vec![HwUpdateEntry::general(1, 0, 16)]))
        .await
        .unwrap_err();
    assert!(matches!(err, HwMgrError::OverflowPending(_)));

    h.mgr.stop(ctx, StopArgs::default()).await.unwrap();
    h.mgr.release(ctx).unwrap();
    assert_eq!(h.rig.reserved_total(), 0);
}

#[tokio::test]
async fn recovery_can_be_enabled_at_runtime() {
    let h = Harness::new(3);
    let (ctx, rec) = h.acquire_recorded(single_pix());
    h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    h.mgr.debug_flags().set_recovery_enabled(true);
    let mut outcomes = h.mgr.subscribe_recovery();

    h.rig.tfe[2].raise_camif(HwEventKind::Error(HwFault::Violation));
    assert_eq!(rec.errors(), vec![(IspErrorType::Violation, true)]);
    assert!(matches!(
        next_outcome(&mut outcomes).await,
        RecoveryOutcome::Recovered { .. }
    ));
}

#[tokio::test]
async fn bus_overflow_is_reported_but_never_recovered() {
    let h = Harness::with_config(3, recovery_config());
    let (ctx, rec) = h.acquire_recorded(single_pix());
    h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    let mut outcomes = h.mgr.subscribe_recovery();
    h.rig.log.clear();

    h.rig.tfe[2].raise(ResourceKind::TfeOut, OutResId::Full.raw(), overflow());
    assert_eq!(rec.errors(), vec![(IspErrorType::BusOverflow, false)]);

    let waited = tokio::time::timeout(Duration::from_millis(100), outcomes.recv()).await;
    assert!(waited.is_err());
    assert!(h.rig.log.resets().is_empty());
    assert!(h.rig.log.stops().is_empty());
}

#[tokio::test]
async fn incomplete_reset_fails_the_cycle() {
    let h = Harness::with_config(3, recovery_config());
    let (ctx, _) = h.acquire_recorded(single_pix());
    h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    h.rig.csid[2].fail(FailPoint::Reset);
    let mut outcomes = h.mgr.subscribe_recovery();

    h.rig.tfe[2].raise_camif(overflow());
    match next_outcome(&mut outcomes).await {
        RecoveryOutcome::Failed { contexts, error } => {
            assert_eq!(contexts, vec![ctx]);
            assert!(error.contains("did not complete"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(h.mgr.snapshot(ctx).unwrap().overflow_pending);
}

#[tokio::test]
async fn faults_after_shutdown_are_reported_but_not_queued() {
    let h = Harness::with_config(3, recovery_config());
    let (ctx, rec) = h.acquire_recorded(single_pix());
    h.mgr.start(ctx, StartArgs::default()).await.unwrap();
    let mut outcomes = h.mgr.subscribe_recovery();
    h.mgr.shutdown().await.unwrap();

    h.rig.tfe[2].raise_camif(overflow());
    assert_eq!(rec.errors().len(), 1);
    let waited = tokio::time::timeout(Duration::from_millis(100), outcomes.recv()).await;
    assert!(waited.is_err());
    assert!(h.mgr.snapshot(ctx).unwrap().overflow_pending);
}
