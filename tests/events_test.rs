//! Event path: dual-pipe correlation, filtering and fault suppression.

mod common;

use common::{dual_pix, rdi_only, single_pix, Harness};
use rand::seq::SliceRandom;
use tfe_hw_mgr::event::{IspErrorType, IspEvent, IspEventKind};
use tfe_hw_mgr::hw::mock::MockOp;
use tfe_hw_mgr::hw::{
    HwCommand, HwEvent, HwEventKind, HwFault, OutResId, ResourceKind, TfeInId, UsageType,
};
use tfe_hw_mgr::manager::StartArgs;
use tfe_hw_mgr::ports::InPortInfo;

#[tokio::test]
async fn dual_sof_is_delivered_once_both_cores_report() {
    let h = Harness::new(3);
    let (ctx, rec) = h.acquire_recorded(dual_pix());
    h.mgr.start(ctx, StartArgs::default()).await.unwrap();

    assert!(h.rig.tfe[0].raise_camif(HwEventKind::Sof));
    assert_eq!(rec.count(IspEventKind::Sof), 0);

    assert!(h.rig.tfe[1].raise_camif(HwEventKind::Sof));
    assert_eq!(
        rec.events(),
        vec![IspEvent::Sof {
            hw_idx: 1,
            timestamp: 33_333_333,
            boot_time: 33_334_333,
        }]
    );
    assert!(h.mgr.snapshot(ctx).unwrap().counters.is_zero());
}

#[tokio::test]
async fn shuffled_dual_events_converge_to_one_per_frame() {
    let h = Harness::new(3);
    let (ctx, rec) = h.acquire_recorded(dual_pix());
    let mut rng = rand::thread_rng();
    let frames = 50;

    for _ in 0..frames {
        let mut frame: Vec<(usize, HwEventKind)> = [0, 1]
            .into_iter()
            .flat_map(|unit| {
                [HwEventKind::Sof, HwEventKind::Epoch, HwEventKind::Eof]
                    .into_iter()
                    .map(move |kind| (unit, kind))
            })
            .collect();
        frame.shuffle(&mut rng);
        for (unit, kind) in frame {
            h.rig.tfe[unit].raise_camif(kind);
        }
    }

    assert_eq!(rec.count(IspEventKind::Sof), frames);
    assert_eq!(rec.count(IspEventKind::Epoch), frames);
    assert_eq!(rec.count(IspEventKind::Eof), frames);
    let snap = h.mgr.snapshot(ctx).unwrap();
    assert_eq!(snap.counters.mismatch, 0);
    assert!(snap.counters.is_zero());
}

#[tokio::test]
async fn one_sided_sof_exhausts_the_mismatch_budget() {
    let h = Harness::new(3);
    let (ctx, rec) = h.acquire_recorded(dual_pix());
    h.rig.log.clear();

    for _ in 0..13 {
        h.rig.tfe[0].raise_camif(HwEventKind::Sof);
    }

    assert_eq!(rec.count(IspEventKind::Sof), 0);
    let snap = h.mgr.snapshot(ctx).unwrap();
    assert_eq!(snap.counters.mismatch, 11);
    // IRQ registers of both cores are dumped on the first mismatch only.
    let dumps = h
        .rig
        .log
        .filter(|op| *op == MockOp::Command(HwCommand::DumpIrqRegisters));
    let cores: Vec<u32> = dumps.iter().map(|r| r.hw_idx).collect();
    assert_eq!(cores, vec![0, 1]);
}

#[tokio::test]
async fn dual_reg_update_comes_from_master_only() {
    let h = Harness::new(3);
    let port = InPortInfo::sensor(1, UsageType::Dual, &[OutResId::Full, OutResId::Rdi0]);
    let (_ctx, rec) = h.acquire_recorded(port);

    h.rig.tfe[1].raise_camif(HwEventKind::RegUpdate);
    assert_eq!(rec.count(IspEventKind::RegUpdate), 0);

    h.rig.tfe[0].raise_camif(HwEventKind::RegUpdate);
    assert_eq!(
        rec.events(),
        vec![IspEvent::RegUpdate {
            hw_idx: 0,
            res_id: TfeInId::Camif.raw(),
        }]
    );

    // Per-channel inputs stay quiet while a pixel path exists.
    rec.clear();
    assert!(h.rig.tfe[0].raise(ResourceKind::TfeIn, TfeInId::Rdi0.raw(), HwEventKind::RegUpdate));
    assert!(h.rig.tfe[0].raise(ResourceKind::TfeIn, TfeInId::Rdi0.raw(), HwEventKind::Sof));
    assert!(rec.events().is_empty());
}

#[tokio::test]
async fn rdi_only_context_takes_sof_and_reg_update_from_its_channel() {
    let h = Harness::new(2);
    let (_ctx, rec) = h.acquire_recorded(rdi_only(&[OutResId::Rdi0]));
    let rdi0 = TfeInId::Rdi0.raw();

    h.rig.tfe[1].raise(ResourceKind::TfeIn, rdi0, HwEventKind::Sof);
    h.rig.tfe[1].raise(ResourceKind::TfeIn, rdi0, HwEventKind::Epoch);
    h.rig.tfe[1].raise(ResourceKind::TfeIn, rdi0, HwEventKind::RegUpdate);

    assert_eq!(
        rec.events(),
        vec![
            IspEvent::Sof {
                hw_idx: 1,
                timestamp: 33_333_333,
                boot_time: 33_334_333,
            },
            IspEvent::RegUpdate {
                hw_idx: 1,
                res_id: rdi0,
            },
        ]
    );
}

#[tokio::test]
async fn single_pipe_events_pass_straight_through() {
    let h = Harness::new(3);
    let (_ctx, rec) = h.acquire_recorded(single_pix());

    for kind in [HwEventKind::Sof, HwEventKind::Epoch, HwEventKind::Eof, HwEventKind::Sof] {
        h.rig.tfe[2].raise_camif(kind);
    }
    h.rig.tfe[2].raise(
        ResourceKind::TfeOut,
        OutResId::Full.raw(),
        HwEventKind::Done { handles: vec![7, 9] },
    );

    let timestamps: Vec<u64> = rec
        .events()
        .iter()
        .filter_map(|e| match e {
            IspEvent::Sof { timestamp, .. } => Some(*timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(timestamps, vec![33_333_333, 66_666_666]);
    assert_eq!(rec.count(IspEventKind::Epoch), 1);
    assert_eq!(rec.count(IspEventKind::Eof), 1);
    assert_eq!(
        rec.events().last(),
        Some(&IspEvent::Done {
            handles: vec![7, 9]
        })
    );
}

#[tokio::test]
async fn overflow_suppresses_events_until_recovered() {
    let h = Harness::new(3);
    let (ctx, rec) = h.acquire_recorded(single_pix());

    h.rig.tfe[2].raise_camif(HwEventKind::Error(HwFault::Overflow));
    assert_eq!(rec.errors(), vec![(IspErrorType::Overflow, false)]);
    assert!(h.mgr.snapshot(ctx).unwrap().overflow_pending);

    rec.clear();
    h.rig.tfe[2].raise_camif(HwEventKind::Sof);
    h.rig.tfe[2].raise_camif(HwEventKind::RegUpdate);
    h.rig.tfe[2].raise(
        ResourceKind::TfeOut,
        OutResId::Full.raw(),
        HwEventKind::Done { handles: vec![1] },
    );
    // A second fault on an already pending context is not reported again.
    h.rig.tfe[2].raise_camif(HwEventKind::Error(HwFault::Violation));
    assert!(rec.events().is_empty());
}

#[tokio::test]
async fn violation_is_classified_separately() {
    let h = Harness::new(3);
    let (_ctx, rec) = h.acquire_recorded(single_pix());

    h.rig.tfe[2].raise_camif(HwEventKind::Error(HwFault::Violation));
    assert_eq!(rec.errors(), vec![(IspErrorType::Violation, false)]);
}

#[tokio::test]
async fn events_for_released_contexts_are_dropped() {
    let h = Harness::new(3);
    let (ctx, rec) = h.acquire_recorded(single_pix());
    h.mgr.release(ctx).unwrap();

    h.mgr.handle_hw_event(ctx, HwEvent::camif(HwEventKind::Sof, 2));
    assert!(!h.rig.tfe[2].raise_camif(HwEventKind::Sof));
    assert!(rec.events().is_empty());
}
