//! Per-context commands and capability queries.

mod common;

use common::{dual_pix, rdi_only, single_pix, Harness};
use tfe_hw_mgr::error::HwMgrError;
use tfe_hw_mgr::hw::mock::MockOp;
use tfe_hw_mgr::hw::{BwControl, HwCommand, HwType, OutResId};
use tfe_hw_mgr::manager::{
    CmdReply, ConfigArgs, CtxType, DumpReason, HwMgrCmd, HwUpdateEntry, IoBufInfo, StartArgs,
};

fn commands(h: &Harness, cmd: HwCommand) -> Vec<u32> {
    h.rig
        .log
        .filter(|op| *op == MockOp::Command(cmd.clone()))
        .iter()
        .map(|r| r.hw_idx)
        .collect()
}

#[tokio::test]
async fn context_type_reflects_pixel_path() {
    let h = Harness::new(3);
    let pix = h.acquire(single_pix());
    let rdi = h.acquire(rdi_only(&[OutResId::Rdi1]));

    assert_eq!(
        h.mgr.cmd(pix, HwMgrCmd::CtxType).unwrap(),
        CmdReply::CtxType(CtxType::Pix)
    );
    assert_eq!(
        h.mgr.cmd(rdi, HwMgrCmd::CtxType).unwrap(),
        CmdReply::CtxType(CtxType::Rdi)
    );
}

#[tokio::test]
async fn pause_and_resume_toggle_bandwidth_on_every_input() {
    let h = Harness::new(3);
    let ctx = h.acquire(dual_pix());
    h.rig.log.clear();

    assert_eq!(h.mgr.cmd(ctx, HwMgrCmd::Pause).unwrap(), CmdReply::Done);
    assert_eq!(
        commands(&h, HwCommand::BwControl(BwControl::Exclude)),
        vec![0, 1]
    );

    assert_eq!(h.mgr.cmd(ctx, HwMgrCmd::Resume).unwrap(), CmdReply::Done);
    assert_eq!(
        commands(&h, HwCommand::BwControl(BwControl::Include)),
        vec![0, 1]
    );
}

#[tokio::test]
async fn sof_debug_reaches_csid_and_camif() {
    let h = Harness::new(3);
    let ctx = h.acquire(single_pix());
    h.rig.log.clear();

    h.mgr.cmd(ctx, HwMgrCmd::SofDebug(true)).unwrap();
    let toggled = h.rig.log.filter(|op| *op == MockOp::Command(HwCommand::SofIrqDebug(true)));
    let types: Vec<HwType> = toggled.iter().map(|r| r.hw_type).collect();
    assert_eq!(types, vec![HwType::Csid, HwType::Tfe]);
    assert!(toggled.iter().all(|r| r.hw_idx == 2));
}

#[tokio::test]
async fn register_dump_runs_once_per_request_and_reason() {
    let h = Harness::new(3);
    let ctx = h.acquire(single_pix());

    // Nothing applied yet, and nothing dumped for request 0.
    assert_eq!(
        h.mgr
            .cmd(ctx, HwMgrCmd::RegDump { reason: DumpReason::Flush })
            .unwrap(),
        CmdReply::RegDump {
            dumped: false,
            req_id: 0
        }
    );

    let init = ConfigArgs::init(5, vec![HwUpdateEntry::general(1, 0, 64)]);
    h.mgr
        .start(ctx, StartArgs { config: init, start_only: false })
        .await
        .unwrap();
    h.rig.log.clear();

    let flush = HwMgrCmd::RegDump { reason: DumpReason::Flush };
    assert_eq!(
        h.mgr.cmd(ctx, flush.clone()).unwrap(),
        CmdReply::RegDump {
            dumped: true,
            req_id: 5
        }
    );
    assert_eq!(commands(&h, HwCommand::DumpRegisters).len(), 2);

    assert_eq!(
        h.mgr.cmd(ctx, flush).unwrap(),
        CmdReply::RegDump {
            dumped: false,
            req_id: 5
        }
    );
    assert_eq!(commands(&h, HwCommand::DumpRegisters).len(), 2);

    assert_eq!(
        h.mgr
            .cmd(ctx, HwMgrCmd::RegDump { reason: DumpReason::Error })
            .unwrap(),
        CmdReply::RegDump {
            dumped: true,
            req_id: 5
        }
    );
    let snap = h.mgr.snapshot(ctx).unwrap();
    assert_eq!(snap.last_dump_flush_req_id, 5);
    assert_eq!(snap.last_dump_err_req_id, 5);
}

#[tokio::test]
async fn page_fault_dump_names_the_buffer_holding_the_address() {
    let h = Harness::new(3);
    let ctx = h.acquire(single_pix());
    let full = IoBufInfo {
        port: OutResId::Full,
        mem_handle: 11,
        iova: 0x10_0000,
        len: 0x8000,
    };
    let stats = IoBufInfo {
        port: OutResId::StatsBf,
        mem_handle: 12,
        iova: 0x20_0000,
        len: 0x1000,
    };

    let reply = h
        .mgr
        .cmd(
            ctx,
            HwMgrCmd::PageFaultDump {
                fault_addr: 0x20_0800,
                buffers: vec![full, stats],
            },
        )
        .unwrap();
    assert_eq!(
        reply,
        CmdReply::PageFault {
            culprit: Some(stats)
        }
    );

    let reply = h
        .mgr
        .cmd(
            ctx,
            HwMgrCmd::PageFaultDump {
                fault_addr: 0x30_0000,
                buffers: vec![full, stats],
            },
        )
        .unwrap();
    assert_eq!(reply, CmdReply::PageFault { culprit: None });
}

#[tokio::test]
async fn commands_on_free_context_are_rejected() {
    let h = Harness::new(2);
    let ctx = h.acquire(single_pix());
    h.mgr.release(ctx).unwrap();

    assert!(matches!(
        h.mgr.cmd(ctx, HwMgrCmd::Pause),
        Err(HwMgrError::ContextNotInUse(_))
    ));
}

#[tokio::test]
async fn capabilities_are_sorted_by_type_then_index() {
    let h = Harness::new(3);
    let caps = h.mgr.hw_caps();

    assert_eq!(caps.len(), 7);
    let order: Vec<(HwType, u32)> = caps.iter().map(|c| (c.hw_type, c.hw_idx)).collect();
    assert_eq!(
        order,
        vec![
            (HwType::Csid, 0),
            (HwType::Csid, 1),
            (HwType::Csid, 2),
            (HwType::Tfe, 0),
            (HwType::Tfe, 1),
            (HwType::Tfe, 2),
            (HwType::Tpg, 0),
        ]
    );
    assert!(!caps[6].supports_pix);
}
