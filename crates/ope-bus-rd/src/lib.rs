//! Bus-read command builder for the offline processing engine (OPE).
//!
//! The bus reader fetches input frames from memory through a set of read
//! masters (RMs). Which RMs serve an input port depends on the format family
//! ([`Combo`]): a YUV semi-planar input needs one RM per plane, a Bayer input
//! one RM in total.
//!
//! [`BusRd`] keeps the port→RM routing built at probe time and the port info
//! of each acquired context. [`BusRd::prepare`] turns a request's input buffers
//! into CDM reg-random commands, one per buffer, plane and stripe, closed by a
//! single go command.
//!
//! # Example
//!
//! ```
//! use ope_bus_rd::{BusRd, HwInfo, InPortAcquire, IoBuf, PixelFormat, PrepareRequest, StripeIo};
//!
//! let bus_rd = BusRd::probe(HwInfo::default())?;
//! bus_rd.acquire(0, false, &[InPortAcquire::new(1, PixelFormat::MipiRaw10, 1920, 1080)])?;
//!
//! let request = PrepareRequest {
//!     request_id: 1,
//!     batches: vec![vec![IoBuf::input(1, PixelFormat::MipiRaw10, vec![vec![
//!         StripeIo::new(0x1000_0000, 1920, 1080, 2400),
//!     ]])]],
//! };
//! let prepared = bus_rd.prepare(0, &request, 0)?;
//! assert_eq!(prepared.len(), prepared.cmds.len());
//! # Ok::<(), ope_bus_rd::BusRdError>(())
//! ```

pub mod format;
pub mod regs;

pub use format::{Combo, PixelFormat, PixelPattern, COMBO_MAX};
pub use regs::HwInfo;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use regs::{reg_random_len, write_reg_random};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Input ports of the engine.
pub const IN_RES_MAX: usize = 2;
/// Read masters a single port may route to per combo.
pub const RM_PER_COMBO_MAX: usize = 2;
/// Concurrent contexts.
pub const CTX_MAX: usize = 16;
/// Frames batched into one request.
pub const MAX_BATCH_SIZE: usize = 16;
/// Io buffers per batch entry.
pub const MAX_IO_BUFS: usize = 8;
/// Stripes per plane.
pub const MAX_STRIPES: usize = 48;

/// Errors reported by the bus-read builder.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusRdError {
    #[error("context id {0} out of range")]
    InvalidContext(usize),
    #[error("context {0} has not acquired the bus reader")]
    NotAcquired(usize),
    #[error("read-master table entry {index} names input port {port}, outside 1..={max}")]
    ClientTable { index: usize, port: u32, max: usize },
    #[error("unknown input port {0}")]
    UnknownInPort(u32),
    #[error("input port {port} has no read master for {combo:?} formats")]
    UnsupportedCombo { port: u32, combo: Combo },
    #[error("pixel pattern {0} is not supported")]
    InvalidPixelPattern(u32),
    #[error("{what} {got} exceeds the limit of {max}")]
    TooMany {
        what: &'static str,
        got: usize,
        max: usize,
    },
    #[error("request {0} carries no input buffer")]
    NoInputBuffers(u64),
}

/// Read masters serving one input port, per combo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InPortToRm {
    pub input_port_id: u32,
    pub num_combos: usize,
    pub rm_port_id: [[u32; RM_PER_COMBO_MAX]; COMBO_MAX],
    pub num_rm: [usize; COMBO_MAX],
}

/// One input port of an acquire request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InPortAcquire {
    /// 1-based input port.
    pub res_id: u32,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pixel_pattern: u32,
    pub alignment: u32,
    pub unpacker_format: u32,
}

impl InPortAcquire {
    pub fn new(res_id: u32, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            res_id,
            format,
            width,
            height,
            pixel_pattern: 0,
            alignment: 0,
            unpacker_format: 0,
        }
    }
}

/// Port info kept per acquired context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoPortInfo {
    pub input_port_id: [u32; IN_RES_MAX],
    pub input_format: [Option<PixelFormat>; IN_RES_MAX],
    pub pixel_pattern: [u32; IN_RES_MAX],
    pub latency_buf_size: u32,
}

#[derive(Debug, Clone, Default)]
struct BusRdCtx {
    secure: bool,
    num_in_ports: usize,
    io_port_info: IoPortInfo,
}

/// Direction of an io buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// Memory window of one stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeIo {
    pub s_location: u32,
    pub iova: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub unpack_format: u32,
    pub alignment: u32,
}

impl StripeIo {
    pub fn new(iova: u32, width: u32, height: u32, stride: u32) -> Self {
        Self {
            s_location: 0,
            iova,
            width,
            height,
            stride,
            unpack_format: 0,
            alignment: 0,
        }
    }
}

/// One buffer of a request: planes, each split into stripes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoBuf {
    pub direction: Direction,
    /// 1-based input port this buffer feeds.
    pub resource_type: u32,
    pub format: PixelFormat,
    pub planes: Vec<Vec<StripeIo>>,
}

impl IoBuf {
    pub fn input(resource_type: u32, format: PixelFormat, planes: Vec<Vec<StripeIo>>) -> Self {
        Self {
            direction: Direction::Input,
            resource_type,
            format,
            planes,
        }
    }
}

/// Buffers of one request, grouped per batch entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareRequest {
    pub request_id: u64,
    pub batches: Vec<Vec<IoBuf>>,
}

/// Location of one command inside the prepared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdDesc {
    /// Offset within the caller's command buffer.
    pub offset: usize,
    pub len: usize,
}

/// Commands of one batch entry, indexed by stripe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCmds {
    pub stripes: Vec<Vec<CmdDesc>>,
}

impl BatchCmds {
    fn push(&mut self, stripe: usize, desc: CmdDesc) {
        if self.stripes.len() <= stripe {
            self.stripes.resize_with(stripe + 1, Vec::new);
        }
        self.stripes[stripe].push(desc);
    }
}

/// Output of [`BusRd::prepare`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub cmds: Bytes,
    pub batches: Vec<BatchCmds>,
    pub go: CmdDesc,
}

impl Prepared {
    /// Bytes written.
    pub fn len(&self) -> usize {
        self.cmds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cmds.is_empty()
    }
}

/// Decoded bus-read interrupt status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrqOutcome {
    pub reset_done: bool,
    pub violation: bool,
}

/// The bus-read block of one engine.
pub struct BusRd {
    hw: HwInfo,
    in_port_to_rm: [InPortToRm; IN_RES_MAX],
    ctxs: Mutex<Vec<Option<BusRdCtx>>>,
}

impl BusRd {
    /// Build the port→read-master routing from the client table.
    pub fn probe(hw: HwInfo) -> Result<Self, BusRdError> {
        let mut in_port_to_rm: [InPortToRm; IN_RES_MAX] = Default::default();

        for (index, client) in hw.vals.clients.iter().enumerate() {
            let port_idx = (client.input_port_id as usize)
                .checked_sub(1)
                .filter(|i| *i < IN_RES_MAX)
                .ok_or(BusRdError::ClientTable {
                    index,
                    port: client.input_port_id,
                    max: IN_RES_MAX,
                })?;
            let entry = &mut in_port_to_rm[port_idx];
            for combo in [Combo::Bayer, Combo::Yuv] {
                if client.format_type & combo.mask() == 0 {
                    continue;
                }
                let c = combo.index();
                let slot = entry.num_rm[c];
                if slot >= RM_PER_COMBO_MAX {
                    return Err(BusRdError::TooMany {
                        what: "read masters per combo",
                        got: slot + 1,
                        max: RM_PER_COMBO_MAX,
                    });
                }
                entry.input_port_id = client.input_port_id;
                entry.rm_port_id[c][slot] = client.rm_port_id;
                if slot == 0 {
                    entry.num_combos += 1;
                }
                entry.num_rm[c] += 1;
            }
        }

        for entry in &in_port_to_rm {
            debug!(
                port = entry.input_port_id,
                num_combos = entry.num_combos,
                rms = ?entry.num_rm,
                "Bus read port routing"
            );
        }

        Ok(Self {
            hw,
            in_port_to_rm,
            ctxs: Mutex::new(vec![None; CTX_MAX]),
        })
    }

    pub fn routing(&self, port: u32) -> Option<&InPortToRm> {
        self.in_port_to_rm
            .iter()
            .find(|r| r.num_combos > 0 && r.input_port_id == port)
    }

    fn check_ctx(ctx_id: usize) -> Result<(), BusRdError> {
        if ctx_id >= CTX_MAX {
            return Err(BusRdError::InvalidContext(ctx_id));
        }
        Ok(())
    }

    /// Validate `in_ports` and remember them for `ctx_id`. Ports with zero
    /// width are placeholders and skipped.
    pub fn acquire(
        &self,
        ctx_id: usize,
        secure: bool,
        in_ports: &[InPortAcquire],
    ) -> Result<(), BusRdError> {
        Self::check_ctx(ctx_id)?;
        if in_ports.len() > IN_RES_MAX {
            return Err(BusRdError::TooMany {
                what: "input ports",
                got: in_ports.len(),
                max: IN_RES_MAX,
            });
        }

        let mut ctx = BusRdCtx {
            secure,
            num_in_ports: in_ports.len(),
            io_port_info: IoPortInfo {
                latency_buf_size: self.hw.vals.latency_buf_size,
                ..IoPortInfo::default()
            },
        };

        for (i, port) in in_ports.iter().enumerate() {
            if port.width == 0 {
                continue;
            }
            let port_id = i as u32 + 1;
            let routing = self
                .routing(port_id)
                .ok_or(BusRdError::UnknownInPort(port_id))?;
            let combo = port.format.combo();
            if routing.num_rm[combo.index()] == 0 {
                error!(ctx = ctx_id, port = port_id, ?combo, "No read master for format");
                return Err(BusRdError::UnsupportedCombo {
                    port: port_id,
                    combo,
                });
            }
            if PixelPattern::from_raw(port.pixel_pattern).is_none() {
                return Err(BusRdError::InvalidPixelPattern(port.pixel_pattern));
            }

            let info = &mut ctx.io_port_info;
            info.input_port_id[i] = port.res_id;
            info.input_format[i] = Some(port.format);
            info.pixel_pattern[i] = port.pixel_pattern;
            debug!(
                ctx = ctx_id,
                port = port_id,
                format = ?port.format,
                width = port.width,
                height = port.height,
                pixel_pattern = port.pixel_pattern,
                "Bus read port acquired"
            );
        }

        self.ctxs.lock()[ctx_id] = Some(ctx);
        Ok(())
    }

    pub fn release(&self, ctx_id: usize) -> Result<(), BusRdError> {
        Self::check_ctx(ctx_id)?;
        let released = self.ctxs.lock()[ctx_id].take();
        match released {
            Some(ctx) => {
                debug!(ctx = ctx_id, ports = ctx.num_in_ports, "Bus read released");
                Ok(())
            }
            None => Err(BusRdError::NotAcquired(ctx_id)),
        }
    }

    pub fn port_info(&self, ctx_id: usize) -> Option<IoPortInfo> {
        self.ctxs
            .lock()
            .get(ctx_id)
            .and_then(Option::as_ref)
            .map(|c| c.io_port_info.clone())
    }

    /// Build the commands for every input buffer of `request`. Descriptor
    /// offsets start at `base_offset` within the caller's command buffer.
    pub fn prepare(
        &self,
        ctx_id: usize,
        request: &PrepareRequest,
        base_offset: usize,
    ) -> Result<Prepared, BusRdError> {
        Self::check_ctx(ctx_id)?;
        let ctx = self.ctxs.lock()[ctx_id]
            .clone()
            .ok_or(BusRdError::NotAcquired(ctx_id))?;
        if request.batches.len() > MAX_BATCH_SIZE {
            return Err(BusRdError::TooMany {
                what: "batch entries",
                got: request.batches.len(),
                max: MAX_BATCH_SIZE,
            });
        }

        let mut out = BytesMut::new();
        let mut batches = Vec::with_capacity(request.batches.len());
        let mut saw_input = false;

        for (b, bufs) in request.batches.iter().enumerate() {
            if bufs.len() > MAX_IO_BUFS {
                return Err(BusRdError::TooMany {
                    what: "io buffers",
                    got: bufs.len(),
                    max: MAX_IO_BUFS,
                });
            }
            let mut cmds = BatchCmds::default();
            for (io, buf) in bufs.iter().enumerate() {
                if buf.direction != Direction::Input {
                    continue;
                }
                saw_input = true;
                trace!(ctx = ctx_id, batch = b, io, "Bus read io buffer");
                self.update(&ctx, buf, &mut out, base_offset, &mut cmds)?;
            }
            batches.push(cmds);
        }
        if !saw_input {
            return Err(BusRdError::NoInputBuffers(request.request_id));
        }

        let regs = &self.hw.regs;
        let go = CmdDesc {
            offset: base_offset + out.len(),
            len: write_reg_random(
                &mut out,
                &[(regs.offset + regs.input_if_cmd, self.hw.vals.go_cmd)],
            ),
        };

        debug!(
            ctx = ctx_id,
            req_id = request.request_id,
            bytes = out.len(),
            "Bus read commands prepared"
        );
        Ok(Prepared {
            cmds: out.freeze(),
            batches,
            go,
        })
    }

    fn update(
        &self,
        ctx: &BusRdCtx,
        buf: &IoBuf,
        out: &mut BytesMut,
        base_offset: usize,
        cmds: &mut BatchCmds,
    ) -> Result<(), BusRdError> {
        let port_idx = (buf.resource_type as usize)
            .checked_sub(1)
            .filter(|i| *i < IN_RES_MAX)
            .ok_or(BusRdError::UnknownInPort(buf.resource_type))?;
        let routing = &self.in_port_to_rm[port_idx];
        let combo = buf.format.combo();
        if buf.planes.len() > routing.num_rm[combo.index()] {
            return Err(BusRdError::UnsupportedCombo {
                port: buf.resource_type,
                combo,
            });
        }

        let regs = &self.hw.regs;
        let pattern = ctx.io_port_info.pixel_pattern[port_idx];

        for (plane, stripes) in buf.planes.iter().enumerate() {
            if stripes.len() > MAX_STRIPES {
                return Err(BusRdError::TooMany {
                    what: "stripes",
                    got: stripes.len(),
                    max: MAX_STRIPES,
                });
            }
            let rm = routing.rm_port_id[combo.index()][plane] as usize;
            let (Some(creg), Some(cval)) = (regs.clients.get(rm), self.hw.vals.clients.get(rm))
            else {
                return Err(BusRdError::UnsupportedCombo {
                    port: buf.resource_type,
                    combo,
                });
            };

            for (stripe, s) in stripes.iter().enumerate() {
                let meta = (s.s_location & cval.stripe_location_mask)
                    | ((pattern & cval.pix_pattern_mask) << cval.pix_pattern_shift);
                let img_cfg = s.height | ((s.width & cval.img_width_mask) << cval.img_width_shift);
                let unpack = ((s.unpack_format & cval.mode_mask) << cval.mode_shift)
                    | ((s.alignment & cval.alignment_mask) << cval.alignment_shift);
                let pairs = [
                    (regs.offset + regs.security_cfg, u32::from(ctx.secure)),
                    (regs.offset + creg.core_cfg, 1),
                    (regs.offset + creg.ccif_meta_data, meta),
                    (regs.offset + creg.img_addr, s.iova),
                    (regs.offset + creg.img_cfg, img_cfg),
                    (regs.offset + creg.stride, s.stride),
                    (regs.offset + creg.unpack_cfg, unpack),
                    (
                        regs.offset + creg.latency_buf_allocation,
                        ctx.io_port_info.latency_buf_size,
                    ),
                ];
                let offset = base_offset + out.len();
                let len = write_reg_random(out, &pairs);
                debug_assert_eq!(len, reg_random_len(pairs.len()));
                cmds.push(stripe, CmdDesc { offset, len });
                trace!(plane, stripe, rm, offset, len, "Bus read stripe command");
            }
        }
        Ok(())
    }

    /// Classify an interrupt status word.
    pub fn isr(&self, irq_status: u32) -> IrqOutcome {
        let vals = &self.hw.vals;
        let outcome = IrqOutcome {
            reset_done: irq_status & vals.rst_done != 0,
            violation: irq_status & vals.violation == vals.violation,
        };
        if outcome.reset_done {
            debug!("Bus read reset done");
        }
        if outcome.violation {
            error!(irq_status, "Bus read CCIF violation");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use tracing_test::traced_test;

    fn nv12_request() -> PrepareRequest {
        let stripes = vec![
            StripeIo::new(0x1000, 960, 1080, 1024),
            StripeIo::new(0x1400, 960, 1080, 1024),
        ];
        PrepareRequest {
            request_id: 9,
            batches: vec![vec![IoBuf::input(
                1,
                PixelFormat::Nv12,
                vec![stripes.clone(), stripes],
            )]],
        }
    }

    #[test]
    fn probe_routes_yuv_through_two_read_masters() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        let port1 = bus_rd.routing(1).unwrap();
        assert_eq!(port1.num_combos, 2);
        assert_eq!(port1.num_rm[Combo::Yuv.index()], 2);
        assert_eq!(port1.rm_port_id[Combo::Yuv.index()], [0, 1]);
        assert_eq!(port1.num_rm[Combo::Bayer.index()], 1);

        let port2 = bus_rd.routing(2).unwrap();
        assert_eq!(port2.num_rm[Combo::Yuv.index()], 0);
    }

    #[test]
    fn probe_rejects_out_of_range_port() {
        let mut hw = HwInfo::default();
        hw.vals.clients[0].input_port_id = 5;
        assert!(matches!(
            BusRd::probe(hw),
            Err(BusRdError::ClientTable { index: 0, port: 5, .. })
        ));
    }

    #[test]
    fn acquire_validates_combo_and_pattern() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        let yuv_on_port2 = [
            InPortAcquire::new(1, PixelFormat::MipiRaw10, 640, 480),
            InPortAcquire::new(2, PixelFormat::Nv12, 640, 480),
        ];
        assert_eq!(
            bus_rd.acquire(0, false, &yuv_on_port2),
            Err(BusRdError::UnsupportedCombo {
                port: 2,
                combo: Combo::Yuv
            })
        );

        let mut bad_pattern = InPortAcquire::new(1, PixelFormat::MipiRaw10, 640, 480);
        bad_pattern.pixel_pattern = 8;
        assert_eq!(
            bus_rd.acquire(0, false, &[bad_pattern]),
            Err(BusRdError::InvalidPixelPattern(8))
        );
        assert!(bus_rd.port_info(0).is_none());
    }

    #[test]
    fn zero_width_ports_are_placeholders() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        let ports = [
            InPortAcquire::new(1, PixelFormat::Nv12, 0, 0),
            InPortAcquire::new(2, PixelFormat::MipiRaw12, 640, 480),
        ];
        bus_rd.acquire(3, true, &ports).unwrap();
        let info = bus_rd.port_info(3).unwrap();
        assert_eq!(info.input_format, [None, Some(PixelFormat::MipiRaw12)]);
        assert_eq!(info.latency_buf_size, 4096);
    }

    #[test]
    fn prepare_emits_one_command_per_plane_and_stripe_then_go() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        bus_rd
            .acquire(0, false, &[InPortAcquire::new(1, PixelFormat::Nv12, 1920, 1080)])
            .unwrap();

        let prepared = bus_rd.prepare(0, &nv12_request(), 64).unwrap();
        let stripe_len = reg_random_len(8);
        assert_eq!(prepared.batches.len(), 1);
        assert_eq!(prepared.batches[0].stripes.len(), 2);
        // Stripe 0 gets a command for each plane.
        assert_eq!(prepared.batches[0].stripes[0].len(), 2);
        assert_eq!(prepared.batches[0].stripes[0][0].offset, 64);
        assert_eq!(prepared.batches[0].stripes[0][0].len, stripe_len);
        assert_eq!(prepared.go.offset, 64 + 4 * stripe_len);
        assert_eq!(prepared.len(), 4 * stripe_len + reg_random_len(1));

        // Image address of the first plane, first stripe.
        let mut cmds = prepared.cmds.clone();
        cmds.advance(4 + 3 * 8 + 4);
        assert_eq!(cmds.get_u32_le(), 0x1000);
    }

    #[test]
    fn prepare_without_acquire_fails() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        assert_eq!(
            bus_rd.prepare(1, &nv12_request(), 0),
            Err(BusRdError::NotAcquired(1))
        );
    }

    #[test]
    fn prepare_requires_an_input_buffer() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        bus_rd
            .acquire(0, false, &[InPortAcquire::new(1, PixelFormat::Nv12, 1920, 1080)])
            .unwrap();
        let mut request = nv12_request();
        request.batches[0][0].direction = Direction::Output;
        assert_eq!(
            bus_rd.prepare(0, &request, 0),
            Err(BusRdError::NoInputBuffers(9))
        );
    }

    #[test]
    fn release_forgets_context() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        bus_rd
            .acquire(2, false, &[InPortAcquire::new(1, PixelFormat::Plain8, 64, 64)])
            .unwrap();
        bus_rd.release(2).unwrap();
        assert_eq!(bus_rd.release(2), Err(BusRdError::NotAcquired(2)));
        assert_eq!(bus_rd.release(CTX_MAX), Err(BusRdError::InvalidContext(CTX_MAX)));
    }

    #[traced_test]
    #[test]
    fn isr_reports_violation() {
        let bus_rd = BusRd::probe(HwInfo::default()).unwrap();
        let outcome = bus_rd.isr(0x3);
        assert!(outcome.reset_done);
        assert!(outcome.violation);
        assert!(logs_contain("CCIF violation"));
        assert_eq!(bus_rd.isr(0), IrqOutcome::default());
    }
}
