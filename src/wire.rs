//! Acquire payload decoding.
//!
//! Clients describe their ports in one of two little-endian layouts, chosen by
//! the `num_acq` count that accompanies the payload:
//!
//! - `num_acq == ACQUIRE_COMPAT_SENTINEL`: **packed**. A 12-byte header
//!   (`num_inputs`, `input_info_size`, `input_info_offset`) followed by a blob;
//!   the in-port records start `input_info_offset` bytes into the payload and
//!   must fit in `input_info_size` bytes.
//! - otherwise: **per-resource list** of `num_acq` records, each a
//!   `(resource_type, length)` header and `length` bytes holding exactly one
//!   in-port record.
//!
//! An in-port record is ten `u32` fields followed by `num_out_res` out-port
//! records of five `u32` fields each.

use crate::hw::{OutResId, UsageType, OUT_RES_MAX};
use crate::limits::ACQUIRE_COMPAT_SENTINEL;
use crate::ports::{InPortId, InPortInfo, OutPortInfo};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of an in-port record without its outputs.
pub const IN_PORT_HDR_LEN: usize = 40;
/// Size of one out-port record.
pub const OUT_PORT_LEN: usize = 20;
/// Resource type tag of an in-port record in the list layout.
pub const RES_TYPE_IN_PORT: u32 = 0;

const PACKED_HDR_LEN: usize = 12;
const LIST_HDR_LEN: usize = 8;

/// Reasons an acquire payload is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("in-port requests {requested} outputs, at most {max} supported")]
    TooManyOutputs { requested: u32, max: usize },
    #[error("declared length {declared} does not match record length {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("unknown in-port id {0:#x}")]
    UnknownInPort(u32),
    #[error("unknown out-port id {0:#x}")]
    UnknownOutPort(u32),
    #[error("unknown usage type {0}")]
    UnknownUsage(u32),
    #[error("unexpected resource type {0}")]
    UnknownResourceType(u32),
    #[error("payload describes no input ports")]
    NoInputs,
}

/// Length of an encoded in-port record with `num_out` outputs.
pub fn in_port_len(num_out: usize) -> usize {
    IN_PORT_HDR_LEN + num_out * OUT_PORT_LEN
}

fn need(buf: &impl Buf, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        Err(WireError::Truncated {
            needed,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn usage_from_raw(raw: u32) -> Result<UsageType, WireError> {
    match raw {
        0 => Ok(UsageType::Single),
        1 => Ok(UsageType::Dual),
        other => Err(WireError::UnknownUsage(other)),
    }
}

fn usage_raw(usage: UsageType) -> u32 {
    match usage {
        UsageType::Single => 0,
        UsageType::Dual => 1,
    }
}

/// Decode one in-port record, returning it with its encoded length.
fn decode_in_port(buf: &mut impl Buf) -> Result<(InPortInfo, usize), WireError> {
    need(buf, IN_PORT_HDR_LEN)?;
    let raw_id = buf.get_u32_le();
    let lane_type = buf.get_u32_le();
    let lane_num = buf.get_u32_le();
    let vc = buf.get_u32_le();
    let dt = buf.get_u32_le();
    let format = buf.get_u32_le();
    let width = buf.get_u32_le();
    let height = buf.get_u32_le();
    let usage_type = usage_from_raw(buf.get_u32_le())?;
    let num_out_res = buf.get_u32_le();

    if num_out_res as usize > OUT_RES_MAX {
        return Err(WireError::TooManyOutputs {
            requested: num_out_res,
            max: OUT_RES_MAX,
        });
    }
    let res_id = InPortId::from_raw(raw_id).ok_or(WireError::UnknownInPort(raw_id))?;

    need(buf, num_out_res as usize * OUT_PORT_LEN)?;
    let mut out_ports = Vec::with_capacity(num_out_res as usize);
    for _ in 0..num_out_res {
        let raw_out = buf.get_u32_le();
        let res_id = OutResId::from_raw(raw_out).ok_or(WireError::UnknownOutPort(raw_out))?;
        out_ports.push(OutPortInfo {
            res_id,
            format: buf.get_u32_le(),
            width: buf.get_u32_le(),
            height: buf.get_u32_le(),
            secure: buf.get_u32_le() != 0,
        });
    }

    let port = InPortInfo {
        res_id,
        lane_type,
        lane_num,
        vc,
        dt,
        format,
        width,
        height,
        usage_type,
        out_ports,
    };
    Ok((port, in_port_len(num_out_res as usize)))
}

/// Decode an acquire payload in whichever layout `num_acq` selects.
pub fn decode_acquire(num_acq: u32, payload: &[u8]) -> Result<Vec<InPortInfo>, WireError> {
    let ports = if num_acq == ACQUIRE_COMPAT_SENTINEL {
        decode_packed(payload)?
    } else {
        decode_list(num_acq, payload)?
    };
    if ports.is_empty() {
        return Err(WireError::NoInputs);
    }
    Ok(ports)
}

fn decode_packed(payload: &[u8]) -> Result<Vec<InPortInfo>, WireError> {
    let mut hdr = payload;
    need(&hdr, PACKED_HDR_LEN)?;
    let num_inputs = hdr.get_u32_le();
    let input_info_size = hdr.get_u32_le() as usize;
    let input_info_offset = hdr.get_u32_le() as usize;

    let end = input_info_offset.saturating_add(input_info_size);
    if end > payload.len() {
        return Err(WireError::Truncated {
            needed: end,
            available: payload.len(),
        });
    }

    let mut blob = &payload[input_info_offset..end];
    let mut total = 0usize;
    // Counts come from the client; size by what the blob can actually hold.
    let fits = input_info_size / IN_PORT_HDR_LEN;
    let mut ports = Vec::with_capacity((num_inputs as usize).min(fits));
    for _ in 0..num_inputs {
        let (port, len) = decode_in_port(&mut blob)?;
        total += len;
        if total > input_info_size {
            return Err(WireError::SizeMismatch {
                declared: input_info_size,
                actual: total,
            });
        }
        ports.push(port);
    }
    Ok(ports)
}

fn decode_list(num_acq: u32, payload: &[u8]) -> Result<Vec<InPortInfo>, WireError> {
    let mut buf = payload;
    let fits = payload.len() / (LIST_HDR_LEN + IN_PORT_HDR_LEN);
    let mut ports = Vec::with_capacity((num_acq as usize).min(fits));
    for _ in 0..num_acq {
        need(&buf, LIST_HDR_LEN)?;
        let res_type = buf.get_u32_le();
        let length = buf.get_u32_le() as usize;
        if res_type != RES_TYPE_IN_PORT {
            return Err(WireError::UnknownResourceType(res_type));
        }
        need(&buf, length)?;
        let mut record = &buf[..length];
        let (port, actual) = decode_in_port(&mut record)?;
        if actual != length {
            return Err(WireError::SizeMismatch {
                declared: length,
                actual,
            });
        }
        buf.advance(length);
        ports.push(port);
    }
    Ok(ports)
}

fn encode_in_port(port: &InPortInfo, out: &mut BytesMut) {
    out.put_u32_le(port.res_id.raw());
    out.put_u32_le(port.lane_type);
    out.put_u32_le(port.lane_num);
    out.put_u32_le(port.vc);
    out.put_u32_le(port.dt);
    out.put_u32_le(port.format);
    out.put_u32_le(port.width);
    out.put_u32_le(port.height);
    out.put_u32_le(usage_raw(port.usage_type));
    out.put_u32_le(port.out_ports.len() as u32);
    for o in &port.out_ports {
        out.put_u32_le(o.res_id.raw());
        out.put_u32_le(o.format);
        out.put_u32_le(o.width);
        out.put_u32_le(o.height);
        out.put_u32_le(u32::from(o.secure));
    }
}

/// Encode ports in the packed layout. Pair with `ACQUIRE_COMPAT_SENTINEL`.
pub fn encode_packed(ports: &[InPortInfo]) -> Bytes {
    let size: usize = ports.iter().map(|p| in_port_len(p.out_ports.len())).sum();
    let mut out = BytesMut::with_capacity(PACKED_HDR_LEN + size);
    out.put_u32_le(ports.len() as u32);
    out.put_u32_le(size as u32);
    out.put_u32_le(PACKED_HDR_LEN as u32);
    for port in ports {
        encode_in_port(port, &mut out);
    }
    out.freeze()
}

/// Encode ports in the per-resource list layout. Returns `(num_acq, payload)`.
pub fn encode_list(ports: &[InPortInfo]) -> (u32, Bytes) {
    let mut out = BytesMut::new();
    for port in ports {
        out.put_u32_le(RES_TYPE_IN_PORT);
        out.put_u32_le(in_port_len(port.out_ports.len()) as u32);
        encode_in_port(port, &mut out);
    }
    (ports.len() as u32, out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dual_port() -> InPortInfo {
        let mut port = InPortInfo::sensor(1, UsageType::Dual, &[OutResId::Full, OutResId::Rdi0]);
        port.out_ports[1].secure = true;
        port
    }

    #[test]
    fn packed_payload_decodes() {
        let ports = vec![dual_port(), InPortInfo::tpg(&[OutResId::Rdi1])];
        let payload = encode_packed(&ports);
        let decoded = decode_acquire(ACQUIRE_COMPAT_SENTINEL, &payload).unwrap();
        assert_eq!(decoded, ports);
    }

    #[test]
    fn list_payload_decodes() {
        let ports = vec![dual_port()];
        let (num_acq, payload) = encode_list(&ports);
        assert_eq!(decode_acquire(num_acq, &payload).unwrap(), ports);
    }

    #[test]
    fn list_record_length_must_match() {
        let (num_acq, payload) = encode_list(&[dual_port()]);
        let mut tampered = BytesMut::from(&payload[..]);
        // Declared length lives at bytes 4..8 of the first record.
        tampered[4..8].copy_from_slice(&((in_port_len(2) + 4) as u32).to_le_bytes());
        tampered.put_u32_le(0);
        assert!(matches!(
            decode_acquire(num_acq, &tampered),
            Err(WireError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn packed_size_smaller_than_records_is_rejected() {
        let payload = encode_packed(&[dual_port()]);
        let mut tampered = BytesMut::from(&payload[..]);
        tampered[4..8].copy_from_slice(&(IN_PORT_HDR_LEN as u32).to_le_bytes());
        assert!(decode_acquire(ACQUIRE_COMPAT_SENTINEL, &tampered).is_err());
    }

    #[test]
    fn too_many_outputs_rejected_before_reading_them() {
        let mut out = BytesMut::new();
        out.put_u32_le(RES_TYPE_IN_PORT);
        out.put_u32_le(IN_PORT_HDR_LEN as u32);
        for field in [0, 0, 4, 0, 0x2b, 0, 1920, 1080, 0] {
            out.put_u32_le(field);
        }
        out.put_u32_le(OUT_RES_MAX as u32 + 1);
        assert_eq!(
            decode_acquire(1, &out),
            Err(WireError::TooManyOutputs {
                requested: OUT_RES_MAX as u32 + 1,
                max: OUT_RES_MAX
            })
        );
    }

    #[test]
    fn huge_list_count_on_empty_payload_is_truncated() {
        assert_eq!(
            decode_acquire(u32::MAX - 1, &[]),
            Err(WireError::Truncated {
                needed: LIST_HDR_LEN,
                available: 0
            })
        );
    }

    #[test]
    fn huge_packed_input_count_is_truncated() {
        let mut out = BytesMut::new();
        out.put_u32_le(u32::MAX);
        out.put_u32_le(0);
        out.put_u32_le(PACKED_HDR_LEN as u32);
        assert_eq!(
            decode_acquire(ACQUIRE_COMPAT_SENTINEL, &out),
            Err(WireError::Truncated {
                needed: IN_PORT_HDR_LEN,
                available: 0
            })
        );
    }

    #[test]
    fn empty_payload_has_no_inputs() {
        assert_eq!(decode_acquire(0, &[]), Err(WireError::NoInputs));
    }
}
