//! Identifiers and small enums shared by the adapters and the manager.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical hardware block type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HwType {
    Csid,
    Tfe,
    Tpg,
}

/// Logical resource kind a [`super::ResourceNode`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    CsidPath,
    TfeIn,
    TfeOut,
    Tpg,
}

impl ResourceKind {
    /// Hardware type able to reserve this kind.
    pub fn hw_type(self) -> HwType {
        match self {
            ResourceKind::CsidPath => HwType::Csid,
            ResourceKind::TfeIn | ResourceKind::TfeOut => HwType::Tfe,
            ResourceKind::Tpg => HwType::Tpg,
        }
    }
}

/// CSID decode path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsidPathId {
    /// Pixel path feeding CAMIF.
    Ipp,
    Rdi0,
    Rdi1,
    Rdi2,
}

/// TFE input path, fed 1:1 by a CSID path of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TfeInId {
    Camif,
    Rdi0,
    Rdi1,
    Rdi2,
}

macro_rules! raw_id {
    ($ty:ty { $($variant:ident = $raw:expr),+ $(,)? }) => {
        impl $ty {
            /// Numeric id carried in [`super::ResourceNode::res_id`].
            pub fn raw(self) -> u32 {
                match self {
                    $(Self::$variant => $raw,)+
                }
            }

            /// Inverse of [`Self::raw`].
            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $(x if x == $raw => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

raw_id!(CsidPathId { Ipp = 0, Rdi0 = 1, Rdi1 = 2, Rdi2 = 3 });
raw_id!(TfeInId { Camif = 0, Rdi0 = 1, Rdi1 = 2, Rdi2 = 3 });

impl CsidPathId {
    /// Per-channel path for RDI `n`.
    pub fn rdi(n: usize) -> Option<Self> {
        match n {
            0 => Some(CsidPathId::Rdi0),
            1 => Some(CsidPathId::Rdi1),
            2 => Some(CsidPathId::Rdi2),
            _ => None,
        }
    }

    /// TFE input fed by this path.
    pub fn tfe_in(self) -> TfeInId {
        match self {
            CsidPathId::Ipp => TfeInId::Camif,
            CsidPathId::Rdi0 => TfeInId::Rdi0,
            CsidPathId::Rdi1 => TfeInId::Rdi1,
            CsidPathId::Rdi2 => TfeInId::Rdi2,
        }
    }
}

impl TfeInId {
    /// RDI channel number, `None` for CAMIF.
    pub fn rdi_index(self) -> Option<usize> {
        match self {
            TfeInId::Camif => None,
            TfeInId::Rdi0 => Some(0),
            TfeInId::Rdi1 => Some(1),
            TfeInId::Rdi2 => Some(2),
        }
    }

    /// Output bound to this input when it is a per-channel path.
    pub fn rdi_out(self) -> Option<OutResId> {
        self.rdi_index().and_then(OutResId::rdi)
    }
}

/// TFE output resource. The discriminant indexes the context's output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OutResId {
    Full = 0,
    RawDump = 1,
    Pdaf = 2,
    Rdi0 = 3,
    Rdi1 = 4,
    Rdi2 = 5,
    StatsHdrBe = 6,
    StatsHdrBhist = 7,
    StatsTlBg = 8,
    StatsBf = 9,
    StatsAwbBg = 10,
}

/// Size of the per-context output table.
pub const OUT_RES_MAX: usize = 11;

impl OutResId {
    /// Every output id in table order.
    pub const ALL: [OutResId; OUT_RES_MAX] = [
        OutResId::Full,
        OutResId::RawDump,
        OutResId::Pdaf,
        OutResId::Rdi0,
        OutResId::Rdi1,
        OutResId::Rdi2,
        OutResId::StatsHdrBe,
        OutResId::StatsHdrBhist,
        OutResId::StatsTlBg,
        OutResId::StatsBf,
        OutResId::StatsAwbBg,
    ];

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Slot in the context's output table.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn rdi(n: usize) -> Option<Self> {
        match n {
            0 => Some(OutResId::Rdi0),
            1 => Some(OutResId::Rdi1),
            2 => Some(OutResId::Rdi2),
            _ => None,
        }
    }

    pub fn rdi_index(self) -> Option<usize> {
        match self {
            OutResId::Rdi0 => Some(0),
            OutResId::Rdi1 => Some(1),
            OutResId::Rdi2 => Some(2),
            _ => None,
        }
    }

    pub fn is_rdi(self) -> bool {
        self.rdi_index().is_some()
    }
}

/// Side of a dual-pipe resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitId {
    Left = 0,
    Right = 1,
}

impl SplitId {
    pub const ALL: [SplitId; 2] = [SplitId::Left, SplitId::Right];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SplitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitId::Left => write!(f, "left"),
            SplitId::Right => write!(f, "right"),
        }
    }
}

/// Synchronization role a dual-pipe path is reserved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SyncMode {
    #[default]
    None,
    Master,
    Slave,
}

/// How a stop request halts a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HaltMode {
    /// Halt at the next frame boundary.
    #[default]
    AtFrameBoundary,
    Immediate,
}

/// Scope of an adapter reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    /// Reset one reserved path.
    Path,
    /// Reset the whole hardware core.
    Hw,
}

/// Whether a stream is processed by one unit or split across two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UsageType {
    #[default]
    Single,
    Dual,
}

/// Bandwidth vote direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BwControl {
    Include,
    Exclude,
}

/// Lifecycle state of a [`super::ResourceNode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Available = 0,
    Reserved = 1,
    Initialized = 2,
    Streaming = 3,
}

impl NodeState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeState::Reserved,
            2 => NodeState::Initialized,
            3 => NodeState::Streaming,
            _ => NodeState::Available,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Available => write!(f, "available"),
            NodeState::Reserved => write!(f, "reserved"),
            NodeState::Initialized => write!(f, "initialized"),
            NodeState::Streaming => write!(f, "streaming"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_res_table_order_matches_discriminant() {
        for (i, id) in OutResId::ALL.iter().enumerate() {
            assert_eq!(id.index(), i);
            assert_eq!(OutResId::from_raw(i as u32), Some(*id));
        }
        assert_eq!(OutResId::from_raw(OUT_RES_MAX as u32), None);
    }

    #[test]
    fn rdi_paths_map_to_matching_outputs() {
        let path = CsidPathId::rdi(1).unwrap();
        assert_eq!(path.tfe_in(), TfeInId::Rdi1);
        assert_eq!(path.tfe_in().rdi_out(), Some(OutResId::Rdi1));
        assert_eq!(CsidPathId::Ipp.tfe_in().rdi_out(), None);
        assert_eq!(TfeInId::from_raw(TfeInId::Rdi2.raw()), Some(TfeInId::Rdi2));
    }
}
