//! Signal and status numbering of the manager/worker protocol.

use crate::algs::wire::{WireHdr, WireStatus};
use crate::combi_error::CombiError;

/// Command sent by the manager to a group master.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    RunFirst = 0,
    RunNext = 1,
    Eval = 2,
    GridEval = 3,
    Combine = 4,
    Exit = 5,
    SyncTasks = 6,
    CombineFg = 7,
    GridGather = 8,
    UpdateCombiParameters = 9,
    AddTask = 10,
    Recompute = 11,
}

impl Signal {
    /// Whether a payload message follows the signal.
    pub fn has_payload(self) -> bool {
        matches!(
            self,
            Signal::RunFirst
                | Signal::AddTask
                | Signal::Recompute
                | Signal::Eval
                | Signal::GridEval
                | Signal::CombineFg
                | Signal::GridGather
                | Signal::UpdateCombiParameters
        )
    }

    /// Whether the master sends a result message before its status.
    pub fn has_result(self) -> bool {
        matches!(
            self,
            Signal::SyncTasks | Signal::Eval | Signal::GridEval | Signal::CombineFg | Signal::GridGather
        )
    }

    /// Whether the master answers with a status at all.
    pub fn has_status(self) -> bool {
        self != Signal::Exit
    }

    pub fn to_wire(self) -> WireHdr {
        WireHdr::new(self as u16)
    }

    pub fn decode(bytes: &[u8], neighbor: usize) -> Result<Self, CombiError> {
        Self::try_from(WireHdr::decode(bytes, neighbor)?.kind())
    }
}

impl TryFrom<u16> for Signal {
    type Error = CombiError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Signal::RunFirst,
            1 => Signal::RunNext,
            2 => Signal::Eval,
            3 => Signal::GridEval,
            4 => Signal::Combine,
            5 => Signal::Exit,
            6 => Signal::SyncTasks,
            7 => Signal::CombineFg,
            8 => Signal::GridGather,
            9 => Signal::UpdateCombiParameters,
            10 => Signal::AddTask,
            11 => Signal::Recompute,
            _ => {
                return Err(CombiError::UnknownWireValue {
                    kind: "signal",
                    value,
                });
            }
        })
    }
}

/// State of a process group as seen by the manager.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Wait = 0,
    Busy = 1,
    /// The last handler failed on at least one process of the group. The
    /// group keeps serving signals.
    Fail = 2,
}

impl Status {
    pub fn to_wire(self) -> WireStatus {
        WireStatus::new(self as u16)
    }

    pub fn decode(bytes: &[u8], neighbor: usize) -> Result<Self, CombiError> {
        Self::try_from(WireStatus::decode(bytes, neighbor)?.status())
    }
}

impl TryFrom<u16> for Status {
    type Error = CombiError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Wait),
            1 => Ok(Status::Busy),
            2 => Ok(Status::Fail),
            _ => Err(CombiError::UnknownWireValue {
                kind: "status",
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::wire::cast_slice;

    #[test]
    fn signal_numbers_are_fixed() {
        for v in 0..12u16 {
            let s = Signal::try_from(v).unwrap();
            assert_eq!(s as u16, v);
            assert_eq!(Signal::decode(cast_slice(&[s.to_wire()]), 0).unwrap(), s);
        }
        assert!(matches!(
            Signal::try_from(12),
            Err(CombiError::UnknownWireValue { kind: "signal", value: 12 })
        ));
    }

    #[test]
    fn status_roundtrip() {
        let w = Status::Busy.to_wire();
        assert_eq!(Status::decode(cast_slice(&[w]), 0).unwrap(), Status::Busy);
        let w = Status::Fail.to_wire();
        assert_eq!(Status::decode(cast_slice(&[w]), 0).unwrap(), Status::Fail);
        assert!(Status::try_from(7).is_err());
    }

    #[test]
    fn exit_is_fire_and_forget() {
        assert!(!Signal::Exit.has_status());
        assert!(!Signal::Exit.has_payload());
        assert!(Signal::GridGather.has_result());
        assert!(!Signal::Combine.has_result());
    }
}
