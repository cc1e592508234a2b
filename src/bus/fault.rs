/*!
Bus fault and result types.

Fallible bus entry points (`try_read8`, `try_write16`, ...) return
`BusResult`, which either carries the value read (or `()` for writes)
plus the identity of what answered, or a `BusFault` describing why the
access was refused. Both arms carry the cycles charged so far, so a
decomposed wide access that faults midway still accounts for the bytes
that completed.

The infallible entry points never construct these; they absorb faults as
hardware would (floating bus on read, silent no-op on write).
*/

use thiserror::Error;

use crate::types::{BusAccess, Cycle, DeviceId, RegionTag};

/// Which permission was missing for a `PermissionDenied` fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionKind {
    NoRead,
    NoWrite,
    NoExecute,
}

/// The reason an access faulted, without the surrounding context.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FaultKind {
    #[error("unmapped")]
    Unmapped,
    #[error("permission denied ({0:?})")]
    PermissionDenied(PermissionKind),
    #[error("bus error: {0}")]
    BusError(String),
}

/// A refused bus access: the reason plus the triggering access and the
/// identity of the page that refused it.
#[derive(Clone, Debug)]
pub struct BusFault {
    pub kind: FaultKind,
    pub access: BusAccess,
    pub device: DeviceId,
    pub region: RegionTag,
}

impl std::fmt::Display for BusFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {:#06x} ({:?}, {})",
            self.kind, self.access.addr, self.region, self.device
        )
    }
}

impl std::error::Error for BusFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl BusFault {
    pub fn unmapped(access: BusAccess) -> BusFault {
        BusFault {
            kind: FaultKind::Unmapped,
            access,
            device: DeviceId::SYSTEM,
            region: RegionTag::Other,
        }
    }

    pub fn permission(
        kind: PermissionKind,
        access: BusAccess,
        device: DeviceId,
        region: RegionTag,
    ) -> BusFault {
        BusFault {
            kind: FaultKind::PermissionDenied(kind),
            access,
            device,
            region,
        }
    }
}

/// Outcome of a fallible bus operation. `BusResult<()>` is the write
/// variant.
#[derive(Clone, Debug)]
pub enum BusResult<T> {
    Success {
        value: T,
        source: DeviceId,
        region: RegionTag,
        cycles_charged: Cycle,
    },
    Fault {
        fault: BusFault,
        cycles_charged: Cycle,
    },
}

impl<T> BusResult<T> {
    #[inline]
    pub fn success(value: T, source: DeviceId, region: RegionTag, cycles_charged: Cycle) -> Self {
        BusResult::Success {
            value,
            source,
            region,
            cycles_charged,
        }
    }

    #[inline]
    pub fn fault(fault: BusFault, cycles_charged: Cycle) -> Self {
        BusResult::Fault {
            fault,
            cycles_charged,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, BusResult::Success { .. })
    }

    #[inline]
    pub fn is_fault(&self) -> bool {
        !self.is_success()
    }

    /// Cycles charged whether the access completed or faulted partway.
    #[inline]
    pub fn cycles_charged(&self) -> Cycle {
        match self {
            BusResult::Success { cycles_charged, .. } => *cycles_charged,
            BusResult::Fault { cycles_charged, .. } => *cycles_charged,
        }
    }

    #[inline]
    pub fn value(&self) -> Option<&T> {
        match self {
            BusResult::Success { value, .. } => Some(value),
            BusResult::Fault { .. } => None,
        }
    }

    #[inline]
    pub fn into_value(self) -> Option<T> {
        match self {
            BusResult::Success { value, .. } => Some(value),
            BusResult::Fault { .. } => None,
        }
    }

    #[inline]
    pub fn fault_ref(&self) -> Option<&BusFault> {
        match self {
            BusResult::Fault { fault, .. } => Some(fault),
            BusResult::Success { .. } => None,
        }
    }

    /// Convert to a std `Result`, discarding the success metadata.
    pub fn into_result(self) -> Result<T, BusFault> {
        match self {
            BusResult::Success { value, .. } => Ok(value),
            BusResult::Fault { fault, .. } => Err(fault),
        }
    }
}
