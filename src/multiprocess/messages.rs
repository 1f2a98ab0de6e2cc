//! Message alphabets of the master/queue/worker protocol.
//!
//! Purpose
//! -------
//! Define the four directed tag alphabets and their wire representation.
//! Every framed conversation starts with one of these tags as a `u32`;
//! payloads follow as fixed-width fields or length-prefixed blobs written
//! by the transport.
//!
//! Conventions
//! -----------
//! - Each alphabet owns a distinct numeric range (`0x1x` master→queue,
//!   `0x2x` queue→master, `0x3x` worker→queue, `0x4x` queue→worker) so a
//!   misrouted tag is recognizable in diagnostics.
//! - Decoding an unknown tag is a fatal protocol error naming the
//!   alphabet; both endpoints are the same build, so versioning is not a
//!   concern.
use crate::multiprocess::errors::{MpError, MpResult};

/// A tag enum that crosses the pipe as a `u32`.
pub trait WireTag: Copy {
    /// Alphabet name used in protocol-error diagnostics.
    const CONTEXT: &'static str;

    fn tag(self) -> u32;
    fn from_tag(tag: u32) -> MpResult<Self>;
}

/// Master → queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum M2Q {
    Terminate,
    Enqueue,
    Retrieve,
    UpdateReal,
    SwitchWorkMode,
    CallDoubleConstMethod,
}

impl WireTag for M2Q {
    const CONTEXT: &'static str = "M2Q";

    fn tag(self) -> u32 {
        match self {
            M2Q::Terminate => 0x11,
            M2Q::Enqueue => 0x12,
            M2Q::Retrieve => 0x13,
            M2Q::UpdateReal => 0x14,
            M2Q::SwitchWorkMode => 0x15,
            M2Q::CallDoubleConstMethod => 0x16,
        }
    }

    fn from_tag(tag: u32) -> MpResult<Self> {
        match tag {
            0x11 => Ok(M2Q::Terminate),
            0x12 => Ok(M2Q::Enqueue),
            0x13 => Ok(M2Q::Retrieve),
            0x14 => Ok(M2Q::UpdateReal),
            0x15 => Ok(M2Q::SwitchWorkMode),
            0x16 => Ok(M2Q::CallDoubleConstMethod),
            _ => Err(MpError::Protocol { context: Self::CONTEXT, tag }),
        }
    }
}

/// Queue → master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Q2M {
    RetrieveAccepted,
    RetrieveRejected,
}

impl WireTag for Q2M {
    const CONTEXT: &'static str = "Q2M";

    fn tag(self) -> u32 {
        match self {
            Q2M::RetrieveAccepted => 0x21,
            Q2M::RetrieveRejected => 0x22,
        }
    }

    fn from_tag(tag: u32) -> MpResult<Self> {
        match tag {
            0x21 => Ok(Q2M::RetrieveAccepted),
            0x22 => Ok(Q2M::RetrieveRejected),
            _ => Err(MpError::Protocol { context: Self::CONTEXT, tag }),
        }
    }
}

/// Worker → queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum W2Q {
    Dequeue,
    SendResult,
}

impl WireTag for W2Q {
    const CONTEXT: &'static str = "W2Q";

    fn tag(self) -> u32 {
        match self {
            W2Q::Dequeue => 0x31,
            W2Q::SendResult => 0x32,
        }
    }

    fn from_tag(tag: u32) -> MpResult<Self> {
        match tag {
            0x31 => Ok(W2Q::Dequeue),
            0x32 => Ok(W2Q::SendResult),
            _ => Err(MpError::Protocol { context: Self::CONTEXT, tag }),
        }
    }
}

/// Queue → worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Q2W {
    Terminate,
    DequeueAccepted,
    DequeueRejected,
    UpdateReal,
    SwitchWorkMode,
    CallDoubleConstMethod,
    ResultReceived,
}

impl WireTag for Q2W {
    const CONTEXT: &'static str = "Q2W";

    fn tag(self) -> u32 {
        match self {
            Q2W::Terminate => 0x41,
            Q2W::DequeueAccepted => 0x42,
            Q2W::DequeueRejected => 0x43,
            Q2W::UpdateReal => 0x44,
            Q2W::SwitchWorkMode => 0x45,
            Q2W::CallDoubleConstMethod => 0x46,
            Q2W::ResultReceived => 0x47,
        }
    }

    fn from_tag(tag: u32) -> MpResult<Self> {
        match tag {
            0x41 => Ok(Q2W::Terminate),
            0x42 => Ok(Q2W::DequeueAccepted),
            0x43 => Ok(Q2W::DequeueRejected),
            0x44 => Ok(Q2W::UpdateReal),
            0x45 => Ok(Q2W::SwitchWorkMode),
            0x46 => Ok(Q2W::CallDoubleConstMethod),
            0x47 => Ok(Q2W::ResultReceived),
            _ => Err(MpError::Protocol { context: Self::CONTEXT, tag }),
        }
    }
}

/// The unit the queue manipulates: a task addressed to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTask {
    pub job_id: usize,
    pub task: usize,
}
