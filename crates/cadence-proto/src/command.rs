//! Protocol command bytes.

use crate::error::ProtocolError;

/// Command discriminant carried in every frame after the message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// No-operation, the reply to `Sleep`.
    Noop = 0,
    /// Worker asks for a job.
    GrabJob = 1,
    /// Worker re-schedules a job to run after a delay.
    SchedLater = 2,
    /// Worker reports successful completion.
    WorkDone = 3,
    /// Worker reports failure.
    WorkFail = 4,
    /// Broker hands a job to a worker.
    JobAssign = 5,
    /// Broker has no job for the worker.
    NoJob = 6,
    /// Worker advertises a function.
    CanDo = 7,
    /// Worker withdraws a function.
    CantDo = 8,
    /// Liveness probe.
    Ping = 9,
    /// Liveness reply.
    Pong = 10,
    /// Worker goes idle.
    Sleep = 11,
    /// Unrecognised command reply.
    Unknown = 12,
    /// Client submits a job.
    SubmitJob = 13,
    /// Client requests per-function statistics.
    Status = 14,
    /// Client drops a function and its jobs.
    DropFunc = 15,
    /// Generic success reply.
    Success = 16,
    /// Client removes a job by (func, name).
    RemoveJob = 17,
    /// Client requests a full job dump.
    Dump = 18,
    /// Client re-ingests a dump.
    Load = 19,
}

impl Command {
    /// Creates a command from its wire byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Noop),
            1 => Ok(Self::GrabJob),
            2 => Ok(Self::SchedLater),
            3 => Ok(Self::WorkDone),
            4 => Ok(Self::WorkFail),
            5 => Ok(Self::JobAssign),
            6 => Ok(Self::NoJob),
            7 => Ok(Self::CanDo),
            8 => Ok(Self::CantDo),
            9 => Ok(Self::Ping),
            10 => Ok(Self::Pong),
            11 => Ok(Self::Sleep),
            12 => Ok(Self::Unknown),
            13 => Ok(Self::SubmitJob),
            14 => Ok(Self::Status),
            15 => Ok(Self::DropFunc),
            16 => Ok(Self::Success),
            17 => Ok(Self::RemoveJob),
            18 => Ok(Self::Dump),
            19 => Ok(Self::Load),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// Returns the wire byte for this command.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Noop => "NOOP",
            Self::GrabJob => "GRAB_JOB",
            Self::SchedLater => "SCHED_LATER",
            Self::WorkDone => "WORK_DONE",
            Self::WorkFail => "WORK_FAIL",
            Self::JobAssign => "JOB_ASSIGN",
            Self::NoJob => "NO_JOB",
            Self::CanDo => "CAN_DO",
            Self::CantDo => "CANT_DO",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Sleep => "SLEEP",
            Self::Unknown => "UNKNOWN",
            Self::SubmitJob => "SUBMIT_JOB",
            Self::Status => "STATUS",
            Self::DropFunc => "DROP_FUNC",
            Self::Success => "SUCCESS",
            Self::RemoveJob => "REMOVE_JOB",
            Self::Dump => "DUMP",
            Self::Load => "LOAD",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        for value in 0..=19u8 {
            let cmd = Command::from_u8(value).unwrap();
            assert_eq!(cmd.as_u8(), value);
        }
    }

    #[test]
    fn unknown_command_rejected() {
        assert!(matches!(
            Command::from_u8(0xFF),
            Err(ProtocolError::UnknownCommand(0xFF))
        ));
    }
}
