use std::process::ExitCode;

use crate::error::Error;

/// Maps a top-level failure to the process exit code table (spec §6).
pub fn exit_code(err: &Error) -> ExitCode {
    match err {
        Error::Validation { .. }
        | Error::InvalidHost { .. }
        | Error::InvalidVmName { .. }
        | Error::InvalidPath { .. }
        | Error::InvalidPort { .. }
        | Error::InvalidTimeout { .. }
        | Error::InvalidBandwidth { .. }
        | Error::Configuration { .. }
        | Error::ParseConfig { .. } => ExitCode::from(2),

        Error::Connection { .. } | Error::Network { .. } | Error::HostKey { .. } => {
            ExitCode::from(3)
        }

        Error::Auth { .. } | Error::SshKey { .. } | Error::PermissionDenied { .. } => {
            ExitCode::from(4)
        }

        Error::VmNotFound { .. } => ExitCode::from(5),
        Error::VmExists { .. } => ExitCode::from(6),
        Error::InsufficientResources { .. } | Error::DiskSpace { .. } => ExitCode::from(7),

        Error::Transfer { .. } | Error::Clone { .. } | Error::Sync { .. } | Error::Hypervisor { .. } => {
            ExitCode::from(8)
        }

        Error::OperationCancelled => ExitCode::from(9),
        Error::OperationTimeout { .. } => ExitCode::from(10),

        Error::OperationNotFound { .. }
        | Error::ReadConfig { .. }
        | Error::WriteConfig { .. }
        | Error::Io { .. }
        | Error::General { .. } => ExitCode::from(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_two() {
        let err = Error::Validation { message: "bad".into() };
        assert_eq!(exit_code(&err), ExitCode::from(2));
    }

    #[test]
    fn vm_not_found_maps_to_five() {
        let err = Error::VmNotFound { host: "h".into(), name: "v".into() };
        assert_eq!(exit_code(&err), ExitCode::from(5));
    }

    #[test]
    fn cancelled_maps_to_nine() {
        assert_eq!(exit_code(&Error::OperationCancelled), ExitCode::from(9));
    }

    #[test]
    fn timeout_maps_to_ten() {
        let err = Error::OperationTimeout { operation_id: "x".into(), seconds: 10 };
        assert_eq!(exit_code(&err), ExitCode::from(10));
    }

    #[test]
    fn general_maps_to_one() {
        let err = Error::General { message: "oops".into() };
        assert_eq!(exit_code(&err), ExitCode::from(1));
    }
}
