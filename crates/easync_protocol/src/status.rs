//! Protocol status codes.
//!
//! These are the only outcomes a client ever sees; internal errors are
//! translated to the nearest code before a response is written.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

macro_rules! status_codes {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            /// Returns the numeric wire code.
            pub fn code(&self) -> u8 {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            /// Decodes a numeric wire code.
            ///
            /// # Errors
            ///
            /// Returns [`ProtocolError::UnknownCode`] for an unknown code.
            pub fn from_code(code: u8) -> ProtocolResult<Self> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(ProtocolError::UnknownCode {
                        kind: $kind,
                        code: i64::from(other),
                    }),
                }
            }
        }
    };
}

status_codes! {
    /// Status of a SYNC response or of one collection in it.
    SyncStatus, "sync status" {
        /// Success.
        Success = 1,
        /// The synckey is unknown; the client must restart with `"0"`.
        InvalidSyncKey = 3,
        /// Malformed request.
        ProtocolError = 4,
        /// Server-side failure.
        ServerError = 5,
        /// Item could not be converted.
        ConversionError = 6,
        /// Client and server changed the same item.
        Conflict = 7,
        /// Item not found.
        ObjectNotFound = 8,
        /// The command could not be completed.
        CannotComplete = 9,
        /// The folder hierarchy changed; a FOLDERSYNC is required.
        FolderHierarchyChanged = 12,
        /// A partial request could not be completed; send a full SYNC.
        RequestIncomplete = 13,
        /// Wait or heartbeat interval out of bounds.
        InvalidWaitOrHeartbeat = 14,
        /// Invalid command in the request.
        InvalidSyncCommand = 15,
        /// Transient condition; retry.
        Retry = 16,
    }
}

status_codes! {
    /// Status of a PING response.
    PingStatus, "ping status" {
        /// Heartbeat expired without changes.
        HeartbeatExpired = 1,
        /// Changes found in at least one folder.
        ChangesFound = 2,
        /// Parameters missing; resend the full request.
        MissingParameters = 3,
        /// Malformed request.
        ProtocolError = 4,
        /// Heartbeat out of bounds.
        HeartbeatOutOfBounds = 5,
        /// Too many folders requested.
        TooManyFolders = 6,
        /// The hierarchy must be resynchronized.
        FolderSyncRequired = 7,
        /// Server-side failure.
        ServerError = 8,
    }
}

status_codes! {
    /// Status of a FOLDERSYNC response.
    FolderSyncStatus, "foldersync status" {
        /// Success.
        Success = 1,
        /// Server-side failure.
        ServerError = 6,
        /// The hierarchy synckey is unknown.
        InvalidSyncKey = 9,
        /// Malformed request.
        ProtocolError = 10,
    }
}

status_codes! {
    /// Remote wipe status of a device.
    RemoteWipeStatus, "remote wipe status" {
        /// No wipe was ever requested.
        NotApplicable = 0,
        /// The device is in good standing.
        Ok = 1,
        /// A wipe was requested and not yet acknowledged.
        Pending = 2,
        /// The device confirmed the wipe.
        Wiped = 3,
    }
}

impl RemoteWipeStatus {
    /// Returns true if a wipe must interrupt any running sync.
    pub fn requires_folder_sync(&self) -> bool {
        matches!(self, RemoteWipeStatus::Pending | RemoteWipeStatus::Wiped)
    }
}

impl Default for RemoteWipeStatus {
    fn default() -> Self {
        RemoteWipeStatus::NotApplicable
    }
}

/// How strictly device provisioning is enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisioningMode {
    /// Provisioning is disabled.
    #[default]
    None,
    /// Provisioning is offered but not required.
    Loose,
    /// Provisioning is required.
    Enforced,
}

impl ProvisioningMode {
    /// Returns true if remote wipe status must be checked.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, ProvisioningMode::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for status in [
            SyncStatus::Success,
            SyncStatus::InvalidSyncKey,
            SyncStatus::FolderHierarchyChanged,
            SyncStatus::RequestIncomplete,
        ] {
            assert_eq!(SyncStatus::from_code(status.code()).unwrap(), status);
        }
        assert_eq!(PingStatus::ChangesFound.code(), 2);
        assert_eq!(FolderSyncStatus::InvalidSyncKey.code(), 9);
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(matches!(
            SyncStatus::from_code(2),
            Err(ProtocolError::UnknownCode { code: 2, .. })
        ));
    }

    #[test]
    fn wipe_interrupts_sync() {
        assert!(RemoteWipeStatus::Pending.requires_folder_sync());
        assert!(RemoteWipeStatus::Wiped.requires_folder_sync());
        assert!(!RemoteWipeStatus::Ok.requires_folder_sync());
        assert!(!RemoteWipeStatus::default().requires_folder_sync());
    }
}
