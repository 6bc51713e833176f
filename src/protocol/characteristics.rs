//! Characteristic set resolution.

use serde::Serialize;

use crate::config::LinkIds;
use crate::error::{LinkError, Result};
use crate::transport::{CharProps, DiscoveredCharacteristic, Endpoint};

/// Role a characteristic plays in the link protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EndpointRole {
    /// Host -> peer commands
    Write,
    /// Peer -> host data pull
    Read,
    /// Peer -> host data-available signal
    Notify,
}

impl EndpointRole {
    fn satisfied_by(self, props: CharProps) -> bool {
        match self {
            Self::Write => props.write,
            Self::Read => props.read,
            Self::Notify => props.notify,
        }
    }
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Write => "write",
            Self::Read => "read",
            Self::Notify => "notify",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for EndpointRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "write" | "to-radio" => Ok(Self::Write),
            "read" | "from-radio" => Ok(Self::Read),
            "notify" | "from-num" => Ok(Self::Notify),
            _ => Err(format!("Unknown endpoint role: {}", s)),
        }
    }
}

/// The three endpoints a session talks to. Immutable once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicSet {
    write: Endpoint,
    read: Endpoint,
    notify: Endpoint,
}

impl CharacteristicSet {
    /// Match discovery output against the configured ids.
    ///
    /// A characteristic that is absent, lives outside the configured service,
    /// or lacks the property its role needs counts as missing. Any missing
    /// role is `IncompatiblePeer`.
    pub fn resolve(ids: &LinkIds, discovered: &[DiscoveredCharacteristic]) -> Result<Self> {
        let find = |role: EndpointRole, uuid| {
            discovered
                .iter()
                .find(|c| c.service == ids.service_uuid && c.uuid == uuid)
                .filter(|c| role.satisfied_by(c.props))
                .map(|c| Endpoint(c.uuid))
        };

        let write = find(EndpointRole::Write, ids.write_uuid);
        let read = find(EndpointRole::Read, ids.read_uuid);
        let notify = find(EndpointRole::Notify, ids.notify_uuid);

        match (write, read, notify) {
            (Some(write), Some(read), Some(notify)) => Ok(Self {
                write,
                read,
                notify,
            }),
            (write, read, notify) => {
                let missing = [
                    (EndpointRole::Write, write.is_none()),
                    (EndpointRole::Read, read.is_none()),
                    (EndpointRole::Notify, notify.is_none()),
                ]
                .into_iter()
                .filter_map(|(role, absent)| absent.then_some(role))
                .collect();
                Err(LinkError::IncompatiblePeer { missing })
            },
        }
    }

    /// Host -> peer command endpoint.
    pub fn write(&self) -> Endpoint {
        self.write
    }

    /// Data pull endpoint.
    pub fn read(&self) -> Endpoint {
        self.read
    }

    /// Data-available endpoint.
    pub fn notify(&self) -> Endpoint {
        self.notify
    }
}
