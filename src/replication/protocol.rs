//! Node-to-node request kinds and payloads (JSON over `POST /node/req/:req_type`)

use crate::common::{Error, NodeType};
use crate::store::{Dataset, Node};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRequestKind {
    /// Current data version of the answering node
    Version,
    /// Full dataset of the answering node
    Pull,
    /// Upsert the caller in the master's node registry
    Register,
}

impl PeerRequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRequestKind::Version => "version",
            PeerRequestKind::Pull => "pull",
            PeerRequestKind::Register => "register",
        }
    }
}

impl fmt::Display for PeerRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerRequestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "version" => Ok(PeerRequestKind::Version),
            "pull" => Ok(PeerRequestKind::Pull),
            "register" => Ok(PeerRequestKind::Register),
            other => Err(Error::UnknownPeerRequest(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub data_version: u64,
    pub node_type: NodeType,
}

/// Answer to a peer request, serialized as its bare payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PeerResponse {
    Version(VersionResponse),
    Pull(Dataset),
    Registered(Node),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        for kind in [
            PeerRequestKind::Version,
            PeerRequestKind::Pull,
            PeerRequestKind::Register,
        ] {
            assert_eq!(kind.as_str().parse::<PeerRequestKind>().unwrap(), kind);
        }
        assert!(matches!(
            "sync".parse::<PeerRequestKind>(),
            Err(Error::UnknownPeerRequest(_))
        ));
    }

    #[test]
    fn test_version_response_wire_shape() {
        let resp = PeerResponse::Version(VersionResponse {
            data_version: 9,
            node_type: NodeType::Master,
        });
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            serde_json::json!({ "data_version": 9, "node_type": "master" })
        );
    }
}
