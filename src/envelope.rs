use serde_derive::{Deserialize, Serialize};

use heron_rpc_core::error::WireFault;

/// What a frame's payload means to the RPC layer.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kind {
    Request,
    Response,
    Error,
}

/// The schema-encoded record carried inside a frame; the unit of RPC
/// semantics. Dispatch faults travel as a `Response` with `error` set and
/// no response bytes.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct Envelope {
    pub kind: Kind,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireFault>,
}

impl Envelope {
    pub fn request(id: i64, service: &str, method: &str, request: Vec<u8>) -> Envelope {
        Envelope {
            kind: Kind::Request,
            id,
            service: Some(service.to_string()),
            method: Some(method.to_string()),
            request: Some(request),
            response: None,
            error: None,
        }
    }

    pub fn response(id: i64, response: Vec<u8>) -> Envelope {
        Envelope {
            kind: Kind::Response,
            id,
            service: None,
            method: None,
            request: None,
            response: Some(response),
            error: None,
        }
    }

    pub fn fault(id: i64, error: WireFault) -> Envelope {
        Envelope {
            kind: Kind::Response,
            id,
            service: None,
            method: None,
            request: None,
            response: None,
            error: Some(error),
        }
    }
}
