//! Application-level test messages.
//!
//! The gateway treats user payloads as opaque bytes; these are the
//! messages the mock backend and test clients agree on.  JSON with a
//! `kind` tag, like any small service protocol.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum AppMsg {
    LoginReq { req_id: u32, uid: u64 },
    LoginResp { req_id: u32, msg: String },
    EchoReq { req_id: u32, msg: String },
    EchoResp { req_id: u32, msg: String },
    ErrorResp { msg: String },
}

impl AppMsg {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("app message serializes")
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let msg = AppMsg::LoginReq { req_id: 1, uid: 42 };
        assert_eq!(AppMsg::decode(&msg.encode()).unwrap(), msg);
    }
}
