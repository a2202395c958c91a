use serde::{Deserialize, Serialize};

/// Which side of an offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP document tagged with its role, as carried in `jsep` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }

    pub fn is_answer(&self) -> bool {
        matches!(self.kind, SdpType::Answer | SdpType::Pranswer)
    }
}

/// A single ICE candidate in its browser JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// The payload of a trickle message: one candidate, or the end-of-gathering
/// sentinel `{"completed": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrickleCandidate {
    Candidate(IceCandidate),
    Completed { completed: bool },
}

impl TrickleCandidate {
    pub fn completed() -> Self {
        Self::Completed { completed: true }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { completed: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trickle_sentinel_wire_form() {
        let json = serde_json::to_value(TrickleCandidate::completed()).unwrap();
        assert_eq!(json, serde_json::json!({ "completed": true }));

        let parsed: TrickleCandidate = serde_json::from_value(json).unwrap();
        assert!(parsed.is_completed());
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let parsed: TrickleCandidate = serde_json::from_str(
            r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        match parsed {
            TrickleCandidate::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
            }
            other => panic!("expected a candidate, got {other:?}"),
        }
    }
}
