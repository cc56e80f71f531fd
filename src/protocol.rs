//! Real-time wire protocol
//!
//! JSON messages over the websocket, tagged by `type`. Server pushes are
//! either broadcast (pixel, online), unicast to one user's connections
//! (availablePixels, pixelLastPlaced, undo, standing) or sent once on
//! connect (config, canvas).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PaletteColor;

/// Why the Admission Gate turned a placement down. Expected, user-facing,
/// never logged as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoUser,
    Banned,
    OutOfBounds,
    InvalidColor,
    OnCooldown,
    Frozen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMsg {
    /// Client configuration pushed once on connect and on reload.
    #[serde(rename_all = "camelCase")]
    Config {
        palette: Vec<PaletteColor>,
        width: u32,
        height: u32,
        base_cooldown_secs: u64,
        max_stack: u32,
    },
    /// Full snapshot, row-major color-or-empty strings.
    Canvas { cells: Vec<String> },
    /// One accepted placement, broadcast to every other live connection.
    #[serde(rename_all = "camelCase")]
    Pixel { x: i32, y: i32, color_id: i32 },
    /// Unicast stack count plus next-refill time.
    #[serde(rename_all = "camelCase")]
    AvailablePixels {
        count: u32,
        next_refill_at: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    PixelLastPlaced { placed_at: DateTime<Utc> },
    /// Undo window state, unicast.
    #[serde(rename_all = "camelCase")]
    Undo {
        window_expires_at: Option<DateTime<Utc>>,
    },
    /// Live connection count across all shards, broadcast.
    Online { count: i64 },
    /// Ban status, unicast.
    #[serde(rename_all = "camelCase")]
    Standing {
        banned: bool,
        until: Option<DateTime<Utc>>,
        reason: Option<String>,
    },
    /// Acknowledgement of a `place` request.
    #[serde(rename_all = "camelCase")]
    PlaceAck {
        accepted: bool,
        x: i32,
        y: i32,
        color_id: i32,
        reason: Option<RejectReason>,
    },
    /// Acknowledgement of an `undo` request.
    UndoAck { accepted: bool },
    /// Malformed or unprocessable client message.
    Error { code: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMsg {
    #[serde(rename_all = "camelCase")]
    Place { x: i32, y: i32, color_id: i32 },
    Undo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reasons_use_wire_names() {
        assert_eq!(
            serde_json::to_string(&RejectReason::OnCooldown).unwrap(),
            "\"on_cooldown\""
        );
        assert_eq!(
            serde_json::to_string(&RejectReason::NoUser).unwrap(),
            "\"no_user\""
        );
    }

    #[test]
    fn client_place_roundtrip() {
        let msg: ClientMsg =
            serde_json::from_str(r#"{"type":"place","x":2,"y":3,"colorId":5}"#).unwrap();
        match msg {
            ClientMsg::Place { x, y, color_id } => {
                assert_eq!((x, y, color_id), (2, 3, 5));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn server_messages_are_type_tagged() {
        let encoded = serde_json::to_string(&ServerMsg::Online { count: 4 }).unwrap();
        assert_eq!(encoded, r#"{"type":"online","count":4}"#);

        let encoded = serde_json::to_string(&ServerMsg::Pixel {
            x: 1,
            y: 2,
            color_id: 3,
        })
        .unwrap();
        assert!(encoded.contains(r#""type":"pixel""#));
        assert!(encoded.contains(r#""colorId":3"#));
    }
}
