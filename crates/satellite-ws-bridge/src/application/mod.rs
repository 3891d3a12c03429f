//! Application layer: how frames and lines cross the bridge.

pub mod relay;

pub use relay::{
    binary_frame_to_lines, client_is_alive, frame_to_lines, hub_line_to_frame, is_keepalive_reply, keepalive_line,
    BridgeError, CLIENT_SILENCE_INTERVALS, KEEPALIVE_PAYLOAD,
};
