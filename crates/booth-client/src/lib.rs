//! Call-session side of the Virtual Booth.
//!
//! [`signaling`] joins a room through the gateway, [`session::CallSession`]
//! runs the call (peer mesh, grace period, session cap) and
//! [`webrtc_peer`] supplies real peer connections.

pub mod config;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod webrtc_peer;

pub use config::ClientConfig;
pub use peer::{PeerEvent, PeerFactory, PeerLink, PeerState};
pub use session::{CallHandle, CallInfo, CallSession, CallSummary};
pub use signaling::{
    fetch_rtc_config, join_call, signaling_url_for, JoinOptions, RtcConfig, SignalingClient,
    SignalingConnection,
};
pub use webrtc_peer::WebRtcPeerFactory;
