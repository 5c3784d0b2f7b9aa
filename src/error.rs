//! Bridge-wide error handling.
//!
//! Each layer owns its error enum; this module gathers the convenience
//! re-exports.

pub use crate::{
    ari::{AriError, Result as AriResult},
    call::{CallError, Result as CallResult},
    config::SettingsError,
    outbound::{OutboundError, Result as OutboundResult, StoreError},
    realtime::{RealtimeError, Result as RealtimeResult},
    rtp::{EndpointError, PacketError},
    tools::NetInfoError,
    ws::Error as WsError,
};
