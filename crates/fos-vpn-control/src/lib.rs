//! fOS VPN Control - Certificate-Based Tunnel Orchestration
//!
//! Owns the client key pair and its short-lived certificate, drives the
//! privileged tunnel process over a typed IPC channel, and composes the
//! tunnel and protocol-agent state machines into one connection.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────── App Process ─────────────────────────┐
//! │                                                               │
//! │  ┌────────────┐   ┌──────────────────┐   ┌─────────────────┐  │
//! │  │ VpnManager │──▶│  TunnelManager   │   │ AgentSession    │  │
//! │  │ (ordering, │   │  (state mirror)  │──▶│ Manager         │  │
//! │  │  refresh)  │   └────────┬─────────┘   └─────────────────┘  │
//! │  └─────┬──────┘            │                      ▲           │
//! │        ▼                   │            AuthenticationData    │
//! │  ┌───────────────────┐     │                      │           │
//! │  │ CredentialManager │─────┼──────────────────────┘           │
//! │  │ (keys, cert, store)│    │                                  │
//! │  └─────────┬─────────┘     │                                  │
//! │            ▼               ▼                                  │
//! │     DirectIssuer    TunnelIpcChannel ◀── IpcIssuer            │
//! └────────────│───────────────│──────────────────────────────────┘
//!              │               │ versioned binary envelopes
//!              ▼               ▼
//!          Backend API    ProviderHandler (privileged process)
//! ```
//!
//! # Invariants
//!
//! - The agent is only connected while the tunnel is observed connected
//! - An expired certificate is never handed out
//! - At most one certificate refresh is in flight

mod agent;
mod certificate;
mod channel;
mod codec;
mod config;
mod credentials;
mod features;
mod issuer;
mod keys;
pub mod logging;
mod manager;
mod message;
mod network;
mod provider;
mod store;
mod tunnel;

#[cfg(test)]
mod testing;

pub use agent::{
    AgentConnector, AgentError, AgentErrorCode, AgentEvent, AgentLink, AgentSession,
    AgentSessionEvent, AgentSessionManager, AgentState,
};
pub use certificate::{AuthenticationData, Certificate};
pub use channel::{
    ControlHandler, ControlSender, FrameCodec, IpcError, IpcTransport, StreamTransport,
    TunnelIpcChannel, serve,
};
pub use codec::{
    CodecError, HEADER_LEN, Header, MAX_ERROR_LEN, MAX_PAYLOAD_LEN, PROTOCOL_VERSION,
    decode_request, decode_response, encode_request, encode_response,
};
pub use config::{
    ConfigError, ControlConfig, Endpoint, LoggingConfig, ServerTarget, TunnelConfig,
    TunnelProtocol,
};
pub use credentials::{AuthError, CredentialManager, CredentialState};
pub use features::{NetShieldLevel, VpnFeatures};
pub use issuer::{
    ApiSession, CertificateIssuer, DirectIssuer, IpcIssuer, RefreshError, RefreshOutcome,
};
pub use keys::{KeyError, KeyGenerator, KeyPair, PrivateKey, PublicKey, X25519Generator};
pub use manager::{VpnError, VpnEvent, VpnManager};
pub use message::{ControlMessage, ControlResponse};
pub use network::{ApiRequest, ApiResponse, Method, NetworkClient, NetworkError};
pub use provider::{ProviderHandler, TunnelBackend};
pub use store::{FileStore, KeyCertStore, MemoryStore, StoreError};
pub use tunnel::{
    RawTunnelStatus, StatusFeed, TunnelError, TunnelEvent, TunnelManager, TunnelState,
    TunnelStatusSource,
};
