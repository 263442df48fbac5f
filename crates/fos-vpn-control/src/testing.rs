//! In-crate fakes for the collaborator traits

use crate::agent::{
    AgentConnector, AgentError, AgentErrorCode, AgentLink, AgentSession, AgentSessionEvent,
};
use crate::certificate::{AuthenticationData, Certificate};
use crate::channel::{ControlSender, IpcError};
use crate::config::{Endpoint, ServerTarget};
use crate::features::VpnFeatures;
use crate::issuer::{CertificateIssuer, RefreshOutcome};
use crate::keys::{KeyError, KeyGenerator, KeyPair, PrivateKey};
use crate::message::{ControlMessage, ControlResponse};
use crate::network::{ApiRequest, ApiResponse, NetworkClient, NetworkError};
use crate::tunnel::{RawTunnelStatus, StatusFeed};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{Semaphore, mpsc};

/// A server target with a predictable hostname
pub fn target(name: &str) -> ServerTarget {
    let host = name.to_lowercase().replace('#', "-");
    ServerTarget::new(name, format!("{}.vpn.example", host), Endpoint::ipv4(10, 2, 0, 1, 51820))
}

/// Certificate valid for an hour, soft refresh after half an hour
pub fn certificate_for(features: &VpnFeatures) -> Certificate {
    let now = SystemTime::now();
    Certificate::new(
        ScriptedIssuer::CERTIFICATE,
        now + Duration::from_secs(3600),
        now + Duration::from_secs(1800),
        *features,
    )
}

pub fn auth_data(features: &VpnFeatures) -> AuthenticationData {
    AuthenticationData::new(PrivateKey::generate(), &certificate_for(features))
}

/// Key generator that counts invocations
#[derive(Default)]
pub struct CountingGenerator {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl CountingGenerator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl KeyGenerator for CountingGenerator {
    fn generate(&self) -> Result<KeyPair, KeyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(KeyError::GenerationFailed("entropy unavailable".into()));
        }
        Ok(KeyPair::generate())
    }
}

/// Issuer answering from a script, then with valid certificates
///
/// A gated issuer holds every call until [`ScriptedIssuer::release`].
#[derive(Default)]
pub struct ScriptedIssuer {
    outcomes: Mutex<VecDeque<RefreshOutcome>>,
    requested: Mutex<Vec<VpnFeatures>>,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
}

impl ScriptedIssuer {
    pub const CERTIFICATE: &'static str =
        "-----BEGIN CERTIFICATE-----\nISSUED\n-----END CERTIFICATE-----";

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn with_outcomes(outcomes: Vec<RefreshOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested_features(&self) -> Vec<VpnFeatures> {
        self.requested.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }

    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }
}

#[async_trait]
impl CertificateIssuer for ScriptedIssuer {
    async fn refresh_certificate(&self, _keys: &KeyPair, features: &VpnFeatures) -> RefreshOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(*features);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let scripted = self.outcomes.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(certificate_for(features)))
    }
}

/// Network client replaying canned responses
pub struct ScriptedClient {
    responses: Mutex<VecDeque<ApiResponse>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedClient {
    pub fn new(responses: Vec<ApiResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkClient for ScriptedClient {
    async fn perform(&self, request: ApiRequest) -> Result<ApiResponse, NetworkError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| NetworkError::ConnectionFailed("no scripted response".into()))
    }
}

/// Control sender replaying canned responses, `Ok` once exhausted
pub struct ScriptedSender {
    responses: Mutex<VecDeque<Result<ControlResponse, IpcError>>>,
    sent: Mutex<Vec<ControlMessage>>,
}

impl ScriptedSender {
    pub fn new(responses: Vec<Result<ControlResponse, IpcError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlSender for ScriptedSender {
    async fn send(&self, message: ControlMessage) -> Result<ControlResponse, IpcError> {
        self.sent.lock().unwrap().push(message);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ControlResponse::Ok))
    }
}

/// Privileged process stand-in: reports the resulting status through its
/// feed, then acknowledges start/stop
pub struct FakeTunnelProcess {
    feed: StatusFeed,
    sent: Mutex<Vec<ControlMessage>>,
    start_error: Mutex<Option<String>>,
    confirm: AtomicBool,
    reply_delay: Mutex<Duration>,
}

impl FakeTunnelProcess {
    pub fn new() -> Self {
        Self {
            feed: StatusFeed::new(),
            sent: Mutex::new(Vec::new()),
            start_error: Mutex::new(None),
            confirm: AtomicBool::new(true),
            reply_delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    pub fn publish(&self, status: RawTunnelStatus) {
        self.feed.publish(status);
    }

    pub fn sent(&self) -> Vec<ControlMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reject_start(&self, reason: &str) {
        *self.start_error.lock().unwrap() = Some(reason.to_string());
    }

    /// Report `connecting` but never `connected`
    pub fn hold_connected(&self) {
        self.confirm.store(false, Ordering::SeqCst);
    }

    /// Hold every reply back after the statuses went out
    pub fn delay_replies(&self, delay: Duration) {
        *self.reply_delay.lock().unwrap() = delay;
    }

    async fn reply(&self, statuses: &[RawTunnelStatus]) -> Result<ControlResponse, IpcError> {
        for status in statuses {
            self.feed.publish(*status);
        }
        let delay = *self.reply_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(ControlResponse::Ok)
    }
}

#[async_trait]
impl ControlSender for FakeTunnelProcess {
    async fn send(&self, message: ControlMessage) -> Result<ControlResponse, IpcError> {
        self.sent.lock().unwrap().push(message.clone());
        match message {
            ControlMessage::StartTunnel(_) => {
                if let Some(reason) = self.start_error.lock().unwrap().clone() {
                    return Ok(ControlResponse::Error(reason));
                }
                if self.confirm.load(Ordering::SeqCst) {
                    self.reply(&[RawTunnelStatus::CONNECTING, RawTunnelStatus::CONNECTED]).await
                } else {
                    self.reply(&[RawTunnelStatus::CONNECTING]).await
                }
            }
            ControlMessage::StopTunnel => {
                self.reply(&[RawTunnelStatus::DISCONNECTING, RawTunnelStatus::DISCONNECTED]).await
            }
            _ => Ok(ControlResponse::Error("unsupported".into())),
        }
    }
}

/// How the next agent handshake behaves
#[derive(Debug, Clone, Copy)]
pub enum Handshake {
    Complete,
    Fail(AgentErrorCode),
    Stall,
}

/// Agent connector recording every session it opens
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Handshake>>,
    certificates: Mutex<Vec<String>>,
    links: Mutex<Vec<mpsc::Sender<AgentSessionEvent>>>,
    features: Arc<Mutex<Vec<VpnFeatures>>>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn script(&self, handshake: Handshake) {
        self.script.lock().unwrap().push_back(handshake);
    }

    pub fn opens(&self) -> usize {
        self.certificates.lock().unwrap().len()
    }

    pub fn opened_certificates(&self) -> Vec<String> {
        self.certificates.lock().unwrap().clone()
    }

    pub fn pushed_features(&self) -> Vec<VpnFeatures> {
        self.features.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver an event on the most recently opened session
    pub async fn inject(&self, event: AgentSessionEvent) {
        let link = self.links.lock().unwrap().last().cloned();
        if let Some(link) = link {
            let _ = link.send(event).await;
        }
    }
}

#[async_trait]
impl AgentConnector for ScriptedConnector {
    async fn open(
        &self,
        _target: &ServerTarget,
        auth: &AuthenticationData,
    ) -> Result<AgentLink, AgentError> {
        self.certificates.lock().unwrap().push(auth.certificate.clone());
        let handshake = self.script.lock().unwrap().pop_front().unwrap_or(Handshake::Complete);

        let (tx, events) = mpsc::channel(16);
        match handshake {
            Handshake::Complete => {
                let _ = tx.try_send(AgentSessionEvent::Connected);
            }
            Handshake::Fail(code) => {
                let _ = tx.try_send(AgentSessionEvent::Error {
                    code,
                    message: "rejected".into(),
                });
            }
            Handshake::Stall => {}
        }
        self.links.lock().unwrap().push(tx);

        Ok(AgentLink {
            session: Box::new(FakeAgentSession {
                features: self.features.clone(),
                closed: self.closed.clone(),
            }),
            events,
        })
    }
}

struct FakeAgentSession {
    features: Arc<Mutex<Vec<VpnFeatures>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl AgentSession for FakeAgentSession {
    async fn set_features(&self, features: &VpnFeatures) -> Result<(), AgentError> {
        self.features.lock().unwrap().push(*features);
        Ok(())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
