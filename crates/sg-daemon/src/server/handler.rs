//! Inbound SSH session handler
//!
//! Holds back authentication until the upstream session to the workspace
//! exists, then hands every channel to the [`Bridge`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodSet, Pty, Sig};
use russh_keys::key::PublicKey;

use sg_core::{DisconnectKind, FailureCode};

use crate::bridge::{Bridge, ChannelEvent};
use crate::state::GatewayState;

/// Handler for one inbound SSH connection
pub struct GatewayHandler {
    state: Arc<GatewayState>,
    peer_addr: SocketAddr,
    /// Handle of this session, filled by the listener once the
    /// handshake task is running
    inbound: Arc<OnceLock<Handle>>,
    /// Set once a login has reached its workspace
    bridge: Arc<OnceLock<Arc<Bridge>>>,
    /// Outcome per username on this connection; `None` is success
    outcomes: HashMap<String, Option<FailureCode>>,
}

impl GatewayHandler {
    pub fn new(
        state: Arc<GatewayState>,
        peer_addr: SocketAddr,
        inbound: Arc<OnceLock<Handle>>,
        bridge: Arc<OnceLock<Arc<Bridge>>>,
    ) -> Self {
        Self {
            state,
            peer_addr,
            inbound,
            bridge,
            outcomes: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    /// Resolve the login once per username; later attempts replay the outcome
    async fn login(&mut self, user: &str) -> anyhow::Result<Auth> {
        if let Some(outcome) = self.outcomes.get(user) {
            return Ok(match outcome {
                None => Auth::Accept,
                Some(_) => Self::reject(),
            });
        }

        // one upstream session per connection
        if self.bridge.get().is_some() {
            tracing::warn!(peer = %self.peer_addr, user, "Second login on a bridged connection");
            return Ok(Self::reject());
        }

        tracing::info!(peer = %self.peer_addr, user, "Login attempt");

        match self.state.authenticator.authenticate(user).await {
            Ok(authenticated) => {
                tracing::info!(
                    peer = %self.peer_addr,
                    workspace_id = authenticated.context.workspace_id.as_deref().unwrap_or_default(),
                    strategy = %authenticated.kind,
                    "Login accepted"
                );
                let bridge = Bridge::attach(
                    authenticated.session,
                    Arc::clone(&self.inbound),
                    self.state.config.upstream.channel_open_timeout,
                );
                let _ = self.bridge.set(bridge);
                self.outcomes.insert(user.to_string(), None);
                Ok(Auth::Accept)
            }
            Err(failure) => {
                tracing::warn!(peer = %self.peer_addr, user, "Login rejected: {}", failure);
                self.outcomes
                    .insert(user.to_string(), Some(failure.code()));

                let Some(handle) = self.inbound.get().cloned() else {
                    anyhow::bail!("login rejected: {}", failure.message);
                };
                let reason = match failure.code().disconnect_kind() {
                    DisconnectKind::HostNotAllowed => Disconnect::HostNotAllowedToConnect,
                    DisconnectKind::Transport => Disconnect::ConnectionLost,
                };
                let description = failure.message.clone();
                tokio::spawn(async move {
                    let _ = handle
                        .disconnect(reason, description, "en".to_string())
                        .await;
                });
                Ok(Self::reject())
            }
        }
    }

    /// Hand an event to the channel's pair. Waits while that channel's
    /// queue is full, which holds back this session's reads.
    async fn forward(&self, channel: ChannelId, event: ChannelEvent) -> bool {
        match self.bridge.get() {
            Some(bridge) => bridge.forward(channel, event).await,
            None => false,
        }
    }

    /// Forward a channel request and acknowledge it locally
    async fn request(&self, channel: ChannelId, event: ChannelEvent, session: &mut Session) {
        if self.forward(channel, event).await {
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
    }
}

#[async_trait]
impl Handler for GatewayHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.login(user).await
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        self.login(user).await
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.login(user).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(bridge) = self.bridge.get() else {
            return Ok(false);
        };
        let id = channel.id();
        match bridge.open_session(session.handle(), id).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(channel = ?id, "Session channel not mirrored: {}", e);
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(bridge) = self.bridge.get() else {
            return Ok(false);
        };
        let id = channel.id();
        tracing::debug!(
            channel = ?id,
            "direct-tcpip to {}:{}",
            host_to_connect,
            port_to_connect
        );
        match bridge
            .open_direct_tcpip(
                session.handle(),
                id,
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(
                    channel = ?id,
                    "direct-tcpip to {}:{} not mirrored: {}",
                    host_to_connect,
                    port_to_connect,
                    e
                );
                Ok(false)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Data(Bytes::copy_from_slice(data)))
            .await;
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelEvent::ExtendedData {
                code,
                data: Bytes::copy_from_slice(data),
            },
        )
        .await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Eof).await;
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(bridge) = self.bridge.get() {
            bridge.close_channel(channel);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let event = ChannelEvent::PtyRequest {
            term: term.to_string(),
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes: modes.to_vec(),
        };
        self.request(channel, event, session).await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let event = ChannelEvent::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        self.request(channel, event, session).await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.request(channel, ChannelEvent::Shell, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.request(
            channel,
            ChannelEvent::Exec(Bytes::copy_from_slice(data)),
            session,
        )
        .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(channel = ?channel, "Subsystem request: {}", name);
        self.request(channel, ChannelEvent::Subsystem(name.to_string()), session)
            .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(
            channel,
            ChannelEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        )
        .await;
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Signal(signal)).await;
        Ok(())
    }

    /// Remote port forwarding is not offered
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Refusing tcpip-forward for {}:{}", address, port);
        Ok(false)
    }
}

/// Configuration for the SSH server
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Create a server configuration with the given host key
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.methods = MethodSet::NONE | MethodSet::PASSWORD | MethodSet::PUBLICKEY;
        config.auth_rejection_time = std::time::Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
