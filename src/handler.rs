//! The routing core's control flow. One task owns every table and drives
//! the whole pipeline: UPDATE from a peer -> Adj-RIB-In -> import policy ->
//! decision process -> Loc-RIB -> export policy (and reflection) ->
//! Adj-RIB-Out -> UPDATEs queued per peer. The control surface reaches in
//! through a command channel; background timers sweep discovery, refresh
//! local agents, and audit the tables.

use std::collections::HashSet;
use std::error::Error;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};

use crate::advertise::AdvertisementManager;
use crate::api::{serve_api, ApiCommand, ApiRx, LearnedRoute, PolicyTestResult};
use crate::balancer::{MultiPathBalancer, Strategy};
use crate::config::{ConfigError, ServerConfig};
use crate::discovery::{rank_candidates, DiscoveryEvent, DiscoveryManager, NetworkAgentRecord};
use crate::events::{Event, EventBus};
use crate::message::{
    DiscoveryRequestMessage, DiscoveryResponseMessage, KeepaliveMessage, Message,
    NotificationMessage, UpdateMessage, CAP_DISCOVERY_BROADCAST,
};
use crate::policy::{default_policies, Policy, PolicyEngine, PolicyOutcome};
use crate::reflector::{PeerType, RouteReflector};
use crate::rib::{decision, AgentId, Asn, Rib, Route};
use crate::session::{SessionManager, SessionUpdate};

/// Interval for the RIB consistency audit
const AUDIT_INTERVAL_SECS: u64 = 300;
/// How long a forwarded discovery request id is remembered
const FORWARD_MEMORY_SECS: u64 = 60;

struct PendingDiscovery {
    request_id: String,
    capability: String,
    max_results: usize,
    deadline: Instant,
    collected: Vec<NetworkAgentRecord>,
    reply: Option<tokio::sync::oneshot::Sender<Vec<NetworkAgentRecord>>>,
}

pub struct Handler {
    config: Arc<ServerConfig>,
    rib: Rib,
    policy: PolicyEngine,
    manager: SessionManager,
    advertiser: AdvertisementManager,
    discovery: DiscoveryManager,
    balancer: MultiPathBalancer,
    reflector: Option<RouteReflector>,
    events: EventBus,
    api_rx: ApiRx,
    pending_discoveries: Vec<PendingDiscovery>,
    /// request id -> (origin peer, first seen); for relaying responses
    forwarded_discoveries: Vec<(String, Asn, Instant)>,
    request_counter: u64,
}

/// Load the static policy set: the configured JSON bundle, or the
/// built-in defaults when no path is given
fn load_policies(config: &ServerConfig) -> Result<Vec<Policy>, ConfigError> {
    match &config.policy_path {
        Some(path) => {
            let contents =
                fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
            let policies: Vec<Policy> = serde_json::from_str(&contents)
                .map_err(|err| ConfigError::Parse(format!("policy file {}: {}", path, err)))?;
            Ok(policies)
        }
        None => Ok(default_policies()),
    }
}

/// Bring the whole daemon up and run it until interrupted
pub async fn serve(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let config = Arc::new(config);
    let listener =
        TcpListener::bind(SocketAddr::from((config.listen_address, config.listen_port))).await?;
    info!(
        "Starting agent routing server for AS{} on {}...",
        config.local_asn,
        listener.local_addr()?
    );

    let (api_tx, api_rx) = mpsc::unbounded_channel();
    let api_handle = serve_api(
        SocketAddr::from((config.listen_address, config.api_port)),
        api_tx,
    )
    .await?;

    let mut handler = Handler::new(config, listener, api_rx)?;
    handler.register_static_agents();
    handler.run().await;

    drop(api_handle);
    Ok(())
}

impl Handler {
    pub fn new(
        config: Arc<ServerConfig>,
        listener: TcpListener,
        api_rx: ApiRx,
    ) -> Result<Self, ConfigError> {
        let policies = load_policies(&config)?;
        let policy = PolicyEngine::with_history_size(policies, config.policy_history)
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        let strategy: Strategy = config
            .balancer
            .strategy
            .parse()
            .map_err(ConfigError::Parse)?;
        let reflector = if config.reflector.enabled {
            info!("Route reflection enabled [cluster {}]", config.reflector.cluster_id);
            let reflector_policies = match &config.reflector.policy_path {
                Some(path) => {
                    let contents =
                        fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
                    serde_json::from_str(&contents).map_err(|err| {
                        ConfigError::Parse(format!("reflector policy file {}: {}", path, err))
                    })?
                }
                None => Vec::new(),
            };
            Some(RouteReflector::with_policies(
                &config.reflector.cluster_id,
                reflector_policies,
            ))
        } else {
            None
        };

        Ok(Self {
            manager: SessionManager::new(config.clone(), listener),
            advertiser: AdvertisementManager::new(
                config.local_asn,
                &config.local_url,
                config.default_local_pref,
            ),
            discovery: DiscoveryManager::new(config.local_asn, config.discovery.clone()),
            balancer: MultiPathBalancer::new(config.balancer.max_paths, strategy),
            rib: Rib::new(),
            policy,
            reflector,
            events: EventBus::new(),
            api_rx,
            pending_discoveries: Vec::new(),
            forwarded_discoveries: Vec::new(),
            request_counter: 0,
            config,
        })
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Agents declared in the config file are registered before the first
    /// session comes up
    fn register_static_agents(&mut self) {
        for spec in self.config.agents.clone() {
            let registration = crate::advertise::AgentRegistration {
                agent_id: spec.agent_id.clone(),
                capabilities: spec.capabilities,
                version: spec.version,
                description: spec.description,
                metadata: None,
                health_status: None,
                local_pref: spec.local_pref,
            };
            match self.advertiser.register(registration) {
                Ok(_) => self.recompute(&spec.agent_id),
                Err(err) => warn!("Skipping static agent: {}", err),
            }
        }
    }

    pub async fn run(&mut self) {
        let mut sweeper = interval(Duration::from_secs(self.config.discovery.sweep_interval));
        let mut refresher = interval(Duration::from_secs(self.config.refresh_interval));
        let mut auditor = interval(Duration::from_secs(AUDIT_INTERVAL_SECS));
        // The first tick of a tokio interval fires immediately
        sweeper.tick().await;
        refresher.tick().await;
        auditor.tick().await;

        loop {
            tokio::select! {
                update = self.manager.get_update() => {
                    if let Some(update) = update {
                        self.on_session_update(update);
                    }
                },
                command = self.api_rx.recv() => {
                    match command {
                        Some(command) => self.on_api_command(command).await,
                        None => break,
                    }
                },
                _ = sweeper.tick() => self.on_sweep(),
                _ = refresher.tick() => self.on_refresh().await,
                _ = auditor.tick() => self.on_audit(),
                _ = tokio::signal::ctrl_c() => {
                    self.shutdown().await;
                    return;
                },
            }
            self.settle_discoveries();
        }
    }

    // ---- Session plumbing ----

    fn on_session_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::Established(asn) => {
                self.events.publish(Event::SessionEstablished { asn });
                self.export_full_to(asn);
            }
            SessionUpdate::Learned((asn, update)) => self.process_update(asn, update),
            SessionUpdate::RefreshRequested(asn) => {
                debug!("AS{} asked for a route refresh", asn);
                self.export_full_to(asn);
            }
            SessionUpdate::DiscoveryRequest((asn, request)) => {
                self.on_discovery_request(asn, request);
            }
            SessionUpdate::DiscoveryResponse((asn, response)) => {
                self.on_discovery_response(asn, response);
            }
            SessionUpdate::Ended(asns) => {
                for asn in asns {
                    self.events.publish(Event::SessionError {
                        asn,
                        reason: "session ended".to_string(),
                    });
                    self.drop_peer_state(asn);
                }
            }
        }
    }

    /// Ingress pipeline for one UPDATE
    fn process_update(&mut self, asn: Asn, update: UpdateMessage) {
        let advertised = update.advertised_routes.len();
        let withdrawn = update.withdrawn_routes.len();
        let mut affected: HashSet<AgentId> = HashSet::new();

        for mut route in update.advertised_routes {
            if route.agent_id.is_empty() || route.capabilities.is_empty() || route.next_hop.is_empty()
            {
                debug!("Dropping malformed route from AS{}", asn);
                continue;
            }
            // The sender is the most recent hop
            route.prepend_as(asn);
            if self.rib.insert_from_peer(asn, route.clone()).is_err() {
                continue;
            }
            if let Some(event) = self.discovery.observe_route(&route) {
                self.publish_discovery(event);
            }
            affected.insert(route.agent_id);
        }
        for agent_id in update.withdrawn_routes {
            if self.rib.withdraw_from_peer(asn, &agent_id) {
                if self.discovery.get(&agent_id).map(|r| r.source_asn) == Some(asn) {
                    if let Some(event) = self.discovery.remove_agent(&agent_id) {
                        self.publish_discovery(event);
                    }
                }
                affected.insert(agent_id);
            }
        }

        if advertised + withdrawn > 0 {
            self.events.publish(Event::RouteUpdate {
                asn,
                advertised,
                withdrawn,
            });
        }
        for agent_id in affected {
            self.recompute(&agent_id);
        }
    }

    /// Re-run the decision process for one agent id and converge the
    /// egress tables
    fn recompute(&mut self, agent_id: &str) {
        let mut candidates: Vec<Route> = self
            .rib
            .alternatives_for(agent_id)
            .into_iter()
            .filter_map(|(_, route)| self.policy.apply_import(&route))
            .collect();
        if let Some(local) = self.advertiser.route_for_agent(agent_id) {
            candidates.push(local);
        }

        match decision::select_best(candidates) {
            Some(best) => {
                let unchanged = self
                    .rib
                    .lookup_best(agent_id)
                    .map(|current| {
                        current.next_hop == best.next_hop
                            && current.as_path == best.as_path
                            && current.local_pref == best.local_pref
                            && current.med == best.med
                    })
                    .unwrap_or(false);
                if self.rib.install_best(best.clone()).is_err() {
                    return;
                }
                if !unchanged {
                    self.export_route(&best);
                }
            }
            None => {
                if self.rib.remove_best(agent_id).is_some() {
                    self.withdraw_everywhere(agent_id);
                }
            }
        }
    }

    fn withdraw_everywhere(&mut self, agent_id: &str) {
        for peer in self.rib.peers_announcing(agent_id) {
            self.rib.remove_for_peer(peer, agent_id);
            self.manager.send_to_peer(
                peer,
                Message::Update(UpdateMessage::withdraw(
                    self.config.local_asn,
                    vec![agent_id.to_string()],
                )),
            );
        }
    }

    /// Peers eligible to hear about this route: everyone for local
    /// originations, the reflection matrix otherwise
    fn targets_for(&self, route: &Route) -> Vec<Asn> {
        let peer_classes = self.manager.peer_classes();
        let source_asn = route.first_as();
        let local_origin = source_asn == Some(self.config.local_asn);
        match (&self.reflector, local_origin) {
            (Some(reflector), false) => {
                let source = source_asn.unwrap_or(0);
                let source_class = peer_classes
                    .iter()
                    .find(|(asn, _)| *asn == source)
                    .map(|(_, class)| *class)
                    .unwrap_or(PeerType::Ebgp);
                reflector.targets_for(source, source_class, &peer_classes)
            }
            _ => peer_classes.iter().map(|(asn, _)| *asn).collect(),
        }
    }

    /// Export one route to one peer: export policy, reflection decoration,
    /// Adj-RIB-Out install. None means the peer does not get it.
    fn export_one(&mut self, route: &Route, peer: Asn) -> Option<Route> {
        let mut exported =
            self.policy
                .export_for_peer(route, peer, self.config.local_asn)?;
        let source_asn = route.first_as();
        if source_asn != Some(self.config.local_asn) {
            if let Some(reflector) = &self.reflector {
                let originator = self
                    .manager
                    .peer_address(source_asn.unwrap_or(0))
                    .unwrap_or_else(|| route.next_hop.clone());
                exported = reflector.reflect(&exported, &originator)?;
            }
        }
        match self.rib.insert_for_peer(peer, exported.clone()) {
            Ok(()) => Some(exported),
            Err(err) => {
                debug!("Not exporting to AS{}: {}", peer, err);
                None
            }
        }
    }

    /// Push one (changed) route out to every eligible peer, and withdraw
    /// it from peers that are no longer eligible
    fn export_route(&mut self, route: &Route) {
        let previously = self.rib.peers_announcing(&route.agent_id);
        let mut sent: HashSet<Asn> = HashSet::new();
        for peer in self.targets_for(route) {
            if let Some(exported) = self.export_one(route, peer) {
                self.manager.send_to_peer(
                    peer,
                    Message::Update(UpdateMessage::advertise(
                        self.config.local_asn,
                        vec![exported],
                    )),
                );
                sent.insert(peer);
            }
        }
        for peer in previously {
            if !sent.contains(&peer) {
                self.rib.remove_for_peer(peer, &route.agent_id);
                self.manager.send_to_peer(
                    peer,
                    Message::Update(UpdateMessage::withdraw(
                        self.config.local_asn,
                        vec![route.agent_id.clone()],
                    )),
                );
            }
        }
    }

    /// Fresh session: advertise everything the peer is eligible for in
    /// one batched UPDATE
    fn export_full_to(&mut self, asn: Asn) {
        let mut batch: Vec<Route> = Vec::new();
        for route in self.rib.list_all_best() {
            if !self.targets_for(&route).contains(&asn) {
                continue;
            }
            if let Some(exported) = self.export_one(&route, asn) {
                batch.push(exported);
            }
        }
        if !batch.is_empty() {
            debug!("Advertising {} routes to AS{}", batch.len(), asn);
            self.manager.send_to_peer(
                asn,
                Message::Update(UpdateMessage::advertise(self.config.local_asn, batch)),
            );
        }
    }

    /// Remove every trace of a peer and reconverge affected agent ids
    fn drop_peer_state(&mut self, asn: Asn) {
        let agent_ids = self.rib.agent_ids_from_peer(asn);
        self.rib.drop_all_from_peer(asn);
        self.rib.drop_all_for_peer(asn);
        for event in self.discovery.remove_peer(asn) {
            self.publish_discovery(event);
        }
        for agent_id in agent_ids {
            self.recompute(&agent_id);
        }
    }

    fn publish_discovery(&self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Discovered(record) => self.events.publish(Event::AgentDiscovered {
                agent_id: record.agent_id,
                source_asn: record.source_asn,
            }),
            DiscoveryEvent::Changed(record) => self.events.publish(Event::CapabilityChanged {
                agent_id: record.agent_id,
                source_asn: record.source_asn,
            }),
            DiscoveryEvent::Lost {
                agent_id,
                source_asn,
            } => self.events.publish(Event::AgentLost {
                agent_id,
                source_asn,
            }),
        }
    }

    // ---- Broadcast discovery ----

    fn on_discovery_request(&mut self, asn: Asn, request: DiscoveryRequestMessage) {
        let already_seen = self
            .forwarded_discoveries
            .iter()
            .any(|(id, _, _)| *id == request.request_id)
            || self
                .pending_discoveries
                .iter()
                .any(|p| p.request_id == request.request_id);
        if already_seen {
            return;
        }

        // Answer from our installed view; never hand a peer a route that
        // already carries it
        let routes: Vec<Route> = self
            .rib
            .find_by_capability(&request.capability)
            .into_iter()
            .filter(|route| !route.contains_as(asn))
            .collect();
        if !routes.is_empty() {
            self.manager.send_to_peer(
                asn,
                Message::DiscoveryResponse(DiscoveryResponseMessage {
                    sender_asn: self.config.local_asn,
                    request_id: request.request_id.clone(),
                    routes,
                }),
            );
        }

        // Forward with a decremented hop budget
        if request.ttl > 1 && self.discovery.broadcast_enabled() {
            self.forwarded_discoveries
                .push((request.request_id.clone(), asn, Instant::now()));
            let forwarded = Message::DiscoveryRequest(DiscoveryRequestMessage {
                sender_asn: self.config.local_asn,
                request_id: request.request_id,
                capability: request.capability,
                ttl: request.ttl - 1,
            });
            for peer in self.manager.established_peers() {
                if peer != asn && self.manager.peer_supports(peer, CAP_DISCOVERY_BROADCAST) {
                    self.manager.send_to_peer(peer, forwarded.clone());
                }
            }
        }
    }

    fn on_discovery_response(&mut self, _asn: Asn, response: DiscoveryResponseMessage) {
        if let Some(pending) = self
            .pending_discoveries
            .iter_mut()
            .find(|p| p.request_id == response.request_id)
        {
            let capability = pending.capability.clone();
            for route in &response.routes {
                if route.has_capability(&capability) && !route.is_malformed() {
                    pending.collected.push(NetworkAgentRecord::from_route(route));
                }
            }
            return;
        }
        // Not ours: relay toward whoever we forwarded the request for
        if let Some((_, origin, _)) = self
            .forwarded_discoveries
            .iter()
            .find(|(id, _, _)| *id == response.request_id)
        {
            let origin = *origin;
            self.manager
                .send_to_peer(origin, Message::DiscoveryResponse(response));
        }
    }

    /// Resolve finished or expired broadcast lookups
    fn settle_discoveries(&mut self) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.pending_discoveries.len() {
            let pending = &self.pending_discoveries[index];
            let enough = dedup_records(pending.collected.clone()).len() >= pending.max_results;
            if pending.deadline <= now || enough {
                let mut pending = self.pending_discoveries.remove(index);
                let mut results = rank_candidates(dedup_records(pending.collected));
                results.truncate(pending.max_results);
                if let Some(reply) = pending.reply.take() {
                    let _ = reply.send(results);
                }
            } else {
                index += 1;
            }
        }
        self.forwarded_discoveries
            .retain(|(_, _, seen)| now.duration_since(*seen).as_secs() < FORWARD_MEMORY_SECS);
    }

    // ---- Timers ----

    fn on_sweep(&mut self) {
        for event in self.discovery.sweep() {
            self.publish_discovery(event);
        }
    }

    async fn on_refresh(&mut self) {
        let outcome = self.advertiser.refresh().await;
        for route in &outcome.refreshed {
            self.recompute(&route.agent_id);
        }
        for agent_id in &outcome.removed {
            self.recompute(agent_id);
        }
    }

    fn on_audit(&mut self) {
        let violations = self.rib.validate();
        for violation in &violations {
            error!("RIB audit: {}", violation);
        }
        if !violations.is_empty() {
            warn!(
                "RIB audit found {} violations [{} rejected inserts so far]",
                violations.len(),
                self.rib.rejected_inserts()
            );
        }
    }

    async fn shutdown(&mut self) {
        info!("Stopping agent routing server...");
        self.manager.shutdown().await;
        self.rib.clear();
        self.events.publish(Event::Shutdown);
        // Flush anything still waiting on a broadcast lookup
        for mut pending in self.pending_discoveries.drain(..) {
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(Vec::new());
            }
        }
    }

    // ---- Control surface ----

    async fn on_api_command(&mut self, command: ApiCommand) {
        match command {
            ApiCommand::GetPeers(reply) | ApiCommand::GetSessions(reply) => {
                let mut summaries = self.manager.summaries();
                for summary in &mut summaries {
                    if summary.state == "Established" {
                        summary.routes_received = Some(self.rib.routes_received_from(summary.asn));
                        summary.routes_sent = Some(self.rib.routes_sent_to(summary.asn));
                    }
                }
                let _ = reply.send(summaries);
            }
            ApiCommand::AddPeer { asn, address, reply } => {
                self.manager.add_peer(asn, &address);
                info!("Peer AS{} at {} added", asn, address);
                let _ = reply.send(());
            }
            ApiCommand::RemovePeer { asn, reply } => {
                let known = self.manager.remove_peer(asn).await;
                if known {
                    self.events.publish(Event::PeerRemoved { asn });
                    self.drop_peer_state(asn);
                }
                let _ = reply.send(known);
            }
            ApiCommand::ConnectPeer { asn, reply } => {
                let _ = reply.send(self.manager.dial_peer(asn));
            }
            ApiCommand::SendKeepalive { asn, reply } => {
                let sent = self.manager.send_to_peer(
                    asn,
                    Message::Keepalive(KeepaliveMessage::new(self.config.local_asn)),
                );
                let _ = reply.send(sent);
            }
            ApiCommand::SendNotification { asn, reason, reply } => {
                let sent = self.manager.send_to_peer(
                    asn,
                    Message::Notification(NotificationMessage {
                        sender_asn: self.config.local_asn,
                        reason,
                    }),
                );
                let _ = reply.send(sent);
            }
            ApiCommand::GetRoutes(reply) => {
                let routes = self
                    .rib
                    .list_all_best()
                    .iter()
                    .map(LearnedRoute::from)
                    .collect();
                let _ = reply.send(routes);
            }
            ApiCommand::GetRoutesForPeer { asn, reply } => {
                let routes = self
                    .rib
                    .list_for_peer(asn)
                    .iter()
                    .map(LearnedRoute::from)
                    .collect();
                let _ = reply.send(routes);
            }
            ApiCommand::InjectUpdate { update, reply } => {
                if update.sender_asn == self.config.local_asn {
                    let _ = reply.send(Err("senderASN is the local AS".to_string()));
                } else {
                    let sender = update.sender_asn;
                    self.process_update(sender, update);
                    let _ = reply.send(Ok(()));
                }
            }
            ApiCommand::WithdrawRoutes {
                sender_asn,
                agent_ids,
                reply,
            } => {
                self.process_update(sender_asn, UpdateMessage::withdraw(sender_asn, agent_ids));
                let _ = reply.send(());
            }
            ApiCommand::ValidateRib(reply) => {
                let findings = self
                    .rib
                    .validate()
                    .iter()
                    .map(std::string::ToString::to_string)
                    .collect();
                let _ = reply.send(findings);
            }
            ApiCommand::DiscoverAgents { params, reply } => {
                self.discover_agents(params, reply);
            }
            ApiCommand::AdvertiseAgent {
                registration,
                reply,
            } => {
                let agent_id = registration.agent_id.clone();
                match self.advertiser.register(registration) {
                    Ok(route) => {
                        self.recompute(&agent_id);
                        let _ = reply.send(Ok(LearnedRoute::from(&route)));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err.to_string()));
                    }
                }
            }
            ApiCommand::GetLocalAgents(reply) => {
                let _ = reply.send(self.advertiser.list());
            }
            ApiCommand::UnregisterAgent { agent_id, reply } => {
                let removed = self.advertiser.unregister(&agent_id).is_ok();
                if removed {
                    self.recompute(&agent_id);
                }
                let _ = reply.send(removed);
            }
            ApiCommand::GetPolicies(reply) => {
                let _ = reply.send(self.policy.list());
            }
            ApiCommand::AddPolicy { policy, reply } => {
                let result = self.policy.add_policy(policy).map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            ApiCommand::UpdatePolicy {
                name,
                policy,
                reply,
            } => {
                let result = if self.policy.get(&name).is_none() {
                    Err(format!("No policy named '{}'", name))
                } else if policy.name != name {
                    Err("Policy name does not match the path".to_string())
                } else {
                    self.policy.add_policy(policy).map_err(|e| e.to_string())
                };
                let _ = reply.send(result);
            }
            ApiCommand::RemovePolicy { name, reply } => {
                let _ = reply.send(self.policy.remove_policy(&name).is_ok());
            }
            ApiCommand::TogglePolicy {
                name,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.policy.set_enabled(&name, enabled).is_ok());
            }
            ApiCommand::GetPolicyStats(reply) => {
                let _ = reply.send(self.policy.stats().snapshot());
            }
            ApiCommand::GetPolicyDecisions { limit, reply } => {
                let _ = reply.send(self.policy.stats().recent_decisions(limit));
            }
            ApiCommand::ImportPolicies { bundle, reply } => {
                let result = self
                    .policy
                    .import_bundle(&bundle.to_string())
                    .map_err(|e| e.to_string());
                let _ = reply.send(result);
            }
            ApiCommand::ExportPolicies(reply) => {
                let _ = reply.send(self.policy.export_bundle());
            }
            ApiCommand::TestPolicies { routes, reply } => {
                let results = routes
                    .iter()
                    .map(|route| self.test_policy(route))
                    .collect();
                let _ = reply.send(results);
            }
            ApiCommand::SelectPath { request, reply } => {
                let _ = reply.send(self.select_path(request));
            }
            ApiCommand::ReportCompletion {
                next_hop,
                success,
                elapsed_ms,
                reply,
            } => {
                if let Some(transition) =
                    self.balancer.report_completion(&next_hop, success, elapsed_ms)
                {
                    self.events.publish(Event::PathHealthChanged {
                        next_hop: transition.next_hop,
                        status: transition.status,
                    });
                }
                let _ = reply.send(());
            }
            ApiCommand::GetBalancerHealth(reply) => {
                let _ = reply.send(self.balancer.health_snapshot());
            }
            ApiCommand::GetBalancerDecisions { limit, reply } => {
                let _ = reply.send(self.balancer.recent_decisions(limit));
            }
        }
    }

    fn test_policy(&self, route: &Route) -> PolicyTestResult {
        match self.policy.evaluate_quiet(route) {
            PolicyOutcome::Accept { policy } => PolicyTestResult {
                agent_id: route.agent_id.clone(),
                outcome: "accept".to_string(),
                policy,
                local_pref: route.local_pref,
                med: route.med,
                communities: route.communities.iter().cloned().collect(),
            },
            PolicyOutcome::Reject { policy } => PolicyTestResult {
                agent_id: route.agent_id.clone(),
                outcome: "reject".to_string(),
                policy: Some(policy),
                local_pref: route.local_pref,
                med: route.med,
                communities: route.communities.iter().cloned().collect(),
            },
            PolicyOutcome::Modify { route: modified, policy } => PolicyTestResult {
                agent_id: modified.agent_id.clone(),
                outcome: "modify".to_string(),
                policy: Some(policy),
                local_pref: modified.local_pref,
                med: modified.med,
                communities: modified.communities.iter().cloned().collect(),
            },
        }
    }

    /// Balancer entry: candidates are the import-filtered alternatives
    /// (plus any local agent), best-first so pool truncation keeps the
    /// preferred paths
    fn select_path(
        &mut self,
        request: crate::api::SelectRequest,
    ) -> Result<Option<crate::balancer::BalancerDecision>, String> {
        let mut candidates: Vec<Route> = self
            .rib
            .alternatives_for(&request.agent_id)
            .into_iter()
            .filter_map(|(_, route)| self.policy.apply_import(&route))
            .collect();
        if let Some(local) = self.advertiser.route_for_agent(&request.agent_id) {
            candidates.push(local);
        }
        if candidates.is_empty() {
            return Err(format!("No routes for agent '{}'", request.agent_id));
        }
        candidates.sort_by(|a, b| decision::compare(b, a));

        let mut strategy_override: Option<Strategy> = match &request.strategy {
            Some(name) => Some(name.parse()?),
            None => None,
        };
        // Consult the deciding policy for balancer hints
        if let Some(best) = candidates.first() {
            let deciding = match self.policy.evaluate_quiet(best) {
                PolicyOutcome::Accept { policy } => policy,
                PolicyOutcome::Modify { policy, .. } => Some(policy),
                PolicyOutcome::Reject { .. } => None,
            };
            if let Some(policy) = deciding.and_then(|name| self.policy.get(&name)) {
                if let Some(max) = policy.action.max_alternatives {
                    candidates.truncate(max.max(1));
                }
                if strategy_override.is_none() {
                    if let Some(hint) = &policy.action.load_balance {
                        strategy_override = hint.method.parse().ok();
                    }
                }
                if let Some(avoid) = &policy.action.avoid_asn {
                    candidates.sort_by_key(|route| {
                        route.as_path.iter().any(|asn| avoid.contains(asn))
                    });
                }
                if let Some(prefer) = &policy.action.prefer_asn {
                    candidates.sort_by_key(|route| {
                        !route.as_path.iter().any(|asn| prefer.contains(asn))
                    });
                }
            }
        }

        Ok(self.balancer.select(
            &request.agent_id,
            candidates,
            &request.required_capabilities,
            strategy_override,
            request.weights.as_deref(),
        ))
    }

    fn discover_agents(
        &mut self,
        params: crate::api::DiscoverParams,
        reply: tokio::sync::oneshot::Sender<Vec<NetworkAgentRecord>>,
    ) {
        let cached = self.discovery.find_by_capability(
            &params.capability,
            params.health_filter,
            params.max_results,
        );
        let broadcast_peers: Vec<Asn> = self
            .manager
            .established_peers()
            .into_iter()
            .filter(|peer| self.manager.peer_supports(*peer, CAP_DISCOVERY_BROADCAST))
            .collect();
        if cached.len() >= params.max_results
            || !self.discovery.broadcast_enabled()
            || broadcast_peers.is_empty()
        {
            let _ = reply.send(cached);
            return;
        }

        self.request_counter += 1;
        let request_id = format!(
            "{}-{}-{}",
            self.config.local_asn,
            Utc::now().timestamp_millis(),
            self.request_counter
        );
        let request = Message::DiscoveryRequest(DiscoveryRequestMessage {
            sender_asn: self.config.local_asn,
            request_id: request_id.clone(),
            capability: params.capability.clone(),
            ttl: self.discovery.broadcast_ttl(),
        });
        for peer in broadcast_peers {
            self.manager.send_to_peer(peer, request.clone());
        }
        let timeout = params.timeout.unwrap_or(self.discovery.broadcast_timeout());
        self.pending_discoveries.push(PendingDiscovery {
            request_id,
            capability: params.capability,
            max_results: params.max_results,
            deadline: Instant::now() + Duration::from_secs(timeout),
            collected: cached,
            reply: Some(reply),
        });
    }
}

/// Keep the best-ranked record per agent id
fn dedup_records(records: Vec<NetworkAgentRecord>) -> Vec<NetworkAgentRecord> {
    let mut seen: HashSet<AgentId> = HashSet::new();
    rank_candidates(records)
        .into_iter()
        .filter(|record| seen.insert(record.agent_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BalancerConfig, DiscoveryConfig, ReflectorConfig};
    use crate::rib::HealthStatus;
    use tokio::sync::mpsc;

    fn test_config() -> ServerConfig {
        ServerConfig {
            local_asn: 65000,
            router_id: "as65000".to_string(),
            listen_address: [127, 0, 0, 1].into(),
            listen_port: 0,
            api_port: 0,
            local_url: "http://127.0.0.1:4210".to_string(),
            hold_time: 90,
            keepalive_interval: 30,
            connect_retry_time: 30,
            default_local_pref: 100,
            refresh_interval: 300,
            policy_path: None,
            policy_history: 1000,
            peers: Vec::new(),
            agents: Vec::new(),
            discovery: DiscoveryConfig {
                sweep_interval: 30,
                stale_after: 300,
                health_threshold: HealthStatus::Unhealthy,
                capability_filters: Vec::new(),
                broadcast: true,
                broadcast_ttl: 5,
                broadcast_timeout: 5,
            },
            balancer: BalancerConfig {
                max_paths: 4,
                strategy: "round-robin".to_string(),
            },
            reflector: ReflectorConfig {
                enabled: false,
                cluster_id: "rr-as65000".to_string(),
                policy_path: None,
            },
        }
    }

    async fn handler() -> Handler {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (_tx, api_rx) = mpsc::unbounded_channel();
        Handler::new(Arc::new(test_config()), listener, api_rx).unwrap()
    }

    fn route(agent_id: &str, path: Vec<Asn>, local_pref: u32) -> Route {
        let mut route = Route::new(
            agent_id,
            vec!["coding".to_string()],
            &format!("http://as{}:4111", path.first().copied().unwrap_or(0)),
        );
        route.as_path = path;
        route.local_pref = local_pref;
        route
    }

    fn advertise(asn: Asn, routes: Vec<Route>) -> UpdateMessage {
        UpdateMessage::advertise(asn, routes)
    }

    #[tokio::test]
    async fn test_best_path_by_local_pref() {
        let mut handler = handler().await;
        handler.process_update(65001, advertise(65001, vec![route("coder", vec![65001], 100)]));
        handler.process_update(
            65002,
            advertise(65002, vec![route("coder", vec![65002, 65003], 200)]),
        );

        let best = handler.rib.lookup_best("coder").unwrap();
        assert_eq!(best.local_pref, 200);
        assert_eq!(best.as_path, vec![65002, 65003]);
    }

    #[tokio::test]
    async fn test_withdraw_falls_back_then_empties() {
        let mut handler = handler().await;
        handler.process_update(65001, advertise(65001, vec![route("coder", vec![65001], 100)]));
        handler.process_update(
            65002,
            advertise(65002, vec![route("coder", vec![65002], 200)]),
        );
        assert_eq!(handler.rib.lookup_best("coder").unwrap().local_pref, 200);

        handler.process_update(65002, UpdateMessage::withdraw(65002, vec!["coder".to_string()]));
        assert!(handler.rib.alternatives_for("coder").len() == 1);
        assert_eq!(handler.rib.lookup_best("coder").unwrap().local_pref, 100);

        handler.process_update(65001, UpdateMessage::withdraw(65001, vec!["coder".to_string()]));
        assert!(handler.rib.lookup_best("coder").is_none());
        assert!(handler.rib.alternatives_for("coder").is_empty());
    }

    #[tokio::test]
    async fn test_peer_loss_reconverges() {
        let mut handler = handler().await;
        handler.process_update(
            65001,
            advertise(
                65001,
                vec![
                    route("coder", vec![65001], 200),
                    route("tester", vec![65001], 100),
                ],
            ),
        );
        handler.process_update(65002, advertise(65002, vec![route("coder", vec![65002], 100)]));

        handler.drop_peer_state(65001);
        // coder falls back to the remaining peer, tester disappears
        assert_eq!(handler.rib.lookup_best("coder").unwrap().as_path, vec![65002]);
        assert!(handler.rib.lookup_best("tester").is_none());
        assert!(handler.rib.routes_from_peer(65001).is_empty());
        assert!(handler.discovery.agents_for_asn(65001).is_empty());
    }

    #[tokio::test]
    async fn test_ingress_prepend_and_loop_drop() {
        let mut handler = handler().await;
        // Sender not yet on the path: it gets prepended
        handler.process_update(65001, advertise(65001, vec![route("coder", vec![65009], 100)]));
        assert_eq!(
            handler.rib.lookup_best("coder").unwrap().as_path,
            vec![65001, 65009]
        );
        // A looped path never reaches the RIB
        handler.process_update(
            65002,
            advertise(65002, vec![route("looper", vec![65002, 65003, 65002], 100)]),
        );
        assert!(handler.rib.lookup_best("looper").is_none());
        assert_eq!(handler.rib.rejected_inserts(), 1);
    }

    #[tokio::test]
    async fn test_malformed_routes_do_not_poison() {
        let mut handler = handler().await;
        let mut missing_caps = route("coder", vec![65001], 100);
        missing_caps.capabilities.clear();
        let mut unnamed = route("", vec![65001], 100);
        unnamed.agent_id = String::new();
        handler.process_update(65001, advertise(65001, vec![missing_caps, unnamed]));
        assert_eq!(handler.rib.best_count(), 0);
    }

    #[tokio::test]
    async fn test_modify_policy_applies_to_loc_rib() {
        let mut handler = handler().await;
        let bundle = r#"[{
            "name": "quarantine",
            "priority": 50,
            "match": {"healthStatus": "degraded"},
            "action": {
                "action": "modify",
                "setLocalPref": 25,
                "addCommunities": ["quarantine:degraded"]
            }
        }]"#;
        handler.policy.import_bundle(bundle).unwrap();

        let mut degraded = route("coder", vec![65001], 100);
        degraded.communities.add("health:degraded");
        handler.process_update(65001, advertise(65001, vec![degraded]));

        let best = handler.rib.lookup_best("coder").unwrap();
        assert_eq!(best.local_pref, 25);
        assert!(best.communities.contains("quarantine:degraded"));
        // Adj-RIB-In keeps the route exactly as received
        let (_, stored) = handler.rib.alternatives_for("coder").pop().unwrap();
        assert_eq!(stored.local_pref, 100);
    }

    #[tokio::test]
    async fn test_reject_policy_blocks_install() {
        let mut handler = handler().await;
        let bundle = r#"[{
            "name": "no-weather",
            "priority": 50,
            "match": {"capabilitiesAny": ["weather"]},
            "action": {"action": "reject"}
        }]"#;
        handler.policy.import_bundle(bundle).unwrap();

        let mut forecaster = route("forecaster", vec![65001], 100);
        forecaster.capabilities = vec!["weather".to_string()];
        handler.process_update(65001, advertise(65001, vec![forecaster]));

        // Pre-policy table has it; the installed view does not
        assert_eq!(handler.rib.alternatives_for("forecaster").len(), 1);
        assert!(handler.rib.lookup_best("forecaster").is_none());
    }

    #[tokio::test]
    async fn test_local_agent_installs_and_withdraws() {
        let mut handler = handler().await;
        let registration = crate::advertise::AgentRegistration {
            agent_id: "local-coder".to_string(),
            capabilities: vec!["coding".to_string()],
            version: None,
            description: None,
            metadata: None,
            health_status: Some(HealthStatus::Healthy),
            local_pref: None,
        };
        handler.advertiser.register(registration).unwrap();
        handler.recompute("local-coder");

        let best = handler.rib.lookup_best("local-coder").unwrap();
        assert_eq!(best.as_path, vec![65000]);
        assert_eq!(best.next_hop, "http://127.0.0.1:4210");

        handler.advertiser.unregister("local-coder").unwrap();
        handler.recompute("local-coder");
        assert!(handler.rib.lookup_best("local-coder").is_none());
    }

    #[tokio::test]
    async fn test_discovery_sees_learned_routes() {
        let mut handler = handler().await;
        handler.process_update(65001, advertise(65001, vec![route("coder", vec![65001], 100)]));
        let record = handler.discovery.get("coder").unwrap();
        assert_eq!(record.source_asn, 65001);
        assert_eq!(
            handler
                .discovery
                .find_by_capability("coding", None, 10)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_select_path_unknown_agent_is_an_error() {
        let mut handler = handler().await;
        let request = crate::api::SelectRequest {
            agent_id: "ghost".to_string(),
            required_capabilities: Vec::new(),
            strategy: None,
            weights: None,
        };
        assert!(handler.select_path(request).is_err());
    }

    #[tokio::test]
    async fn test_select_path_round_robins_alternatives() {
        let mut handler = handler().await;
        handler.process_update(65001, advertise(65001, vec![route("coder", vec![65001], 100)]));
        handler.process_update(65002, advertise(65002, vec![route("coder", vec![65002], 100)]));

        let request = || crate::api::SelectRequest {
            agent_id: "coder".to_string(),
            required_capabilities: vec!["coding".to_string()],
            strategy: Some("round-robin".to_string()),
            weights: None,
        };
        let first = handler.select_path(request()).unwrap().unwrap();
        let second = handler.select_path(request()).unwrap().unwrap();
        assert_ne!(first.next_hop, second.next_hop);
    }

    // A peer already on the path never appears in that peer's egress table
    #[tokio::test]
    async fn test_export_loop_prevention() {
        let mut handler = handler().await;
        handler.process_update(
            65001,
            advertise(65001, vec![route("coder", vec![65001, 65002], 100)]),
        );
        let best = handler.rib.lookup_best("coder").unwrap();

        assert!(handler.export_one(&best, 65002).is_none());
        assert!(handler.rib.lookup_for_peer(65002, "coder").is_none());

        let exported = handler.export_one(&best, 65003).unwrap();
        // Egress prepends the local AS
        assert_eq!(exported.as_path, vec![65000, 65001, 65002]);
        assert!(handler.rib.lookup_for_peer(65003, "coder").is_some());
    }

    // For any interleaving of advertise/withdraw, the installed tables
    // never hold a looped or over-long path
    #[tokio::test]
    async fn test_tables_stay_valid_under_churn() {
        let mut handler = handler().await;
        for round in 0u32..20 {
            let peer = 65001 + (round % 3);
            let agent = format!("agent-{}", round % 5);
            if round % 4 == 3 {
                handler.process_update(peer, UpdateMessage::withdraw(peer, vec![agent]));
            } else {
                let path: Vec<Asn> = (0..(round % 12)).map(|i| 64000 + i).collect();
                handler.process_update(peer, advertise(peer, vec![route(&agent, path, 100)]));
            }
            for violation in handler.rib.validate() {
                assert!(
                    violation.detail.contains("stale"),
                    "Invariant violated: {}",
                    violation
                );
            }
        }
    }
}
