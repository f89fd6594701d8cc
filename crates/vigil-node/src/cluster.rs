//! In-process consensus cluster driver.
//!
//! Hosts the `n` PBFT node state machines, signs every outbound message
//! with the owning node's key, verifies every inbound signature against
//! the certificate directory before the machine sees it (failures feed
//! suspicion), and routes broadcasts to completion.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use vigil_consensus::{
    ClusterConfig, ConsensusEffect, NodeEvent, NodeState, PbftMessage,
};
use vigil_crypto::{CertificateDirectory, KeyHandle, KmsProvider};
use vigil_types::{AgentId, NodeId, Proposal, Timestamp};

/// Delivery bound per drive call; a healthy cluster converges far below
/// this.
const MAX_DELIVERIES: usize = 10_000;

struct ClusterMember {
    node: Option<NodeState>,
    key: KeyHandle,
}

/// The consensus cluster and its message plumbing.
pub struct ConsensusCluster {
    members: Vec<(NodeId, ClusterMember)>,
    kms: Arc<Mutex<dyn KmsProvider>>,
    certificates: Arc<Mutex<CertificateDirectory>>,
    /// Effects accumulated since the last drain.
    effects: Vec<(NodeId, ConsensusEffect)>,
}

impl ConsensusCluster {
    /// Bootstraps `n` nodes, issuing a certificate per node identity.
    pub fn bootstrap(
        config: ClusterConfig,
        kms: Arc<Mutex<dyn KmsProvider>>,
        certificates: Arc<Mutex<CertificateDirectory>>,
        cert_lifetime_ms: u64,
        now: Timestamp,
    ) -> Self {
        let mut members = Vec::new();
        for node_id in config.nodes().to_vec() {
            let (key, public) = kms.lock().expect("kms lock").generate_keypair();
            certificates.lock().expect("certificate lock").issue(
                AgentId::from(node_id.as_str()),
                &public,
                cert_lifetime_ms,
                now,
            );
            members.push((
                node_id.clone(),
                ClusterMember {
                    node: Some(NodeState::new(node_id, config.clone())),
                    key,
                },
            ));
        }
        Self {
            members,
            kms,
            certificates,
            effects: Vec::new(),
        }
    }

    /// The node this process fronts (the first member).
    pub fn local_node(&self) -> &NodeId {
        &self.members[0].0
    }

    /// Read access to one node's state, for diagnostics.
    pub fn state_of(&self, node_id: &NodeId) -> Option<&NodeState> {
        self.members
            .iter()
            .find(|(id, _)| id == node_id)
            .and_then(|(_, member)| member.node.as_ref())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Submits a proposal at the current primary and drives the exchange
    /// to quiescence.
    pub fn propose(&mut self, proposal: Proposal, now: Timestamp) {
        let primary = {
            let (_, member) = &self.members[0];
            member
                .node
                .as_ref()
                .expect("node present")
                .config()
                .primary_for(self.view_of_local())
                .clone()
        };
        let outbound = self.apply_at(&primary, NodeEvent::Propose { proposal, now });
        self.route(outbound, now);
    }

    /// Advances every node's deadline clock, then routes whatever that
    /// produced (view-change traffic after timeouts).
    pub fn tick(&mut self, now: Timestamp) {
        let mut queue = VecDeque::new();
        let ids = self.node_ids();
        for node_id in ids {
            let outbound = self.apply_at(&node_id, NodeEvent::Tick { now });
            queue.extend(outbound.into_iter().map(|message| (node_id.clone(), message)));
        }
        self.route_queue(queue, now);
    }

    /// Effects produced since the last call, local node first.
    pub fn drain_effects(&mut self) -> Vec<(NodeId, ConsensusEffect)> {
        std::mem::take(&mut self.effects)
    }

    fn view_of_local(&self) -> vigil_types::ViewNumber {
        self.members[0]
            .1
            .node
            .as_ref()
            .expect("node present")
            .view()
    }

    /// Applies an event at one node, signing its outbound messages.
    fn apply_at(&mut self, node_id: &NodeId, event: NodeEvent) -> Vec<PbftMessage> {
        let Some(index) = self.members.iter().position(|(id, _)| id == node_id) else {
            return Vec::new();
        };
        let state = self.members[index].1.node.take().expect("node present");
        let key = self.members[index].1.key.clone();
        let (state, output) = state.handle(event);
        self.members[index].1.node = Some(state);
        let mut signed = Vec::with_capacity(output.messages.len());
        for mut message in output.messages {
            match self
                .kms
                .lock()
                .expect("kms lock")
                .sign(&key, &message.signing_bytes())
            {
                Ok(signature) => {
                    message.signature = signature;
                    signed.push(message);
                }
                Err(e) => {
                    tracing::error!(node = %node_id, error = %e, "failed to sign consensus message");
                }
            }
        }
        for effect in output.effects {
            self.effects.push((node_id.clone(), effect));
        }
        signed
    }

    fn route(&mut self, messages: Vec<PbftMessage>, now: Timestamp) {
        let sender_tagged: VecDeque<(NodeId, PbftMessage)> = messages
            .into_iter()
            .map(|message| (message.sender.clone(), message))
            .collect();
        self.route_queue(sender_tagged, now);
    }

    /// Delivers each broadcast to every other node, verifying signatures
    /// at the receive boundary; rejected signatures feed suspicion.
    fn route_queue(&mut self, mut queue: VecDeque<(NodeId, PbftMessage)>, now: Timestamp) {
        let mut deliveries = 0;
        while let Some((sender, message)) = queue.pop_front() {
            deliveries += 1;
            if deliveries > MAX_DELIVERIES {
                tracing::error!("consensus routing exceeded its delivery budget");
                return;
            }
            for node_id in self.node_ids() {
                if node_id == sender {
                    continue;
                }
                let verified = self
                    .certificates
                    .lock()
                    .expect("certificate lock")
                    .verify(
                        &AgentId::from(sender.as_str()),
                        &message.signing_bytes(),
                        &message.signature,
                        now,
                    )
                    .is_ok();

                let event = if verified {
                    NodeEvent::Message {
                        message: message.clone(),
                        now,
                    }
                } else {
                    tracing::warn!(
                        node = %node_id,
                        peer = %sender,
                        "consensus message failed signature verification"
                    );
                    NodeEvent::InvalidSignature {
                        peer: sender.clone(),
                        now,
                    }
                };
                let produced = self.apply_at(&node_id, event);
                queue.extend(
                    produced
                        .into_iter()
                        .map(|message| (message.sender.clone(), message)),
                );
            }
        }
    }
}
