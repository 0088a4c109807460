//! Tiered approval workflow
//!
//! A decision starts `pending`. Votes, manual resolution, and the timeout
//! sweep move it to `approved`, `rejected` or `escalated`; an escalated
//! decision waits for a human (or its escalation deadline). Every mutation
//! runs under the decision's owned lock and re-reads the record once the
//! lock is held.

use super::repository::DecisionRepository;
use super::types::{
    Decision, DecisionStatus, Escalation, EscalationStatus, EscalationTimeoutPolicy, Tier, Vote,
    Voter,
};
use crate::bus::MessageBus;
use crate::config::DecisionSettings;
use crate::keys::Channel;
use crate::lock::{decision_lock_key, LockManager, LockToken};
use crate::message::{AgentMessage, MessageKind, Priority};
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};
use crate::{MeshError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const COORDINATOR: &str = "coordinator";

/// Counts from one timeout sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Minor decisions approved on timeout
    pub auto_approved: usize,
    /// Major/critical decisions escalated on timeout
    pub escalated: usize,
    /// Escalations that passed their deadline unanswered
    pub escalations_timed_out: usize,
    /// Decisions settled by the escalation timeout policy
    pub resolved_by_policy: usize,
    /// Items skipped because another process held the lock
    pub skipped_locked: usize,
    /// Items that failed and will be retried next sweep
    pub failures: usize,
}

fn delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

pub struct DecisionCoordinator {
    repo: Arc<dyn DecisionRepository>,
    bus: MessageBus,
    locks: LockManager,
    settings: DecisionSettings,
    lock_retry: RetryConfig,
}

impl DecisionCoordinator {
    pub fn new(
        repo: Arc<dyn DecisionRepository>,
        bus: MessageBus,
        locks: LockManager,
        settings: DecisionSettings,
    ) -> Self {
        Self {
            repo,
            bus,
            locks,
            settings,
            lock_retry: RetryConfig::quick(),
        }
    }

    /// Backoff used while waiting for a contended decision lock
    pub fn with_lock_retry(mut self, retry: RetryConfig) -> Self {
        self.lock_retry = retry;
        self
    }

    pub fn settings(&self) -> &DecisionSettings {
        &self.settings
    }

    async fn lock(&self, id: &str) -> Result<LockToken> {
        let key = decision_lock_key(id);
        let key = &key;
        with_retry(&self.lock_retry, "decision_lock", || async move {
            self.locks
                .acquire_owned(key, self.settings.lock_ttl)
                .await?
                .ok_or_else(|| MeshError::DecisionBusy(id.to_string()))
        })
        .await
    }

    async fn unlock(&self, token: &LockToken) {
        if let Err(e) = self.locks.release_owned(token).await {
            tracing::warn!(key = %token.key(), error = %e, "Failed to release decision lock");
        }
    }

    async fn require(&self, id: &str) -> Result<Decision> {
        self.repo
            .get_decision(id)
            .await?
            .ok_or_else(|| MeshError::DecisionNotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<Decision> {
        self.require(id).await
    }

    pub async fn list(&self, status: Option<DecisionStatus>) -> Result<Vec<Decision>> {
        self.repo.list_decisions(status).await
    }

    pub async fn escalations(&self, status: Option<EscalationStatus>) -> Result<Vec<Escalation>> {
        self.repo.list_escalations(status).await
    }

    pub async fn get_escalation(&self, id: &str) -> Result<Escalation> {
        self.repo
            .get_escalation(id)
            .await?
            .ok_or_else(|| MeshError::EscalationNotFound(id.to_string()))
    }

    /// Record a new pending decision and tell the voters
    pub async fn propose(
        &self,
        title: &str,
        description: &str,
        proposer: &str,
        tier: Tier,
    ) -> Result<Decision> {
        let decision = Decision::new(title, description, proposer, tier, Utc::now());
        self.repo.insert_decision(&decision).await?;
        tracing::info!(decision_id = %decision.id, tier = %tier, proposer, "Decision proposed");

        let message = AgentMessage::new(
            MessageKind::DecisionProposed,
            proposer,
            Channel::CLevel.to_string(),
            serde_json::json!({
                "decisionId": decision.id,
                "title": decision.title,
                "tier": tier,
            }),
        )
        .requiring_response();
        self.notify(&Channel::CLevel, &message).await;
        Ok(decision)
    }

    /// Record one voter's vote
    ///
    /// A veto clears both votes and starts a new round; reaching
    /// `max_veto_rounds` escalates instead.
    pub async fn vote(&self, id: &str, voter: Voter, vote: Vote) -> Result<Decision> {
        let token = self.lock(id).await?;
        let result = self.vote_locked(id, voter, vote).await;
        self.unlock(&token).await;
        result
    }

    async fn vote_locked(&self, id: &str, voter: Voter, vote: Vote) -> Result<Decision> {
        let mut decision = self.require(id).await?;
        if decision.status != DecisionStatus::Pending {
            return Err(MeshError::invalid_transition(
                id,
                format!("cannot vote on a {} decision", decision.status),
            ));
        }
        if voter == Voter::Ceo && vote == Vote::Veto {
            return Err(MeshError::invalid_transition(id, "only the dao can veto"));
        }
        if decision.vote_of(voter).is_some() {
            return Err(MeshError::AlreadyVoted {
                id: id.to_string(),
                voter: voter.to_string(),
            });
        }

        let now = Utc::now();
        decision.set_vote(voter, Some(vote));
        decision.updated_at = now;
        tracing::info!(decision_id = id, voter = %voter, vote = vote.as_str(), "Vote recorded");

        match vote {
            Vote::Veto => {
                decision.veto_round += 1;
                decision.ceo_vote = None;
                decision.dao_vote = None;
                if decision.veto_round >= self.settings.max_veto_rounds {
                    tracing::warn!(decision_id = id, rounds = decision.veto_round, "Veto limit reached, escalating");
                    let reason = format!("Vetoed {} times", decision.veto_round);
                    let (decision, _) = self.escalate(decision, &reason, now).await?;
                    return Ok(decision);
                }
                self.repo.update_decision(&decision).await?;
                let message = AgentMessage::new(
                    MessageKind::DecisionVetoed,
                    voter.to_string(),
                    decision.proposer.clone(),
                    serde_json::json!({
                        "decisionId": decision.id,
                        "vetoRound": decision.veto_round,
                        "maxVetoRounds": self.settings.max_veto_rounds,
                    }),
                )
                .requiring_response();
                self.notify(&Channel::agent(&decision.proposer), &message).await;
            }
            Vote::Approve => {
                if decision.is_approved_by_votes() {
                    decision.resolve(DecisionStatus::Approved, "vote", now);
                    self.repo.update_decision(&decision).await?;
                    self.resolved(&decision).await;
                } else {
                    self.repo.update_decision(&decision).await?;
                }
            }
        }
        Ok(decision)
    }

    /// Replace the description of a pending decision after a veto
    pub async fn revise(&self, id: &str, description: &str) -> Result<Decision> {
        let token = self.lock(id).await?;
        let result = self.revise_locked(id, description).await;
        self.unlock(&token).await;
        result
    }

    async fn revise_locked(&self, id: &str, description: &str) -> Result<Decision> {
        let mut decision = self.require(id).await?;
        if decision.status != DecisionStatus::Pending {
            return Err(MeshError::invalid_transition(
                id,
                format!("cannot revise a {} decision", decision.status),
            ));
        }
        decision.description = description.to_string();
        decision.updated_at = Utc::now();
        self.repo.update_decision(&decision).await?;

        let message = AgentMessage::new(
            MessageKind::DecisionRevised,
            decision.proposer.clone(),
            Channel::CLevel.to_string(),
            serde_json::json!({
                "decisionId": decision.id,
                "vetoRound": decision.veto_round,
            }),
        )
        .requiring_response();
        self.notify(&Channel::CLevel, &message).await;
        Ok(decision)
    }

    /// Approve a pending or escalated decision by hand
    pub async fn approve(&self, id: &str, by: &str, note: Option<String>) -> Result<Decision> {
        self.decide(id, true, by, note).await
    }

    /// Reject a pending or escalated decision by hand
    pub async fn reject(&self, id: &str, by: &str, note: Option<String>) -> Result<Decision> {
        self.decide(id, false, by, note).await
    }

    async fn decide(&self, id: &str, approved: bool, by: &str, note: Option<String>) -> Result<Decision> {
        let token = self.lock(id).await?;
        let result = self.decide_locked(id, approved, by, note).await;
        self.unlock(&token).await;
        result
    }

    async fn decide_locked(
        &self,
        id: &str,
        approved: bool,
        by: &str,
        note: Option<String>,
    ) -> Result<Decision> {
        let mut decision = self.require(id).await?;
        if decision.status.is_terminal() {
            return Err(MeshError::invalid_transition(
                id,
                format!("decision is already {}", decision.status),
            ));
        }

        let now = Utc::now();
        let verdict = if approved { "approved" } else { "rejected" };
        let response = note.unwrap_or_else(|| verdict.to_string());
        let mut answered = Vec::new();
        for mut escalation in self.repo.escalations_for(id).await? {
            if escalation.status == EscalationStatus::Pending {
                escalation.status = EscalationStatus::Responded;
                escalation.response = Some(response.clone());
                escalation.responder = Some(by.to_string());
                escalation.responded_at = Some(now);
                answered.push(escalation);
            }
        }

        let status = if approved {
            DecisionStatus::Approved
        } else {
            DecisionStatus::Rejected
        };
        decision.human_decision = Some(response);
        decision.resolve(status, format!("human:{}", by), now);
        self.repo.settle(&decision, &answered).await?;
        for _ in &answered {
            metrics::record_escalation("responded");
        }
        self.resolved(&decision).await;
        Ok(decision)
    }

    /// Answer a pending escalation, settling its decision
    pub async fn respond_to_escalation(
        &self,
        escalation_id: &str,
        approved: bool,
        response: &str,
        responder: &str,
    ) -> Result<(Escalation, Decision)> {
        let escalation = self.get_escalation(escalation_id).await?;
        let token = self.lock(&escalation.decision_id).await?;
        let result = self
            .respond_locked(escalation_id, approved, response, responder)
            .await;
        self.unlock(&token).await;
        result
    }

    async fn respond_locked(
        &self,
        escalation_id: &str,
        approved: bool,
        response: &str,
        responder: &str,
    ) -> Result<(Escalation, Decision)> {
        let mut escalation = self.get_escalation(escalation_id).await?;
        if escalation.status != EscalationStatus::Pending {
            return Err(MeshError::invalid_transition(
                escalation_id,
                format!("escalation is already {}", escalation.status),
            ));
        }
        let mut decision = self.require(&escalation.decision_id).await?;
        if decision.status.is_terminal() {
            return Err(MeshError::invalid_transition(
                &decision.id,
                format!("decision is already {}", decision.status),
            ));
        }

        let now = Utc::now();
        decision.human_decision = Some(response.to_string());
        let status = if approved {
            DecisionStatus::Approved
        } else {
            DecisionStatus::Rejected
        };
        decision.resolve(status, format!("human:{}", responder), now);

        escalation.status = EscalationStatus::Responded;
        escalation.response = Some(response.to_string());
        escalation.responder = Some(responder.to_string());
        escalation.responded_at = Some(now);
        self.repo
            .settle(&decision, std::slice::from_ref(&escalation))
            .await?;
        metrics::record_escalation("responded");
        tracing::info!(escalation_id, decision_id = %decision.id, responder, approved, "Escalation answered");

        let message = AgentMessage::new(
            MessageKind::EscalationResolved,
            responder,
            decision.proposer.clone(),
            serde_json::json!({
                "escalationId": escalation.id,
                "decisionId": decision.id,
                "approved": approved,
            }),
        );
        for channel in self.escalation_channels() {
            self.notify(&channel, &message).await;
        }
        self.resolved(&decision).await;
        Ok((escalation, decision))
    }

    /// Apply tier timeouts and escalation deadlines as of `now`
    ///
    /// Fails only when the pending records cannot be listed; a failing
    /// item is counted and picked up again by the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for decision in self.repo.list_decisions(Some(DecisionStatus::Pending)).await? {
            let deadline = decision.created_at + delta(self.settings.timeout_for(decision.tier));
            if now < deadline {
                continue;
            }
            match self.try_lock(&decision.id).await {
                Ok(Some(token)) => {
                    let result = self.expire_decision_locked(&decision.id, now).await;
                    self.unlock(&token).await;
                    match result {
                        Ok(Some(DecisionStatus::Approved)) => report.auto_approved += 1,
                        Ok(Some(DecisionStatus::Escalated)) => report.escalated += 1,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(decision_id = %decision.id, error = %e, "Decision timeout failed");
                            report.failures += 1;
                        }
                    }
                }
                Ok(None) => report.skipped_locked += 1,
                Err(e) => {
                    tracing::warn!(decision_id = %decision.id, error = %e, "Decision lock failed");
                    report.failures += 1;
                }
            }
        }

        for escalation in self.repo.list_escalations(Some(EscalationStatus::Pending)).await? {
            if now < escalation.deadline {
                continue;
            }
            match self.try_lock(&escalation.decision_id).await {
                Ok(Some(token)) => {
                    let result = self.expire_escalation_locked(&escalation.id, now).await;
                    self.unlock(&token).await;
                    match result {
                        Ok(Some(settled)) => {
                            report.escalations_timed_out += 1;
                            if settled {
                                report.resolved_by_policy += 1;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(escalation_id = %escalation.id, error = %e, "Escalation timeout failed");
                            report.failures += 1;
                        }
                    }
                }
                Ok(None) => report.skipped_locked += 1,
                Err(e) => {
                    tracing::warn!(escalation_id = %escalation.id, error = %e, "Decision lock failed");
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }

    async fn try_lock(&self, id: &str) -> Result<Option<LockToken>> {
        self.locks
            .acquire_owned(&decision_lock_key(id), self.settings.lock_ttl)
            .await
    }

    /// New status if the decision was still pending
    async fn expire_decision_locked(&self, id: &str, now: DateTime<Utc>) -> Result<Option<DecisionStatus>> {
        let mut decision = self.require(id).await?;
        if decision.status != DecisionStatus::Pending {
            return Ok(None);
        }
        match decision.tier {
            Tier::Minor => {
                decision.resolve(DecisionStatus::Approved, "timeout", now);
                self.repo.update_decision(&decision).await?;
                tracing::info!(decision_id = id, "Minor decision approved on timeout");
                self.resolved(&decision).await;
            }
            Tier::Major | Tier::Critical => {
                let reason = format!("No resolution within the {} timeout", decision.tier);
                self.escalate(decision, &reason, now).await?;
            }
        }
        Ok(Some(self.require(id).await?.status))
    }

    /// `Some(settled)` if the escalation was still pending; `settled` tells
    /// whether the policy resolved its decision
    async fn expire_escalation_locked(&self, escalation_id: &str, now: DateTime<Utc>) -> Result<Option<bool>> {
        let mut escalation = self.get_escalation(escalation_id).await?;
        if escalation.status != EscalationStatus::Pending {
            return Ok(None);
        }
        escalation.status = EscalationStatus::Timeout;

        let mut decision = self.require(&escalation.decision_id).await?;
        let status = if decision.status.is_terminal() {
            None
        } else {
            match self.settings.escalation_timeout_policy {
                EscalationTimeoutPolicy::Reject => Some(DecisionStatus::Rejected),
                EscalationTimeoutPolicy::Approve => Some(DecisionStatus::Approved),
                EscalationTimeoutPolicy::Hold => None,
            }
        };

        let Some(status) = status else {
            self.repo.update_escalation(&escalation).await?;
            metrics::record_escalation("timeout");
            tracing::warn!(escalation_id, decision_id = %decision.id, "Escalation timed out unanswered");
            if !decision.status.is_terminal() {
                tracing::info!(decision_id = %decision.id, "Holding escalated decision for a human");
            }
            return Ok(Some(false));
        };

        // Escalation stays pending until its decision is settled with it
        decision.resolve(status, "escalation-timeout", now);
        self.repo
            .settle(&decision, std::slice::from_ref(&escalation))
            .await?;
        metrics::record_escalation("timeout");
        tracing::warn!(escalation_id, decision_id = %decision.id, status = %status, "Escalation timed out unanswered");
        self.resolved(&decision).await;
        Ok(Some(true))
    }

    fn escalation_channels(&self) -> Vec<Channel> {
        self.settings
            .escalation_channels
            .iter()
            .filter_map(|name| match name.parse::<Channel>() {
                Ok(channel) => Some(channel),
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Skipping invalid escalation channel");
                    None
                }
            })
            .collect()
    }

    /// Move a pending decision to escalated and open its escalation
    async fn escalate(
        &self,
        mut decision: Decision,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Decision, Escalation)> {
        let channels = self.escalation_channels();
        decision.status = DecisionStatus::Escalated;
        decision.updated_at = now;
        let escalation = Escalation::new(
            &decision.id,
            reason,
            channels.iter().map(Channel::pubsub).collect(),
            now,
            now + delta(self.settings.escalation_timeout),
        );
        self.repo.escalate(&decision, &escalation).await?;
        metrics::record_escalation("created");
        tracing::warn!(decision_id = %decision.id, escalation_id = %escalation.id, reason, "Decision escalated");

        let priority = match decision.tier {
            Tier::Critical => Priority::Urgent,
            _ => Priority::High,
        };
        let message = AgentMessage::new(
            MessageKind::EscalationCreated,
            COORDINATOR,
            "human",
            serde_json::json!({
                "escalationId": escalation.id,
                "decisionId": decision.id,
                "title": decision.title,
                "tier": decision.tier,
                "reason": reason,
                "deadline": escalation.deadline,
            }),
        )
        .with_priority(priority)
        .requiring_response();
        for channel in &channels {
            self.notify(channel, &message).await;
        }
        Ok((decision, escalation))
    }

    /// Tell the proposer how its decision ended
    async fn resolved(&self, decision: &Decision) {
        metrics::record_decision_resolved(decision.tier.as_str(), decision.status.as_str());
        let message = AgentMessage::new(
            MessageKind::DecisionResolved,
            COORDINATOR,
            decision.proposer.clone(),
            serde_json::json!({
                "decisionId": decision.id,
                "status": decision.status,
                "resolutionNote": decision.resolution_note,
                "humanDecision": decision.human_decision,
            }),
        );
        self.notify(&Channel::agent(&decision.proposer), &message).await;
    }

    /// Notifications never fail the operation that sent them; the record
    /// is already saved
    async fn notify(&self, channel: &Channel, message: &AgentMessage) {
        if let Err(e) = self.bus.send(channel, message).await {
            tracing::warn!(channel = %channel, kind = ?message.kind, error = %e, "Notification not delivered");
        }
    }
}
