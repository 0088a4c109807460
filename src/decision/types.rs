//! Decision and escalation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity class, determining the automatic timeout and its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Minor,
    Major,
    Critical,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Minor => "minor",
            Tier::Major => "major",
            Tier::Critical => "critical",
        }
    }

    /// Whether the primary approver alone can approve
    pub fn single_approval(&self) -> bool {
        matches!(self, Tier::Minor)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minor" => Ok(Tier::Minor),
            "major" => Ok(Tier::Major),
            "critical" => Ok(Tier::Critical),
            _ => Err(format!("Invalid tier: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Approved => "approved",
            DecisionStatus::Rejected => "rejected",
            DecisionStatus::Escalated => "escalated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DecisionStatus::Approved | DecisionStatus::Rejected)
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DecisionStatus::Pending),
            "approved" => Ok(DecisionStatus::Approved),
            "rejected" => Ok(DecisionStatus::Rejected),
            "escalated" => Ok(DecisionStatus::Escalated),
            _ => Err(format!("Invalid decision status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Approve,
    /// Reserved for the DAO reviewer
    Veto,
}

impl Vote {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Approve => "approve",
            Vote::Veto => "veto",
        }
    }
}

impl FromStr for Vote {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(Vote::Approve),
            "veto" => Ok(Vote::Veto),
            _ => Err(format!("Invalid vote: {}", s)),
        }
    }
}

/// The two voters: `ceo` is the primary approver, `dao` the veto-capable
/// reviewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Voter {
    Ceo,
    Dao,
}

impl fmt::Display for Voter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Voter::Ceo => f.write_str("ceo"),
            Voter::Dao => f.write_str("dao"),
        }
    }
}

impl FromStr for Voter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ceo" => Ok(Voter::Ceo),
            "dao" => Ok(Voter::Dao),
            _ => Err(format!("Invalid voter: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub proposer: String,
    pub tier: Tier,
    pub status: DecisionStatus,
    pub ceo_vote: Option<Vote>,
    pub dao_vote: Option<Vote>,
    pub veto_round: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_decision: Option<String>,
    /// What resolved it: `vote`, `timeout`, `human:<name>`, `escalation-timeout`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_note: Option<String>,
}

impl Decision {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        proposer: impl Into<String>,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: description.into(),
            proposer: proposer.into(),
            tier,
            status: DecisionStatus::Pending,
            ceo_vote: None,
            dao_vote: None,
            veto_round: 0,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            human_decision: None,
            resolution_note: None,
        }
    }

    pub fn vote_of(&self, voter: Voter) -> Option<Vote> {
        match voter {
            Voter::Ceo => self.ceo_vote,
            Voter::Dao => self.dao_vote,
        }
    }

    pub(crate) fn set_vote(&mut self, voter: Voter, vote: Option<Vote>) {
        match voter {
            Voter::Ceo => self.ceo_vote = vote,
            Voter::Dao => self.dao_vote = vote,
        }
    }

    /// Votes in hand are enough to approve
    pub fn is_approved_by_votes(&self) -> bool {
        let ceo = self.ceo_vote == Some(Vote::Approve);
        if self.tier.single_approval() {
            ceo
        } else {
            ceo && self.dao_vote == Some(Vote::Approve)
        }
    }

    pub(crate) fn resolve(&mut self, status: DecisionStatus, note: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.resolution_note = Some(note.into());
        self.updated_at = now;
        if status.is_terminal() {
            self.resolved_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    Pending,
    Responded,
    Timeout,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::Responded => "responded",
            EscalationStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EscalationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EscalationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EscalationStatus::Pending),
            "responded" => Ok(EscalationStatus::Responded),
            "timeout" => Ok(EscalationStatus::Timeout),
            _ => Err(format!("Invalid escalation status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub id: String,
    pub decision_id: String,
    pub reason: String,
    pub channels_notified: Vec<String>,
    pub status: EscalationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responder: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl Escalation {
    pub fn new(
        decision_id: impl Into<String>,
        reason: impl Into<String>,
        channels_notified: Vec<String>,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            decision_id: decision_id.into(),
            reason: reason.into(),
            channels_notified,
            status: EscalationStatus::Pending,
            response: None,
            responder: None,
            created_at: now,
            deadline,
            responded_at: None,
        }
    }
}

/// What happens to a decision whose escalation times out unanswered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationTimeoutPolicy {
    #[default]
    Reject,
    Approve,
    /// Leave the decision escalated for a later human decision
    Hold,
}
