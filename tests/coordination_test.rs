//! End-to-end coordination scenarios
//!
//! Several agents share one in-process store through independent [`Mesh`]
//! handles, the way separate processes share a hosted store.

use agentmesh::agent_status::{AgentState, AgentStatus};
use agentmesh::bus::{ConsumerOptions, Delivery, DeliveryHandler, GuaranteedConsumer};
use agentmesh::config::{MeshConfig, StoreBackend};
use agentmesh::decision::{
    DecisionStatus, EscalationStatus, SqliteDecisionRepository, Tier, Vote, Voter,
};
use agentmesh::keys::Channel;
use agentmesh::message::{AgentMessage, MessageKind};
use agentmesh::store::SharedStore;
use agentmesh::Mesh;
use async_trait::async_trait;
use meshstore::MemoryStore;
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config() -> MeshConfig {
    let mut config = MeshConfig::new();
    config.store.backend = StoreBackend::Memory;
    config.bus.read_block = Duration::from_millis(10);
    config.bus.reclaim_min_idle = Duration::from_secs(60);
    config
}

/// Two meshes over the same store
fn pair() -> (Mesh, Mesh) {
    let store: SharedStore = Arc::new(MemoryStore::new());
    (
        Mesh::new(config(), store.clone()),
        Mesh::new(config(), store),
    )
}

mod queue_tests {
    use super::*;

    #[tokio::test]
    async fn test_tasks_survive_agent_crash() {
        let (orchestrator, agent) = pair();
        let mut enqueued = HashSet::new();
        for n in 0..3 {
            let task = orchestrator.queue.enqueue("a1", json!({ "n": n })).await.unwrap();
            enqueued.insert(task.id);
        }

        // Agent claims two and dies before acknowledging
        let claimed = agent.queue.claim("a1", 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        drop(agent);

        let depth = orchestrator.queue.depth("a1").await.unwrap();
        assert_eq!((depth.queued, depth.processing), (1, 2));

        // Supervisor recovers, a fresh agent drains everything
        assert_eq!(orchestrator.queue.recover("a1").await.unwrap(), 2);
        let restarted = Mesh::new(config(), orchestrator.store().clone());
        assert_eq!(restarted.queue.depth("a1").await.unwrap().queued, 3);

        let all = restarted.queue.claim("a1", 10).await.unwrap();
        let ids: HashSet<String> = all.iter().map(|c| c.task.id.clone()).collect();
        assert_eq!(ids, enqueued);

        assert_eq!(restarted.queue.acknowledge("a1", &all).await.unwrap(), 3);
        let depth = restarted.queue.depth("a1").await.unwrap();
        assert_eq!((depth.queued, depth.processing), (0, 0));
    }

    #[tokio::test]
    async fn test_acknowledged_tasks_are_not_recovered() {
        let (orchestrator, agent) = pair();
        orchestrator.queue.enqueue("a1", json!({"n": 1})).await.unwrap();
        orchestrator.queue.enqueue("a1", json!({"n": 2})).await.unwrap();

        let claimed = agent.queue.claim("a1", 2).await.unwrap();
        agent.queue.acknowledge_ids("a1", &[claimed[0].task.id.clone()]).await.unwrap();

        assert_eq!(orchestrator.queue.recover("a1").await.unwrap(), 1);
        let again = agent.queue.claim("a1", 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].task.id, claimed[1].task.id);
    }

    #[tokio::test]
    async fn test_urgent_task_routed_to_agent() {
        let (orchestrator, agent) = pair();
        let urgent = orchestrator.queue.enqueue_urgent(json!({"fix": "prod"})).await.unwrap();
        orchestrator.queue.enqueue("a1", json!({"n": 1})).await.unwrap();

        let routed = orchestrator.queue.route_urgent("a1").await.unwrap().unwrap();
        assert_eq!(routed.id, urgent.id);
        assert_eq!(orchestrator.queue.urgent_depth().await.unwrap(), 0);
        assert!(orchestrator.queue.route_urgent("a1").await.unwrap().is_none());

        let claimed = agent.queue.claim("a1", 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
    }
}

mod bus_tests {
    use super::*;

    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(delivery.message.id.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guaranteed_delivery_survives_consumer_crash() {
        let (sender, receiver) = pair();
        let channel = Channel::agent("a1");
        receiver.bus.ensure_group(&channel.stream(), "agents").await.unwrap();

        let message = AgentMessage::new(MessageKind::Direct, "head", channel.to_string(), json!({"n": 1}));
        let report = sender.bus.send(&channel, &message).await.unwrap();
        assert!(report.stream_id().is_some());

        // First consumer reads and crashes without acknowledging
        let read = receiver
            .bus
            .read_group(&channel.stream(), "agents", "crashed-1", 10, None)
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = ConsumerOptions::new(&receiver.bus, channel.stream(), "agents").with_consumer("live-2");
        let consumer = GuaranteedConsumer::new(receiver.bus.clone(), options, Recorder { seen: seen.clone() });

        // Not idle long enough yet
        let stats = consumer.cycle().await.unwrap();
        assert_eq!(stats.handled, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        let stats = consumer.cycle().await.unwrap();
        assert_eq!(stats.handled, 1);
        assert_eq!(*seen.lock().unwrap(), vec![message.id.clone()]);
        assert!(receiver
            .bus
            .pending(&channel.stream(), "agents", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_each_group_sees_every_message() {
        let (sender, receiver) = pair();
        let stream = Channel::Broadcast.stream();
        receiver.bus.ensure_group(&stream, "auditors").await.unwrap();
        receiver.bus.ensure_group(&stream, "agents").await.unwrap();

        for n in 0..3 {
            let message = AgentMessage::new(MessageKind::Broadcast, "head", "*", json!({ "n": n }));
            sender.bus.send(&Channel::Broadcast, &message).await.unwrap();
        }

        for group in ["auditors", "agents"] {
            let read = receiver.bus.read_group(&stream, group, "c1", 10, None).await.unwrap();
            assert_eq!(read.len(), 3, "group {}", group);
        }
        let depth = receiver.bus.stream_depth(&stream).await.unwrap();
        assert_eq!(depth.length, 3);
        assert_eq!(depth.groups.len(), 2);
    }
}

mod lock_and_limit_tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_excludes_other_processes() {
        let (first, second) = pair();
        let ttl = Duration::from_secs(30);
        let token = first.locks.acquire_owned("lock:container:c1", ttl).await.unwrap().unwrap();
        assert!(second.locks.acquire_owned("lock:container:c1", ttl).await.unwrap().is_none());

        assert!(first.locks.release_owned(&token).await.unwrap());
        assert!(second.locks.acquire_owned("lock:container:c1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rate_limit_shared_across_processes() {
        let (first, second) = pair();
        let window = Duration::from_secs(60);
        // Start of a window
        let now_ms = 60_000 * 1000;

        assert!(first.limiter.check_at("ratelimit:claude:a1", 2, window, now_ms).await.unwrap().allowed);
        assert!(second.limiter.check_at("ratelimit:claude:a1", 2, window, now_ms + 1).await.unwrap().allowed);
        let third = first.limiter.check_at("ratelimit:claude:a1", 2, window, now_ms + 2).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining(), 0);

        // Next window starts fresh
        let next = second
            .limiter
            .check_at("ratelimit:claude:a1", 2, window, now_ms + 60_000)
            .await
            .unwrap();
        assert!(next.allowed);
        assert_eq!(next.count, 1);
    }

    #[tokio::test]
    async fn test_agent_status_visible_to_other_processes() {
        let (agent, orchestrator) = pair();
        agent
            .agents
            .set(&AgentStatus::new("a1", AgentState::Busy).working_on("t-1"))
            .await
            .unwrap();

        let status = orchestrator.agents.get("a1").await.unwrap().unwrap();
        assert_eq!(status.state, AgentState::Busy);
        assert_eq!(status.current_task.as_deref(), Some("t-1"));
        assert!(orchestrator.agents.get("a2").await.unwrap().is_none());
    }
}

mod decision_tests {
    use super::*;

    fn with_decisions(mesh: Mesh) -> Mesh {
        let repo = SqliteDecisionRepository::open_in_memory().unwrap();
        mesh.with_decisions(Arc::new(repo))
    }

    #[tokio::test]
    async fn test_major_decision_needs_both_votes() {
        let (head, _) = pair();
        let head = with_decisions(head);
        let decisions = head.decisions().unwrap();

        let d = decisions.propose("Adopt new CI", "", "a1", Tier::Major).await.unwrap();
        let d = decisions.vote(&d.id, Voter::Ceo, Vote::Approve).await.unwrap();
        assert_eq!(d.status, DecisionStatus::Pending);

        let d = decisions.vote(&d.id, Voter::Dao, Vote::Approve).await.unwrap();
        assert_eq!(d.status, DecisionStatus::Approved);
        assert!(d.resolved_at.is_some());

        // The proposal went out on the C-level stream
        let depth = head.bus.stream_depth(&Channel::CLevel.stream()).await.unwrap();
        assert!(depth.length >= 1);
    }

    #[tokio::test]
    async fn test_repeated_vetoes_escalate_to_human() {
        let mut config = config();
        config.decisions.max_veto_rounds = 2;
        let head = with_decisions(Mesh::new(config, Arc::new(MemoryStore::new())));
        let decisions = head.decisions().unwrap();

        let d = decisions.propose("Delete prod data", "", "a1", Tier::Critical).await.unwrap();
        let d = decisions.vote(&d.id, Voter::Dao, Vote::Veto).await.unwrap();
        assert_eq!((d.status, d.veto_round), (DecisionStatus::Pending, 1));
        let d = decisions.revise(&d.id, "Archive prod data instead").await.unwrap();
        let d = decisions.vote(&d.id, Voter::Dao, Vote::Veto).await.unwrap();
        assert_eq!(d.status, DecisionStatus::Escalated);

        let pending = decisions.escalations(Some(EscalationStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].decision_id, d.id);

        let (escalation, decision) = decisions
            .respond_to_escalation(&pending[0].id, false, "Too risky", "ops-lead")
            .await
            .unwrap();
        assert_eq!(escalation.status, EscalationStatus::Responded);
        assert_eq!(decision.status, DecisionStatus::Rejected);
    }
}
