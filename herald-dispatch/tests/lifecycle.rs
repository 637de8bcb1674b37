//! Campaign state machine, validation, recovery and shutdown

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use herald_common::{
    Campaign, CampaignId, CampaignStatus, Counters, ListId, MemoryStore, SubscriberId,
    SubscriberSource, TemplateId,
};
use herald_dispatch::{DispatchConfig, DispatchError, TransitionError, ValidationError};
use pretty_assertions::assert_eq;
use tokio::sync::Semaphore;

use support::{
    ScriptedTransport, TRANSPORT, config, email, engine, eventually, launch, seed_campaign,
    seed_subscribers, wait_for_status,
};

fn edit(store: &MemoryStore, id: CampaignId, f: impl FnOnce(&mut Campaign)) {
    let mut campaign = store.campaign(id).unwrap();
    f(&mut campaign);
    store.insert_campaign(campaign);
}

#[tokio::test]
async fn test_schedule_validation() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 2);
    let engine = engine(&store, Arc::new(ScriptedTransport::new()), config());

    let cases: Vec<(fn(&mut Campaign), ValidationError)> = vec![
        (|c| c.send_at = None, ValidationError::MissingSendTime),
        (
            |c| c.send_at = Some(Utc::now() - chrono::Duration::minutes(1)),
            ValidationError::SendTimeInPast,
        ),
        (|c| c.lists.clear(), ValidationError::NoLists),
        (
            |c| c.transport = "smtp".to_string(),
            ValidationError::UnknownTransport("smtp".to_string()),
        ),
        (|c| c.lists = vec![ListId(9)], ValidationError::NoSubscribers),
    ];

    for (i, (mutate, expected)) in cases.into_iter().enumerate() {
        let id = seed_campaign(&store, i as u64 + 1);
        edit(&store, id, mutate);

        let err = engine.schedule(id).await.unwrap_err();
        assert_eq!(err.validation(), Some(&expected), "case {i}");
        assert_eq!(store.campaign(id).unwrap().status, CampaignStatus::Draft);
    }
}

#[tokio::test]
async fn test_schedule_and_unschedule() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 2);
    let id = seed_campaign(&store, 1);
    let engine = engine(&store, Arc::new(ScriptedTransport::new()), config());

    let scheduled = engine.schedule(id).await.unwrap();
    assert_eq!(scheduled.status, CampaignStatus::Scheduled);
    assert_eq!(store.campaign(id).unwrap().status, CampaignStatus::Scheduled);

    let err = engine.schedule(id).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transition(TransitionError {
            from: CampaignStatus::Scheduled,
            to: CampaignStatus::Scheduled,
            ..
        })
    ));

    let draft = engine.unschedule(id).await.unwrap();
    assert_eq!(draft.status, CampaignStatus::Draft);
    assert!(engine.unschedule(id).await.is_err());
}

#[tokio::test]
async fn test_illegal_transitions_are_rejected() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 1);
    let id = seed_campaign(&store, 1);
    let engine = engine(&store, Arc::new(ScriptedTransport::new()), config());

    // Draft campaigns cannot start
    let err = engine.start(id).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Transition(TransitionError {
            from: CampaignStatus::Draft,
            to: CampaignStatus::Running,
            ..
        })
    ));

    engine.schedule(id).await.unwrap();
    assert!(matches!(
        engine.pause(id).await.unwrap_err(),
        DispatchError::Transition(TransitionError {
            from: CampaignStatus::Scheduled,
            to: CampaignStatus::Paused,
            ..
        })
    ));
    assert!(matches!(
        engine.resume(id).await.unwrap_err(),
        DispatchError::Transition(_)
    ));

    assert!(matches!(
        engine.schedule(CampaignId(99)).await.unwrap_err(),
        DispatchError::UnknownCampaign(CampaignId(99))
    ));
}

#[tokio::test]
async fn test_cancel_without_session() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 1);
    let id = seed_campaign(&store, 1);
    let engine = engine(&store, Arc::new(ScriptedTransport::new()), config());
    engine.schedule(id).await.unwrap();

    let mut events = engine.events();
    let cancelled = engine.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, CampaignStatus::Cancelled);
    assert_eq!(
        events.recv().await.unwrap(),
        herald_dispatch::CampaignEvent::StatusChanged {
            campaign: id,
            from: CampaignStatus::Scheduled,
            to: CampaignStatus::Cancelled,
        }
    );

    // Terminal states have no way out
    assert!(matches!(
        engine.cancel(id).await.unwrap_err(),
        DispatchError::Transition(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 3);
    let id = seed_campaign(&store, 1);

    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate.clone()));
    let engine = engine(&store, transport.clone(), config());

    let first = launch(&engine, id).await;
    let second = engine.start(id).await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.campaign().counters.total, 3);

    gate.add_permits(3);
    wait_for_status(&first, CampaignStatus::Finished).await;
    assert_eq!(transport.total_attempts(), 3);
    eventually(|| store.campaign(id).unwrap().status == CampaignStatus::Finished).await;

    // A finished campaign cannot be started again
    assert!(matches!(
        engine.start(id).await.unwrap_err(),
        DispatchError::Transition(TransitionError {
            from: CampaignStatus::Finished,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_due_only_starts_scheduled_campaigns() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 2);
    let due = seed_campaign(&store, 1);
    let draft = seed_campaign(&store, 2);
    let engine = engine(&store, Arc::new(ScriptedTransport::new()), config());
    engine.schedule(due).await.unwrap();

    assert!(engine.start_due(Utc::now()).await.unwrap().is_empty());

    let started = engine
        .start_due(Utc::now() + chrono::Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].campaign_id(), due);

    wait_for_status(&started[0], CampaignStatus::Finished).await;
    assert_eq!(store.campaign(draft).unwrap().status, CampaignStatus::Draft);
}

#[tokio::test(start_paused = true)]
async fn test_recover_continues_from_persisted_cursor() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 5);

    let mut running = Campaign::draft(CampaignId(1), "Running", vec![ListId(1)], TemplateId(1), TRANSPORT);
    running.status = CampaignStatus::Running;
    running.cursor = Some(SubscriberId(3));
    running.ceiling = Some(SubscriberId(5));
    running.counters = Counters {
        total: 5,
        sent: 3,
        ..Counters::default()
    };
    store.snapshot(&running).await.unwrap();
    store.insert_campaign(running);

    let mut paused = Campaign::draft(CampaignId(2), "Paused", vec![ListId(1)], TemplateId(1), TRANSPORT);
    paused.status = CampaignStatus::Paused;
    paused.ceiling = Some(SubscriberId(5));
    paused.counters.total = 5;
    store.snapshot(&paused).await.unwrap();
    store.insert_campaign(paused);

    let transport = Arc::new(ScriptedTransport::new());
    let engine = engine(&store, transport.clone(), config());

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered.len(), 2);

    let handle = |id| {
        recovered
            .iter()
            .find(|handle| handle.campaign_id() == CampaignId(id))
            .cloned()
            .unwrap()
    };

    let running = handle(1);
    wait_for_status(&running, CampaignStatus::Finished).await;
    assert_eq!(transport.delivered(), vec![email(4), email(5)]);
    assert_eq!(running.counters().sent, 5);

    // Paused campaigns wait for an operator
    let paused = handle(2);
    assert_eq!(paused.status(), CampaignStatus::Paused);
    paused.wait_idle().await;
    assert_eq!(transport.delivered().len(), 2);

    engine.resume(CampaignId(2)).await.unwrap();
    wait_for_status(&paused, CampaignStatus::Finished).await;
    assert_eq!(paused.counters().sent, 5);
    assert_eq!(transport.delivered().len(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_running_campaigns_for_recovery() {
    let store = MemoryStore::new();
    seed_subscribers(&store, 4);
    let id = seed_campaign(&store, 1);

    let gate = Arc::new(Semaphore::new(0));
    let transport = Arc::new(ScriptedTransport::new().gated(gate));
    let engine = engine(
        &store,
        transport.clone(),
        DispatchConfig {
            workers: 1,
            shutdown_timeout_secs: 1,
            ..config()
        },
    );

    launch(&engine, id).await;
    eventually(|| transport.in_flight() == 1).await;

    let started = tokio::time::Instant::now();
    engine.shutdown().await;
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert_eq!(store.campaign(id).unwrap().status, CampaignStatus::Running);
    assert!(matches!(
        engine.schedule(id).await.unwrap_err(),
        DispatchError::ShuttingDown
    ));
}
