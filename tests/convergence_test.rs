use std::time::Duration;
use teamchain::chain::types::DeviceKind;
use teamchain::chain::{
    editor, loader, ChangeFlags, LoadTeamArg, Role, TeamError, TeamNotification, UserId,
    Visibility,
};
use teamchain::convergence::{self, Backoff, InvalidationController, SubscriptionState};
use teamchain::memory::MemoryNetwork;
use teamchain::{EngineSettings, TeamContext};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings() -> EngineSettings {
    EngineSettings {
        poll_base: Duration::from_millis(10),
        poll_max: Duration::from_millis(50),
        ..EngineSettings::default()
    }
}

async fn client(network: &MemoryNetwork, user: &str) -> TeamContext {
    let device = network.provision(user, DeviceKind::Desktop).await.unwrap();
    network.context(device, settings())
}

fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(10), Duration::from_millis(40), 1.5)
}

/// Wait until `check` holds, giving background tasks a bounded time.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_await_sequence_observes_concurrent_writer() {
    init_logging();
    let network = MemoryNetwork::new();
    let alice = client(&network, "alice").await;
    let watcher = client(&network, "watcher").await;
    for name in ["bob", "carol", "dave"] {
        client(&network, name).await;
    }

    let team = editor::create_team(&alice, &"acme".parse().unwrap(), Visibility::Private)
        .await
        .unwrap();
    let id = team.id();

    let writer = tokio::spawn(async move {
        for name in ["bob", "carol", "dave"] {
            tokio::time::sleep(Duration::from_millis(15)).await;
            editor::add_member(&alice, id, &UserId::new(name), Role::Reader)
                .await
                .unwrap();
        }
    });

    let observed =
        convergence::await_sequence_at_least(&watcher, &LoadTeamArg::by_id(id), 4, 10, fast_backoff())
            .await
            .unwrap();
    assert!(observed.current_seqno() >= 4);
    writer.await.unwrap();
}

#[tokio::test]
async fn test_await_sequence_times_out() {
    init_logging();
    let network = MemoryNetwork::new();
    let alice = client(&network, "alice").await;

    let team = editor::create_team(&alice, &"acme".parse().unwrap(), Visibility::Private)
        .await
        .unwrap();
    let before = network.transport.fetch_count();

    let err = convergence::await_sequence_at_least(
        &alice,
        &LoadTeamArg::by_id(team.id()),
        9,
        3,
        fast_backoff(),
    )
    .await
    .unwrap_err();
    match err {
        TeamError::TimedOut {
            target,
            observed,
            attempts,
            ..
        } => {
            assert_eq!(target, 9);
            assert_eq!(observed, 1);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected timeout, got {}", other),
    }
    // Every attempt went to the server.
    assert_eq!(network.transport.fetch_count() - before, 3);
}

#[tokio::test]
async fn test_deadline_bounds_waiting() {
    init_logging();
    let network = MemoryNetwork::new();
    let alice = client(&network, "alice").await;
    let team = editor::create_team(&alice, &"acme".parse().unwrap(), Visibility::Private)
        .await
        .unwrap();

    let hurried = alice.clone().with_timeout(Duration::from_millis(30));
    let err = convergence::await_sequence_at_least(
        &hurried,
        &LoadTeamArg::by_id(team.id()),
        9,
        50,
        Backoff::new(Duration::from_millis(20), Duration::from_millis(20), 1.0),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TeamError::DeadlineExceeded));
}

#[tokio::test]
async fn test_notifications_coalesce_into_one_repoll() {
    init_logging();
    let network = MemoryNetwork::new();
    let alice = client(&network, "alice").await;
    let watcher = client(&network, "watcher").await;
    client(&network, "bob").await;
    client(&network, "carol").await;

    let team = editor::create_team(&alice, &"acme".parse().unwrap(), Visibility::Private)
        .await
        .unwrap();
    for name in ["bob", "carol"] {
        editor::add_member(&alice, team.id(), &UserId::new(name), Role::Reader)
            .await
            .unwrap();
    }

    let controller = InvalidationController::spawn(watcher.clone());
    network
        .transport
        .set_fetch_delay(Some(Duration::from_millis(100)))
        .await;

    let changed = |latest_seqno| TeamNotification::Changed {
        team: team.id(),
        changes: ChangeFlags {
            membership_changed: true,
            ..ChangeFlags::default()
        },
        latest_seqno,
    };
    assert!(controller.notify(changed(2)));
    assert!(controller.notify(changed(3)));
    tokio::time::sleep(Duration::from_millis(30)).await;

    match controller.state_of(&team.id()).await {
        SubscriptionState::PendingRepoll { target, changes } => {
            assert_eq!(target, 3);
            assert!(changes.membership_changed);
        }
        other => panic!("expected a pending repoll, got {:?}", other),
    }
    assert_eq!(controller.pending().await, 1);

    eventually(|| async { controller.state_of(&team.id()).await == SubscriptionState::Idle })
        .await;
    assert_eq!(watcher.cache().cached_seqno(&team.id()).await, Some(3));

    // Already seen: no new repoll.
    network.transport.set_fetch_delay(None).await;
    let fetches = network.transport.fetch_count();
    assert!(controller.notify(changed(2)));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(controller.state_of(&team.id()).await, SubscriptionState::Idle);
    assert_eq!(network.transport.fetch_count(), fetches);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_deleted_notification_evicts() {
    init_logging();
    let network = MemoryNetwork::new();
    let alice = client(&network, "alice").await;
    let watcher = client(&network, "watcher").await;

    let team = editor::create_team(&alice, &"acme".parse().unwrap(), Visibility::Private)
        .await
        .unwrap();
    loader::load(&watcher, &LoadTeamArg::by_id(team.id()))
        .await
        .unwrap();
    assert_eq!(watcher.cache().cached_seqno(&team.id()).await, Some(1));

    let controller = InvalidationController::spawn(watcher.clone());
    network
        .transport
        .subscribe(watcher.me().user().clone(), controller.sender())
        .await;

    editor::delete_team(&alice, team.id()).await.unwrap();
    eventually(|| async { watcher.cache().cached_seqno(&team.id()).await.is_none() }).await;

    controller.shutdown().await;
}

#[tokio::test]
async fn test_member_leaving_triggers_rekey() {
    init_logging();
    let network = MemoryNetwork::new();
    let alice = client(&network, "alice").await;
    let carol = client(&network, "carol").await;

    let team = editor::create_team(&alice, &"acme".parse().unwrap(), Visibility::Private)
        .await
        .unwrap();
    editor::add_member(&alice, team.id(), &UserId::new("carol"), Role::Writer)
        .await
        .unwrap();

    let controller = InvalidationController::spawn(alice.clone());
    network
        .transport
        .subscribe(alice.me().user().clone(), controller.sender())
        .await;

    editor::leave(&carol, team.id()).await.unwrap();
    assert_eq!(carol.cache().cached_seqno(&team.id()).await, None);

    // Leave is seqno 3; the background rekey appends seqno 4.
    let rekeyed = convergence::await_seqno(&alice, &LoadTeamArg::by_id(team.id()), 4)
        .await
        .unwrap();
    assert_eq!(rekeyed.generation(), 2);
    assert!(!rekeyed.needs_rotation());
    assert!(!rekeyed.is_member(&UserId::new("carol")));
    assert!(rekeyed.current_secret().is_some());

    controller.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_with_senders_still_held() {
    init_logging();
    let network = MemoryNetwork::new();
    let watcher = client(&network, "watcher").await;

    let controller = InvalidationController::spawn(watcher.clone());
    network
        .transport
        .subscribe(watcher.me().user().clone(), controller.sender())
        .await;
    let held = controller.sender();

    tokio::time::timeout(Duration::from_secs(2), controller.shutdown())
        .await
        .expect("shutdown should not wait for outstanding senders");
    assert!(held.is_closed());
}

#[tokio::test]
async fn test_rekey_when_cache_already_has_the_leave() {
    init_logging();
    let network = MemoryNetwork::new();
    let alice = client(&network, "alice").await;
    let carol = client(&network, "carol").await;

    let team = editor::create_team(&alice, &"acme".parse().unwrap(), Visibility::Private)
        .await
        .unwrap();
    editor::add_member(&alice, team.id(), &UserId::new("carol"), Role::Writer)
        .await
        .unwrap();
    editor::leave(&carol, team.id()).await.unwrap();

    // Alice picks up the leave on her own before the notification lands.
    let seen = loader::load(&alice, &LoadTeamArg::by_id(team.id()).force_repoll())
        .await
        .unwrap();
    assert_eq!(seen.current_seqno(), 3);
    assert!(seen.needs_rotation());

    let controller = InvalidationController::spawn(alice.clone());
    assert!(controller.notify(TeamNotification::Changed {
        team: team.id(),
        changes: ChangeFlags {
            membership_changed: true,
            ..ChangeFlags::default()
        },
        latest_seqno: 3,
    }));

    let rekeyed = convergence::await_seqno(&alice, &LoadTeamArg::by_id(team.id()), 4)
        .await
        .unwrap();
    assert_eq!(rekeyed.generation(), 2);
    assert!(!rekeyed.needs_rotation());

    controller.shutdown().await;
}
