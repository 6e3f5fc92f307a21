use crate::command::{Command, Reply};
use crate::game::{GameStatus, MoveOutcome};
use crate::invitation::Response;
use crate::matchmaking::EnqueueOutcome;
use crate::*;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::Receiver;

struct Harness {
    arena: Arc<Arena>,
    storage: Arc<MemoryStorage>,
    clock: ManualClock,
}

fn harness(config: ArenaConfig) -> Harness {
    let storage = Arc::new(MemoryStorage::new());
    let clock = ManualClock::starting_now();
    let arena = Arc::new(Arena::new(config, storage.clone(), Arc::new(clock.clone())));
    Harness {
        arena,
        storage,
        clock,
    }
}

impl Harness {
    async fn join(&self, name: &str) -> PlayerId {
        let id = PlayerId::new();
        self.arena.connect(id, name).await.expect("connect");
        id
    }

    async fn rated(&self, name: &str, rating: i32) -> PlayerId {
        let id = PlayerId::new();
        self.storage.set_rating(id, rating);
        self.arena.connect(id, name).await.expect("connect");
        id
    }

    async fn run(&self, actor: PlayerId, namespace: &str, event: &str, data: serde_json::Value) -> Result<Reply, ArenaError> {
        let command = Command::parse(namespace, event, data).expect("well-formed command");
        self.arena.execute(actor, command).await
    }
}

fn drain(rx: &mut Receiver<Envelope>) -> Vec<Envelope> {
    let mut seen = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        seen.push(envelope);
    }
    seen
}

fn names(envelopes: &[Envelope]) -> Vec<&'static str> {
    envelopes.iter().map(|e| e.notification.name()).collect()
}

#[tokio::test]
async fn close_ratings_match_on_join() {
    let h = harness(ArenaConfig::default());
    let a = h.rated("a", 1200).await;
    let b = h.rated("b", 1250).await;

    let first = h.run(a, "queue", "join", json!({})).await.unwrap();
    assert!(matches!(first, Reply::Queue(EnqueueOutcome::Queued { .. })));

    let second = h.run(b, "queue", "join", json!({})).await.unwrap();
    let Reply::Queue(EnqueueOutcome::Matched(found)) = second else {
        panic!("expected an immediate match, got {second:?}");
    };
    let game = h.arena.games().get(found.game_id).await.unwrap();
    assert_eq!(game.status, GameStatus::Active);
    assert_eq!(game.players.iter().map(|p| p.rating).collect::<Vec<_>>(), vec![1200, 1250]);
}

#[tokio::test]
async fn distant_ratings_match_after_expansion() {
    let h = harness(ArenaConfig::default());
    let a = h.rated("a", 1200).await;
    let c = h.rated("c", 1500).await;
    h.run(a, "queue", "join", json!({})).await.unwrap();
    h.run(c, "queue", "join", json!({})).await.unwrap();

    let report = h.arena.sweep_all().await;
    assert_eq!(report.matches, 0);

    h.clock.advance_secs(150);
    h.arena.expand_queue().await;
    for entry in h.arena.queue().entries().await {
        assert!((entry.range_multiplier - 1.5).abs() < 1e-9);
    }
    assert_eq!(h.arena.sweep_queue().await, 1);
    assert!(!h.arena.queue().contains(a).await);
    assert!(!h.arena.queue().contains(c).await);
}

#[tokio::test]
async fn lobby_to_game_to_reuse() {
    let h = harness(ArenaConfig::default());
    let host = h.join("host").await;
    let guest = h.join("guest").await;
    let mut rx = h.arena.events().subscribe();

    let Reply::Lobby(lobby) = h
        .run(host, "lobby", "create", json!({ "name": "duel", "max_players": 2 }))
        .await
        .unwrap()
    else {
        panic!("expected a lobby");
    };
    let Reply::Lobby(joined) = h
        .run(guest, "lobby", "join", json!({ "lobby_id": lobby.id }))
        .await
        .unwrap()
    else {
        panic!("expected a lobby");
    };
    assert_eq!(joined.state, LobbyState::Filling);
    assert!(joined.is_full());

    for player in [host, guest] {
        h.run(player, "lobby", "set_ready", json!({ "lobby_id": lobby.id, "ready": true }))
            .await
            .unwrap();
    }
    assert_eq!(h.arena.lobbies().get(lobby.id).await.unwrap().state, LobbyState::Ready);

    let Reply::Started { game_id } = h
        .run(host, "lobby", "start", json!({ "lobby_id": lobby.id }))
        .await
        .unwrap()
    else {
        panic!("expected a game");
    };
    assert_eq!(h.arena.lobbies().get(lobby.id).await.unwrap().state, LobbyState::InGame);

    let emitted = names(&drain(&mut rx));
    assert!(emitted.contains(&"lobby_created"));
    assert!(emitted.contains(&"player_joined_lobby"));
    assert!(emitted.contains(&"lobby_state_changed"));
    assert!(emitted.contains(&"game_started"));

    // Play tic-tac-toe to a win for whoever moves first.
    let game = h.arena.games().get(game_id).await.unwrap();
    let x = game.current_turn.player_id;
    let o = if x == host { guest } else { host };
    let moves = [(x, 0), (o, 3), (x, 1), (o, 4), (x, 2)];
    let mut last = None;
    for (player, cell) in moves {
        last = Some(
            h.run(player, "game", "move", json!({ "game_id": game_id, "move": { "cell": cell } }))
                .await
                .unwrap(),
        );
    }
    let Some(Reply::Move(MoveOutcome::GameOver(conclusion))) = last else {
        panic!("game should be over");
    };
    assert_eq!(conclusion.winner_id, Some(x));

    let lobby = h.arena.lobbies().get(lobby.id).await.unwrap();
    assert_eq!(lobby.state, LobbyState::Ready);
    assert_eq!(lobby.game_id, None);

    let ledger = h.storage.ledger().await;
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].delta, -ledger[1].delta);
    assert_eq!(h.arena.player(x).unwrap().rating, 1016);
    assert_eq!(h.arena.player(o).unwrap().rating, 984);

    let emitted = names(&drain(&mut rx));
    assert!(emitted.contains(&"game_over"));
    assert!(emitted.contains(&"rating_updated"));
}

#[tokio::test]
async fn stalled_turn_passes_to_opponent() {
    let mut config = ArenaConfig::default();
    config.game.max_turn_secs = 1;
    let h = harness(config);
    let a = h.join("a").await;
    let b = h.join("b").await;
    h.run(a, "queue", "join", json!({})).await.unwrap();
    let Reply::Queue(EnqueueOutcome::Matched(found)) = h.run(b, "queue", "join", json!({})).await.unwrap() else {
        panic!("expected a match");
    };
    let stalled = h.arena.games().get(found.game_id).await.unwrap().current_turn.player_id;
    let mut rx = h.arena.events().subscribe();

    h.clock.advance_secs(2);
    assert_eq!(h.arena.sweep_deadlines().await, 1);

    let game = h.arena.games().get(found.game_id).await.unwrap();
    assert_ne!(game.current_turn.player_id, stalled);
    let expired: Vec<Envelope> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.notification.name() == "turn_expired")
        .collect();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].scope, Scope::Game(found.game_id));
}

#[tokio::test]
async fn forfeit_rates_with_reduced_k() {
    let h = harness(ArenaConfig::default());
    let x = h.join("x").await;
    let y = h.join("y").await;
    let Reply::Invitation(invitation) = h
        .run(x, "invite", "send", json!({ "recipient_id": y }))
        .await
        .unwrap()
    else {
        panic!("expected an invitation");
    };
    let Reply::Responded(Response::GameStarted { game_id }) = h
        .run(y, "invite", "respond", json!({ "invitation_id": invitation.id, "accept": true }))
        .await
        .unwrap()
    else {
        panic!("expected a direct game");
    };

    let Reply::Concluded(conclusion) = h
        .run(x, "game", "forfeit", json!({ "game_id": game_id }))
        .await
        .unwrap()
    else {
        panic!("expected a conclusion");
    };
    assert_eq!(conclusion.winner_id, Some(y));
    let delta = |player| {
        conclusion
            .rating_changes
            .iter()
            .find(|c| c.player_id == player)
            .map(|c| c.delta)
            .unwrap()
    };
    assert_eq!(delta(y), 8);
    assert_eq!(delta(x), -8);
}

#[tokio::test]
async fn claimed_queue_rating_never_reaches_the_ledger() {
    let h = harness(ArenaConfig::default());
    let a = h.rated("a", 1000).await;
    let b = h.rated("b", 1000).await;

    h.run(a, "queue", "join", json!({ "rating": 2400 })).await.unwrap();
    let Reply::Queue(EnqueueOutcome::Matched(found)) =
        h.run(b, "queue", "join", json!({ "rating": 2400 })).await.unwrap()
    else {
        panic!("expected a match");
    };
    h.run(a, "game", "forfeit", json!({ "game_id": found.game_id }))
        .await
        .unwrap();

    let ledger = h.storage.ledger().await;
    let row = |player| ledger.iter().find(|c| c.player_id == player).unwrap();
    assert_eq!((row(a).old_rating, row(a).new_rating), (1000, 992));
    assert_eq!((row(b).old_rating, row(b).new_rating), (1000, 1008));
    assert_eq!(h.storage.rating(a), Some(992));
    assert_eq!(h.storage.rating(b), Some(1008));

    let err = h
        .run(a, "queue", "join", json!({ "rating": i32::MIN }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(!h.arena.queue().contains(a).await);
}

#[tokio::test]
async fn eviction_removes_player_everywhere() {
    let h = harness(ArenaConfig::default());
    let host = h.join("host").await;
    let guest = h.join("guest").await;
    let loner = h.join("loner").await;

    let Reply::Lobby(lobby) = h
        .run(host, "lobby", "create", json!({ "name": "room", "max_players": 3 }))
        .await
        .unwrap()
    else {
        panic!("expected a lobby");
    };
    h.clock.advance_secs(1);
    h.run(guest, "lobby", "join", json!({ "lobby_id": lobby.id })).await.unwrap();
    h.run(host, "lobby", "set_ready", json!({ "lobby_id": lobby.id, "ready": true }))
        .await
        .unwrap();
    h.run(loner, "queue", "join", json!({})).await.unwrap();

    h.arena.disconnect(host).await;
    h.arena.disconnect(loner).await;
    let lobby_now = h.arena.lobbies().get(lobby.id).await.unwrap();
    assert!(!lobby_now.member(host).unwrap().ready);
    assert!(h.arena.queue().contains(loner).await);

    h.clock.advance_secs(61);
    assert_eq!(h.arena.sweep_presence().await, 2);

    let lobby_now = h.arena.lobbies().get(lobby.id).await.unwrap();
    assert_eq!(lobby_now.host_id, guest);
    assert_eq!(lobby_now.members.len(), 1);
    assert!(!h.arena.queue().contains(loner).await);
    assert!(h.arena.player(host).is_none());

    let err = h.run(host, "queue", "status", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn reconnect_within_window_keeps_seat() {
    let h = harness(ArenaConfig::default());
    let a = h.join("a").await;
    let b = h.join("b").await;
    h.run(a, "queue", "join", json!({})).await.unwrap();
    let Reply::Queue(EnqueueOutcome::Matched(found)) = h.run(b, "queue", "join", json!({})).await.unwrap() else {
        panic!("expected a match");
    };

    h.arena.disconnect(a).await;
    let game = h.arena.games().get(found.game_id).await.unwrap();
    assert!(!game.participant(a).unwrap().connected);

    h.clock.advance_secs(30);
    let (_, outcome) = h.arena.connect(a, "a").await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Reconnected);
    let game = h.arena.games().get(found.game_id).await.unwrap();
    assert!(game.participant(a).unwrap().connected);

    h.clock.advance_secs(60);
    assert_eq!(h.arena.sweep_presence().await, 0);
}

#[tokio::test]
async fn storage_outage_leaves_no_trace() {
    let h = harness(ArenaConfig::default());
    let host = h.join("host").await;
    let mut rx = h.arena.events().subscribe();
    h.storage.set_failing(true);

    let err = h
        .run(host, "lobby", "create", json!({ "name": "doomed" }))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(h.arena.lobbies().lobbies_for(host).await.is_empty());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn queue_never_holds_duplicates() {
    use rand::Rng;

    let h = harness(ArenaConfig::default());
    let mut players = Vec::new();
    for i in 0..8 {
        players.push(h.rated(&format!("p{i}"), 1000 + i * 300).await);
    }

    let mut rng = rand::thread_rng();
    for _ in 0..200 {
        let player = players[rng.gen_range(0..players.len())];
        if rng.gen_bool(0.7) {
            let _ = h.run(player, "queue", "join", json!({})).await;
        } else {
            h.run(player, "queue", "leave", json!({})).await.unwrap();
        }
        let mut ids: Vec<PlayerId> = h.arena.queue().entries().await.iter().map(|e| e.player.id).collect();
        let before = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_respect_capacity() {
    let h = harness(ArenaConfig::default());
    let host = h.join("host").await;
    let Reply::Lobby(lobby) = h
        .run(host, "lobby", "create", json!({ "name": "rush", "max_players": 4 }))
        .await
        .unwrap()
    else {
        panic!("expected a lobby");
    };

    let mut tasks = Vec::new();
    for i in 0..12 {
        let player = h.join(&format!("p{i}")).await;
        let arena = h.arena.clone();
        let lobby_id = lobby.id;
        tasks.push(tokio::spawn(async move {
            let command = Command::parse("lobby", "join", json!({ "lobby_id": lobby_id })).unwrap();
            arena.execute(player, command).await.is_ok()
        }));
    }
    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }

    let lobby = h.arena.lobbies().get(lobby.id).await.unwrap();
    assert_eq!(admitted, 3);
    assert_eq!(lobby.members.len(), 4);
    assert!(lobby.members.len() <= lobby.max_players);
    assert_eq!(lobby.members.iter().filter(|m| m.player_id == lobby.host_id).count(), 1);
}

#[tokio::test]
async fn lobby_browsing_and_chat() {
    let h = harness(ArenaConfig::default());
    let host = h.join("host").await;
    let other = h.join("other").await;
    let mut rx = h.arena.events().subscribe();

    h.run(host, "lobby", "create", json!({ "name": "open" })).await.unwrap();
    h.run(other, "lobby", "create", json!({ "name": "hidden", "is_private": true }))
        .await
        .unwrap();

    let Reply::Lobbies(listed) = h.run(host, "lobby", "list", json!({})).await.unwrap() else {
        panic!("expected a listing");
    };
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "open");

    h.run(host, "lobby", "chat", json!({ "lobby_id": listed[0].id, "message": "hello" }))
        .await
        .unwrap();
    let chats: Vec<Envelope> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.notification.name() == "lobby_chat")
        .collect();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].audience, vec![host]);
}
