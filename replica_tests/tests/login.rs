use replica_client::session::ClientState;
use replica_client::world::MirrorWorld;
use replica_shared::event::SessionEvent;
use replica_shared::login::LoginDenied;
use replica_shared::net::MemoryNetwork;
use replica_tests::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn version_mismatch_is_denied_and_never_ready() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let mut server = memory_server(&net, |_| {})?;
    let mut cfg = client_config(server.local_addr()?, "Ada");
    cfg.build_version = "10".into();
    let mut client = memory_client(&net, cfg, MirrorWorld::new(), clock.now)?;
    client.start_at(clock.now).await?;

    clock.run(&mut server, &mut [&mut client], 12).await?;
    client.session_mut().mark_loaded(clock.now);

    let events = client.drain_events();
    assert!(events.contains(&SessionEvent::LoginDenied(LoginDenied::VersionMismatch {
        expected: HOST_BUILD.into(),
        got: "10".into(),
    })));
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(server.session().peer_count(), 0);
    assert_eq!(server.session().roster().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_password_is_denied() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let mut server = memory_server(&net, |cfg| cfg.password = "yard".into())?;
    let addr = server.local_addr()?;

    let mut wrong = memory_client(&net, client_config(addr, "Ada"), MirrorWorld::new(), clock.now)?;
    let mut cfg = client_config(addr, "Grace");
    cfg.password = "yard".into();
    let mut right = memory_client(&net, cfg, MirrorWorld::new(), clock.now)?;
    wrong.start_at(clock.now).await?;
    right.start_at(clock.now).await?;

    clock.run(&mut server, &mut [&mut wrong, &mut right], 12).await?;

    assert!(wrong
        .drain_events()
        .contains(&SessionEvent::LoginDenied(LoginDenied::InvalidPassword)));
    assert_eq!(wrong.state(), ClientState::Disconnected);
    assert_eq!(right.state(), ClientState::Connected);
    assert_eq!(right.session().player_id(), Some(1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_server_turns_away_extra_players() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    // The host takes one of the two slots.
    let mut server = memory_server(&net, |cfg| cfg.max_players = 2)?;
    let addr = server.local_addr()?;

    let mut first = memory_client(&net, client_config(addr, "Ada"), MirrorWorld::new(), clock.now)?;
    first.start_at(clock.now).await?;
    clock.run(&mut server, &mut [&mut first], 6).await?;
    assert_eq!(first.state(), ClientState::Connected);

    let mut second = memory_client(&net, client_config(addr, "Grace"), MirrorWorld::new(), clock.now)?;
    second.start_at(clock.now).await?;
    clock.run(&mut server, &mut [&mut first, &mut second], 6).await?;

    assert!(second
        .drain_events()
        .contains(&SessionEvent::LoginDenied(LoginDenied::ServerFull { max_players: 2 })));
    assert_eq!(second.state(), ClientState::Disconnected);
    assert_eq!(server.session().peer_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn players_see_each_other_and_leave_cleanly() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada", "Grace"]).await?;
    let mut grace = clients.pop().unwrap();
    let mut ada = clients.pop().unwrap();
    clock.run(&mut server, &mut [&mut ada, &mut grace], 4).await?;

    let names: Vec<&str> = ada.session().players().map(|p| p.username.as_str()).collect();
    assert!(names.contains(&"Host"));
    assert!(names.contains(&"Grace"));

    let grace_id = grace.session().player_id().unwrap();
    grace.session_mut().disconnect(clock.now);
    grace.flush().await?;
    clock.run(&mut server, &mut [&mut ada], 4).await?;

    assert!(ada.session().player(grace_id).is_none());
    assert!(server.session().roster().get(grace_id).is_none());
    assert!(server
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::PlayerLeft { player } if *player == grace_id)));
    Ok(())
}
