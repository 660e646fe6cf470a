use std::sync::{Arc, Mutex};

use replica_client::world::MirrorWorld;
use replica_shared::event::SessionEvent;
use replica_shared::identity::{EntityHandle, EntityKind, NetId};
use replica_shared::item::{ItemOutcome, ItemUpdate};
use replica_shared::math::{Quat, Vec3};
use replica_shared::net::MemoryNetwork;
use replica_shared::tracked::{ReplicatedField, TrackedField};
use replica_shared::trainset::{BogieState, KinematicState, RigidBodySnapshot, VehicleState};
use replica_tests::*;

type Cell = Arc<Mutex<u32>>;

fn fuel_field(cell: &Cell) -> Box<dyn ReplicatedField> {
    let (r, w) = (cell.clone(), cell.clone());
    Box::new(TrackedField::new(
        "fuel",
        move || *r.lock().unwrap(),
        move |v| *w.lock().unwrap() = v,
    ))
}

/// Mirror world whose spawned entities all share one fuel cell.
fn fuel_world() -> (Cell, MirrorWorld) {
    let cell: Cell = Arc::new(Mutex::new(0));
    let shared = cell.clone();
    let world = MirrorWorld::with_fields(move |_, _, _| vec![fuel_field(&shared)]);
    (cell, world)
}

fn rolling(speed: f32) -> VehicleState {
    VehicleState {
        active: true,
        stationary: false,
        derailed: false,
        kinematics: KinematicState {
            speed,
            brake_stress: 0.0,
            bogies: [
                BogieState {
                    track: Some(NetId(700)),
                    position_along_track: 20.0,
                    direction: 1,
                },
                BogieState {
                    track: Some(NetId(700)),
                    position_along_track: 12.0,
                    direction: 1,
                },
            ],
        },
        rigid_body: RigidBodySnapshot::default(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spawned_entity_state_follows_the_host() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (ada_fuel, world) = fuel_world();
    let (mut server, mut clients) = joined_with(&net, &mut clock, vec![("Ada", world)]).await?;
    let mut ada = clients.pop().unwrap();

    let host_fuel: Cell = Arc::new(Mutex::new(75));
    let id = server.session_mut().spawn_entity(
        EntityHandle::new(EntityKind::Car, 1),
        Some("L-001"),
        vec![fuel_field(&host_fuel)],
        clock.now,
    )?;
    server.flush().await?;
    clock.run(&mut server, &mut [&mut ada], 2).await?;

    assert_eq!(*ada_fuel.lock().unwrap(), 75);
    assert_eq!(ada.session().world().entity(id).unwrap().game_id, "L-001");
    assert!(ada.session().resolve_local_handle(id).is_some());

    *host_fuel.lock().unwrap() = 60;
    clock.run(&mut server, &mut [&mut ada], 2).await?;
    assert_eq!(*ada_fuel.lock().unwrap(), 60);

    assert!(server.session_mut().despawn_entity(id, clock.now));
    server.flush().await?;
    clock.run(&mut server, &mut [&mut ada], 2).await?;
    assert!(ada.session().resolve_local_handle(id).is_none());
    assert_eq!(ada.session().world().entity_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn owner_writes_are_relayed_and_others_are_rejected() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (ada_fuel, ada_world) = fuel_world();
    let (grace_fuel, grace_world) = fuel_world();
    let (mut server, mut clients) =
        joined_with(&net, &mut clock, vec![("Ada", ada_world), ("Grace", grace_world)]).await?;
    let mut grace = clients.pop().unwrap();
    let mut ada = clients.pop().unwrap();

    let host_fuel: Cell = Arc::new(Mutex::new(50));
    let id = server.session_mut().spawn_entity(
        EntityHandle::new(EntityKind::Car, 1),
        None,
        vec![fuel_field(&host_fuel)],
        clock.now,
    )?;
    let ada_id = ada.session().player_id().unwrap();
    assert_eq!(server.session_mut().grant_ownership(ada_id, id), None);
    server.flush().await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 2).await?;

    *ada_fuel.lock().unwrap() = 42;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    assert_eq!(*host_fuel.lock().unwrap(), 42);
    assert_eq!(*grace_fuel.lock().unwrap(), 42);

    *grace_fuel.lock().unwrap() = 7;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    assert_eq!(*host_fuel.lock().unwrap(), 42);
    assert_eq!(*ada_fuel.lock().unwrap(), 42);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn moving_trainset_reaches_client_cars() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada"]).await?;
    let mut ada = clients.pop().unwrap();

    let (set, front, back) = (NetId(800), NetId(900), NetId(901));
    let world = server.session_mut().world_mut();
    world.add_car(front, rolling(8.0));
    world.add_car(back, rolling(8.0));
    world.couple(set, vec![front, back]);
    clock.run(&mut server, &mut [&mut ada], 3).await?;

    assert_eq!(ada.session().trainsets().members(set), Some(&[front, back][..]));
    let first = *ada.session().world().car(front).unwrap();
    assert_eq!(first.kinematics.unwrap().speed, 8.0);

    clock.run(&mut server, &mut [&mut ada], 3).await?;
    let later = *ada.session().world().car(front).unwrap();
    assert!(later.tick > first.tick);
    let (was, now) = (first.kinematics.unwrap(), later.kinematics.unwrap());
    assert!(now.bogies[0].position_along_track > was.bogies[0].position_along_track);
    assert!(ada.session().world().car(back).is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn items_replicate_both_ways_for_owners() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada", "Grace"]).await?;
    let mut grace = clients.pop().unwrap();
    let mut ada = clients.pop().unwrap();

    let lantern = server
        .session_mut()
        .register_entity(EntityHandle::new(EntityKind::Item, 1), Some("lantern"))?;
    let created = ItemUpdate::create(lantern, "Lantern", Vec3::new(1.0, 0.0, 2.0), Quat::IDENTITY);
    assert_eq!(server.session_mut().queue_item(created), ItemOutcome::Created);
    clock.run(&mut server, &mut [&mut ada, &mut grace], 2).await?;
    assert_eq!(grace.session().items().get(lantern).unwrap().prefab, "Lantern");

    let ada_id = ada.session().player_id().unwrap();
    server.session_mut().grant_ownership(ada_id, lantern);
    let picked = ItemUpdate::change(lantern).equipped(ada_id, true);
    assert_eq!(ada.session_mut().queue_item(picked), ItemOutcome::Updated);
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    assert_eq!(server.session().items().get(lantern).unwrap().holder, Some((ada_id, true)));
    assert_eq!(grace.session().items().get(lantern).unwrap().holder, Some((ada_id, true)));

    // Grace does not own the lantern.
    let grace_id = grace.session().player_id().unwrap();
    grace.session_mut().queue_item(ItemUpdate::change(lantern).equipped(grace_id, true));
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    assert_eq!(server.session().items().get(lantern).unwrap().holder, Some((ada_id, true)));

    assert_eq!(server.session_mut().queue_item(ItemUpdate::destroy(lantern)), ItemOutcome::Destroyed);
    clock.run(&mut server, &mut [&mut ada, &mut grace], 2).await?;
    assert!(ada.session().items().get(lantern).is_none());
    assert!(grace.session().items().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_is_relayed_to_other_players() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada", "Grace"]).await?;
    let mut grace = clients.pop().unwrap();
    let mut ada = clients.pop().unwrap();
    ada.drain_events();
    grace.drain_events();

    ada.session_mut().send_chat("coupling at B3", clock.now);
    ada.session_mut().send_chat("/w Grace brakes on", clock.now);
    ada.flush().await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;

    let chat = |events: Vec<SessionEvent>| -> Vec<String> {
        events
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Chat { text } => Some(text),
                _ => None,
            })
            .collect()
    };
    let heard = chat(grace.drain_events());
    assert_eq!(heard.len(), 2);
    assert!(heard[0].contains("Ada:") && heard[0].contains("coupling at B3"));
    assert!(heard[1].starts_with("<i>") && heard[1].contains("brakes on"));
    assert!(chat(ada.drain_events()).is_empty());
    assert!(chat(server.drain_events()).iter().any(|t| t.contains("coupling at B3")));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_receives_the_whole_world() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada"]).await?;
    let mut ada = clients.pop().unwrap();

    let host_fuel: Cell = Arc::new(Mutex::new(31));
    let car = server.session_mut().spawn_entity(
        EntityHandle::new(EntityKind::Car, 1),
        Some("L-009"),
        vec![fuel_field(&host_fuel)],
        clock.now,
    )?;
    let lamp = server
        .session_mut()
        .register_entity(EntityHandle::new(EntityKind::Item, 2), None)?;
    server
        .session_mut()
        .queue_item(ItemUpdate::create(lamp, "Lamp", Vec3::ZERO, Quat::IDENTITY));
    let world = server.session_mut().world_mut();
    world.add_car(NetId(900), rolling(4.0));
    world.couple(NetId(800), vec![NetId(900)]);
    server.flush().await?;
    clock.run(&mut server, &mut [&mut ada], 3).await?;

    let (late_fuel, late_world) = fuel_world();
    let addr = server.local_addr()?;
    let mut late = memory_client(&net, client_config(addr, "Grace"), late_world, clock.now)?;
    late.start_at(clock.now).await?;
    clock.run(&mut server, &mut [&mut ada, &mut late], 6).await?;

    let session = late.session();
    assert_eq!(session.registry().resolve_game_id("L-009"), Some(car));
    assert_eq!(*late_fuel.lock().unwrap(), 31);
    assert_eq!(session.items().get(lamp).unwrap().prefab, "Lamp");
    assert_eq!(session.trainsets().members(NetId(800)), Some(&[NetId(900)][..]));
    assert!(session.world().car(NetId(900)).is_some());
    assert!(session.players().any(|p| p.username == "Ada"));
    Ok(())
}
