use replica_shared::event::SessionEvent;
use replica_shared::identity::{EntityHandle, EntityKind, NetId};
use replica_shared::job::{JobData, JobDenial, JobState, StationsChain, ValidationKind, ValidationOutcome};
use replica_shared::net::MemoryNetwork;
use replica_shared::task::{Task, TaskCommon, TransportTask, WarehouseKind, WarehouseTask};
use replica_tests::*;

fn shunting_job(game_id: &str) -> JobData {
    let load = |machine: &str| {
        Task::Warehouse(WarehouseTask {
            cars: vec![NetId(900), NetId(901)],
            kind: WarehouseKind::Loading,
            machine: machine.to_string(),
            cargo: 3,
            amount: 60.0,
            ..Default::default()
        })
    };
    let haul = Task::Transport(TransportTask {
        cars: vec![NetId(900), NetId(901)],
        starting_track: "SM-A1".into(),
        destination_track: "FF-B3".into(),
        coupling_required: true,
        ..Default::default()
    });
    JobData {
        game_id: game_id.to_string(),
        job_type: 1,
        tasks: vec![Task::Sequential {
            common: TaskCommon::default(),
            tasks: vec![load("WM-A"), load("WM-B"), haul],
            current: Some(1),
        }],
        chain: StationsChain {
            origin: "SM".into(),
            destination: "FF".into(),
        },
        initial_wage: 4200.0,
        time_limit: 1800.0,
        ..Default::default()
    }
}

async fn offer(
    server: &mut MemServer,
    now: std::time::Instant,
    game_ids: &[&str],
) -> anyhow::Result<(NetId, Vec<NetId>)> {
    let session = server.session_mut();
    let station = session.register_entity(EntityHandle::new(EntityKind::Station, 1), Some("SM"))?;
    let jobs = game_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (EntityHandle::new(EntityKind::Job, 100 + i as u64), shunting_job(id)))
        .collect();
    let ids = session.offer_jobs(station, jobs, now)?;
    server.flush().await?;
    Ok((station, ids))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offered_jobs_reach_clients_with_task_trees() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada"]).await?;
    let mut ada = clients.pop().unwrap();

    let (station, ids) = offer(&mut server, clock.now, &["SM-SU-01", "SM-SL-02"]).await?;
    clock.run(&mut server, &mut [&mut ada], 4).await?;

    let jobs = ada.session().jobs();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs.station_of(ids[0]), Some(station));
    let job = jobs.get(ids[0]).unwrap();
    assert_eq!(job.game_id, "SM-SU-01");
    assert_eq!(job.state, JobState::Available);
    assert_eq!(job.chain.destination, "FF");
    assert_eq!(job.tasks, shunting_job("SM-SU-01").tasks);
    let Some(Task::Warehouse(current)) = job.tasks[0].current_task() else {
        panic!("cursor lost: {:?}", job.tasks[0]);
    };
    assert_eq!(current.machine, "WM-B");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_one_player_can_take_a_job() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada", "Grace"]).await?;
    let mut grace = clients.pop().unwrap();
    let mut ada = clients.pop().unwrap();
    let (_, ids) = offer(&mut server, clock.now, &["SM-SU-01"]).await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 2).await?;
    ada.drain_events();
    grace.drain_events();

    let job = ids[0];
    ada.session_mut().request_take(job, clock.now);
    ada.flush().await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    grace.session_mut().request_take(job, clock.now);
    grace.flush().await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;

    assert!(ada
        .drain_events()
        .contains(&SessionEvent::JobTakeAnswered { job, granted: true }));
    assert!(grace
        .drain_events()
        .contains(&SessionEvent::JobTakeAnswered { job, granted: false }));
    let ada_id = ada.session().player_id().unwrap();
    assert_eq!(server.session().jobs().owner_of(job), Some(ada_id));
    assert_eq!(grace.session().jobs().get(job).unwrap().state, JobState::InProgress);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn booklet_validation_completes_owned_job() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada", "Grace"]).await?;
    let mut grace = clients.pop().unwrap();
    let mut ada = clients.pop().unwrap();
    let (station, ids) = offer(&mut server, clock.now, &["SM-SU-01"]).await?;
    let job = ids[0];
    clock.run(&mut server, &mut [&mut ada, &mut grace], 2).await?;

    // Handing in the overview takes the job.
    assert!(ada.session_mut().request_validation(job, ValidationKind::Overview, clock.now));
    ada.flush().await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    assert!(ada.drain_events().contains(&SessionEvent::JobValidated {
        job,
        outcome: ValidationOutcome::Approved,
    }));

    // Someone else's booklet is refused.
    assert!(grace.session_mut().request_validation(job, ValidationKind::Booklet, clock.now));
    grace.flush().await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    assert!(grace.drain_events().contains(&SessionEvent::JobValidated {
        job,
        outcome: ValidationOutcome::Denied(JobDenial::NotOwner),
    }));

    assert!(ada.session_mut().request_validation(job, ValidationKind::Booklet, clock.now));
    ada.flush().await?;
    clock.run(&mut server, &mut [&mut ada, &mut grace], 3).await?;
    assert!(ada.drain_events().contains(&SessionEvent::JobValidated {
        job,
        outcome: ValidationOutcome::Approved,
    }));

    assert_eq!(server.session().jobs().get(job).unwrap().state, JobState::Completed);
    for client in [&ada, &grace] {
        assert_eq!(client.session().jobs().get(job).unwrap().state, JobState::Completed);
        assert_eq!(client.session().jobs().station_of(job), Some(station));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_jobs_disappear_and_late_joiners_get_the_board() -> anyhow::Result<()> {
    init_tracing();
    let net = MemoryNetwork::new();
    let mut clock = SimClock::new(24);
    let (mut server, mut clients) = joined_session(&net, &mut clock, &["Ada"]).await?;
    let mut ada = clients.pop().unwrap();
    let (_, ids) = offer(&mut server, clock.now, &["SM-SU-01", "SM-SL-02"]).await?;
    clock.run(&mut server, &mut [&mut ada], 2).await?;

    assert!(server.session_mut().remove_job(ids[0]).is_some());
    clock.run(&mut server, &mut [&mut ada], 2).await?;
    assert!(ada.session().jobs().get(ids[0]).is_none());
    assert_eq!(ada.session().jobs().len(), 1);

    let addr = server.local_addr()?;
    let mut late = memory_client(&net, client_config(addr, "Grace"), Default::default(), clock.now)?;
    late.start_at(clock.now).await?;
    clock.run(&mut server, &mut [&mut ada, &mut late], 6).await?;
    let jobs = late.session().jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs.get(ids[1]).unwrap().game_id, "SM-SL-02");
    Ok(())
}
