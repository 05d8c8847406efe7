mod support;

use std::time::Duration;

use courier_core::{CampaignId, CompanyId, ContactId, DomainError};
use courier_dispatch::campaign::{CampaignJob, DispatchCampaign, PrepareContact, ProcessCampaign, VerifyCampaigns};
use courier_dispatch::coalesce::campaign_event;
use courier_dispatch::model::{CampaignStatus, NewShipping};
use courier_dispatch::ports::{CampaignStore, OutboundContent};
use courier_dispatch::{DispatchOutcome, PipelineError, PrepareOutcome, ProcessOutcome};
use courier_queue::{JobContext, JobError, JobHandler, JobId, JobState, QueueDefinition, WorkerOptions};

use support::harness;

fn prepare_job(campaign_id: CampaignId, contact_id: ContactId) -> PrepareContact {
    PrepareContact {
        contact_id,
        campaign_id,
        delay: 5_000,
        variables: Vec::new(),
    }
}

fn dispatches(jobs: Vec<CampaignJob>) -> Vec<DispatchCampaign> {
    jobs.into_iter()
        .filter_map(|job| match job {
            CampaignJob::DispatchCampaign(d) => Some(d),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn three_contact_campaign_runs_to_completion() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::Programada, 3);

    assert_eq!(pipeline.verify_campaigns().await.unwrap(), 1);
    let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::EmAndamento);

    let process: Vec<ProcessCampaign> = h
        .pending::<CampaignJob>()
        .await
        .into_iter()
        .filter_map(|job| match job {
            CampaignJob::ProcessCampaign(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(process.len(), 1);
    assert!((1_000..=5_000).contains(&process[0].delay));

    assert_eq!(
        pipeline.process_campaign(process[0].clone()).await.unwrap(),
        ProcessOutcome::Enqueued(3)
    );
    let prepares: Vec<PrepareContact> = h
        .pending::<CampaignJob>()
        .await
        .into_iter()
        .filter_map(|job| match job {
            CampaignJob::PrepareContact(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(prepares.len(), 3);
    assert!(prepares.iter().all(|p| p.delay == 5_000));

    for prepare in prepares {
        assert!(matches!(pipeline.prepare_contact(prepare).await.unwrap(), PrepareOutcome::Queued(_)));
    }
    assert_eq!(h.store.shippings(campaign.id).unwrap().len(), 3);

    let jobs = dispatches(h.pending::<CampaignJob>().await);
    assert_eq!(jobs.len(), 3);
    for job in jobs {
        assert_eq!(
            pipeline.dispatch(job).await.unwrap(),
            DispatchOutcome::Delivered { failed_sends: 0 }
        );
    }

    let finished = h.store.campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(finished.status, CampaignStatus::Finalizada);
    assert_eq!(finished.completed_at, Some(h.clock_now()));

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 3);
    for contact in &contacts {
        let expected = format!("Olá {}", contact.first_name());
        assert!(sent
            .iter()
            .any(|m| m.destination == contact.number && m.content == OutboundContent::Text(expected.clone())));
    }

    h.services.coalescer.flush_now().await;
    let events = h.notifier.events();
    let last = events
        .iter()
        .rev()
        .find(|(event, _)| *event == campaign_event(h.company))
        .expect("campaign update emitted");
    assert_eq!(last.1["action"], "update");
    assert_eq!(last.1["record"]["status"], "FINALIZADA");
}

#[tokio::test]
async fn campaign_runs_through_workers() {
    let h = harness().await;
    let fast = WorkerOptions::default()
        .with_concurrency(4)
        .with_poll_interval(Duration::from_millis(10));
    h.manager
        .define(QueueDefinition::new(courier_dispatch::campaign::CAMPAIGN_QUEUE).with_worker(fast));
    let services = courier_dispatch::setup::build(
        &h.manager,
        courier_dispatch::Ports {
            campaigns: h.store.clone(),
            schedules: h.store.clone(),
            settings: h.store.clone(),
            connections: h.store.clone(),
            conversations: h.store.clone(),
            transport: h.transport.clone(),
            notifier: h.notifier.clone(),
            clock: h.clock.clone(),
        },
        courier_dispatch::PipelineConfig {
            process_jitter: (Duration::ZERO, Duration::ZERO),
            ..support::test_config()
        },
    );
    h.store
        .set_settings(
            h.company,
            courier_dispatch::model::CampaignSettings {
                message_interval: Duration::ZERO,
                ..Default::default()
            },
        )
        .unwrap();
    let (campaign, _) = h.campaign(CampaignStatus::Programada, 3);

    assert!(h.manager.start_worker::<CampaignJob, _>(services.campaigns.clone()));
    h.manager
        .queue::<CampaignJob>()
        .add(&CampaignJob::VerifyCampaigns(VerifyCampaigns {}))
        .await
        .unwrap();

    let mut finished = false;
    for _ in 0..300 {
        let status = h.store.campaign(campaign.id).await.unwrap().unwrap().status;
        if status == CampaignStatus::Finalizada {
            finished = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(finished, "campaign did not finish");
    assert_eq!(h.transport.sent().len(), 3);
    h.manager.shutdown_workers(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_prepares_create_one_row_and_one_dispatch() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 1);
    let job = prepare_job(campaign.id, contacts[0].id);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let pipeline = pipeline.clone();
        let job = job.clone();
        tasks.spawn(async move { pipeline.prepare_contact(job).await });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    let rows = h.store.shippings(campaign.id).unwrap();
    assert_eq!(rows.len(), 1);
    let jobs = dispatches(h.pending::<CampaignJob>().await);
    assert_eq!(jobs.len(), 1);
    assert_eq!(rows[0].job_id.as_deref(), Some(jobs[0].job_id().as_str()));
}

#[tokio::test]
async fn re_preparing_a_queued_row_is_a_no_op() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 1);
    let job = prepare_job(campaign.id, contacts[0].id);

    assert!(matches!(pipeline.prepare_contact(job.clone()).await.unwrap(), PrepareOutcome::Queued(_)));
    assert_eq!(pipeline.prepare_contact(job).await.unwrap(), PrepareOutcome::AlreadyQueued);
    assert_eq!(dispatches(h.pending::<CampaignJob>().await).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn campaign_finishes_exactly_once() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 5);

    for contact in &contacts {
        let (row, _) = h
            .store
            .find_or_create_shipping(NewShipping {
                campaign_id: campaign.id,
                contact_id: contact.id,
                number: contact.number.clone(),
                message: "m".into(),
                confirmation_message: None,
                confirmation: false,
            })
            .await
            .unwrap();
        h.store.mark_delivered(row.id, h.clock_now()).await.unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let pipeline = pipeline.clone();
        tasks.spawn(async move { pipeline.check_completion(campaign.id).await });
    }
    let mut transitions = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap().unwrap() {
            transitions += 1;
        }
    }

    assert_eq!(transitions, 1);
    let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Finalizada);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn unknown_destination_is_settled_without_a_send() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 1);
    h.transport.mark_missing(contacts[0].number.clone());

    pipeline
        .prepare_contact(prepare_job(campaign.id, contacts[0].id))
        .await
        .unwrap();
    let job = dispatches(h.pending::<CampaignJob>().await).remove(0);
    assert_eq!(pipeline.dispatch(job).await.unwrap(), DispatchOutcome::NotOnNetwork);

    let row = &h.store.shippings(campaign.id).unwrap()[0];
    assert!(row.delivered_at.is_some());
    assert!(h.transport.sent().is_empty());
    let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Finalizada);
}

#[tokio::test]
async fn rejected_send_still_counts_as_delivered() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 1);
    h.transport.mark_rejecting(contacts[0].number.clone());

    pipeline
        .prepare_contact(prepare_job(campaign.id, contacts[0].id))
        .await
        .unwrap();
    let job = dispatches(h.pending::<CampaignJob>().await).remove(0);
    assert_eq!(
        pipeline.dispatch(job).await.unwrap(),
        DispatchOutcome::Delivered { failed_sends: 1 }
    );
    assert!(h.store.shippings(campaign.id).unwrap()[0].delivered_at.is_some());
}

#[tokio::test]
async fn transport_outage_during_existence_check_is_retried() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 1);
    pipeline
        .prepare_contact(prepare_job(campaign.id, contacts[0].id))
        .await
        .unwrap();
    let job = dispatches(h.pending::<CampaignJob>().await).remove(0);

    h.transport.set_unavailable(true);
    let err = pipeline.dispatch(job.clone()).await.unwrap_err();
    assert!(matches!(err, PipelineError::Transport(_)));
    assert!(h.store.shippings(campaign.id).unwrap()[0].delivered_at.is_none());

    h.transport.set_unavailable(false);
    assert_eq!(
        pipeline.dispatch(job).await.unwrap(),
        DispatchOutcome::Delivered { failed_sends: 0 }
    );
}

#[tokio::test]
async fn missing_contact_is_skipped() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, _) = h.campaign(CampaignStatus::EmAndamento, 1);

    let outcome = pipeline
        .prepare_contact(prepare_job(campaign.id, ContactId::new()))
        .await
        .unwrap();
    assert_eq!(outcome, PrepareOutcome::Skipped);
    assert!(h.store.shippings(campaign.id).unwrap().is_empty());
}

#[tokio::test]
async fn pause_resume_and_cancel_adjust_queued_jobs() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let control = h.services.control.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 2);
    for contact in &contacts {
        pipeline
            .prepare_contact(prepare_job(campaign.id, contact.id))
            .await
            .unwrap();
    }
    let queue = h.manager.queue::<CampaignJob>();

    assert_eq!(control.pause(campaign.id).await.unwrap(), 2);
    let status = h.store.campaign(campaign.id).await.unwrap().unwrap().status;
    assert_eq!(status, CampaignStatus::Pausada);
    for (record, _) in queue.pending(100).await.unwrap() {
        assert_eq!(record.state, JobState::Delayed);
        assert!(record.run_at >= h.clock_now() + chrono::Duration::hours(23));
    }

    // A dispatch that lands while paused defers itself.
    let job = dispatches(h.pending::<CampaignJob>().await).remove(0);
    let ctx = JobContext {
        id: JobId::custom(job.job_id()),
        queue: "campaign".into(),
        name: "DispatchCampaign".into(),
        attempts_made: 0,
        max_attempts: 5,
    };
    let err = pipeline
        .handle(CampaignJob::DispatchCampaign(job), ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Deferred(d) if d == Duration::from_secs(24 * 60 * 60)));

    assert_eq!(control.resume(campaign.id).await.unwrap(), 2);
    for (record, _) in queue.pending(100).await.unwrap() {
        assert_eq!(record.state, JobState::Waiting);
    }

    assert_eq!(control.cancel(campaign.id).await.unwrap(), 2);
    assert!(queue.pending(100).await.unwrap().is_empty());
    let status = h.store.campaign(campaign.id).await.unwrap().unwrap().status;
    assert_eq!(status, CampaignStatus::Cancelada);

    let err = control.pause(campaign.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::Domain(DomainError::InvalidTransition { .. })));

    // The cache was invalidated, so new prepares see the cancellation.
    let outcome = pipeline
        .prepare_contact(prepare_job(campaign.id, contacts[0].id))
        .await
        .unwrap();
    assert_eq!(outcome, PrepareOutcome::Skipped);
}

#[tokio::test]
async fn pause_during_fan_out_defers_until_resumed() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let control = h.services.control.clone();
    let (campaign, _) = h.campaign(CampaignStatus::EmAndamento, 3);
    let process = ProcessCampaign {
        id: campaign.id,
        delay: 0,
    };
    let ctx = || JobContext {
        id: JobId::custom("process-1"),
        queue: "campaign".into(),
        name: "ProcessCampaign".into(),
        attempts_made: 0,
        max_attempts: 5,
    };

    // The job was already claimed when the pause landed, so the pause had nothing to delay.
    assert_eq!(control.pause(campaign.id).await.unwrap(), 0);
    let err = pipeline
        .handle(CampaignJob::ProcessCampaign(process.clone()), ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Deferred(d) if d == Duration::from_secs(24 * 60 * 60)));
    assert!(h.pending::<CampaignJob>().await.is_empty());

    control.resume(campaign.id).await.unwrap();
    pipeline
        .handle(CampaignJob::ProcessCampaign(process), ctx())
        .await
        .unwrap();
    let prepares = h
        .pending::<CampaignJob>()
        .await
        .into_iter()
        .filter(|job| matches!(job, CampaignJob::PrepareContact(_)))
        .count();
    assert_eq!(prepares, 3);
    let status = h.store.campaign(campaign.id).await.unwrap().unwrap().status;
    assert_eq!(status, CampaignStatus::EmAndamento);
}

#[tokio::test]
async fn paused_campaign_is_deferred_through_the_worker() {
    let h = harness().await;
    let fast = WorkerOptions::default().with_poll_interval(Duration::from_millis(10));
    h.manager
        .define(QueueDefinition::new(courier_dispatch::campaign::CAMPAIGN_QUEUE).with_worker(fast));
    let (campaign, _) = h.campaign(CampaignStatus::EmAndamento, 2);
    let queue = h.manager.queue::<CampaignJob>();
    let job_id = queue
        .add(&CampaignJob::ProcessCampaign(ProcessCampaign {
            id: campaign.id,
            delay: 0,
        }))
        .await
        .unwrap();
    h.services.control.pause(campaign.id).await.unwrap();
    // Racing the pause: the job is claimable again as if it had been picked up first.
    queue.move_to_waiting(&job_id).await.unwrap();

    assert!(h.manager.start_worker::<CampaignJob, _>(h.services.campaigns.clone()));
    let mut parked = None;
    for _ in 0..200 {
        let record = queue.get(&job_id).await.unwrap().unwrap();
        if record.state == JobState::Delayed {
            parked = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.manager.shutdown_workers(Duration::from_secs(1)).await;

    let record = parked.expect("process job parked while paused");
    assert!(record.run_at >= h.clock_now() + chrono::Duration::hours(23));
    assert!(
        !h.pending::<CampaignJob>()
            .await
            .iter()
            .any(|job| matches!(job, CampaignJob::PrepareContact(_)))
    );
}

#[tokio::test]
async fn campaign_without_contacts_finishes_when_processed() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, _) = h.campaign(CampaignStatus::EmAndamento, 0);

    let outcome = pipeline
        .process_campaign(ProcessCampaign {
            id: campaign.id,
            delay: 0,
        })
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Enqueued(0));
    let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Finalizada);
    assert_eq!(stored.completed_at, Some(h.clock_now()));
    assert!(!pipeline.check_completion(campaign.id).await.unwrap());
}

#[tokio::test]
async fn confirmation_precedes_the_main_message() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let control = h.services.control.clone();

    let mut campaign = courier_dispatch::model::Campaign::new(h.company, "confirm");
    campaign.status = CampaignStatus::EmAndamento;
    campaign.messages = vec!["Main".into()];
    campaign.confirmation = true;
    campaign.confirmation_messages = vec!["Confirma, {name}?".into()];
    let contact = courier_dispatch::model::Contact::new("Ana Lima", "5511999990000");
    h.store.add_campaign(campaign.clone(), vec![contact.clone()]).unwrap();

    pipeline
        .prepare_contact(prepare_job(campaign.id, contact.id))
        .await
        .unwrap();
    let job = dispatches(h.pending::<CampaignJob>().await).remove(0);

    assert_eq!(pipeline.dispatch(job.clone()).await.unwrap(), DispatchOutcome::ConfirmationRequested);
    assert_eq!(
        h.transport.sent()[0].content,
        OutboundContent::Text("Confirma, Ana Lima?".into())
    );
    assert_eq!(pipeline.dispatch(job.clone()).await.unwrap(), DispatchOutcome::AwaitingConfirmation);
    assert_eq!(
        pipeline
            .prepare_contact(prepare_job(campaign.id, contact.id))
            .await
            .unwrap(),
        PrepareOutcome::Settled
    );

    let row = h.store.shippings(campaign.id).unwrap().remove(0);
    let queued = control.confirm_shipping(row.id).await.unwrap();
    assert_eq!(queued, Some(JobId::custom(job.job_id())));

    assert_eq!(
        pipeline.dispatch(job).await.unwrap(),
        DispatchOutcome::Delivered { failed_sends: 0 }
    );
    assert_eq!(h.transport.sent().len(), 2);
    assert_eq!(h.transport.sent()[1].content, OutboundContent::Text("Main".into()));
    let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Finalizada);
}

#[tokio::test]
async fn open_ticket_opens_one_conversation_per_contact() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let mut campaign = courier_dispatch::model::Campaign::new(h.company, "tickets");
    campaign.status = CampaignStatus::EmAndamento;
    campaign.messages = vec!["hello".into()];
    campaign.open_ticket = true;
    let contacts: Vec<_> = (0..2)
        .map(|i| courier_dispatch::model::Contact::new(format!("C{i}"), format!("55{i}")))
        .collect();
    h.store.add_campaign(campaign.clone(), contacts.clone()).unwrap();

    for contact in &contacts {
        pipeline
            .prepare_contact(prepare_job(campaign.id, contact.id))
            .await
            .unwrap();
    }
    for job in dispatches(h.pending::<CampaignJob>().await) {
        pipeline.dispatch(job.clone()).await.unwrap();
        assert_eq!(pipeline.dispatch(job).await.unwrap(), DispatchOutcome::AlreadyDelivered);
    }
    assert_eq!(h.store.conversation_count().unwrap(), 2);
}

#[tokio::test]
async fn dispatch_without_any_connection_fails_for_retry() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let mut campaign = courier_dispatch::model::Campaign::new(CompanyId::new(), "orphan");
    campaign.status = CampaignStatus::EmAndamento;
    campaign.messages = vec!["x".into()];
    let contact = courier_dispatch::model::Contact::new("A", "1");
    h.store.add_campaign(campaign.clone(), vec![contact.clone()]).unwrap();

    pipeline
        .prepare_contact(prepare_job(campaign.id, contact.id))
        .await
        .unwrap();
    let job = dispatches(h.pending::<CampaignJob>().await).remove(0);
    let err = pipeline.dispatch(job).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoConnection(_)));
    assert!(matches!(JobError::from(err), JobError::Failed(_)));
}

#[tokio::test]
async fn cached_campaign_is_shared_by_stages() {
    let h = harness().await;
    let pipeline = h.services.campaigns.clone();
    let (campaign, contacts) = h.campaign(CampaignStatus::EmAndamento, 2);

    pipeline
        .process_campaign(ProcessCampaign {
            id: campaign.id,
            delay: 0,
        })
        .await
        .unwrap();
    assert_eq!(pipeline.campaign_cache().len(), 1);
    pipeline
        .prepare_contact(prepare_job(campaign.id, contacts[1].id))
        .await
        .unwrap();
    assert!(pipeline.campaign_cache().get(&campaign.id).is_some());
    assert_eq!(pipeline.settings_cache().len(), 1);
}
