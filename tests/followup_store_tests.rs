//! Job store behavior against an in-memory database.

mod test_utils;

use chrono::{Duration, Utc};
use followups::models::connection::ConnectionStatus;
use followups::repositories::followup_job::{
    AttemptRecord, ClaimMode, DispatchFailure, FailureOutcome, ListParams, NewFollowUp,
    ReplyDetails, ReplyListParams, ReplyTarget, StoreError,
};
use test_utils::{Harness, create_resend_connection, followup_to, make_due, reload};
use uuid::Uuid;

fn transient(message: &str) -> DispatchFailure {
    DispatchFailure {
        code: "transient",
        message: message.to_string(),
        retryable: true,
    }
}

#[tokio::test]
async fn enqueue_schedules_after_delay() {
    let h = Harness::new().await.unwrap();
    let user_id = Uuid::new_v4();
    let connection = create_resend_connection(&h.connections, user_id).await.unwrap();

    let before = Utc::now();
    let job = h
        .store
        .enqueue(
            user_id,
            NewFollowUp {
                recipient: "  Bob@Example.COM ".to_string(),
                delay_hours: Some(48),
                ..followup_to("ignored@example.com", connection.id)
            },
        )
        .await
        .unwrap();

    assert_eq!(job.status, "pending");
    assert_eq!(job.recipient, "bob@example.com");
    assert_eq!(job.tone, "professional");
    assert_eq!(job.max_followups, 1);
    assert!(job.stop_on_reply);
    assert_eq!((job.failure_count, job.attempts), (0, 0));
    assert!(job.scheduled_at >= job.created_at + Duration::hours(48));
    assert!(job.scheduled_at.with_timezone(&Utc) >= before + Duration::hours(48));
}

#[tokio::test]
async fn enqueue_rejects_invalid_input() {
    let h = Harness::new().await.unwrap();
    let user_id = Uuid::new_v4();
    let connection = create_resend_connection(&h.connections, user_id).await.unwrap();

    let cases = [
        (
            NewFollowUp {
                recipient: "not-an-email".to_string(),
                ..followup_to("x@example.com", connection.id)
            },
            "recipient",
        ),
        (
            NewFollowUp {
                delay_hours: Some(0),
                ..followup_to("bob@example.com", connection.id)
            },
            "delay_hours",
        ),
        (
            NewFollowUp {
                delay_hours: Some(169),
                ..followup_to("bob@example.com", connection.id)
            },
            "delay_hours",
        ),
        (
            NewFollowUp {
                max_followups: Some(6),
                ..followup_to("bob@example.com", connection.id)
            },
            "max_followups",
        ),
        (
            NewFollowUp {
                tone: Some("sarcastic".to_string()),
                ..followup_to("bob@example.com", connection.id)
            },
            "tone",
        ),
        (
            NewFollowUp {
                original_subject: "   ".to_string(),
                ..followup_to("bob@example.com", connection.id)
            },
            "original_subject",
        ),
    ];

    for (input, expected_field) in cases {
        match h.store.enqueue(user_id, input).await {
            Err(StoreError::Validation { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected validation error on {}, got {:?}", expected_field, other),
        }
    }
}

#[tokio::test]
async fn enqueue_checks_connection_ownership_and_status() {
    let h = Harness::new().await.unwrap();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let connection = create_resend_connection(&h.connections, owner).await.unwrap();

    let err = h
        .store
        .enqueue(stranger, followup_to("bob@example.com", connection.id))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { resource: "Connection" }));

    h.connections
        .set_status(owner, connection.id, ConnectionStatus::Disabled)
        .await
        .unwrap();
    let err = h
        .store
        .enqueue(owner, followup_to("bob@example.com", connection.id))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConnectionInactive { ref status } if status == "disabled"));
}

#[tokio::test]
async fn enqueue_defaults_to_first_active_connection() {
    let h = Harness::new().await.unwrap();
    let user_id = Uuid::new_v4();

    let err = h
        .store
        .enqueue(
            user_id,
            NewFollowUp {
                connection_id: None,
                ..followup_to("bob@example.com", Uuid::nil())
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConnectionInactive { .. }));

    let connection = create_resend_connection(&h.connections, user_id).await.unwrap();
    let job = h
        .store
        .enqueue(
            user_id,
            NewFollowUp {
                connection_id: None,
                ..followup_to("bob@example.com", Uuid::nil())
            },
        )
        .await
        .unwrap();
    assert_eq!(job.connection_id, connection.id);
}

#[tokio::test]
async fn list_due_returns_only_due_unclaimed_jobs_oldest_first() {
    let h = Harness::new().await.unwrap();
    let (user_id, connection, first) = h.due_job("a@example.com").await.unwrap();
    let second = h
        .store
        .enqueue(user_id, followup_to("b@example.com", connection.id))
        .await
        .unwrap();
    let not_due = h
        .store
        .enqueue(user_id, followup_to("c@example.com", connection.id))
        .await
        .unwrap();
    make_due(&h.db, second.id).await.unwrap();

    let due = h.store.list_due(Utc::now(), 10).await.unwrap();
    let ids: Vec<Uuid> = due.iter().map(|job| job.id).collect();
    assert!(ids.contains(&first.id));
    assert!(ids.contains(&second.id));
    assert!(!ids.contains(&not_due.id));

    let claim = h
        .store
        .claim(first.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();
    let due = h.store.list_due(Utc::now(), 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, second.id);

    h.store.mark_sent(&claim, "m-1", Utc::now()).await.unwrap();
    assert_eq!(h.store.list_due(Utc::now(), 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn claim_is_exclusive_and_requires_due_in_due_mode() {
    let h = Harness::new().await.unwrap();
    let user_id = Uuid::new_v4();
    let connection = create_resend_connection(&h.connections, user_id).await.unwrap();
    let job = h
        .store
        .enqueue(user_id, followup_to("bob@example.com", connection.id))
        .await
        .unwrap();

    assert!(
        h.store
            .claim(job.id, Utc::now(), ClaimMode::Due)
            .await
            .unwrap()
            .is_none()
    );

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Immediate)
        .await
        .unwrap()
        .expect("immediate claim ignores schedule");
    assert_eq!(claim.attempt(), 1);
    assert!(
        h.store
            .claim(job.id, Utc::now(), ClaimMode::Immediate)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn mark_sent_is_idempotent() {
    let h = Harness::new().await.unwrap();
    let (_, _, job) = h.due_job("bob@example.com").await.unwrap();

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();
    let sent_at = Utc::now();
    let first = h.store.mark_sent(&claim, "msg-1", sent_at).await.unwrap();
    let second = h.store.mark_sent(&claim, "msg-2", Utc::now()).await.unwrap();

    assert_eq!(first.status, "sent");
    assert_eq!(second.status, "sent");
    assert_eq!(second.provider_message_id.as_deref(), Some("msg-1"));
    assert_eq!(first.sent_at, second.sent_at);
    assert!(second.claim_token.is_none());
}

#[tokio::test]
async fn retry_ladder_reschedules_three_times_then_fails() {
    let h = Harness::new().await.unwrap();
    let (_, _, job) = h.due_job("bob@example.com").await.unwrap();
    let expected_minutes = [1, 5, 15];

    for (index, minutes) in expected_minutes.iter().enumerate() {
        make_due(&h.db, job.id).await.unwrap();
        let claim = h
            .store
            .claim(job.id, Utc::now(), ClaimMode::Due)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.attempt(), index as i32 + 1);

        let before = Utc::now();
        let outcome = h
            .store
            .mark_failed(&claim, &transient("503 from provider"), claim.attempt())
            .await
            .unwrap();
        let FailureOutcome::Rescheduled(updated) = outcome else {
            panic!("attempt {} should reschedule", index + 1);
        };
        assert_eq!(updated.status, "pending");
        assert_eq!(updated.failure_count, index as i32 + 1);
        let delay = updated.scheduled_at.with_timezone(&Utc) - before;
        assert!(delay >= Duration::minutes(*minutes) - Duration::seconds(1));
        assert!(delay <= Duration::minutes(*minutes) + Duration::seconds(5));
    }

    make_due(&h.db, job.id).await.unwrap();
    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();
    let outcome = h
        .store
        .mark_failed(&claim, &transient("503 from provider"), claim.attempt())
        .await
        .unwrap();
    let FailureOutcome::Failed(failed) = outcome else {
        panic!("fourth failure should be terminal");
    };
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.failure_count, 4);
    assert_eq!(
        failed.last_error.as_deref(),
        Some("Max retries exceeded: 503 from provider")
    );
}

#[tokio::test]
async fn non_retryable_failure_is_terminal_immediately() {
    let h = Harness::new().await.unwrap();
    let (_, _, job) = h.due_job("bob@example.com").await.unwrap();
    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();

    let failure = DispatchFailure {
        code: "invalid_recipient",
        message: "mailbox does not exist".to_string(),
        retryable: false,
    };
    let outcome = h.store.mark_failed(&claim, &failure, 1).await.unwrap();
    let failed = outcome.job();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.failure_count, 1);
    assert_eq!(failed.last_error.as_deref(), Some("mailbox does not exist"));
}

#[tokio::test]
async fn cancel_only_from_pending() {
    let h = Harness::new().await.unwrap();
    let (user_id, _, job) = h.due_job("bob@example.com").await.unwrap();

    let stranger = Uuid::new_v4();
    assert!(matches!(
        h.store.cancel(stranger, job.id).await,
        Err(StoreError::NotFound { .. })
    ));

    let cancelled = h.store.cancel(user_id, job.id).await.unwrap();
    assert_eq!(cancelled.status, "cancelled");
    assert!(h.store.list_due(Utc::now(), 10).await.unwrap().is_empty());

    let err = h.store.cancel(user_id, job.id).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { ref status, .. } if status == "cancelled"));
}

#[tokio::test]
async fn send_recorded_after_cancel_during_flight() {
    let h = Harness::new().await.unwrap();
    let (user_id, _, job) = h.due_job("bob@example.com").await.unwrap();

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();
    h.store.cancel(user_id, job.id).await.unwrap();

    let sent = h.store.mark_sent(&claim, "msg-1", Utc::now()).await.unwrap();
    assert_eq!(sent.status, "sent");
    assert_eq!(sent.provider_message_id.as_deref(), Some("msg-1"));
}

#[tokio::test]
async fn failure_after_cancel_keeps_cancelled_status() {
    let h = Harness::new().await.unwrap();
    let (user_id, _, job) = h.due_job("bob@example.com").await.unwrap();

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();
    h.store.cancel(user_id, job.id).await.unwrap();

    let outcome = h
        .store
        .mark_failed(&claim, &transient("timeout"), 1)
        .await
        .unwrap();
    let FailureOutcome::Superseded(job) = outcome else {
        panic!("cancelled job must not be rescheduled");
    };
    assert_eq!(job.status, "cancelled");
    assert_eq!(job.failure_count, 1);
    assert!(job.claim_token.is_none());
}

#[tokio::test]
async fn reply_cascade_cancels_only_pending_siblings() {
    let h = Harness::new().await.unwrap();
    let (user_id, connection, replied_to) = h.due_job("bob@example.com").await.unwrap();
    let new = || followup_to("bob@example.com", connection.id);

    let pending_sibling = h.store.enqueue(user_id, new()).await.unwrap();
    let sent_sibling = h.store.enqueue(user_id, new()).await.unwrap();
    let failed_sibling = h.store.enqueue(user_id, new()).await.unwrap();
    let other_recipient = h
        .store
        .enqueue(user_id, followup_to("carol@example.com", connection.id))
        .await
        .unwrap();

    let claim = h
        .store
        .claim(sent_sibling.id, Utc::now(), ClaimMode::Immediate)
        .await
        .unwrap()
        .unwrap();
    h.store.mark_sent(&claim, "m-sent", Utc::now()).await.unwrap();

    let claim = h
        .store
        .claim(failed_sibling.id, Utc::now(), ClaimMode::Immediate)
        .await
        .unwrap()
        .unwrap();
    let hard = DispatchFailure {
        code: "rejected",
        message: "rejected".to_string(),
        retryable: false,
    };
    h.store.mark_failed(&claim, &hard, 1).await.unwrap();

    let outcome = h
        .store
        .record_reply(
            ReplyTarget::Job(replied_to.id),
            ReplyDetails {
                subject: "Re: Proposal for Q3".to_string(),
                body: "Sounds good".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.job.status, "replied");
    assert!(outcome.job.reply_received_at.is_some());
    assert_eq!(outcome.reply.from_email, "bob@example.com");
    assert_eq!(outcome.cancelled_job_ids, vec![pending_sibling.id]);

    let sibling = reload(&h.db, pending_sibling.id).await.unwrap();
    assert_eq!(sibling.status, "cancelled");
    assert_eq!(
        sibling.last_error,
        Some(format!("Cancelled: reply received to follow-up {}", replied_to.id))
    );
    assert_eq!(reload(&h.db, sent_sibling.id).await.unwrap().status, "sent");
    assert_eq!(reload(&h.db, failed_sibling.id).await.unwrap().status, "failed");
    assert_eq!(reload(&h.db, other_recipient.id).await.unwrap().status, "pending");
}

#[tokio::test]
async fn reply_cascade_honors_each_siblings_own_stop_on_reply() {
    let h = Harness::new().await.unwrap();
    let user_id = Uuid::new_v4();
    let connection = create_resend_connection(&h.connections, user_id).await.unwrap();
    let keep_going = |recipient: &str| NewFollowUp {
        stop_on_reply: Some(false),
        ..followup_to(recipient, connection.id)
    };

    let job = h
        .store
        .enqueue(user_id, keep_going("bob@example.com"))
        .await
        .unwrap();
    let stopping_sibling = h
        .store
        .enqueue(user_id, followup_to("bob@example.com", connection.id))
        .await
        .unwrap();
    let continuing_sibling = h
        .store
        .enqueue(user_id, keep_going("bob@example.com"))
        .await
        .unwrap();

    let outcome = h
        .store
        .record_reply(ReplyTarget::Job(job.id), ReplyDetails::default())
        .await
        .unwrap();

    assert_eq!(outcome.cancelled_job_ids, vec![stopping_sibling.id]);
    let stopped = reload(&h.db, stopping_sibling.id).await.unwrap();
    assert_eq!(stopped.status, "cancelled");
    assert_eq!(
        stopped.last_error,
        Some(format!("Cancelled: reply received to follow-up {}", job.id))
    );
    assert_eq!(
        reload(&h.db, continuing_sibling.id).await.unwrap().status,
        "pending"
    );
}

#[tokio::test]
async fn reply_defaults_thread_headers_from_the_job() {
    let h = Harness::new().await.unwrap();
    let user_id = Uuid::new_v4();
    let connection = create_resend_connection(&h.connections, user_id).await.unwrap();
    let drafted = h
        .store
        .enqueue(
            user_id,
            NewFollowUp {
                original_message_id: Some("<orig-1@mail.example.com>".to_string()),
                draft_subject: Some("Checking in on Q3".to_string()),
                ..followup_to("bob@example.com", connection.id)
            },
        )
        .await
        .unwrap();
    let plain = h
        .store
        .enqueue(
            user_id,
            NewFollowUp {
                stop_on_reply: Some(false),
                ..followup_to("carol@example.com", connection.id)
            },
        )
        .await
        .unwrap();

    let outcome = h
        .store
        .record_reply(ReplyTarget::Job(drafted.id), ReplyDetails::default())
        .await
        .unwrap();
    assert_eq!(outcome.reply.subject, "Re: Checking in on Q3");
    assert_eq!(
        outcome.reply.in_reply_to.as_deref(),
        Some("<orig-1@mail.example.com>")
    );

    let outcome = h
        .store
        .record_reply(
            ReplyTarget::Job(plain.id),
            ReplyDetails {
                in_reply_to: Some("<explicit@mail.example.com>".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.reply.subject, "Re: Proposal for Q3");
    assert_eq!(
        outcome.reply.in_reply_to.as_deref(),
        Some("<explicit@mail.example.com>")
    );
}

#[tokio::test]
async fn send_completing_after_reply_keeps_replied_and_releases_claim() {
    let h = Harness::new().await.unwrap();
    let (_, _, job) = h.due_job("bob@example.com").await.unwrap();

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Immediate)
        .await
        .unwrap()
        .unwrap();
    h.store
        .record_reply(ReplyTarget::Job(job.id), ReplyDetails::default())
        .await
        .unwrap();

    let sent_at = Utc::now();
    let updated = h.store.mark_sent(&claim, "m-late", sent_at).await.unwrap();

    assert_eq!(updated.status, "replied");
    assert_eq!(updated.provider_message_id.as_deref(), Some("m-late"));
    assert!(updated.sent_at.is_some());
    assert!(updated.claim_token.is_none());
    assert!(updated.claimed_at.is_none());

    let stale = h
        .store
        .stale_claims(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert!(stale.is_empty());
}

#[tokio::test]
async fn replies_are_listed_per_user_and_filterable() {
    let h = Harness::new().await.unwrap();
    let user_id = Uuid::new_v4();
    let connection = create_resend_connection(&h.connections, user_id).await.unwrap();
    let bob = h
        .store
        .enqueue(user_id, followup_to("bob@example.com", connection.id))
        .await
        .unwrap();
    let carol = h
        .store
        .enqueue(user_id, followup_to("carol@example.com", connection.id))
        .await
        .unwrap();

    let bob_reply = h
        .store
        .record_reply(
            ReplyTarget::Job(bob.id),
            ReplyDetails {
                body: "Let's meet Tuesday".to_string(),
                received_at: Some(Utc::now() - Duration::days(3)),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .reply;
    let carol_reply = h
        .store
        .record_reply(
            ReplyTarget::Job(carol.id),
            ReplyDetails {
                body: "Not interested".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .reply;

    let all = h
        .store
        .list_replies(user_id, ReplyListParams::default())
        .await
        .unwrap();
    let ids: Vec<_> = all.iter().map(|reply| reply.id).collect();
    assert_eq!(ids, vec![carol_reply.id, bob_reply.id]);

    let searched = h
        .store
        .list_replies(
            user_id,
            ReplyListParams {
                search: Some("tuesday".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(searched.len(), 1);
    assert_eq!(searched[0].id, bob_reply.id);
    let by_sender = h
        .store
        .list_replies(
            user_id,
            ReplyListParams {
                search: Some("carol@".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(by_sender.len(), 1);
    assert_eq!(by_sender[0].id, carol_reply.id);

    let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let recent = h
        .store
        .list_replies(
            user_id,
            ReplyListParams {
                start_date: Some(today.clone()),
                end_date: Some(today),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, carol_reply.id);

    let for_job = h
        .store
        .list_replies(
            user_id,
            ReplyListParams {
                followup_job_id: Some(bob.id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(for_job.len(), 1);

    let err = h
        .store
        .list_replies(
            user_id,
            ReplyListParams {
                start_date: Some("yesterday".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Validation { field: "start_date", .. }));

    assert!(
        h.store
            .list_replies(Uuid::new_v4(), ReplyListParams::default())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        h.store.find_reply(user_id, bob_reply.id).await.unwrap().id,
        bob_reply.id
    );
    let err = h
        .store
        .find_reply(Uuid::new_v4(), bob_reply.id)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { resource: "Reply" }));
}

#[tokio::test]
async fn reply_matched_by_recipient_and_terminal_jobs_refuse_replies() {
    let h = Harness::new().await.unwrap();
    let (user_id, _, job) = h.due_job("bob@example.com").await.unwrap();

    let outcome = h
        .store
        .record_reply(
            ReplyTarget::Recipient {
                user_id,
                recipient: "BOB@example.com".to_string(),
            },
            ReplyDetails {
                from_email: Some("Bob@Example.com".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.job.id, job.id);

    let err = h
        .store
        .record_reply(ReplyTarget::Job(job.id), ReplyDetails::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { .. }));

    let err = h
        .store
        .record_reply(
            ReplyTarget::Recipient {
                user_id,
                recipient: "nobody@example.com".to_string(),
            },
            ReplyDetails::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}

#[tokio::test]
async fn reset_for_retry_only_from_failed() {
    let h = Harness::new().await.unwrap();
    let (user_id, _, job) = h.due_job("bob@example.com").await.unwrap();

    let err = h.store.reset_for_retry(user_id, job.id).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidState { action: "retry", .. }));

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();
    let hard = DispatchFailure {
        code: "rejected",
        message: "bad request".to_string(),
        retryable: false,
    };
    h.store.mark_failed(&claim, &hard, 1).await.unwrap();

    let reset = h.store.reset_for_retry(user_id, job.id).await.unwrap();
    assert_eq!(reset.status, "pending");
    assert_eq!(reset.attempts, 0);
    assert_eq!(reset.failure_count, 1);
    assert_eq!(reset.last_error.as_deref(), Some("bad request"));
    assert!(reset.scheduled_at.with_timezone(&Utc) <= Utc::now());

    let due = h.store.list_due(Utc::now(), 10).await.unwrap();
    assert_eq!(due.len(), 1);
}

#[tokio::test]
async fn list_is_scoped_filtered_and_paged() {
    let h = Harness::new().await.unwrap();
    let (user_id, connection, first) = h.due_job("a@example.com").await.unwrap();
    for recipient in ["b@example.com", "c@example.com"] {
        h.store
            .enqueue(user_id, followup_to(recipient, connection.id))
            .await
            .unwrap();
    }
    h.store.cancel(user_id, first.id).await.unwrap();
    h.due_job("someone-else@example.com").await.unwrap();

    let all = h
        .store
        .list_for_user(user_id, ListParams::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    let cancelled = h
        .store
        .list_for_user(
            user_id,
            ListParams {
                status: Some("cancelled".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].id, first.id);

    let page = h
        .store
        .list_for_user(
            user_id,
            ListParams {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.len(), 1);

    for bad in [
        ListParams {
            status: Some("bogus".to_string()),
            ..Default::default()
        },
        ListParams {
            limit: Some(0),
            ..Default::default()
        },
        ListParams {
            limit: Some(101),
            ..Default::default()
        },
    ] {
        assert!(matches!(
            h.store.list_for_user(user_id, bad).await,
            Err(StoreError::Validation { .. })
        ));
    }
}

#[tokio::test]
async fn drafts_only_stored_on_dispatchable_jobs() {
    let h = Harness::new().await.unwrap();
    let (user_id, _, job) = h.due_job("bob@example.com").await.unwrap();

    let updated = h
        .store
        .store_draft(user_id, job.id, "Checking in", "Any thoughts?")
        .await
        .unwrap();
    assert_eq!(updated.draft_subject.as_deref(), Some("Checking in"));
    assert_eq!(updated.draft_body.as_deref(), Some("Any thoughts?"));

    h.store.cancel(user_id, job.id).await.unwrap();
    assert!(matches!(
        h.store.store_draft(user_id, job.id, "s", "b").await,
        Err(StoreError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn attempts_are_audited_in_order() {
    let h = Harness::new().await.unwrap();
    let (_, _, job) = h.due_job("bob@example.com").await.unwrap();

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Due)
        .await
        .unwrap()
        .unwrap();
    let failure = transient("connection reset");
    h.store
        .record_attempt(&claim, AttemptRecord::Failed(&failure))
        .await
        .unwrap();
    h.store.mark_failed(&claim, &failure, 1).await.unwrap();

    let claim = h
        .store
        .claim(job.id, Utc::now(), ClaimMode::Immediate)
        .await
        .unwrap()
        .unwrap();
    h.store
        .record_attempt(
            &claim,
            AttemptRecord::Sent {
                provider_message_id: "msg-9",
            },
        )
        .await
        .unwrap();

    let attempts = h.store.attempts_for(job.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].outcome, "failed");
    assert_eq!(attempts[0].error_code.as_deref(), Some("transient"));
    assert_eq!(attempts[1].attempt_number, 2);
    assert_eq!(attempts[1].provider_message_id.as_deref(), Some("msg-9"));
}

#[tokio::test]
async fn stale_claims_are_reported() {
    let h = Harness::new().await.unwrap();
    let (_, _, job) = h.due_job("bob@example.com").await.unwrap();

    h.store
        .claim(job.id, Utc::now() - Duration::hours(2), ClaimMode::Immediate)
        .await
        .unwrap()
        .unwrap();

    let stale = h
        .store
        .stale_claims(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, job.id);
    assert!(
        h.store
            .stale_claims(Utc::now() - Duration::hours(3))
            .await
            .unwrap()
            .is_empty()
    );
}
