use super::*;
use proptest::prelude::*;

fn enqueued_record() -> JobRecord {
    JobRecord::new(
        "echo.echo",
        Payload::from_bytes(b"{}".to_vec()),
        "default",
        JobState::Enqueued {
            queue: "default".to_string(),
        },
    )
}

fn processing(attempt: u32) -> JobState {
    JobState::Processing {
        worker_id: "host:0".to_string(),
        lease_expires_at: Utc::now(),
        attempt,
    }
}

#[test]
fn test_job_id_roundtrip() {
    let id = JobId::new();
    let parsed: JobId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
    assert!("not-a-uuid".parse::<JobId>().is_err());
}

#[test]
fn test_state_name_parse() {
    assert_eq!("succeeded".parse::<StateName>().unwrap(), StateName::Succeeded);
    assert_eq!("FAILED".parse::<StateName>().unwrap(), StateName::Failed);
    assert!("running".parse::<StateName>().is_err());
}

#[test]
fn test_terminal_states() {
    assert!(StateName::Succeeded.is_terminal());
    assert!(StateName::Deleted.is_terminal());
    assert!(!StateName::Failed.is_terminal());
    for next in StateName::ALL {
        assert!(!StateName::Succeeded.can_transition_to(next));
        assert!(!StateName::Deleted.can_transition_to(next));
    }
}

#[test]
fn test_new_record_has_initial_history() {
    let record = enqueued_record();
    assert_eq!(record.history.len(), 1);
    assert_eq!(record.state_name(), StateName::Enqueued);
    assert_eq!(record.attempts, 0);
    assert!(record.parent.is_none());
}

#[test]
fn test_awaiting_record_tracks_parent() {
    let parent = JobId::new();
    let record = JobRecord::new(
        "mail.send",
        Payload::from_bytes(Vec::new()),
        "default",
        JobState::Awaiting { parent },
    );
    assert_eq!(record.parent, Some(parent));
}

#[test]
fn test_apply_valid_transition() {
    let mut record = enqueued_record();
    record.apply(processing(1), None, Utc::now()).unwrap();
    assert_eq!(record.state_name(), StateName::Processing);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.history.len(), 2);
}

#[test]
fn test_apply_rejects_invalid_transition() {
    let mut record = enqueued_record();
    let err = record
        .apply(
            JobState::Succeeded {
                result: serde_json::Value::Null,
                duration_ms: 0,
            },
            None,
            Utc::now(),
        )
        .unwrap_err();
    assert_eq!(
        err,
        StorageError::InvalidTransition {
            from: StateName::Enqueued,
            to: StateName::Succeeded
        }
    );
    assert_eq!(record.history.len(), 1);
}

#[test]
fn test_last_error_uses_latest_failure() {
    let mut record = enqueued_record();
    record.apply(processing(1), None, Utc::now()).unwrap();
    record
        .apply(
            JobState::Failed {
                kind: FailureKind::Payload,
                message: Some("first".to_string()),
                attempt: 1,
                retry_at: Some(Utc::now()),
            },
            None,
            Utc::now(),
        )
        .unwrap();
    record
        .apply(JobState::Enqueued { queue: "default".to_string() }, None, Utc::now())
        .unwrap();
    record.apply(processing(2), None, Utc::now()).unwrap();
    record
        .apply(
            JobState::Failed {
                kind: FailureKind::LeaseExpired,
                message: None,
                attempt: 2,
                retry_at: None,
            },
            None,
            Utc::now(),
        )
        .unwrap();

    assert_eq!(record.last_error(), Some("lease_expired".to_string()));
    assert!(record.state.is_exhausted());
    assert_eq!(record.summary().attempts, 2);
}

#[test]
fn test_state_serializes_tagged() {
    let state = JobState::Enqueued {
        queue: "critical".to_string(),
    };
    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json["state"], "enqueued");
    assert_eq!(json["queue"], "critical");
}

proptest! {
    /// Any sequence of attempted transitions leaves a history that follows the
    /// lifecycle table, and nothing is recorded after a terminal state.
    #[test]
    fn history_is_monotonic(steps in prop::collection::vec(0usize..7, 0..40)) {
        let mut record = enqueued_record();
        for step in steps {
            let next = match StateName::ALL[step] {
                StateName::Scheduled => JobState::Scheduled { enqueue_at: Utc::now() },
                StateName::Awaiting => JobState::Awaiting { parent: JobId::new() },
                StateName::Enqueued => JobState::Enqueued { queue: "default".to_string() },
                StateName::Processing => processing(record.attempts + 1),
                StateName::Succeeded => JobState::Succeeded { result: serde_json::Value::Null, duration_ms: 1 },
                StateName::Failed => JobState::Failed {
                    kind: FailureKind::Payload,
                    message: None,
                    attempt: record.attempts,
                    retry_at: None,
                },
                StateName::Deleted => JobState::Deleted { reason: None },
            };
            let _ = record.apply(next, None, Utc::now());
        }

        for pair in record.history.windows(2) {
            let from = pair[0].state.name();
            let to = pair[1].state.name();
            prop_assert!(from.can_transition_to(to));
        }
        let deleted_at = record.history.iter().position(|e| e.state.name() == StateName::Deleted);
        if let Some(pos) = deleted_at {
            prop_assert_eq!(pos, record.history.len() - 1);
        }
    }
}
