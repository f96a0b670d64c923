//! Session-level functional tests.
//!
//! Drives the `SessionManager` through the same operations the JSON-RPC
//! adapters use, with a manual clock and in-memory collaborators so every
//! timing-dependent path is deterministic.

use std::sync::Arc;

use seb_protocol::{
    ClientConnection, ClientInstruction, ConnectionStatus, InstructionKind, ProctoringAction, ProctoringRoom,
    RoomType, SessionError, WireEvent,
};
use seb_services::{
    EstablishRequest, ExamInfo, InMemoryExamDirectory, InMemoryPersistence, InMemoryProctoringBackend, ManualClock,
    NewConnection, SessionConfig, SessionManager,
};

const INSTITUTION: u64 = 1;
const PLAIN_EXAM: u64 = 10;
const VDI_EXAM: u64 = 20;
const PROCTORED_EXAM: u64 = 30;

fn exams() -> Vec<ExamInfo> {
    vec![
        ExamInfo { id: PLAIN_EXAM, institution_id: INSTITUTION, vdi: false, proctoring_enabled: false, running: true },
        ExamInfo { id: VDI_EXAM, institution_id: INSTITUTION, vdi: true, proctoring_enabled: false, running: true },
        ExamInfo { id: PROCTORED_EXAM, institution_id: INSTITUTION, vdi: false, proctoring_enabled: true, running: true },
    ]
}

/// An exam of another institution.
fn foreign_exam() -> ExamInfo {
    ExamInfo { id: 40, institution_id: INSTITUTION + 1, vdi: false, proctoring_enabled: false, running: true }
}

struct Fixture {
    manager: Arc<SessionManager>,
    config: SessionConfig,
    persistence: Arc<InMemoryPersistence>,
    exams: Arc<InMemoryExamDirectory>,
    clock: Arc<ManualClock>,
    backend: Arc<InMemoryProctoringBackend>,
}

fn fixture() -> Fixture {
    fixture_with(SessionConfig::default())
}

fn fixture_with(mut config: SessionConfig) -> Fixture {
    config.exams = exams();
    let persistence = Arc::new(InMemoryPersistence::new());
    let exams = Arc::new(InMemoryExamDirectory::with_exams(config.exams.clone()));
    let clock = Arc::new(ManualClock::new(0));
    let backend = Arc::new(InMemoryProctoringBackend::new("https://meet.test"));
    let manager = Arc::new(SessionManager::new(
        config.clone(),
        persistence.clone(),
        exams.clone(),
        clock.clone(),
        backend.clone(),
    ));
    Fixture { manager, config, persistence, exams, clock, backend }
}

impl Fixture {
    /// A fresh manager over the same durable state, as after a restart.
    fn restart(&self) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            self.config.clone(),
            self.persistence.clone(),
            self.exams.clone(),
            self.clock.clone(),
            self.backend.clone(),
        ))
    }

    fn create(&self, exam: Option<u64>, address: &str) -> String {
        self.manager
            .create_connection(NewConnection {
                institution_id: Some(INSTITUTION),
                client_address: address.into(),
                exam_id: exam,
                ..Default::default()
            })
            .unwrap()
            .connection_token
    }

    fn establish(&self, token: &str, exam: Option<u64>, address: &str) -> Result<ClientConnection, SessionError> {
        self.manager.establish_connection(
            token,
            &EstablishRequest {
                institution_id: INSTITUTION,
                exam_id: exam,
                client_address: address.into(),
                ..Default::default()
            },
        )
    }

    /// Create and establish twice, ending in ACTIVE.
    fn connect(&self, exam: u64, address: &str) -> String {
        let token = self.create(Some(exam), address);
        self.establish(&token, Some(exam), address).unwrap();
        let active = self.establish(&token, Some(exam), address).unwrap();
        assert_eq!(active.status, ConnectionStatus::Active);
        token
    }

    fn drain(&self, token: &str) -> Vec<ClientInstruction> {
        let mut out = Vec::new();
        while let Some(instruction) = self.manager.instructions().poll_instruction(token).unwrap() {
            out.push(instruction);
        }
        out
    }
}

fn proctoring_action(instruction: &ClientInstruction) -> Option<(ProctoringAction, &str)> {
    match &instruction.kind {
        InstructionKind::Proctoring { action, room_name, .. } => Some((*action, room_name.as_str())),
        _ => None,
    }
}

fn of_type(rooms: &[ProctoringRoom], room_type: RoomType) -> Vec<&ProctoringRoom> {
    rooms.iter().filter(|r| r.room_type == room_type).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection lifecycle
// ─────────────────────────────────────────────────────────────────────────────

mod connection {
    use std::collections::HashSet;

    use seb_protocol::{ConnectionUpdate, MonitoringEvent};

    use super::*;

    #[test]
    fn create_establish_close_reaches_closed() {
        let f = fixture();
        let mut events = f.manager.subscribe();

        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");
        let created = f.manager.get_connection(&token).unwrap();
        assert_eq!(created.status, ConnectionStatus::ConnectionRequested);
        assert_eq!(created.version, 1);
        assert!(created.id > 0);

        let auth = f.establish(&token, Some(PLAIN_EXAM), "10.0.0.1").unwrap();
        assert_eq!(auth.status, ConnectionStatus::Authenticated);
        assert_eq!(auth.version, 2);

        let active = f.establish(&token, None, "10.0.0.1").unwrap();
        assert_eq!(active.status, ConnectionStatus::Active);

        let closed = f.manager.close_connection(&token, INSTITUTION, "10.0.0.1").unwrap();
        assert_eq!(closed.status, ConnectionStatus::Closed);
        assert_eq!(f.manager.get_connection(&token).unwrap().status, ConnectionStatus::Closed);

        let mut transitions = Vec::new();
        while let Ok(MonitoringEvent::StatusChanged { from, to, .. }) = events.try_recv() {
            transitions.push((from, to));
        }
        assert_eq!(
            transitions,
            vec![
                (ConnectionStatus::Undefined, ConnectionStatus::ConnectionRequested),
                (ConnectionStatus::ConnectionRequested, ConnectionStatus::Authenticated),
                (ConnectionStatus::Authenticated, ConnectionStatus::Active),
                (ConnectionStatus::Active, ConnectionStatus::Closed),
            ]
        );
    }

    #[test]
    fn establish_without_exam_is_rejected() {
        let f = fixture();
        let token = f.create(None, "10.0.0.1");

        let err = f.establish(&token, None, "10.0.0.1").unwrap_err();
        assert!(matches!(err, SessionError::MissingExam(_)));
        assert_eq!(f.manager.get_connection(&token).unwrap().status, ConnectionStatus::ConnectionRequested);

        // Binding the exam at establish time is enough.
        let auth = f.establish(&token, Some(PLAIN_EXAM), "10.0.0.1").unwrap();
        assert_eq!(auth.exam_id, Some(PLAIN_EXAM));
    }

    #[test]
    fn tokens_are_unique() {
        let f = fixture();
        let tokens: HashSet<String> = (0..50).map(|_| f.create(Some(PLAIN_EXAM), "10.0.0.1")).collect();
        assert_eq!(tokens.len(), 50);
        assert_eq!(f.manager.store().len(), 50);
        assert_eq!(f.persistence.connection_count(), 50);
    }

    #[test]
    fn create_validates_institution_and_exam() {
        let f = fixture();
        let missing = f.manager.create_connection(NewConnection {
            client_address: "10.0.0.1".into(),
            ..Default::default()
        });
        assert!(matches!(missing, Err(SessionError::Validation(_))));

        let foreign = f.manager.create_connection(NewConnection {
            institution_id: Some(99),
            client_address: "10.0.0.1".into(),
            exam_id: Some(PLAIN_EXAM),
            ..Default::default()
        });
        assert!(matches!(foreign, Err(SessionError::Validation(_))));
        assert!(f.manager.store().is_empty());
    }

    #[test]
    fn close_is_idempotent() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");

        let first = f.manager.close_connection(&token, INSTITUTION, "10.0.0.1").unwrap();
        let second = f.manager.close_connection(&token, INSTITUTION, "10.0.0.1").unwrap();
        assert_eq!(second.status, ConnectionStatus::Closed);
        assert_eq!(second.version, first.version);
    }

    #[test]
    fn terminal_and_established_states_refuse_illegal_moves() {
        let f = fixture();

        let disabled = f.create(Some(PLAIN_EXAM), "10.0.0.1");
        f.manager.disable_connection(&disabled, INSTITUTION).unwrap();
        assert!(matches!(
            f.manager.close_connection(&disabled, INSTITUTION, "10.0.0.1"),
            Err(SessionError::StateConflict(_))
        ));
        assert!(matches!(
            f.establish(&disabled, Some(PLAIN_EXAM), "10.0.0.1"),
            Err(SessionError::StateConflict(_))
        ));

        let active = f.connect(PLAIN_EXAM, "10.0.0.2");
        assert!(matches!(
            f.manager.disable_connection(&active, INSTITUTION),
            Err(SessionError::StateConflict(_))
        ));
        assert!(matches!(
            f.manager.close_connection(&active, 2, "10.0.0.2"),
            Err(SessionError::StateConflict(_))
        ));
        assert_eq!(f.manager.get_connection(&active).unwrap().status, ConnectionStatus::Active);
    }

    #[test]
    fn unknown_token_is_not_found() {
        let f = fixture();
        assert!(matches!(f.manager.get_connection("nope"), Err(SessionError::NotFound(_))));
        assert!(matches!(
            f.establish("nope", Some(PLAIN_EXAM), "10.0.0.1"),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn address_mismatch_on_plain_exam_is_a_conflict() {
        let f = fixture();
        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");

        let err = f.establish(&token, Some(PLAIN_EXAM), "10.0.0.2").unwrap_err();
        assert!(matches!(err, SessionError::StateConflict(_)));
        let unchanged = f.manager.get_connection(&token).unwrap();
        assert_eq!(unchanged.status, ConnectionStatus::ConnectionRequested);
        assert_eq!(unchanged.version, 1);
    }

    #[test]
    fn address_mismatch_on_vdi_exam_records_virtual_address() {
        let f = fixture();
        let token = f.create(Some(VDI_EXAM), "10.0.0.1");

        let auth = f.establish(&token, Some(VDI_EXAM), "10.0.0.2").unwrap();
        assert_eq!(auth.client_address, "10.0.0.1");
        assert_eq!(auth.virtual_client_address.as_deref(), Some("10.0.0.2"));

        // The virtual address is now a recognised origin.
        let active = f.establish(&token, Some(VDI_EXAM), "10.0.0.2").unwrap();
        assert_eq!(active.status, ConnectionStatus::Active);
    }

    #[test]
    fn establish_binds_only_known_exams_of_the_institution() {
        let f = fixture();
        f.exams.upsert(foreign_exam());
        let token = f.create(None, "10.0.0.1");

        for exam in [999, foreign_exam().id] {
            assert!(matches!(f.establish(&token, Some(exam), "10.0.0.1"), Err(SessionError::Validation(_))));
        }
        let untouched = f.manager.get_connection(&token).unwrap();
        assert_eq!(untouched.status, ConnectionStatus::ConnectionRequested);
        assert_eq!(untouched.exam_id, None);
        assert_eq!(untouched.version, 1);

        let auth = f.establish(&token, Some(PLAIN_EXAM), "10.0.0.1").unwrap();
        assert_eq!(auth.status, ConnectionStatus::Authenticated);
        assert_eq!(auth.exam_id, Some(PLAIN_EXAM));
    }

    #[test]
    fn update_binds_only_known_exams_of_the_institution() {
        let f = fixture();
        f.exams.upsert(foreign_exam());
        let token = f.create(None, "10.0.0.1");

        for exam in [999, foreign_exam().id] {
            let err = f
                .manager
                .update_connection(&token, &ConnectionUpdate { exam_id: Some(exam), ..Default::default() })
                .unwrap_err();
            assert!(matches!(err, SessionError::Validation(_)), "exam {exam}");
        }
        assert_eq!(f.manager.get_connection(&token).unwrap().exam_id, None);

        let bound = f
            .manager
            .update_connection(&token, &ConnectionUpdate { exam_id: Some(PLAIN_EXAM), ..Default::default() })
            .unwrap();
        assert_eq!(bound.exam_id, Some(PLAIN_EXAM));
    }

    #[test]
    fn update_merges_fields_without_touching_status() {
        let f = fixture();
        let token = f.create(Some(VDI_EXAM), "10.0.0.1");

        let updated = f
            .manager
            .update_connection(
                &token,
                &ConnectionUpdate {
                    client_address: Some("10.0.0.9".into()),
                    os_name: Some("Windows 11".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.status, ConnectionStatus::ConnectionRequested);
        assert_eq!(updated.client_address, "10.0.0.1");
        assert_eq!(updated.virtual_client_address.as_deref(), Some("10.0.0.9"));
        assert_eq!(updated.os_name.as_deref(), Some("Windows 11"));
        assert_eq!(updated.version, 2);

        let plain = f.create(Some(PLAIN_EXAM), "10.0.0.1");
        let moved = f
            .manager
            .update_connection(&plain, &ConnectionUpdate { client_address: Some("10.0.0.5".into()), ..Default::default() })
            .unwrap();
        assert_eq!(moved.client_address, "10.0.0.5");
        assert!(moved.virtual_client_address.is_none());
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let f = fixture();
        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");

        f.persistence.fail_next(f.config.store_retry_attempts);
        let err = f.establish(&token, Some(PLAIN_EXAM), "10.0.0.1").unwrap_err();
        assert!(matches!(err, SessionError::TransientStore(_)));
        assert!(err.is_retryable());

        let cached = f.manager.store().peek(&token).unwrap();
        assert_eq!(cached.status, ConnectionStatus::ConnectionRequested);
        assert_eq!(cached.version, 1);

        // Fewer failures than attempts are absorbed by the retry.
        f.persistence.fail_next(f.config.store_retry_attempts - 1);
        let auth = f.establish(&token, Some(PLAIN_EXAM), "10.0.0.1").unwrap();
        assert_eq!(auth.status, ConnectionStatus::Authenticated);
        assert_eq!(auth.version, 2);
    }

    #[test]
    fn concurrent_establish_advances_once_per_step() {
        let f = fixture();
        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");

        let results: Vec<Result<ClientConnection, SessionError>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| f.establish(&token, Some(PLAIN_EXAM), "10.0.0.1")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 2);
        let final_state = f.manager.get_connection(&token).unwrap();
        assert_eq!(final_state.status, ConnectionStatus::Active);
        assert_eq!(final_state.version, 3);
    }

    #[test]
    fn bulk_operations_report_per_token() {
        let f = fixture();
        let a = f.create(Some(PLAIN_EXAM), "10.0.0.1");
        let b = f.connect(PLAIN_EXAM, "10.0.0.2");
        let c = f.connect(PLAIN_EXAM, "10.0.0.3");
        f.manager.close_connection(&c, INSTITUTION, "10.0.0.3").unwrap();

        let disabled = f.manager.disable_connections(&["ghost".to_string(), a.clone()], INSTITUTION);
        assert!(matches!(disabled[0].1, Err(SessionError::NotFound(_))));
        assert_eq!(disabled[1].1.as_ref().unwrap().status, ConnectionStatus::Disabled);

        // Only the one non-terminal connection is left to close.
        let closed = f.manager.close_connections_of_exam(PLAIN_EXAM);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].0, b);
        assert!(f
            .manager
            .connections_for_exam(PLAIN_EXAM)
            .iter()
            .all(|c| c.status.is_terminal()));
    }

    #[test]
    fn terminal_connections_are_evicted_and_reloaded() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        let open = f.connect(PLAIN_EXAM, "10.0.0.2");
        f.manager.close_connection(&token, INSTITUTION, "10.0.0.1").unwrap();

        f.manager.cleanup();
        assert!(f.manager.store().peek(&token).is_none());
        assert!(f.manager.store().peek(&open).is_some());

        let reloaded = f.manager.get_connection(&token).unwrap();
        assert_eq!(reloaded.status, ConnectionStatus::Closed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ping monitoring
// ─────────────────────────────────────────────────────────────────────────────

mod ping {
    use seb_protocol::MonitoringEvent;

    use super::*;

    #[test]
    fn missing_ping_is_flagged_and_cleared() {
        let f = fixture();
        assert_eq!(f.manager.ping_monitor().threshold_ms(), 5_000);
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        let mut events = f.manager.subscribe();

        assert!(f.manager.notify_ping(&token, 1).unwrap().is_none());

        f.clock.set(6_000);
        let report = f.manager.sweep_pings();
        assert_eq!(report.flagged, 1);
        assert!(f.manager.ping_monitor().is_missing_ping(&token));
        assert_eq!(f.manager.incidents(), vec![token.clone()]);
        match events.try_recv().unwrap() {
            MonitoringEvent::MissingPing { token: flagged, last_ping, detected_at } => {
                assert_eq!(flagged, token);
                assert_eq!(last_ping, 0);
                assert_eq!(detected_at, 6_000);
            }
            other => panic!("unexpected event {other:?}"),
        }

        f.clock.set(6_100);
        f.manager.notify_ping(&token, 2).unwrap();
        assert!(!f.manager.ping_monitor().is_missing_ping(&token));
        assert!(matches!(events.try_recv().unwrap(), MonitoringEvent::PingRecovered { at: 6_100, .. }));

        f.clock.set(7_000);
        let report = f.manager.sweep_pings();
        assert_eq!(report.flagged, 0);
        assert!(f.manager.incidents().is_empty());
    }

    #[test]
    fn flag_is_raised_once_per_silence() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");

        f.clock.set(10_000);
        assert_eq!(f.manager.sweep_pings().flagged, 1);
        f.clock.set(12_000);
        assert_eq!(f.manager.sweep_pings().flagged, 0);
        assert!(f.manager.ping_monitor().is_missing_ping(&token));
    }

    #[test]
    fn ping_for_unknown_token_is_not_found() {
        let f = fixture();
        assert!(matches!(f.manager.notify_ping("ghost", 1), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn unestablished_and_closed_connections_are_never_flagged() {
        let f = fixture();
        let requested = f.create(Some(PLAIN_EXAM), "10.0.0.1");
        f.manager.notify_ping(&requested, 1).unwrap();
        let closed = f.connect(PLAIN_EXAM, "10.0.0.2");
        f.manager.close_connection(&closed, INSTITUTION, "10.0.0.2").unwrap();

        f.clock.set(60_000);
        let report = f.manager.sweep_pings();
        assert_eq!(report.flagged, 0);
        assert!(f.manager.ping_monitor().liveness(&requested).is_none());
        assert!(f.manager.ping_monitor().liveness(&closed).is_none());
    }

    #[test]
    fn late_pings_never_move_liveness_backwards() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");

        f.clock.set(5_000);
        f.manager.notify_ping(&token, 2).unwrap();
        f.manager.ping_monitor().notify_ping(&token, 4_000, 1).unwrap();

        let liveness = f.manager.ping_monitor().liveness(&token).unwrap();
        assert_eq!(liveness.last_ping, 5_000);
        assert_eq!(liveness.last_ping_number, 2);
    }

    #[test]
    fn ping_hands_out_queued_instruction() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        f.manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[token.clone()], false)
            .unwrap();

        let delivered = f.manager.notify_ping(&token, 1).unwrap().unwrap();
        assert_eq!(delivered.kind, InstructionKind::Quit);
        assert!(f.manager.notify_ping(&token, 2).unwrap().is_none());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instruction queue
// ─────────────────────────────────────────────────────────────────────────────

mod instruction {
    use super::*;

    #[test]
    fn each_target_gets_its_instruction_once() {
        let f = fixture();
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");
        let b = f.connect(PLAIN_EXAM, "10.0.0.2");

        let registered = f
            .manager
            .register_instruction(
                PLAIN_EXAM,
                InstructionKind::ForceLockScreen { message: None },
                &[a.clone(), b.clone()],
                false,
            )
            .unwrap();
        assert_eq!(registered.len(), 2);

        let queue = f.manager.instructions();
        assert!(queue.poll_instruction(&a).unwrap().is_some());
        assert!(queue.poll_instruction(&a).unwrap().is_none());
        assert!(queue.poll_instruction(&b).unwrap().is_some());
        assert!(queue.poll_instruction(&b).unwrap().is_none());
        assert_eq!(f.persistence.instruction_count(), 0);
    }

    #[test]
    fn mailbox_is_fifo_and_deduplicates_targets() {
        let f = fixture();
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");

        let twice = f
            .manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[a.clone(), a.clone()], false)
            .unwrap();
        assert_eq!(twice.len(), 1);
        f.manager
            .register_instruction(PLAIN_EXAM, InstructionKind::ForceLockScreen { message: None }, &[a.clone()], false)
            .unwrap();

        let kinds: Vec<InstructionKind> = f.drain(&a).into_iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![InstructionKind::Quit, InstructionKind::ForceLockScreen { message: None }]);
    }

    #[test]
    fn confirmation_is_tracked_until_echoed() {
        let f = fixture();
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");

        let registered = f
            .manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[a.clone()], true)
            .unwrap();
        let confirm_id = registered[0].confirm_id.clone().unwrap();
        assert_eq!(confirm_id, format!("{PLAIN_EXAM}-{}", registered[0].id));
        assert_eq!(registered[0].to_wire().attributes["confirmId"], confirm_id);

        // Delivery alone does not confirm.
        f.drain(&a);
        assert_eq!(f.manager.awaiting_confirmation(&a).len(), 1);

        assert!(!f.manager.confirm_instruction(&a, "10-999"));
        assert!(f.manager.confirm_instruction(&a, &confirm_id));
        assert!(!f.manager.confirm_instruction(&a, &confirm_id));
        assert!(f.manager.awaiting_confirmation(&a).is_empty());
    }

    #[test]
    fn registration_validates_targets() {
        let f = fixture();
        assert!(matches!(
            f.manager.register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[], false),
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            f.manager
                .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &["ghost".to_string()], false),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn failed_registration_enqueues_nothing() {
        let f = fixture();
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");

        f.persistence.fail_next(f.config.store_retry_attempts);
        let err = f
            .manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[a.clone()], true)
            .unwrap_err();
        assert!(matches!(err, SessionError::TransientStore(_)));
        assert_eq!(f.manager.instructions().pending_count(&a), 0);
        assert!(f.manager.awaiting_confirmation(&a).is_empty());
        assert_eq!(f.persistence.instruction_count(), 0);
    }

    #[test]
    fn cleanup_expires_old_instructions() {
        let mut config = SessionConfig::default();
        config.instruction_ttl_ms = 1_000;
        let f = fixture_with(config);
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");

        f.manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[a.clone()], false)
            .unwrap();
        f.clock.set(500);
        f.manager
            .register_instruction(PLAIN_EXAM, InstructionKind::ForceLockScreen { message: None }, &[a.clone()], false)
            .unwrap();

        f.clock.set(1_200);
        let report = f.manager.cleanup();
        assert_eq!(report.expired, 1);
        assert_eq!(f.persistence.instruction_count(), 1);

        let left = f.drain(&a);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].kind, InstructionKind::ForceLockScreen { message: None });
    }

    #[test]
    fn cleanup_drops_mailboxes_of_unknown_tokens() {
        let f = fixture();
        f.manager
            .instructions()
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, ["ghost"], false)
            .unwrap();

        let report = f.manager.cleanup();
        assert_eq!(report.dropped_mailboxes, 1);
        assert_eq!(f.manager.instructions().pending_count("ghost"), 0);
        assert_eq!(f.persistence.instruction_count(), 0);
    }

    #[test]
    fn cleanup_drops_mailboxes_of_closed_connections() {
        let f = fixture();
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");
        f.manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[a.clone()], true)
            .unwrap();
        f.manager.close_connection(&a, INSTITUTION, "10.0.0.1").unwrap();

        let report = f.manager.cleanup();
        assert_eq!(report.dropped_mailboxes, 1);
        assert_eq!(report.expired_trackers, 1);
        assert_eq!(f.manager.instructions().pending_count(&a), 0);
        assert_eq!(f.persistence.instruction_count(), 0);
        assert!(f.manager.store().peek(&a).is_none());

        // Looking the evicted connection up does not bring it back into memory.
        f.manager
            .instructions()
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, [a.as_str()], false)
            .unwrap();
        assert_eq!(f.manager.cleanup().dropped_mailboxes, 1);
        assert!(f.manager.store().peek(&a).is_none());
    }

    #[test]
    fn cleanup_keeps_mailboxes_of_disabled_connections() {
        let f = fixture();
        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");
        f.manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[token.clone()], false)
            .unwrap();
        f.manager.disable_connection(&token, INSTITUTION).unwrap();

        assert_eq!(f.manager.cleanup().dropped_mailboxes, 0);
        assert_eq!(f.drain(&token)[0].kind, InstructionKind::Quit);
    }

    #[test]
    fn undelivered_instructions_survive_a_restart() {
        let f = fixture();
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");
        let first = f
            .manager
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[a.clone()], false)
            .unwrap();

        let restarted = f.restart();
        assert_eq!(restarted.restore().unwrap(), 1);

        // Restored mailboxes are kept even before the connection is cached.
        restarted.cleanup();
        let delivered = restarted.notify_ping(&a, 1).unwrap().unwrap();
        assert_eq!(delivered.id, first[0].id);

        let next = restarted
            .register_instruction(PLAIN_EXAM, InstructionKind::Quit, &[a.clone()], false)
            .unwrap();
        assert!(next[0].id > first[0].id);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

mod notification {
    use super::*;

    fn raise_hand(f: &Fixture, token: &str, timestamp: u64) -> u64 {
        f.manager
            .notify_client_event(
                token,
                WireEvent {
                    event_type: "NOTIFICATION".into(),
                    timestamp: Some(timestamp),
                    num_value: None,
                    text: Some("<raisehand> question".into()),
                },
            )
            .unwrap()
            .id
    }

    #[test]
    fn operator_confirmation_clears_pending_and_tells_the_client() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        let id = raise_hand(&f, &token, 100);

        assert!(f.manager.has_pending_notification(&token).unwrap());
        assert!(f.manager.confirm_notification(&token, id).unwrap());
        assert!(!f.manager.has_pending_notification(&token).unwrap());
        assert!(f.manager.pending_notifications(&token).unwrap().is_empty());

        let instructions = f.drain(&token);
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].kind, InstructionKind::NotificationConfirm { notification_id: id });
    }

    #[test]
    fn new_notification_invalidates_cached_indicator() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        let connection_id = f.manager.get_connection(&token).unwrap().id;

        assert!(!f.manager.has_pending_notification(&token).unwrap());
        assert_eq!(f.manager.notifications().cached(connection_id), Some(false));

        raise_hand(&f, &token, 100);
        assert_eq!(f.manager.notifications().cached(connection_id), None);
        assert!(f.manager.has_pending_notification(&token).unwrap());
        assert_eq!(f.manager.notifications().cached(connection_id), Some(true));
    }

    #[test]
    fn client_side_confirmation_resolves_notification() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        let id = raise_hand(&f, &token, 100);
        assert!(f.manager.has_pending_notification(&token).unwrap());

        f.manager
            .notify_client_event(
                &token,
                WireEvent {
                    event_type: "NOTIFICATION_CONFIRMED".into(),
                    timestamp: Some(200),
                    num_value: Some(id as f64),
                    text: None,
                },
            )
            .unwrap();
        assert!(!f.manager.has_pending_notification(&token).unwrap());
        assert!(f.drain(&token).is_empty());
    }

    #[test]
    fn pending_notifications_are_oldest_first() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        raise_hand(&f, &token, 200);
        raise_hand(&f, &token, 100);

        let timestamps: Vec<u64> = f
            .manager
            .pending_notifications(&token)
            .unwrap()
            .iter()
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(timestamps, vec![100, 200]);
    }

    #[test]
    fn confirming_unknown_notification_is_a_no_op() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        assert!(!f.manager.confirm_notification(&token, 42).unwrap());
        assert!(f.drain(&token).is_empty());
    }

    #[test]
    fn ping_refreshes_pending_indicator() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        raise_hand(&f, &token, 100);

        f.manager.notify_ping(&token, 1).unwrap();
        assert!(f.manager.ping_monitor().liveness(&token).unwrap().pending_notification);
    }

    #[test]
    fn confirmation_ids_must_be_whole_numbers() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        raise_hand(&f, &token, 100);

        for value in [-1.0, 1.5, f64::NAN] {
            let err = f
                .manager
                .notify_client_event(
                    &token,
                    WireEvent {
                        event_type: "NOTIFICATION_CONFIRMED".into(),
                        timestamp: Some(200),
                        num_value: Some(value),
                        text: None,
                    },
                )
                .unwrap_err();
            assert!(matches!(err, SessionError::Validation(_)), "{value}");
        }
        assert!(f.manager.has_pending_notification(&token).unwrap());
    }

    #[test]
    fn terminal_connections_leave_the_cache() {
        let f = fixture();
        let a = f.connect(PLAIN_EXAM, "10.0.0.1");
        let b = f.connect(PLAIN_EXAM, "10.0.0.2");
        f.manager.has_pending_notification(&a).unwrap();
        f.manager.has_pending_notification(&b).unwrap();
        assert_eq!(f.manager.notifications().len(), 2);

        f.manager.close_connection(&a, INSTITUTION, "10.0.0.1").unwrap();
        assert_eq!(f.manager.notifications().len(), 1);

        // A read after the close is dropped again with the connection record.
        assert!(!f.manager.has_pending_notification(&a).unwrap());
        assert_eq!(f.manager.notifications().len(), 2);
        f.manager.cleanup();
        assert_eq!(f.manager.notifications().len(), 1);
        let b_id = f.manager.get_connection(&b).unwrap().id;
        assert_eq!(f.manager.notifications().cached(b_id), Some(false));
    }

    #[test]
    fn malformed_event_is_rejected_before_storage() {
        let f = fixture();
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");
        let err = f
            .manager
            .notify_client_event(&token, WireEvent { event_type: "BOGUS".into(), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert!(!f.manager.has_pending_notification(&token).unwrap());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client version policy
// ─────────────────────────────────────────────────────────────────────────────

mod version {
    use seb_protocol::ConnectionUpdate;
    use seb_services::{ClientVersionPolicy, MinimumVersionPolicy};

    use super::*;

    fn with_minimum(version: &str) -> Fixture {
        let mut config = SessionConfig::default();
        config.minimum_seb_version = Some(version.into());
        fixture_with(config)
    }

    #[test]
    fn minimum_version_comparison() {
        let policy = MinimumVersionPolicy::new("3.5");
        assert!(policy.accepts("3.5.0"));
        assert!(policy.accepts("3.6.1 (x64)"));
        assert!(policy.accepts("4"));
        assert!(!policy.accepts("3.4.9"));
        assert!(!policy.accepts("unknown"));
    }

    #[test]
    fn outdated_client_is_quit_and_disabled() {
        let f = with_minimum("3.5");
        let rejected = f
            .manager
            .create_connection(NewConnection {
                institution_id: Some(INSTITUTION),
                client_address: "10.0.0.1".into(),
                exam_id: Some(PLAIN_EXAM),
                seb_version: Some("3.4.2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rejected.status, ConnectionStatus::Disabled);
        let quit = f.drain(&rejected.connection_token);
        assert_eq!(quit.len(), 1);
        assert_eq!(quit[0].kind, InstructionKind::Quit);

        let accepted = f
            .manager
            .create_connection(NewConnection {
                institution_id: Some(INSTITUTION),
                client_address: "10.0.0.2".into(),
                exam_id: Some(PLAIN_EXAM),
                seb_version: Some("3.6.0 (x64)".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(accepted.status, ConnectionStatus::ConnectionRequested);
    }

    #[test]
    fn established_client_reporting_old_version_is_only_quit() {
        let f = with_minimum("3.5");
        let token = f.connect(PLAIN_EXAM, "10.0.0.1");

        let updated = f
            .manager
            .update_connection(&token, &ConnectionUpdate { seb_version: Some("2.0".into()), ..Default::default() })
            .unwrap();
        assert_eq!(updated.status, ConnectionStatus::Active);
        assert_eq!(f.drain(&token)[0].kind, InstructionKind::Quit);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Proctoring rooms
// ─────────────────────────────────────────────────────────────────────────────

mod proctoring {
    use super::*;

    #[tokio::test]
    async fn active_connections_are_collected() {
        let f = fixture();
        let tokens: Vec<String> = (1..=3).map(|i| f.connect(PROCTORED_EXAM, &format!("10.0.0.{i}"))).collect();
        assert!(tokens.iter().all(|t| f.manager.proctoring().is_marked(t)));

        let report = f.manager.reconcile_rooms().await;
        assert_eq!(report.assigned, 3);
        assert_eq!(report.failures, 0);

        let rooms = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].room_type, RoomType::Collecting);
        assert_eq!(rooms[0].size(), 3);
        assert!(f.backend.is_provisioned(&rooms[0].name));

        for token in &tokens {
            assert!(!f.manager.proctoring().is_marked(token));
            let joined = f.drain(token);
            assert_eq!(proctoring_action(&joined[0]), Some((ProctoringAction::Join, rooms[0].name.as_str())));
        }

        // Nothing left to do on the next pass.
        assert_eq!(f.manager.reconcile_rooms().await.assigned, 0);
    }

    #[tokio::test]
    async fn collecting_rooms_respect_capacity() {
        let mut config = SessionConfig::default();
        config.collecting_room_capacity = 2;
        let f = fixture_with(config);
        for i in 1..=3 {
            f.connect(PROCTORED_EXAM, &format!("10.0.0.{i}"));
        }

        f.manager.reconcile_rooms().await;
        let rooms = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        let mut sizes: Vec<usize> = rooms.iter().map(ProctoringRoom::size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2]);
        assert_eq!(f.backend.provisioned_count(), 2);
    }

    #[tokio::test]
    async fn authenticated_connections_wait() {
        let f = fixture();
        let token = f.create(Some(PROCTORED_EXAM), "10.0.0.1");
        f.establish(&token, Some(PROCTORED_EXAM), "10.0.0.1").unwrap();

        assert!(!f.manager.proctoring().is_marked(&token));
        assert_eq!(f.manager.reconcile_rooms().await.assigned, 0);
        assert!(f.manager.rooms(PROCTORED_EXAM).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn break_out_and_close_return_members_to_collecting() {
        let f = fixture();
        let a = f.connect(PROCTORED_EXAM, "10.0.0.1");
        let b = f.connect(PROCTORED_EXAM, "10.0.0.2");
        f.manager.reconcile_rooms().await;
        f.drain(&a);
        f.drain(&b);
        let collecting = f.manager.rooms(PROCTORED_EXAM).await.unwrap()[0].name.clone();

        let break_out = f
            .manager
            .create_break_out_room(PROCTORED_EXAM, "Question", &[a.clone()])
            .await
            .unwrap();
        assert_eq!(break_out.room_type, RoomType::BreakOut);
        assert_eq!(break_out.subject, "Question");
        assert!(break_out.members.contains(&a));

        let moves = f.drain(&a);
        assert_eq!(proctoring_action(&moves[0]), Some((ProctoringAction::Leave, collecting.as_str())));
        assert_eq!(proctoring_action(&moves[1]), Some((ProctoringAction::Join, break_out.name.as_str())));
        assert!(f.drain(&b).is_empty());

        let closed = f.manager.close_proctoring_room(PROCTORED_EXAM, &break_out.name).await.unwrap();
        assert_eq!(closed.size(), 1);
        assert!(!f.backend.is_provisioned(&break_out.name));
        let leave = f.drain(&a);
        assert_eq!(proctoring_action(&leave[0]), Some((ProctoringAction::Leave, break_out.name.as_str())));
        assert_eq!(
            leave[1].kind,
            InstructionKind::ReconfigureSettings { settings_url: None, reset_proctoring: true }
        );
        assert!(f.manager.proctoring().is_marked(&a));

        f.manager.reconcile_rooms().await;
        let rooms = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, collecting);
        assert_eq!(rooms[0].size(), 2);
    }

    #[tokio::test]
    async fn failed_move_keeps_storage_in_step_with_memory() {
        let f = fixture();
        let a = f.connect(PROCTORED_EXAM, "10.0.0.1");
        let b = f.connect(PROCTORED_EXAM, "10.0.0.2");
        f.manager.reconcile_rooms().await;
        f.drain(&a);
        f.drain(&b);
        let collecting = f.manager.rooms(PROCTORED_EXAM).await.unwrap()[0].name.clone();

        // Saving the break-out room, LEAVE, JOIN and the source room succeed;
        // every attempt at saving the target room fails.
        f.persistence.fail_after(4, f.config.store_retry_attempts);
        let break_out = f
            .manager
            .create_break_out_room(PROCTORED_EXAM, "Question", &[a.clone()])
            .await
            .unwrap();
        assert!(break_out.is_empty());
        assert!(f.manager.proctoring().is_marked(&a));

        let in_memory = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        let stored = f.restart().rooms(PROCTORED_EXAM).await.unwrap();
        for rooms in [&in_memory, &stored] {
            let room = rooms.iter().find(|r| r.name == collecting).unwrap();
            assert!(room.members.contains(&a));
            assert!(room.members.contains(&b));
        }
    }

    #[tokio::test]
    async fn default_collecting_room_survives_a_restart() {
        let mut config = SessionConfig::default();
        config.collecting_room_capacity = 1;
        let f = fixture_with(config);
        let a = f.connect(PROCTORED_EXAM, "10.0.0.1");
        let b = f.connect(PROCTORED_EXAM, "10.0.0.2");
        f.manager.reconcile_rooms().await;

        let rooms = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        assert_eq!(rooms.len(), 2);
        let primary: Vec<&ProctoringRoom> = rooms.iter().filter(|r| r.primary).collect();
        assert_eq!(primary.len(), 1);
        let primary = primary[0].name.clone();

        f.manager.close_connection(&a, INSTITUTION, "10.0.0.1").unwrap();
        f.manager.close_connection(&b, INSTITUTION, "10.0.0.2").unwrap();

        // The exam still runs, so only the default room is kept once empty.
        let restarted = f.restart();
        assert_eq!(restarted.proctoring().dispose_rooms_for_exam(PROCTORED_EXAM).await.unwrap(), 1);
        let left = restarted.rooms(PROCTORED_EXAM).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, primary);
    }

    #[tokio::test]
    async fn break_out_requires_active_members_of_a_proctored_exam() {
        let f = fixture();
        let plain = f.connect(PLAIN_EXAM, "10.0.0.1");
        assert!(matches!(
            f.manager.create_break_out_room(PLAIN_EXAM, "x", &[plain]).await,
            Err(SessionError::Validation(_))
        ));

        let waiting = f.create(Some(PROCTORED_EXAM), "10.0.0.2");
        assert!(matches!(
            f.manager.create_break_out_room(PROCTORED_EXAM, "x", &[waiting]).await,
            Err(SessionError::StateConflict(_))
        ));
        assert!(f.manager.rooms(PROCTORED_EXAM).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn occupied_collecting_room_cannot_be_closed_while_running() {
        let f = fixture();
        f.connect(PROCTORED_EXAM, "10.0.0.1");
        f.manager.reconcile_rooms().await;
        let collecting = f.manager.rooms(PROCTORED_EXAM).await.unwrap()[0].name.clone();

        assert!(matches!(
            f.manager.close_proctoring_room(PROCTORED_EXAM, &collecting).await,
            Err(SessionError::StateConflict(_))
        ));
        assert!(matches!(
            f.manager.close_proctoring_room(PROCTORED_EXAM, "no-such-room").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn townhall_gathers_everyone() {
        let f = fixture();
        let tokens: Vec<String> = (1..=3).map(|i| f.connect(PROCTORED_EXAM, &format!("10.0.0.{i}"))).collect();
        f.manager.reconcile_rooms().await;

        let townhall = f.manager.open_townhall(PROCTORED_EXAM, None).await.unwrap();
        assert_eq!(townhall.subject, "Town-hall");
        let again = f.manager.open_townhall(PROCTORED_EXAM, Some("Other")).await.unwrap();
        assert_eq!(again.name, townhall.name);

        let report = f.manager.reconcile_rooms().await;
        assert_eq!(report.assigned, 3);
        let rooms = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        let hall = of_type(&rooms, RoomType::Townhall);
        assert_eq!(hall[0].size(), 3);
        // The default collecting room stays, empty, for the rest of the exam.
        let collecting = of_type(&rooms, RoomType::Collecting);
        assert_eq!(collecting.len(), 1);
        assert!(collecting[0].is_empty());

        f.manager.close_proctoring_room(PROCTORED_EXAM, &townhall.name).await.unwrap();
        f.manager.reconcile_rooms().await;
        let rooms = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        assert!(of_type(&rooms, RoomType::Townhall).is_empty());
        assert_eq!(of_type(&rooms, RoomType::Collecting)[0].size(), tokens.len());
    }

    #[tokio::test]
    async fn departed_members_are_pruned() {
        let f = fixture();
        let a = f.connect(PROCTORED_EXAM, "10.0.0.1");
        f.connect(PROCTORED_EXAM, "10.0.0.2");
        f.manager.reconcile_rooms().await;

        f.manager.close_connection(&a, INSTITUTION, "10.0.0.1").unwrap();
        let report = f.manager.reconcile_rooms().await;
        assert_eq!(report.pruned, 1);

        let rooms = f.manager.rooms(PROCTORED_EXAM).await.unwrap();
        assert_eq!(rooms[0].size(), 1);
        assert!(!rooms[0].members.contains(&a));
    }

    #[tokio::test]
    async fn backend_outage_keeps_connections_waiting() {
        let f = fixture();
        f.backend.set_unavailable(true);
        let a = f.connect(PROCTORED_EXAM, "10.0.0.1");

        let report = f.manager.reconcile_rooms().await;
        assert_eq!(report.assigned, 0);
        assert_eq!(report.failures, 1);
        assert!(f.manager.proctoring().is_marked(&a));
        assert!(f.drain(&a).is_empty());

        f.backend.set_unavailable(false);
        assert_eq!(f.manager.reconcile_rooms().await.assigned, 1);
        assert!(!f.manager.proctoring().is_marked(&a));
    }

    #[tokio::test]
    async fn ending_the_exam_closes_connections_and_releases_rooms() {
        let f = fixture();
        let a = f.connect(PROCTORED_EXAM, "10.0.0.1");
        let b = f.connect(PROCTORED_EXAM, "10.0.0.2");
        f.manager.reconcile_rooms().await;
        f.manager
            .create_break_out_room(PROCTORED_EXAM, "Side", &[b.clone()])
            .await
            .unwrap();
        assert_eq!(f.backend.provisioned_count(), 2);

        f.exams.set_running(PROCTORED_EXAM, false);
        let report = f.manager.end_exam(PROCTORED_EXAM).await.unwrap();
        assert_eq!(report.closed, 2);
        assert!(report.failed.is_empty());
        assert_eq!(report.rooms_disposed, 2);
        assert_eq!(f.backend.provisioned_count(), 0);
        assert!(f.manager.rooms(PROCTORED_EXAM).await.unwrap().is_empty());

        for token in [&a, &b] {
            assert_eq!(f.manager.get_connection(token).unwrap().status, ConnectionStatus::Closed);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

mod config {
    use seb_services::ConfigError;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn partial_file_is_filled_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            r#"{ "pingThresholdMs": 9000, "exams": [{ "id": 7, "institutionId": 2, "proctoringEnabled": true }] }"#,
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.ping_threshold_ms, 9_000);
        assert_eq!(config.store_retry_attempts, SessionConfig::default().store_retry_attempts);
        assert_eq!(config.exams.len(), 1);
        assert!(config.exams[0].running);
        assert!(!config.exams[0].vdi);
        assert!(config.exams[0].proctoring_enabled);
    }

    #[test]
    fn unreadable_or_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SessionConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(SessionConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background jobs
// ─────────────────────────────────────────────────────────────────────────────

mod scheduler {
    use std::sync::Mutex;
    use std::time::Duration;

    use seb_server::{Job, JobError, PingSweepJob, RoomReconcileJob, Scheduler};
    use tokio::time::Instant;

    use super::*;

    struct Recorder {
        name: &'static str,
        interval: Duration,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Job for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn run(&self) -> Result<(), JobError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err("boom".into());
            }
            Ok(())
        }
    }

    fn recorder(name: &'static str, interval: Duration, fail: bool, log: &Arc<Mutex<Vec<&'static str>>>) -> Recorder {
        Recorder { name, interval, fail, log: log.clone() }
    }

    #[tokio::test]
    async fn due_jobs_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = Scheduler::new();
        scheduler.register(recorder("sweep", Duration::from_millis(10), false, &log));
        scheduler.register(recorder("reconcile", Duration::from_millis(10), true, &log));
        scheduler.register(recorder("cleanup", Duration::from_secs(3600), false, &log));
        assert_eq!(scheduler.job_names(), vec!["sweep", "reconcile", "cleanup"]);

        let ran = scheduler.run_due(Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(ran, 2);
        assert_eq!(*log.lock().unwrap(), vec!["sweep", "reconcile"]);
        assert_eq!(scheduler.stats("sweep"), Some((1, 0)));
        assert_eq!(scheduler.stats("reconcile"), Some((1, 1)));
        assert_eq!(scheduler.stats("cleanup"), Some((0, 0)));
    }

    #[tokio::test]
    async fn nothing_runs_before_first_interval() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = Scheduler::new();
        scheduler.register(recorder("slow", Duration::from_secs(60), false, &log));
        assert_eq!(scheduler.run_due(Instant::now()).await, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn started_scheduler_ticks_until_stopped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = Scheduler::new();
        scheduler.register(recorder("fast", Duration::from_millis(10), false, &log));

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let scheduler = handle.stop().await.unwrap();

        let (runs, failures) = scheduler.stats("fast").unwrap();
        assert!(runs >= 1);
        assert_eq!(failures, 0);
    }

    #[tokio::test]
    async fn session_jobs_drive_the_manager() {
        let f = fixture();
        let token = f.connect(PROCTORED_EXAM, "10.0.0.1");
        f.backend.set_unavailable(true);
        f.clock.set(60_000);

        let mut scheduler = Scheduler::new();
        scheduler.register(PingSweepJob::new(f.manager.clone()));
        scheduler.register(RoomReconcileJob::new(f.manager.clone()));
        scheduler.run_due(Instant::now() + Duration::from_secs(3600)).await;

        assert_eq!(f.manager.incidents(), vec![token]);
        assert_eq!(scheduler.stats("ping-sweep"), Some((1, 0)));
        assert_eq!(scheduler.stats("proctoring-reconcile"), Some((1, 1)));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

mod router {
    use seb_protocol::RpcErrorCode;
    use seb_server::SessionServer;
    use seb_transport::RequestHandler;
    use serde_json::json;

    use super::*;

    async fn server(f: &Fixture) -> SessionServer {
        let mut server = SessionServer::with_session_services(f.manager.clone());
        server.initialize().await.unwrap();
        server
    }

    /// Records what each request looked like on the way in and out.
    struct Trace {
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl seb_server::Middleware for Trace {
        async fn before(&self, method: &str, params: Option<&serde_json::Value>) {
            self.log.lock().unwrap().push(format!("before {method} {}", params.is_some()));
        }

        async fn after(&self, method: &str, result: &seb_protocol::HandlerResult, _elapsed: std::time::Duration) {
            self.log.lock().unwrap().push(format!("after {method} {}", result.is_ok()));
        }

        fn name(&self) -> &str {
            "trace"
        }
    }

    #[tokio::test]
    async fn middleware_sees_every_routed_request() {
        let f = fixture();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut server = SessionServer::with_session_services(f.manager.clone());
        server.add_middleware(Trace { log: log.clone() });
        assert_eq!(server.middleware_names(), vec!["request-log", "trace"]);
        server.initialize().await.unwrap();

        server.handle_request("monitoring/incidents", None).await.unwrap();
        server
            .handle_request("connection/get", Some(json!({ "connectionToken": "ghost" })))
            .await
            .unwrap_err();
        server.handle_request("nope/x", None).await.unwrap_err();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before monitoring/incidents false",
                "after monitoring/incidents true",
                "before connection/get true",
                "after connection/get false",
                "before nope/x false",
                "after nope/x false",
            ]
        );
    }

    #[tokio::test]
    async fn requests_before_initialize_are_refused() {
        let f = fixture();
        let server = SessionServer::with_session_services(f.manager.clone());
        let err = server.handle_request("monitoring/incidents", None).await.unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::ServerNotInitialized);
    }

    #[tokio::test]
    async fn unknown_methods_are_not_found() {
        let f = fixture();
        let server = server(&f).await;
        for method in ["nope/x", "connection/delete", "seb/quit"] {
            let err = server.handle_request(method, None).await.unwrap_err();
            assert_eq!(err.error_code(), RpcErrorCode::MethodNotFound, "{method}");
        }
    }

    #[tokio::test]
    async fn bad_params_are_invalid_params() {
        let f = fixture();
        let server = server(&f).await;
        let err = server
            .handle_request("connection/create", Some(json!({ "institutionId": "one" })))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::InvalidParams);

        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");
        let err = server
            .handle_request(
                "connection/establish",
                Some(json!({ "connectionToken": token, "clientAddress": "10.0.0.1" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::InvalidParams);
    }

    #[tokio::test]
    async fn client_flow_over_rpc() {
        let f = fixture();
        let server = server(&f).await;

        let created = server
            .handle_request(
                "connection/create",
                Some(json!({ "institutionId": 1, "clientAddress": "10.0.0.1", "examId": PLAIN_EXAM })),
            )
            .await
            .unwrap();
        assert_eq!(created["status"], "CONNECTION_REQUESTED");
        let token = created["connectionToken"].as_str().unwrap().to_string();

        let establish = json!({ "connectionToken": token, "institutionId": 1, "clientAddress": "10.0.0.1" });
        server.handle_request("connection/establish", Some(establish.clone())).await.unwrap();
        let active = server.handle_request("connection/establish", Some(establish)).await.unwrap();
        assert_eq!(active["status"], "ACTIVE");

        let registered = server
            .handle_request(
                "instruction/register",
                Some(json!({
                    "examId": PLAIN_EXAM,
                    "instruction": "SEB_FORCE_LOCK_SCREEN",
                    "attributes": { "message": "Stop" },
                    "connectionTokens": [token],
                    "needsConfirmation": true,
                })),
            )
            .await
            .unwrap();
        assert_eq!(registered["registered"], 1);
        let confirm_id = registered["confirmIds"][0].as_str().unwrap().to_string();

        let ping = server
            .handle_request("seb/ping", Some(json!({ "connectionToken": token, "pingNumber": 1 })))
            .await
            .unwrap();
        assert_eq!(ping["instruction"]["instruction"], "SEB_FORCE_LOCK_SCREEN");
        assert_eq!(ping["instruction"]["attributes"]["message"], "Stop");
        assert_eq!(ping["instruction"]["attributes"]["confirmId"], confirm_id);

        let ping = server
            .handle_request("seb/ping", Some(json!({ "connectionToken": token, "pingNumber": 2 })))
            .await
            .unwrap();
        assert!(ping["instruction"].is_null());

        let confirmed = server
            .handle_request("instruction/confirm", Some(json!({ "connectionToken": token, "confirmId": confirm_id })))
            .await
            .unwrap();
        assert_eq!(confirmed["confirmed"], true);

        let event = server
            .handle_request(
                "seb/event",
                Some(json!({ "connectionToken": token, "type": "NOTIFICATION", "text": "<lockscreen>" })),
            )
            .await
            .unwrap();
        let notification_id = event["id"].as_u64().unwrap();
        let pending = server
            .handle_request("notification/hasPending", Some(json!({ "connectionToken": token })))
            .await
            .unwrap();
        assert_eq!(pending["pending"], true);
        let confirmed = server
            .handle_request(
                "notification/confirm",
                Some(json!({ "connectionToken": token, "notificationId": notification_id })),
            )
            .await
            .unwrap();
        assert_eq!(confirmed["confirmed"], true);

        let closed = server
            .handle_request(
                "connection/close",
                Some(json!({ "connectionToken": token, "institutionId": 1, "clientAddress": "10.0.0.1" })),
            )
            .await
            .unwrap();
        assert_eq!(closed["status"], "CLOSED");
    }

    #[tokio::test]
    async fn bulk_disable_reports_each_token() {
        let f = fixture();
        let server = server(&f).await;
        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");

        let result = server
            .handle_request(
                "connection/disableMany",
                Some(json!({ "connectionTokens": [token, "ghost"], "institutionId": 1 })),
            )
            .await
            .unwrap();
        let results = result["results"].as_array().unwrap();
        assert_eq!(results[0]["status"], "DISABLED");
        assert_eq!(results[1]["connectionToken"], "ghost");
        assert_eq!(results[1]["error"]["code"], RpcErrorCode::NotFound.code());
    }

    #[tokio::test]
    async fn store_outage_is_reported_as_retryable() {
        let f = fixture();
        let server = server(&f).await;
        let token = f.create(Some(PLAIN_EXAM), "10.0.0.1");

        f.persistence.fail_next(f.config.store_retry_attempts);
        let err = server
            .handle_request(
                "connection/establish",
                Some(json!({ "connectionToken": token, "institutionId": 1, "clientAddress": "10.0.0.1" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), RpcErrorCode::TransientStore);
        assert_eq!(err.data, Some(json!({ "retryable": true })));
    }

    #[tokio::test]
    async fn incidents_and_rooms_are_exposed() {
        let f = fixture();
        let server = server(&f).await;
        let token = f.connect(PROCTORED_EXAM, "10.0.0.1");
        f.clock.set(60_000);
        f.manager.sweep_pings();
        f.manager.reconcile_rooms().await;

        let incidents = server.handle_request("monitoring/incidents", None).await.unwrap();
        assert_eq!(incidents["incidents"], json!([token]));
        assert_eq!(incidents["thresholdMs"], 5_000);

        let rooms = server
            .handle_request("proctoring/rooms", Some(json!({ "examId": PROCTORED_EXAM })))
            .await
            .unwrap();
        assert_eq!(rooms["rooms"][0]["roomType"], "COLLECTING");
        assert_eq!(rooms["rooms"][0]["members"], json!([token]));

        let ended = server
            .handle_request("proctoring/endExam", Some(json!({ "examId": PROCTORED_EXAM })))
            .await
            .unwrap();
        assert_eq!(ended["closed"], 1);
    }
}
