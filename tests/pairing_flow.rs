//! End-to-end pairing flows.
//!
//! Drives the orchestrator against the scripted transport and a throwaway
//! credential backend. No messaging network or external service is needed.
//!
//! Run: `cargo test --test pairing_flow`

mod support;

// ============================================================================
// 1. Successful linking
// ============================================================================
mod linking {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use pairgate::pairing::{PairingRequest, SESSION_ID_PREFIX};
    use pairgate::transport::scripted::{DEFAULT_SCRIPTED_CODE, Script, ScriptedTransport};
    use pairgate::transport::{Address, MessageKey};

    use crate::support::*;

    #[tokio::test]
    async fn test_code_then_uploaded_id() {
        let root = TempDir::new().unwrap();
        let (base_url, uploads) = mock_backend().await;
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(Some(base_url)),
            fast_pairing(&root),
        );
        let (sink, codes) = recording_sink();

        let outcome = orchestrator
            .pair(PairingRequest::new("+62 812-3456-789"), sink)
            .await
            .expect("pairing should link");

        assert_eq!(*codes.lock().unwrap(), vec![DEFAULT_SCRIPTED_CODE.to_string()]);
        assert!(outcome.session_id.starts_with(SESSION_ID_PREFIX));
        assert!(outcome.id.starts_with(SESSION_ID_PREFIX));
        assert_ne!(outcome.session_id, outcome.id);
        assert!(outcome.uploaded);

        let uploads = uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0]["credsId"], outcome.id.as_str());
        assert_eq!(uploads[0]["credsData"]["registered"], true);

        let client = &transport.clients()[0];
        assert_eq!(client.code_requests(), vec!["628123456789".to_string()]);
        assert_eq!(client.close_count(), 1);
        assert!(!root.path().join(&outcome.session_id).exists());

        let sent = client.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, Address::new("628123456789@s.whatsapp.net"));
        assert_eq!(sent[0].1.text, outcome.id);
        assert_eq!(sent[0].1.quoted, None);
        assert_eq!(sent[1].0, sent[0].0);
        assert_eq!(sent[1].1.quoted, Some(MessageKey("SCRIPTED0001".to_string())));
    }

    #[tokio::test]
    async fn test_falls_back_to_own_address() {
        let root = TempDir::new().unwrap();
        let phone = Address::for_phone_digits("628123456789");
        let own = Address::new("100200300@s.whatsapp.net");
        let transport = Arc::new(ScriptedTransport::with_script(
            Script::linking()
                .failing_send_to(phone.clone())
                .own_address(Some(own.clone())),
        ));
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );
        let (sink, _) = recording_sink();

        let outcome = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap();

        let sent = transport.clients()[0].sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].0, phone);
        assert_eq!(sent[1].0, own);
        assert_eq!(sent[1].1.text, outcome.id);
        assert_eq!(sent[2].0, own);
        assert_eq!(sent[2].1.quoted, Some(MessageKey("SCRIPTED0002".to_string())));
    }

    #[tokio::test]
    async fn test_send_failures_do_not_fail_pairing() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(
            Script::linking()
                .failing_send_to(Address::for_phone_digits("628123456789"))
                .own_address(None),
        ));
        let orchestrator = orchestrator(&root, transport, backend_at(None), fast_pairing(&root));
        let (sink, _) = recording_sink();

        let outcome = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_backend_outage_still_returns_id() {
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            &root,
            Arc::new(ScriptedTransport::new()),
            backend_at(Some("http://127.0.0.1:9".to_string())),
            fast_pairing(&root),
        );
        let (sink, _) = recording_sink();

        let outcome = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap();
        assert!(!outcome.uploaded);
        assert!(outcome.id.starts_with(SESSION_ID_PREFIX));
    }

    #[tokio::test]
    async fn test_uploaded_bundle_can_be_downloaded() {
        let root = TempDir::new().unwrap();
        let (base_url, _) = mock_backend().await;
        let orchestrator = orchestrator(
            &root,
            Arc::new(ScriptedTransport::new()),
            backend_at(Some(base_url)),
            fast_pairing(&root),
        );
        let (sink, _) = recording_sink();

        let outcome = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap();
        let bundle = orchestrator
            .store()
            .download_bundle(&outcome.id)
            .await
            .unwrap();
        assert_eq!(bundle["registered"], true);

        assert!(
            orchestrator
                .store()
                .download_bundle(&format!("{}missing1", SESSION_ID_PREFIX))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_isolated() {
        let root = TempDir::new().unwrap();
        let orchestrator = orchestrator(
            &root,
            Arc::new(ScriptedTransport::new()),
            backend_at(None),
            fast_pairing(&root),
        );

        let mut handles = Vec::new();
        for i in 0..5 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                let (sink, codes) = recording_sink();
                let outcome = orchestrator
                    .pair(PairingRequest::new(format!("62812345678{}", i)), sink)
                    .await
                    .unwrap();
                assert_eq!(codes.lock().unwrap().len(), 1);
                outcome
            }));
        }

        let mut session_ids = std::collections::HashSet::new();
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            session_ids.insert(outcome.session_id);
            ids.insert(outcome.id);
        }
        assert_eq!(session_ids.len(), 5);
        assert_eq!(ids.len(), 5);
        assert_eq!(session_dirs(&root), 0);
    }
}

// ============================================================================
// 2. Failures and cleanup
// ============================================================================
mod failures {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use pairgate::error::PairingError;
    use pairgate::pairing::PairingRequest;
    use pairgate::transport::scripted::{Script, ScriptedTransport};

    use crate::support::*;

    #[tokio::test]
    async fn test_invalid_phone_touches_nothing() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );

        for raw in ["", "   ", "12345", "not-a-phone"] {
            let (sink, codes) = recording_sink();
            let err = orchestrator
                .pair(PairingRequest::new(raw), sink)
                .await
                .unwrap_err();
            assert!(matches!(err, PairingError::InvalidPhoneNumber { .. }));
            assert!(codes.lock().unwrap().is_empty());
        }
        assert_eq!(session_dirs(&root), 0);
        assert!(transport.clients().is_empty());
    }

    #[tokio::test]
    async fn test_close_before_open_fails_once() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(Script::closing(428)));
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );
        let (sink, codes) = recording_sink();

        let err = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap_err();
        match &err {
            PairingError::ConnectionClosed { reason, .. } => assert!(reason.contains("428")),
            other => panic!("expected ConnectionClosed, got {:?}", other),
        }
        assert_eq!(err.kind(), "transport");
        assert_eq!(codes.lock().unwrap().len(), 1);
        assert_eq!(transport.clients().len(), 1);
        assert_eq!(session_dirs(&root), 0);
        assert_eq!(transport.clients()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_only_after_cleanup() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(Script::closing(428)));
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );

        for round in 0..20 {
            let (sink, _) = recording_sink();
            orchestrator
                .pair(PairingRequest::new("628123456789"), sink)
                .await
                .unwrap_err();
            assert_eq!(session_dirs(&root), 0, "directory left behind in round {}", round);
            assert_eq!(
                transport.clients()[round].close_count(),
                1,
                "transport still open in round {}",
                round
            );
        }
    }

    #[tokio::test]
    async fn test_timeout_settles_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(Script::silent()));
        let pairing = pairgate::config::PairingConfig {
            timeout: Duration::from_millis(150),
            ..fast_pairing(&root)
        };
        let orchestrator = orchestrator(&root, Arc::clone(&transport), backend_at(None), pairing);
        let (sink, codes) = recording_sink();

        let started = std::time::Instant::now();
        let err = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::Timeout { .. }));
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(codes.lock().unwrap().len(), 1);

        assert_eq!(session_dirs(&root), 0);
        assert_eq!(transport.clients()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_code_request_failure() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(
            Script::linking().code_error("rate-overlimit"),
        ));
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );
        let (sink, codes) = recording_sink();

        let err = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap_err();
        match err {
            PairingError::CodeRequest { reason, .. } => assert!(reason.contains("rate-overlimit")),
            other => panic!("expected CodeRequest, got {:?}", other),
        }
        assert!(codes.lock().unwrap().is_empty());
        assert_eq!(session_dirs(&root), 0);
        assert_eq!(transport.clients()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_a_transport_error() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(
            Script::linking().connect_error("bridge unreachable"),
        ));
        let orchestrator = orchestrator(&root, transport, backend_at(None), fast_pairing(&root));
        let (sink, _) = recording_sink();

        let err = orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::Transport(_)));
        assert_eq!(session_dirs(&root), 0);
    }

    #[tokio::test]
    async fn test_registered_identity_links_without_code() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(
            Script::linking().registered(),
        ));
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );
        let (sink, codes) = recording_sink();

        orchestrator
            .pair(PairingRequest::new("628123456789"), sink)
            .await
            .unwrap();
        assert!(codes.lock().unwrap().is_empty());
        assert!(transport.clients()[0].code_requests().is_empty());
    }
}

// ============================================================================
// 3. Keep-alive
// ============================================================================
mod keep_alive {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use pairgate::error::PairingError;
    use pairgate::pairing::PairingRequest;
    use pairgate::transport::scripted::{Script, ScriptStep, ScriptedTransport};
    use pairgate::transport::{ConnectionUpdate, DisconnectReason};

    use crate::support::*;

    #[tokio::test]
    async fn test_restarts_until_linked() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_scripts(vec![
            Script::closing(428),
            Script::closing(515),
            Script::linking(),
        ]));
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );
        let (sink, codes) = recording_sink();

        let outcome = orchestrator
            .pair(PairingRequest::new("628123456789").keep_alive(true), sink)
            .await
            .unwrap();

        let clients = transport.clients();
        assert_eq!(clients.len(), 3);
        // A fresh code per attempt.
        assert_eq!(codes.lock().unwrap().len(), 3);
        // The linked session stays open; failed attempts are cleaned up.
        assert_eq!(clients[2].close_count(), 0);
        assert!(root.path().join(&outcome.session_id).exists());
        assert_eq!(session_dirs(&root), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(Script::closing(428)));
        let mut pairing = fast_pairing(&root);
        pairing.retry.max_attempts = 3;
        let orchestrator = orchestrator(&root, Arc::clone(&transport), backend_at(None), pairing);
        let (sink, _) = recording_sink();

        let err = orchestrator
            .pair(PairingRequest::new("628123456789").keep_alive(true), sink)
            .await
            .unwrap_err();
        match err {
            PairingError::RetriesExhausted {
                attempts,
                last_reason,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_reason.contains("428"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(transport.clients().len(), 3);
        assert_eq!(session_dirs(&root), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_not_restarted() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(Script::silent()));
        let pairing = pairgate::config::PairingConfig {
            timeout: Duration::from_millis(100),
            ..fast_pairing(&root)
        };
        let orchestrator = orchestrator(&root, Arc::clone(&transport), backend_at(None), pairing);
        let (sink, _) = recording_sink();

        let err = orchestrator
            .pair(PairingRequest::new("628123456789").keep_alive(true), sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::Timeout { .. }));
        assert_eq!(transport.clients().len(), 1);
    }

    #[tokio::test]
    async fn test_linked_session_lingers_until_closed() {
        let root = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with_script(
            Script::linking()
                .then(ScriptStep::Pause(Duration::from_millis(300)))
                .then(ScriptStep::Connection(ConnectionUpdate::Closed {
                    reason: DisconnectReason::Status(401),
                })),
        ));
        let orchestrator = orchestrator(
            &root,
            Arc::clone(&transport),
            backend_at(None),
            fast_pairing(&root),
        );
        let (sink, _) = recording_sink();

        let outcome = orchestrator
            .pair(PairingRequest::new("628123456789").keep_alive(true), sink)
            .await
            .unwrap();
        let dir = root.path().join(&outcome.session_id);
        assert!(dir.exists());
        assert_eq!(transport.clients()[0].close_count(), 0);

        assert!(wait_until(|| !dir.exists()).await);
        assert!(wait_until(|| transport.clients()[0].close_count() == 1).await);
        assert_eq!(transport.clients().len(), 1);
    }
}
