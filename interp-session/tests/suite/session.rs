use assert_matches::assert_matches;
use interp_session::InterpreterSession;
use interp_session::SessionConfig;
use interp_session::SessionError;
use interp_session::Status;
use pretty_assertions::assert_eq;
use tokio::time::Duration;

use super::poll_until_done;
use super::sh_config;
use super::sh_session;

#[tokio::test]
async fn second_lock_is_refused_until_unlock() {
    let session = sh_session().await;

    assert!(!session.is_locked());
    assert!(session.try_lock("instance-a"));
    assert!(!session.try_lock("instance-b"));
    assert!(!session.try_lock("instance-a"));
    assert_eq!(session.lock_holder().as_deref(), Some("instance-a"));

    session.unlock("instance-a").unwrap();
    assert!(!session.is_locked());
    assert!(session.try_lock("instance-b"));

    session.unlock("instance-b").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_lock_attempts_have_one_winner() {
    let session = std::sync::Arc::new(sh_session().await);

    let attempts: Vec<_> = (0..16)
        .map(|i| {
            let session = session.clone();
            tokio::spawn(async move { session.try_lock(&format!("caller-{i}")) })
        })
        .collect();
    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    session.force_unlock();
    session.close().await.unwrap();
}

#[tokio::test]
async fn unlock_by_another_caller_is_rejected() {
    let session = sh_session().await;
    assert!(session.try_lock("owner"));

    let err = session.unlock("intruder").unwrap_err();
    assert_matches!(
        err,
        SessionError::NotLockHolder { ref caller, holder: Some(ref holder) }
            if caller == "intruder" && holder == "owner"
    );
    assert_eq!(session.lock_holder().as_deref(), Some("owner"));

    session.force_unlock();
    assert!(!session.is_locked());
    session.unlock("anyone").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn output_before_sentinel_is_returned_on_success() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    let status = session
        .submit("caller", "echo hello; echo END_OF_SCRIPT")
        .await;
    assert_eq!(status, Status::Running);

    assert_eq!(poll_until_done(&session, "caller").await, Status::Success);
    assert_eq!(session.read_output("caller").await.unwrap(), "hello\n\t");
    assert_eq!(session.read_error_output("caller").await.unwrap(), "");

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn error_output_turns_finished_command_into_script_error() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    session
        .submit("caller", "echo partial; echo END_OF_SCRIPT; echo broken 1>&2")
        .await;

    assert_eq!(poll_until_done(&session, "caller").await, Status::ScriptError);
    assert_eq!(
        session.output_lines("caller").await.unwrap(),
        vec!["partial".to_string()]
    );
    assert_eq!(
        session.error_lines("caller").await.unwrap(),
        vec!["broken".to_string()]
    );

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn error_output_without_sentinel_keeps_running() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    session.submit("caller", "echo warning 1>&2").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(session.poll("caller").await, Status::Running);
    assert_eq!(
        session.error_lines("caller").await.unwrap(),
        vec!["warning".to_string()]
    );

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn success_is_sticky_and_later_output_is_left_alone() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    session
        .submit(
            "caller",
            "echo done; echo END_OF_SCRIPT; sleep 0.4; echo afterwards; echo late 1>&2",
        )
        .await;
    assert_eq!(poll_until_done(&session, "caller").await, Status::Success);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(session.poll("caller").await, Status::Success);
    assert_eq!(
        session.output_lines("caller").await.unwrap(),
        vec!["done".to_string()]
    );
    assert!(session.error_lines("caller").await.unwrap().is_empty());

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn next_command_starts_with_fresh_buffers() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    session.submit("caller", "echo one; echo END_OF_SCRIPT").await;
    assert_eq!(poll_until_done(&session, "caller").await, Status::Success);

    session.submit("caller", "echo two; echo END_OF_SCRIPT").await;
    assert_eq!(poll_until_done(&session, "caller").await, Status::Success);
    assert_eq!(session.read_output("caller").await.unwrap(), "two\n\t");

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn non_owner_submit_is_rejected_without_writing() {
    let session = sh_session().await;
    assert!(session.try_lock("owner"));

    assert_eq!(
        session.submit("intruder", "echo leaked").await,
        Status::CallerMismatch
    );
    assert_eq!(session.poll("intruder").await, Status::CallerMismatch);
    assert_matches!(
        session.read_output("intruder").await,
        Err(SessionError::CallerMismatch { .. })
    );

    session.submit("owner", "echo END_OF_SCRIPT").await;
    assert_eq!(poll_until_done(&session, "owner").await, Status::Success);
    assert!(session.output_lines("owner").await.unwrap().is_empty());

    session.unlock("owner").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn poll_before_submit_reports_running() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    assert_eq!(session.poll("caller").await, Status::Running);
    assert!(session.output_lines("caller").await.unwrap().is_empty());

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn banner_printed_at_startup_is_discarded() {
    let session = InterpreterSession::create(SessionConfig {
        args: vec!["-c".to_string(), "echo Welcome; exec sh".to_string()],
        startup_grace_ms: 300,
        ..sh_config()
    })
    .await
    .unwrap();
    assert!(session.try_lock("caller"));

    session.submit("caller", "echo END_OF_SCRIPT").await;
    assert_eq!(poll_until_done(&session, "caller").await, Status::Success);
    assert!(session.output_lines("caller").await.unwrap().is_empty());

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn startup_error_output_fails_creation() {
    let err = InterpreterSession::create(SessionConfig {
        args: vec!["-c".to_string(), "echo cannot load profile 1>&2; exec sh".to_string()],
        startup_grace_ms: 300,
        ..sh_config()
    })
    .await
    .unwrap_err();

    assert_matches!(
        err,
        SessionError::StartupFailure { ref stderr } if stderr == "cannot load profile"
    );
}

#[tokio::test]
async fn missing_interpreter_fails_to_spawn() {
    let err = InterpreterSession::create(SessionConfig {
        program: "definitely-not-an-interpreter-on-path".to_string(),
        ..sh_config()
    })
    .await
    .unwrap_err();

    assert_matches!(err, SessionError::Spawn { .. });
}

#[tokio::test]
async fn closed_input_reports_stdin_closed_and_close_still_kills() {
    let session = InterpreterSession::create(SessionConfig {
        args: vec!["-c".to_string(), "exec 0<&-; sleep 30".to_string()],
        startup_grace_ms: 200,
        ..sh_config()
    })
    .await
    .unwrap();
    assert!(session.try_lock("caller"));

    assert_eq!(
        session.submit("caller", "echo END_OF_SCRIPT").await,
        Status::StdinClosed
    );
    assert_eq!(session.poll("caller").await, Status::StdinClosed);
    assert!(!session.has_exited().await);

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
    assert!(session.has_exited().await);
}

#[tokio::test]
async fn close_requires_the_session_to_be_free() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    assert_matches!(
        session.close().await,
        Err(SessionError::Locked { ref holder }) if holder == "caller"
    );
    assert!(!session.has_exited().await);

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
    assert!(session.has_exited().await);
    session.close().await.unwrap();

    assert!(session.try_lock("caller"));
    assert_eq!(
        session.submit("caller", "echo END_OF_SCRIPT").await,
        Status::StdinClosed
    );
}

#[tokio::test]
async fn late_output_stays_with_the_command_that_printed_it() {
    let session = sh_session().await;
    assert!(session.try_lock("instance-a"));

    session
        .submit(
            "instance-a",
            "echo END_OF_SCRIPT; sleep 0.3; echo late-out; echo late-from-a 1>&2",
        )
        .await;
    assert_eq!(poll_until_done(&session, "instance-a").await, Status::Success);
    tokio::time::sleep(Duration::from_millis(500)).await;
    session.unlock("instance-a").unwrap();

    assert!(session.try_lock("instance-b"));
    session
        .submit("instance-b", "echo ok; echo END_OF_SCRIPT")
        .await;
    assert_eq!(poll_until_done(&session, "instance-b").await, Status::Success);
    assert_eq!(
        session.output_lines("instance-b").await.unwrap(),
        vec!["ok".to_string()]
    );
    assert!(session.error_lines("instance-b").await.unwrap().is_empty());

    session.unlock("instance-b").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn error_text_without_line_break_is_script_error() {
    let session = sh_session().await;
    assert!(session.try_lock("caller"));

    session
        .submit("caller", "echo END_OF_SCRIPT; printf 'no newline error' 1>&2")
        .await;

    assert_eq!(poll_until_done(&session, "caller").await, Status::ScriptError);
    assert_eq!(
        session.error_lines("caller").await.unwrap(),
        vec!["no newline error".to_string()]
    );

    session.unlock("caller").unwrap();
    session.close().await.unwrap();
}

#[tokio::test]
async fn close_is_refused_while_a_poll_is_waiting() {
    let session = std::sync::Arc::new(
        InterpreterSession::create(SessionConfig {
            stderr_grace_ms: 1_000,
            ..sh_config()
        })
        .await
        .unwrap(),
    );
    assert!(session.try_lock("caller"));
    session.submit("caller", "echo END_OF_SCRIPT").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let polling = tokio::spawn({
        let session = session.clone();
        async move { session.poll("caller").await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.force_unlock();

    assert_matches!(session.close().await, Err(SessionError::Busy));
    assert!(!session.has_exited().await);

    assert_eq!(polling.await.unwrap(), Status::Success);
    session.close().await.unwrap();
    assert!(session.has_exited().await);
}

#[tokio::test]
async fn handed_over_session_refuses_the_previous_holder() {
    let session = sh_session().await;
    assert!(session.try_lock("instance-a"));
    session.force_unlock();
    assert!(session.try_lock("instance-b"));

    assert_eq!(
        session.submit("instance-a", "echo from-a").await,
        Status::CallerMismatch
    );

    session.submit("instance-b", "echo END_OF_SCRIPT").await;
    assert_eq!(poll_until_done(&session, "instance-b").await, Status::Success);
    assert!(session.output_lines("instance-b").await.unwrap().is_empty());

    session.unlock("instance-b").unwrap();
    session.close().await.unwrap();
}
