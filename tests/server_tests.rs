//! End-to-end gRPC tests over mutual TLS. Jobs run without cgroups so the
//! suite works unprivileged; the cgroup paths are covered in
//! resources_tests.


use std::sync::Arc;

use tonic::Code;
use uuid::Uuid;

use teleworker::client::{Client, ClientError};
use teleworker::job::JobStatus;
use teleworker::worker::{Options, Worker};
use test_harness::{poll_until, TestServer};

async fn test_server() -> TestServer {
    let worker = Arc::new(Worker::new(Options {
        cgroup_mgr: None,
        no_cleanup: false,
    }));
    TestServer::start(worker).await
}

fn rpc_code(err: ClientError) -> Code {
    match err {
        ClientError::Rpc(status) => status.code(),
        other => panic!("expected rpc error, got {other}"),
    }
}

/// Polls the job until it leaves `Running` and returns the final status.
async fn wait_terminal(client: &Client, job_id: &str) -> (JobStatus, Option<i32>) {
    poll_until("job to finish", || {
        let mut client = client.clone();
        let job_id = job_id.to_string();
        async move {
            let (status, _) = client.job_status(&job_id).await.expect("status failed");
            status != JobStatus::Running
        }
    })
    .await;
    client
        .clone()
        .job_status(job_id)
        .await
        .expect("status failed")
}

async fn read_stream_to_eof(client: &mut Client, job_id: &str) -> Vec<u8> {
    let mut stream = client.stream_output(job_id).await.expect("stream failed");
    let mut all = Vec::new();
    while let Some(chunk) = stream.message().await.expect("stream recv failed") {
        all.extend_from_slice(&chunk.data);
    }
    all
}

#[tokio::test]
async fn start_job_returns_valid_uuid() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let job_id = alice
        .start_job("echo".to_string(), vec!["hello".to_string()])
        .await
        .expect("start failed");
    Uuid::parse_str(&job_id).expect("job id is not a valid UUID");
}

#[tokio::test]
async fn start_job_empty_command_is_invalid_argument() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let err = alice
        .start_job(String::new(), Vec::new())
        .await
        .expect_err("expected error for empty command");
    assert_eq!(rpc_code(err), Code::InvalidArgument);
}

#[tokio::test]
async fn successful_job_reports_success_over_rpc() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let job_id = alice
        .start_job("true".to_string(), Vec::new())
        .await
        .expect("start failed");

    let (status, exit_code) = wait_terminal(&alice, &job_id).await;
    assert_eq!(status, JobStatus::Success);
    assert_eq!(exit_code, Some(0));
}

#[tokio::test]
async fn status_of_unknown_job_is_not_found() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    // Both a well-formed unknown id and a malformed one are NotFound.
    let err = alice
        .job_status(&Uuid::new_v4().to_string())
        .await
        .expect_err("expected error");
    assert_eq!(rpc_code(err), Code::NotFound);

    let err = alice
        .job_status("nonexistent-job")
        .await
        .expect_err("expected error");
    assert_eq!(rpc_code(err), Code::NotFound);
}

#[tokio::test]
async fn stop_job_reports_killed_with_137() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let job_id = alice
        .start_job("sleep".to_string(), vec!["60".to_string()])
        .await
        .expect("start failed");

    alice.stop_job(&job_id).await.expect("stop failed");

    let (status, exit_code) = wait_terminal(&alice, &job_id).await;
    assert_eq!(status, JobStatus::Killed);
    assert_eq!(exit_code, Some(137));

    let err = alice
        .stop_job(&job_id)
        .await
        .expect_err("expected error stopping a killed job");
    assert_eq!(rpc_code(err), Code::FailedPrecondition);
}

#[tokio::test]
async fn stop_finished_job_is_failed_precondition() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let job_id = alice
        .start_job("true".to_string(), Vec::new())
        .await
        .expect("start failed");
    wait_terminal(&alice, &job_id).await;

    let err = alice
        .stop_job(&job_id)
        .await
        .expect_err("expected error stopping a finished job");
    assert_eq!(rpc_code(err), Code::FailedPrecondition);
}

#[tokio::test]
async fn stream_output_delivers_full_output() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let job_id = alice
        .start_job("echo".to_string(), vec!["hello".to_string()])
        .await
        .expect("start failed");

    let got = read_stream_to_eof(&mut alice, &job_id).await;
    assert!(String::from_utf8_lossy(&got).contains("hello"));
}

#[tokio::test]
async fn stream_output_unknown_job_is_not_found() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let err = alice
        .stream_output("nonexistent-job")
        .await
        .expect_err("expected error");
    assert_eq!(rpc_code(err), Code::NotFound);
}

#[tokio::test]
async fn multiple_clients_stream_the_same_job() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let job_id = alice
        .start_job("echo".to_string(), vec!["multi".to_string()])
        .await
        .expect("start failed");

    let mut first = alice.clone();
    let mut second = alice.clone();
    let job_a = job_id.clone();
    let job_b = job_id.clone();
    let (a, b) = tokio::join!(
        async move { read_stream_to_eof(&mut first, &job_a).await },
        async move { read_stream_to_eof(&mut second, &job_b).await },
    );

    assert!(String::from_utf8_lossy(&a).contains("multi"));
    assert!(String::from_utf8_lossy(&b).contains("multi"));
}

#[tokio::test]
async fn late_subscriber_reads_from_the_beginning() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;

    let job_id = alice
        .start_job(
            "sh".to_string(),
            vec!["-c".to_string(), "echo first; sleep 2; echo second".to_string()],
        )
        .await
        .expect("start failed");

    // The first chunk arrives while the job is still running.
    let mut stream = alice.stream_output(&job_id).await.expect("stream failed");
    let chunk = stream
        .message()
        .await
        .expect("stream recv failed")
        .expect("stream ended before any output");
    assert!(String::from_utf8_lossy(&chunk.data).contains("first"));
    let (status, _) = alice.clone().job_status(&job_id).await.expect("status failed");
    assert!(!status.is_terminal(), "expected job to still be running");

    wait_terminal(&alice, &job_id).await;

    // A stream opened after exit still replays everything from byte 0.
    let got = read_stream_to_eof(&mut alice, &job_id).await;
    let text = String::from_utf8_lossy(&got);
    assert!(text.contains("first"));
    assert!(text.contains("second"));
}

#[tokio::test]
async fn non_owner_cannot_see_status_stop_or_stream() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;
    let mut bob = server.client_as("bob", "client").await;

    let job_id = alice
        .start_job("sleep".to_string(), vec!["60".to_string()])
        .await
        .expect("start failed");

    let err = bob.job_status(&job_id).await.expect_err("expected error");
    assert_eq!(rpc_code(err), Code::NotFound);

    let err = bob.stop_job(&job_id).await.expect_err("expected error");
    assert_eq!(rpc_code(err), Code::NotFound);

    let err = bob
        .stream_output(&job_id)
        .await
        .expect_err("expected error");
    assert_eq!(rpc_code(err), Code::NotFound);

    alice.stop_job(&job_id).await.expect("stop failed");
}

#[tokio::test]
async fn admin_can_see_and_stop_any_job() {
    let server = test_server().await;
    let mut alice = server.client_as("alice", "client").await;
    let mut admin = server.client_as("carol", "admin").await;

    let job_id = alice
        .start_job("sleep".to_string(), vec!["60".to_string()])
        .await
        .expect("start failed");

    let (status, _) = admin.job_status(&job_id).await.expect("admin status failed");
    assert_eq!(status, JobStatus::Running);

    admin.stop_job(&job_id).await.expect("admin stop failed");

    let (status, exit_code) = wait_terminal(&alice, &job_id).await;
    assert_eq!(status, JobStatus::Killed);
    assert_eq!(exit_code, Some(137));
}
