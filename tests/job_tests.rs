//! Lifecycle tests for local jobs, run without cgroups so they work
//! unprivileged. The cgroup-backed paths are covered in resources_tests.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use teleworker::job::{new_job, JobError, JobStatus, JobType, LocalJob, Options};

fn local_job(command: &str, args: &[&str]) -> Arc<LocalJob> {
    Arc::new(new_job(
        JobType::Local,
        Uuid::new_v4(),
        command.to_string(),
        args.iter().map(|s| s.to_string()).collect(),
        Options::default(),
    ))
}

/// Reads the job's output from byte 0 until EOF.
async fn read_all(job: &LocalJob) -> Vec<u8> {
    let mut sub = job.output().subscribe();
    let mut all = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match sub.read(&mut buf).await {
            Ok(0) => return all,
            Ok(n) => all.extend_from_slice(&buf[..n]),
            Err(err) => panic!("subscriber error: {err}"),
        }
    }
}

#[tokio::test]
async fn successful_job_reports_success_and_exit_zero() {
    let job = local_job("true", &[]);
    job.start().expect("start failed");
    job.wait().await;

    let st = job.status();
    assert_eq!(st.status, JobStatus::Success);
    assert_eq!(st.exit_code, Some(0));
}

#[tokio::test]
async fn failing_job_reports_failed_and_exit_code() {
    let job = local_job("false", &[]);
    job.start().expect("start failed");
    job.wait().await;

    let st = job.status();
    assert_eq!(st.status, JobStatus::Failed);
    assert_eq!(st.exit_code, Some(1));
}

#[tokio::test]
async fn signaled_job_reports_128_plus_signal() {
    // The shell kills itself with SIGTERM (15).
    let job = local_job("sh", &["-c", "kill -TERM $$"]);
    job.start().expect("start failed");
    job.wait().await;

    let st = job.status();
    assert_eq!(st.status, JobStatus::Failed);
    assert_eq!(st.exit_code, Some(128 + 15));
}

#[tokio::test]
async fn stop_kills_running_job_with_137() {
    let job = local_job("sleep", &["60"]);
    job.start().expect("start failed");
    assert_eq!(job.status().status, JobStatus::Running);

    job.stop().expect("stop failed");

    // Stop commits terminal state immediately; the waiter must preserve it.
    let st = job.status();
    assert_eq!(st.status, JobStatus::Killed);
    assert_eq!(st.exit_code, Some(137));

    job.wait().await;
    let st = job.status();
    assert_eq!(st.status, JobStatus::Killed);
    assert_eq!(st.exit_code, Some(137));

    assert!(matches!(job.stop(), Err(JobError::NotRunning)));
}

#[tokio::test]
async fn stop_after_natural_exit_fails() {
    let job = local_job("true", &[]);
    job.start().expect("start failed");
    job.wait().await;

    assert!(matches!(job.stop(), Err(JobError::NotRunning)));
}

#[tokio::test]
async fn spawn_failure_keeps_job_submitted() {
    let job = local_job("/nonexistent/teleworker-test-binary", &[]);
    match job.start() {
        Err(JobError::Spawn(_)) => {}
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert_eq!(job.status().status, JobStatus::Submitted);
    assert_eq!(job.status().exit_code, None);
}

#[tokio::test]
async fn output_is_merged_stdout_and_stderr_in_order() {
    let job = local_job("sh", &["-c", "echo out; echo err >&2; echo done"]);
    job.start().expect("start failed");
    job.wait().await;

    let got = read_all(&job).await;
    assert_eq!(got, b"out\nerr\ndone\n");
}

#[tokio::test]
async fn subscriber_sees_output_before_job_finishes() {
    let job = local_job("sh", &["-c", "echo first; sleep 2; echo second"]);
    job.start().expect("start failed");

    let mut sub = job.output().subscribe();
    let mut buf = [0u8; 256];
    let n = sub.read(&mut buf).await.expect("read failed");
    assert!(String::from_utf8_lossy(&buf[..n]).contains("first"));
    assert!(!job.status().status.is_terminal());

    job.stop().expect("stop failed");
    job.wait().await;

    // A subscriber created after exit still reads the stream from byte 0.
    let late = read_all(&job).await;
    assert!(String::from_utf8_lossy(&late).starts_with("first"));
}

#[tokio::test]
async fn stop_kills_descendants() {
    // The waiter only finishes once every process holding the output pipe's
    // write side has exited, so completing within the timeout proves the
    // background children died with the job.
    let job = local_job(
        "sh",
        &["-c", "sleep 60 & sleep 60 & sleep 60 & echo ready; sleep 60"],
    );
    job.start().expect("start failed");

    let mut sub = job.output().subscribe();
    let ready = async {
        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        while !String::from_utf8_lossy(&seen).contains("ready") {
            match sub.read(&mut buf).await {
                Ok(0) => panic!("output closed before the job reported ready"),
                Ok(n) => seen.extend_from_slice(&buf[..n]),
                Err(err) => panic!("subscriber error: {err}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), ready)
        .await
        .expect("timed out waiting for the job to report ready");

    job.stop().expect("stop failed");

    tokio::time::timeout(Duration::from_secs(5), job.wait())
        .await
        .expect("descendants survived stop; output pipe never reached EOF");

    let st = job.status();
    assert_eq!(st.status, JobStatus::Killed);
    assert_eq!(st.exit_code, Some(137));
}
