//! Probe capability.
//!
//! A `Probe` turns a `ProbeSpec` into a `CheckOutcome`. `StandardProbe`
//! covers HTTP, TCP and command checks; tests substitute scripted probes.
//! `run_check` wraps any probe with the service timeout, panic isolation
//! and latency measurement, so a broken probe can never stop a scheduler.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use vigil_core::{Clock, ProbeSpec, ServiceSpec};
use vigil_state::{CheckOutcome, CheckResult};

/// Boxed future returned by [`Probe::execute`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = CheckOutcome> + Send + 'a>>;

/// Longest failure reason kept from probe output.
const MAX_REASON_LEN: usize = 200;

/// Executes one health check.
pub trait Probe: Send + Sync {
    /// Run the check described by `spec`, giving up after `timeout`.
    fn execute<'a>(&'a self, spec: &'a ProbeSpec, timeout: Duration) -> ProbeFuture<'a>;
}

/// The built-in probe, dispatching over the closed set of probe kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardProbe;

impl Probe for StandardProbe {
    fn execute<'a>(&'a self, spec: &'a ProbeSpec, timeout: Duration) -> ProbeFuture<'a> {
        Box::pin(async move {
            let check = async {
                match spec {
                    ProbeSpec::Http { address, path } => http_probe(address, path).await,
                    ProbeSpec::Tcp { address } => tcp_probe(address).await,
                    ProbeSpec::Command { command, args } => command_probe(command, args).await,
                }
            };
            tokio::time::timeout(timeout, check)
                .await
                .unwrap_or(CheckOutcome::Timeout)
        })
    }
}

/// Run one check for `spec` and time it.
///
/// The probe runs on its own task: a panic becomes a failure and an
/// overrun past `spec.timeout` becomes a timeout.
pub async fn run_check(probe: Arc<dyn Probe>, spec: Arc<ServiceSpec>, clock: &Clock) -> CheckResult {
    let timestamp = clock.now_millis();
    let started = Instant::now();
    let timeout = spec.timeout;

    let task_spec = spec.clone();
    let mut handle =
        tokio::spawn(async move { probe.execute(&task_spec.probe, task_spec.timeout).await });

    let outcome = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            warn!(service = %spec.id, error = %e, "probe task failed");
            CheckOutcome::failure(format!("probe crashed: {e}"))
        }
        Err(_) => {
            handle.abort();
            CheckOutcome::Timeout
        }
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    debug!(service = %spec.id, kind = spec.probe.kind(), ?outcome, latency_ms, "check complete");

    CheckResult {
        service_id: spec.id.clone(),
        timestamp,
        outcome,
        latency_ms,
    }
}

/// GET `path` on `address`; 2xx is healthy.
async fn http_probe(address: &str, path: &str) -> CheckOutcome {
    let uri = format!("http://{address}{path}");

    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %uri, "http probe connection failed");
            return CheckOutcome::failure(describe_io_error(&e));
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %uri, "http probe handshake failed");
            return CheckOutcome::failure(format!("handshake failed: {e}"));
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(&uri)
        .header("host", address)
        .header("user-agent", "vigil-health/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => return CheckOutcome::failure(format!("invalid probe request: {e}")),
    };

    match sender.send_request(req).await {
        Ok(resp) if resp.status().is_success() => CheckOutcome::Success,
        Ok(resp) => {
            debug!(status = %resp.status(), %uri, "http probe non-2xx");
            CheckOutcome::failure(format!("HTTP {}", resp.status().as_u16()))
        }
        Err(e) => {
            debug!(error = %e, %uri, "http probe request failed");
            CheckOutcome::failure(format!("request failed: {e}"))
        }
    }
}

/// Open a TCP connection to `address`.
async fn tcp_probe(address: &str) -> CheckOutcome {
    match tokio::net::TcpStream::connect(address).await {
        Ok(_) => CheckOutcome::Success,
        Err(e) => CheckOutcome::failure(describe_io_error(&e)),
    }
}

/// Run a command; exit status 0 is healthy.
async fn command_probe(command: &str, args: &[String]) -> CheckOutcome {
    let output = tokio::process::Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => CheckOutcome::Success,
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stdout = String::from_utf8_lossy(&out.stdout);
            let text = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|s| !s.is_empty())
                .map(truncate_reason);
            CheckOutcome::failure(text.unwrap_or_else(|| exit_reason(&out.status)))
        }
        Err(e) => CheckOutcome::failure(format!("failed to run {command}: {e}")),
    }
}

fn exit_reason(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Clip probe output to a single bounded reason string.
fn truncate_reason(text: &str) -> String {
    text.chars().take(MAX_REASON_LEN).collect()
}

fn describe_io_error(e: &std::io::Error) -> String {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => "connection refused".to_string(),
        std::io::ErrorKind::TimedOut => "connection timed out".to_string(),
        _ => format!("connection failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Probe that never answers.
    struct HangingProbe;

    impl Probe for HangingProbe {
        fn execute<'a>(&'a self, _spec: &'a ProbeSpec, _timeout: Duration) -> ProbeFuture<'a> {
            Box::pin(std::future::pending::<CheckOutcome>())
        }
    }

    /// Probe that panics.
    struct PanickingProbe;

    impl Probe for PanickingProbe {
        fn execute<'a>(&'a self, _spec: &'a ProbeSpec, _timeout: Duration) -> ProbeFuture<'a> {
            Box::pin(async {
                if true {
                    panic!("probe bug");
                }
                CheckOutcome::Success
            })
        }
    }

    fn command_spec(command: &str, args: &[&str]) -> Arc<ServiceSpec> {
        Arc::new(ServiceSpec::new(
            "svc",
            ProbeSpec::Command {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
            },
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_probe_times_out() {
        let mut spec = ServiceSpec::new(
            "svc",
            ProbeSpec::Tcp {
                address: "127.0.0.1:1".to_string(),
            },
        );
        spec.timeout = Duration::from_millis(250);
        let clock = Clock::starting_at(10_000);

        let result = run_check(Arc::new(HangingProbe), Arc::new(spec), &clock).await;
        assert_eq!(result.outcome, CheckOutcome::Timeout);
        assert_eq!(result.timestamp, 10_000);
        assert_eq!(result.latency_ms, 250);
    }

    #[tokio::test]
    async fn panicking_probe_becomes_failure() {
        let spec = command_spec("true", &[]);
        let result = run_check(Arc::new(PanickingProbe), spec, &Clock::new()).await;
        match result.outcome {
            CheckOutcome::Failure { reason } => assert!(reason.starts_with("probe crashed")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tcp_probe_to_closed_port_is_refused() {
        let outcome = StandardProbe
            .execute(
                &ProbeSpec::Tcp {
                    address: "127.0.0.1:1".to_string(),
                },
                Duration::from_secs(1),
            )
            .await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_fails() {
        let outcome = StandardProbe
            .execute(
                &ProbeSpec::Http {
                    address: "127.0.0.1:1".to_string(),
                    path: "/healthz".to_string(),
                },
                Duration::from_millis(500),
            )
            .await;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn tcp_probe_to_listener_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let outcome = StandardProbe
            .execute(&ProbeSpec::Tcp { address }, Duration::from_secs(1))
            .await;
        assert_eq!(outcome, CheckOutcome::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_probe_exit_codes() {
        let ok = run_check(Arc::new(StandardProbe), command_spec("true", &[]), &Clock::new()).await;
        assert_eq!(ok.outcome, CheckOutcome::Success);

        let failed =
            run_check(Arc::new(StandardProbe), command_spec("sh", &["-c", "exit 3"]), &Clock::new())
                .await;
        assert_eq!(failed.outcome, CheckOutcome::failure("exit status 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_probe_reports_stderr() {
        let spec = command_spec("sh", &["-c", "echo '  disk full  ' >&2; exit 1"]);
        let result = run_check(Arc::new(StandardProbe), spec, &Clock::new()).await;
        assert_eq!(result.outcome, CheckOutcome::failure("disk full"));
    }

    #[tokio::test]
    async fn missing_command_is_failure() {
        let spec = command_spec("/nonexistent/vigil-probe", &[]);
        let result = run_check(Arc::new(StandardProbe), spec, &Clock::new()).await;
        assert!(matches!(result.outcome, CheckOutcome::Failure { .. }));
    }

    #[test]
    fn reasons_are_truncated() {
        let long = "x".repeat(500);
        assert_eq!(truncate_reason(&long).len(), MAX_REASON_LEN);
        assert_eq!(truncate_reason("short"), "short");
    }
}
