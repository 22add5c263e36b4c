//! Recovery action capability.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use tracing::debug;

use vigil_core::RecoveryAction;
use vigil_state::ActionOutcome;

/// Boxed future returned by [`ActionRunner::execute`].
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = ActionOutcome> + Send + 'a>>;

/// Executes one remediation action.
pub trait ActionRunner: Send + Sync {
    /// Run `action`, giving up after `timeout`.
    fn execute<'a>(&'a self, action: &'a RecoveryAction, timeout: Duration) -> ActionFuture<'a>;
}

/// Built-in runner for command and HTTP actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRunner;

impl ActionRunner for StandardRunner {
    fn execute<'a>(&'a self, action: &'a RecoveryAction, timeout: Duration) -> ActionFuture<'a> {
        Box::pin(async move {
            let run = async {
                match action {
                    RecoveryAction::Command { command, args } => run_command(command, args).await,
                    RecoveryAction::Http { address, path } => post(address, path).await,
                }
            };
            tokio::time::timeout(timeout, run)
                .await
                .unwrap_or(ActionOutcome::Timeout)
        })
    }
}

async fn run_command(command: &str, args: &[String]) -> ActionOutcome {
    let output = tokio::process::Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => ActionOutcome::Success,
        Ok(out) => {
            let status = match out.status.code() {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            };
            let stderr = String::from_utf8_lossy(&out.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                ActionOutcome::failure(status)
            } else {
                let detail: String = stderr.chars().take(200).collect();
                ActionOutcome::failure(format!("{status}: {detail}"))
            }
        }
        Err(e) => ActionOutcome::failure(format!("failed to run {command}: {e}")),
    }
}

/// POST an empty body to `path` on `address`; 2xx is success.
async fn post(address: &str, path: &str) -> ActionOutcome {
    let uri = format!("http://{address}{path}");

    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %uri, "recovery request connection failed");
            return ActionOutcome::failure(format!("connection failed: {e}"));
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => return ActionOutcome::failure(format!("handshake failed: {e}")),
    };

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("POST")
        .uri(&uri)
        .header("host", address)
        .header("user-agent", "vigil-recovery/0.1")
        .header("content-length", "0")
        .body(http_body_util::Empty::<bytes::Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => return ActionOutcome::failure(format!("invalid recovery request: {e}")),
    };

    match sender.send_request(req).await {
        Ok(resp) if resp.status().is_success() => ActionOutcome::Success,
        Ok(resp) => ActionOutcome::failure(format!("HTTP {}", resp.status().as_u16())),
        Err(e) => ActionOutcome::failure(format!("request failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(cmd: &str, args: &[&str]) -> RecoveryAction {
        RecoveryAction::Command {
            command: cmd.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_success_and_failure() {
        let runner = StandardRunner;
        let ok = runner.execute(&command("true", &[]), Duration::from_secs(5)).await;
        assert_eq!(ok, ActionOutcome::Success);

        let failed = runner
            .execute(
                &command("sh", &["-c", "echo 'unit not found' >&2; exit 5"]),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(failed, ActionOutcome::failure("exit status 5: unit not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hanging_command_times_out() {
        let runner = StandardRunner;
        let outcome = runner
            .execute(&command("sleep", &["10"]), Duration::from_millis(100))
            .await;
        assert_eq!(outcome, ActionOutcome::Timeout);
    }

    #[tokio::test]
    async fn http_action_to_closed_port_fails() {
        let action = RecoveryAction::Http {
            address: "127.0.0.1:1".to_string(),
            path: "/restart".to_string(),
        };
        let outcome = StandardRunner.execute(&action, Duration::from_secs(1)).await;
        assert!(matches!(outcome, ActionOutcome::Failure { .. }));
    }
}
