//! `kubectl port-forward` backend.
//!
//! Runs the child with `tokio::process::Command`, mirrors its stdout and
//! stderr into the log with the namespace, pod and ports attached, and
//! kills it when the session's token is cancelled.

use crate::config::KubectlSection;
use futures_util::future::BoxFuture;
use podlink_core::{
    ForwardError, ForwardResult, ReadySignal, SessionRequest, TunnelSession, TunnelSessionFactory,
};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Creates sessions backed by a `kubectl port-forward` child process.
#[derive(Debug, Clone)]
pub struct KubectlSessionFactory {
    options: KubectlSection,
}

impl KubectlSessionFactory {
    pub fn new(options: KubectlSection) -> Self {
        Self { options }
    }

    /// Command-line arguments for a port-forward to `request`.
    pub fn args(&self, request: &SessionRequest) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(context) = &self.options.context {
            args.push(format!("--context={context}"));
        }
        if let Some(kubeconfig) = &self.options.kubeconfig {
            args.push(format!("--kubeconfig={kubeconfig}"));
        }
        args.push(format!("--request-timeout={}", self.options.request_timeout));
        args.extend([
            "port-forward".to_string(),
            "--namespace".to_string(),
            request.scope.clone(),
            "--address".to_string(),
            "127.0.0.1".to_string(),
            format!("pod/{}", request.name),
        ]);
        args.extend(request.ports.iter().map(|p| p.to_string()));
        args
    }
}

impl TunnelSessionFactory for KubectlSessionFactory {
    fn new_session(
        &self,
        cancel: CancellationToken,
        request: SessionRequest,
        ready: ReadySignal,
    ) -> ForwardResult<Box<dyn TunnelSession>> {
        let args = self.args(&request);
        debug!(binary = %self.options.binary, args = ?args, "spawning kubectl");

        let child = Command::new(&self.options.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ForwardError::SessionCreation(format!(
                    "failed to spawn {}: {e}",
                    self.options.binary
                ))
            })?;

        Ok(Box::new(KubectlSession {
            child,
            cancel,
            ready,
            fields: LogFields::from(&request),
        }))
    }
}

/// Context attached to every log line of a session.
#[derive(Debug, Clone)]
struct LogFields {
    namespace: String,
    pod: String,
    ports: String,
}

impl From<&SessionRequest> for LogFields {
    fn from(request: &SessionRequest) -> Self {
        let ports: Vec<String> = request.ports.iter().map(|p| p.to_string()).collect();
        Self {
            namespace: request.scope.clone(),
            pod: request.name.clone(),
            ports: ports.join(","),
        }
    }
}

struct KubectlSession {
    child: Child,
    cancel: CancellationToken,
    ready: ReadySignal,
    fields: LogFields,
}

impl TunnelSession for KubectlSession {
    fn forward(self: Box<Self>) -> BoxFuture<'static, ForwardResult<()>> {
        Box::pin(async move {
            let KubectlSession {
                mut child,
                cancel,
                ready,
                fields,
            } = *self;

            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(log_stderr(stderr, fields.clone()));
            }

            let mut ready = Some(ready);
            let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(namespace = %fields.namespace, pod = %fields.pod, "stopping kubectl port-forward");
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "failed to kill kubectl");
                        }
                        return Ok(());
                    }
                    line = next_line(&mut stdout) => match line {
                        Some(line) => {
                            let line = line.trim();
                            info!(namespace = %fields.namespace, pod = %fields.pod, ports = %fields.ports, "{line}");
                            if let Some(port) = parse_forwarding_line(line) {
                                if let Some(ready) = ready.take() {
                                    ready.notify_bound(port);
                                }
                            }
                        }
                        None => stdout = None,
                    },
                    status = child.wait() => {
                        return match status {
                            Ok(status) if status.success() => Ok(()),
                            Ok(status) => Err(ForwardError::Session(format!(
                                "kubectl port-forward exited with {status}"
                            ))),
                            Err(e) => Err(ForwardError::Session(e.to_string())),
                        };
                    }
                }
            }
        })
    }
}

type Lines<R> = tokio::io::Lines<BufReader<R>>;

/// Next stdout line, or pending forever once stdout is gone.
async fn next_line<R: AsyncRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn log_stderr<R: AsyncRead + Unpin>(stderr: R, fields: LogFields) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(namespace = %fields.namespace, pod = %fields.pod, ports = %fields.ports, "{}", line.trim());
    }
}

/// Extract the local port from `Forwarding from 127.0.0.1:40123 -> 8080`.
fn parse_forwarding_line(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("Forwarding from ")?;
    let (local, _) = rest.split_once(" -> ")?;
    let (_, port) = local.rsplit_once(':')?;
    port.parse().ok()
}
