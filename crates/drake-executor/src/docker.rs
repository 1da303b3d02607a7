//! Local Docker target runner.

use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use drake_core::{ContainerSpec, Error, Result, Target};

use crate::TargetRunner;

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Runs targets as container groups against a local Docker daemon.
pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    /// Create a runner connected to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::engine("error connecting to the Docker daemon", e))?;
        Ok(Self { docker })
    }

    /// Create a runner with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    async fn run_containers(
        &self,
        token: &CancellationToken,
        execution_name: &str,
        source_path: &Path,
        secrets: &[String],
        target: &Target,
        group: &mut ContainerGroup,
    ) -> Result<()> {
        let containers = target.containers();
        let last = containers.len() - 1;
        let mut network_leader: Option<String> = None;
        let mut primary_id = String::new();

        // Create all containers in order; start every sidecar right away
        // but hold the primary back until its wait and attach
        // subscriptions are in place.
        for (i, container) in containers.iter().enumerate() {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let id = self
                .create_container(
                    execution_name,
                    source_path,
                    secrets,
                    network_leader.as_deref(),
                    container,
                )
                .await?;
            group.track(id.clone());
            if i == 0 {
                network_leader = Some(id.clone());
            }
            if i < last {
                self.docker
                    .start_container(&id, None::<StartContainerOptions<String>>)
                    .await
                    .map_err(|e| {
                        Error::engine(
                            format!(
                                "error starting container \"{}\" for target \"{}\"",
                                container.name,
                                target.name()
                            ),
                            e,
                        )
                    })?;
            } else {
                primary_id = id;
            }
        }

        let primary = &containers[last];

        // Subscribe to the next-exit condition before the container is
        // started, otherwise a fast exit could be missed entirely.
        let mut wait_stream = self.docker.wait_container(
            &primary_id,
            Some(WaitContainerOptions {
                condition: "next-exit",
            }),
        );
        let wait_task = tokio::spawn(async move { wait_stream.next().await });

        // Attach before start so no prologue output is lost.
        let attach_options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { output, .. } = self
            .docker
            .attach_container(&primary_id, Some(attach_options))
            .await
            .map_err(|e| {
                Error::engine(
                    format!(
                        "error attaching to container \"{}\" for target \"{}\"",
                        primary.name,
                        target.name()
                    ),
                    e,
                )
            })?;
        let prefix = format!("[{}-{}] ", target.name(), primary.name);
        let pump = tokio::spawn(pump_output(output, primary.tty, prefix));

        self.docker
            .start_container(&primary_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                Error::engine(
                    format!(
                        "error starting container \"{}\" for target \"{}\"",
                        primary.name,
                        target.name()
                    ),
                    e,
                )
            })?;

        tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled),
            joined = wait_task => {
                let waited = joined
                    .map_err(|e| Error::engine("container wait task failed", e))?;
                match waited {
                    Some(Ok(response)) if response.status_code != 0 => {
                        Err(Error::TargetFailed {
                            target: target.name().to_string(),
                            code: response.status_code,
                        })
                    }
                    Some(Ok(_)) => {
                        // Drain whatever output is still buffered; the
                        // attach stream ends once the container exits.
                        let _ = pump.await;
                        Ok(())
                    }
                    Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                        Err(Error::TargetFailed {
                            target: target.name().to_string(),
                            code,
                        })
                    }
                    Some(Err(err)) => Err(Error::engine(
                        format!(
                            "error waiting for completion of container \"{}\" for target \"{}\"",
                            primary.name,
                            target.name()
                        ),
                        err,
                    )),
                    None => Err(Error::Engine(format!(
                        "wait stream for container \"{}\" ended unexpectedly",
                        primary.name
                    ))),
                }
            }
        }
    }

    /// Create (but do not start) one container of a target group. The
    /// first-created container is the group's network leader; every later
    /// container joins its network namespace so sidecars are reachable on
    /// localhost from the primary.
    async fn create_container(
        &self,
        execution_name: &str,
        source_path: &Path,
        secrets: &[String],
        network_leader: Option<&str>,
        spec: &ContainerSpec,
    ) -> Result<String> {
        let name = format!("{execution_name}-{}", spec.name);
        let mut env: Vec<String> = secrets.to_vec();
        env.extend(spec.environment.iter().cloned());
        let cmd = if spec.command.is_empty() {
            None
        } else {
            Some(shell_words::split(&spec.command).map_err(|e| {
                Error::Config(format!(
                    "error parsing command for container \"{}\": {}",
                    spec.name, e
                ))
            })?)
        };
        let mut binds = Vec::new();
        if spec.mount_docker_socket {
            binds.push(format!("{DOCKER_SOCKET}:{DOCKER_SOCKET}"));
        }
        if let Some(mount) = &spec.source_mount_path {
            binds.push(format!("{}:{}", source_path.display(), mount));
        }
        let host_config = HostConfig {
            privileged: Some(spec.privileged),
            network_mode: network_leader.map(|id| format!("container:{id}")),
            binds: (!binds.is_empty()).then_some(binds),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd,
            env: Some(env),
            working_dir: spec.working_directory.clone(),
            tty: Some(spec.tty),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::engine(format!("error creating container \"{name}\""), e))?;
        debug!(container = %name, id = %created.id, "created container");
        Ok(created.id)
    }
}

#[async_trait]
impl TargetRunner for DockerRunner {
    async fn run_target(
        &self,
        token: &CancellationToken,
        execution_name: &str,
        source_path: &Path,
        secrets: &[String],
        target: &Target,
    ) -> Result<()> {
        if target.containers().is_empty() {
            return Ok(());
        }
        info!(target = %target.name(), execution = %execution_name, "executing target");
        let mut group = ContainerGroup::new(self.docker.clone());
        let outcome = self
            .run_containers(token, execution_name, source_path, secrets, target, &mut group)
            .await;
        // Removal must happen on every exit path, including cancellation,
        // so it never consults the token.
        group.teardown().await;
        outcome
    }

    async fn pull_images(&self, token: &CancellationToken, images: &[String]) -> Result<()> {
        for image in images {
            pull_image(&self.docker, token, image).await?;
        }
        Ok(())
    }
}

/// Tracks the containers created for one target invocation and
/// force-removes every one of them exactly once.
struct ContainerGroup {
    docker: Docker,
    ids: Vec<String>,
}

impl ContainerGroup {
    fn new(docker: Docker) -> Self {
        Self {
            docker,
            ids: Vec::new(),
        }
    }

    fn track(&mut self, id: String) {
        self.ids.push(id);
    }

    async fn teardown(&mut self) {
        for id in std::mem::take(&mut self.ids) {
            force_remove(&self.docker, &id).await;
        }
    }
}

impl Drop for ContainerGroup {
    fn drop(&mut self) {
        // Reached only when teardown never ran, e.g. an unwinding panic.
        // Hand the ids to the runtime so the containers still go away.
        let ids = std::mem::take(&mut self.ids);
        if ids.is_empty() {
            return;
        }
        let docker = self.docker.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for id in ids {
                    force_remove(&docker, &id).await;
                }
            });
        }
    }
}

async fn force_remove(docker: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(err) = docker.remove_container(id, Some(options)).await {
        warn!(container = %id, error = %err, "error removing container");
    } else {
        debug!(container = %id, "removed container");
    }
}

/// Pull an image, streaming engine progress to stdout line by line.
pub async fn pull_image(docker: &Docker, token: &CancellationToken, image: &str) -> Result<()> {
    info!(image = %image, "pulling image");
    let options = CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    };
    let mut stream = docker.create_image(Some(options), None, None);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Cancelled),
            next = stream.next() => match next {
                None => return Ok(()),
                Some(Ok(progress)) => {
                    if let Some(status) = progress.status {
                        match progress.progress {
                            Some(detail) => println!("{image}: {status} {detail}"),
                            None => println!("{image}: {status}"),
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(image = %image, error = %err, "pull warning");
                }
            },
        }
    }
}

async fn pump_output(
    mut output: std::pin::Pin<
        Box<dyn futures::Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>,
    >,
    tty: bool,
    prefix: String,
) {
    use std::io::Write;

    if tty {
        // With a TTY the engine hands back a single multiplexed channel;
        // copy it verbatim.
        let mut stdout = std::io::stdout();
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(log) => {
                    let _ = stdout.write_all(&log.into_bytes());
                    let _ = stdout.flush();
                }
                Err(err) => {
                    warn!(error = %err, "error reading container output");
                    return;
                }
            }
        }
        return;
    }

    // Demultiplexed streams are line-buffered so that interleaved targets
    // stay readable: atomicity is per line, not per byte.
    let mut out = LinePrinter::new(prefix.clone(), false);
    let mut err_out = LinePrinter::new(prefix, true);
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                out.push(&message);
            }
            Ok(LogOutput::StdErr { message }) => {
                err_out.push(&message);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "error reading container output");
                break;
            }
        }
    }
    out.finish();
    err_out.finish();
}

/// Splits a byte stream on newlines and writes each line with a target
/// prefix.
struct LinePrinter {
    prefix: String,
    buf: Vec<u8>,
    to_stderr: bool,
}

impl LinePrinter {
    fn new(prefix: String, to_stderr: bool) -> Self {
        Self {
            prefix,
            buf: Vec::new(),
            to_stderr,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    fn finish(&mut self) {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if self.to_stderr {
            eprintln!("{}{}", self.prefix, line);
        } else {
            println!("{}{}", self.prefix, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_target_is_a_no_op() {
        // No Docker daemon involved: the runner must return before it
        // touches the engine.
        let runner = DockerRunner::with_client(
            Docker::connect_with_local_defaults().unwrap_or_else(|_| {
                Docker::connect_with_http("tcp://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
                    .expect("constructing an offline client")
            }),
        );
        let target = Target::new("noop", vec![]);
        runner
            .run_target(
                &CancellationToken::new(),
                "exec-noop",
                Path::new("."),
                &[],
                &target,
            )
            .await
            .expect("empty target should succeed with zero side effects");
    }

    #[test]
    fn line_printer_splits_and_prefixes() {
        let mut printer = LinePrinter::new("[t-c] ".to_string(), false);
        // Feeding partial lines must not emit anything until a newline
        // arrives; this only exercises the buffer bookkeeping.
        printer.buf.extend_from_slice(b"partial");
        assert_eq!(printer.buf, b"partial");
        printer.push(b" line\nnext");
        assert_eq!(printer.buf, b"next");
    }

    #[test]
    fn commands_are_shell_tokenized() {
        let parsed = shell_words::split("sh -c 'exit 7'").unwrap();
        assert_eq!(parsed, vec!["sh", "-c", "exit 7"]);
    }
}
