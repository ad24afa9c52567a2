// ABOUTME: Docker implementation of the container engine abstraction
// ABOUTME: Uses the bollard library and translates Docker errors into the runner taxonomy

use super::{
    parse_storage_gb, split_image_ref, BuildOptions, ContainerDetails, ContainerEngine,
    ContainerSpec, ContainerStatus, ContainerSummary, ExecResult, ImageDetails, ImageSummary,
    LogStream, RegistryCredentials, ResourceAllocation, ResourceUpdate, CPU_PERIOD,
};
use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use bollard::{
    auth::DockerCredentials,
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        NetworkingConfig, RemoveContainerOptions, RenameContainerOptions, StartContainerOptions,
        StopContainerOptions, UpdateContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::{
        BuildImageOptions, CommitContainerOptions, CreateImageOptions, ListImagesOptions,
        PushImageOptions, RemoveImageOptions, TagImageOptions,
    },
    models::{ContainerConfig, DriverData, EndpointSettings, HostConfig},
    Docker,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "sandbox-runner";

pub struct DockerEngine {
    client: Docker,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerEngine {
    /// Connect to the local Docker daemon with the default pull timeout
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RunnerError::Network(format!("cannot connect to Docker: {}", e)))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            pull_timeout: Duration::from_secs(600),
        }
    }

    fn to_bollard_config(spec: &ContainerSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());

        let storage_opt = spec.storage_size_gb.map(|gb| {
            let mut opts = HashMap::new();
            opts.insert("size".to_string(), format!("{}G", gb));
            opts
        });

        let host_config = HostConfig {
            binds: Some(spec.binds.clone()),
            privileged: Some(spec.privileged),
            extra_hosts: Some(spec.extra_hosts.clone()),
            cpu_period: Some(spec.cpu_period),
            cpu_quota: Some(spec.cpu_quota),
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_swap_bytes),
            storage_opt,
            runtime: spec.runtime.clone(),
            ..Default::default()
        };

        let networking_config = spec.network.as_ref().map(|network| {
            let mut endpoints_config = HashMap::new();
            endpoints_config.insert(network.clone(), EndpointSettings::default());
            NetworkingConfig { endpoints_config }
        });

        Config {
            hostname: Some(spec.hostname.clone()),
            image: Some(spec.image.clone()),
            user: spec.user.clone(),
            env: Some(spec.env.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            networking_config,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }

    fn credentials(credentials: Option<&RegistryCredentials>) -> Option<DockerCredentials> {
        credentials.map(|c| DockerCredentials {
            username: c.username.clone(),
            password: c.password.clone(),
            serveraddress: Some(c.url.clone()),
            ..Default::default()
        })
    }
}

/// Overwrite the limits named in `update`; swap is pinned to memory
fn apply_update(host_config: &mut HostConfig, update: &ResourceUpdate) {
    if let Some(quota) = update.cpu_quota {
        host_config.cpu_period = Some(CPU_PERIOD);
        host_config.cpu_quota = Some(quota);
    }
    if let Some(memory) = update.memory_bytes {
        host_config.memory = Some(memory);
        host_config.memory_swap = Some(memory);
    }
    if let Some(gb) = update.storage_size_gb {
        host_config
            .storage_opt
            .get_or_insert_with(HashMap::new)
            .insert("size".to_string(), format!("{}G", gb));
    }
}

fn overlay_upper_dir(driver: &DriverData) -> Option<String> {
    if driver.name != "overlay2" {
        return None;
    }
    driver
        .data
        .get("UpperDir")
        .filter(|dir| !dir.is_empty())
        .cloned()
}

/// `LowerDir` is a colon-separated stack; `UpperDir` comes last
fn layer_dirs(driver: &DriverData) -> Vec<String> {
    let mut dirs: Vec<String> = driver
        .data
        .get("LowerDir")
        .map(|lower| {
            lower
                .split(':')
                .filter(|dir| !dir.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    dirs.extend(
        driver
            .data
            .get("UpperDir")
            .filter(|dir| !dir.is_empty())
            .cloned(),
    );
    dirs
}

/// JSON-array form of a Dockerfile CMD or ENTRYPOINT
fn dockerfile_array(args: &[String]) -> String {
    let quoted: Vec<String> = args
        .iter()
        .map(|arg| format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

/// Dockerfile instructions that carry a container's runtime config onto an imported image
fn import_changes(config: &ContainerConfig) -> Vec<String> {
    let mut changes = Vec::new();

    if let Some(cmd) = config.cmd.as_ref().filter(|cmd| !cmd.is_empty()) {
        changes.push(format!("CMD {}", dockerfile_array(cmd)));
    }
    if let Some(entrypoint) = config.entrypoint.as_ref().filter(|e| !e.is_empty()) {
        changes.push(format!("ENTRYPOINT {}", dockerfile_array(entrypoint)));
    }
    for env in config.env.iter().flatten() {
        changes.push(format!("ENV {}", env));
    }
    if let Some(dir) = config.working_dir.as_ref().filter(|dir| !dir.is_empty()) {
        changes.push(format!("WORKDIR {}", dir));
    }
    if let Some(ports) = &config.exposed_ports {
        let mut ports: Vec<&String> = ports.keys().collect();
        ports.sort();
        for port in ports {
            changes.push(format!("EXPOSE {}", port));
        }
    }
    if let Some(user) = config.user.as_ref().filter(|user| !user.is_empty()) {
        changes.push(format!("USER {}", user));
    }

    changes
}

/// Docker answers 304 when a container is already in the requested run state
fn ignore_not_modified(result: std::result::Result<(), bollard::errors::Error>) -> Result<()> {
    match result {
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        other => other.map_err(RunnerError::from),
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }

    async fn backing_filesystem(&self) -> Result<Option<String>> {
        let info = self.client.info().await?;
        let filesystem = info.driver_status.unwrap_or_default().into_iter().find_map(|entry| {
            match entry.as_slice() {
                [key, value] if key == "Backing Filesystem" => Some(value.clone()),
                _ => None,
            }
        });
        Ok(filesystem)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container {} from image {}", spec.name, spec.image);

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(Some(options), Self::to_bollard_config(spec))
            .await?;

        for warning in &response.warnings {
            warn!("Container {} created with warning: {}", spec.name, warning);
        }

        Ok(response.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);
        ignore_not_modified(
            self.client
                .start_container(container_id, None::<StartContainerOptions<String>>)
                .await,
        )
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: i64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );
        ignore_not_modified(
            self.client
                .stop_container(container_id, Some(StopContainerOptions { t: timeout_secs }))
                .await,
        )
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.client
            .remove_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn inspect_container(&self, container_id: &str) -> Result<ContainerDetails> {
        let inspect = self.client.inspect_container(container_id, None).await?;

        let upper_dir = inspect.graph_driver.as_ref().and_then(overlay_upper_dir);
        let state = inspect.state.unwrap_or_default();
        let status = ContainerStatus::parse(
            state
                .status
                .as_ref()
                .map(|s| s.as_ref())
                .unwrap_or("unknown"),
        );

        let host_config = inspect.host_config.unwrap_or_default();
        let resources = ResourceAllocation {
            cpu_quota: host_config.cpu_quota.unwrap_or(0).max(0),
            memory_bytes: host_config.memory.unwrap_or(0).max(0),
            disk_gb: host_config
                .storage_opt
                .as_ref()
                .and_then(|opts| opts.get("size"))
                .and_then(|size| parse_storage_gb(size))
                .unwrap_or(0),
        };

        let ip_address = inspect.network_settings.and_then(|ns| {
            ns.ip_address.filter(|ip| !ip.is_empty()).or_else(|| {
                ns.networks.and_then(|networks| {
                    networks
                        .into_values()
                        .find_map(|endpoint| endpoint.ip_address.filter(|ip| !ip.is_empty()))
                })
            })
        });

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| container_id.to_string()),
            name: inspect
                .name
                .unwrap_or_else(|| container_id.to_string())
                .trim_start_matches('/')
                .to_string(),
            image: inspect
                .config
                .and_then(|config| config.image)
                .unwrap_or_default(),
            status,
            exit_code: state.exit_code.unwrap_or(0),
            error: state.error.filter(|e| !e.is_empty()),
            ip_address,
            resources,
            upper_dir,
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self.client.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id?;
                let name = container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let status = container
                    .state
                    .as_ref()
                    .map(|s| ContainerStatus::parse(&s.to_string()))
                    .unwrap_or_else(|| ContainerStatus::Other("unknown".to_string()));
                Some(ContainerSummary { id, name, status })
            })
            .collect())
    }

    async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<ExecResult> {
        debug!(
            "Executing command in container {}: {:?}",
            container_id, command
        );

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.client.create_exec(container_id, exec_config).await?;
        let start_result = self.client.start_exec(&exec.id, None).await?;

        let mut result = ExecResult::default();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            result.stdout.extend_from_slice(&message)
                        }
                        LogOutput::StdErr { message } => result.stderr.extend_from_slice(&message),
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RunnerError::internal("exec was detached unexpectedly"));
            }
        }

        result.exit_code = self
            .client
            .inspect_exec(&exec.id)
            .await?
            .exit_code
            .unwrap_or(0);

        Ok(result)
    }

    async fn container_logs(
        &self,
        container_id: &str,
        lines: usize,
        timestamps: bool,
    ) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps,
            tail: lines.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(container_id, Some(options));
        let mut output = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => output.extend_from_slice(&message),
                _ => {}
            }
        }

        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn update_resources(&self, container_id: &str, update: &ResourceUpdate) -> Result<()> {
        info!("Updating resources of container {}: {:?}", container_id, update);

        let options = UpdateContainerOptions::<String> {
            cpu_period: update.cpu_quota.map(|_| CPU_PERIOD),
            cpu_quota: update.cpu_quota,
            memory: update.memory_bytes,
            memory_swap: update.memory_bytes,
            ..Default::default()
        };

        self.client.update_container(container_id, options).await?;
        Ok(())
    }

    async fn rename_container(&self, container_id: &str, new_name: &str) -> Result<()> {
        debug!("Renaming container {} to {}", container_id, new_name);
        self.client
            .rename_container(
                container_id,
                RenameContainerOptions {
                    name: new_name.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn clone_container(
        &self,
        source: &str,
        name: &str,
        image: Option<&str>,
        update: &ResourceUpdate,
    ) -> Result<String> {
        let inspect = self.client.inspect_container(source, None).await?;

        let mut config: Config<String> = inspect.config.map(Config::from).unwrap_or_default();
        if let Some(image) = image {
            config.image = Some(image.to_string());
        }
        let mut host_config = inspect.host_config.unwrap_or_default();
        apply_update(&mut host_config, update);
        config.host_config = Some(host_config);

        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let response = self.client.create_container(Some(options), config).await?;
        info!("Created container {} from the configuration of {}", name, source);
        Ok(response.id)
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails> {
        let inspect = self.client.inspect_image(image).await?;
        Ok(ImageDetails {
            layer_dirs: inspect
                .graph_driver
                .as_ref()
                .map(layer_dirs)
                .unwrap_or_default(),
            id: inspect.id.unwrap_or_default(),
            architecture: inspect.architecture.unwrap_or_default(),
        })
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let options = ListImagesOptions::<String> {
            all: false,
            ..Default::default()
        };

        let images = self.client.list_images(Some(options)).await?;

        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                created_at: DateTime::from_timestamp(image.created, 0).unwrap_or_else(Utc::now),
                id: image.id,
                repo_tags: image.repo_tags,
                repo_digests: image.repo_digests,
            })
            .collect())
    }

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self
            .client
            .create_image(Some(options), None, Self::credentials(credentials));

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(progress) = stream.next().await {
                let progress = progress?;
                if let Some(error) = progress.error {
                    return Err(RunnerError::internal(format!(
                        "failed to pull image {}: {}",
                        image, error
                    )));
                }
                if let Some(status) = progress.status {
                    if status != last_status {
                        debug!("Pull status for {}: {}", image, status);
                        last_status = status;
                    }
                }
            }
            Ok::<(), RunnerError>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RunnerError::Timeout(format!(
                "pulling image {} took longer than {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn push_image(
        &self,
        image: &str,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        info!("Pushing image: {}", image);

        let (repo, tag) = split_image_ref(image);
        let options = PushImageOptions {
            tag: tag.unwrap_or("latest").to_string(),
        };

        let mut stream = self
            .client
            .push_image(repo, Some(options), Self::credentials(credentials));

        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(error) = progress.error {
                return Err(RunnerError::internal(format!(
                    "failed to push image {}: {}",
                    image, error
                )));
            }
        }

        info!("Image {} pushed successfully", image);
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<()> {
        let (repo, tag) = split_image_ref(target);
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.unwrap_or("latest").to_string(),
        };

        self.client.tag_image(source, Some(options)).await?;
        debug!("Tagged image {} as {}", source, target);
        Ok(())
    }

    async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };

        self.client.remove_image(image, Some(options), None).await?;
        info!("Removed image: {}", image);
        Ok(())
    }

    async fn build_image(
        &self,
        options: &BuildOptions,
        context: Vec<u8>,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<LogStream> {
        info!("Building image {} for {}", options.tag, options.platform);

        let build_options = BuildImageOptions {
            dockerfile: options.dockerfile.clone(),
            t: options.tag.clone(),
            platform: options.platform.clone(),
            pull: true,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let registry_auth = credentials.map(|c| {
            let mut auth = HashMap::new();
            if let Some(docker_credentials) = Self::credentials(Some(c)) {
                auth.insert(c.url.clone(), docker_credentials);
            }
            auth
        });

        let client = self.client.clone();
        let stream = async_stream::stream! {
            let mut build = client.build_image(build_options, registry_auth, Some(context.into()));
            while let Some(item) = build.next().await {
                match item {
                    Ok(output) => {
                        if let Some(error) = output.error {
                            yield Err(RunnerError::internal(format!("image build failed: {}", error)));
                            break;
                        }
                        let line = output.stream.or(output.status);
                        if let Some(line) = line {
                            let line = line.trim_end();
                            if !line.is_empty() {
                                yield Ok(line.to_string());
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(RunnerError::from(e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn commit_container(&self, container_id: &str, image: &str) -> Result<()> {
        let (repo, tag) = split_image_ref(image);
        let options = CommitContainerOptions {
            container: container_id.to_string(),
            repo: repo.to_string(),
            tag: tag.unwrap_or("latest").to_string(),
            pause: false,
            ..Default::default()
        };

        let response = self
            .client
            .commit_container(options, Config::<String>::default())
            .await?;
        debug!("Committed container {} as {}: {:?}", container_id, image, response);
        Ok(())
    }

    async fn export_import_container(&self, container_id: &str, image: &str) -> Result<()> {
        info!("Exporting container {} and importing it as {}", container_id, image);

        let inspect = self.client.inspect_container(container_id, None).await?;
        let changes = inspect
            .config
            .as_ref()
            .map(import_changes)
            .unwrap_or_default();

        let mut export = self.client.export_container(container_id);
        let mut archive = Vec::new();
        while let Some(chunk) = export.next().await {
            archive.extend_from_slice(&chunk?);
        }

        let (repo, tag) = split_image_ref(image);
        let options = CreateImageOptions {
            from_src: "-".to_string(),
            repo: repo.to_string(),
            tag: tag.unwrap_or("latest").to_string(),
            changes: changes.iter().map(String::as_str).collect(),
            ..Default::default()
        };

        let mut import = self
            .client
            .create_image(Some(options), Some(archive.into()), None);
        while let Some(progress) = import.next().await {
            if let Some(error) = progress?.error {
                return Err(RunnerError::internal(format!(
                    "failed to import container {} as {}: {}",
                    container_id, image, error
                )));
            }
        }

        info!("Container {} imported as {}", container_id, image);
        Ok(())
    }
}
