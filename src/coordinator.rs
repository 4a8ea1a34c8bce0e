use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

use crate::capability::{ObjectDetector, StoreConnector};
use crate::config::{Configuration, FilterConfig, PostgresConfig};
use crate::error::{AppError, ConfigError, StageError};
use crate::pipeline::{Capabilities, Filter, Stage, StageReport, StageRuntime};
use crate::transport::{
    Address, InputEndpoint, OutputEndpoint, TransportConfig, TransportContext,
};

/// A stage with its endpoint addresses resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub name: String,
    pub sources: Vec<Address>,
    pub outputs: Vec<Address>,
    pub filter: FilterConfig,
}

impl StageDefinition {
    fn uses_memory(&self) -> bool {
        self.sources
            .iter()
            .chain(&self.outputs)
            .any(|address| matches!(address, Address::Memory { .. }))
    }
}

fn parse_addresses(stage: &str, field: &str, raw: &[String]) -> Result<Vec<Address>, ConfigError> {
    raw.iter()
        .map(|address| {
            address
                .parse::<Address>()
                .map_err(|e| ConfigError::invalid(format!("stages.{stage}.{field}"), e.to_string()))
        })
        .collect()
}

/// A validated linear chain of stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    transport: TransportConfig,
    stages: Vec<StageDefinition>,
}

impl Topology {
    /// Resolves every address and checks that each stage's outputs reach
    /// the next stage's sources.
    pub fn from_configuration(configuration: Configuration) -> Result<Self, ConfigError> {
        if configuration.stages.is_empty() {
            return Err(ConfigError::invalid("stages", "at least one stage is required"));
        }

        let mut names = HashSet::new();
        let mut stages = Vec::with_capacity(configuration.stages.len());
        for spec in configuration.stages {
            if !names.insert(spec.name.clone()) {
                return Err(ConfigError::DuplicateStage(spec.name));
            }
            if spec.sources.is_empty() {
                return Err(ConfigError::invalid(
                    format!("stages.{}.sources", spec.name),
                    "every stage needs at least one source",
                ));
            }
            stages.push(StageDefinition {
                sources: parse_addresses(&spec.name, "sources", &spec.sources)?,
                outputs: parse_addresses(&spec.name, "outputs", &spec.outputs)?,
                name: spec.name,
                filter: spec.filter,
            });
        }

        for pair in stages.windows(2) {
            let (producer, consumer) = (&pair[0], &pair[1]);
            let linked = producer
                .outputs
                .iter()
                .any(|output| consumer.sources.iter().any(|source| output.pairs_with(source)));
            if !linked {
                return Err(ConfigError::Unlinked {
                    producer: producer.name.clone(),
                    consumer: consumer.name.clone(),
                    outputs: producer.outputs.iter().map(ToString::to_string).collect(),
                    sources: consumer.sources.iter().map(ToString::to_string).collect(),
                });
            }
        }

        Ok(Self {
            transport: configuration.transport,
            stages,
        })
    }

    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Narrows the topology to the single stage called `name`.
    pub fn select(mut self, name: &str) -> Result<Self, ConfigError> {
        let index = self
            .stages
            .iter()
            .position(|stage| stage.name == name)
            .ok_or_else(|| ConfigError::UnknownStage(name.to_string()))?;
        let stage = self.stages.swap_remove(index);
        self.stages = vec![stage];
        Ok(self)
    }
}

pub struct Coordinator {
    topology: Topology,
    capabilities: Capabilities,
    context: TransportContext,
    cancel_token: CancellationToken,
}

impl Coordinator {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs every stage as a task in this process until all of them stop.
    /// The first stage to fault stops the others and its error is returned.
    pub async fn run(self) -> Result<Vec<StageReport>, AppError> {
        let Coordinator {
            topology,
            capabilities,
            context,
            cancel_token,
        } = self;

        let mut stages = Vec::with_capacity(topology.stages.len());
        for definition in &topology.stages {
            stages.push(Stage::from_config(&definition.filter, &capabilities)?);
        }

        // bind every listener before anything tries to connect
        let mut outputs = Vec::with_capacity(topology.stages.len());
        for definition in &topology.stages {
            let mut opened = Vec::with_capacity(definition.outputs.len());
            for address in &definition.outputs {
                let output = OutputEndpoint::open(address.clone(), &context)
                    .await
                    .map_err(|source| StageError::Transport {
                        stage: definition.name.clone(),
                        source,
                    })?;
                opened.push(output);
            }
            outputs.push(opened);
        }
        let mut inputs = Vec::with_capacity(topology.stages.len());
        for definition in &topology.stages {
            let mut opened = Vec::with_capacity(definition.sources.len());
            for address in &definition.sources {
                let input = InputEndpoint::open(address.clone(), &context)
                    .await
                    .map_err(|source| StageError::Transport {
                        stage: definition.name.clone(),
                        source,
                    })?;
                opened.push(input);
            }
            inputs.push(opened);
        }

        let mut running = FuturesUnordered::new();
        for ((definition, stage), (inputs, outputs)) in topology
            .stages
            .iter()
            .zip(stages)
            .zip(inputs.into_iter().zip(outputs))
        {
            let span = info_span!("stage", name = %definition.name, kind = stage.kind());
            let runtime = StageRuntime::new(definition.name.clone(), stage, inputs, outputs);
            let handle = tokio::spawn(runtime.run(cancel_token.child_token()).instrument(span));
            let name = definition.name.clone();
            running.push(async move { (name, handle.await) });
        }
        info!("Started {} stage(s)", running.len());

        let mut reports = Vec::new();
        let mut first_error = None;
        while let Some((name, joined)) = running.next().await {
            let failure = match joined {
                Ok(Ok(report)) => {
                    reports.push(report);
                    continue;
                }
                Ok(Err(e)) => e,
                Err(e) => {
                    error!("Stage {} task failed: {}", name, e);
                    StageError::Aborted(name)
                }
            };
            if first_error.is_none() {
                error!("{}, stopping the pipeline", failure);
                cancel_token.cancel();
                first_error = Some(failure);
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(reports),
        }
    }

    /// Runs every stage in its own OS process by re-executing `executable`
    /// with `args` plus `--stage <name>`. Children stop when their stdin closes.
    pub async fn run_processes(self, executable: PathBuf, args: Vec<String>) -> Result<(), AppError> {
        if let Some(stage) = self.topology.stages.iter().find(|stage| stage.uses_memory()) {
            return Err(ConfigError::invalid(
                format!("stages.{}", stage.name),
                "mem:// endpoints cannot cross process boundaries",
            )
            .into());
        }

        let mut stdins = Vec::with_capacity(self.topology.stages.len());
        let mut running = FuturesUnordered::new();
        for definition in &self.topology.stages {
            let mut child = Command::new(&executable)
                .args(&args)
                .arg("--stage")
                .arg(&definition.name)
                .arg("--supervised")
                .stdin(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(AppError::Process)?;
            info!("Started stage {} as process {:?}", definition.name, child.id());
            stdins.push(child.stdin.take());
            let name = definition.name.clone();
            running.push(async move { (name, child.wait().await) });
        }

        let mut first_error = None;
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                exited = running.next() => match exited {
                    Some((name, status)) => {
                        if let Some(e) = exit_error(name, status) {
                            first_error = Some(e);
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        info!("Stopping stage processes");
        drop(stdins);
        while let Some((name, status)) = running.next().await {
            if let Some(e) = exit_error(name, status) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

fn exit_error(name: String, status: std::io::Result<ExitStatus>) -> Option<AppError> {
    match status {
        Ok(status) if status.success() => {
            info!("Stage process {} exited", name);
            None
        }
        Ok(status) => {
            error!("Stage process {} exited with {}", name, status);
            Some(StageError::Exited(name, status).into())
        }
        Err(e) => Some(AppError::Process(e)),
    }
}

pub struct CoordinatorBuilder {
    topology: Topology,
    capabilities: Capabilities,
    context: Option<TransportContext>,
    cancel_token: Option<CancellationToken>,
}

impl CoordinatorBuilder {
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            capabilities: Capabilities::default(),
            context: None,
            cancel_token: None,
        }
    }

    // Sets the database aggregators connect to, this will override the defaults.
    pub fn postgres(mut self, postgres: PostgresConfig) -> Self {
        self.capabilities.postgres = postgres;
        self
    }

    // Replaces the database of every aggregator.
    pub fn store_connector(mut self, store: Arc<dyn StoreConnector>) -> Self {
        self.capabilities.store = Some(store);
        self
    }

    // Replaces the configured backend of every detector.
    pub fn detector(mut self, detector: Arc<dyn ObjectDetector>) -> Self {
        self.capabilities.detector = Some(detector);
        self
    }

    pub fn transport_context(mut self, context: TransportContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> Coordinator {
        let context = self
            .context
            .unwrap_or_else(|| TransportContext::new(self.topology.transport.clone()));
        Coordinator {
            topology: self.topology,
            capabilities: self.capabilities,
            context,
            cancel_token: self.cancel_token.unwrap_or_default(),
        }
    }
}

/// Runs `topology` in this process until every stage stops or `cancel_token` fires.
pub async fn run_multi(
    topology: Topology,
    postgres: PostgresConfig,
    cancel_token: CancellationToken,
) -> Result<Vec<StageReport>, AppError> {
    CoordinatorBuilder::new(topology)
        .postgres(postgres)
        .cancel_token(cancel_token)
        .build()
        .run()
        .await
}
