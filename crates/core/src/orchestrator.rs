//! Batch execution: fetch, intersect, report and package one task.
//!
//! A task is a spawned future. References are handled strictly in input
//! order; a failing reference or layer is logged and skipped. Only errors
//! that escape those guards (I/O on the output area, registry faults,
//! panics, cancellation) finish the task as `failed`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use geocore_registry::{EventSink, RegistryError, TaskId, TaskOutcome, TaskRegistry};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::PipelineConfig;
use crate::engine::{Discovery, IntersectionEngine, LayerFile};
use crate::error::{FetchError, OrchestratorError};
use crate::fetcher::{ReferenceFetcher, WfsFetcher};
use crate::model::ParcelGeometry;
use crate::observability;
use crate::packager::ResultPackager;
use crate::report::TaskReport;
use crate::workspace::TaskWorkspace;

pub struct TaskOrchestrator {
    config: PipelineConfig,
    registry: Arc<TaskRegistry>,
    fetcher: Arc<dyn ReferenceFetcher>,
    engine: IntersectionEngine,
    packager: ResultPackager,
    admission: Arc<Semaphore>,
    cancellations: DashMap<TaskId, CancellationToken>,
}

impl TaskOrchestrator {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<TaskRegistry>,
        fetcher: Arc<dyn ReferenceFetcher>,
    ) -> Self {
        TaskOrchestrator {
            engine: IntersectionEngine::from_config(&config),
            packager: ResultPackager::new(config.output_root.clone()),
            admission: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            cancellations: DashMap::new(),
            config,
            registry,
            fetcher,
        }
    }

    /// Orchestrator querying the configured WFS feed.
    pub fn from_config(config: PipelineConfig, registry: Arc<TaskRegistry>) -> Self {
        let fetcher: Arc<dyn ReferenceFetcher> = Arc::new(WfsFetcher::from_config(&config));
        TaskOrchestrator::new(config, registry, fetcher)
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Register a task and start it in the background. Returns immediately.
    pub fn submit(self: &Arc<Self>, project: &str, references: Vec<String>) -> TaskId {
        let task_id = self.registry.create(project, references.clone());
        let token = self.register_token(&task_id);
        let this = Arc::clone(self);
        let id = task_id.clone();
        let project = project.to_string();
        tokio::spawn(async move {
            this.execute(&id, &project, &references, token).await;
        });
        task_id
    }

    /// Register a task and drive it to completion on the current task.
    pub async fn run(&self, project: &str, references: Vec<String>) -> TaskId {
        let task_id = self.registry.create(project, references.clone());
        let token = self.register_token(&task_id);
        self.execute(&task_id, project, &references, token).await;
        task_id
    }

    /// Ask a running task to stop at its next reference or layer.
    pub fn cancel(&self, task_id: &TaskId) -> Result<(), RegistryError> {
        let status = self.registry.status(task_id)?;
        if status.is_terminal() {
            return Err(RegistryError::AlreadyFinished {
                task_id: task_id.clone(),
                status,
            });
        }
        if let Some(token) = self.cancellations.get(task_id) {
            token.cancel();
            tracing::info!(task_id = %task_id, "cancellation requested");
        }
        Ok(())
    }

    fn register_token(&self, task_id: &TaskId) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancellations.insert(task_id.clone(), token.clone());
        token
    }

    async fn execute(
        &self,
        task_id: &TaskId,
        project: &str,
        references: &[String],
        token: CancellationToken,
    ) {
        let span = observability::task_span(task_id.as_str(), project);
        async {
            let run = AssertUnwindSafe(self.admit_and_process(task_id, references, &token))
                .catch_unwind()
                .await;
            let outcome = match run {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "task aborted");
                    TaskOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
                Err(panic) => {
                    let reason = OrchestratorError::Internal(panic_message(panic.as_ref()));
                    tracing::error!(error = %reason, "task panicked");
                    TaskOutcome::Failed {
                        reason: reason.to_string(),
                    }
                }
            };
            if let Err(e) = self.registry.finish(task_id, outcome) {
                tracing::error!(error = %e, "could not record task outcome");
            }
            self.cancellations.remove(task_id);
        }
        .instrument(span)
        .await
    }

    async fn admit_and_process(
        &self,
        task_id: &TaskId,
        references: &[String],
        token: &CancellationToken,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let log = TaskLog {
            sink: self.registry.as_ref(),
            task_id,
        };
        let _permit = self.admit(&log, token).await?;
        self.process(&log, references, token).await
    }

    async fn admit(
        &self,
        log: &TaskLog<'_>,
        token: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, OrchestratorError> {
        if let Ok(permit) = Arc::clone(&self.admission).try_acquire_owned() {
            return Ok(permit);
        }
        log.info("En cola: esperando a que finalicen otras tareas en curso.")?;
        tokio::select! {
            permit = Arc::clone(&self.admission).acquire_owned() => {
                permit.map_err(|e| OrchestratorError::Internal(e.to_string()))
            }
            _ = token.cancelled() => Err(OrchestratorError::Cancelled),
        }
    }

    async fn process(
        &self,
        log: &TaskLog<'_>,
        references: &[String],
        token: &CancellationToken,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let task_id = log.task_id;
        let workspace = TaskWorkspace::for_task(&self.config.output_root, task_id);
        workspace.prepare().await?;
        log.info(&format!(
            "Iniciando procesamiento de {} referencias.",
            references.len()
        ))?;

        let mut report = TaskReport::new();
        let mut layers: Option<Vec<LayerFile>> = None;

        for (position, reference) in references.iter().enumerate() {
            if token.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let ordinal = position + 1;
            log.info(&format!("Procesando referencia catastral: {}", reference))?;

            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(OrchestratorError::Cancelled),
                fetched = self.fetcher.fetch(reference) => fetched,
            };
            match fetched {
                Ok(parcel) => {
                    match workspace
                        .persist_payload(ordinal, reference, &parcel.payload)
                        .await
                    {
                        Ok(name) => log.success(&format!("Archivo {} guardado exitosamente.", name))?,
                        Err(e) => {
                            log.error(&format!(
                                "Fallo en la referencia {}: no se pudo guardar la respuesta: {}",
                                reference, e
                            ))?;
                            continue;
                        }
                    }
                    log.info(&format!(
                        "Parcela validada ({}). Área aproximada: {:.2} {}",
                        parcel.crs,
                        parcel.area,
                        parcel.crs.area_unit()
                    ))?;
                    report.record_parcel(&parcel);

                    if layers.is_none() {
                        layers = Some(self.load_layers(log).await?);
                    }
                    let layer_files = layers.as_deref().unwrap_or(&[]);
                    self.check_layers(log, &parcel, layer_files, &mut report, token)
                        .await?;
                }
                Err(FetchError::GeometryFormat { source, payload }) => {
                    let saved = workspace.persist_payload(ordinal, reference, &payload).await;
                    let note = match saved {
                        Ok(name) => format!("respuesta guardada en {}", name),
                        Err(e) => format!("no se pudo guardar la respuesta: {}", e),
                    };
                    log.error(&format!(
                        "Fallo en la referencia {}: geometría GML no válida: {} ({})",
                        reference, source, note
                    ))?;
                }
                Err(e) => {
                    tracing::debug!(reference = %reference, error = ?e, "reference failed");
                    log.error(&format!("Fallo en la referencia {}: {}", reference, e))?;
                }
            }
        }

        if token.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        log.info("Empaquetando resultados en ZIP...")?;
        let entries = self.registry.entries(task_id)?;
        workspace.write_reports(&report, &entries).await?;

        match self.packager.package(task_id).await {
            Ok(archive) => Ok(TaskOutcome::Completed {
                archive,
                result_url: self.config.result_url(task_id.as_str()),
            }),
            Err(e) => {
                tracing::error!(error = %e, "packaging failed");
                Ok(TaskOutcome::Failed {
                    reason: OrchestratorError::Packaging(e).to_string(),
                })
            }
        }
    }

    /// Discover the layers once per task. A missing or empty layer tree
    /// logs one warning and disables intersection checks.
    async fn load_layers(&self, log: &TaskLog<'_>) -> Result<Vec<LayerFile>, OrchestratorError> {
        match self.engine.discover().await {
            Ok(Discovery::MissingRoot(root)) => {
                log.warning(&format!(
                    "No se encontró el directorio de capas {}. Se omite el análisis de afecciones.",
                    root.display()
                ))?;
                Ok(Vec::new())
            }
            Ok(Discovery::Layers(found)) if found.is_empty() => {
                log.warning(&format!(
                    "No hay capas GeoPackage en {}. Se omite el análisis de afecciones.",
                    self.engine.root().display()
                ))?;
                Ok(Vec::new())
            }
            Ok(Discovery::Layers(found)) => {
                log.info(&format!("{} capas de afección disponibles.", found.len()))?;
                Ok(found)
            }
            Err(e) => {
                log.warning(&e.to_string())?;
                Ok(Vec::new())
            }
        }
    }

    async fn check_layers(
        &self,
        log: &TaskLog<'_>,
        parcel: &ParcelGeometry,
        layers: &[LayerFile],
        report: &mut TaskReport,
        token: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let results = self.engine.check_intersections(parcel, layers);
        let mut results = std::pin::pin!(results);
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(OrchestratorError::Cancelled),
                next = results.next() => next,
            };
            let Some(result) = next else {
                return Ok(());
            };
            match result {
                Ok(hit) => {
                    log.success(&format!(
                        "⚡ INTERSECCIÓN DETECTADA en {}: {} elementos.",
                        hit.layer, hit.matched
                    ))?;
                    report.record_affection(&parcel.reference, &hit);
                }
                Err(e) => {
                    log.error(&format!(
                        "Error analizando capa {}: {}",
                        e.layer().unwrap_or("?"),
                        e
                    ))?;
                }
            }
        }
    }
}

/// Writes one task's user-facing log and mirrors it to tracing.
struct TaskLog<'a> {
    sink: &'a dyn EventSink,
    task_id: &'a TaskId,
}

impl TaskLog<'_> {
    fn info(&self, message: &str) -> Result<(), RegistryError> {
        tracing::info!("{}", message);
        self.sink.info(self.task_id, message).map(|_| ())
    }

    fn warning(&self, message: &str) -> Result<(), RegistryError> {
        tracing::warn!("{}", message);
        self.sink.warning(self.task_id, message).map(|_| ())
    }

    fn error(&self, message: &str) -> Result<(), RegistryError> {
        tracing::warn!("{}", message);
        self.sink.error(self.task_id, message).map(|_| ())
    }

    fn success(&self, message: &str) -> Result<(), RegistryError> {
        tracing::info!("{}", message);
        self.sink.success(self.task_id, message).map(|_| ())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
