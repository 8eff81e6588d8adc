//! Error types of the pipeline.
//!
//! Per-reference ([`FetchError`]) and per-layer ([`LayerError`]) failures are
//! downgraded to log entries by the orchestrator. [`OrchestratorError`] is
//! what escapes those guards and fails a task.

use std::path::PathBuf;

use geocore_registry::RegistryError;

/// Malformed or unsupported geometry payloads.
#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("invalid XML: {0}")]
    Xml(String),

    #[error("invalid coordinate list: {0}")]
    Coordinates(String),

    #[error("feature has no surface geometry")]
    MissingGeometry,

    #[error("invalid GeoPackage geometry blob: {0}")]
    Blob(String),

    #[error("invalid WKB: {0}")]
    Wkb(String),
}

/// Unknown coordinate reference systems and failed reprojections.
#[derive(Debug, thiserror::Error)]
pub enum CrsError {
    #[error("unsupported CRS EPSG:{0}")]
    Unsupported(u32),

    #[error("unrecognised CRS name '{0}'")]
    UnknownName(String),

    #[error("reprojection failed: {0}")]
    Transform(String),
}

/// Why a single reference could not be resolved.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport failure or timeout reaching the feed.
    #[error("error de red al contactar con Catastro: {0}")]
    Network(String),

    /// Non-success HTTP status, or a success body carrying a service exception.
    #[error("el servicio de Catastro devolvió un error: {0}")]
    Service(String),

    /// The feed answered but matched no feature.
    #[error("no se encontró información para la referencia {reference}")]
    EmptyResult { reference: String },

    /// The feature was returned but its geometry could not be decoded. The
    /// raw payload is kept so it can still be persisted for auditing.
    #[error("geometría GML no válida: {source}")]
    GeometryFormat {
        #[source]
        source: GeometryError,
        payload: Vec<u8>,
    },

    /// The blocking worker running the request panicked or was cancelled.
    #[error("worker error: {0}")]
    Worker(String),
}

/// Failure on one affection layer. Never aborts the remaining layers. The
/// message omits the layer, which callers print next to it.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    #[error("error de lectura: {message}")]
    Read { layer: String, message: String },

    #[error("geometría no válida: {source}")]
    Geometry {
        layer: String,
        #[source]
        source: GeometryError,
    },

    #[error("no se pudo reproyectar la parcela: {source}")]
    Reproject {
        layer: String,
        #[source]
        source: CrsError,
    },

    #[error("tiempo de lectura agotado")]
    Timeout { layer: String },

    #[error("error explorando el directorio de capas {root}: {message}")]
    Discovery { root: PathBuf, message: String },
}

impl LayerError {
    /// Relative path of the layer the error refers to, if any.
    pub fn layer(&self) -> Option<&str> {
        match self {
            LayerError::Read { layer, .. }
            | LayerError::Geometry { layer, .. }
            | LayerError::Reproject { layer, .. }
            | LayerError::Timeout { layer } => Some(layer),
            LayerError::Discovery { .. } => None,
        }
    }
}

/// Failure to build a task's archive.
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    /// The task's output area is missing or holds no files.
    #[error("no hay archivos que empaquetar en {dir}")]
    EmptyOutput { dir: PathBuf },

    #[error("I/O error while packaging: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("worker error: {0}")]
    Worker(String),
}

/// Failure of the conversational assistant.
#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("assistant request failed: {0}")]
    Request(String),

    #[error("assistant response could not be parsed: {0}")]
    Parse(String),

    #[error("worker error: {0}")]
    Worker(String),
}

/// Errors that escape the per-reference guard and force a task to `failed`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("no se pudo preparar el directorio de salida: {0}")]
    Io(#[from] std::io::Error),

    #[error("error al empaquetar resultados: {0}")]
    Packaging(#[from] PackagingError),

    #[error("tarea cancelada")]
    Cancelled,

    #[error("fallo interno: {0}")]
    Internal(String),
}
