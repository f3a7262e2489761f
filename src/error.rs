use miette::Diagnostic;
use thiserror::Error;

use crate::keyscript::ScriptError;

#[derive(Debug, Error, Diagnostic)]
pub enum VmctlError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("invalid configuration: {constraint}")]
    #[diagnostic(help("adjust the config document so it satisfies this constraint"))]
    InvalidConfiguration { constraint: String },

    #[error("bundle I/O failed: {context}")]
    BundleIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine error: {message}")]
    #[diagnostic(help("{hint}"))]
    Engine { message: String, hint: String },

    #[error("installation failed")]
    #[diagnostic(help("the bundle is in an unknown state; run install again to recreate it"))]
    Install {
        #[source]
        source: Box<VmctlError>,
    },

    #[error("failed to load key script from {path}")]
    ScriptLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid key script {path}: {message}")]
    ScriptDocument { path: String, message: String },

    #[error("invalid key script {path}, instruction #{index}")]
    ScriptParse {
        path: String,
        index: usize,
        #[source]
        source: ScriptError,
    },

    #[error("failed to download restore image: {message}")]
    Download {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("{command} failed: {message}")]
    ExternalCommand { command: String, message: String },
}

impl VmctlError {
    pub(crate) fn bundle_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::BundleIo {
            context: context.into(),
            source,
        }
    }

    pub fn engine(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
            hint: hint.into(),
        }
    }
}
