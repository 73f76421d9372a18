//! Error taxonomy (spec §7). Each variant maps to exactly one wire outcome;
//! the mapping lives next to the handler that produces it, not here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid regex in pattern {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown translation mode: {0}")]
    UnknownTranslationMode(String),
    #[error("rule {rule_id} has an empty method set")]
    EmptyMethodSet { rule_id: String },
    #[error("rule {rule_id} has response_mode=script but no script_body")]
    MissingScriptBody { rule_id: String },
    #[error("script failed to compile: {0}")]
    ScriptCompile(String),
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script syntax error: {0}")]
    Syntax(String),
    #[error("script threw: {0}")]
    Thrown(String),
    #[error("script exceeded its deadline")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend transport error: {0}")]
    Transport(String),
    #[error("backend request timed out")]
    Timeout,
    #[error("backend did not upgrade the connection")]
    UpgradeFailure,
    #[error("container is not running")]
    ContainerNotRunning,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("no container runtime is available")]
    NoRuntimeAvailable,
    #[error("container runtime transport error: {0}")]
    Transport(String),
    #[error("image validation failed: {0}")]
    InvalidImage(String),
    #[error("container {0} not found")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read cert file {path}: {source}")]
    ReadCert {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read key file {path}: {source}")]
    ReadKey {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cert file {0} contains no certificates")]
    NoCertificates(String),
    #[error("key file {0} contains no private key")]
    NoPrivateKey(String),
    #[error("invalid TLS configuration: {0}")]
    Invalid(#[from] rustls::Error),
}
