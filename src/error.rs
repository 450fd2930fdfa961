use miette::Diagnostic;
use thiserror::Error;

pub const ISSUE_TRACKER: &str = "https://github.com/boxvm/boxvm/issues";

#[derive(Debug, Error, Diagnostic)]
pub enum BoxvmError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("resource error: {message}")]
    Resource {
        message: String,
        #[help]
        hint: Option<String>,
    },

    #[error("libvirt error: {message}")]
    #[diagnostic(help("{hint}"))]
    Libvirt { message: String, hint: String },

    #[error("operational error: {message}")]
    Operational { message: String },

    #[error("unexpected error: {message}")]
    #[diagnostic(help("this is likely a bug; please report it at https://github.com/boxvm/boxvm/issues"))]
    Other { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    #[diagnostic(help("ensure {command} is installed and accessible"))]
    ExternalCommand { command: String, message: String },
}

impl BoxvmError {
    pub fn config(message: impl Into<String>) -> Self {
        BoxvmError::Config {
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        BoxvmError::Resource {
            message: message.into(),
            hint: None,
        }
    }

    pub fn resource_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        BoxvmError::Resource {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BoxvmError::Io {
            context: context.into(),
            source,
        }
    }

    /// The unexpected-exception path; anything without a better class.
    pub fn other(message: impl Into<String>) -> Self {
        BoxvmError::Other {
            message: message.into(),
        }
    }
}
