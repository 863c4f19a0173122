use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Graph error: {0}")]
    Graph(String),
    #[error("Planning error: {0}")]
    Planning(String),
    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),
    #[error("Convergence error: {0}")]
    Convergence(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn graph(msg: impl Into<String>) -> Self {
        EngineError::Graph(msg.into())
    }

    pub fn planning(msg: impl Into<String>) -> Self {
        EngineError::Planning(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        EngineError::Lifecycle(msg.into())
    }

    pub fn convergence(msg: impl Into<String>) -> Self {
        EngineError::Convergence(msg.into())
    }
}
