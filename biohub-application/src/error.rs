use biohub_eventing::{EventingError, HandlerError};

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("eventing: {0}")]
    Eventing(#[from] EventingError),

    #[error("validation: {0}")]
    Validation(String),

    #[error("infra: {0}")]
    Infra(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("handler not found: {0}")]
    HandlerNotFound(&'static str),

    #[error("handler already registered: command={command}")]
    AlreadyRegisteredCommand { command: &'static str },

    #[error("handler already registered: query={query}")]
    AlreadyRegisteredQuery { query: &'static str },

    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn infra(reason: impl std::fmt::Display) -> Self {
        Self::Infra(reason.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(err.to_string())
    }
}

// 事件处理器中以 `?` 传播应用层错误：输入不合法或目标不存在，重试也不会成功
impl From<AppError> for HandlerError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(_) | AppError::NotFound(_) | AppError::TypeMismatch { .. } => {
                HandlerError::permanent(err.to_string())
            }
            other => HandlerError::transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_and_not_found_are_permanent() {
        let err: HandlerError = AppError::Validation("empty workspace id".into()).into();
        assert!(err.is_permanent());
        let err: HandlerError = AppError::NotFound("workspace w1".into()).into();
        assert!(err.is_permanent());
    }

    #[test]
    fn infra_is_transient() {
        let err: HandlerError = AppError::infra("disk full").into();
        assert!(!err.is_permanent());
        assert_eq!(err.reason(), "infra: disk full");
    }
}
