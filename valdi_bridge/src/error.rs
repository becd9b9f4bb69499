use std::{fmt, sync::Arc};

use crate::{FunctionFlags, SlotId, Strength, ValueKind};

/// An error that is allowed to cross the boundary as a first class value.
///
/// Carries a free-form message, an optional stack trace from the side that
/// raised it, and an optional cause when it was rethrown with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshallingError {
    message: Arc<str>,
    stack_trace: Option<Arc<str>>,
    cause: Option<Box<MarshallingError>>,
}

impl MarshallingError {
    pub fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: impl Into<Arc<str>>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Wraps this error into a new one that describes where it surfaced.
    #[must_use]
    pub fn rethrow(self, context: impl Into<Arc<str>>) -> Self {
        Self {
            message: context.into(),
            stack_trace: None,
            cause: Some(Box::new(self)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    pub fn cause(&self) -> Option<&MarshallingError> {
        self.cause.as_deref()
    }
}

impl fmt::Display for MarshallingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MarshallingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// A value was read as a kind it does not hold.
    TypeMismatch { expected: ValueKind, found: ValueKind },
    /// A slot id that was removed, reused or whose object is gone.
    StaleReference { id: SlotId, strength: Strength },
    /// A pop reaching below the start of the current frame.
    FrameUnderflow { requested: usize, available: usize },
    /// A callable left a different number of values in its frame than the
    /// arguments plus the result it declared.
    UnbalancedFrame { expected: usize, found: usize },
    OutOfBounds { index: isize, size: usize },
    MissingProperty { key: String },
    UnregisteredType { type_name: &'static str },
    UnsupportedInvocationMode {
        requested: FunctionFlags,
        supported: FunctionFlags,
    },
    /// A boundary reported error.
    Marshalling(MarshallingError),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    /// Whether the error is a contract violation by the caller rather than
    /// a failure reported through the boundary.
    pub fn is_programming_error(&self) -> bool {
        !matches!(
            self,
            Self::Marshalling(_)
                | Self::MissingProperty { .. }
                | Self::StaleReference {
                    strength: Strength::Weak,
                    ..
                }
        )
    }

    /// Converts the error into something that can be handed back across
    /// the boundary.
    pub fn into_marshalling_error(self) -> MarshallingError {
        match self {
            Self::Marshalling(error) => error,
            other => MarshallingError::new(other.to_string()),
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { expected, found } => {
                write!(f, "expected a value of kind {expected}, found {found}")
            }
            Self::StaleReference { id, strength } => match strength {
                Strength::Strong => write!(f, "stale reference {id}"),
                Strength::Weak => write!(f, "stale weak reference {id}"),
            },
            Self::FrameUnderflow {
                requested,
                available,
            } => write!(
                f,
                "cannot pop {requested} values, current frame has {available}"
            ),
            Self::UnbalancedFrame { expected, found } => write!(
                f,
                "callable left {found} values in its frame, expected {expected}"
            ),
            Self::OutOfBounds { index, size } => {
                write!(f, "out of bounds index {index}, size is {size}")
            }
            Self::MissingProperty { key } => {
                write!(f, "object has no property '{key}'")
            }
            Self::UnregisteredType { type_name } => {
                write!(f, "no class descriptor registered for {type_name}")
            }
            Self::UnsupportedInvocationMode {
                requested,
                supported,
            } => write!(
                f,
                "invocation mode {requested:?} is not supported, function supports {supported:?}"
            ),
            Self::Marshalling(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Marshalling(error) => Some(error),
            _ => None,
        }
    }
}

impl From<MarshallingError> for BridgeError {
    fn from(error: MarshallingError) -> Self {
        Self::Marshalling(error)
    }
}
