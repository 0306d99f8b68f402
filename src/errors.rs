// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use slog_scope::warn;

use crate::{
    metrics,
    types::{KeyRange, TimeStamp},
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("the task {task_name} doesn't exist")]
    NoSuchTask { task_name: String },
    #[error("malformed key range {range:?}")]
    InvalidRange { range: KeyRange },
    #[error("{op} exceeded its deadline of {budget:?}")]
    DeadlineExceeded { op: &'static str, budget: Duration },
    #[error("failed to collect the checkpoint of {} sub-range(s)", .ranges.len())]
    PartialStoreFailure { ranges: Vec<KeyRange> },
    #[error("no store replied while collecting region checkpoints")]
    AllStoresUnavailable,
    #[error("checkpoint rollback: published {current} but newly computed {target}")]
    CheckpointRollback {
        current: TimeStamp,
        target: TimeStamp,
    },
    #[error("checkpoint lagged too large (checkpoint = {checkpoint}, lag = {lag:?}, limit = {limit:?})")]
    LaggedTooLarge {
        checkpoint: TimeStamp,
        lag: Duration,
        limit: Duration,
    },
    #[error("the advancer lost its ownership while working")]
    OwnershipLost,
    #[error("{context}: {inner}")]
    Contextual { context: String, inner: Box<Error> },
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Sync + Send>),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach a human-readable context to the error.
    pub fn context(self, context: impl ToString) -> Self {
        Error::Contextual {
            context: context.to_string(),
            inner: Box::new(self),
        }
    }

    /// Strip the contexts and get the root error.
    pub fn without_context(&self) -> &Self {
        match self {
            Error::Contextual { inner, .. } => inner.without_context(),
            _ => self,
        }
    }

    /// Log the error with its context and bump the error counter.
    pub fn report(&self, context: impl std::fmt::Display) {
        warn!("backup stream advancer meet error"; "context" => %context, "err" => %self);
        metrics::ADVANCER_ERROR
            .with_label_values(&[self.kind()])
            .inc();
    }

    fn kind(&self) -> &'static str {
        match self.without_context() {
            Error::Io(_) => "io",
            Error::Etcd(_) => "etcd",
            Error::Codec(_) => "codec",
            Error::NoSuchTask { .. } => "no_such_task",
            Error::InvalidRange { .. } => "invalid_range",
            Error::DeadlineExceeded { .. } => "deadline_exceeded",
            Error::PartialStoreFailure { .. } => "partial_store_failure",
            Error::AllStoresUnavailable => "all_stores_unavailable",
            Error::CheckpointRollback { .. } => "checkpoint_rollback",
            Error::LaggedTooLarge { .. } => "lagged_too_large",
            Error::OwnershipLost => "ownership_lost",
            Error::Contextual { .. } => "other",
            Error::Other(_) => "other",
        }
    }
}

pub trait ContextualResultExt<T> {
    fn context(self, context: impl ToString) -> Result<T>;
}

impl<T> ContextualResultExt<T> for Result<T> {
    fn context(self, context: impl ToString) -> Result<T> {
        self.map_err(|err| err.context(context))
    }
}

/// A shortcut to box a formatted message into an opaque error, optionally
/// chaining the source error into the text.
#[macro_export]
macro_rules! annotate {
    ($inner:expr, $message:expr) => {{
        let e: Box<dyn std::error::Error + Sync + Send> =
            format!("{}: {}", $message, $inner).into();
        $crate::errors::Error::Other(e)
    }};
    ($inner:expr, $format:literal, $($args:expr),+) => {
        $crate::annotate!($inner, format_args!($format, $($args),+))
    };
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn test_context_chain() {
        let err = Error::AllStoresUnavailable
            .context("during collecting")
            .context("during tick");
        assert!(matches!(
            err.without_context(),
            Error::AllStoresUnavailable
        ));
        assert!(err.to_string().contains("during tick"));
        assert!(err.to_string().contains("during collecting"));
    }
}
