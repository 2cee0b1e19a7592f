//! Insertable queue values

use super::QueueError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;

/// A value accepted by [`CommandQueue::add`](super::CommandQueue::add).
///
/// Nested lists are flattened and deferred values are awaited, recursively,
/// so `Many([a, Many([b, c])])` inserts `a`, `b`, `c` in that order.
pub enum Value<T> {
    One(T),
    Many(Vec<Value<T>>),
    Deferred(BoxFuture<'static, Result<Value<T>, QueueError>>),
}

impl<T> Value<T> {
    /// A list of plain values
    pub fn list<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        Value::Many(values.into_iter().map(Value::One).collect())
    }

    /// A nested list
    pub fn many<I>(values: I) -> Self
    where
        I: IntoIterator<Item = Value<T>>,
    {
        Value::Many(values.into_iter().collect())
    }

    /// A value that resolves later, possibly into more nested values
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value<T>, QueueError>> + Send + 'static,
    {
        Value::Deferred(future.boxed())
    }

    /// A plain value that resolves later and cannot fail
    pub fn later<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Value::Deferred(future.map(|value| Ok(Value::One(value))).boxed())
    }
}

impl<T: fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::One(value) => f.debug_tuple("One").field(value).finish(),
            Value::Many(values) => f.debug_tuple("Many").field(values).finish(),
            Value::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}
