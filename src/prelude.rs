//! Standard APIs we use everywhere.

pub use std::path::{Path, PathBuf};

pub use anyhow::{Context as _, Result, anyhow};
pub use serde::{Deserialize, Serialize};
pub use serde_json::{Value, json};
#[allow(unused_imports)]
pub use tracing::{debug, error, info, instrument, trace, warn};

/// A JSON object value, without the surrounding [`Value::Object`] wrapper.
pub type JsonObject = serde_json::Map<String, Value>;

/// A boxed [`futures::Stream`], our standard currency for async pipelines.
pub type BoxedStream<T> = futures::stream::BoxStream<'static, T>;
