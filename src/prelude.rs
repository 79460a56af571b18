pub use std::collections::BTreeMap;
pub use std::convert::{TryFrom, TryInto};
pub use std::fmt::Display;
pub use std::path::{Path, PathBuf};

pub use anyhow::{anyhow, bail, Context, Result};
pub use once_cell::sync::Lazy;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, trace, warn};

pub use crate::error::DqpError;
pub use crate::value::Value;
