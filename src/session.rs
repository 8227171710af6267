//! Model session identity.
//!
//! A session is the routing key for queries: a concrete (framework, model,
//! version, latency SLO, input shape) tuple. Its canonical string form is
//! used as the key of the model table and inside wire messages.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A concrete model session assigned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSession {
    pub framework: String,
    pub model_name: String,
    pub version: u32,
    /// Latency SLO in milliseconds; query deadlines derive from this.
    pub latency_sla_ms: u32,
    /// Optional input-size override. Zero means the model default.
    #[serde(default)]
    pub image_height: u32,
    #[serde(default)]
    pub image_width: u32,
}

impl ModelSession {
    pub fn new(framework: &str, model_name: &str, version: u32, latency_sla_ms: u32) -> Self {
        Self {
            framework: framework.to_string(),
            model_name: model_name.to_string(),
            version,
            latency_sla_ms,
            image_height: 0,
            image_width: 0,
        }
    }

    pub fn with_image_size(mut self, height: u32, width: u32) -> Self {
        self.image_height = height;
        self.image_width = width;
        self
    }

    /// Canonical session id. Equality of ids defines scheduling identity.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.framework, self.model_name, self.version, self.latency_sla_ms
        )?;
        if self.image_height > 0 {
            write!(f, ":{}x{}", self.image_height, self.image_width)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionParseError {
    #[error("session id has {0} fields, expected 4 or 5")]
    FieldCount(usize),

    #[error("invalid numeric field in session id: {0}")]
    InvalidNumber(String),

    #[error("invalid image size field: {0}")]
    InvalidImageSize(String),
}

fn parse_u32(s: &str) -> Result<u32, SessionParseError> {
    s.parse::<u32>()
        .map_err(|_| SessionParseError::InvalidNumber(s.to_string()))
}

impl FromStr for ModelSession {
    type Err = SessionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(':').collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(SessionParseError::FieldCount(fields.len()));
        }
        let mut sess = ModelSession {
            framework: fields[0].to_string(),
            model_name: fields[1].to_string(),
            version: parse_u32(fields[2])?,
            latency_sla_ms: parse_u32(fields[3])?,
            image_height: 0,
            image_width: 0,
        };
        if fields.len() == 5 {
            let (h, w) = fields[4]
                .split_once('x')
                .ok_or_else(|| SessionParseError::InvalidImageSize(fields[4].to_string()))?;
            sess.image_height = parse_u32(h)?;
            sess.image_width = parse_u32(w)?;
        }
        Ok(sess)
    }
}
