//! Run registration in the tracking database.

use crate::settings::RegistrySettings;
use serde_json::Value;
use seqrun_protocol::RunDetails;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("invalid registry url '{url}': {message}")]
    Url { url: String, message: String },
    #[error("could not encode run details: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait RunRegistry: Send + Sync {
    /// Look a run up by its name; `None` when it is not registered.
    fn find_run(&self, name: &str) -> Result<Option<Value>, RegistryError>;

    /// Insert a run and return the stored record.
    fn create_run(&self, details: &Value) -> Result<Value, RegistryError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub record: Value,
    pub already_existed: bool,
}

/// Register `details` unless a run with the same name is already known.
pub fn register_run(
    registry: &dyn RunRegistry,
    details: &RunDetails,
) -> Result<Registration, RegistryError> {
    if let Some(record) = registry.find_run(&details.run)? {
        info!("Run '{}' is already registered", details.run);
        return Ok(Registration {
            record,
            already_existed: true,
        });
    }
    let record = registry.create_run(&serde_json::to_value(details)?)?;
    info!("Registered run '{}'", details.run);
    Ok(Registration {
        record,
        already_existed: false,
    })
}

/// REST client: `GET <server>/runs?name=<run>` and `POST <server>/runs`.
pub struct HttpRunRegistry {
    server: String,
    user: String,
    password: String,
    client: reqwest::blocking::Client,
}

impl HttpRunRegistry {
    pub fn new(settings: &RegistrySettings) -> Result<Self, RegistryError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            server: settings.server.trim_end_matches('/').to_string(),
            user: settings.user.clone(),
            password: settings.password.clone(),
            client,
        })
    }

    fn runs_url(&self) -> String {
        format!("{}/runs", self.server)
    }

    fn checked(
        url: &str,
        response: reqwest::blocking::Response,
    ) -> Result<Value, RegistryError> {
        let status = response.status();
        if !status.is_success() {
            return Err(RegistryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json::<Value>()?)
    }
}

/// Query responses are either a bare array or wrapped as `{"results": [...]}`.
fn first_match(value: Value) -> Option<Value> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };
    items.into_iter().next()
}

impl RunRegistry for HttpRunRegistry {
    fn find_run(&self, name: &str) -> Result<Option<Value>, RegistryError> {
        let url = self.runs_url();
        let query = reqwest::Url::parse_with_params(&url, &[("name", name)]).map_err(|e| {
            RegistryError::Url {
                url: url.clone(),
                message: e.to_string(),
            }
        })?;
        let response = self
            .client
            .get(query)
            .basic_auth(&self.user, Some(&self.password))
            .send()?;
        Ok(first_match(Self::checked(&url, response)?))
    }

    fn create_run(&self, details: &Value) -> Result<Value, RegistryError> {
        let url = self.runs_url();
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(details)
            .send()?;
        Self::checked(&url, response)
    }
}

/// In-process registry, used by the test suites.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunRegistry {
    runs: Arc<Mutex<Vec<Value>>>,
}

impl MemoryRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<Value> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RunRegistry for MemoryRunRegistry {
    fn find_run(&self, name: &str) -> Result<Option<Value>, RegistryError> {
        let runs = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(runs.iter().find(|r| r["run"] == name).cloned())
    }

    fn create_run(&self, details: &Value) -> Result<Value, RegistryError> {
        let mut runs = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        runs.push(details.clone());
        Ok(details.clone())
    }
}
