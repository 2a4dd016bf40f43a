//! Clients for the generative model.

use crate::api::{check_status, ModelClient, ModelInput, OutputSchema};
use crate::config::ModelSecret;
use crate::error::Res;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::trace;
use url::Url;

const TIMEOUT: Duration = Duration::from_secs(90);

/// Posts the input and output schema as JSON to the configured model endpoint, authenticated with
/// a bearer key. The endpoint answers with `{"output": {...}}`.
pub struct HttpModelClient {
    url: Url,
    secret: ModelSecret,
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(url: Url, secret: ModelSecret) -> Res<Self> {
        let client = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .build()
            .context("Unable to create the HTTP client")?;
        Ok(Self {
            url,
            secret,
            client,
        })
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    input: &'a ModelInput,
    schema: &'a OutputSchema,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    output: Option<Value>,
}

#[async_trait::async_trait]
impl ModelClient for HttpModelClient {
    async fn generate(&self, input: &ModelInput, schema: &OutputSchema) -> Res<Value> {
        trace!("Requesting {} for '{}'", schema.name, input.description);
        let response = self
            .client
            .post(self.url.clone())
            .bearer_auth(&self.secret.api_key)
            .json(&GenerateRequest { input, schema })
            .send()
            .await
            .context("Failed to send request to the model")?;
        let body: GenerateResponse = check_status(response, "Model request")
            .await?
            .json()
            .await
            .context("Failed to parse the model response")?;
        match body.output {
            Some(Value::Null) | None => bail!("The model returned no output"),
            Some(output) => Ok(output),
        }
    }
}

/// A model that never answers. Used in test mode so that the whole pipeline runs without the
/// external service, with every would-be model call falling through to `unresolved`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentModel;

#[async_trait::async_trait]
impl ModelClient for SilentModel {
    async fn generate(&self, _input: &ModelInput, schema: &OutputSchema) -> Res<Value> {
        bail!("No generative model is available for {}", schema.name)
    }
}
