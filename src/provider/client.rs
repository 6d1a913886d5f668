// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! HTTP client for the inference provider's prediction API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    first_output_url, InferenceProvider, Prediction, PredictionRequest, PredictionStatus,
    ProviderError,
};

pub struct HttpProvider {
    http: Client,
    base_url: String,
    token: String,
}

/// Raw wire shape; `output` arrives as a bare string or an array of URLs
/// depending on the model.
#[derive(Debug, Deserialize)]
struct RawPrediction {
    id: String,
    status: String,
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

impl RawPrediction {
    fn narrow(self) -> Result<Prediction, ProviderError> {
        let status = PredictionStatus::from_raw(&self.status)?;
        let output_url = first_output_url(&self.output);
        if status == PredictionStatus::Succeeded && output_url.is_none() {
            return Err(ProviderError::Malformed(format!(
                "prediction {} succeeded without an output URL",
                self.id
            )));
        }
        Ok(Prediction {
            id: self.id,
            status,
            output_url,
            error: self.error,
        })
    }
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "provider API error: {message}");
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl InferenceProvider for HttpProvider {
    async fn create_prediction(&self, req: &PredictionRequest) -> Result<Prediction, ProviderError> {
        let body = json!({
            "version": req.model,
            "input": {
                "image": req.input_data_url,
                "prompt": req.prompt,
            },
            "webhook": req.webhook_url,
            "webhook_events_filter": ["completed"],
            "extra": req.extra,
        });
        debug!(model = %req.model, "creating prediction");
        let response = self
            .http
            .post(format!("{}/v1/predictions", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let raw: RawPrediction = self.check(response).await?.json().await?;
        raw.narrow()
    }

    async fn get_prediction(&self, id: &str) -> Result<Prediction, ProviderError> {
        let response = self
            .http
            .get(format!("{}/v1/predictions/{id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let raw: RawPrediction = self.check(response).await?.json().await?;
        raw.narrow()
    }

    async fn cancel_prediction(&self, id: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .post(format!("{}/v1/predictions/{id}/cancel", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }
}
