//! Natural-language explanations of predictions.
//!
//! Explanations are best effort. Callers bound them with a timeout and fall
//! back to [`template_explanation`], which never fails.

use crate::config::ExplanationConfig;
use crate::core::inference::{PredictionRecord, RiskLevel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const MAX_TOKENS: u32 = 500;
const TEMPERATURE: f64 = 0.7;

const SYSTEM_PROMPT_FR: &str = "Tu es un expert en hydrologie et gestion des risques d'inondation au Maroc. \
Tu dois expliquer les prédictions d'inondation de manière claire et concise pour des gestionnaires municipaux. \
Utilise un langage professionnel mais accessible. Limite tes réponses à 2-3 phrases maximum.";

const SYSTEM_PROMPT_EN: &str = "You are an expert in hydrology and flood risk management in Morocco. \
You must explain flood predictions clearly and concisely for municipal managers. \
Use professional but accessible language. Limit your responses to 2-3 sentences maximum.";

/// Explanation language.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Fr,
    En,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Fr => f.write_str("fr"),
            Language::En => f.write_str("en"),
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fr" => Ok(Language::Fr),
            "en" => Ok(Language::En),
            other => Err(format!("unsupported language '{other}'")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExplainError {
    #[error("explanation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("explanation service returned status {0}")]
    Status(u16),
    #[error("explanation service returned no text")]
    Empty,
    #[error("explanation timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait Explainer: Send + Sync {
    async fn explain(
        &self,
        record: &PredictionRecord,
        language: Language,
    ) -> Result<String, ExplainError>;
}

/// Canned explanation keyed on risk level.
pub fn template_explanation(record: &PredictionRecord, language: Language) -> String {
    let p = record.probability_percent();
    match (language, record.risk_level) {
        (Language::Fr, RiskLevel::High) => format!(
            "Risque élevé d'inondation détecté ({p}%). Surveillance accrue recommandée et activation des mesures préventives."
        ),
        (Language::Fr, RiskLevel::Medium) => format!(
            "Risque modéré d'inondation ({p}%). Maintenir la surveillance et préparer les équipes d'intervention."
        ),
        (Language::Fr, RiskLevel::Low) => format!(
            "Risque faible d'inondation ({p}%). Situation normale, surveillance de routine."
        ),
        (Language::En, RiskLevel::High) => format!(
            "High flood risk detected ({p}%). Increased monitoring and preventive measures recommended."
        ),
        (Language::En, RiskLevel::Medium) => format!(
            "Moderate flood risk ({p}%). Maintain monitoring and prepare response teams."
        ),
        (Language::En, RiskLevel::Low) => {
            format!("Low flood risk ({p}%). Normal situation, routine monitoring.")
        }
    }
}

/// Offline explainer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateExplainer;

#[async_trait]
impl Explainer for TemplateExplainer {
    async fn explain(
        &self,
        record: &PredictionRecord,
        language: Language,
    ) -> Result<String, ExplainError> {
        Ok(template_explanation(record, language))
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiExplainer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

impl OpenAiExplainer {
    pub fn new(config: &ExplanationConfig, api_key: impl Into<String>) -> Result<Self, ExplainError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
        })
    }

    fn user_prompt(record: &PredictionRecord, language: Language) -> String {
        let f = &record.features;
        match language {
            Language::Fr => format!(
                "Explique cette prédiction d'inondation:\n\n\
                 Ville: {}\nCapteur: {}\nProbabilité d'inondation: {}%\nNiveau de risque: {}\n\n\
                 Données clés:\n- Niveau d'eau: {:.1} cm\n- Précipitations: {:.1} mm\n- Niveau de la rivière: {:.1} cm\n\n\
                 Fournis une explication concise (2-3 phrases) des facteurs de risque et recommandations.",
                record.city,
                record.sensor_id,
                record.probability_percent(),
                record.risk_level,
                f.water_level_avg,
                f.rainfall,
                f.river_level
            ),
            Language::En => format!(
                "Explain this flood prediction:\n\n\
                 City: {}\nSensor: {}\nFlood probability: {}%\nRisk level: {}\n\n\
                 Key data:\n- Water level: {:.1} cm\n- Rainfall: {:.1} mm\n- River level: {:.1} cm\n\n\
                 Provide a concise explanation (2-3 sentences) of risk factors and recommendations.",
                record.city,
                record.sensor_id,
                record.probability_percent(),
                record.risk_level,
                f.water_level_avg,
                f.rainfall,
                f.river_level
            ),
        }
    }
}

#[async_trait]
impl Explainer for OpenAiExplainer {
    async fn explain(
        &self,
        record: &PredictionRecord,
        language: Language,
    ) -> Result<String, ExplainError> {
        let system = match language {
            Language::Fr => SYSTEM_PROMPT_FR,
            Language::En => SYSTEM_PROMPT_EN,
        };
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Self::user_prompt(record, language),
                },
            ],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ExplainError::Status(response.status().as_u16()));
        }

        let body: ChatResponse = response.json().await?;
        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(ExplainError::Empty)
    }
}
