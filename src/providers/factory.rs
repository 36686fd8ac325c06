use super::coze::CozeHandler;
use super::error::GatewayError;
use super::ollama::OllamaHandler;
use super::openai::OpenAICompatibleHandler;
use super::LlmProvider;
use crate::models::Credential;
use crate::usage::UsageEmitter;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Default base URL for the OpenAI-compatible path.
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Coze configuration as it may be embedded, JSON-encoded, in a
/// credential's URL field.
#[derive(Debug, Deserialize)]
struct CozeConfig {
    #[serde(default, rename = "botId")]
    bot_id: String,
    #[serde(default, rename = "userId")]
    user_id: String,
    #[serde(default, rename = "baseUrl")]
    base_url: String,
}

/// Closed set of supported upstream protocols, each with its own typed
/// configuration payload.
///
/// Produced by parsing an open-string [`Credential`]; everything the
/// gateway does afterwards dispatches on this enum instead of re-examining
/// strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderKind {
    /// OpenAI and every OpenAI-shaped vendor; the fallback for empty or
    /// unrecognized provider types.
    OpenAiCompatible { base_url: String },
    Coze {
        bot_id: String,
        user_id: String,
        base_url: Option<String>,
    },
    Ollama { base_url: String },
}

impl ProviderKind {
    /// Resolve a credential into a typed provider kind.
    ///
    /// The Coze URL field is probed as JSON first; a decode failure means
    /// the raw string is a bare bot id. No resolvable bot id is a
    /// configuration error.
    pub fn from_credential(credential: &Credential) -> Result<Self, GatewayError> {
        let provider_type = credential.provider_type.trim().to_lowercase();

        match provider_type.as_str() {
            "coze" => {
                let mut bot_id = String::new();
                let mut user_id = String::new();
                let mut base_url = None;

                if !credential.base_url.is_empty() {
                    match serde_json::from_str::<CozeConfig>(&credential.base_url) {
                        Ok(config) => {
                            bot_id = config.bot_id;
                            user_id = config.user_id;
                            if !config.base_url.is_empty() {
                                base_url = Some(config.base_url);
                            }
                        }
                        Err(_) => {
                            // Not JSON: the whole field is the bot id.
                            bot_id = credential.base_url.clone();
                        }
                    }
                }

                if bot_id.is_empty() {
                    return Err(GatewayError::Configuration(
                        "Coze provider requires botID; set the URL field to a bot id or to \
                         JSON {\"botId\":\"...\",\"userId\":\"...\"}"
                            .to_string(),
                    ));
                }

                Ok(ProviderKind::Coze {
                    bot_id,
                    user_id,
                    base_url,
                })
            }
            "ollama" => Ok(ProviderKind::Ollama {
                base_url: credential.base_url.clone(),
            }),
            // openai, zhipu, deepseek, qwen and anything unknown all speak
            // the OpenAI-compatible dialect.
            _ => {
                let base_url = if credential.base_url.is_empty() {
                    DEFAULT_OPENAI_BASE_URL.to_string()
                } else {
                    credential.base_url.clone()
                };
                Ok(ProviderKind::OpenAiCompatible { base_url })
            }
        }
    }
}

/// Build a provider from a credential record.
///
/// `system_prompt` overrides the credential's own prompt when non-empty
/// (session-level prompts beat stored defaults).
pub fn new_provider(
    credential: &Credential,
    system_prompt: &str,
    emitter: Option<UsageEmitter>,
) -> Result<Arc<dyn LlmProvider>, GatewayError> {
    let prompt = if system_prompt.is_empty() {
        credential.system_prompt.as_str()
    } else {
        system_prompt
    };

    match ProviderKind::from_credential(credential)? {
        ProviderKind::Coze {
            bot_id,
            user_id,
            base_url,
        } => {
            let handler = CozeHandler::new(
                credential.api_key.clone(),
                bot_id,
                user_id,
                prompt,
                base_url,
                emitter,
            )?;
            Ok(Arc::new(handler))
        }
        ProviderKind::Ollama { base_url } => Ok(Arc::new(OllamaHandler::new(
            credential.api_key.clone(),
            &base_url,
            prompt,
            emitter,
        ))),
        ProviderKind::OpenAiCompatible { base_url } => Ok(Arc::new(
            OpenAICompatibleHandler::new(credential.api_key.clone(), base_url, prompt, emitter),
        )),
    }
}

/// Build a provider from explicit parameters instead of a stored
/// credential - for tests and direct configuration. Resolution rules are
/// identical to [`new_provider`]; Coze extras live in `extra` under the
/// `botId` / `userId` / `baseUrl` keys, with a bare `base_url` accepted as
/// the bot id.
pub fn new_provider_from_config(
    provider_type: &str,
    api_key: &str,
    base_url: &str,
    system_prompt: &str,
    extra: Option<&HashMap<String, String>>,
    emitter: Option<UsageEmitter>,
) -> Result<Arc<dyn LlmProvider>, GatewayError> {
    let provider_type = provider_type.trim().to_lowercase();

    match provider_type.as_str() {
        "coze" => {
            let lookup = |key: &str| {
                extra
                    .and_then(|map| map.get(key))
                    .cloned()
                    .unwrap_or_default()
            };
            let mut bot_id = lookup("botId");
            let user_id = lookup("userId");
            let coze_base_url = lookup("baseUrl");

            if bot_id.is_empty() && !base_url.is_empty() {
                bot_id = base_url.to_string();
            }
            if bot_id.is_empty() {
                return Err(GatewayError::Configuration(
                    "Coze provider requires botID".to_string(),
                ));
            }

            let handler = CozeHandler::new(
                api_key,
                bot_id,
                user_id,
                system_prompt,
                if coze_base_url.is_empty() {
                    None
                } else {
                    Some(coze_base_url)
                },
                emitter,
            )?;
            Ok(Arc::new(handler))
        }
        "ollama" => Ok(Arc::new(OllamaHandler::new(
            api_key,
            base_url,
            system_prompt,
            emitter,
        ))),
        _ => {
            let base_url = if base_url.is_empty() {
                DEFAULT_OPENAI_BASE_URL
            } else {
                base_url
            };
            Ok(Arc::new(OpenAICompatibleHandler::new(
                api_key,
                base_url,
                system_prompt,
                emitter,
            )))
        }
    }
}
