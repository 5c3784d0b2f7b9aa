//! HTTP client for the external network-information service, plus its
//! tool wrapper for the realtime session.
//!
//! The backend answers natural-language questions about the network
//! (routers, clients, interface traffic) and can take tens of seconds on
//! multi-router queries, so its timeouts are generous and every failure
//! is translated into something the assistant can say.

use super::Tool;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{error::Error as StdError, fmt, time::Duration};
use tracing::{info, instrument, warn};
use url::Url;

/// Timeout handed to the backend for one query, in seconds.
const DEFAULT_QUERY_TIMEOUT: u64 = 60;

/// Bounds accepted for a caller-chosen query timeout.
const QUERY_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 15..=90;

/// The HTTP request timeout; must outlast the backend's own limit.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(70);

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
#[non_exhaustive]
pub enum NetInfoError {
    Http(reqwest::Error),
    Url(url::ParseError),
}

impl From<reqwest::Error> for NetInfoError {
    fn from(e: reqwest::Error) -> Self {
        NetInfoError::Http(e)
    }
}

impl From<url::ParseError> for NetInfoError {
    fn from(e: url::ParseError) -> Self {
        NetInfoError::Url(e)
    }
}

impl fmt::Display for NetInfoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network info backend: ")?;
        match self {
            NetInfoError::Http(e) => e.fmt(f),
            NetInfoError::Url(e) => e.fmt(f),
        }
    }
}

impl StdError for NetInfoError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            NetInfoError::Http(e) => Some(e),
            NetInfoError::Url(e) => Some(e),
        }
    }
}

/// A decoded `/query` reply.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Client for the network-information HTTP API.
#[derive(Clone, Debug)]
pub struct NetInfoClient {
    http: reqwest::Client,
    query_url: Url,
    health_url: Url,
}

impl NetInfoClient {
    pub fn new(base_url: &str) -> Result<Self, NetInfoError> {
        let base = Url::parse(base_url)?;

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
            query_url: base.join("query")?,
            health_url: base.join("health")?,
        })
    }

    /// Whether the backend answers its health endpoint.
    #[instrument(skip(self))]
    pub async fn check_health(&self) -> bool {
        let result = self
            .http
            .get(self.health_url.clone())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("Health check failed with status {}.", response.status());
                false
            },
            Err(e) => {
                warn!("Health check error: {e}.");
                false
            },
        }
    }

    /// Asks the backend a natural-language question.
    ///
    /// Always produces a result object with a speakable `response`;
    /// timeouts and connection failures become apologies, not errors.
    #[instrument(skip(self))]
    pub async fn query(&self, question: &str, timeout_secs: u64) -> Value {
        if question.len() > 500 {
            return json!({
                "success": false,
                "response": "La pregunta es demasiado larga. Por favor, hazla más corta.",
            });
        }

        if question.len() < 3 {
            return json!({
                "success": false,
                "response": "La pregunta es demasiado corta. Por favor, sé más específico.",
            });
        }

        info!("Querying backend (timeout {timeout_secs}s).");

        let result = self
            .http
            .post(self.query_url.clone())
            .json(&json!({ "question": question, "timeout": timeout_secs }))
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                warn!("Backend query timed out after {timeout_secs}s.");
                return json!({
                    "success": false,
                    "response": "La consulta tardó demasiado tiempo en responder. \
                        Por favor, intenta con una pregunta más simple o inténtalo nuevamente.",
                });
            },
            Err(e) if e.is_connect() => {
                warn!("Backend unreachable: {e}.");
                return json!({
                    "success": false,
                    "response": "No pude conectarme al servidor de información. \
                        Por favor, intenta más tarde.",
                });
            },
            Err(e) => {
                warn!("Backend query error: {e}.");
                return json!({
                    "success": false,
                    "response": "Ocurrió un error al procesar tu consulta. \
                        Por favor, intenta nuevamente.",
                });
            },
        };

        if !response.status().is_success() {
            warn!("Backend answered HTTP {}.", response.status());
            return json!({
                "success": false,
                "response": "Hubo un error al consultar el servidor. \
                    Por favor, intenta nuevamente.",
            });
        }

        match response.json::<QueryReply>().await {
            Ok(reply) => json!({
                "success": reply.success,
                "response": if reply.response.is_empty() {
                    "No recibí respuesta del servidor.".to_owned()
                } else {
                    reply.response
                },
                "metadata": reply.metadata,
            }),
            Err(e) => {
                warn!("Undecodable backend reply: {e}.");
                json!({
                    "success": false,
                    "response": "Ocurrió un error al procesar tu consulta. \
                        Por favor, intenta nuevamente.",
                })
            },
        }
    }
}

/// The `consultar_mikrotik` function exposed to the model.
pub struct NetInfoTool {
    client: NetInfoClient,
}

impl NetInfoTool {
    pub fn new(client: NetInfoClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for NetInfoTool {
    fn name(&self) -> &str {
        "consultar_mikrotik"
    }

    fn definition(&self) -> Value {
        json!({
            "type": "function",
            "name": "consultar_mikrotik",
            "description": "Consulta información sobre routers MikroTik, clientes activos, \
                tráfico de red, interfaces, gateways y estado de la red. \
                Usa esta función cuando el usuario pregunte sobre: \
                clientes conectados, estado de routers, tráfico de red, \
                interfaces libres, gateways activos, o cualquier información \
                técnica de la infraestructura de red.",
            "parameters": {
                "type": "object",
                "properties": {
                    "pregunta": {
                        "type": "string",
                        "description": "La pregunta del usuario en lenguaje natural sobre la red MikroTik. \
                            Ejemplos: '¿Cuántos clientes activos hay en router-146?', \
                            '¿Qué routers están configurados?', \
                            '¿Cuál es el tráfico de la interfaz WAN?'"
                    },
                    "timeout": {
                        "type": "integer",
                        "description": "Tiempo máximo de espera en segundos (default: 60, rango: 15-90)",
                        "default": DEFAULT_QUERY_TIMEOUT,
                        "minimum": *QUERY_TIMEOUT_RANGE.start(),
                        "maximum": *QUERY_TIMEOUT_RANGE.end()
                    }
                },
                "required": ["pregunta"]
            }
        })
    }

    async fn invoke(&self, arguments: Value) -> Value {
        let question = arguments["pregunta"].as_str().unwrap_or_default();

        if question.is_empty() {
            return json!({
                "error": "missing question",
                "response": "No recibí una pregunta para consultar.",
            });
        }

        let timeout = arguments["timeout"]
            .as_u64()
            .unwrap_or(DEFAULT_QUERY_TIMEOUT)
            .clamp(*QUERY_TIMEOUT_RANGE.start(), *QUERY_TIMEOUT_RANGE.end());

        self.client.query(question, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> NetInfoTool {
        NetInfoTool::new(NetInfoClient::new("http://127.0.0.1:1/").unwrap())
    }

    #[test]
    fn definition_declares_required_question() {
        let def = tool().definition();
        assert_eq!(def["name"], "consultar_mikrotik");
        assert_eq!(def["parameters"]["required"][0], "pregunta");
        assert_eq!(def["parameters"]["properties"]["timeout"]["minimum"], 15);
    }

    #[tokio::test]
    async fn missing_question_is_reported_spoken() {
        let out = tool().invoke(json!({})).await;
        assert_eq!(out["error"], "missing question");
        assert!(out["response"].as_str().is_some());
    }

    #[tokio::test]
    async fn question_length_is_validated() {
        let client = NetInfoClient::new("http://127.0.0.1:1/").unwrap();

        let out = client.query("ab", DEFAULT_QUERY_TIMEOUT).await;
        assert_eq!(out["success"], false);

        let long = "x".repeat(501);
        let out = client.query(&long, DEFAULT_QUERY_TIMEOUT).await;
        assert_eq!(out["success"], false);
    }

    #[tokio::test]
    async fn unreachable_backend_becomes_apology() {
        // Port 1 refuses connections; the reply must still be speakable.
        let client = NetInfoClient::new("http://127.0.0.1:1/").unwrap();
        let out = client.query("¿Qué routers están configurados?", 15).await;

        assert_eq!(out["success"], false);
        assert!(!out["response"].as_str().unwrap().is_empty());
    }
}
