#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use evhub_domain::{ChannelId, Topic};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::messages::condition_channel;
use crate::{CreatedSubscription, ProviderError, RemoteSubscription, SecretString, SubscriptionApi};

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";

/// Pages fetched by one `list_subscriptions` call before giving up.
const MAX_LIST_PAGES: usize = 50;

/// Map an HTTP status to the error taxonomy.
pub(crate) fn error_for_status(status: StatusCode, body: &str, label: &str) -> ProviderError {
	let detail = format!("{label}: status={status} body={body}");
	if status == StatusCode::NOT_FOUND {
		ProviderError::NotFound(detail)
	} else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
		ProviderError::Unavailable(detail)
	} else {
		ProviderError::rejected(Some(status.as_u16()), detail)
	}
}

fn network_error(label: &str, e: reqwest::Error) -> ProviderError {
	ProviderError::Unavailable(format!("{label}: {e}"))
}

#[derive(Debug, Serialize)]
struct CreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	kind: &'a str,
	version: &'a str,
	condition: serde_json::Value,
	transport: WebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct WebsocketTransport<'a> {
	method: &'a str,
	session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubscriptionsResponse {
	data: Vec<SubscriptionData>,
	#[serde(default)]
	pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
	#[serde(default)]
	cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionData {
	id: String,
	status: String,
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	condition: serde_json::Value,
	#[serde(default)]
	transport: Option<serde_json::Value>,
	#[serde(default)]
	cost: i64,
}

/// REST side of the EventSub provider. Subscriptions bind to the socket session id shared
/// with [`super::EventSubTransport`].
#[derive(Clone)]
pub struct EventSubApi {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	access_token: SecretString,
	condition_key: String,
	topic_versions: BTreeMap<String, String>,
	session_id: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for EventSubApi {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSubApi")
			.field("base_url", &self.base_url.as_str())
			.field("client_id", &self.client_id)
			.field("condition_key", &self.condition_key)
			.finish_non_exhaustive()
	}
}

impl EventSubApi {
	pub(crate) fn new(
		base_url: Url,
		client_id: String,
		access_token: SecretString,
		condition_key: String,
		topic_versions: BTreeMap<String, String>,
		session_id: Arc<RwLock<Option<String>>>,
	) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("evhub/0.x (eventsub-ws)")
			.build()
			.map_err(|e| anyhow::anyhow!("build reqwest client: {e}"))?;

		Ok(Self {
			http,
			base_url,
			client_id,
			access_token,
			condition_key,
			topic_versions,
			session_id,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.access_token.expose()))
	}

	fn url(&self) -> Result<Url, ProviderError> {
		self.base_url
			.join(EVENTSUB_SUBSCRIPTIONS_PATH)
			.map_err(|e| ProviderError::rejected(None, format!("join api url: {e}")))
	}

	fn current_session(&self) -> Result<String, ProviderError> {
		self.session_id
			.read()
			.clone()
			.ok_or_else(|| ProviderError::Unavailable("no eventsub session".to_string()))
	}

	fn version_for(&self, topic: &Topic) -> &str {
		self.topic_versions.get(topic.as_str()).map(String::as_str).unwrap_or("1")
	}
}

#[async_trait::async_trait]
impl SubscriptionApi for EventSubApi {
	async fn create_subscription(
		&self,
		channel_id: &ChannelId,
		topic: &Topic,
	) -> Result<CreatedSubscription, ProviderError> {
		let session_id = self.current_session()?;
		let url = self.url()?;

		let mut condition = serde_json::Map::new();
		condition.insert(
			self.condition_key.clone(),
			serde_json::Value::String(channel_id.as_str().to_string()),
		);

		let req = CreateSubscriptionRequest {
			kind: topic.as_str(),
			version: self.version_for(topic),
			condition: serde_json::Value::Object(condition),
			transport: WebsocketTransport {
				method: "websocket",
				session_id: &session_id,
			},
		};

		let label = "POST /helix/eventsub/subscriptions";
		let resp = self
			.authed(self.http.post(url))
			.json(&req)
			.send()
			.await
			.map_err(|e| network_error(label, e))?;

		let status = resp.status();
		let body = resp.text().await.map_err(|e| network_error(label, e))?;

		if !status.is_success() {
			return Err(error_for_status(status, &body, label));
		}

		let parsed: SubscriptionsResponse = serde_json::from_str(&body)
			.map_err(|e| ProviderError::Unavailable(format!("{label}: parse json: {e}")))?;
		let data = parsed
			.data
			.into_iter()
			.next()
			.ok_or_else(|| ProviderError::Unavailable(format!("{label}: empty data")))?;

		debug!(%channel_id, %topic, subscription_id = %data.id, status = %data.status, "eventsub subscription created");

		Ok(CreatedSubscription {
			id: data.id,
			status: data.status,
			cost: data.cost,
		})
	}

	async fn delete_subscription(&self, subscription_id: &str) -> Result<(), ProviderError> {
		let mut url = self.url()?;
		url.query_pairs_mut().append_pair("id", subscription_id);

		let label = "DELETE /helix/eventsub/subscriptions";
		let resp = self
			.authed(self.http.delete(url))
			.send()
			.await
			.map_err(|e| network_error(label, e))?;

		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}

		let body = resp.text().await.unwrap_or_default();
		Err(error_for_status(status, &body, label))
	}

	async fn list_subscriptions(&self) -> Result<Option<Vec<RemoteSubscription>>, ProviderError> {
		let session_id = self.current_session()?;
		let label = "GET /helix/eventsub/subscriptions";

		let mut out = Vec::new();
		let mut cursor: Option<String> = None;

		for _ in 0..MAX_LIST_PAGES {
			let mut url = self.url()?;
			{
				let mut q = url.query_pairs_mut();
				q.append_pair("status", "enabled");
				if let Some(c) = cursor.as_deref() {
					q.append_pair("after", c);
				}
			}

			let resp = self
				.authed(self.http.get(url))
				.send()
				.await
				.map_err(|e| network_error(label, e))?;

			let status = resp.status();
			let body = resp.text().await.map_err(|e| network_error(label, e))?;
			if !status.is_success() {
				return Err(error_for_status(status, &body, label));
			}

			let parsed: SubscriptionsResponse = serde_json::from_str(&body)
				.map_err(|e| ProviderError::Unavailable(format!("{label}: parse json: {e}")))?;

			for sub in parsed.data {
				let same_session = sub
					.transport
					.as_ref()
					.and_then(|t| t.get("session_id"))
					.and_then(|v| v.as_str())
					.is_some_and(|s| s == session_id);
				if !same_session {
					continue;
				}

				let Some(channel_id) = condition_channel(&sub.condition, &self.condition_key) else {
					continue;
				};
				let Ok(topic) = Topic::new(sub.kind) else {
					continue;
				};

				out.push(RemoteSubscription {
					id: sub.id,
					channel_id,
					topic,
					status: sub.status,
					cost: sub.cost,
				});
			}

			cursor = parsed.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
			if cursor.is_none() {
				return Ok(Some(out));
			}
		}

		Err(ProviderError::Unavailable(format!(
			"{label}: pagination did not finish after {MAX_LIST_PAGES} pages"
		)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_codes_map_to_taxonomy() {
		assert!(error_for_status(StatusCode::UNAUTHORIZED, "", "x").is_auth());
		assert!(error_for_status(StatusCode::FORBIDDEN, "", "x").is_auth());
		assert!(matches!(
			error_for_status(StatusCode::CONFLICT, "", "x"),
			ProviderError::Rejected { status: Some(409), .. }
		));
		assert!(error_for_status(StatusCode::NOT_FOUND, "", "x").is_not_found());
		assert!(error_for_status(StatusCode::TOO_MANY_REQUESTS, "", "x").is_retryable());
		assert!(error_for_status(StatusCode::BAD_GATEWAY, "", "x").is_retryable());
	}

	#[tokio::test]
	async fn create_without_session_is_unavailable() {
		let api = EventSubApi::new(
			Url::parse("http://127.0.0.1:9").expect("url"),
			"cid".to_string(),
			SecretString::new("tok"),
			"broadcaster_user_id".to_string(),
			BTreeMap::new(),
			Arc::new(RwLock::new(None)),
		)
		.expect("api");

		let err = api
			.create_subscription(
				&ChannelId::new("100").expect("channel"),
				&Topic::new("stream.online").expect("topic"),
			)
			.await
			.unwrap_err();
		assert!(matches!(err, ProviderError::Unavailable(_)));
	}
}
