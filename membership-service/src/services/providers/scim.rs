//! SCIM 2.0 backend (RFC 7643 / RFC 7644).
//!
//! Group keys are SCIM `displayName`s and members are `userName`s; both are
//! resolved to resource ids with a filter query before a membership PATCH.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use service_core::observability::inject_trace_context;
use std::time::Duration;

use super::{GroupProvider, ProviderCapabilities};
use crate::models::{
    error_codes, MembershipAction, NormalizedGroup, NormalizedMember, OperationData,
    OperationResult,
};

const PATCH_OP_SCHEMA: &str = "urn:ietf:params:scim:api:messages:2.0:PatchOp";
const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 50;

pub struct ScimProvider {
    name: String,
    base_url: String,
    token: Secret<String>,
    capabilities: ProviderCapabilities,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct ListResponse<T> {
    #[serde(default)]
    total_results: usize,
    #[serde(default, rename = "Resources")]
    resources: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScimGroup {
    id: String,
    display_name: String,
    #[serde(default)]
    members: Vec<ScimMemberRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScimMemberRef {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScimUser {
    id: String,
}

/// Result of an HTTP round trip: a decoded body or a classified failure.
type ScimResult<T> = Result<T, OperationResult>;

impl ScimProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        token: Secret<String>,
        capabilities: ProviderCapabilities,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Failed to build SCIM client: {}", e))
        })?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            capabilities,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        request
            .bearer_auth(self.token.expose_secret())
            .header("Accept", "application/scim+json")
            .headers(headers)
    }

    async fn send(&self, request: RequestBuilder) -> ScimResult<Response> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(classify_response(&self.name, response).await)
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ScimResult<T> {
        let response = self.send(self.client.get(self.url(path)).query(query)).await?;
        response.json::<T>().await.map_err(|e| {
            OperationResult::transient(format!(
                "{} returned an unreadable SCIM body: {}",
                self.name, e
            ))
        })
    }

    fn transport_failure(&self, error: reqwest::Error) -> OperationResult {
        let code = if error.is_timeout() {
            error_codes::TIMEOUT
        } else {
            error_codes::BACKEND_UNAVAILABLE
        };
        tracing::warn!(provider = %self.name, error = %error, "SCIM request failed");
        OperationResult::transient(format!("{} unreachable: {}", self.name, error))
            .with_error_code(code)
    }

    async fn find_group(&self, group_key: &str) -> ScimResult<ScimGroup> {
        let list: ListResponse<ScimGroup> = self
            .get_json(
                "/Groups",
                &[
                    ("filter", format!("displayName eq \"{}\"", escape_filter(group_key))),
                    ("excludedAttributes", "members".to_string()),
                ],
            )
            .await?;

        list.resources.into_iter().next().ok_or_else(|| {
            OperationResult::not_found(format!("group {} not found in {}", group_key, self.name))
                .with_error_code(error_codes::GROUP_NOT_FOUND)
        })
    }

    async fn find_user_id(&self, member: &str) -> ScimResult<String> {
        let list: ListResponse<ScimUser> = self
            .get_json(
                "/Users",
                &[("filter", format!("userName eq \"{}\"", escape_filter(member)))],
            )
            .await?;

        list.resources
            .into_iter()
            .next()
            .map(|u| u.id)
            .ok_or_else(|| {
                OperationResult::not_found(format!("user {} not found in {}", member, self.name))
                    .with_error_code(error_codes::MEMBER_NOT_FOUND)
            })
    }

    async fn group_with_members(&self, group_id: &str) -> ScimResult<ScimGroup> {
        self.get_json(&format!("/Groups/{}", group_id), &[]).await
    }

    async fn patch_members(&self, group_id: &str, operation: serde_json::Value) -> ScimResult<()> {
        let body = json!({
            "schemas": [PATCH_OP_SCHEMA],
            "Operations": [operation],
        });
        self.send(
            self.client
                .patch(self.url(&format!("/Groups/{}", group_id)))
                .header("Content-Type", "application/scim+json")
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn try_add(&self, group_key: &str, member: &str) -> ScimResult<OperationResult> {
        let group = self.find_group(group_key).await?;
        let user_id = self.find_user_id(member).await?;
        let member_ref = ScimMemberRef {
            value: user_id,
            display: Some(member.to_string()),
        };
        self.patch_members(
            &group.id,
            json!({
                "op": "add",
                "path": "members",
                "value": [member_ref],
            }),
        )
        .await?;
        Ok(OperationResult::success(format!(
            "added {} to {} in {}",
            member, group_key, self.name
        )))
    }

    async fn try_remove(&self, group_key: &str, member: &str) -> ScimResult<OperationResult> {
        let group = self.find_group(group_key).await?;
        let user_id = self.find_user_id(member).await?;

        // Many SCIM servers answer 204 for removing a non-member; check first
        // so an absent member surfaces as NOT_FOUND.
        let current = self.group_with_members(&group.id).await?;
        if !current.members.iter().any(|m| m.value == user_id) {
            return Ok(OperationResult::not_found(format!(
                "{} is not a member of {} in {}",
                member, group_key, self.name
            ))
            .with_error_code(error_codes::MEMBER_NOT_FOUND));
        }

        self.patch_members(
            &group.id,
            json!({
                "op": "remove",
                "path": format!("members[value eq \"{}\"]", escape_filter(&user_id)),
            }),
        )
        .await?;
        Ok(OperationResult::success(format!(
            "removed {} from {} in {}",
            member, group_key, self.name
        )))
    }

    async fn try_members(&self, group_key: &str) -> ScimResult<Vec<NormalizedMember>> {
        let group = self.find_group(group_key).await?;
        let group = self.group_with_members(&group.id).await?;
        Ok(group
            .members
            .into_iter()
            .map(|m| {
                let raw = serde_json::to_value(&m).unwrap_or_default();
                let email = m.display.clone().unwrap_or_else(|| m.value.clone());
                NormalizedMember::new(email, m.value.clone())
                    .with_provider_member_id(m.value)
                    .with_raw_payload(raw)
            })
            .collect())
    }

    async fn try_list(&self) -> ScimResult<Vec<NormalizedGroup>> {
        let mut groups = Vec::new();
        let mut start_index = 1;
        let mut total_results = 0;

        for _ in 0..MAX_PAGES {
            let page: ListResponse<ScimGroup> = self
                .get_json(
                    "/Groups",
                    &[
                        ("startIndex", start_index.to_string()),
                        ("count", PAGE_SIZE.to_string()),
                        ("excludedAttributes", "members".to_string()),
                    ],
                )
                .await?;

            let fetched = page.resources.len();
            total_results = page.total_results;
            groups.extend(page.resources.into_iter().map(|g| {
                NormalizedGroup::new(g.display_name.clone(), g.display_name, self.name.clone())
                    .with_description(format!("scim:{}", g.id))
            }));

            start_index += fetched;
            if fetched == 0 || groups.len() >= total_results {
                return Ok(groups);
            }
        }

        // A partial listing would make unlisted groups look undefined to callers.
        tracing::warn!(
            provider = %self.name,
            fetched = groups.len(),
            total_results,
            max_pages = MAX_PAGES,
            "SCIM group listing truncated at page limit"
        );
        Err(OperationResult::transient(format!(
            "group listing for {} stopped after {} of {} groups",
            self.name,
            groups.len(),
            total_results
        ))
        .with_error_code(error_codes::INCOMPLETE_LISTING))
    }
}

#[async_trait]
impl GroupProvider for ScimProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn add_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult {
        tracing::info!(
            provider = %self.name,
            group_id = group_key,
            member,
            justification = justification.unwrap_or(""),
            "SCIM add member"
        );
        self.try_add(group_key, member).await.unwrap_or_else(|e| e)
    }

    async fn remove_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult {
        tracing::info!(
            provider = %self.name,
            group_id = group_key,
            member,
            justification = justification.unwrap_or(""),
            "SCIM remove member"
        );
        self.try_remove(group_key, member).await.unwrap_or_else(|e| e)
    }

    async fn get_group_members(&self, group_key: &str) -> OperationResult {
        match self.try_members(group_key).await {
            Ok(members) => OperationResult::success(format!(
                "{} members in {}",
                members.len(),
                group_key
            ))
            .with_data(OperationData::Members(members)),
            Err(result) => result,
        }
    }

    async fn list_groups(&self) -> OperationResult {
        match self.try_list().await {
            Ok(groups) => OperationResult::success(format!("{} groups", groups.len()))
                .with_data(OperationData::Groups(groups)),
            Err(result) => result,
        }
    }

    async fn validate_permissions(
        &self,
        user_key: &str,
        group_key: &str,
        action: MembershipAction,
    ) -> OperationResult {
        // SCIM exposes no ACL query. Reaching the group with our credentials is
        // the only check available; authorization is enforced on the write.
        match self.find_group(group_key).await {
            Ok(_) => OperationResult::success(format!("{} may {}", user_key, action))
                .with_data(OperationData::Permission { allowed: true }),
            Err(result) => result,
        }
    }
}

/// Map a non-2xx SCIM response onto the operation taxonomy.
async fn classify_response(provider: &str, response: Response) -> OperationResult {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let detail = response.text().await.unwrap_or_default();
    classify_status(provider, status, retry_after, &detail)
}

pub(crate) fn classify_status(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    detail: &str,
) -> OperationResult {
    let message = if detail.is_empty() {
        format!("{} answered {}", provider, status)
    } else {
        format!("{} answered {}: {}", provider, status, detail)
    };

    let result = match status {
        StatusCode::NOT_FOUND => OperationResult::not_found(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            OperationResult::permanent(message).with_error_code(error_codes::UNAUTHORIZED)
        }
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            OperationResult::permanent(message).with_error_code(error_codes::INVALID_REQUEST)
        }
        StatusCode::TOO_MANY_REQUESTS => {
            OperationResult::transient(message).with_error_code(error_codes::RATE_LIMITED)
        }
        StatusCode::REQUEST_TIMEOUT => {
            OperationResult::transient(message).with_error_code(error_codes::TIMEOUT)
        }
        s if s.is_server_error() => {
            OperationResult::transient(message).with_error_code(error_codes::BACKEND_UNAVAILABLE)
        }
        _ => OperationResult::permanent(message).with_error_code(error_codes::INVALID_REQUEST),
    };

    match retry_after {
        Some(seconds) if result.status.is_retryable() => result.with_retry_after(seconds),
        _ => result,
    }
}

fn escape_filter(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
