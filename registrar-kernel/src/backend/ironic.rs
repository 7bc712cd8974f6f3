/**
 * IRONIC CLIENT - REST implementation of ProvisioningBackend
 *
 * Talks to the bare-metal API (`/v1/nodes`, `/v1/nodes/{id}/ports`, provision
 * state and JSON-Patch endpoints). When keystone is configured, a token is
 * requested with the service credentials, cached, and dropped as soon as the
 * API answers 401 so the next call re-authenticates.
 */

use super::{BackendInterface, BackendNode, PatchOp, ProvisioningBackend};
use crate::config::{BackendConf, KeystoneConf};
use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

const API_VERSION_HEADER: &str = "X-OpenStack-Ironic-API-Version";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

#[derive(Debug, Deserialize)]
struct NodeList {
    nodes: Vec<BackendNode>,
}

#[derive(Debug, Deserialize)]
struct PortList {
    ports: Vec<BackendInterface>,
}

pub struct IronicClient {
    http: Client,
    endpoint: String,
    api_version: String,
    keystone: Option<KeystoneConf>,
    token: Mutex<Option<String>>,
}

impl IronicClient {
    pub fn new(conf: &BackendConf) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            http,
            endpoint: conf.endpoint.trim_end_matches('/').to_string(),
            api_version: conf.api_version.clone(),
            keystone: conf.keystone.clone(),
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn service_token(&self, ks: &KeystoneConf) -> Result<String, BackendError> {
        let cached = self.token.lock().clone();
        if let Some(token) = cached {
            return Ok(token);
        }
        let token = request_token(&self.http, ks, &ks.username, &ks.password, &ks.project_name)
            .await?
            .ok_or_else(|| BackendError::Auth("service credentials rejected".into()))?;
        *self.token.lock() = Some(token.clone());
        Ok(token)
    }

    async fn send(
        &self,
        operation: &'static str,
        req: RequestBuilder,
    ) -> Result<Response, BackendError> {
        let mut req = req.header(API_VERSION_HEADER, &self.api_version);
        if let Some(ks) = &self.keystone {
            req = req.header(AUTH_TOKEN_HEADER, self.service_token(ks).await?);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            self.token.lock().take();
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                operation,
                status: status.as_u16(),
                body,
            });
        }
        debug!(operation, %status, "backend call ok");
        Ok(resp)
    }
}

/// Password authentication against keystone v3. `Ok(None)` means the
/// credentials were refused, `Err` that keystone could not be asked.
async fn request_token(
    http: &Client,
    ks: &KeystoneConf,
    username: &str,
    password: &str,
    project: &str,
) -> Result<Option<String>, BackendError> {
    let base = ks.auth_url.trim_end_matches('/');
    let url = if base.ends_with("/v3") {
        format!("{base}/auth/tokens")
    } else {
        format!("{base}/v3/auth/tokens")
    };
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": username,
                        "domain": {"name": ks.user_domain_name},
                        "password": password
                    }
                }
            },
            "scope": {
                "project": {
                    "name": project,
                    "domain": {"name": ks.user_domain_name}
                }
            }
        }
    });

    let resp = http.post(url).json(&body).send().await?;
    match resp.status() {
        s if s.is_success() => resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|t| Some(t.to_string()))
            .ok_or_else(|| BackendError::Auth("keystone answered without a token".into())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(None),
        status => Err(BackendError::Status {
            operation: "keystone token",
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        }),
    }
}

#[async_trait]
impl ProvisioningBackend for IronicClient {
    async fn list_nodes(&self) -> Result<Vec<BackendNode>, BackendError> {
        let resp = self
            .send("list nodes", self.http.get(self.url("/v1/nodes")))
            .await?;
        Ok(resp.json::<NodeList>().await?.nodes)
    }

    async fn get_node(&self, id: &str) -> Result<BackendNode, BackendError> {
        let resp = self
            .send("get node", self.http.get(self.url(&format!("/v1/nodes/{id}"))))
            .await?;
        Ok(resp.json().await?)
    }

    async fn list_interfaces(&self, id: &str) -> Result<Vec<BackendInterface>, BackendError> {
        let resp = self
            .send(
                "list ports",
                self.http.get(self.url(&format!("/v1/nodes/{id}/ports"))),
            )
            .await?;
        Ok(resp.json::<PortList>().await?.ports)
    }

    async fn set_lifecycle_state(&self, id: &str, target: &str) -> Result<(), BackendError> {
        let req = self
            .http
            .put(self.url(&format!("/v1/nodes/{id}/states/provision")))
            .json(&json!({ "target": target }));
        self.send("set provision state", req).await?;
        Ok(())
    }

    async fn patch_attributes(&self, id: &str, ops: &[PatchOp]) -> Result<(), BackendError> {
        let req = self
            .http
            .patch(self.url(&format!("/v1/nodes/{id}")))
            .json(ops);
        self.send("patch node", req).await?;
        Ok(())
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, BackendError> {
        let Some(ks) = &self.keystone else {
            return Ok(true);
        };
        let project = ks.admin_project_name.as_deref().unwrap_or(&ks.project_name);
        match request_token(&self.http, ks, username, password, project).await {
            Ok(token) => Ok(token.is_some()),
            Err(e) => {
                warn!(%username, error = %e, "credential check failed");
                Ok(false)
            }
        }
    }

    fn auth_enabled(&self) -> bool {
        self.keystone.is_some()
    }
}
