//! HTTP client for the load-balancing and networking APIs
//!
//! Speaks the Octavia (`/v2/lbaas/...`) and Neutron (`/v2.0/...`) JSON
//! dialects. Authentication is a pre-issued token sent as `X-Auth-Token`;
//! acquiring and refreshing that token is left to the deployment.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::types::*;
use super::{ApiError, ApiResult, LoadBalancing, Networking};
use crate::config::GlobalOpts;
use crate::error::{Error, Result};

/// Client for an OpenStack-style cloud
#[derive(Clone)]
pub struct OpenStackClient {
    http: Client,
    lb_endpoint: String,
    network_endpoint: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct VersionEntry {
    id: String,
    #[serde(default)]
    status: String,
}

impl OpenStackClient {
    /// Create a new client for the given endpoints
    pub fn new(
        lb_endpoint: &str,
        network_endpoint: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> ApiResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lbaas-k8s/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            lb_endpoint: lb_endpoint.trim_end_matches('/').to_string(),
            network_endpoint: network_endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Build a client from the `[global]` configuration section
    pub fn from_config(global: &GlobalOpts) -> Result<Self> {
        let token = global.resolve_token()?;
        Self::new(
            &global.lb_endpoint,
            &global.network_endpoint,
            token,
            Duration::from_secs(global.request_timeout_secs),
        )
        .map_err(|e| Error::ConfigError(format!("Failed to build HTTP client: {e}")))
    }

    fn lb_url(&self, path: &str) -> String {
        format!("{}/v2/lbaas/{}", self.lb_endpoint, path)
    }

    fn net_url(&self, path: &str) -> String {
        format!("{}/v2.0/{}", self.network_endpoint, path)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.header("X-Auth-Token", token),
            None => builder,
        }
    }

    /// Send the request and map error statuses onto [`ApiError`]
    async fn execute(&self, builder: RequestBuilder) -> ApiResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!("Remote API returned {}: {}", status, body);
        match status {
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::CONFLICT => Err(ApiError::Conflict(body)),
            _ => Err(ApiError::Status {
                code: status.as_u16(),
                body,
            }),
        }
    }

    /// Send the request and decode the object stored under `key`
    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder, key: &str) -> ApiResult<T> {
        let response = self.execute(builder).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        unwrap_envelope(body, key)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> ApiResult<()> {
        self.execute(builder).await.map(|_| ())
    }
}

fn unwrap_envelope<T: DeserializeOwned>(mut body: Value, key: &str) -> ApiResult<T> {
    let inner = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| ApiError::Decode(format!("missing {key:?} in response")))?;
    serde_json::from_value(inner).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Pick the CURRENT version, falling back to the highest advertised one
fn select_version(entries: &[VersionEntry]) -> Option<ApiVersion> {
    let parsed = |entry: &VersionEntry| entry.id.parse::<ApiVersion>().ok();
    entries
        .iter()
        .find(|e| e.status.eq_ignore_ascii_case("CURRENT"))
        .and_then(parsed)
        .or_else(|| entries.iter().filter_map(parsed).max())
}

#[async_trait]
impl LoadBalancing for OpenStackClient {
    async fn api_version(&self) -> ApiResult<ApiVersion> {
        let url = format!("{}/", self.lb_endpoint);
        let entries: Vec<VersionEntry> = self
            .fetch(self.request(Method::GET, &url), "versions")
            .await?;
        select_version(&entries)
            .ok_or_else(|| ApiError::Decode("no usable API version advertised".to_string()))
    }

    async fn list_load_balancers(&self, name: &str) -> ApiResult<Vec<LoadBalancer>> {
        let builder = self
            .request(Method::GET, &self.lb_url("loadbalancers"))
            .query(&[("name", name)]);
        self.fetch(builder, "loadbalancers").await
    }

    async fn get_load_balancer(&self, id: &str) -> ApiResult<LoadBalancer> {
        let url = self.lb_url(&format!("loadbalancers/{id}"));
        self.fetch(self.request(Method::GET, &url), "loadbalancer")
            .await
    }

    async fn create_load_balancer(&self, opts: &CreateLoadBalancer) -> ApiResult<LoadBalancer> {
        let builder = self
            .request(Method::POST, &self.lb_url("loadbalancers"))
            .json(&json!({ "loadbalancer": opts }));
        self.fetch(builder, "loadbalancer").await
    }

    async fn delete_load_balancer(&self, id: &str, cascade: bool) -> ApiResult<()> {
        let mut builder = self.request(
            Method::DELETE,
            &self.lb_url(&format!("loadbalancers/{id}")),
        );
        if cascade {
            builder = builder.query(&[("cascade", "true")]);
        }
        self.send_empty(builder).await
    }

    async fn list_listeners(&self, lb_id: &str) -> ApiResult<Vec<Listener>> {
        let builder = self
            .request(Method::GET, &self.lb_url("listeners"))
            .query(&[("loadbalancer_id", lb_id)]);
        self.fetch(builder, "listeners").await
    }

    async fn create_listener(&self, opts: &CreateListener) -> ApiResult<Listener> {
        let builder = self
            .request(Method::POST, &self.lb_url("listeners"))
            .json(&json!({ "listener": opts }));
        self.fetch(builder, "listener").await
    }

    async fn update_listener(&self, id: &str, opts: &UpdateListener) -> ApiResult<Listener> {
        let builder = self
            .request(Method::PUT, &self.lb_url(&format!("listeners/{id}")))
            .json(&json!({ "listener": opts }));
        self.fetch(builder, "listener").await
    }

    async fn delete_listener(&self, id: &str) -> ApiResult<()> {
        let url = self.lb_url(&format!("listeners/{id}"));
        self.send_empty(self.request(Method::DELETE, &url)).await
    }

    async fn list_pools(&self, lb_id: &str) -> ApiResult<Vec<Pool>> {
        let builder = self
            .request(Method::GET, &self.lb_url("pools"))
            .query(&[("loadbalancer_id", lb_id)]);
        self.fetch(builder, "pools").await
    }

    async fn create_pool(&self, opts: &CreatePool) -> ApiResult<Pool> {
        let builder = self
            .request(Method::POST, &self.lb_url("pools"))
            .json(&json!({ "pool": opts }));
        self.fetch(builder, "pool").await
    }

    async fn update_pool(&self, id: &str, opts: &UpdatePool) -> ApiResult<Pool> {
        let builder = self
            .request(Method::PUT, &self.lb_url(&format!("pools/{id}")))
            .json(&json!({ "pool": opts }));
        self.fetch(builder, "pool").await
    }

    async fn delete_pool(&self, id: &str) -> ApiResult<()> {
        let url = self.lb_url(&format!("pools/{id}"));
        self.send_empty(self.request(Method::DELETE, &url)).await
    }

    async fn list_members(&self, pool_id: &str) -> ApiResult<Vec<Member>> {
        let url = self.lb_url(&format!("pools/{pool_id}/members"));
        self.fetch(self.request(Method::GET, &url), "members").await
    }

    async fn batch_update_members(&self, pool_id: &str, members: &[MemberSpec]) -> ApiResult<()> {
        let builder = self
            .request(
                Method::PUT,
                &self.lb_url(&format!("pools/{pool_id}/members")),
            )
            .json(&json!({ "members": members }));
        self.send_empty(builder).await
    }

    async fn get_health_monitor(&self, id: &str) -> ApiResult<HealthMonitor> {
        let url = self.lb_url(&format!("healthmonitors/{id}"));
        self.fetch(self.request(Method::GET, &url), "healthmonitor")
            .await
    }

    async fn create_health_monitor(
        &self,
        opts: &CreateHealthMonitor,
    ) -> ApiResult<HealthMonitor> {
        let builder = self
            .request(Method::POST, &self.lb_url("healthmonitors"))
            .json(&json!({ "healthmonitor": opts }));
        self.fetch(builder, "healthmonitor").await
    }

    async fn delete_health_monitor(&self, id: &str) -> ApiResult<()> {
        let url = self.lb_url(&format!("healthmonitors/{id}"));
        self.send_empty(self.request(Method::DELETE, &url)).await
    }
}

#[async_trait]
impl Networking for OpenStackClient {
    async fn list_ports(&self, filter: &PortFilter) -> ApiResult<Vec<Port>> {
        let mut query = Vec::new();
        if let Some(device_id) = &filter.device_id {
            query.push(("device_id", device_id.as_str()));
        }
        if let Some(network_id) = &filter.network_id {
            query.push(("network_id", network_id.as_str()));
        }
        if let Some(group) = &filter.security_group_id {
            query.push(("security_groups", group.as_str()));
        }
        let builder = self
            .request(Method::GET, &self.net_url("ports"))
            .query(&query);
        self.fetch(builder, "ports").await
    }

    async fn get_port(&self, id: &str) -> ApiResult<Port> {
        let url = self.net_url(&format!("ports/{id}"));
        self.fetch(self.request(Method::GET, &url), "port").await
    }

    async fn update_port_security_groups(&self, id: &str, groups: &[String]) -> ApiResult<Port> {
        let builder = self
            .request(Method::PUT, &self.net_url(&format!("ports/{id}")))
            .json(&json!({ "port": { "security_groups": groups } }));
        self.fetch(builder, "port").await
    }

    async fn get_subnet(&self, id: &str) -> ApiResult<Subnet> {
        let url = self.net_url(&format!("subnets/{id}"));
        self.fetch(self.request(Method::GET, &url), "subnet").await
    }

    async fn list_security_groups(&self, name: &str) -> ApiResult<Vec<SecurityGroup>> {
        let builder = self
            .request(Method::GET, &self.net_url("security-groups"))
            .query(&[("name", name)]);
        self.fetch(builder, "security_groups").await
    }

    async fn create_security_group(
        &self,
        opts: &CreateSecurityGroup,
    ) -> ApiResult<SecurityGroup> {
        let builder = self
            .request(Method::POST, &self.net_url("security-groups"))
            .json(&json!({ "security_group": opts }));
        self.fetch(builder, "security_group").await
    }

    async fn delete_security_group(&self, id: &str) -> ApiResult<()> {
        let url = self.net_url(&format!("security-groups/{id}"));
        self.send_empty(self.request(Method::DELETE, &url)).await
    }

    async fn list_security_group_rules(
        &self,
        filter: &RuleFilter,
    ) -> ApiResult<Vec<SecurityGroupRule>> {
        let mut query = Vec::new();
        if let Some(group) = &filter.security_group_id {
            query.push(("security_group_id", group.as_str()));
        }
        if let Some(description) = &filter.description {
            query.push(("description", description.as_str()));
        }
        let builder = self
            .request(Method::GET, &self.net_url("security-group-rules"))
            .query(&query);
        self.fetch(builder, "security_group_rules").await
    }

    async fn create_security_group_rule(
        &self,
        spec: &SecurityGroupRuleSpec,
    ) -> ApiResult<SecurityGroupRule> {
        let builder = self
            .request(Method::POST, &self.net_url("security-group-rules"))
            .json(&json!({ "security_group_rule": spec }));
        self.fetch(builder, "security_group_rule").await
    }

    async fn delete_security_group_rule(&self, id: &str) -> ApiResult<()> {
        let url = self.net_url(&format!("security-group-rules/{id}"));
        self.send_empty(self.request(Method::DELETE, &url)).await
    }

    async fn list_floating_ips(&self, filter: &FloatingIpFilter) -> ApiResult<Vec<FloatingIp>> {
        let mut query = Vec::new();
        if let Some(port_id) = &filter.port_id {
            query.push(("port_id", port_id.as_str()));
        }
        if let Some(address) = &filter.floating_ip_address {
            query.push(("floating_ip_address", address.as_str()));
        }
        let builder = self
            .request(Method::GET, &self.net_url("floatingips"))
            .query(&query);
        self.fetch(builder, "floatingips").await
    }

    async fn create_floating_ip(&self, opts: &CreateFloatingIp) -> ApiResult<FloatingIp> {
        let builder = self
            .request(Method::POST, &self.net_url("floatingips"))
            .json(&json!({ "floatingip": opts }));
        self.fetch(builder, "floatingip").await
    }

    async fn update_floating_ip_port(
        &self,
        id: &str,
        port_id: Option<&str>,
    ) -> ApiResult<FloatingIp> {
        let builder = self
            .request(Method::PUT, &self.net_url(&format!("floatingips/{id}")))
            .json(&json!({ "floatingip": { "port_id": port_id } }));
        self.fetch(builder, "floatingip").await
    }

    async fn delete_floating_ip(&self, id: &str) -> ApiResult<()> {
        let url = self.net_url(&format!("floatingips/{id}"));
        self.send_empty(self.request(Method::DELETE, &url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenStackClient {
        OpenStackClient::new(
            &server.uri(),
            &server.uri(),
            Some("secret-token".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_api_version_prefers_current() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "versions": [
                    { "id": "v2.0", "status": "SUPPORTED" },
                    { "id": "v2.27", "status": "CURRENT" },
                ]
            })))
            .mount(&server)
            .await;

        let version = client(&server).api_version().await.unwrap();
        assert_eq!(version, ApiVersion::new(2, 27));
    }

    #[tokio::test]
    async fn test_list_load_balancers_sends_token_and_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/lbaas/loadbalancers"))
            .and(query_param("name", "kube_service_c_default_web"))
            .and(header("X-Auth-Token", "secret-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "loadbalancers": [{
                    "id": "lb-1",
                    "name": "kube_service_c_default_web",
                    "description": null,
                    "vip_address": "10.0.0.10",
                    "vip_port_id": "port-1",
                    "provider": "amphora",
                    "provisioning_status": "ACTIVE",
                    "listeners": [{ "id": "l-1" }],
                }]
            })))
            .mount(&server)
            .await;

        let lbs = client(&server)
            .list_load_balancers("kube_service_c_default_web")
            .await
            .unwrap();
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].id, "lb-1");
        assert_eq!(lbs[0].description, "");
        assert_eq!(lbs[0].listeners[0].id, "l-1");
        assert_eq!(lbs[0].provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn test_error_statuses_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/lbaas/loadbalancers/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/lbaas/listeners/busy"))
            .respond_with(ResponseTemplate::new(409).set_body_string("lb is immutable"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/lbaas/pools/broken"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = client(&server);
        assert!(client
            .get_load_balancer("missing")
            .await
            .unwrap_err()
            .is_not_found());

        match client.delete_listener("busy").await.unwrap_err() {
            ApiError::Conflict(body) => assert_eq!(body, "lb is immutable"),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = client.delete_pool("broken").await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_cascade_delete_query() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/lbaas/loadbalancers/lb-1"))
            .and(query_param("cascade", "true"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .delete_load_balancer("lb-1", true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_batch_update_members_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/lbaas/pools/pool-1/members"))
            .and(body_json(json!({
                "members": [
                    { "name": "node-a", "address": "10.0.0.5", "protocol_port": 30080 }
                ]
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .batch_update_members(
                "pool-1",
                &[MemberSpec {
                    name: "node-a".to_string(),
                    address: "10.0.0.5".to_string(),
                    protocol_port: 30080,
                    subnet_id: None,
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unbind_floating_ip_sends_null_port() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2.0/floatingips/fip-1"))
            .and(body_json(json!({ "floatingip": { "port_id": null } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "floatingip": {
                    "id": "fip-1",
                    "floating_ip_address": "203.0.113.7",
                    "port_id": null,
                }
            })))
            .mount(&server)
            .await;

        let fip = client(&server)
            .update_floating_ip_port("fip-1", None)
            .await
            .unwrap();
        assert_eq!(fip.port_id, None);
    }

    #[test]
    fn test_missing_envelope_is_decode_error() {
        let err = unwrap_envelope::<LoadBalancer>(json!({ "other": {} }), "loadbalancer")
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
