//! MAAS API client implementation.
//!
//! Implements [`ProvisionClient`] against the MAAS 3.x region API:
//! OAuth 1.0 PLAINTEXT-signed requests, form-encoded operation posts
//! (`op=commission` and friends), JSON responses.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::client::{
    BondRequest, ClientError, CommissionOpts, CreateMachineSpec, DeployOpts, LinkMode,
    MachineUpdate, ProvisionClient, ReleaseOpts,
};
use crate::machine::MachineRecord;
use crate::network::{InterfaceDescriptor, SubnetRef};
use crate::storage::BlockDevice;

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

type FormParams = Vec<(String, String)>;

/// MAAS region API client.
#[derive(Clone)]
pub struct MaasClient {
    client: Client,
    /// Base URL up to and including the MAAS prefix, no trailing slash.
    api_url: String,
    consumer_key: String,
    token: String,
    secret: String,
}

impl MaasClient {
    /// Create a client for the given endpoint.
    ///
    /// # Arguments
    /// * `api_url` - e.g. `http://maas.example:5240/MAAS`
    /// * `api_key` - `consumer:token:secret` as issued by MAAS
    ///
    /// # Errors
    /// Returns an error if the key is malformed or the HTTP client
    /// cannot be created.
    pub fn new(api_url: impl Into<String>, api_key: &str) -> Result<Self, ClientError> {
        let parts: Vec<&str> = api_key.split(':').collect();
        let &[consumer_key, token, secret] = parts.as_slice() else {
            return Err(ClientError::Config(
                "API key must be consumer:token:secret".to_string(),
            ));
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            consumer_key: consumer_key.to_string(),
            token: token.to_string(),
            secret: secret.to_string(),
        })
    }

    /// OAuth 1.0 PLAINTEXT authorization header. MAAS does not use a
    /// token secret, so the signature is `&<secret>`.
    fn authorization(&self) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let timestamp = chrono::Utc::now().timestamp();
        format!(
            "OAuth oauth_version=\"1.0\", oauth_signature_method=\"PLAINTEXT\", \
             oauth_consumer_key=\"{}\", oauth_token=\"{}\", oauth_signature=\"&{}\", \
             oauth_nonce=\"{nonce}\", oauth_timestamp=\"{timestamp}\"",
            self.consumer_key, self.token, self.secret
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/2.0/{}", self.api_url, path)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.authorization())
            .header("Accept", "application/json")
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &FormParams,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.authorization())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// POST a form and only check the status; the response body is
    /// whatever the operation returns and we do not need it.
    async fn post_form_ok(&self, path: &str, params: &FormParams) -> Result<(), ClientError> {
        let url = self.url(path);
        debug!(url = %url, "POST request (status only)");

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.authorization())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;

        Self::check_status(response).await
    }

    async fn put_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &FormParams,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "PUT request");

        let response = self
            .client
            .put(&url)
            .header("Authorization", self.authorization())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn put_form_ok(&self, path: &str, params: &FormParams) -> Result<(), ClientError> {
        let url = self.url(path);
        debug!(url = %url, "PUT request (status only)");

        let response = self
            .client
            .put(&url)
            .header("Authorization", self.authorization())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;

        Self::check_status(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(ClientError::Serialization)
        } else if status == StatusCode::NOT_FOUND {
            Err(ClientError::NotFound(text))
        } else {
            Err(ClientError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<(), ClientError> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            Err(ClientError::NotFound(text))
        } else {
            Err(ClientError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }
}

fn push_power_parameters(
    params: &mut FormParams,
    power: &std::collections::BTreeMap<String, String>,
) {
    for (key, value) in power {
        params.push((format!("power_parameters_{key}"), value.clone()));
    }
}

#[async_trait]
impl ProvisionClient for MaasClient {
    async fn list_machines(&self) -> Result<Vec<MachineRecord>, ClientError> {
        self.get("machines/").await
    }

    async fn get_machine(&self, system_id: &str) -> Result<MachineRecord, ClientError> {
        self.get(&format!("machines/{system_id}/")).await
    }

    async fn create_machine(&self, spec: CreateMachineSpec) -> Result<MachineRecord, ClientError> {
        let mut params: FormParams = vec![("hostname".to_string(), spec.hostname.clone())];
        for mac in &spec.mac_addresses {
            params.push(("mac_addresses".to_string(), mac.clone()));
        }
        if let Some(ref power_type) = spec.power_type {
            params.push(("power_type".to_string(), power_type.clone()));
        }
        push_power_parameters(&mut params, &spec.power_parameters);

        self.post_form("machines/", &params).await
    }

    async fn update_machine(
        &self,
        system_id: &str,
        update: MachineUpdate,
    ) -> Result<MachineRecord, ClientError> {
        let mut params: FormParams = Vec::new();
        if let Some(ref hostname) = update.hostname {
            params.push(("hostname".to_string(), hostname.clone()));
        }
        if let Some(ref power_type) = update.power_type {
            params.push(("power_type".to_string(), power_type.clone()));
        }
        push_power_parameters(&mut params, &update.power_parameters);
        if !update.tag_names.is_empty() {
            params.push(("tag_names".to_string(), update.tag_names.join(",")));
        }
        if let Some(ref description) = update.description {
            params.push(("description".to_string(), description.clone()));
        }

        self.put_form(&format!("machines/{system_id}/"), &params).await
    }

    async fn commission(&self, system_id: &str, opts: CommissionOpts) -> Result<(), ClientError> {
        let mut params: FormParams = vec![
            ("op".to_string(), "commission".to_string()),
            ("enable_ssh".to_string(), opts.enable_ssh.to_string()),
        ];
        if !opts.commissioning_scripts.is_empty() {
            params.push((
                "commissioning_scripts".to_string(),
                opts.commissioning_scripts.join(","),
            ));
        }

        self.post_form_ok(&format!("machines/{system_id}/"), &params)
            .await
    }

    async fn deploy(&self, system_id: &str, opts: DeployOpts) -> Result<(), ClientError> {
        let mut params: FormParams = vec![("op".to_string(), "deploy".to_string())];
        if let Some(ref distro) = opts.distro_series {
            params.push(("distro_series".to_string(), distro.clone()));
        }
        if let Some(ref user_data) = opts.user_data {
            params.push(("user_data".to_string(), user_data.clone()));
        }

        self.post_form_ok(&format!("machines/{system_id}/"), &params)
            .await
    }

    async fn release(&self, system_id: &str, opts: ReleaseOpts) -> Result<(), ClientError> {
        let params: FormParams = vec![
            ("op".to_string(), "release".to_string()),
            ("erase".to_string(), opts.erase.to_string()),
        ];

        self.post_form_ok(&format!("machines/{system_id}/"), &params)
            .await
    }

    async fn delete_machine(&self, system_id: &str) -> Result<(), ClientError> {
        let params: FormParams = vec![("op".to_string(), "delete".to_string())];
        self.post_form_ok(&format!("machines/{system_id}/"), &params)
            .await
    }

    async fn set_boot_order(&self, system_id: &str, devices: &[String]) -> Result<(), ClientError> {
        let params: FormParams = vec![
            ("op".to_string(), "set_boot_device".to_string()),
            ("boot_device".to_string(), devices.join(",")),
            ("persistent".to_string(), "true".to_string()),
        ];

        self.post_form_ok(&format!("machines/{system_id}/"), &params)
            .await
    }

    async fn list_interfaces(
        &self,
        system_id: &str,
    ) -> Result<Vec<InterfaceDescriptor>, ClientError> {
        self.get(&format!("machines/{system_id}/interfaces/")).await
    }

    async fn create_bond(
        &self,
        system_id: &str,
        req: BondRequest,
    ) -> Result<InterfaceDescriptor, ClientError> {
        let mut params: FormParams = vec![
            ("op".to_string(), "create_bond".to_string()),
            ("name".to_string(), req.name.clone()),
            ("bond_mode".to_string(), req.mode.clone()),
        ];
        // Parents go out as one parameter per member id.
        for parent in &req.parents {
            params.push(("parents".to_string(), parent.to_string()));
        }
        if let Some(mtu) = req.mtu {
            params.push(("mtu".to_string(), mtu.to_string()));
        }
        if let Some(ref rate) = req.lacp_rate {
            params.push(("bond_lacp_rate".to_string(), rate.clone()));
        }
        if let Some(ref policy) = req.xmit_hash_policy {
            params.push(("bond_xmit_hash_policy".to_string(), policy.clone()));
        }

        self.post_form(&format!("machines/{system_id}/interfaces/"), &params)
            .await
    }

    async fn create_vlan_interface(
        &self,
        system_id: &str,
        parent_id: i64,
        vlan_id: u16,
    ) -> Result<InterfaceDescriptor, ClientError> {
        let params: FormParams = vec![
            ("op".to_string(), "create_vlan".to_string()),
            ("parent".to_string(), parent_id.to_string()),
            ("vlan".to_string(), vlan_id.to_string()),
        ];

        self.post_form(&format!("machines/{system_id}/interfaces/"), &params)
            .await
    }

    async fn link_subnet(
        &self,
        system_id: &str,
        interface_id: i64,
        mode: LinkMode,
        subnet_id: i64,
        ip_address: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut params: FormParams = vec![
            ("op".to_string(), "link_subnet".to_string()),
            ("mode".to_string(), mode.to_string().to_uppercase()),
            ("subnet".to_string(), subnet_id.to_string()),
        ];
        if let Some(ip) = ip_address {
            params.push(("ip_address".to_string(), ip.to_string()));
        }

        self.post_form_ok(
            &format!("machines/{system_id}/interfaces/{interface_id}/"),
            &params,
        )
        .await
    }

    async fn list_subnets(&self) -> Result<Vec<SubnetRef>, ClientError> {
        self.get("subnets/").await
    }

    async fn list_block_devices(&self, system_id: &str) -> Result<Vec<BlockDevice>, ClientError> {
        self.get(&format!("machines/{system_id}/block-devices/"))
            .await
    }

    async fn set_storage_config(&self, system_id: &str, curtin: &str) -> Result<(), ClientError> {
        let params: FormParams = vec![("curtin_userdata".to_string(), curtin.to_string())];
        self.put_form_ok(&format!("machines/{system_id}/"), &params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> MaasClient {
        MaasClient::new(format!("{}/MAAS", server.uri()), "consumer:token:secret").unwrap()
    }

    #[test]
    fn test_rejects_malformed_api_key() {
        let result = MaasClient::new("http://maas.example:5240/MAAS", "not-a-key");
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn test_authorization_header_shape() {
        let client =
            MaasClient::new("http://maas.example:5240/MAAS", "consumer:token:secret").unwrap();
        let header = client.authorization();
        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_signature_method=\"PLAINTEXT\""));
        assert!(header.contains("oauth_consumer_key=\"consumer\""));
        assert!(header.contains("oauth_signature=\"&secret\""));
    }

    #[tokio::test]
    async fn test_list_machines_parses_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/MAAS/api/2.0/machines/"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "system_id": "abc001",
                    "hostname": "node01",
                    "status_name": "READY",
                    "mac_addresses": ["aa:bb:cc:dd:ee:01"]
                }
            ])))
            .mount(&server)
            .await;

        let machines = client_for(&server).list_machines().await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].system_id, "abc001");
        assert_eq!(machines[0].state, crate::machine::MachineState::Ready);
    }

    #[tokio::test]
    async fn test_get_machine_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/MAAS/api/2.0/machines/gone42/"))
            .respond_with(ResponseTemplate::new(404).set_body_string("No Machine matches"))
            .mount(&server)
            .await;

        let result = client_for(&server).get_machine("gone42").await;
        assert!(matches!(result, Err(ClientError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/MAAS/api/2.0/machines/"))
            .respond_with(ResponseTemplate::new(503).set_body_string("region overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server).list_machines().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_commission_posts_operation_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/MAAS/api/2.0/machines/abc001/"))
            .and(body_string_contains("op=commission"))
            .and(body_string_contains("enable_ssh=true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .commission("abc001", CommissionOpts::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_bond_repeats_parents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/MAAS/api/2.0/machines/abc001/interfaces/"))
            .and(body_string_contains("op=create_bond"))
            .and(body_string_contains("parents=11"))
            .and(body_string_contains("parents=12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 31,
                "name": "bond0",
                "type": "bond"
            })))
            .mount(&server)
            .await;

        let bond = client_for(&server)
            .create_bond(
                "abc001",
                BondRequest {
                    name: "bond0".to_string(),
                    parents: vec![11, 12],
                    mode: "802.3ad".to_string(),
                    mtu: Some(9000),
                    lacp_rate: Some("fast".to_string()),
                    xmit_hash_policy: Some("layer3+4".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(bond.name, "bond0");
        assert_eq!(bond.id, 31);
    }
}
