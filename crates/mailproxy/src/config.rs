use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::LazyLock,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use url::Url;
use veil::Redact;

pub static CONFIG: LazyLock<DynAppConfig> = LazyLock::new(get_config);

#[serde_as]
#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(default)]
pub struct DynAppConfig {
    pub bind_ip: IpAddr,
    pub listen_port: u16,
    /// Port of the separate listener serving `/metrics`.
    pub metrics_port: u16,
    /// Every authorized request is forwarded to this host. Path and query of
    /// the inbound request are appended.
    pub upstream_url: Url,
    /// JSON document mapping application ids to the mailboxes they own.
    pub mailbox_access_file: PathBuf,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub entitlement_cache_ttl: Duration,
    /// Upper bound for bodies that have to be inspected before forwarding.
    pub max_request_body_size: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_request_time: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub upstream_timeout: Duration,
    pub openid: Option<OpenIdConfig>,
    /// If set, the proxy authenticates against the upstream with its own
    /// client credentials instead of passing the caller's token through.
    pub upstream_auth: Option<UpstreamAuthConfig>,
}

impl Default for DynAppConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 8080,
            metrics_port: 9000,
            upstream_url: "https://graph.microsoft.com"
                .parse()
                .expect("Default upstream url is valid"),
            mailbox_access_file: PathBuf::from("mailboxAccess.json"),
            entitlement_cache_ttl: Duration::from_secs(300),
            max_request_body_size: 4 * 1024 * 1024,
            max_request_time: Duration::from_secs(100),
            upstream_timeout: Duration::from_secs(90),
            openid: None,
            upstream_auth: None,
        }
    }
}

#[serde_as]
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct OpenIdConfig {
    /// Issuer of the access tokens. The discovery document is fetched from
    /// `<provider_uri>/.well-known/openid-configuration`.
    pub provider_uri: Url,
    /// Client id of the proxy's own app registration.
    pub client_id: String,
    #[serde(default)]
    pub additional_audiences: Vec<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_jwks_refresh_interval")]
    pub jwks_refresh_interval: Duration,
}

impl OpenIdConfig {
    /// Tokens may be issued either for `api://<client_id>` or the bare client id.
    #[must_use]
    pub fn accepted_audiences(&self) -> Vec<String> {
        let mut audiences = vec![format!("api://{}", self.client_id), self.client_id.clone()];
        audiences.extend(self.additional_audiences.iter().cloned());
        audiences
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Redact)]
pub struct UpstreamAuthConfig {
    pub tenant_id: String,
    pub client_id: String,
    #[redact]
    pub client_secret: String,
    #[serde(default = "default_authority_host")]
    pub authority_host: Url,
    #[serde(default = "default_upstream_scope")]
    pub scope: String,
}

fn default_jwks_refresh_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_authority_host() -> Url {
    "https://login.microsoftonline.com"
        .parse()
        .expect("Default authority host is valid")
}

fn default_upstream_scope() -> String {
    "https://graph.microsoft.com/.default".to_string()
}

fn get_config() -> DynAppConfig {
    let defaults = figment::providers::Serialized::defaults(DynAppConfig::default());

    #[cfg(not(test))]
    let prefixes = &["MAILPROXY__"];
    #[cfg(test)]
    let prefixes = &["MAILPROXY_TEST__"];

    let mut config = figment::Figment::from(defaults);
    for prefix in prefixes {
        let env = figment::providers::Env::prefixed(prefix).split("__");
        config = config.merge(env);
    }

    match config.extract::<DynAppConfig>() {
        Ok(c) => c,
        Err(e) => {
            panic!("Failed to extract mailproxy config: {e}");
        }
    }
}
