use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::compute::{ComputeApi, ComputeClient, TokenSource, METADATA_TOKEN_URL};
use crate::config::{FleetConfig, Profile, ProfileDefaults};
use crate::error::{CloudError, CloudResult};
use crate::health::DEFAULT_PROBE_TIMEOUT;
use crate::models::Zone;
use crate::reconcile::{FleetTemplate, STARTUP_SCRIPT_KEY};

pub const DEFAULT_MACHINE_TYPE: &str = "n1-standard-1";
pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_IMAGE: &str = "projects/debian-cloud/global/images/family/debian-12";
const ZONE_UP: &str = "UP";

/// Everything a fleet command needs, resolved up front from the profile.
#[derive(Debug, Clone)]
pub struct FleetContext {
    pub project: String,
    /// Unset means the first zone of the project that is UP.
    pub zone: Option<String>,
    pub tokens: TokenSource,
    pub api_base: Option<String>,
    pub defaults: ProfileDefaults,
    pub probe_timeout: Duration,
    pub fleet: Option<FleetConfig>,
}

#[derive(Debug)]
pub enum Gate {
    Ready(FleetContext),
    /// Setting names the profile still lacks.
    NeedsSettings(Vec<String>),
}

impl Gate {
    pub fn into_ready(self) -> Result<FleetContext> {
        match self {
            Gate::Ready(context) => Ok(context),
            Gate::NeedsSettings(missing) => Err(anyhow::anyhow!(
                "Profile is missing required settings: {}",
                missing.join(", ")
            )),
        }
    }
}

/// Check that `profile` can reach the compute API before any command runs.
pub fn gate(profile: &Profile, fleet: Option<&FleetConfig>) -> Gate {
    let mut missing = Vec::new();
    if profile.project.is_none() {
        missing.push("project".to_string());
    }
    let tokens = token_source(profile);
    if tokens.is_none() {
        missing.push("access_token | token_file | metadata_token".to_string());
    }

    match (profile.project.clone(), tokens) {
        (Some(project), Some(tokens)) => Gate::Ready(FleetContext {
            project,
            zone: profile.zone.clone(),
            tokens,
            api_base: profile.api_base.clone(),
            defaults: profile.defaults.clone(),
            probe_timeout: profile
                .defaults
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            fleet: fleet.cloned(),
        }),
        _ => Gate::NeedsSettings(missing),
    }
}

fn token_source(profile: &Profile) -> Option<TokenSource> {
    if let Some(token) = &profile.access_token {
        return Some(TokenSource::Static(token.clone()));
    }
    if let Some(path) = &profile.token_file {
        return Some(TokenSource::File(path.clone()));
    }
    if profile.metadata_token {
        return Some(TokenSource::MetadataServer {
            url: METADATA_TOKEN_URL.to_string(),
        });
    }
    None
}

impl FleetContext {
    /// Client bound to the configured zone, or to the first zone that is UP.
    pub async fn client(&self) -> CloudResult<ComputeClient> {
        let zone = self.zone.clone().unwrap_or_default();
        let client = ComputeClient::new(&self.project, zone, self.tokens.clone())?;
        let client = match &self.api_base {
            Some(base) => client.with_base_url(base),
            None => client,
        };
        if self.zone.is_some() {
            return Ok(client);
        }

        let zones = client.list_zones().await?;
        let zone = first_up_zone(&zones).ok_or_else(|| {
            CloudError::Api(format!("no zone of project {} is UP", self.project))
        })?;
        info!(zone, "no zone configured, using the first zone that is UP");
        Ok(client.with_zone(zone))
    }

    pub fn fleet(&self) -> Result<&FleetConfig> {
        self.fleet
            .as_ref()
            .context("This command needs a fleet name")
    }

    pub fn image_project(&self) -> &str {
        self.defaults.image_project.as_deref().unwrap_or(&self.project)
    }

    pub fn network(&self) -> &str {
        self.defaults.network.as_deref().unwrap_or(DEFAULT_NETWORK)
    }

    /// Image used when the fleet's preferred image is not available.
    pub fn fallback_image(&self) -> &str {
        self.defaults.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    /// Insert template for the fleet in `zone`; `image` is the already resolved reference.
    pub fn template(&self, zone: &str, image: String) -> Result<FleetTemplate> {
        let fleet = self.fleet()?;
        let mut metadata = Vec::new();
        if let Some(path) = &fleet.startup_script {
            let script = fs::read_to_string(path)
                .with_context(|| format!("Failed to read startup script: {}", path.display()))?;
            metadata.push((STARTUP_SCRIPT_KEY.to_string(), script));
        }
        metadata.extend(fleet.metadata.iter().cloned());

        Ok(FleetTemplate {
            prefix: fleet.prefix.clone(),
            name_padding: fleet.name_padding,
            project: self.project.clone(),
            zone: zone.to_string(),
            machine_type: fleet
                .machine_type
                .clone()
                .or_else(|| self.defaults.machine_type.clone())
                .unwrap_or_else(|| DEFAULT_MACHINE_TYPE.to_string()),
            image,
            network: self.network().to_string(),
            tags: fleet.tags.clone(),
            metadata,
            tile_servers: fleet.tile_servers.clone(),
            scopes: fleet.scopes.clone(),
            description: Some(format!("Member of fleet {}", fleet.name)),
        })
    }
}

fn first_up_zone(zones: &[Zone]) -> Option<&str> {
    zones
        .iter()
        .find(|zone| zone.status.as_deref() == Some(ZONE_UP))
        .map(|zone| zone.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ProbeMode;
    use serde_json::json;
    use std::path::PathBuf;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn profile() -> Profile {
        Profile {
            name: "DEFAULT".to_string(),
            project: Some("demo-project".to_string()),
            zone: Some("us-east1-a".to_string()),
            access_token: None,
            token_file: Some(PathBuf::from("/tmp/token")),
            metadata_token: false,
            api_base: None,
            defaults: ProfileDefaults {
                machine_type: Some("n1-highcpu-2".to_string()),
                image: None,
                image_project: None,
                network: None,
                probe_timeout_ms: Some(750),
            },
        }
    }

    fn fleet() -> FleetConfig {
        FleetConfig {
            name: "fractal".to_string(),
            prefix: "fractal".to_string(),
            tags: vec!["fractal".to_string()],
            image: Some("fractal-image".to_string()),
            machine_type: None,
            startup_script: None,
            metadata: vec![("seq".to_string(), "5 5 360".to_string())],
            scopes: Vec::new(),
            tile_servers: Vec::new(),
            load_balancers: Vec::new(),
            firewall: None,
            firewall_ports: vec!["80".to_string()],
            probe: ProbeMode::Vars,
            name_padding: 0,
        }
    }

    #[test]
    fn complete_profile_is_ready() {
        let context = gate(&profile(), Some(&fleet())).into_ready().expect("ready");
        assert_eq!(context.project, "demo-project");
        assert_eq!(context.probe_timeout, Duration::from_millis(750));
        assert!(matches!(context.tokens, TokenSource::File(_)));
        assert_eq!(context.image_project(), "demo-project");
        assert_eq!(context.fallback_image(), DEFAULT_IMAGE);
    }

    #[test]
    fn missing_settings_are_listed() {
        let mut incomplete = profile();
        incomplete.project = None;
        incomplete.zone = None;
        incomplete.token_file = None;
        match gate(&incomplete, None) {
            Gate::NeedsSettings(missing) => {
                assert_eq!(missing.len(), 2);
                assert_eq!(missing[0], "project");
                assert!(missing[1].contains("token_file"));
            }
            Gate::Ready(_) => panic!("profile should not be ready"),
        }
    }

    fn zone(name: &str, status: &str) -> Zone {
        Zone {
            name: name.to_string(),
            status: Some(status.to_string()),
        }
    }

    #[test]
    fn first_up_zone_skips_down_zones() {
        let zones = vec![
            zone("us-east1-a", "DOWN"),
            zone("us-east1-b", "UP"),
            zone("us-east1-c", "UP"),
        ];
        assert_eq!(first_up_zone(&zones), Some("us-east1-b"));
        assert_eq!(first_up_zone(&zones[..1]), None);
    }

    #[tokio::test]
    async fn missing_zone_falls_back_to_first_up_zone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/demo-project/zones"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"name": "europe-west1-a", "status": "DOWN"},
                    {"name": "europe-west1-c", "status": "UP"}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let mut without_zone = profile();
        without_zone.zone = None;
        without_zone.access_token = Some("tok".to_string());
        without_zone.api_base = Some(server.uri());

        let context = gate(&without_zone, None).into_ready().expect("ready");
        assert!(context.zone.is_none());
        let client = context.client().await.expect("client");
        assert_eq!(client.zone(), "europe-west1-c");
    }

    #[tokio::test]
    async fn configured_zone_skips_discovery() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;
        let mut with_base = profile();
        with_base.api_base = Some(server.uri());

        let context = gate(&with_base, None).into_ready().expect("ready");
        let client = context.client().await.expect("client");
        assert_eq!(client.zone(), "us-east1-a");
    }

    #[test]
    fn static_token_wins_over_file() {
        let mut with_token = profile();
        with_token.access_token = Some("abc".to_string());
        let context = gate(&with_token, None).into_ready().expect("ready");
        assert!(matches!(context.tokens, TokenSource::Static(ref t) if t == "abc"));
        assert!(context.fleet().is_err());
    }

    #[test]
    fn template_prepends_startup_script() {
        let script = std::env::temp_dir().join("fleet_manager_context_startup.sh");
        fs::write(&script, "#!/bin/sh\necho up\n").expect("write script");
        let mut fleet = fleet();
        fleet.startup_script = Some(script);

        let context = gate(&profile(), Some(&fleet)).into_ready().expect("ready");
        let template = context
            .template(
                "us-east1-a",
                "projects/demo-project/global/images/fractal-image".to_string(),
            )
            .expect("template");

        assert_eq!(template.machine_type, "n1-highcpu-2");
        assert_eq!(template.zone, "us-east1-a");
        assert_eq!(template.network, DEFAULT_NETWORK);
        assert_eq!(template.metadata[0].0, STARTUP_SCRIPT_KEY);
        assert_eq!(template.metadata[1], ("seq".to_string(), "5 5 360".to_string()));
    }

    #[test]
    fn unreadable_startup_script_fails() {
        let mut fleet = fleet();
        fleet.startup_script = Some(PathBuf::from("/nonexistent/startup.sh"));
        let context = gate(&profile(), Some(&fleet)).into_ready().expect("ready");
        assert!(context.template("us-east1-a", "img".to_string()).is_err());
    }
}
