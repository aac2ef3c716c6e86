//! Endpoint discovery: `(region, environment, service)` to base URL.
//!
//! Most services follow a host template. A few (UAA, console, cartel) live on
//! per-region hosts that are listed explicitly.

use std::fmt;
use std::str::FromStr;

use crate::error::ProviderError;

/// Regions with a discovery row.
pub const REGIONS: [&str; 3] = ["us-east", "eu-west", "ap-southeast"];

/// Environments with a discovery row.
pub const ENVIRONMENTS: [&str; 2] = ["client-test", "prod"];

const DOMAIN: &str = "philips-healthsuite.com";

/// Upstream services the provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Service {
    /// Identity: token issuance and SCIM organizations.
    Iam,
    /// Identity management: groups, roles, propositions, applications, services.
    Idm,
    /// Shared-key signed credentials service.
    S3Creds,
    /// Notification topics and subscriptions.
    Notification,
    /// Cloud Foundry UAA.
    Uaa,
    /// Console (metrics autoscalers).
    Console,
    /// Container host fleet.
    Cartel,
    /// PKI certificate issuance.
    Pki,
    /// Logging ingestion.
    Logging,
}

impl Service {
    /// Every service, in a stable order.
    pub const ALL: [Service; 9] = [
        Service::Iam,
        Service::Idm,
        Service::S3Creds,
        Service::Notification,
        Service::Uaa,
        Service::Console,
        Service::Cartel,
        Service::Pki,
        Service::Logging,
    ];

    /// Name used in configuration and in the `hsdp_config` data source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iam => "iam",
            Self::Idm => "idm",
            Self::S3Creds => "s3creds",
            Self::Notification => "notification",
            Self::Uaa => "uaa",
            Self::Console => "console",
            Self::Cartel => "cartel",
            Self::Pki => "pki",
            Self::Logging => "logging",
        }
    }

    fn host_label(&self) -> &'static str {
        match self {
            Self::Iam => "iam",
            Self::Idm => "idm",
            Self::S3Creds => "s3creds",
            Self::Notification => "notification",
            Self::Pki => "pki-proxy",
            Self::Logging => "logingestor2",
            Self::Uaa | Self::Console | Self::Cartel => "",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .iter()
            .find(|svc| svc.as_str() == s)
            .copied()
            .ok_or_else(|| ProviderError::Validation(format!("unknown service '{}'", s)))
    }
}

/// Whether `(region, environment)` has a discovery row.
pub fn is_known(region: &str, environment: &str) -> bool {
    REGIONS.contains(&region) && ENVIRONMENTS.contains(&environment)
}

fn region_code(region: &str) -> &'static str {
    match region {
        "eu-west" => "eu1",
        "ap-southeast" => "ap3",
        _ => "na1",
    }
}

/// Base URL of `service` in `(region, environment)`.
pub fn lookup(region: &str, environment: &str, service: Service) -> Result<String, ProviderError> {
    if !is_known(region, environment) {
        return Err(ProviderError::Configuration(format!(
            "no discovery entry for region '{}' environment '{}'",
            region, environment
        )));
    }
    let prod = environment == "prod";
    let code = region_code(region);

    let url = match service {
        Service::Uaa => {
            if prod {
                format!("https://uaa.{}.phsdp.com", if code == "na1" { "cloud" } else { code })
            } else {
                format!("https://uaa.{}.pcftest.com", if code == "na1" { "cloud" } else { code })
            }
        },
        Service::Console => format!("https://console.{}.hsdp.io", code),
        Service::Cartel => format!("https://cartel-{}.cloud.phsdp.com", code),
        _ => {
            let suffix = if prod { "service" } else { environment };
            format!(
                "https://{}-{}.{}.{}",
                service.host_label(),
                suffix,
                region,
                DOMAIN
            )
        },
    };
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_services() {
        assert_eq!(
            lookup("us-east", "client-test", Service::Iam).unwrap(),
            "https://iam-client-test.us-east.philips-healthsuite.com"
        );
        assert_eq!(
            lookup("eu-west", "prod", Service::Idm).unwrap(),
            "https://idm-service.eu-west.philips-healthsuite.com"
        );
        assert_eq!(
            lookup("us-east", "prod", Service::Pki).unwrap(),
            "https://pki-proxy-service.us-east.philips-healthsuite.com"
        );
    }

    #[test]
    fn test_regional_hosts() {
        assert_eq!(
            lookup("us-east", "prod", Service::Uaa).unwrap(),
            "https://uaa.cloud.phsdp.com"
        );
        assert_eq!(
            lookup("eu-west", "client-test", Service::Uaa).unwrap(),
            "https://uaa.eu1.pcftest.com"
        );
        assert_eq!(
            lookup("eu-west", "prod", Service::Console).unwrap(),
            "https://console.eu1.hsdp.io"
        );
        assert_eq!(
            lookup("us-east", "client-test", Service::Cartel).unwrap(),
            "https://cartel-na1.cloud.phsdp.com"
        );
    }

    #[test]
    fn test_unknown_row() {
        assert!(!is_known("mars-north", "prod"));
        assert!(matches!(
            lookup("mars-north", "prod", Service::Iam),
            Err(ProviderError::Configuration(_))
        ));
    }

    #[test]
    fn test_service_names_round_trip() {
        for svc in Service::ALL {
            assert_eq!(svc.as_str().parse::<Service>().unwrap(), svc);
        }
        assert!("nope".parse::<Service>().is_err());
    }
}
