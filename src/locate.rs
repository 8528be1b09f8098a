//! mlab-ns server discovery.
//!
//! mlab-ns answers with the FQDN of one nearby NDT server, or with a list
//! of them under the `geo_options` policy. Only the `fqdn` field of each
//! entry is consumed.

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::settings::{ProtocolFlags, Settings};

/// One server entry in an mlab-ns reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Target {
    /// FQDN of the NDT server.
    pub fqdn: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum Reply {
    One(Target),
    Many(Vec<Target>),
}

fn hostnames(reply: Reply) -> Vec<String> {
    match reply {
        Reply::One(target) => vec![target.fqdn],
        Reply::Many(targets) => targets.into_iter().map(|target| target.fqdn).collect(),
    }
}

/// Query mlab-ns for candidate NDT servers, best candidates first.
pub async fn query(settings: &Settings) -> Result<Vec<String>> {
    let tool = if settings.protocol_flags.contains(ProtocolFlags::TLS) {
        "ndt_ssl"
    } else {
        "ndt"
    };
    let mut url = url::Url::parse(&settings.mlabns_base_url).map_err(|_| Error::InvalidArgument)?;
    url.path_segments_mut()
        .map_err(|_| Error::InvalidArgument)?
        .pop_if_empty()
        .push(tool);
    url.query_pairs_mut()
        .append_pair("policy", settings.mlabns_policy.as_query());

    let client = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(settings.timeout)
        .build()
        .map_err(|_| Error::IoError)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|_| Error::IoError)?
        .error_for_status()
        .map_err(|_| Error::IoError)?;
    let reply: Reply = response.json().await.map_err(|_| Error::IoError)?;

    let hosts = hostnames(reply);
    if hosts.is_empty() {
        return Err(Error::IoError);
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_singleton_reply() {
        let json = r#"{
            "city": "Turin",
            "fqdn": "ndt.iupui.mlab1.trn01.measurement-lab.org",
            "ip": ["194.116.85.211"]
        }"#;
        let reply: Reply = serde_json::from_str(json).unwrap();
        assert_eq!(
            hostnames(reply),
            vec!["ndt.iupui.mlab1.trn01.measurement-lab.org"]
        );
    }

    #[test]
    fn deserialize_geo_options_reply() {
        let json = r#"[
            {"fqdn": "ndt.iupui.mlab1.mil02.measurement-lab.org"},
            {"fqdn": "ndt.iupui.mlab2.mil02.measurement-lab.org"},
            {"fqdn": "ndt.iupui.mlab3.mil02.measurement-lab.org"}
        ]"#;
        let reply: Reply = serde_json::from_str(json).unwrap();
        assert_eq!(hostnames(reply).len(), 3);
    }

    #[test]
    fn replies_without_fqdn_are_rejected() {
        let json = r#"{"city": "Turin"}"#;
        assert!(serde_json::from_str::<Reply>(json).is_err());
    }
}
