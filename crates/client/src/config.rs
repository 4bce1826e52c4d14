//! Cluster context loading from a kubeconfig-style YAML file.
//!
//! Only the parts this tool needs are read: named clusters (server URL),
//! users (bearer token), and the contexts joining them. Contexts without a
//! token are skipped with a warning rather than failing the whole load.

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::ClientError;

/// Display colors cycled over loaded contexts.
const CONTEXT_COLORS: [&str; 4] = ["Magenta", "White", "Cyan", "Blue"];

/// Immutable per-connection authentication context. Replaced wholesale on
/// context switch.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub name: String,
    pub server: Url,
    pub token: String,
    pub color: String,
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Deserialize)]
struct NamedContext {
    name: String,
    context: ContextRef,
}

#[derive(Deserialize)]
struct ContextRef {
    cluster: String,
    user: String,
}

#[derive(Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterDetail,
}

#[derive(Deserialize)]
struct ClusterDetail {
    server: String,
}

#[derive(Deserialize)]
struct NamedUser {
    name: String,
    user: UserDetail,
}

#[derive(Deserialize, Default)]
struct UserDetail {
    #[serde(default)]
    token: Option<String>,
}

/// Parse contexts from YAML text. Fails only when no usable context
/// remains.
pub fn parse_contexts(yaml: &str) -> Result<Vec<ClusterContext>, ClientError> {
    let raw: RawConfig =
        serde_yaml::from_str(yaml).map_err(|e| ClientError::Config(format!("bad config: {e}")))?;
    let mut out = Vec::new();
    for nc in &raw.contexts {
        match resolve(&raw, nc) {
            Ok((server, token)) => {
                let color = CONTEXT_COLORS[out.len() % CONTEXT_COLORS.len()].to_string();
                debug!(context = %nc.name, server = %server, "context loaded");
                out.push(ClusterContext { name: nc.name.clone(), server, token, color });
            }
            Err(e) => warn!(context = %nc.name, error = %e, "skipping context"),
        }
    }
    if out.is_empty() {
        return Err(ClientError::Config("no usable contexts in config".into()));
    }
    Ok(out)
}

/// Load contexts from a file path.
pub fn load_contexts(path: &std::path::Path) -> Result<Vec<ClusterContext>, ClientError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ClientError::Config(format!("can't read {}: {e}", path.display())))?;
    parse_contexts(&text)
}

fn resolve(raw: &RawConfig, nc: &NamedContext) -> Result<(Url, String), ClientError> {
    let cluster = raw
        .clusters
        .iter()
        .find(|c| c.name == nc.context.cluster)
        .ok_or_else(|| ClientError::Config(format!("no cluster named '{}'", nc.context.cluster)))?;
    let server = Url::parse(&cluster.cluster.server)
        .map_err(|e| ClientError::Config(format!("bad server URL '{}': {e}", cluster.cluster.server)))?;
    let user = raw
        .users
        .iter()
        .find(|u| u.name == nc.context.user)
        .ok_or_else(|| ClientError::Config(format!("no user named '{}'", nc.context.user)))?;
    let token = user
        .user
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ClientError::Config(format!("no token for user '{}'", nc.context.user)))?;
    Ok((server, token))
}
