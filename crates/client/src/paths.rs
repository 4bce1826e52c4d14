//! URL construction for the remote API surface.
//!
//! Path shapes: `{prefix}/{collection}`, `{prefix}/namespaces/{ns}/{collection}`,
//! `{prefix}/watch/...` for streams, and the pod log subresource.

use url::Url;

use crate::ClientError;

fn join(base: &Url, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = base.clone();
    {
        let mut parts = url
            .path_segments_mut()
            .map_err(|_| ClientError::Config(format!("server URL '{base}' cannot be a base")))?;
        parts.pop_if_empty();
        for seg in segments {
            // API prefixes like "apis/apps/v1" carry their own slashes.
            for piece in seg.split('/').filter(|p| !p.is_empty()) {
                parts.push(piece);
            }
        }
    }
    Ok(url)
}

/// List endpoint for a collection, optionally namespace-scoped.
pub fn list(base: &Url, prefix: &str, collection: &str, ns: Option<&str>) -> Result<Url, ClientError> {
    match ns {
        Some(ns) => join(base, &[prefix, "namespaces", ns, collection]),
        None => join(base, &[prefix, collection]),
    }
}

/// Detail endpoint for one object; also the DELETE and PATCH target.
pub fn detail(
    base: &Url,
    prefix: &str,
    collection: &str,
    ns: Option<&str>,
    name: &str,
) -> Result<Url, ClientError> {
    match ns {
        Some(ns) => join(base, &[prefix, "namespaces", ns, collection, name]),
        None => join(base, &[prefix, collection, name]),
    }
}

/// Streaming watch endpoint for a collection.
pub fn watch(base: &Url, prefix: &str, collection: &str, ns: Option<&str>) -> Result<Url, ClientError> {
    match ns {
        Some(ns) => join(base, &[prefix, "watch", "namespaces", ns, collection]),
        None => join(base, &[prefix, "watch", collection]),
    }
}

/// Pod log subresource, optionally following.
pub fn pod_logs(
    base: &Url,
    ns: &str,
    pod: &str,
    container: &str,
    tail_lines: u32,
    follow: bool,
) -> Result<Url, ClientError> {
    let mut url = join(base, &["api/v1", "namespaces", ns, "pods", pod, "log"])?;
    {
        let mut q = url.query_pairs_mut();
        q.append_pair("container", container);
        q.append_pair("tailLines", &tail_lines.to_string());
        if follow {
            q.append_pair("follow", "true");
        }
    }
    Ok(url)
}
