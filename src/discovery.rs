use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::tunnel::is_reachable;

/// 外向きアドレスの判定に使う宛先（実際には送信しない）
const ROUTE_HINT_ADDR: &str = "1.1.1.1:80";

pub const DEFAULT_LABEL: &str = "Node";

/// 接続元の AS と国（speed.cloudflare.com/meta の一部）
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct EdgeMeta {
    as_organization: Option<String>,
    as_name: Option<String>,
    client_country: Option<String>,
}

fn http_client(limit: Duration) -> Option<Client> {
    match Client::builder().timeout(limit).build() {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("Failed to build HTTP client: {}", e);
            None
        }
    }
}

/// URI に載せる公開アドレスを決める
/// 問い合わせ先を順に試し、全滅なら外向きのローカルアドレス
pub async fn public_host(urls: &[String], limit: Duration) -> String {
    if let Some(client) = http_client(limit) {
        for url in urls {
            if let Some(ip) = fetch_ip(&client, url).await {
                info!("Public address {} (from {})", ip, url);
                return ip.to_string();
            }
        }
    }
    warn!("Public IP lookup failed, falling back to the local outbound address");
    local_outbound_host().await
}

async fn fetch_ip(client: &Client, url: &str) -> Option<IpAddr> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    let text = match response {
        Ok(response) => response.text().await.ok()?,
        Err(e) => {
            debug!("{} failed: {}", url, e);
            return None;
        }
    };
    match text.trim().parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            debug!("{} did not return an address: {:?}", url, text.trim());
            None
        }
    }
}

/// 外向きの経路で使われるローカルアドレス
async fn local_outbound_host() -> String {
    let detected = async {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.connect(ROUTE_HINT_ADDR).await?;
        socket.local_addr().map(|addr| addr.ip())
    };
    match detected.await {
        Ok(ip) if !ip.is_unspecified() => ip.to_string(),
        Ok(_) => loopback("no route"),
        Err(e) => loopback(&e.to_string()),
    }
}

fn loopback(reason: &str) -> String {
    warn!("Cannot detect public address ({}), using loopback; set public_host", reason);
    IpAddr::V4(Ipv4Addr::LOCALHOST).to_string()
}

/// ノード名 `<組織>-<国>` を問い合わせる。取れなければ `Node`
pub async fn node_label(url: &str, limit: Duration) -> String {
    let meta = match http_client(limit) {
        Some(client) => fetch_meta(&client, url).await,
        None => None,
    };
    let label = meta.as_ref().and_then(label_from_meta);
    match label {
        Some(label) => {
            info!("Node label: {}", label);
            label
        }
        None => {
            debug!("No node label from {}, using {}", url, DEFAULT_LABEL);
            DEFAULT_LABEL.to_string()
        }
    }
}

async fn fetch_meta(client: &Client, url: &str) -> Option<EdgeMeta> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    match response {
        Ok(response) => match response.json::<EdgeMeta>().await {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!("Unexpected response from {}: {}", url, e);
                None
            }
        },
        Err(e) => {
            debug!("{} failed: {}", url, e);
            None
        }
    }
}

fn label_from_meta(meta: &EdgeMeta) -> Option<String> {
    let org = [&meta.as_organization, &meta.as_name]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or("");
    let country = meta.client_country.as_deref().map(str::trim).unwrap_or("");
    let label = format!("{}-{}", org, country);
    let label = label.trim_matches('-');
    if label.is_empty() {
        None
    } else {
        Some(label.to_string())
    }
}

/// 到達可能な候補から1つ選ぶ。全滅なら先頭
pub async fn select_cf_domain(candidates: &[String], limit: Duration) -> String {
    let checks: Vec<_> = candidates
        .iter()
        .map(|domain| {
            let domain = domain.clone();
            tokio::spawn(async move {
                let ok = is_reachable(&format!("https://{}/", domain), limit).await;
                (domain, ok)
            })
        })
        .collect();

    let mut reachable = Vec::new();
    for check in checks {
        if let Ok((domain, true)) = check.await {
            reachable.push(domain);
        }
    }

    let chosen = reachable
        .choose(&mut rand::thread_rng())
        .cloned()
        .or_else(|| candidates.first().cloned())
        .unwrap_or_default();
    info!("CDN front domain: {} ({} reachable)", chosen, reachable.len());
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn meta(org: Option<&str>, name: Option<&str>, country: Option<&str>) -> EdgeMeta {
        EdgeMeta {
            as_organization: org.map(String::from),
            as_name: name.map(String::from),
            client_country: country.map(String::from),
        }
    }

    #[test]
    fn test_label_from_meta() {
        assert_eq!(
            label_from_meta(&meta(Some("Example Cloud"), None, Some("JP"))).as_deref(),
            Some("Example Cloud-JP")
        );
        assert_eq!(
            label_from_meta(&meta(None, Some("EXAMPLE-AS"), Some("DE"))).as_deref(),
            Some("EXAMPLE-AS-DE")
        );
        assert_eq!(label_from_meta(&meta(None, None, Some("US"))).as_deref(), Some("US"));
        assert_eq!(label_from_meta(&meta(Some("Org"), None, None)).as_deref(), Some("Org"));
        assert_eq!(label_from_meta(&meta(Some(" "), None, Some(""))), None);
    }

    #[tokio::test]
    async fn test_public_host_tries_sources_in_order() {
        let base = serve(
            Router::new()
                .route("/down", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "203.0.113.1") }))
                .route("/html", get(|| async { "<html>blocked</html>" }))
                .route("/ip", get(|| async { "198.51.100.7\n" })),
        )
        .await;

        let urls = vec![
            format!("{}/down", base),
            format!("{}/html", base),
            format!("{}/ip", base),
        ];
        assert_eq!(public_host(&urls, Duration::from_secs(2)).await, "198.51.100.7");
    }

    #[tokio::test]
    async fn test_public_host_falls_back_to_local_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);

        let host = public_host(&[closed], Duration::from_millis(500)).await;
        assert!(host.parse::<IpAddr>().is_ok(), "{}", host);
    }

    #[tokio::test]
    async fn test_node_label_lookup() {
        let base = serve(
            Router::new()
                .route(
                    "/meta",
                    get(|| async {
                        r#"{"asOrganization":"Example Cloud","clientCountry":"SG","colo":"SIN"}"#
                    }),
                )
                .route("/broken", get(|| async { "not json" })),
        )
        .await;

        let limit = Duration::from_secs(2);
        assert_eq!(node_label(&format!("{}/meta", base), limit).await, "Example Cloud-SG");
        assert_eq!(node_label(&format!("{}/broken", base), limit).await, DEFAULT_LABEL);
        assert_eq!(node_label(&format!("{}/missing", base), limit).await, DEFAULT_LABEL);
    }

    #[tokio::test]
    async fn test_cf_domain_falls_back_to_first() {
        let candidates = vec!["127.0.0.1:1".to_string(), "127.0.0.1:2".to_string()];
        assert_eq!(
            select_cf_domain(&candidates, Duration::from_millis(300)).await,
            "127.0.0.1:1"
        );
        assert_eq!(select_cf_domain(&[], Duration::from_millis(300)).await, "");
    }
}
