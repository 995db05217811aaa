//! Worker pool probing images with HEAD requests
//!
//! The dispatcher feeds a bounded channel until the dispatch token fires;
//! workers keep draining what was already queued and race each probe
//! against the probe token.

use super::params::{RegistryParams, Scheme};
use super::queue::Item;
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use rigger_core::error::{RiggerError, RiggerResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.oci.image.index.v1+json";

/// Checks that a single image exists in a registry
#[async_trait]
pub trait ImageProber: Send + Sync {
    async fn probe(&self, image: &str) -> RiggerResult<()>;
}

/// Builds a prober for one registry
pub trait ProberFactory: Send + Sync {
    fn prober(&self, params: &RegistryParams) -> RiggerResult<Arc<dyn ImageProber>>;
}

/// Split `host/path@digest` or `host/path:tag` into host, repository path
/// and reference.
pub fn parse_reference(image: &str) -> RiggerResult<(&str, &str, &str)> {
    let (repo, reference) = match image.split_once('@') {
        Some(split) => split,
        None => {
            let slash = image.rfind('/').unwrap_or(0);
            match image[slash..].rfind(':') {
                Some(colon) => (&image[..slash + colon], &image[slash + colon + 1..]),
                None => (image, "latest"),
            }
        }
    };

    let Some((host, path)) = repo.split_once('/') else {
        return Err(RiggerError::parse(
            "image reference",
            format!("{:?} has no repository path", image),
        ));
    };
    if host.is_empty() || path.is_empty() || reference.is_empty() {
        return Err(RiggerError::parse(
            "image reference",
            format!("{:?} is incomplete", image),
        ));
    }
    Ok((host, path, reference))
}

/// HEADs `/v2/<path>/manifests/<reference>` with optional basic auth and a
/// custom root CA on top of the built-in roots.
pub struct HttpProber {
    client: reqwest::Client,
    scheme: Scheme,
    username: String,
    password: String,
}

impl HttpProber {
    pub fn new(params: &RegistryParams, request_timeout: Duration) -> RiggerResult<Self> {
        let mut builder = reqwest::Client::builder().timeout(request_timeout);
        if !params.ca.is_empty() {
            let cert = reqwest::Certificate::from_pem(params.ca.as_bytes())
                .map_err(|e| RiggerError::security(format!("cannot load registry CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| RiggerError::internal(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            scheme: params.scheme,
            username: params.username.clone(),
            password: params.password.clone(),
        })
    }

    fn url(&self, image: &str) -> RiggerResult<String> {
        let (host, path, reference) = parse_reference(image)?;
        Ok(format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme.as_url_scheme(),
            host,
            path,
            reference
        ))
    }
}

#[async_trait]
impl ImageProber for HttpProber {
    async fn probe(&self, image: &str) -> RiggerResult<()> {
        let url = self.url(image)?;
        let mut request = self.client.head(&url).header(ACCEPT, MANIFEST_ACCEPT);
        if !self.username.is_empty() || !self.password.is_empty() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }

        let response = request.send().await?;
        let status = response.status();
        trace!(%url, %status, "Probed image");
        if status.is_success() {
            Ok(())
        } else {
            Err(RiggerError::Http {
                url,
                message: format!("unexpected status {}", status),
            })
        }
    }
}

/// Production factory
pub struct HttpProberFactory {
    pub request_timeout: Duration,
}

impl ProberFactory for HttpProberFactory {
    fn prober(&self, params: &RegistryParams) -> RiggerResult<Arc<dyn ImageProber>> {
        Ok(Arc::new(HttpProber::new(params, self.request_timeout)?))
    }
}

/// Outcome of one worker round
#[derive(Debug, Default)]
pub struct RoundResult {
    pub results: Vec<(Item, Result<(), String>)>,
    /// Items the dispatcher never handed out
    pub undispatched: Vec<Item>,
}

/// Probe `items` with `parallelism` workers.
///
/// `dispatch` stops handing out new items. Once it has fired, remaining
/// probes get `probe_timeout` before they are cancelled and reported as
/// failures.
pub async fn run_round(
    prober: Arc<dyn ImageProber>,
    items: Vec<Item>,
    parallelism: usize,
    dispatch: CancellationToken,
    probe_timeout: Duration,
) -> RoundResult {
    let probes = CancellationToken::new();
    let (item_tx, item_rx) = mpsc::channel::<Item>(parallelism.max(1));
    let item_rx = Arc::new(Mutex::new(item_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();

    let mut workers = JoinSet::new();
    for _ in 0..parallelism.max(1) {
        let item_rx = item_rx.clone();
        let result_tx = result_tx.clone();
        let prober = prober.clone();
        let probes = probes.clone();
        workers.spawn(async move {
            loop {
                let next = item_rx.lock().await.recv().await;
                let Some(item) = next else { break };

                let result = tokio::select! {
                    r = prober.probe(&item.image) => r.map_err(|e| e.to_string()),
                    _ = probes.cancelled() => Err("probe cancelled".to_string()),
                };
                if result_tx.send((item, result)).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut pending = items.into_iter();
    let mut undispatched = Vec::new();
    for item in pending.by_ref() {
        tokio::select! {
            biased;
            _ = dispatch.cancelled() => {
                undispatched.push(item);
                break;
            }
            permit = item_tx.reserve() => match permit {
                Ok(permit) => permit.send(item),
                Err(_) => {
                    undispatched.push(item);
                    break;
                }
            },
        }
    }
    undispatched.extend(pending);
    drop(item_tx);

    if dispatch.is_cancelled() {
        debug!(undispatched = undispatched.len(), "Dispatch cancelled, bounding in-flight probes");
        let probes = probes.clone();
        tokio::spawn(async move {
            tokio::time::sleep(probe_timeout).await;
            probes.cancel();
        });
    }

    while workers.join_next().await.is_some() {}
    probes.cancel();

    let mut results = Vec::new();
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }

    RoundResult {
        results,
        undispatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyProber {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageProber for FlakyProber {
        async fn probe(&self, image: &str) -> RiggerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if image.ends_with("bad") {
                Err(RiggerError::Http {
                    url: image.to_string(),
                    message: "unexpected status 404 Not Found".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct HangingProber;

    #[async_trait]
    impl ImageProber for HangingProber {
        async fn probe(&self, _image: &str) -> RiggerResult<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn items(names: &[&str]) -> Vec<Item> {
        names
            .iter()
            .map(|n| Item {
                image: format!("r.example.com/d8:{}", n),
                source: n.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            parse_reference("r.example.com:5000/deckhouse/ee@sha256:abc").unwrap(),
            ("r.example.com:5000", "deckhouse/ee", "sha256:abc")
        );
        assert_eq!(
            parse_reference("r.example.com:5000/deckhouse/ee:v1.2").unwrap(),
            ("r.example.com:5000", "deckhouse/ee", "v1.2")
        );
        assert!(parse_reference("localhost").is_err());
    }

    #[tokio::test]
    async fn test_round_accounts_every_item() {
        let prober = Arc::new(FlakyProber {
            calls: AtomicUsize::new(0),
        });
        let round = run_round(
            prober.clone(),
            items(&["a", "b", "bad", "c"]),
            2,
            CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await;

        assert!(round.undispatched.is_empty());
        assert_eq!(round.results.len(), 4);
        assert_eq!(round.results.iter().filter(|(_, r)| r.is_err()).count(), 1);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_bounds_probes() {
        let dispatch = CancellationToken::new();
        dispatch.cancel();

        let round = run_round(
            Arc::new(HangingProber),
            items(&["a", "b", "c"]),
            2,
            dispatch,
            Duration::from_millis(20),
        )
        .await;

        let accounted = round.results.len() + round.undispatched.len();
        assert_eq!(accounted, 3);
        assert!(round.results.iter().all(|(_, r)| r.is_err()));
    }

    #[tokio::test]
    async fn test_dispatch_cancelled_while_queue_is_full() {
        let dispatch = CancellationToken::new();
        let cancel = dispatch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let round = run_round(
            Arc::new(HangingProber),
            items(&["a", "b", "c", "d", "e"]),
            1,
            dispatch,
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(round.results.len() + round.undispatched.len(), 5);
        assert!(!round.undispatched.is_empty());
        assert_eq!(round.undispatched.last().map(|i| i.source.as_str()), Some("e"));
        assert!(round
            .results
            .iter()
            .all(|(_, r)| r.as_ref().err().map(String::as_str) == Some("probe cancelled")));
    }
}
