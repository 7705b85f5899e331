//! Reverse index from AllocationRequest to its AllocatedNodes
//!
//! Backed by a reflector cache of every AllocatedNode carrying this plugin's
//! identity label. The watcher is started once at process start; lookups
//! block on the first successful list and are served from memory afterwards.

use std::future::Future;

use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use hwplugin_common::crd::AllocatedNode;
use hwplugin_common::{Error, PLUGIN_LABEL};

/// Cached AllocatedNodes grouped by owning request on lookup
pub struct NodeIndex {
    store: Store<AllocatedNode>,
    ready: OnceCell<()>,
}

impl NodeIndex {
    /// Build the index and the watch future that keeps it current.
    ///
    /// The returned future must be spawned before the first lookup.
    pub fn start(
        client: Client,
        plugin_id: &str,
    ) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let api: Api<AllocatedNode> = Api::all(client);
        let config = watcher::Config::default().labels(&format!("{}={}", PLUGIN_LABEL, plugin_id));

        let (store, writer) = reflector::store();
        let driver = watcher(api, config)
            .default_backoff()
            .reflect(writer)
            .applied_objects()
            .for_each(|event| {
                if let Err(e) = event {
                    warn!(error = %e, "AllocatedNode index watch error");
                }
                std::future::ready(())
            });

        (
            Self {
                store,
                ready: OnceCell::new(),
            },
            driver,
        )
    }

    /// Wait for the initial list to land. Runs at most once per process.
    pub async fn ensure_ready(&self) -> Result<(), Error> {
        self.ready
            .get_or_try_init(|| async {
                self.store.wait_until_ready().await.map_err(|e| {
                    Error::internal_with_context("node_index", format!("index unavailable: {e}"))
                })?;
                info!(nodes = self.store.state().len(), "AllocatedNode index ready");
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// AllocatedNodes in `namespace` owned by `request`, sorted by name
    pub fn nodes_for(&self, namespace: &str, request: &str) -> Vec<AllocatedNode> {
        let mut nodes: Vec<AllocatedNode> = self
            .store
            .state()
            .iter()
            .filter(|n| n.namespace().as_deref() == Some(namespace) && n.request_name() == request)
            .map(|n| (**n).clone())
            .collect();
        nodes.sort_by_key(|n| n.name_any());
        nodes
    }
}
