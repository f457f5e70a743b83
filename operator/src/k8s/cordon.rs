// Modelled on the cordon flow of kubectl drain.

use k8s_openapi::api::core::v1::Node;
use kube::Client;
use owo_colors::OwoColorize;

use super::{patch_node, update_node};
use crate::util::Error;

/// Wraps the bookkeeping for toggling a node's `spec.unschedulable` flag.
pub struct CordonHelper {
    node: Node,
    desired: bool,
}

impl CordonHelper {
    pub fn new(node: Node) -> Self {
        CordonHelper {
            node,
            desired: false,
        }
    }

    /// Returns false when the node already carries the desired flag and no
    /// write is needed.
    pub fn update_required(&mut self, desired: bool) -> bool {
        self.desired = desired;
        let current = self
            .node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false);
        current != desired
    }

    /// Applies the flip as a diff-based patch against the node as read. If
    /// the patch cannot be built, the whole modified object is pushed with
    /// a full update instead. The first result is the apply outcome; the
    /// second carries the patch-build failure when the downgraded path was
    /// taken.
    pub async fn patch_or_replace(
        mut self,
        client: Client,
    ) -> (Result<(), Error>, Option<serde_json::Error>) {
        let name = match self.node.metadata.name.clone() {
            Some(name) => name,
            None => {
                return (
                    Err(Error::UserInput("Node is missing metadata.name".to_string())),
                    None,
                );
            }
        };
        let before = self.node.clone();
        self.node
            .spec
            .get_or_insert_with(Default::default)
            .unschedulable = Some(self.desired);
        match diff_nodes(&before, &self.node) {
            Ok(patch) => {
                let applied = patch_node(client, &name, patch).await.map(|_| ());
                (applied, None)
            }
            Err(e) => {
                let applied = update_node(client, &self.node).await.map(|_| ());
                (applied, Some(e))
            }
        }
    }
}

fn diff_nodes(before: &Node, after: &Node) -> Result<json_patch::Patch, serde_json::Error> {
    Ok(json_patch::diff(
        &serde_json::to_value(before)?,
        &serde_json::to_value(after)?,
    ))
}

/// Cordons or uncordons a node. A no-op when the flag already matches, so
/// repeated application converges. A patch-build failure downgrades to a
/// full update and is logged; the apply outcome is returned verbatim.
pub async fn set_unschedulable(client: Client, node: Node, desired: bool) -> Result<(), Error> {
    let mut helper = CordonHelper::new(node);
    if !helper.update_required(desired) {
        return Ok(());
    }
    let (applied, patch_err) = helper.patch_or_replace(client).await;
    if let Some(e) = patch_err {
        eprintln!(
            "{}",
            format!("cordon patch build failed, node was replaced instead: {e}").yellow()
        );
    }
    applied
}
